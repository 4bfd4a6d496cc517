use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use mailpress_mail::MailboxConfig;
use mailpress_render::{RenderConfig, ThemeConfig, ToolsConfig};

#[derive(Debug, Clone)]
pub(crate) struct Config {
    pub(crate) mailbox: Option<MailboxConfig>,
    pub(crate) database: String,
    pub(crate) raw_store: PathBuf,
    pub(crate) render: RenderConfig,
}

fn xdg_config_dir() -> PathBuf {
    std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn xdg_state_dir() -> PathBuf {
    std::env::var_os("XDG_STATE_HOME")
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local").join("state"))
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
}

fn config_path_candidates() -> Vec<PathBuf> {
    vec![
        PathBuf::from("mailpress.toml"),
        xdg_config_dir().join("mailpress").join("mailpress.toml"),
    ]
}

fn load_config_text() -> Option<String> {
    for path in config_path_candidates() {
        if let Ok(content) = std::fs::read_to_string(&path) {
            tracing::debug!(path = %path.display(), "using config file");
            return Some(content);
        }
    }
    None
}

/// Load and parse the configuration. An explicitly given path must exist;
/// otherwise the candidate paths are tried and missing config falls back to
/// defaults with a warning.
pub(crate) fn load_config(explicit: Option<&Path>) -> Result<Config> {
    let text = match explicit {
        Some(path) => Some(
            std::fs::read_to_string(path)
                .with_context(|| format!("cannot read config file {}", path.display()))?,
        ),
        None => load_config_text(),
    };
    let value = match text {
        Some(text) => toml::from_str(&text).context("invalid configuration file")?,
        None => {
            tracing::warn!("no configuration file found, using defaults");
            toml::Value::Table(Default::default())
        }
    };
    Ok(parse_config(&value))
}

pub(crate) fn parse_config(value: &toml::Value) -> Config {
    let state_dir = xdg_state_dir().join("mailpress");
    let locations = value.get("locations");

    let database = location(locations, "database")
        .unwrap_or_else(|| state_dir.join("mailpress.db").to_string_lossy().to_string());
    let raw_store = location(locations, "raw_store")
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("raw"));
    let blog_output = location(locations, "blog_output")
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("blog"));
    let media_temp = location(locations, "media_temp")
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("media"));
    let gallery_output = location(locations, "gallery_output")
        .map(PathBuf::from)
        .unwrap_or_else(|| state_dir.join("galleries"));
    let gallery_link_base =
        location(locations, "gallery_link_base").unwrap_or_else(|| "/galleries".to_string());

    let templates = value.get("templates");
    let article_template = table_path(templates, "article");
    let index_template = table_path(templates, "index");

    let themes = value.get("themes");
    let themes = ThemeConfig {
        header: table_path(themes, "header"),
        before_body: table_path(themes, "before_body"),
        after_body: table_path(themes, "after_body"),
        geo_header: table_path(themes, "geo_header"),
        geo_before_body: table_path(themes, "geo_before_body"),
        geo_after_body: table_path(themes, "geo_after_body"),
    };

    let tools = value.get("tools");
    let tools = ToolsConfig {
        markdown: table_str(tools, "markdown").unwrap_or_else(|| "pandoc".to_string()),
        gallery: table_str(tools, "gallery").unwrap_or_else(|| "fgallery".to_string()),
        timeout_secs: tools
            .and_then(|t| t.get("timeout_secs"))
            .and_then(|v| v.as_integer())
            .map(|v| v.max(1) as u64)
            .unwrap_or(120),
    };

    let index_title = value
        .get("blog")
        .and_then(|b| b.get("title"))
        .and_then(|v| v.as_str())
        .unwrap_or("Blog")
        .to_string();

    Config {
        mailbox: parse_mailbox_table(value),
        database,
        raw_store,
        render: RenderConfig {
            blog_output,
            media_temp,
            gallery_output,
            gallery_link_base,
            article_template,
            index_template,
            themes,
            tools,
            index_title,
        },
    }
}

fn parse_mailbox_table(value: &toml::Value) -> Option<MailboxConfig> {
    let imap = value.get("imap")?;
    Some(MailboxConfig {
        host: imap.get("host")?.as_str()?.to_string(),
        port: imap.get("port").and_then(|v| v.as_integer()).unwrap_or(993) as u16,
        username: imap.get("username")?.as_str()?.to_string(),
        password: imap.get("password")?.as_str()?.to_string(),
        skip_tls_verify: imap
            .get("skip_tls_verify")
            .and_then(|v| v.as_bool())
            .unwrap_or(false),
        mailbox: imap
            .get("mailbox")
            .and_then(|v| v.as_str())
            .unwrap_or("INBOX")
            .to_string(),
    })
}

fn location(table: Option<&toml::Value>, key: &str) -> Option<String> {
    table_str(table, key)
}

fn table_str(table: Option<&toml::Value>, key: &str) -> Option<String> {
    table?
        .get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn table_path(table: Option<&toml::Value>, key: &str) -> Option<PathBuf> {
    table_str(table, key).map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::parse_config;

    #[test]
    fn full_config_is_parsed() {
        let value: toml::Value = toml::from_str(
            r#"
[imap]
host = "mail.example.org"
username = "blog"
password = "secret"
mailbox = "Blog"

[locations]
database = "/var/lib/mailpress/catalog.db"
raw_store = "/var/lib/mailpress/raw"
blog_output = "/srv/www/blog"
media_temp = "/tmp/mailpress-media"
gallery_output = "/srv/www/blog/galleries"
gallery_link_base = "/blog/galleries"

[templates]
article = "/etc/mailpress/article.md"

[themes]
header = "/etc/mailpress/header.html"
geo_header = "/etc/mailpress/geo-header.html"

[tools]
markdown = "/usr/bin/pandoc"
gallery = "/usr/local/bin/gallery-gen"
timeout_secs = 30

[blog]
title = "Travel log"
"#,
        )
        .unwrap();
        let config = parse_config(&value);

        let mailbox = config.mailbox.expect("imap section parsed");
        assert_eq!(mailbox.host, "mail.example.org");
        assert_eq!(mailbox.port, 993);
        assert_eq!(mailbox.mailbox, "Blog");

        assert_eq!(config.database, "/var/lib/mailpress/catalog.db");
        assert_eq!(
            config.render.blog_output.to_string_lossy(),
            "/srv/www/blog"
        );
        assert_eq!(config.render.gallery_link_base, "/blog/galleries");
        assert_eq!(
            config.render.article_template.as_ref().unwrap().to_string_lossy(),
            "/etc/mailpress/article.md"
        );
        assert_eq!(config.render.tools.timeout_secs, 30);
        assert_eq!(config.render.index_title, "Travel log");
    }

    #[test]
    fn missing_sections_fall_back_to_defaults() {
        let value: toml::Value = toml::from_str("").unwrap();
        let config = parse_config(&value);

        assert!(config.mailbox.is_none());
        assert_eq!(config.render.tools.markdown, "pandoc");
        assert_eq!(config.render.tools.timeout_secs, 120);
        assert_eq!(config.render.gallery_link_base, "/galleries");
        assert_eq!(config.render.index_title, "Blog");
        assert!(config.render.article_template.is_none());
    }

    #[test]
    fn incomplete_imap_section_is_rejected() {
        let value: toml::Value = toml::from_str("[imap]\nhost = \"mail.example.org\"\n").unwrap();
        let config = parse_config(&value);
        assert!(config.mailbox.is_none());
    }
}
