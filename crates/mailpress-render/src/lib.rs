//! Article rendering and index assembly.
//!
//! The external markdown renderer and the gallery tool are black boxes
//! driven through a file-based contract: markdown goes in on stdin, HTML
//! comes back on stdout, media directories go in by path.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use mailpress_core::Entry;
use mailpress_content::{Decomposition, decompose};

const DEFAULT_ARTICLE_TEMPLATE: &str = "# {subject}\n\n{content}\n\n*Posted by {author} on {date}*\n";
const DEFAULT_INDEX_TEMPLATE: &str = "- {date} [{subject}]({link}) ({author})";

#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("could not fetch message body: {0}")]
    Fetch(String),
    #[error("could not decompose message: {0}")]
    Decompose(String),
    #[error("{name} failed with status {status}: {stderr}")]
    Tool {
        name: String,
        status: i32,
        stderr: String,
    },
    #[error("{name} did not finish within the configured timeout")]
    ToolTimeout { name: String },
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("could not serialize track data: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Terminal outcome of rendering one entry. Failures surface as `Err`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderOutcome {
    Rendered,
    Skipped,
}

/// Where a full message body comes from (raw store or mailbox), decided by
/// the caller per entry.
pub trait MessageSource {
    fn fetch(&mut self, entry: &Entry) -> anyhow::Result<Vec<u8>>;
}

#[derive(Debug, Clone, Default)]
pub struct ThemeConfig {
    pub header: Option<PathBuf>,
    pub before_body: Option<PathBuf>,
    pub after_body: Option<PathBuf>,
    pub geo_header: Option<PathBuf>,
    pub geo_before_body: Option<PathBuf>,
    pub geo_after_body: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct ToolsConfig {
    pub markdown: String,
    pub gallery: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct RenderConfig {
    pub blog_output: PathBuf,
    pub media_temp: PathBuf,
    pub gallery_output: PathBuf,
    pub gallery_link_base: String,
    pub article_template: Option<PathBuf>,
    pub index_template: Option<PathBuf>,
    pub themes: ThemeConfig,
    pub tools: ToolsConfig,
    pub index_title: String,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RenderOptions {
    /// Delete and regenerate an existing article.
    pub force: bool,
    /// Skip gallery generation even when media is present.
    pub skip_gallery: bool,
}

pub struct ArticleRenderer {
    cfg: RenderConfig,
}

impl ArticleRenderer {
    pub fn new(cfg: RenderConfig) -> Self {
        Self { cfg }
    }

    pub fn article_path(&self, entry: &Entry) -> PathBuf {
        self.cfg.blog_output.join(entry.article_filename())
    }

    /// The article file's existence is the sole "already processed" marker.
    pub fn is_already_rendered(&self, entry: &Entry) -> bool {
        self.article_path(entry).exists()
    }

    /// Render one entry. Terminal states: `Skipped` (already on disk),
    /// `Rendered`, or `Err` (the caller records a failure and moves on).
    pub async fn render_article(
        &self,
        entry: &Entry,
        source: &mut dyn MessageSource,
        opts: RenderOptions,
    ) -> Result<RenderOutcome> {
        let target = self.article_path(entry);
        if target.exists() {
            if !opts.force {
                tracing::info!(path = %target.display(), "article already rendered, skipping");
                return Ok(RenderOutcome::Skipped);
            }
            fs::remove_file(&target)?;
        }

        let raw = source
            .fetch(entry)
            .map_err(|err| RenderError::Fetch(err.to_string()))?;
        let decomp = decompose(&raw).map_err(|err| RenderError::Decompose(err.to_string()))?;

        fs::create_dir_all(&self.cfg.blog_output)?;
        let media_dir = self.write_media(entry, &decomp)?;

        let gallery = match media_dir.as_deref() {
            Some(media_dir) if !opts.skip_gallery => {
                match self.run_gallery_tool(media_dir, &entry.slug()).await {
                    Ok(()) => Some(self.gallery_markdown(&entry.slug(), decomp.icon.as_deref())),
                    Err(err) => {
                        tracing::error!(
                            message_id = %entry.message_id,
                            %err,
                            "gallery generation failed, article degrades to no gallery"
                        );
                        None
                    }
                }
            }
            _ => None,
        };

        let markdown = self.compose(entry, &decomp, gallery.as_deref())?;
        let title = decomp
            .front_matter
            .title
            .clone()
            .unwrap_or_else(|| entry.subject.clone());
        let html = self.run_markdown_tool(&markdown, &title, decomp.has_geodata()).await?;

        write_world_readable(&target, html.as_bytes())?;
        tracing::info!(path = %target.display(), "article rendered");
        Ok(RenderOutcome::Rendered)
    }

    /// Persist surviving media parts; returns the media directory when any
    /// part was written.
    fn write_media(&self, entry: &Entry, decomp: &Decomposition) -> Result<Option<PathBuf>> {
        if !decomp.has_media() {
            return Ok(None);
        }
        let dir = self
            .cfg
            .media_temp
            .join(format!("{}-{}", entry.slug(), entry.message_id));
        fs::create_dir_all(&dir)?;
        for part in &decomp.media {
            let path = dir.join(&part.filename);
            fs::write(&path, &part.bytes)?;
            tracing::debug!(path = %path.display(), "media part written");
        }
        Ok(Some(dir))
    }

    fn compose(
        &self,
        entry: &Entry,
        decomp: &Decomposition,
        gallery: Option<&str>,
    ) -> Result<String> {
        let mut content = decomp.text_markdown.clone().unwrap_or_default();
        if let Some(gallery) = gallery {
            content.push_str(gallery);
        }
        if decomp.has_geodata() {
            let track_file = self.write_track_sidecar(entry, decomp)?;
            content.push_str(&geo_markdown(
                decomp.front_matter.lat_lon(),
                track_file.as_deref(),
            ));
        }

        let subject = decomp
            .front_matter
            .title
            .as_deref()
            .unwrap_or(&entry.subject);
        let author = decomp
            .front_matter
            .author
            .clone()
            .unwrap_or_else(|| entry.author_name());
        let template = load_template(self.cfg.article_template.as_deref(), DEFAULT_ARTICLE_TEMPLATE);
        Ok(render_template(
            &template,
            entry,
            subject,
            &author,
            &content,
            &entry.article_filename(),
        ))
    }

    /// GeoJSON sidecar next to the article, referenced by the map overlay.
    fn write_track_sidecar(&self, entry: &Entry, decomp: &Decomposition) -> Result<Option<String>> {
        let Some(track) = &decomp.track else {
            return Ok(None);
        };
        let coordinates: Vec<[f64; 2]> = track.points.iter().map(|p| [p.lon, p.lat]).collect();
        let geojson = serde_json::json!({
            "type": "Feature",
            "geometry": { "type": "LineString", "coordinates": coordinates },
            "properties": { "name": entry.subject },
        });
        let filename = format!("{}-{}.geojson", entry.slug(), entry.message_id);
        let path = self.cfg.blog_output.join(&filename);
        fs::write(&path, serde_json::to_vec_pretty(&geojson)?)?;
        Ok(Some(filename))
    }

    fn gallery_markdown(&self, slug: &str, icon: Option<&str>) -> String {
        let base = self.cfg.gallery_link_base.trim_end_matches('/');
        let link = format!("{}/{}/index.html", base, slug);
        match icon {
            Some(icon) => format!(
                "\n\n[![gallery]({}/{}/thumbs/{})]({})\n",
                base, slug, icon, link
            ),
            None => format!("\n\n[Photo gallery]({})\n", link),
        }
    }

    async fn run_gallery_tool(&self, media_dir: &Path, slug: &str) -> Result<()> {
        fs::create_dir_all(&self.cfg.gallery_output)?;
        let args = vec![
            "-i".to_string(),
            media_dir.to_string_lossy().to_string(),
            "-n".to_string(),
            slug.to_string(),
            "-f".to_string(),
            "-o".to_string(),
            self.cfg.gallery_output.to_string_lossy().to_string(),
            "-d".to_string(),
            self.cfg.gallery_link_base.clone(),
        ];
        let output = self.run_tool(&self.cfg.tools.gallery, &args, None).await?;
        if !output.status.success() {
            return Err(tool_error(&self.cfg.tools.gallery, &output));
        }
        Ok(())
    }

    async fn run_markdown_tool(&self, markdown: &str, title: &str, geo: bool) -> Result<String> {
        let args = self.markdown_args(title, geo);
        let output = self
            .run_tool(&self.cfg.tools.markdown, &args, Some(markdown.as_bytes()))
            .await?;
        if !output.status.success() {
            return Err(tool_error(&self.cfg.tools.markdown, &output));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Standalone HTML with a title, plus the theme include files matching
    /// whether geodata is present.
    fn markdown_args(&self, title: &str, geo: bool) -> Vec<String> {
        let mut args = vec![
            "-f".to_string(),
            "markdown".to_string(),
            "-t".to_string(),
            "html".to_string(),
            "-s".to_string(),
            "--metadata".to_string(),
            format!("title={}", title),
        ];
        let themes = &self.cfg.themes;
        let (header, before, after) = if geo {
            (
                themes.geo_header.as_ref().or(themes.header.as_ref()),
                themes.geo_before_body.as_ref().or(themes.before_body.as_ref()),
                themes.geo_after_body.as_ref().or(themes.after_body.as_ref()),
            )
        } else {
            (
                themes.header.as_ref(),
                themes.before_body.as_ref(),
                themes.after_body.as_ref(),
            )
        };
        for (flag, path) in [("-H", header), ("-B", before), ("-A", after)] {
            if let Some(path) = path {
                args.push(flag.to_string());
                args.push(path.to_string_lossy().to_string());
            }
        }
        args
    }

    async fn run_tool(
        &self,
        program: &str,
        args: &[String],
        stdin_data: Option<&[u8]>,
    ) -> Result<std::process::Output> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(if stdin_data.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        tracing::debug!(program, ?args, "invoking external tool");
        let mut child = cmd.spawn()?;
        if let Some(data) = stdin_data {
            let mut stdin = child.stdin.take().expect("stdin was piped");
            stdin.write_all(data).await?;
            drop(stdin);
        }
        let timeout = Duration::from_secs(self.cfg.tools.timeout_secs.max(1));
        match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => Ok(result?),
            // The dropped child is killed (kill_on_drop); expiry becomes a
            // per-entry failure instead of a stalled batch.
            Err(_) => Err(RenderError::ToolTimeout {
                name: program.to_string(),
            }),
        }
    }

    /// One summary block per entry, oldest first. Pure function of the
    /// ordered entry list.
    pub fn build_index(&self, entries: &[Entry]) -> String {
        let template = load_template(self.cfg.index_template.as_deref(), DEFAULT_INDEX_TEMPLATE);
        let blocks: Vec<String> = entries
            .iter()
            .map(|entry| {
                render_template(
                    &template,
                    entry,
                    &entry.subject,
                    &entry.author_name(),
                    "",
                    &entry.article_filename(),
                )
            })
            .collect();
        blocks.join("\n")
    }

    /// Regenerate `index.html` from the ordered entries. Always rewritten,
    /// no skip-if-exists.
    pub async fn write_index(&self, entries: &[Entry]) -> Result<PathBuf> {
        let markdown = self.build_index(entries);
        let html = self
            .run_markdown_tool(&markdown, &self.cfg.index_title, false)
            .await?;
        fs::create_dir_all(&self.cfg.blog_output)?;
        let path = self.cfg.blog_output.join("index.html");
        write_world_readable(&path, html.as_bytes())?;
        tracing::info!(path = %path.display(), entries = entries.len(), "index rendered");
        Ok(path)
    }
}

fn tool_error(name: &str, output: &std::process::Output) -> RenderError {
    RenderError::Tool {
        name: name.to_string(),
        status: output.status.code().unwrap_or(-1),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    }
}

fn geo_markdown(lat_lon: Option<(f64, f64)>, track_file: Option<&str>) -> String {
    let mut attrs = String::new();
    if let Some((lat, lon)) = lat_lon {
        attrs.push_str(&format!(" data-lat=\"{}\" data-lon=\"{}\"", lat, lon));
    }
    if let Some(track) = track_file {
        attrs.push_str(&format!(" data-track=\"{}\"", track));
    }
    format!("\n\n<div id=\"map\"{}></div>\n", attrs)
}

fn load_template(path: Option<&Path>, fallback: &str) -> String {
    match path {
        Some(path) => match fs::read_to_string(path) {
            Ok(template) => template,
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "template unreadable, using built-in");
                fallback.to_string()
            }
        },
        None => fallback.to_string(),
    }
}

fn render_template(
    template: &str,
    entry: &Entry,
    subject: &str,
    author: &str,
    content: &str,
    link: &str,
) -> String {
    let (author_first, author_last) = match author.split_once(' ') {
        Some((first, last)) => (first.to_string(), last.to_string()),
        None => (author.to_string(), String::new()),
    };
    interpolate(
        template,
        &[
            ("date", &entry.date_display()),
            ("subject", subject),
            ("author", author),
            ("author_first", &author_first),
            ("author_last", &author_last),
            ("author_email", &entry.author_email()),
            ("content", content),
            ("link", link),
        ],
    )
}

fn interpolate(template: &str, vars: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in vars {
        out = out.replace(&format!("{{{}}}", key), value);
    }
    out
}

fn write_world_readable(path: &Path, bytes: &[u8]) -> Result<()> {
    fs::write(path, bytes)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(path)?.permissions();
        perms.set_mode(0o644);
        fs::set_permissions(path, perms)?;
    }
    Ok(())
}
