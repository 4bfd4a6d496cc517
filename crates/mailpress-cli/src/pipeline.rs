//! The batch pipeline: record mailbox messages, render each entry, build
//! the index. Failures scoped to one message never abort the batch; only
//! mailbox-session-level failures are fatal.

use std::io::Read;

use anyhow::{Context, Result, bail};

use mailpress_content::{DecodedHeader, decode_header};
use mailpress_core::{Entry, EntrySource, EntryStore, StoreError};
use mailpress_mail::{MailboxClient, RawStore};
use mailpress_render::{ArticleRenderer, MessageSource, RenderOptions, RenderOutcome};

use crate::cli::{ListCmd, RunCmd};
use crate::config::Config;

pub(crate) async fn run(config: &Config, cmd: &RunCmd) -> Result<()> {
    let store = open_store(config).await?;
    let raw_store = RawStore::new(&config.raw_store);
    let mailbox = config
        .mailbox
        .clone()
        .context("the run command needs an [imap] configuration")?;
    let mut client = MailboxClient::new(mailbox);
    client.connect().context("mailbox session failed")?;

    let mut headers = client
        .list_messages()
        .context("listing mailbox messages failed")?;
    let listed = headers.len();
    if let Some(index) = cmd.message {
        if index >= headers.len() {
            bail!("message index {} out of range ({} messages)", index, listed);
        }
        headers = vec![headers.swap_remove(index)];
    }

    let recorded = record_messages(&store, &headers).await?;
    tracing::info!(
        listed,
        new = recorded.new,
        duplicates = recorded.duplicates,
        skipped = recorded.skipped,
        "mailbox scan recorded"
    );

    let mut entries = store.list_by_date().await?;
    if cmd.message.is_some() {
        entries.retain(|entry| recorded.ids.contains(&entry.message_id));
    }

    let renderer = ArticleRenderer::new(config.render.clone());
    let opts = RenderOptions {
        force: cmd.force,
        skip_gallery: cmd.nopix,
    };
    let mut source = PipelineSource {
        raw_store: &raw_store,
        client: Some(&mut client),
    };
    let (mut rendered, mut skipped, mut failed) = (0usize, 0usize, 0usize);
    for mut entry in entries {
        entry.source = if raw_store.contains(&entry.message_id) {
            EntrySource::Store
        } else {
            EntrySource::Mailbox
        };
        match renderer.render_article(&entry, &mut source, opts).await {
            Ok(RenderOutcome::Rendered) => rendered += 1,
            Ok(RenderOutcome::Skipped) => skipped += 1,
            Err(err) => {
                failed += 1;
                tracing::error!(
                    message_id = %entry.message_id,
                    subject = %entry.subject,
                    %err,
                    "article rendering failed"
                );
            }
        }
    }
    drop(source);

    let all = store.list_by_date().await?;
    renderer.write_index(&all).await?;
    tracing::info!(rendered, skipped, failed, "batch complete");
    client.disconnect();
    Ok(())
}

pub(crate) fn list(config: &Config, cmd: &ListCmd) -> Result<()> {
    let mailbox = config
        .mailbox
        .clone()
        .context("the list command needs an [imap] configuration")?;
    let mut client = MailboxClient::new(mailbox);
    client.connect().context("mailbox session failed")?;
    let headers = client
        .list_messages()
        .context("listing mailbox messages failed")?;

    let mut decoded = Vec::new();
    for raw in &headers {
        match decode_header(raw) {
            Ok(header) => decoded.push(header),
            Err(err) => tracing::warn!(%err, "skipping message without usable headers"),
        }
    }
    if cmd.json {
        println!("{}", serde_json::to_string_pretty(&decoded)?);
    } else {
        for header in &decoded {
            println!(
                "{} | {} | {} | {}",
                header.message_id,
                header.from,
                header.to.as_deref().unwrap_or("-"),
                header.subject
            );
        }
    }
    Ok(())
}

/// MDA-style delivery: one raw message on stdin.
pub(crate) async fn ingest(config: &Config) -> Result<()> {
    let mut raw = Vec::new();
    std::io::stdin()
        .read_to_end(&mut raw)
        .context("reading message from stdin")?;
    let header = decode_header(&raw).context("stdin does not contain a decodable message")?;

    let store = open_store(config).await?;
    let entry = entry_from_header(&header);
    match store.insert(&entry).await {
        Ok(()) => {
            tracing::info!(message_id = %entry.message_id, subject = %entry.subject, "recorded new entry");
        }
        Err(StoreError::Duplicate(id)) => {
            tracing::warn!(message_id = %id, "duplicate message, existing entry kept");
        }
        Err(err) => return Err(err.into()),
    }

    let raw_store = RawStore::new(&config.raw_store);
    let path = raw_store.write(&header.message_id, &raw)?;
    tracing::info!(path = %path.display(), "raw message stored");
    Ok(())
}

pub(crate) async fn index(config: &Config) -> Result<()> {
    let store = open_store(config).await?;
    let entries = store.list_by_date().await?;
    let renderer = ArticleRenderer::new(config.render.clone());
    renderer.write_index(&entries).await?;
    Ok(())
}

async fn open_store(config: &Config) -> Result<EntryStore> {
    if let Some(parent) = std::path::Path::new(&config.database).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let store = EntryStore::connect(&config.database).await?;
    store.init().await?;
    Ok(store)
}

struct RecordSummary {
    ids: Vec<String>,
    new: usize,
    duplicates: usize,
    skipped: usize,
}

/// Decode each header block and record it in the catalog. A duplicate is a
/// non-fatal "already have it" signal; a message without a usable id is
/// skipped.
async fn record_messages(store: &EntryStore, headers: &[Vec<u8>]) -> Result<RecordSummary> {
    let mut summary = RecordSummary {
        ids: Vec::new(),
        new: 0,
        duplicates: 0,
        skipped: 0,
    };
    for raw in headers {
        let header = match decode_header(raw) {
            Ok(header) => header,
            Err(err) => {
                tracing::warn!(%err, "skipping message without usable headers");
                summary.skipped += 1;
                continue;
            }
        };
        summary.ids.push(header.message_id.clone());
        let entry = entry_from_header(&header);
        match store.insert(&entry).await {
            Ok(()) => summary.new += 1,
            Err(StoreError::Duplicate(id)) => {
                tracing::warn!(message_id = %id, "duplicate message, existing entry kept");
                summary.duplicates += 1;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(summary)
}

fn entry_from_header(header: &DecodedHeader) -> Entry {
    Entry {
        message_id: header.message_id.clone(),
        from_addr: header.from.clone(),
        subject: header.subject.clone(),
        timestamp: header.timestamp,
        source: EntrySource::Mailbox,
    }
}

struct PipelineSource<'a> {
    raw_store: &'a RawStore,
    client: Option<&'a mut MailboxClient>,
}

impl MessageSource for PipelineSource<'_> {
    fn fetch(&mut self, entry: &Entry) -> anyhow::Result<Vec<u8>> {
        if self.raw_store.contains(&entry.message_id) {
            return Ok(self.raw_store.read(&entry.message_id)?);
        }
        let client = self
            .client
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("no mailbox session to fetch {}", entry.message_id))?;
        let raw = client.fetch_message(&entry.message_id)?;
        if let Err(err) = self.raw_store.write(&entry.message_id, &raw) {
            tracing::warn!(message_id = %entry.message_id, %err, "could not store raw message for replay");
        }
        Ok(raw)
    }
}

#[cfg(test)]
mod tests {
    use mailpress_core::EntryStore;

    use super::record_messages;

    const FIRST: &[u8] = b"From: Alice Example <alice@example.com>\r\n\
Message-ID: <one@host>\r\n\
Subject: First\r\n\
Date: Thu, 1 Jan 2026 00:00:00 +0000\r\n\
\r\n";
    const SECOND: &[u8] = b"From: Bob <bob@example.com>\r\n\
Message-ID: <two@host>\r\n\
Subject: Second\r\n\
Date: Fri, 2 Jan 2026 00:00:00 +0000\r\n\
\r\n";
    const NO_ID: &[u8] = b"From: ghost@example.com\r\nSubject: Broken\r\n\r\n";

    #[tokio::test]
    async fn recording_twice_is_idempotent() -> anyhow::Result<()> {
        let store = EntryStore::in_memory().await?;
        store.init().await?;
        let headers = vec![FIRST.to_vec(), SECOND.to_vec(), NO_ID.to_vec()];

        let first = record_messages(&store, &headers).await?;
        assert_eq!(first.new, 2);
        assert_eq!(first.duplicates, 0);
        assert_eq!(first.skipped, 1);
        assert_eq!(first.ids, ["one@host", "two@host"]);

        let second = record_messages(&store, &headers).await?;
        assert_eq!(second.new, 0);
        assert_eq!(second.duplicates, 2);
        assert_eq!(second.skipped, 1);

        let entries = store.list_by_date().await?;
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].message_id, "one@host");
        assert_eq!(entries[1].message_id, "two@host");
        Ok(())
    }
}
