//! Mailbox access: one read-only IMAP session plus the local raw-message
//! store used for replay without recontacting the server.

use std::fs;
use std::path::PathBuf;

use imap::{ClientBuilder, ConnectionMode};
use serde::{Deserialize, Serialize};

const FETCH_CHUNK_SIZE: usize = 10;
const RAW_FILE: &str = "raw.mail";

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("authentication rejected: {0}")]
    Auth(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("no message found for id {0}")]
    NotFound(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, MailError>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub skip_tls_verify: bool,
    pub mailbox: String,
}

/// Client owning a single IMAP session for its whole lifetime. The session
/// is read-only (EXAMINE) and logged out on drop, on every exit path.
pub struct MailboxClient {
    config: MailboxConfig,
    session: Option<imap::Session<imap::Connection>>,
}

impl MailboxClient {
    pub fn new(config: MailboxConfig) -> Self {
        Self {
            config,
            session: None,
        }
    }

    /// Establish the session. Calling again on a connected client is a no-op.
    pub fn connect(&mut self) -> Result<()> {
        if self.session.is_some() {
            return Ok(());
        }
        tracing::debug!(host = %self.config.host, port = self.config.port, "connecting to mailbox");
        let client = ClientBuilder::new(self.config.host.as_str(), self.config.port)
            .tls_kind(imap::TlsKind::Native)
            .mode(ConnectionMode::AutoTls)
            .danger_skip_tls_verify(self.config.skip_tls_verify)
            .connect()
            .map_err(|err| MailError::Connection(err.to_string()))?;
        let mut session = client
            .login(&self.config.username, &self.config.password)
            .map_err(|err| MailError::Auth(err.0.to_string()))?;
        session
            .examine(&self.config.mailbox)
            .map_err(|err| MailError::Protocol(err.to_string()))?;
        tracing::debug!(mailbox = %self.config.mailbox, "mailbox session established");
        self.session = Some(session);
        Ok(())
    }

    fn session(&mut self) -> Result<&mut imap::Session<imap::Connection>> {
        if self.session.is_none() {
            self.connect()?;
        }
        Ok(self.session.as_mut().expect("session just established"))
    }

    /// All message header blocks in mailbox (UID ascending) order.
    pub fn list_messages(&mut self) -> Result<Vec<Vec<u8>>> {
        let session = self.session()?;
        let uids = session
            .uid_search("ALL")
            .map_err(|err| MailError::Protocol(err.to_string()))?;
        let mut uids: Vec<u32> = uids.into_iter().collect();
        uids.sort_unstable();

        let mut headers: Vec<(u32, Vec<u8>)> = Vec::with_capacity(uids.len());
        for chunk in uids.chunks(FETCH_CHUNK_SIZE) {
            let uid_set = chunk
                .iter()
                .map(|uid| uid.to_string())
                .collect::<Vec<_>>()
                .join(",");
            let fetches = session
                .uid_fetch(uid_set, "(UID BODY.PEEK[HEADER])")
                .map_err(|err| MailError::Protocol(err.to_string()))?;
            for fetch in fetches.iter() {
                let Some(uid) = fetch.uid else { continue };
                let Some(header) = fetch.header() else {
                    continue;
                };
                headers.push((uid, header.to_vec()));
            }
        }
        headers.sort_by_key(|(uid, _)| *uid);
        tracing::debug!(count = headers.len(), "listed mailbox messages");
        Ok(headers.into_iter().map(|(_, raw)| raw).collect())
    }

    /// Fetch the full raw message matching a message id. Read-only and
    /// safe to retry.
    pub fn fetch_message(&mut self, message_id: &str) -> Result<Vec<u8>> {
        let query = message_search_query(message_id);
        let session = self.session()?;
        let uids = session
            .uid_search(&query)
            .map_err(|err| MailError::Protocol(err.to_string()))?;
        let Some(uid) = uids.into_iter().min() else {
            return Err(MailError::NotFound(message_id.to_string()));
        };
        let fetches = session
            .uid_fetch(uid.to_string(), "RFC822")
            .map_err(|err| MailError::Protocol(err.to_string()))?;
        let body = fetches.iter().find_map(|fetch| fetch.body().map(<[u8]>::to_vec));
        body.ok_or_else(|| MailError::NotFound(message_id.to_string()))
    }

    pub fn disconnect(&mut self) {
        if let Some(mut session) = self.session.take() {
            let _ = session.logout();
            tracing::debug!("mailbox session closed");
        }
    }
}

impl Drop for MailboxClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn message_search_query(message_id: &str) -> String {
    // Quotes never appear in a message id; strip them rather than risk a
    // malformed search atom.
    let cleaned: String = message_id.chars().filter(|c| *c != '"').collect();
    format!("HEADER Message-ID \"<{}>\"", cleaned)
}

/// Local store of raw messages: one directory per message id holding the
/// original unparsed text. Written on first ingest, read back for replay.
#[derive(Debug, Clone)]
pub struct RawStore {
    root: PathBuf,
}

impl RawStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.raw_path(message_id).is_file()
    }

    pub fn write(&self, message_id: &str, raw: &[u8]) -> Result<PathBuf> {
        let dir = self.root.join(dir_name(message_id));
        fs::create_dir_all(&dir)?;
        let path = dir.join(RAW_FILE);
        fs::write(&path, raw)?;
        tracing::debug!(message_id, path = %path.display(), "stored raw message");
        Ok(path)
    }

    pub fn read(&self, message_id: &str) -> Result<Vec<u8>> {
        let path = self.raw_path(message_id);
        if !path.is_file() {
            return Err(MailError::NotFound(message_id.to_string()));
        }
        Ok(fs::read(path)?)
    }

    fn raw_path(&self, message_id: &str) -> PathBuf {
        self.root.join(dir_name(message_id)).join(RAW_FILE)
    }
}

fn dir_name(message_id: &str) -> String {
    message_id
        .chars()
        .map(|c| if c == '/' || c == '\\' { '-' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::{MailError, RawStore, dir_name, message_search_query};

    #[test]
    fn search_query_wraps_id_in_angle_brackets() {
        assert_eq!(
            message_search_query("abc@example.org"),
            "HEADER Message-ID \"<abc@example.org>\""
        );
        assert_eq!(
            message_search_query("a\"b@example.org"),
            "HEADER Message-ID \"<ab@example.org>\""
        );
    }

    #[test]
    fn dir_name_replaces_path_separators() {
        assert_eq!(dir_name("a/b\\c@host"), "a-b-c@host");
        assert_eq!(dir_name("plain@host"), "plain@host");
    }

    #[test]
    fn raw_store_round_trips() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let store = RawStore::new(dir.path());

        assert!(!store.contains("m1@host"));
        store.write("m1@host", b"From: a@b\r\n\r\nBody")?;
        assert!(store.contains("m1@host"));
        assert_eq!(store.read("m1@host")?, b"From: a@b\r\n\r\nBody");
        Ok(())
    }

    #[test]
    fn raw_store_reports_missing_message() {
        let dir = tempfile::tempdir().unwrap();
        let store = RawStore::new(dir.path());
        let err = store.read("ghost@host").unwrap_err();
        assert!(matches!(err, MailError::NotFound(id) if id == "ghost@host"));
    }
}
