//! Entry model and the SQLite-backed entry catalog.

use chrono::{DateTime, Local, TimeZone, Utc};
use mailparse::dateparse;
use serde::{Deserialize, Serialize};
use sqlx::{SqlitePool, sqlite::SqliteConnectOptions, sqlite::SqlitePoolOptions};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("duplicate entry: {0}")]
    Duplicate(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Where an entry's full message body is refetched from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntrySource {
    Store,
    Mailbox,
}

/// One blog article's persisted metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub message_id: String,
    pub from_addr: String,
    pub subject: String,
    pub timestamp: f64,
    pub source: EntrySource,
}

impl Entry {
    /// Display name part of the sender. A sender without an angle-bracket
    /// address yields the whole string as the name.
    pub fn author_name(&self) -> String {
        match self.from_addr.find('<') {
            Some(pos) => self.from_addr[..pos].trim().trim_matches('"').to_string(),
            None => self.from_addr.trim().to_string(),
        }
    }

    /// Email part of the sender, empty when no angle-bracket address exists.
    pub fn author_email(&self) -> String {
        let trimmed = self.from_addr.trim();
        if let (Some(start), Some(end)) = (trimmed.find('<'), trimmed.rfind('>')) {
            if start < end {
                return trimmed[start + 1..end].trim().to_string();
            }
        }
        String::new()
    }

    pub fn slug(&self) -> String {
        slugify(&self.subject)
    }

    /// Deterministic article file name for this entry.
    pub fn article_filename(&self) -> String {
        format!("{}-{}.html", self.slug(), self.message_id)
    }

    pub fn date_display(&self) -> String {
        format_epoch(self.timestamp)
    }
}

pub fn slugify(raw: &str) -> String {
    let mut out = String::new();
    let mut last_dash = false;
    for ch in raw.chars() {
        let lower = ch.to_ascii_lowercase();
        if lower.is_ascii_alphanumeric() {
            out.push(lower);
            last_dash = false;
        } else if !last_dash && !out.is_empty() {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("untitled");
    }
    out
}

/// Parse a mail `Date` header through a fixed ordered list of formats.
/// First match wins; `None` when nothing matches.
pub fn parse_date_epoch(raw: &str) -> Option<f64> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(ts) = dateparse(trimmed) {
        return Some(ts as f64);
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Some(dt.timestamp() as f64);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(dt.timestamp() as f64);
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(trimmed, "%Y-%m-%d %H:%M:%S") {
        if let Some(dt) = Local.from_local_datetime(&naive).single() {
            return Some(dt.timestamp() as f64);
        }
    }
    None
}

pub fn now_epoch() -> f64 {
    Utc::now().timestamp() as f64
}

pub fn format_epoch(epoch: f64) -> String {
    Local
        .timestamp_opt(epoch as i64, 0)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

/// Append-only catalog of entries keyed by message id.
#[derive(Clone)]
pub struct EntryStore {
    pool: SqlitePool,
}

impl EntryStore {
    pub async fn connect(path: &str) -> Result<Self> {
        let options = SqliteConnectOptions::new()
            .filename(path.trim_start_matches("sqlite:"))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    pub async fn in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    /// Create the schema when absent. Safe to call on every run.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entries (
                timestamp REAL NOT NULL,
                message_id TEXT NOT NULL UNIQUE,
                from_addr TEXT,
                subject TEXT
            )",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS entries_message_id_idx ON entries(message_id)")
            .execute(&self.pool)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS entries_timestamp_idx ON entries(timestamp)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Insert one entry. A message-id collision reports `Duplicate` and
    /// leaves the existing row untouched.
    pub async fn insert(&self, entry: &Entry) -> Result<()> {
        let result = sqlx::query(
            "INSERT INTO entries (timestamp, message_id, from_addr, subject) VALUES (?, ?, ?, ?)",
        )
        .bind(entry.timestamp)
        .bind(&entry.message_id)
        .bind(&entry.from_addr)
        .bind(&entry.subject)
        .execute(&self.pool)
        .await;
        match result {
            Ok(_) => {
                tracing::debug!(message_id = %entry.message_id, "stored entry");
                Ok(())
            }
            Err(sqlx::Error::Database(db)) if db.is_unique_violation() => {
                Err(StoreError::Duplicate(entry.message_id.clone()))
            }
            Err(err) => Err(StoreError::Database(err)),
        }
    }

    /// All entries oldest-first. Equal timestamps keep insertion order.
    pub async fn list_by_date(&self) -> Result<Vec<Entry>> {
        let rows = sqlx::query_as::<_, (f64, String, String, String)>(
            "SELECT timestamp, message_id, from_addr, subject
             FROM entries ORDER BY timestamp ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| Entry {
                timestamp: row.0,
                message_id: row.1,
                from_addr: row.2,
                subject: row.3,
                source: EntrySource::Store,
            })
            .collect())
    }

    pub async fn contains(&self, message_id: &str) -> Result<bool> {
        let row = sqlx::query_as::<_, (i64,)>(
            "SELECT COUNT(*) FROM entries WHERE message_id = ?",
        )
        .bind(message_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::{Entry, EntrySource, EntryStore, StoreError, parse_date_epoch, slugify};

    fn entry(message_id: &str, subject: &str, timestamp: f64) -> Entry {
        Entry {
            message_id: message_id.to_string(),
            from_addr: "Alice Example <alice@example.com>".to_string(),
            subject: subject.to_string(),
            timestamp,
            source: EntrySource::Mailbox,
        }
    }

    #[test]
    fn author_split_handles_angle_addr() {
        let e = entry("a@b", "Hi", 0.0);
        assert_eq!(e.author_name(), "Alice Example");
        assert_eq!(e.author_email(), "alice@example.com");
    }

    #[test]
    fn author_split_tolerates_missing_angle_addr() {
        let mut e = entry("a@b", "Hi", 0.0);
        e.from_addr = "mailer-daemon".to_string();
        assert_eq!(e.author_name(), "mailer-daemon");
        assert_eq!(e.author_email(), "");
    }

    #[test]
    fn slug_is_lowercase_hyphenated() {
        assert_eq!(slugify("Nordkapp, day 3: rain!"), "nordkapp-day-3-rain");
        assert_eq!(slugify("   "), "untitled");
    }

    #[test]
    fn article_filename_is_deterministic() {
        let e = entry("id123@host", "Day One", 0.0);
        assert_eq!(e.article_filename(), "day-one-id123@host.html");
    }

    #[test]
    fn date_parsing_first_match_wins() {
        assert_eq!(
            parse_date_epoch("Thu, 1 Jan 2026 00:00:00 +0000"),
            Some(1767225600.0)
        );
        assert_eq!(
            parse_date_epoch("2026-01-01T00:00:00+00:00"),
            Some(1767225600.0)
        );
        assert_eq!(parse_date_epoch("not a date"), None);
        assert_eq!(parse_date_epoch(""), None);
    }

    #[tokio::test]
    async fn duplicate_insert_keeps_one_row() -> anyhow::Result<()> {
        let store = EntryStore::in_memory().await?;
        store.init().await?;
        store.insert(&entry("dup@host", "First", 10.0)).await?;

        let err = store
            .insert(&entry("dup@host", "Second", 20.0))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Duplicate(id) if id == "dup@host"));

        let all = store.list_by_date().await?;
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].subject, "First");
        Ok(())
    }

    #[tokio::test]
    async fn init_is_idempotent() -> anyhow::Result<()> {
        let store = EntryStore::in_memory().await?;
        store.init().await?;
        store.init().await?;
        store.insert(&entry("one@host", "One", 1.0)).await?;
        assert!(store.contains("one@host").await?);
        assert!(!store.contains("two@host").await?);
        Ok(())
    }

    #[tokio::test]
    async fn list_is_date_ordered_with_stable_ties() -> anyhow::Result<()> {
        let store = EntryStore::in_memory().await?;
        store.init().await?;
        store.insert(&entry("late@host", "Late", 300.0)).await?;
        store.insert(&entry("tie-a@host", "Tie A", 100.0)).await?;
        store.insert(&entry("tie-b@host", "Tie B", 100.0)).await?;
        store.insert(&entry("early@host", "Early", 50.0)).await?;

        let ids: Vec<String> = store
            .list_by_date()
            .await?
            .into_iter()
            .map(|e| e.message_id)
            .collect();
        assert_eq!(ids, ["early@host", "tie-a@host", "tie-b@host", "late@host"]);
        Ok(())
    }
}
