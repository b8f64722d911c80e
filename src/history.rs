//! Append-only message log with chronological and day-grouped paged reads.

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize, Serializer};
use uuid::Uuid;

use crate::db::Database;

/// Exclusive upper bound for accepted timestamps (year 10000). Keeps the
/// stored created_at text fixed-width.
const MAX_TIMESTAMP: f64 = 253_402_300_800.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }
}

/// A turn about to be written.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub role: Role,
    pub content: String,
    /// Epoch seconds; authoritative for display and ordering.
    pub timestamp: f64,
}

impl NewMessage {
    pub fn new(role: Role, content: impl Into<String>, timestamp: f64) -> Self {
        Self {
            role,
            content: content.into(),
            timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StoredMessage {
    pub id: i64,
    #[serde(skip_serializing)]
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: f64,
    pub created_at: String,
}

impl StoredMessage {
    /// UTC calendar date of `created_at` (`YYYY-MM-DD`).
    pub fn utc_day(&self) -> &str {
        self.created_at.get(..10).unwrap_or(&self.created_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DayGroup {
    pub date: String,
    pub messages: Vec<StoredMessage>,
}

/// Day groups in page order (newest date first). Serializes as a JSON object
/// whose key order is the page order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DayGroups(pub Vec<DayGroup>);

impl DayGroups {
    fn from_page(rows: Vec<StoredMessage>) -> Self {
        let mut groups: Vec<DayGroup> = Vec::new();
        for row in rows {
            match groups.last_mut() {
                Some(group) if group.date == row.utc_day() => group.messages.push(row),
                _ => groups.push(DayGroup {
                    date: row.utc_day().to_string(),
                    messages: vec![row],
                }),
            }
        }
        Self(groups)
    }
}

#[cfg(test)]
impl DayGroups {
    pub fn get(&self, date: &str) -> Option<&[StoredMessage]> {
        self.0
            .iter()
            .find(|g| g.date == date)
            .map(|g| g.messages.as_slice())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn messages(&self) -> impl Iterator<Item = &StoredMessage> {
        self.0.iter().flat_map(|g| g.messages.iter())
    }
}

impl Serialize for DayGroups {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_map(self.0.iter().map(|g| (&g.date, &g.messages)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoryPage {
    pub groups: DayGroups,
    /// Id of the oldest message in this page; `None` once the log is exhausted.
    pub next_cursor: Option<i64>,
}

pub fn utc_from_timestamp(timestamp: f64) -> Result<DateTime<Utc>> {
    if !timestamp.is_finite() || !(0.0..MAX_TIMESTAMP).contains(&timestamp) {
        return Err(anyhow!("invalid message timestamp: {}", timestamp));
    }
    let micros = (timestamp * 1_000_000.0).round() as i64;
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| anyhow!("invalid message timestamp: {}", timestamp))
}

/// Fixed-width RFC 3339 in UTC with microseconds.
pub fn format_utc(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

const MESSAGE_COLUMNS: &str = "id, conversation_id, role, content, timestamp, created_at";

#[derive(Debug, Clone)]
pub struct HistoryStore {
    db: Database,
}

impl HistoryStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Returns `conversation_id` (creating its row if missing), or a fresh id
    /// when none is given.
    pub async fn get_or_create(&self, conversation_id: Option<&str>) -> Result<String> {
        let id = match conversation_id.filter(|id| !id.is_empty()) {
            Some(id) => id.to_string(),
            None => Uuid::new_v4().to_string(),
        };

        sqlx::query("INSERT OR IGNORE INTO conversations (id, title, created_at) VALUES (?, NULL, ?)")
            .bind(&id)
            .bind(format_utc(Utc::now()))
            .execute(self.db.pool())
            .await
            .context("creating conversation")?;

        Ok(id)
    }

    /// Persist one turn. The conversation row is created in the same
    /// transaction if it does not exist yet.
    pub async fn append(&self, conversation_id: &str, message: NewMessage) -> Result<StoredMessage> {
        let created_at = format_utc(utc_from_timestamp(message.timestamp)?);

        let mut tx = self
            .db
            .pool()
            .begin()
            .await
            .context("starting append transaction")?;

        sqlx::query("INSERT OR IGNORE INTO conversations (id, title, created_at) VALUES (?, NULL, ?)")
            .bind(conversation_id)
            .bind(format_utc(Utc::now()))
            .execute(&mut *tx)
            .await
            .context("creating conversation")?;

        let id = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO messages (conversation_id, role, content, timestamp, created_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING id
            "#,
        )
        .bind(conversation_id)
        .bind(message.role)
        .bind(&message.content)
        .bind(message.timestamp)
        .bind(&created_at)
        .fetch_one(&mut *tx)
        .await
        .context("inserting message")?;

        tx.commit().await.context("committing message")?;

        Ok(StoredMessage {
            id,
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: message.content,
            timestamp: message.timestamp,
            created_at,
        })
    }

    /// The most recent `limit` messages, oldest first. Older turns beyond
    /// `limit` are dropped.
    pub async fn chronological(&self, conversation_id: &str, limit: u32) -> Result<Vec<StoredMessage>> {
        let sql = format!(
            r#"
            SELECT {MESSAGE_COLUMNS} FROM (
                SELECT {MESSAGE_COLUMNS} FROM messages
                WHERE conversation_id = ?
                ORDER BY created_at DESC, id DESC
                LIMIT ?
            )
            ORDER BY created_at ASC, id ASC
            "#
        );
        sqlx::query_as::<_, StoredMessage>(&sql)
            .bind(conversation_id)
            .bind(i64::from(limit))
            .fetch_all(self.db.pool())
            .await
            .context("fetching chronological history")
    }

    /// Newest-first page of messages strictly older than `before_id`, grouped
    /// by UTC date.
    ///
    /// Position is the cursor message's `(created_at, id)`, not its id alone.
    /// When timestamps arrive out of insertion order the returned cursors are
    /// not monotonic in id (e.g. 1, 4, 6, 2); the walk still visits every
    /// message once and ends because each page starts strictly below the
    /// previous keyset position.
    pub async fn paged_by_day(
        &self,
        conversation_id: &str,
        before_id: Option<i64>,
        page_size: u32,
    ) -> Result<HistoryPage> {
        let page_size = i64::from(page_size);
        let rows = match before_id {
            None => {
                let sql = format!(
                    "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? \
                     ORDER BY created_at DESC, id DESC LIMIT ?"
                );
                sqlx::query_as::<_, StoredMessage>(&sql)
                    .bind(conversation_id)
                    .bind(page_size)
                    .fetch_all(self.db.pool())
                    .await
            }
            Some(before_id) => match self.cursor_position(conversation_id, before_id).await? {
                Some(cursor_created_at) => {
                    let sql = format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? \
                         AND (created_at < ? OR (created_at = ? AND id < ?)) \
                         ORDER BY created_at DESC, id DESC LIMIT ?"
                    );
                    sqlx::query_as::<_, StoredMessage>(&sql)
                        .bind(conversation_id)
                        .bind(&cursor_created_at)
                        .bind(&cursor_created_at)
                        .bind(before_id)
                        .bind(page_size)
                        .fetch_all(self.db.pool())
                        .await
                }
                None => {
                    let sql = format!(
                        "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ? \
                         AND id < ? ORDER BY created_at DESC, id DESC LIMIT ?"
                    );
                    sqlx::query_as::<_, StoredMessage>(&sql)
                        .bind(conversation_id)
                        .bind(before_id)
                        .bind(page_size)
                        .fetch_all(self.db.pool())
                        .await
                }
            },
        }
        .context("fetching history page")?;

        let next_cursor = rows.last().map(|m| m.id);
        Ok(HistoryPage {
            groups: DayGroups::from_page(rows),
            next_cursor,
        })
    }

    async fn cursor_position(&self, conversation_id: &str, id: i64) -> Result<Option<String>> {
        sqlx::query_scalar::<_, String>(
            "SELECT created_at FROM messages WHERE id = ? AND conversation_id = ?",
        )
        .bind(id)
        .bind(conversation_id)
        .fetch_optional(self.db.pool())
        .await
        .context("resolving history cursor")
    }
}
