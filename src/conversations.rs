//! Conversation registry: explicit creation and recency-ordered listing.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::db::Database;
use crate::history::format_utc;

/// Characters of the latest message kept in a listing snippet.
pub const SNIPPET_CHARS: usize = 140;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Conversation {
    pub id: String,
    pub title: Option<String>,
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversationSummary {
    pub id: String,
    pub title: Option<String>,
    pub created_at: String,
    pub last_message_at: Option<String>,
    pub last_snippet: Option<String>,
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    id: String,
    title: Option<String>,
    created_at: String,
    last_message_at: Option<String>,
    last_content: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ConversationRegistry {
    db: Database,
}

impl ConversationRegistry {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub async fn create(&self, title: Option<String>) -> Result<Conversation> {
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            title,
            created_at: format_utc(Utc::now()),
        };

        sqlx::query("INSERT INTO conversations (id, title, created_at) VALUES (?, ?, ?)")
            .bind(&conversation.id)
            .bind(&conversation.title)
            .bind(&conversation.created_at)
            .execute(self.db.pool())
            .await
            .context("inserting conversation")?;

        tracing::debug!(conversation_id = %conversation.id, "Created conversation");
        Ok(conversation)
    }

    /// Most recently active first. Conversations without messages follow,
    /// newest created first.
    pub async fn list(&self, limit: u32) -> Result<Vec<ConversationSummary>> {
        let rows = sqlx::query_as::<_, SummaryRow>(
            r#"
            SELECT
                c.id,
                c.title,
                c.created_at,
                last.created_at AS last_message_at,
                last.content AS last_content
            FROM conversations c
            LEFT JOIN messages last ON last.id = (
                SELECT m.id FROM messages m
                WHERE m.conversation_id = c.id
                ORDER BY m.created_at DESC, m.id DESC
                LIMIT 1
            )
            ORDER BY (last.created_at IS NULL), last.created_at DESC, c.created_at DESC
            LIMIT ?
            "#,
        )
        .bind(i64::from(limit))
        .fetch_all(self.db.pool())
        .await
        .context("listing conversations")?;

        Ok(rows
            .into_iter()
            .map(|row| ConversationSummary {
                id: row.id,
                title: row.title,
                created_at: row.created_at,
                last_message_at: row.last_message_at,
                last_snippet: row.last_content.map(|c| snippet(&c)),
            })
            .collect())
    }
}

fn snippet(content: &str) -> String {
    content.chars().take(SNIPPET_CHARS).collect()
}
