//! JSON frames exchanged over the chat socket.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::bridge::Usage;
use crate::error::ProtocolError;
use crate::history::{Role, StoredMessage};

/// Current time as epoch seconds.
pub fn now_ts() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// Client -> server.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Message {
        #[serde(default)]
        text: String,
        #[serde(default)]
        session_id: Option<String>,
    },
    Ping,
    Cancel,
}

impl ClientFrame {
    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(raw).map_err(|_| ProtocolError::InvalidJson)?;
        if !value.is_object() {
            return Err(ProtocolError::InvalidFrame("expected a JSON object".to_string()));
        }
        match value.get("type").and_then(Value::as_str) {
            Some("message" | "ping" | "cancel") => serde_json::from_value(value)
                .map_err(|e| ProtocolError::InvalidFrame(e.to_string())),
            other => Err(ProtocolError::UnknownType(other.map(str::to_string))),
        }
    }
}

/// The assistant turn as reported in a `done` frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FinalMessage {
    pub id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: f64,
}

impl From<&StoredMessage> for FinalMessage {
    fn from(msg: &StoredMessage) -> Self {
        Self {
            id: msg.id.to_string(),
            role: msg.role,
            content: msg.content.clone(),
            timestamp: msg.timestamp,
        }
    }
}

/// Server -> client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Ready {
        ts: f64,
    },
    Start {
        session_id: String,
        message_id: String,
        ts: f64,
    },
    Chunk {
        delta: String,
        ts: f64,
    },
    Done {
        message: FinalMessage,
        usage: Usage,
        ts: f64,
    },
    Cancelled,
    Heartbeat {
        ts: f64,
    },
    Pong {
        ts: f64,
    },
    Error {
        error: String,
    },
}

impl ServerFrame {
    pub fn ready() -> Self {
        Self::Ready { ts: now_ts() }
    }

    pub fn start(session_id: &str, message_id: i64) -> Self {
        Self::Start {
            session_id: session_id.to_string(),
            message_id: message_id.to_string(),
            ts: now_ts(),
        }
    }

    pub fn chunk(delta: String) -> Self {
        Self::Chunk { delta, ts: now_ts() }
    }

    pub fn done(message: &StoredMessage, usage: Usage) -> Self {
        Self::Done {
            message: message.into(),
            usage,
            ts: now_ts(),
        }
    }

    pub fn heartbeat() -> Self {
        Self::Heartbeat { ts: now_ts() }
    }

    pub fn pong() -> Self {
        Self::Pong { ts: now_ts() }
    }

    pub fn error(error: impl ToString) -> Self {
        Self::Error {
            error: error.to_string(),
        }
    }

    /// Frame kind, as it appears in the `type` field.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ready { .. } => "ready",
            Self::Start { .. } => "start",
            Self::Chunk { .. } => "chunk",
            Self::Done { .. } => "done",
            Self::Cancelled => "cancelled",
            Self::Heartbeat { .. } => "heartbeat",
            Self::Pong { .. } => "pong",
            Self::Error { .. } => "error",
        }
    }
}
