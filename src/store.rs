//! Durable storage of completed assistant messages.
//!
//! The ingest bridge hands every completed answer to a [`MessageStore`].
//! [`RedisMessageStore`] appends them to a capped stream per chat session.
//!
//! # Example
//!
//! ```rust,ignore
//! use chatstream::store::{MessageStore, RedisMessageStore};
//!
//! let store = RedisMessageStore::new(redis_pool);
//! let stored = store.create_assistant_message(message).await?;
//!
//! // Later, read the session history
//! let history = store.list(session_id, 50).await?;
//! ```

use async_trait::async_trait;
use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, error, info};

use crate::event::Role;

/// Default stream prefix; the session id is appended.
pub const MESSAGE_STREAM_PREFIX: &str = "chat:messages";

/// Maximum entries to keep per session stream (older entries are trimmed)
const MESSAGE_STREAM_MAX_LEN: usize = 10000;

/// An assistant message ready to be stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewAssistantMessage {
    pub session_id: i64,
    pub content: String,
    pub metadata: Map<String, Value>,
    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
}

impl NewAssistantMessage {
    pub fn role(&self) -> Role {
        Role::Assistant
    }

    /// Flatten into stream entry fields. Absent numbers are stored as "".
    pub fn to_fields(&self) -> Result<Vec<(&'static str, String)>, StoreError> {
        let metadata = serde_json::to_string(&self.metadata).map_err(|e| {
            error!(error = %e, "Failed to serialize message metadata");
            StoreError::SerializationError(e.to_string())
        })?;

        Ok(vec![
            ("sessionId", self.session_id.to_string()),
            ("role", self.role().as_str().to_string()),
            ("content", self.content.clone()),
            ("meta", metadata),
            ("promptTokens", optional(self.prompt_tokens)),
            ("completionTokens", optional(self.completion_tokens)),
            ("latencyMs", optional(self.latency_ms)),
        ])
    }
}

fn optional<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

/// A message as recorded by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Store-assigned id
    pub id: String,

    pub session_id: i64,
    pub role: Role,
    pub content: String,

    /// ISO 8601 timestamp of when the message was stored
    pub created_at: String,
}

/// Persistence collaborator for completed answers.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn create_assistant_message(
        &self,
        message: NewAssistantMessage,
    ) -> Result<StoredMessage, StoreError>;
}

/// Stores assistant messages in per-session Redis streams.
#[derive(Clone)]
pub struct RedisMessageStore {
    pool: Pool,
    prefix: String,
    max_len: usize,
}

impl RedisMessageStore {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            prefix: MESSAGE_STREAM_PREFIX.to_string(),
            max_len: MESSAGE_STREAM_MAX_LEN,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn with_max_len(mut self, max_len: usize) -> Self {
        self.max_len = max_len;
        self
    }

    /// Stream key holding the messages of one session.
    pub fn stream_key(&self, session_id: i64) -> String {
        format!("{}:{}", self.prefix, session_id)
    }

    /// Count the stored messages of a session.
    pub async fn count(&self, session_id: i64) -> Result<u64, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        let count: u64 = cmd("XLEN")
            .arg(self.stream_key(session_id))
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::RedisError(e.to_string()))?;

        Ok(count)
    }

    /// List up to `count` stored messages of a session, oldest first.
    ///
    /// Returns a list of (stream_id, message) tuples.
    pub async fn list(&self, session_id: i64, count: usize) -> Result<Vec<(String, Value)>, StoreError> {
        let mut conn = self
            .pool
            .get()
            .await
            .map_err(|e| StoreError::ConnectionError(e.to_string()))?;

        let entries: Vec<(String, Vec<(String, String)>)> = cmd("XRANGE")
            .arg(self.stream_key(session_id))
            .arg("-")
            .arg("+")
            .arg("COUNT")
            .arg(count)
            .query_async(&mut conn)
            .await
            .map_err(|e| StoreError::RedisError(e.to_string()))?;

        let result: Vec<(String, Value)> = entries
            .into_iter()
            .map(|(id, fields)| (id, fields_to_json(fields)))
            .collect();

        debug!(session_id, count = result.len(), "Retrieved stored messages");
        Ok(result)
    }
}

#[async_trait]
impl MessageStore for RedisMessageStore {
    async fn create_assistant_message(
        &self,
        message: NewAssistantMessage,
    ) -> Result<StoredMessage, StoreError> {
        let mut conn = self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for message store");
            StoreError::ConnectionError(e.to_string())
        })?;

        let created_at = chrono::Utc::now().to_rfc3339();
        let stream_key = self.stream_key(message.session_id);

        // MAXLEN keeps each session stream bounded
        let mut command = cmd("XADD");
        command
            .arg(&stream_key)
            .arg("MAXLEN")
            .arg("~")
            .arg(self.max_len)
            .arg("*");
        for (field, value) in message.to_fields()? {
            command.arg(field).arg(value);
        }
        command.arg("createdAt").arg(&created_at);

        let id: String = command.query_async(&mut conn).await.map_err(|e| {
            error!(error = %e, stream = %stream_key, "Failed to store assistant message");
            StoreError::RedisError(e.to_string())
        })?;

        info!(
            id = %id,
            session_id = message.session_id,
            content_len = message.content.len(),
            "Stored assistant message"
        );

        Ok(StoredMessage {
            id,
            session_id: message.session_id,
            role: message.role(),
            content: message.content,
            created_at,
        })
    }
}

/// Turn stored stream fields back into JSON, parsing the structured ones.
fn fields_to_json(fields: Vec<(String, String)>) -> Value {
    let mut obj = Map::new();
    for (key, value) in fields {
        let parsed = match key.as_str() {
            "meta" => serde_json::from_str::<Value>(&value).unwrap_or(Value::String(value)),
            "sessionId" | "promptTokens" | "completionTokens" | "latencyMs" => {
                if value.is_empty() {
                    Value::Null
                } else {
                    value
                        .parse::<i64>()
                        .map(Value::from)
                        .unwrap_or(Value::String(value))
                }
            }
            _ => Value::String(value),
        };
        obj.insert(key, parsed);
    }
    Value::Object(obj)
}

/// Errors that can occur when storing messages.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}
