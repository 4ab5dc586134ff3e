//! Wire schemas exchanged with the LLM workers, and the events pushed to
//! live subscribers.
//!
//! Workers publish two kinds of payload on the token stream. A streamed
//! chunk carries `delta` and `index`; everything else is a completion.
//! [`BrokerEvent::decode`] makes that decision once, so downstream code
//! only ever matches on the variant.
//!
//! ```json
//! {"request_id": "7d1c...", "chat_session_id": 5, "index": 0, "delta": "He"}
//! {"request_id": "7d1c...", "chat_session_id": 5, "usage": {"prompt_tokens": 12, "completion_tokens": 2}, "latency_ms": 840}
//! ```

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

/// Errors raised while decoding a broker payload.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("payload is not a JSON object")]
    NotAnObject,
}

/// Author of a chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

/// A single message in the conversation sent to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmMessage {
    pub role: Role,
    pub content: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl LlmMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }
}

/// The originating request placed on the request stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmChatRequest {
    pub request_id: String,
    pub chat_session_id: i64,

    #[serde(default)]
    pub user_id: Option<i64>,

    pub messages: Vec<LlmMessage>,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_top_p")]
    pub top_p: f32,

    #[serde(default = "default_stream")]
    pub stream: bool,

    #[serde(default)]
    pub metadata: Map<String, Value>,

    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

fn default_model() -> String {
    "gemma-2b-it".to_string()
}

fn default_max_tokens() -> u32 {
    1024
}

fn default_temperature() -> f32 {
    0.7
}

fn default_top_p() -> f32 {
    1.0
}

fn default_stream() -> bool {
    true
}

impl LlmChatRequest {
    /// Create a streaming request with a fresh request id and default sampling.
    pub fn new(chat_session_id: i64, user_id: Option<i64>, messages: Vec<LlmMessage>) -> Self {
        Self {
            request_id: Uuid::new_v4().to_string(),
            chat_session_id,
            user_id,
            messages,
            model: default_model(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            top_p: default_top_p(),
            stream: default_stream(),
            metadata: Map::new(),
            created_at: Utc::now(),
        }
    }
}

/// Token accounting reported by the worker on completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub prompt_tokens: u32,
    #[serde(default)]
    pub completion_tokens: u32,
}

impl TokenUsage {
    pub fn total_tokens(&self) -> u32 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Error reported by the worker in place of (or alongside) an answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmError {
    pub code: String,
    pub message: String,
}

/// An incremental piece of the answer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub request_id: Option<String>,

    #[serde(default)]
    pub chat_session_id: Option<i64>,

    pub index: u64,
    pub delta: String,

    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

/// Completion of a request, possibly carrying a trailing piece of text.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FinalResponse {
    #[serde(default)]
    pub request_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_session_id: Option<i64>,

    /// Trailing text not yet sent as a chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delta: Option<String>,

    /// Whole answer, sent by workers that do not stream
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Index of the last chunk, when the completion is itself a chunk
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<u64>,

    #[serde(default, alias = "token_usage", skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<u64>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<LlmError>,

    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub created_at: Option<DateTime<Utc>>,
}

/// Accept RFC 3339, naive ISO 8601 (taken as UTC) or unix seconds.
///
/// Anything else decodes as `None`; a timestamp never rejects an event.
fn lenient_timestamp<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.as_ref().and_then(parse_timestamp))
}

fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|at| at.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f"))
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => match n.as_i64() {
            Some(secs) => DateTime::from_timestamp(secs, 0),
            None => n
                .as_f64()
                .and_then(|secs| DateTime::from_timestamp_millis((secs * 1000.0) as i64)),
        },
        _ => None,
    }
}

/// A decoded message from the token stream.
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Chunk(StreamChunk),
    Final(FinalResponse),
}

impl BrokerEvent {
    /// Decode a raw payload.
    ///
    /// A payload is a chunk when it has both `delta` and `index` and is not
    /// flagged `is_final`; any other object is a completion.
    pub fn decode(payload: &[u8]) -> Result<Self, DecodeError> {
        let value: Value = serde_json::from_slice(payload)?;
        let object = value.as_object().ok_or(DecodeError::NotAnObject)?;

        let has_chunk_fields = object.contains_key("delta") && object.contains_key("index");
        let is_final = object
            .get("is_final")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        if has_chunk_fields && !is_final {
            Ok(BrokerEvent::Chunk(serde_json::from_value(value)?))
        } else {
            Ok(BrokerEvent::Final(serde_json::from_value(value)?))
        }
    }

    /// Request id carried in the payload, if any.
    pub fn request_id(&self) -> Option<&str> {
        let id = match self {
            BrokerEvent::Chunk(chunk) => chunk.request_id.as_deref(),
            BrokerEvent::Final(response) => response.request_id.as_deref(),
        };
        id.filter(|id| !id.is_empty())
    }

    pub fn is_final(&self) -> bool {
        matches!(self, BrokerEvent::Final(_))
    }
}

/// Event pushed to live subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutboundEvent {
    Chunk { delta: String, index: u64 },
    Final { content: String },
    Done,
}

impl OutboundEvent {
    /// Name used for the SSE `event:` field.
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundEvent::Chunk { .. } => "chunk",
            OutboundEvent::Final { .. } => "final",
            OutboundEvent::Done => "done",
        }
    }

    /// `Done` ends every subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OutboundEvent::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn decode(value: Value) -> BrokerEvent {
        BrokerEvent::decode(value.to_string().as_bytes()).unwrap()
    }

    #[test]
    fn test_timestamps_decode_leniently() {
        let parse = |value: Value| {
            match decode(json!({"request_id": "r1", "index": 0, "delta": "x", "created_at": value})) {
                BrokerEvent::Chunk(chunk) => chunk.created_at.map(|at| at.to_rfc3339()),
                other => panic!("expected chunk, got {:?}", other),
            }
        };

        assert_eq!(
            parse(json!("2025-12-11T10:00:00.123456")).as_deref(),
            Some("2025-12-11T10:00:00.123456+00:00")
        );
        assert_eq!(
            parse(json!("2025-12-11T12:00:00+02:00")).as_deref(),
            Some("2025-12-11T10:00:00+00:00")
        );
        assert_eq!(parse(json!(1765447200)).as_deref(), Some("2025-12-11T10:00:00+00:00"));
        assert_eq!(parse(json!("yesterday")), None);
        assert_eq!(parse(Value::Null), None);
    }

    #[test]
    fn test_final_with_naive_timestamp_decodes() {
        let event = decode(json!({"request_id": "r1", "created_at": "2025-12-11T10:00:00"}));
        match event {
            BrokerEvent::Final(response) => assert!(response.created_at.is_some()),
            other => panic!("expected final, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_chunk() {
        let event = decode(json!({
            "request_id": "r1",
            "chat_session_id": 5,
            "index": 3,
            "delta": "llo",
            "is_final": false,
            "created_at": "2025-12-11T10:00:00Z"
        }));

        match event {
            BrokerEvent::Chunk(chunk) => {
                assert_eq!(chunk.request_id.as_deref(), Some("r1"));
                assert_eq!(chunk.index, 3);
                assert_eq!(chunk.delta, "llo");
                assert!(chunk.created_at.is_some());
            }
            other => panic!("expected chunk, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_final_response() {
        let event = decode(json!({
            "request_id": "r1",
            "chat_session_id": 5,
            "usage": {"prompt_tokens": 12, "completion_tokens": 2},
            "latency_ms": 840,
            "finish_reason": "stop"
        }));

        let BrokerEvent::Final(response) = event else {
            panic!("expected final");
        };
        assert_eq!(response.usage.map(|u| u.total_tokens()), Some(14));
        assert_eq!(response.latency_ms, Some(840));
        assert_eq!(response.finish_reason.as_deref(), Some("stop"));
        assert!(response.delta.is_none());
    }

    #[test]
    fn test_decode_final_flagged_chunk() {
        let event = decode(json!({
            "request_id": "r1",
            "chat_session_id": 5,
            "index": 7,
            "delta": "!",
            "is_final": true,
            "token_usage": {"prompt_tokens": 3, "completion_tokens": 8}
        }));

        let BrokerEvent::Final(response) = event else {
            panic!("expected final");
        };
        assert_eq!(response.delta.as_deref(), Some("!"));
        assert_eq!(response.index, Some(7));
        assert_eq!(
            response.usage,
            Some(TokenUsage {
                prompt_tokens: 3,
                completion_tokens: 8
            })
        );
    }

    #[test]
    fn test_delta_without_index_is_final() {
        let event = decode(json!({"request_id": "r1", "delta": "tail"}));
        assert!(event.is_final());
    }

    #[test]
    fn test_empty_request_id_is_unusable() {
        let event = decode(json!({"request_id": "", "index": 0, "delta": "x"}));
        assert!(event.request_id().is_none());

        let event = decode(json!({"index": 0, "delta": "x"}));
        assert!(event.request_id().is_none());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(matches!(
            BrokerEvent::decode(b"not json"),
            Err(DecodeError::Json(_))
        ));
        assert!(matches!(
            BrokerEvent::decode(b"[1, 2]"),
            Err(DecodeError::NotAnObject)
        ));
        // Chunk shape with a mistyped index
        assert!(BrokerEvent::decode(br#"{"delta": "x", "index": "zero"}"#).is_err());
    }

    #[test]
    fn test_outbound_event_serialization() {
        let chunk = OutboundEvent::Chunk {
            delta: "He".to_string(),
            index: 0,
        };
        assert_eq!(
            serde_json::to_value(&chunk).unwrap(),
            json!({"type": "chunk", "delta": "He", "index": 0})
        );
        assert_eq!(
            serde_json::to_value(OutboundEvent::Done).unwrap(),
            json!({"type": "done"})
        );
        assert_eq!(chunk.kind(), "chunk");
        assert!(OutboundEvent::Done.is_terminal());
    }

    #[test]
    fn test_chat_request_defaults() {
        let request = LlmChatRequest::new(5, Some(7), vec![LlmMessage::user("hi")]);
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["chat_session_id"], 5);
        assert_eq!(value["messages"][0]["role"], "user");
        assert_eq!(value["model"], "gemma-2b-it");
        assert!(value["stream"].as_bool().unwrap());
        assert!(Uuid::parse_str(&request.request_id).is_ok());
    }
}
