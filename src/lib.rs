//! # chatstream
//!
//! Bridges LLM worker output delivered over a message broker to live
//! subscribers, and records the finished answer.
//!
//! ## Architecture
//!
//! ```text
//! Client -> HTTP API -> register + XADD llm:chat:request -> LLM workers
//!
//! LLM workers -> llm:chat:token -> ResilientConsumer -> IngestBridge
//!                                                        ├─> StreamHub -> SSE subscribers
//!                                                        └─> MessageStore
//! ```
//!
//! ## Modules
//!
//! - [`consumer`]: Restartable broker consumption with reconnect/backoff
//! - [`hub`]: Correlation of request ids to stream state and live subscribers
//! - [`bridge`]: Decodes broker events, updates the hub, persists completions
//! - [`event`]: Wire schemas and the outbound event union
//! - [`store`]: Persistence of assistant messages
//! - [`producer`]: Outbound publishing of chat requests and stream events

pub mod bridge;
pub mod config;
pub mod consumer;
pub mod event;
pub mod hub;
pub mod producer;
pub mod shutdown;
pub mod store;

// Re-export commonly used types at crate root
pub use bridge::IngestBridge;
pub use consumer::{BrokerMessage, MessageSource, ResilientConsumer, SourceError};
pub use event::{BrokerEvent, OutboundEvent};
pub use hub::{StreamHub, StreamState, Subscription};
pub use store::{MessageStore, NewAssistantMessage};

/// Redis stream carrying chunk and final events from the LLM workers
pub const TOKEN_STREAM_NAME: &str = "llm:chat:token";

/// Redis stream the originating chat requests are published to
pub const REQUEST_STREAM_NAME: &str = "llm:chat:request";

/// Default consumer group name
pub const DEFAULT_CONSUMER_GROUP: &str = "backend-stream";
