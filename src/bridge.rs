//! Ingest bridge - turns broker messages into hub updates.
//!
//! The [`IngestBridge`] reads the stream produced by a
//! [`ResilientConsumer`](crate::consumer::ResilientConsumer), decodes each
//! message into a [`BrokerEvent`] and applies it:
//!
//! ```text
//! BrokerMessage
//!     │ decode
//!     ▼
//! Chunk ──> append_text ──> publish chunk
//!
//! Final ──> state? ── no ──> publish done (orphaned, nothing stored)
//!             │
//!            yes
//!             ▼
//!           append trailing delta, merge metadata
//!             ▼
//!           publish final ──> MessageStore ──> mark_done
//! ```
//!
//! A failure while handling one message (decode error, panic) is logged and
//! the loop moves on. Storage failures are logged and do not hold back
//! `done`, so live clients are never left hanging.
//!
//! Messages are applied in arrival order. The broker is expected to deliver
//! all events of one request to this consumer in publish order; the bridge
//! does no reordering or deduplication of its own.

use futures::{FutureExt, Stream, StreamExt};
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::consumer::{BrokerMessage, MessageSource, ResilientConsumer};
use crate::event::{BrokerEvent, DecodeError, FinalResponse, OutboundEvent, StreamChunk};
use crate::hub::StreamHub;
use crate::shutdown::ShutdownSignal;
use crate::store::{MessageStore, NewAssistantMessage};

/// Log bridge statistics every this many messages.
const STATS_INTERVAL: u64 = 100;

/// Errors raised while handling a single message.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("undecodable payload in message {id}: {source}")]
    Decode {
        id: String,
        #[source]
        source: DecodeError,
    },

    #[error("handler panicked on message {id}: {reason}")]
    Panicked { id: String, reason: String },
}

/// What handling a message amounted to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// No usable request id
    Skipped,
    /// Chunk with an empty delta
    EmptyChunk,
    /// Chunk appended and offered to `delivered` subscribers
    Chunk { delivered: usize },
    /// Final handled; `persisted` is false if the store failed
    Completed { persisted: bool },
    /// Final for a request with no registered state
    Orphaned,
}

/// Counters describing the bridge's work so far.
#[derive(Debug, Default)]
pub struct BridgeStats {
    processed: AtomicU64,
    chunks: AtomicU64,
    completions: AtomicU64,
    orphaned: AtomicU64,
    skipped: AtomicU64,
    failures: AtomicU64,
    persistence_failures: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub chunks: u64,
    pub completions: u64,
    pub orphaned: u64,
    pub skipped: u64,
    pub failures: u64,
    pub persistence_failures: u64,
}

impl BridgeStats {
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            chunks: self.chunks.load(Ordering::Relaxed),
            completions: self.completions.load(Ordering::Relaxed),
            orphaned: self.orphaned.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
        }
    }

    fn record(&self, result: &Result<Outcome, BridgeError>) {
        self.processed.fetch_add(1, Ordering::Relaxed);
        let counter = match result {
            Ok(Outcome::Skipped) | Ok(Outcome::EmptyChunk) => &self.skipped,
            Ok(Outcome::Chunk { .. }) => &self.chunks,
            Ok(Outcome::Completed { persisted }) => {
                if !persisted {
                    self.persistence_failures.fetch_add(1, Ordering::Relaxed);
                }
                &self.completions
            }
            Ok(Outcome::Orphaned) => &self.orphaned,
            Err(_) => &self.failures,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// Applies broker events to the hub and stores completed answers.
pub struct IngestBridge {
    hub: Arc<StreamHub>,
    store: Arc<dyn MessageStore>,
    stats: Arc<BridgeStats>,
}

impl IngestBridge {
    pub fn new(hub: Arc<StreamHub>, store: Arc<dyn MessageStore>) -> Self {
        Self {
            hub,
            store,
            stats: Arc::new(BridgeStats::default()),
        }
    }

    /// Share counters with an existing owner (e.g. across consumer restarts).
    pub fn with_stats(mut self, stats: Arc<BridgeStats>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    /// Process messages until the stream ends.
    pub async fn run<S>(&self, messages: S)
    where
        S: Stream<Item = BrokerMessage>,
    {
        futures::pin_mut!(messages);
        info!("Ingest bridge running");

        while let Some(message) = messages.next().await {
            let result = match AssertUnwindSafe(self.handle(&message))
                .catch_unwind()
                .await
            {
                Ok(result) => result,
                Err(panic) => Err(BridgeError::Panicked {
                    id: message.id.clone(),
                    reason: panic_reason(panic),
                }),
            };

            if let Err(e) = &result {
                error!(id = %message.id, error = %e, "Error processing LLM stream message");
            }
            self.stats.record(&result);

            let stats = self.stats.snapshot();
            if stats.processed % STATS_INTERVAL == 0 {
                info!(
                    processed = stats.processed,
                    chunks = stats.chunks,
                    completions = stats.completions,
                    orphaned = stats.orphaned,
                    failures = stats.failures,
                    persistence_failures = stats.persistence_failures,
                    "Ingest statistics"
                );
            }
        }

        info!("Ingest bridge stopped: message stream ended");
    }

    /// Keep a consumer running until shutdown.
    ///
    /// A consumer that ends on a fatal error is replaced by a fresh one built
    /// with `make_source`, after `reconnect_delay`.
    pub async fn supervise<S, F>(
        &self,
        mut make_source: F,
        shutdown: ShutdownSignal,
        reconnect_delay: Duration,
    ) where
        S: MessageSource,
        F: FnMut() -> S,
    {
        let mut generation: u64 = 0;

        loop {
            generation += 1;
            let mut consumer = ResilientConsumer::new(make_source(), shutdown.clone())
                .with_reconnect_delay(reconnect_delay);

            info!(generation, "Starting ingest consumer");
            self.run(consumer.consume()).await;

            if shutdown.is_shutdown() {
                break;
            }

            warn!(
                generation,
                retry_in_ms = reconnect_delay.as_millis() as u64,
                "Ingest consumer ended, recreating"
            );
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(reconnect_delay) => {}
            }
        }

        info!("Ingest supervisor stopped");
    }

    /// Apply a single broker message.
    pub async fn handle(&self, message: &BrokerMessage) -> Result<Outcome, BridgeError> {
        let event = BrokerEvent::decode(&message.payload).map_err(|source| BridgeError::Decode {
            id: message.id.clone(),
            source,
        })?;

        let request_id = match event
            .request_id()
            .map(str::to_string)
            .or_else(|| message.key.clone().filter(|key| !key.is_empty()))
        {
            Some(id) => id,
            None => {
                debug!(id = %message.id, "Discarding event without request id");
                return Ok(Outcome::Skipped);
            }
        };

        debug!(
            id = %message.id,
            request_id = %request_id,
            is_final = event.is_final(),
            "Applying event"
        );

        match event {
            BrokerEvent::Chunk(chunk) => Ok(self.apply_chunk(&request_id, chunk)),
            BrokerEvent::Final(response) => Ok(self.complete(&request_id, response).await),
        }
    }

    fn apply_chunk(&self, request_id: &str, chunk: StreamChunk) -> Outcome {
        if chunk.delta.is_empty() {
            return Outcome::EmptyChunk;
        }

        self.hub.append_text(request_id, &chunk.delta);
        let delivered = self.hub.publish(
            request_id,
            OutboundEvent::Chunk {
                delta: chunk.delta,
                index: chunk.index,
            },
        );

        debug!(request_id = %request_id, index = chunk.index, delivered, "Chunk applied");
        Outcome::Chunk { delivered }
    }

    async fn complete(&self, request_id: &str, response: FinalResponse) -> Outcome {
        if self.hub.get_state(request_id).is_none() {
            return self.orphaned(request_id);
        }

        if let Some(delta) = response.delta.as_deref().filter(|d| !d.is_empty()) {
            self.hub.append_text(request_id, delta);
        }

        if let Some(error) = &response.error {
            warn!(
                request_id = %request_id,
                code = %error.code,
                message = %error.message,
                "Worker reported an error for request"
            );
        }

        let metadata = completion_metadata(request_id, &response);
        let state = self.hub.update_state(request_id, |state| {
            // Non-streaming workers send the whole answer only on completion.
            if state.text.is_empty() {
                if let Some(content) = &response.content {
                    state.text.push_str(content);
                }
            }
            state.metadata.extend(metadata);
            if let Some(usage) = response.usage {
                state.prompt_tokens = Some(usage.prompt_tokens);
                state.completion_tokens = Some(usage.completion_tokens);
            }
            if response.latency_ms.is_some() {
                state.latency_ms = response.latency_ms;
            }
            state.clone()
        });

        // Removed between the existence check and the update
        let Some(state) = state else {
            return self.orphaned(request_id);
        };

        let content = state.text;
        self.hub.publish(
            request_id,
            OutboundEvent::Final {
                content: content.clone(),
            },
        );

        let message = NewAssistantMessage {
            session_id: state.session_id,
            content,
            metadata: state.metadata,
            prompt_tokens: state.prompt_tokens,
            completion_tokens: state.completion_tokens,
            latency_ms: state.latency_ms,
        };

        // A panicking store must not skip mark_done below.
        let persisted = match AssertUnwindSafe(self.store.create_assistant_message(message))
            .catch_unwind()
            .await
        {
            Ok(Ok(stored)) => {
                debug!(request_id = %request_id, message_id = %stored.id, "Completion stored");
                true
            }
            Ok(Err(e)) => {
                error!(
                    request_id = %request_id,
                    session_id = state.session_id,
                    error = %e,
                    "Failed to store completed message, delivering done anyway"
                );
                false
            }
            Err(panic) => {
                error!(
                    request_id = %request_id,
                    session_id = state.session_id,
                    reason = %panic_reason(panic),
                    "Message store panicked, delivering done anyway"
                );
                false
            }
        };

        self.hub.mark_done(request_id);
        info!(
            request_id = %request_id,
            persisted,
            total_tokens = response.usage.map(|usage| usage.total_tokens()),
            "Stream completed"
        );

        Outcome::Completed { persisted }
    }

    fn orphaned(&self, request_id: &str) -> Outcome {
        warn!(
            request_id = %request_id,
            "Completion for unknown request, closing subscribers without storing"
        );
        self.hub.publish(request_id, OutboundEvent::Done);
        Outcome::Orphaned
    }
}

/// Metadata recorded with a completed message.
fn completion_metadata(request_id: &str, response: &FinalResponse) -> Map<String, Value> {
    let mut metadata = Map::new();
    metadata.insert("request_id".to_string(), json!(request_id));
    metadata.insert(
        "chat_session_id".to_string(),
        json!(response.chat_session_id.map(|id| id.to_string())),
    );
    metadata.insert("last_index".to_string(), json!(response.index));
    metadata.insert(
        "created_at".to_string(),
        json!(response.created_at.map(|at| at.to_rfc3339())),
    );
    if let Some(reason) = &response.finish_reason {
        metadata.insert("finish_reason".to_string(), json!(reason));
    }
    if let Some(error) = &response.error {
        metadata.insert("error".to_string(), json!(error));
    }
    metadata
}

fn panic_reason(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
