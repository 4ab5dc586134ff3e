//! Resilient broker consumption.
//!
//! A [`MessageSource`] is a plain broker subscription: connect, read the next
//! message, disconnect. [`ResilientConsumer`] holds one and turns it into a
//! single long-lived stream that survives transient broker failures.
//!
//! # Failure handling
//!
//! ```text
//! next_message()
//!     │
//!     ├─ Ok(msg)           -> yield
//!     ├─ Transient error   -> stop, sleep reconnect delay, start, continue
//!     ├─ Closed            -> stop, end of stream
//!     └─ Fatal error       -> stop, end of stream
//!
//! shutdown signal          -> stop, end of stream
//! ```
//!
//! Transient errors are retried forever at a fixed interval. A fatal end is
//! final for that consumer instance; the caller decides whether to build a
//! new one.

pub mod redis;

use async_stream::stream;
use async_trait::async_trait;
use futures::Stream;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::shutdown::ShutdownSignal;

pub use self::redis::RedisStreamSource;

/// Default delay between reconnect attempts.
pub const DEFAULT_RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A raw message read from the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// Broker-assigned entry id (e.g. a Redis stream id "1234567890123-0")
    pub id: String,

    /// Partition / ordering key; the request id for token events
    pub key: Option<String>,

    /// Undecoded JSON payload
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn new(id: impl Into<String>, key: Option<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            key,
            payload: payload.into(),
        }
    }
}

/// Errors reported by a [`MessageSource`].
#[derive(Debug, Error)]
pub enum SourceError {
    /// Network or connectivity failure; worth reconnecting
    #[error("transient broker error: {0}")]
    Transient(String),

    /// Anything not known to be recoverable
    #[error("broker error: {0}")]
    Fatal(String),

    /// The underlying subscription has ended
    #[error("subscription closed")]
    Closed,
}

impl SourceError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SourceError::Transient(_))
    }
}

/// A plain broker subscription without any retry behaviour.
#[async_trait]
pub trait MessageSource: Send {
    /// Establish the connection and subscription.
    async fn connect(&mut self) -> Result<(), SourceError>;

    /// Tear the connection down.
    async fn disconnect(&mut self) -> Result<(), SourceError>;

    /// Wait for the next message.
    async fn next_message(&mut self) -> Result<BrokerMessage, SourceError>;
}

/// Wraps a [`MessageSource`] with reconnect logic.
pub struct ResilientConsumer<S> {
    source: S,
    running: bool,
    reconnect_delay: Duration,
    shutdown: ShutdownSignal,
}

impl<S: MessageSource> ResilientConsumer<S> {
    pub fn new(source: S, shutdown: ShutdownSignal) -> Self {
        Self {
            source,
            running: false,
            reconnect_delay: DEFAULT_RECONNECT_DELAY,
            shutdown,
        }
    }

    /// Set the fixed delay used between reconnect attempts.
    pub fn with_reconnect_delay(mut self, delay: Duration) -> Self {
        self.reconnect_delay = delay;
        self
    }

    pub fn reconnect_delay(&self) -> Duration {
        self.reconnect_delay
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    /// Connect the source if it is not already running.
    pub async fn start(&mut self) -> Result<(), SourceError> {
        if !self.running {
            self.source.connect().await?;
            self.running = true;
            info!("Consumer started");
        }
        Ok(())
    }

    /// Disconnect the source. Safe to call in any state.
    pub async fn stop(&mut self) {
        if self.running {
            if let Err(e) = self.source.disconnect().await {
                warn!(error = %e, "Error while disconnecting consumer");
            }
            self.running = false;
            info!("Consumer stopped");
        }
    }

    /// A lazy, logically infinite stream of broker messages.
    ///
    /// The stream starts the consumer on first poll and stops it when it ends
    /// on its own: source closed, fatal error, or the shutdown signal. Only
    /// the shutdown signal cancels cleanly. Dropping the stream early (a
    /// timeout, `take(n)`, an aborted task) leaves the source connected; the
    /// next `consume` call keeps reading from it and [`stop`](Self::stop)
    /// disconnects it. Calling `consume` again after the stream ended starts
    /// over.
    pub fn consume(&mut self) -> impl Stream<Item = BrokerMessage> + Send + '_ {
        stream! {
            let shutdown = self.shutdown.clone();

            loop {
                if shutdown.is_shutdown() {
                    info!("Consumer cancelled - stopping");
                    break;
                }

                if !self.running {
                    match self.start().await {
                        Ok(()) => {}
                        Err(e) if e.is_transient() => {
                            error!(
                                error = %e,
                                retry_in_ms = self.reconnect_delay.as_millis() as u64,
                                "Failed to start consumer, retrying"
                            );
                            if !backoff(&shutdown, self.reconnect_delay).await {
                                info!("Consumer cancelled during backoff - stopping");
                                break;
                            }
                            continue;
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to start consumer - abort");
                            break;
                        }
                    }
                }

                let next = tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => {
                        info!("Consumer cancelled - stopping");
                        break;
                    }
                    next = self.source.next_message() => next,
                };

                match next {
                    Ok(message) => {
                        debug!(id = %message.id, key = ?message.key, "Message received");
                        yield message;
                    }
                    Err(SourceError::Closed) => {
                        warn!("Underlying subscription finished - breaking loop");
                        break;
                    }
                    Err(e) if e.is_transient() => {
                        error!(
                            error = %e,
                            retry_in_ms = self.reconnect_delay.as_millis() as u64,
                            "Broker error, restarting consumer"
                        );
                        self.stop().await;
                        if !backoff(&shutdown, self.reconnect_delay).await {
                            info!("Consumer cancelled during backoff - stopping");
                            break;
                        }
                        // Restart happens at the top of the loop so failed
                        // restarts are retried with the same delay.
                        continue;
                    }
                    Err(e) => {
                        error!(error = %e, "Unexpected consumer error - abort");
                        break;
                    }
                }
            }

            self.stop().await;
        }
    }
}

/// Sleep for the reconnect delay. Returns `false` if shutdown fired first.
async fn backoff(shutdown: &ShutdownSignal, delay: Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted in-memory source used by unit tests.

    use super::*;
    use parking_lot::Mutex;
    use std::collections::VecDeque;
    use std::sync::Arc;

    /// One scripted outcome of `next_message`.
    pub enum Step {
        Message(BrokerMessage),
        Fail(SourceError),
    }

    #[derive(Default)]
    pub struct Calls {
        pub connects: usize,
        pub disconnects: usize,
        pub connect_times: Vec<tokio::time::Instant>,
    }

    /// Plays back a script; once exhausted it either closes or pends forever.
    pub struct ScriptedSource {
        pub steps: VecDeque<Step>,
        pub connect_failures: VecDeque<SourceError>,
        pub pend_when_exhausted: bool,
        pub calls: Arc<Mutex<Calls>>,
    }

    impl ScriptedSource {
        pub fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                connect_failures: VecDeque::new(),
                pend_when_exhausted: false,
                calls: Arc::new(Mutex::new(Calls::default())),
            }
        }
    }

    #[async_trait]
    impl MessageSource for ScriptedSource {
        async fn connect(&mut self) -> Result<(), SourceError> {
            let mut calls = self.calls.lock();
            calls.connects += 1;
            calls.connect_times.push(tokio::time::Instant::now());
            match self.connect_failures.pop_front() {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }

        async fn disconnect(&mut self) -> Result<(), SourceError> {
            self.calls.lock().disconnects += 1;
            Ok(())
        }

        async fn next_message(&mut self) -> Result<BrokerMessage, SourceError> {
            match self.steps.pop_front() {
                Some(Step::Message(message)) => Ok(message),
                Some(Step::Fail(e)) => Err(e),
                None if self.pend_when_exhausted => std::future::pending().await,
                None => Err(SourceError::Closed),
            }
        }
    }

    pub fn message(n: usize) -> Step {
        Step::Message(BrokerMessage::new(
            format!("{}-0", n),
            Some("r1".to_string()),
            format!("{{\"n\": {}}}", n),
        ))
    }

    pub fn connectivity_error() -> Step {
        Step::Fail(SourceError::Transient("connection reset by peer".to_string()))
    }
}
