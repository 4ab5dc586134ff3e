//! Correlation hub.
//!
//! The [`StreamHub`] maps a request id to its accumulated [`StreamState`] and
//! to the live subscribers watching it. The ingest bridge writes to it; HTTP
//! stream handlers read from it.
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────── StreamHub ────────────────┐
//! register ──────────> │ states:      request_id -> StreamState    │
//! append_text ───────> │                                           │
//! publish ───────────> │ subscribers: request_id -> [mpsc::Sender] │ ──> Subscription (SSE)
//! mark_done ─────────> │                                           │ ──> Subscription (SSE)
//!                      └───────────────────────────────────────────┘
//! ```
//!
//! Both maps sit behind one mutex. Nothing awaits while it is held: queue
//! insertion uses `try_send`, so a slow subscriber loses events instead of
//! stalling the publisher.
//!
//! States are never evicted automatically; [`StreamHub::remove`] exists for
//! callers that want explicit cleanup.

use futures::Stream;
use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::event::OutboundEvent;

/// Default queue capacity of a subscriber channel.
pub const DEFAULT_SUBSCRIBER_CAPACITY: usize = 200;

/// Accumulated state of one in-flight or completed request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamState {
    pub request_id: String,
    pub session_id: i64,
    pub user_id: i64,

    /// Concatenated deltas, in arrival order
    pub text: String,

    pub prompt_tokens: Option<u32>,
    pub completion_tokens: Option<u32>,
    pub latency_ms: Option<u64>,

    pub metadata: Map<String, Value>,
    pub is_done: bool,
}

impl StreamState {
    fn new(request_id: &str, session_id: i64, user_id: i64) -> Self {
        Self {
            request_id: request_id.to_string(),
            session_id,
            user_id,
            text: String::new(),
            prompt_tokens: None,
            completion_tokens: None,
            latency_ms: None,
            metadata: Map::new(),
            is_done: false,
        }
    }
}

struct Subscriber {
    id: u64,
    sender: mpsc::Sender<OutboundEvent>,
}

#[derive(Default)]
struct HubInner {
    states: HashMap<String, StreamState>,
    subscribers: HashMap<String, Vec<Subscriber>>,
}

impl HubInner {
    /// Offer an event to every subscriber of `request_id` without blocking.
    fn publish(&mut self, request_id: &str, event: OutboundEvent) -> usize {
        let Some(subscribers) = self.subscribers.get(request_id) else {
            return 0;
        };

        let mut delivered = 0;
        for subscriber in subscribers {
            match subscriber.sender.try_send(event.clone()) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(
                        request_id = %request_id,
                        subscriber = subscriber.id,
                        event = event.kind(),
                        "Subscriber queue full, dropping event"
                    );
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(
                        request_id = %request_id,
                        subscriber = subscriber.id,
                        "Subscriber gone, skipping"
                    );
                }
            }
        }

        // Nothing may follow `Done`. Dropping the senders also ends any
        // subscriber whose queue had no room for it.
        if event.is_terminal() {
            self.subscribers.remove(request_id);
        }

        delivered
    }
}

/// Process-wide registry of stream state and live subscribers.
///
/// Construct once and share through `Arc`.
pub struct StreamHub {
    inner: Mutex<HubInner>,
    capacity: usize,
    next_subscriber_id: AtomicU64,
}

impl StreamHub {
    /// Create a hub with the default subscriber capacity (200).
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_SUBSCRIBER_CAPACITY)
    }

    /// Create a hub whose subscriber queues hold `capacity` events.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            capacity: capacity.max(1),
            next_subscriber_id: AtomicU64::new(0),
        }
    }

    /// Create (or replace) the state for a request before it is sent.
    pub fn register(&self, request_id: &str, session_id: i64, user_id: i64) {
        let mut inner = self.inner.lock();
        let previous = inner.states.insert(
            request_id.to_string(),
            StreamState::new(request_id, session_id, user_id),
        );
        if previous.is_some() {
            warn!(request_id = %request_id, "Replacing existing stream state");
        }
        debug!(request_id = %request_id, session_id, user_id, "Registered stream");
    }

    /// Snapshot of the state for `request_id`.
    pub fn get_state(&self, request_id: &str) -> Option<StreamState> {
        self.inner.lock().states.get(request_id).cloned()
    }

    /// Append a delta to the accumulated text.
    ///
    /// Returns `false` when the request is unknown or already completed.
    pub fn append_text(&self, request_id: &str, delta: &str) -> bool {
        let mut inner = self.inner.lock();
        match inner.states.get_mut(request_id) {
            Some(state) if !state.is_done => {
                state.text.push_str(delta);
                true
            }
            Some(_) => {
                debug!(request_id = %request_id, "Ignoring text for completed stream");
                false
            }
            None => false,
        }
    }

    /// Run `f` against the state for `request_id` while holding the lock.
    pub fn update_state<R>(&self, request_id: &str, f: impl FnOnce(&mut StreamState) -> R) -> Option<R> {
        self.inner.lock().states.get_mut(request_id).map(f)
    }

    /// Attach a new live subscriber.
    ///
    /// The subscriber is registered immediately and receives every event
    /// published from now on, ending with `Done`. A request that has already
    /// completed yields `Done` straight away.
    pub fn subscribe(self: &Arc<Self>, request_id: &str) -> Subscription {
        let id = self.next_subscriber_id.fetch_add(1, Ordering::Relaxed);
        let (sender, receiver) = mpsc::channel(self.capacity);

        let mut inner = self.inner.lock();
        let already_done = inner
            .states
            .get(request_id)
            .is_some_and(|state| state.is_done);

        if already_done {
            // The sender is dropped here, after queueing the terminal event.
            let _ = sender.try_send(OutboundEvent::Done);
        } else {
            inner
                .subscribers
                .entry(request_id.to_string())
                .or_default()
                .push(Subscriber { id, sender });
        }
        drop(inner);

        debug!(request_id = %request_id, subscriber = id, already_done, "Subscriber attached");

        Subscription {
            hub: Arc::clone(self),
            request_id: request_id.to_string(),
            id,
            receiver,
            finished: false,
            detached: already_done,
        }
    }

    /// Broadcast an event to every current subscriber of `request_id`.
    ///
    /// Returns how many subscribers accepted it.
    pub fn publish(&self, request_id: &str, event: OutboundEvent) -> usize {
        self.inner.lock().publish(request_id, event)
    }

    /// Mark the request completed and send `Done` to its subscribers.
    pub fn mark_done(&self, request_id: &str) -> usize {
        let mut inner = self.inner.lock();
        if let Some(state) = inner.states.get_mut(request_id) {
            state.is_done = true;
        }
        inner.publish(request_id, OutboundEvent::Done)
    }

    /// Drop the state for `request_id`. Subscribers are left untouched.
    pub fn remove(&self, request_id: &str) -> Option<StreamState> {
        self.inner.lock().states.remove(request_id)
    }

    /// Number of tracked states.
    pub fn len(&self) -> usize {
        self.inner.lock().states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of live subscribers for `request_id`.
    pub fn subscriber_count(&self, request_id: &str) -> usize {
        self.inner
            .lock()
            .subscribers
            .get(request_id)
            .map_or(0, Vec::len)
    }

    /// Number of live subscribers across all requests.
    pub fn total_subscribers(&self) -> usize {
        self.inner.lock().subscribers.values().map(Vec::len).sum()
    }

    /// Send `Done` to every remaining subscriber and detach them all.
    pub fn shutdown(&self) -> usize {
        let mut inner = self.inner.lock();
        let request_ids: Vec<String> = inner.subscribers.keys().cloned().collect();

        let mut detached = 0;
        for request_id in request_ids {
            detached += inner.subscribers.get(&request_id).map_or(0, Vec::len);
            inner.publish(&request_id, OutboundEvent::Done);
        }

        info!(detached = detached, "Stream hub shut down");
        detached
    }

    fn detach(&self, request_id: &str, id: u64) {
        let mut inner = self.inner.lock();
        if let Some(subscribers) = inner.subscribers.get_mut(request_id) {
            subscribers.retain(|subscriber| subscriber.id != id);
            if subscribers.is_empty() {
                inner.subscribers.remove(request_id);
            }
        }
    }
}

impl Default for StreamHub {
    fn default() -> Self {
        Self::new()
    }
}

/// A live view of one request's events.
///
/// Yields events until `Done` (inclusive). The channel is detached from the
/// hub when the subscription finishes or is dropped, whichever comes first.
/// If the hub drops the channel before `Done` could be queued, a `Done` is
/// still yielded as the last event.
pub struct Subscription {
    hub: Arc<StreamHub>,
    request_id: String,
    id: u64,
    receiver: mpsc::Receiver<OutboundEvent>,
    finished: bool,
    detached: bool,
}

impl Subscription {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    fn detach(&mut self) {
        if !self.detached {
            self.detached = true;
            self.hub.detach(&self.request_id, self.id);
            debug!(request_id = %self.request_id, subscriber = self.id, "Subscriber detached");
        }
    }
}

impl Stream for Subscription {
    type Item = OutboundEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.finished {
            return Poll::Ready(None);
        }

        match this.receiver.poll_recv(cx) {
            Poll::Ready(Some(event)) => {
                if event.is_terminal() {
                    this.finished = true;
                    this.detach();
                }
                Poll::Ready(Some(event))
            }
            Poll::Ready(None) => {
                this.finished = true;
                this.detach();
                Poll::Ready(Some(OutboundEvent::Done))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::time::Duration;

    fn chunk(delta: &str, index: u64) -> OutboundEvent {
        OutboundEvent::Chunk {
            delta: delta.to_string(),
            index,
        }
    }

    async fn drain(subscription: Subscription) -> Vec<OutboundEvent> {
        tokio::time::timeout(Duration::from_secs(1), subscription.collect())
            .await
            .expect("subscription did not terminate")
    }

    #[test]
    fn test_register_creates_fresh_state() {
        let hub = StreamHub::new();
        hub.register("r1", 5, 7);

        let state = hub.get_state("r1").unwrap();
        assert_eq!(state.text, "");
        assert_eq!(state.session_id, 5);
        assert_eq!(state.user_id, 7);
        assert!(!state.is_done);
        assert!(state.prompt_tokens.is_none());
        assert!(state.metadata.is_empty());
    }

    #[test]
    fn test_register_replaces_state() {
        let hub = StreamHub::new();
        hub.register("r1", 5, 7);
        hub.append_text("r1", "old");
        hub.register("r1", 6, 8);

        let state = hub.get_state("r1").unwrap();
        assert_eq!(state.text, "");
        assert_eq!(state.session_id, 6);
        assert_eq!(hub.len(), 1);
    }

    #[test]
    fn test_append_text_concatenates_in_order() {
        let hub = StreamHub::new();
        hub.register("r1", 1, 1);

        for delta in ["The ", "quick ", "brown ", "fox"] {
            assert!(hub.append_text("r1", delta));
        }
        assert_eq!(hub.get_state("r1").unwrap().text, "The quick brown fox");
    }

    #[test]
    fn test_append_text_unknown_or_done() {
        let hub = StreamHub::new();
        assert!(!hub.append_text("missing", "x"));
        assert!(hub.get_state("missing").is_none());

        hub.register("r1", 1, 1);
        hub.append_text("r1", "a");
        hub.mark_done("r1");
        assert!(!hub.append_text("r1", "b"));
        assert_eq!(hub.get_state("r1").unwrap().text, "a");
    }

    #[test]
    fn test_publish_without_subscribers() {
        let hub = StreamHub::new();
        assert_eq!(hub.publish("nobody", chunk("x", 0)), 0);
        assert_eq!(hub.publish("nobody", OutboundEvent::Done), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_events_then_done() {
        let hub = Arc::new(StreamHub::new());
        hub.register("r1", 5, 7);
        let subscription = hub.subscribe("r1");

        assert_eq!(hub.publish("r1", chunk("He", 0)), 1);
        hub.publish("r1", chunk("llo", 1));
        hub.publish(
            "r1",
            OutboundEvent::Final {
                content: "Hello".to_string(),
            },
        );
        hub.mark_done("r1");

        let events = drain(subscription).await;
        assert_eq!(
            events,
            vec![
                chunk("He", 0),
                chunk("llo", 1),
                OutboundEvent::Final {
                    content: "Hello".to_string()
                },
                OutboundEvent::Done,
            ]
        );
        assert!(hub.get_state("r1").unwrap().is_done);
        assert_eq!(hub.subscriber_count("r1"), 0);
    }

    #[tokio::test]
    async fn test_multiple_subscribers_each_get_a_copy() {
        let hub = Arc::new(StreamHub::new());
        hub.register("r1", 1, 1);
        let first = hub.subscribe("r1");
        let second = hub.subscribe("r1");
        assert_eq!(hub.subscriber_count("r1"), 2);

        assert_eq!(hub.publish("r1", chunk("a", 0)), 2);
        hub.mark_done("r1");

        assert_eq!(drain(first).await, vec![chunk("a", 0), OutboundEvent::Done]);
        assert_eq!(drain(second).await, vec![chunk("a", 0), OutboundEvent::Done]);
    }

    #[tokio::test]
    async fn test_no_replay_for_late_subscriber() {
        let hub = Arc::new(StreamHub::new());
        hub.register("r1", 1, 1);
        hub.publish("r1", chunk("early", 0));

        let late = hub.subscribe("r1");
        hub.publish("r1", chunk("late", 1));
        hub.mark_done("r1");

        assert_eq!(drain(late).await, vec![chunk("late", 1), OutboundEvent::Done]);
    }

    #[tokio::test]
    async fn test_full_queue_drops_only_for_that_subscriber() {
        let hub = Arc::new(StreamHub::with_capacity(1));
        hub.register("r1", 1, 1);
        let mut slow = hub.subscribe("r1");
        let mut fast = hub.subscribe("r1");

        assert_eq!(hub.publish("r1", chunk("a", 0)), 2);
        assert_eq!(fast.next().await, Some(chunk("a", 0)));

        // `slow` still holds "a", so "b" only reaches `fast`.
        assert_eq!(hub.publish("r1", chunk("b", 1)), 1);
        assert_eq!(fast.next().await, Some(chunk("b", 1)));
        assert_eq!(slow.next().await, Some(chunk("a", 0)));
    }

    #[tokio::test]
    async fn test_done_still_terminates_full_subscriber() {
        let hub = Arc::new(StreamHub::with_capacity(1));
        hub.register("r1", 1, 1);
        let subscription = hub.subscribe("r1");

        hub.publish("r1", chunk("a", 0));
        // No room left for Done; the subscriber must still end with exactly one.
        assert_eq!(hub.mark_done("r1"), 0);

        assert_eq!(
            drain(subscription).await,
            vec![chunk("a", 0), OutboundEvent::Done]
        );
    }

    #[tokio::test]
    async fn test_orphan_done_reaches_attached_subscriber() {
        let hub = Arc::new(StreamHub::new());
        let subscription = hub.subscribe("ghost");

        hub.publish("ghost", OutboundEvent::Done);

        assert_eq!(drain(subscription).await, vec![OutboundEvent::Done]);
        assert!(hub.get_state("ghost").is_none());
    }

    #[tokio::test]
    async fn test_nothing_after_done() {
        let hub = Arc::new(StreamHub::new());
        hub.register("r1", 1, 1);
        let subscription = hub.subscribe("r1");

        hub.mark_done("r1");
        // Replayed chunk after completion
        assert_eq!(hub.publish("r1", chunk("late", 9)), 0);

        assert_eq!(drain(subscription).await, vec![OutboundEvent::Done]);
    }

    #[tokio::test]
    async fn test_subscribe_after_completion_gets_done() {
        let hub = Arc::new(StreamHub::new());
        hub.register("r1", 1, 1);
        hub.mark_done("r1");

        let subscription = hub.subscribe("r1");
        assert_eq!(hub.subscriber_count("r1"), 0);
        assert_eq!(drain(subscription).await, vec![OutboundEvent::Done]);
    }

    #[tokio::test]
    async fn test_drop_detaches_and_removes_entry() {
        let hub = Arc::new(StreamHub::new());
        hub.register("r1", 1, 1);

        let first = hub.subscribe("r1");
        let second = hub.subscribe("r1");
        assert_eq!(hub.subscriber_count("r1"), 2);

        drop(first);
        assert_eq!(hub.subscriber_count("r1"), 1);
        drop(second);
        assert_eq!(hub.subscriber_count("r1"), 0);
        assert_eq!(hub.total_subscribers(), 0);

        // State is untouched by subscriber cleanup.
        assert!(hub.get_state("r1").is_some());
    }

    #[tokio::test]
    async fn test_cancelled_subscriber_task_detaches() {
        let hub = Arc::new(StreamHub::new());
        hub.register("r1", 1, 1);

        let task_hub = hub.clone();
        let task = tokio::spawn(async move {
            let mut subscription = task_hub.subscribe("r1");
            while subscription.next().await.is_some() {}
        });

        while hub.subscriber_count("r1") == 0 {
            tokio::task::yield_now().await;
        }
        task.abort();
        let _ = task.await;

        assert_eq!(hub.subscriber_count("r1"), 0);
    }

    #[tokio::test]
    async fn test_shutdown_detaches_everyone() {
        let hub = Arc::new(StreamHub::new());
        hub.register("r1", 1, 1);
        hub.register("r2", 1, 1);
        let a = hub.subscribe("r1");
        let b = hub.subscribe("r2");

        assert_eq!(hub.shutdown(), 2);
        assert_eq!(hub.total_subscribers(), 0);
        assert_eq!(drain(a).await, vec![OutboundEvent::Done]);
        assert_eq!(drain(b).await, vec![OutboundEvent::Done]);
    }

    #[test]
    fn test_update_and_remove() {
        let hub = StreamHub::new();
        hub.register("r1", 1, 1);

        let updated = hub.update_state("r1", |state| {
            state.latency_ms = Some(120);
            state.latency_ms
        });
        assert_eq!(updated, Some(Some(120)));
        assert!(hub.update_state("missing", |_| ()).is_none());

        let removed = hub.remove("r1").unwrap();
        assert_eq!(removed.latency_ms, Some(120));
        assert!(hub.is_empty());
    }
}
