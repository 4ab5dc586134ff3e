//! End-to-end ingest: broker source -> consumer -> bridge -> hub + store.

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use chatstream::store::{StoreError, StoredMessage};
use chatstream::{
    BrokerMessage, IngestBridge, MessageSource, MessageStore, NewAssistantMessage, OutboundEvent,
    ResilientConsumer, SourceError, StreamHub,
};
use chatstream::shutdown::ShutdownSignal;

/// Source fed from a channel; `Err` items simulate broker failures.
struct ChannelSource {
    receiver: mpsc::UnboundedReceiver<Result<BrokerMessage, SourceError>>,
    connects: Arc<Mutex<usize>>,
}

#[async_trait]
impl MessageSource for ChannelSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        *self.connects.lock() += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SourceError> {
        Ok(())
    }

    async fn next_message(&mut self) -> Result<BrokerMessage, SourceError> {
        match self.receiver.recv().await {
            Some(item) => item,
            None => Err(SourceError::Closed),
        }
    }
}

#[derive(Default)]
struct MemoryStore {
    messages: Mutex<Vec<NewAssistantMessage>>,
}

#[async_trait]
impl MessageStore for MemoryStore {
    async fn create_assistant_message(
        &self,
        message: NewAssistantMessage,
    ) -> Result<StoredMessage, StoreError> {
        let stored = StoredMessage {
            id: "1-0".to_string(),
            session_id: message.session_id,
            role: message.role(),
            content: message.content.clone(),
            created_at: "2025-12-11T10:00:00Z".to_string(),
        };
        self.messages.lock().push(message);
        Ok(stored)
    }
}

fn token_message(n: usize, payload: serde_json::Value) -> Result<BrokerMessage, SourceError> {
    let key = payload["request_id"].as_str().map(str::to_string);
    Ok(BrokerMessage::new(format!("{}-0", n), key, payload.to_string()))
}

#[tokio::test(start_paused = true)]
async fn test_streams_answer_to_subscriber_and_store() {
    let hub = Arc::new(StreamHub::new());
    let store = Arc::new(MemoryStore::default());
    let bridge = IngestBridge::new(hub.clone(), store.clone());
    let shutdown = ShutdownSignal::new();

    let (sender, receiver) = mpsc::unbounded_channel();
    let connects = Arc::new(Mutex::new(0));
    let source = ChannelSource {
        receiver,
        connects: connects.clone(),
    };

    hub.register("r1", 5, 7);
    let subscription = hub.subscribe("r1");

    let ingest = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut consumer =
                ResilientConsumer::new(source, shutdown).with_reconnect_delay(Duration::from_secs(5));
            bridge.run(consumer.consume()).await;
            bridge.stats().snapshot()
        })
    };

    let events = [
        token_message(1, json!({"request_id": "r1", "chat_session_id": 5, "index": 0, "delta": "He"})),
        Err(SourceError::Transient("connection reset by peer".to_string())),
        token_message(2, json!({"request_id": "r1", "chat_session_id": 5, "index": 1, "delta": "llo"})),
        token_message(
            3,
            json!({
                "request_id": "r1",
                "chat_session_id": 5,
                "usage": {"prompt_tokens": 3, "completion_tokens": 2},
                "latency_ms": 120
            }),
        ),
    ];
    for event in events {
        sender.send(event).unwrap();
    }

    let received: Vec<OutboundEvent> = tokio::time::timeout(Duration::from_secs(30), subscription.collect())
        .await
        .expect("subscriber never saw done");

    assert_eq!(
        received,
        vec![
            OutboundEvent::Chunk {
                delta: "He".to_string(),
                index: 0
            },
            OutboundEvent::Chunk {
                delta: "llo".to_string(),
                index: 1
            },
            OutboundEvent::Final {
                content: "Hello".to_string()
            },
            OutboundEvent::Done,
        ]
    );

    let state = hub.get_state("r1").unwrap();
    assert!(state.is_done);
    assert_eq!(state.text, "Hello");
    assert_eq!(state.prompt_tokens, Some(3));

    {
        let stored = store.messages.lock();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].content, "Hello");
        assert_eq!(stored[0].latency_ms, Some(120));
    }

    // Closing the broker side ends the consumer stream.
    drop(sender);
    let stats = ingest.await.unwrap();
    assert_eq!(stats.processed, 3);
    assert_eq!(stats.completions, 1);
    assert_eq!(*connects.lock(), 2);
}

#[tokio::test]
async fn test_late_subscriber_gets_done_only() {
    let hub = Arc::new(StreamHub::new());
    let store = Arc::new(MemoryStore::default());
    let bridge = IngestBridge::new(hub.clone(), store);

    hub.register("r2", 9, 1);
    let messages = futures::stream::iter(vec![
        BrokerMessage::new("1-0", Some("r2".to_string()), json!({"request_id": "r2", "index": 0, "delta": "x"}).to_string()),
        BrokerMessage::new("2-0", Some("r2".to_string()), json!({"request_id": "r2"}).to_string()),
    ]);
    bridge.run(messages).await;

    let received: Vec<OutboundEvent> = hub.subscribe("r2").collect().await;
    assert_eq!(received, vec![OutboundEvent::Done]);
}
