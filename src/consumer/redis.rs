//! Redis Streams implementation of [`MessageSource`].
//!
//! Reads a stream through a consumer group with blocking `XREADGROUP`,
//! acknowledging entries as soon as they are buffered locally. On connect
//! the group is created if needed and entries left pending by a previous
//! consumer are reclaimed with `XAUTOCLAIM`.
//!
//! Each entry is expected to carry two fields:
//!
//! - `key`: the ordering key (request id)
//! - `value`: the JSON payload

use async_trait::async_trait;
use deadpool_redis::redis::streams::{StreamId, StreamRangeReply, StreamReadOptions, StreamReadReply};
use deadpool_redis::redis::{self, cmd, AsyncCommands, RedisError, Value as RedisValue};
use deadpool_redis::{Config, Pool, PoolError, Runtime};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info, warn};

use super::{BrokerMessage, MessageSource, SourceError};

/// Idle time threshold for claiming pending messages (in milliseconds)
const PENDING_IDLE_THRESHOLD_MS: u64 = 30000;

/// Maximum number of pending messages claimed per connect
const PENDING_CLAIM_COUNT: usize = 100;

impl From<RedisError> for SourceError {
    fn from(e: RedisError) -> Self {
        if e.is_io_error() || e.is_connection_dropped() || e.is_connection_refusal() || e.is_timeout()
        {
            SourceError::Transient(e.to_string())
        } else {
            SourceError::Fatal(e.to_string())
        }
    }
}

impl From<PoolError> for SourceError {
    fn from(e: PoolError) -> Self {
        match e {
            PoolError::Backend(e) => e.into(),
            PoolError::Closed => SourceError::Transient("connection pool closed".to_string()),
            PoolError::Timeout(kind) => {
                SourceError::Transient(format!("timed out waiting for connection: {:?}", kind))
            }
            other => SourceError::Fatal(other.to_string()),
        }
    }
}

/// Consumer-group reader for a single Redis stream.
pub struct RedisStreamSource {
    url: String,
    stream: String,
    group: String,
    consumer_name: String,
    block_ms: usize,
    batch_size: usize,
    pool: Option<Pool>,
    /// Entries already acknowledged but not yet handed out; kept across reconnects.
    buffered: VecDeque<BrokerMessage>,
}

impl RedisStreamSource {
    pub fn new(
        url: impl Into<String>,
        stream: impl Into<String>,
        group: impl Into<String>,
        consumer_name: impl Into<String>,
    ) -> Self {
        Self {
            url: url.into(),
            stream: stream.into(),
            group: group.into(),
            consumer_name: consumer_name.into(),
            block_ms: 2000,
            batch_size: 10,
            pool: None,
            buffered: VecDeque::new(),
        }
    }

    /// How long a single `XREADGROUP` blocks waiting for entries.
    pub fn with_block_ms(mut self, block_ms: usize) -> Self {
        self.block_ms = block_ms;
        self
    }

    /// Maximum number of entries read per `XREADGROUP`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    fn pool(&self) -> Result<&Pool, SourceError> {
        self.pool
            .as_ref()
            .ok_or_else(|| SourceError::Transient("not connected".to_string()))
    }

    async fn ensure_group(&self, conn: &mut deadpool_redis::Connection) -> Result<(), SourceError> {
        // "$" starts new groups at the tail, so only events produced from now on are read.
        let result: Result<(), RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(&self.stream)
            .arg(&self.group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(conn)
            .await;

        match result {
            Ok(()) => {
                info!(stream = %self.stream, group = %self.group, "Created consumer group");
                Ok(())
            }
            Err(e) if e.to_string().contains("BUSYGROUP") => {
                debug!(stream = %self.stream, group = %self.group, "Consumer group already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Claim entries that another consumer read but never acknowledged.
    async fn claim_pending(&mut self, conn: &mut deadpool_redis::Connection) -> usize {
        let result: Result<Vec<RedisValue>, RedisError> = cmd("XAUTOCLAIM")
            .arg(&self.stream)
            .arg(&self.group)
            .arg(&self.consumer_name)
            .arg(PENDING_IDLE_THRESHOLD_MS)
            .arg("0-0")
            .arg("COUNT")
            .arg(PENDING_CLAIM_COUNT)
            .query_async(&mut *conn)
            .await;

        let claimed = match result {
            Ok(reply) => match reply.get(1).map(redis::from_redis_value::<StreamRangeReply>) {
                Some(Ok(range)) => range.ids,
                Some(Err(e)) => {
                    debug!(error = %e, "Unexpected XAUTOCLAIM reply, skipping pending recovery");
                    return 0;
                }
                None => return 0,
            },
            Err(e) => {
                // XAUTOCLAIM is unavailable before Redis 6.2
                debug!(error = %e, "XAUTOCLAIM failed, skipping pending recovery");
                return 0;
            }
        };

        let count = claimed.len();
        if count > 0 {
            self.buffer_entries(conn, claimed).await;
            info!(count = count, stream = %self.stream, "Claimed pending messages from previous consumers");
        }
        count
    }

    /// Convert, buffer and acknowledge a batch of entries.
    async fn buffer_entries(&mut self, conn: &mut deadpool_redis::Connection, entries: Vec<StreamId>) {
        if entries.is_empty() {
            return;
        }

        let ids: Vec<String> = entries.iter().map(|entry| entry.id.clone()).collect();
        for entry in entries {
            match parse_entry(&entry.id, &entry.map) {
                Some(message) => self.buffered.push_back(message),
                None => warn!(id = %entry.id, "Skipping stream entry without a value field"),
            }
        }

        let ack: Result<u64, RedisError> = conn.xack(&self.stream, &self.group, ids.as_slice()).await;
        if let Err(e) = ack {
            warn!(error = %e, count = ids.len(), "Failed to ACK messages");
        }
    }
}

#[async_trait]
impl MessageSource for RedisStreamSource {
    async fn connect(&mut self) -> Result<(), SourceError> {
        if self.pool.is_some() {
            return Ok(());
        }

        let pool = Config::from_url(self.url.clone())
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| SourceError::Fatal(format!("failed to create Redis pool: {}", e)))?;

        let mut conn = pool.get().await?;
        self.ensure_group(&mut conn).await?;
        self.claim_pending(&mut conn).await;
        drop(conn);

        info!(
            stream = %self.stream,
            group = %self.group,
            consumer = %self.consumer_name,
            "Subscribed to stream"
        );

        self.pool = Some(pool);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), SourceError> {
        if let Some(pool) = self.pool.take() {
            pool.close();
            debug!(stream = %self.stream, "Redis pool closed");
        }
        Ok(())
    }

    async fn next_message(&mut self) -> Result<BrokerMessage, SourceError> {
        loop {
            if let Some(message) = self.buffered.pop_front() {
                return Ok(message);
            }

            let mut conn = self.pool()?.get().await?;

            let opts = StreamReadOptions::default()
                .group(&self.group, &self.consumer_name)
                .block(self.block_ms)
                .count(self.batch_size);

            // Nil when the block timeout expires without new entries.
            let reply: Option<StreamReadReply> = conn
                .xread_options(&[&self.stream], &[">"], &opts)
                .await?;

            if let Some(reply) = reply {
                for stream_key in reply.keys {
                    self.buffer_entries(&mut conn, stream_key.ids).await;
                }
            }
        }
    }
}

/// Build a [`BrokerMessage`] from the fields of a stream entry.
pub fn parse_entry(id: &str, map: &HashMap<String, RedisValue>) -> Option<BrokerMessage> {
    let payload = get_bytes_field(map, "value")?;
    let key = get_bytes_field(map, "key")
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .filter(|key| !key.is_empty());

    Some(BrokerMessage::new(id, key, payload))
}

/// Extract the raw bytes of a field from Redis stream data.
fn get_bytes_field(map: &HashMap<String, RedisValue>, key: &str) -> Option<Vec<u8>> {
    map.get(key).and_then(|val| match val {
        RedisValue::BulkString(bytes) => Some(bytes.clone()),
        RedisValue::SimpleString(s) => Some(s.clone().into_bytes()),
        _ => None,
    })
}
