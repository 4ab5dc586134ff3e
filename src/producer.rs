//! Outbound publishing onto the broker.
//!
//! Every message is an `XADD` with a `key` field (the request id, used as the
//! ordering key) and a `value` field holding the JSON body, which is the
//! shape [`RedisStreamSource`](crate::consumer::RedisStreamSource) reads.

use deadpool_redis::redis::cmd;
use deadpool_redis::Pool;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error};

use crate::event::{FinalResponse, LlmChatRequest, StreamChunk};
use crate::{REQUEST_STREAM_NAME, TOKEN_STREAM_NAME};

/// Errors that can occur while publishing.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("Redis connection error: {0}")]
    ConnectionError(String),

    #[error("Redis command error: {0}")]
    RedisError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),
}

/// Fire-and-forget publisher for chat requests and stream events.
#[derive(Clone)]
pub struct RequestPublisher {
    pool: Pool,
    request_stream: String,
    token_stream: String,
}

impl RequestPublisher {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            request_stream: REQUEST_STREAM_NAME.to_string(),
            token_stream: TOKEN_STREAM_NAME.to_string(),
        }
    }

    pub fn with_streams(
        mut self,
        request_stream: impl Into<String>,
        token_stream: impl Into<String>,
    ) -> Self {
        self.request_stream = request_stream.into();
        self.token_stream = token_stream.into();
        self
    }

    /// Publish the originating request for the LLM workers.
    pub async fn send_chat_request(&self, request: &LlmChatRequest) -> Result<String, PublishError> {
        self.publish(&self.request_stream, &request.request_id, request)
            .await
    }

    /// Publish one streamed chunk.
    pub async fn send_stream_chunk(
        &self,
        request_id: &str,
        chunk: &StreamChunk,
    ) -> Result<String, PublishError> {
        self.publish(&self.token_stream, request_id, chunk).await
    }

    /// Publish the completion of a request.
    pub async fn send_chat_response(
        &self,
        request_id: &str,
        response: &FinalResponse,
    ) -> Result<String, PublishError> {
        self.publish(&self.token_stream, request_id, response).await
    }

    async fn publish<T: Serialize>(
        &self,
        stream: &str,
        key: &str,
        body: &T,
    ) -> Result<String, PublishError> {
        let value = serde_json::to_string(body)?;

        let mut conn = self.pool.get().await.map_err(|e| {
            error!(error = %e, "Failed to get Redis connection for publish");
            PublishError::ConnectionError(e.to_string())
        })?;

        let id: String = cmd("XADD")
            .arg(stream)
            .arg("*")
            .arg("key")
            .arg(key)
            .arg("value")
            .arg(&value)
            .query_async(&mut conn)
            .await
            .map_err(|e| {
                error!(error = %e, stream = %stream, "Failed to publish to stream");
                PublishError::RedisError(e.to_string())
            })?;

        debug!(id = %id, stream = %stream, key = %key, "Published message");
        Ok(id)
    }
}
