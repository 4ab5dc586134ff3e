//! Echo worker - stand-in for an LLM worker
//!
//! Consumes chat requests from the request stream and answers each one by
//! streaming the last user message back word by word, followed by a
//! completion carrying token usage and latency. Useful for exercising the
//! server end to end without a model.
//!
//! ## Configuration
//!
//! Shares `config/chatstream.toml` with the server, plus:
//! - `ECHO_WORKER_GROUP`: Consumer group (default: "llm-echo-workers")
//! - `ECHO_CHUNK_DELAY_MS`: Pause between chunks (default: 50)
//! - `RUST_LOG`: Logging level (default: "info")

use chrono::Utc;
use deadpool_redis::{Config, Runtime};
use futures::StreamExt;
use std::env;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use chatstream::config::ChatStreamConfig;
use chatstream::consumer::{BrokerMessage, RedisStreamSource};
use chatstream::event::{FinalResponse, LlmChatRequest, Role, StreamChunk, TokenUsage};
use chatstream::producer::{PublishError, RequestPublisher};
use chatstream::shutdown::ShutdownSignal;
use chatstream::ResilientConsumer;

const DEFAULT_GROUP: &str = "llm-echo-workers";

const DEFAULT_CHUNK_DELAY_MS: u64 = 50;

/// Split the last user message into word-sized deltas, keeping whitespace.
fn echo_deltas(request: &LlmChatRequest) -> Vec<String> {
    let prompt = request
        .messages
        .iter()
        .rev()
        .find(|message| message.role == Role::User)
        .map(|message| message.content.as_str())
        .unwrap_or_default();

    prompt.split_inclusive(' ').map(str::to_string).collect()
}

/// Rough token count: whitespace-separated words.
fn count_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

async fn answer(
    publisher: &RequestPublisher,
    request: &LlmChatRequest,
    chunk_delay: Duration,
) -> Result<(), PublishError> {
    let started = Instant::now();
    let deltas = echo_deltas(request);

    for (index, delta) in deltas.iter().enumerate() {
        let chunk = StreamChunk {
            request_id: Some(request.request_id.clone()),
            chat_session_id: Some(request.chat_session_id),
            index: index as u64,
            delta: delta.clone(),
            created_at: Some(Utc::now()),
        };
        publisher.send_stream_chunk(&request.request_id, &chunk).await?;

        if !chunk_delay.is_zero() {
            tokio::time::sleep(chunk_delay).await;
        }
    }

    let prompt_tokens = request
        .messages
        .iter()
        .map(|message| count_tokens(&message.content))
        .sum();
    let completion_tokens = deltas.iter().map(|delta| count_tokens(delta)).sum();

    let response = FinalResponse {
        request_id: Some(request.request_id.clone()),
        chat_session_id: Some(request.chat_session_id),
        usage: Some(TokenUsage {
            prompt_tokens,
            completion_tokens,
        }),
        latency_ms: Some(started.elapsed().as_millis() as u64),
        finish_reason: Some("stop".to_string()),
        created_at: Some(Utc::now()),
        ..Default::default()
    };
    publisher
        .send_chat_response(&request.request_id, &response)
        .await?;

    Ok(())
}

fn decode_request(message: &BrokerMessage) -> Option<LlmChatRequest> {
    match serde_json::from_slice::<LlmChatRequest>(&message.payload) {
        Ok(request) => Some(request),
        Err(e) => {
            warn!(id = %message.id, error = %e, "Skipping undecodable chat request");
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ChatStreamConfig::load()?;
    let worker_name = config.worker_name();
    let group = env::var("ECHO_WORKER_GROUP").unwrap_or_else(|_| DEFAULT_GROUP.to_string());
    let chunk_delay = Duration::from_millis(
        env::var("ECHO_CHUNK_DELAY_MS")
            .ok()
            .and_then(|value| value.parse().ok())
            .unwrap_or(DEFAULT_CHUNK_DELAY_MS),
    );

    info!(
        worker_name = %worker_name,
        consumer_group = %group,
        request_stream = %config.consumer.request_stream,
        "Echo worker starting"
    );

    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;
    let publisher = RequestPublisher::new(pool).with_streams(
        config.consumer.request_stream.clone(),
        config.consumer.token_stream.clone(),
    );

    let shutdown = ShutdownSignal::with_timeout(config.shutdown_timeout());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.wait().await });
    }

    let source = RedisStreamSource::new(
        config.redis.url.clone(),
        config.consumer.request_stream.clone(),
        group,
        worker_name,
    )
    .with_block_ms(config.consumer.block_ms)
    .with_batch_size(config.consumer.batch_size);
    let mut consumer = ResilientConsumer::new(source, shutdown.clone())
        .with_reconnect_delay(config.consumer.reconnect_delay());

    let mut answered: u64 = 0;
    let mut failed: u64 = 0;

    {
        let messages = consumer.consume();
        futures::pin_mut!(messages);

        while let Some(message) = messages.next().await {
            let Some(request) = decode_request(&message) else {
                continue;
            };

            debug!(request_id = %request.request_id, "Answering chat request");
            match answer(&publisher, &request, chunk_delay).await {
                Ok(()) => answered += 1,
                Err(e) => {
                    failed += 1;
                    error!(request_id = %request.request_id, error = %e, "Failed to answer chat request");
                }
            }

            if (answered + failed) % 100 == 0 {
                info!(answered, failed, "Echo worker statistics");
            }
        }
    }

    info!(answered, failed, "Echo worker stopped");
    Ok(())
}
