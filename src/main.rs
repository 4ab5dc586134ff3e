//! chatstream server
//!
//! Accepts chat requests over HTTP, publishes them for the LLM workers and
//! streams the answers back to clients with Server-Sent Events. The ingest
//! consumer runs in the same process and feeds the shared hub.
//!
//! ## Configuration
//!
//! `config/chatstream.toml` (or `CHATSTREAM_CONFIG`), overridden by:
//! - `REDIS_URL`: Redis connection string
//! - `PORT`: HTTP listen port (default: 8000)
//! - `CHATSTREAM_API_KEY`: Bearer key required on `/api` routes
//! - `CHATSTREAM_WORKER_NAME`: Consumer name (default: hostname or UUID)
//! - `RUST_LOG`: Logging level (default: "info")

use axum::{
    extract::{Path, Query, Request, State},
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        Json, Response,
    },
    routing::{get, post},
    Router,
};
use deadpool_redis::redis::cmd;
use deadpool_redis::{Config, Pool, Runtime};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use chatstream::bridge::BridgeStats;
use chatstream::config::ChatStreamConfig;
use chatstream::consumer::RedisStreamSource;
use chatstream::event::{LlmChatRequest, LlmMessage};
use chatstream::producer::RequestPublisher;
use chatstream::shutdown::ShutdownSignal;
use chatstream::store::RedisMessageStore;
use chatstream::{IngestBridge, StreamHub, StreamState};

/// Server metrics
struct Metrics {
    requests_accepted: AtomicU64,
    requests_failed: AtomicU64,
    streams_opened: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    fn new() -> Self {
        Self {
            requests_accepted: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            streams_opened: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

struct AppState {
    redis_pool: Pool,
    api_key: Option<String>,
    hub: Arc<StreamHub>,
    publisher: RequestPublisher,
    store: Arc<RedisMessageStore>,
    ingest_stats: Arc<BridgeStats>,
    metrics: Metrics,
}

/// Body of `POST /api/v1/chat/requests`.
#[derive(Debug, Deserialize)]
struct CreateChatRequest {
    chat_session_id: i64,
    user_id: i64,
    /// Conversation so far, ending with the user's message
    messages: Vec<LlmMessage>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
}

/// Query of `GET /api/v1/chat/sessions/{session_id}/messages`.
#[derive(Debug, Default, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

impl HistoryQuery {
    fn limit(&self) -> usize {
        self.limit
            .unwrap_or(DEFAULT_HISTORY_LIMIT)
            .clamp(1, MAX_HISTORY_LIMIT)
    }
}

#[derive(Debug, Serialize)]
struct ChatRequestAccepted {
    request_id: String,
    status: &'static str,
    stream_url: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = ChatStreamConfig::load()?;
    let worker_name = config.worker_name();

    info!(
        port = config.server.port,
        token_stream = %config.consumer.token_stream,
        request_stream = %config.consumer.request_stream,
        consumer_group = %config.consumer.group,
        consumer = %worker_name,
        "Starting chatstream"
    );

    if config.server.api_key.is_none() {
        warn!("CHATSTREAM_API_KEY not set, API routes are unauthenticated. DO NOT USE IN PRODUCTION.");
    }

    let pool = Config::from_url(config.redis.url.clone()).create_pool(Some(Runtime::Tokio1))?;

    let hub = Arc::new(StreamHub::with_capacity(config.hub.subscriber_capacity));
    let store = Arc::new(
        RedisMessageStore::new(pool.clone())
            .with_prefix(config.store.stream_prefix.clone())
            .with_max_len(config.store.max_len),
    );
    let publisher = RequestPublisher::new(pool.clone()).with_streams(
        config.consumer.request_stream.clone(),
        config.consumer.token_stream.clone(),
    );

    let shutdown = ShutdownSignal::with_timeout(config.shutdown_timeout());
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.wait().await });
    }

    // Ingest: token stream -> hub + store
    let bridge = IngestBridge::new(hub.clone(), store.clone());
    let ingest_stats = bridge.stats();
    let ingest = {
        let consumer = config.consumer.clone();
        let redis_url = config.redis.url.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let reconnect_delay = consumer.reconnect_delay();
            bridge
                .supervise(
                    || {
                        RedisStreamSource::new(
                            redis_url.clone(),
                            consumer.token_stream.clone(),
                            consumer.group.clone(),
                            worker_name.clone(),
                        )
                        .with_block_ms(consumer.block_ms)
                        .with_batch_size(consumer.batch_size)
                    },
                    shutdown,
                    reconnect_delay,
                )
                .await;
        })
    };

    let app_state = Arc::new(AppState {
        redis_pool: pool,
        api_key: config.server.api_key.clone(),
        hub: hub.clone(),
        publisher,
        store,
        ingest_stats,
        metrics: Metrics::new(),
    });

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/api/v1/chat/requests", post(create_chat_request))
        .route("/api/v1/chat/requests/{request_id}", get(get_request_state))
        .route("/api/v1/chat/stream/{request_id}", get(stream_request))
        .route("/api/v1/chat/sessions/{session_id}/messages", get(list_session_messages))
        .layer(middleware::from_fn_with_state(app_state.clone(), auth_middleware))
        .with_state(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("chatstream listening on {}", addr);

    {
        let shutdown = shutdown.clone();
        let hub = hub.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                // Open SSE responses only finish once their subscription ends.
                let detached = hub.shutdown();
                info!(detached, "Closing live streams");
            })
            .await?;
    }

    info!("HTTP server stopped, waiting for ingest to finish");

    match tokio::time::timeout(shutdown.timeout(), ingest).await {
        Ok(Ok(())) => info!("Ingest stopped cleanly"),
        Ok(Err(e)) => error!(error = %e, "Ingest task failed"),
        Err(_) => warn!(
            timeout_secs = shutdown.timeout().as_secs(),
            "Ingest did not stop within the shutdown timeout"
        ),
    }

    info!(tracked_requests = hub.len(), "chatstream stopped");
    Ok(())
}

async fn auth_middleware(
    State(state): State<Arc<AppState>>,
    req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let Some(api_key) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    // Skip auth for health check and metrics
    let path = req.uri().path();
    if path == "/health" || path == "/metrics" {
        return Ok(next.run(req).await);
    }

    let auth_header = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|header| header.to_str().ok());

    match auth_header.and_then(|value| value.strip_prefix("Bearer ")) {
        Some(token) if token == api_key => Ok(next.run(req).await),
        Some(_) => {
            warn!("Invalid API Key attempt");
            Err(StatusCode::UNAUTHORIZED)
        }
        None => {
            warn!("Missing or malformed Authorization header");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> Result<Json<Value>, StatusCode> {
    let mut conn = state.redis_pool.get().await.map_err(|e| {
        error!("Failed to get Redis connection: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let _: String = cmd("PING").query_async(&mut conn).await.map_err(|e| {
        error!("Redis PING failed: {}", e);
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    Ok(Json(json!({ "status": "ok", "redis": "connected" })))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();

    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": uptime_str,
        "requests": {
            "accepted": state.metrics.requests_accepted.load(Ordering::Relaxed),
            "failed": state.metrics.requests_failed.load(Ordering::Relaxed),
        },
        "streams": {
            "opened": state.metrics.streams_opened.load(Ordering::Relaxed),
            "tracked": state.hub.len(),
            "subscribers": state.hub.total_subscribers(),
        },
        "ingest": state.ingest_stats.snapshot(),
        "status": "running"
    }))
}

async fn create_chat_request(
    State(state): State<Arc<AppState>>,
    Json(body): Json<CreateChatRequest>,
) -> Result<(StatusCode, Json<ChatRequestAccepted>), (StatusCode, Json<Value>)> {
    if body.messages.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "messages must not be empty" })),
        ));
    }

    let mut request = LlmChatRequest::new(body.chat_session_id, Some(body.user_id), body.messages);
    if let Some(model) = body.model {
        request.model = model;
    }
    if let Some(max_tokens) = body.max_tokens {
        request.max_tokens = max_tokens;
    }
    if let Some(temperature) = body.temperature {
        request.temperature = temperature;
    }

    // Register before publishing so no worker output can arrive unclaimed.
    state
        .hub
        .register(&request.request_id, request.chat_session_id, body.user_id);

    if let Err(e) = state.publisher.send_chat_request(&request).await {
        state.hub.remove(&request.request_id);
        state.metrics.requests_failed.fetch_add(1, Ordering::Relaxed);
        error!(request_id = %request.request_id, error = %e, "Failed to publish chat request");
        return Err((
            StatusCode::BAD_GATEWAY,
            Json(json!({ "error": "failed to publish chat request" })),
        ));
    }

    state.metrics.requests_accepted.fetch_add(1, Ordering::Relaxed);
    info!(
        request_id = %request.request_id,
        session_id = request.chat_session_id,
        user_id = body.user_id,
        model = %request.model,
        "Chat request accepted"
    );

    Ok((
        StatusCode::ACCEPTED,
        Json(ChatRequestAccepted {
            stream_url: format!("/api/v1/chat/stream/{}", request.request_id),
            request_id: request.request_id,
            status: "accepted",
        }),
    ))
}

async fn get_request_state(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Json<StreamState>, StatusCode> {
    state
        .hub
        .get_state(&request_id)
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

async fn stream_request(
    State(state): State<Arc<AppState>>,
    Path(request_id): Path<String>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, StatusCode> {
    if state.hub.get_state(&request_id).is_none() {
        debug!(request_id = %request_id, "Stream requested for unknown request");
        return Err(StatusCode::NOT_FOUND);
    }

    state.metrics.streams_opened.fetch_add(1, Ordering::Relaxed);
    let events = state
        .hub
        .subscribe(&request_id)
        .map(|event| Event::default().event(event.kind()).json_data(&event));

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn list_session_messages(
    State(state): State<Arc<AppState>>,
    Path(session_id): Path<i64>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Value>, StatusCode> {
    let total = state.store.count(session_id).await.map_err(|e| {
        error!(session_id, error = %e, "Failed to count session messages");
        StatusCode::SERVICE_UNAVAILABLE
    })?;

    let entries = state
        .store
        .list(session_id, query.limit())
        .await
        .map_err(|e| {
            error!(session_id, error = %e, "Failed to list session messages");
            StatusCode::SERVICE_UNAVAILABLE
        })?;

    let messages: Vec<Value> = entries
        .into_iter()
        .map(|(id, mut fields)| {
            if let Some(obj) = fields.as_object_mut() {
                obj.insert("id".to_string(), json!(id));
            }
            fields
        })
        .collect();

    Ok(Json(json!({
        "session_id": session_id,
        "total": total,
        "messages": messages,
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_history_limit_defaults_and_clamps() {
        assert_eq!(HistoryQuery::default().limit(), DEFAULT_HISTORY_LIMIT);
        assert_eq!(HistoryQuery { limit: Some(0) }.limit(), 1);
        assert_eq!(HistoryQuery { limit: Some(20) }.limit(), 20);
        assert_eq!(HistoryQuery { limit: Some(10_000) }.limit(), MAX_HISTORY_LIMIT);
    }
}
