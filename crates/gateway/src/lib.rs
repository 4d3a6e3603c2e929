//! HTTP surface for Valet.
//!
//! Endpoints:
//!
//! - `POST /chat`           — route a prompt, stream plain-text tokens
//! - `POST /chat/clear`     — reset a session's transcript
//! - `GET  /health/summary` — aggregated health + latency statistics
//!
//! The transport stays thin: routing, fallback, and session state all
//! live in the dispatcher. Internal failure causes are logged here and
//! surfaced to callers as generic messages.

mod stats;

pub use stats::{LatencyStats, LatencySummary};

use std::sync::Arc;
use std::time::Instant;

use axum::{
    Router,
    body::Body,
    extract::State,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use valet_core::{Error, GenerationEvent, GenerationParams, SessionError, SessionId};
use valet_dispatch::{HealthSnapshot, TierDispatcher};

/// Shared state for the HTTP surface.
pub struct GatewayState {
    pub dispatcher: Arc<TierDispatcher>,
    pub latency: LatencyStats,
    pub start_time: chrono::DateTime<chrono::Utc>,
}

pub type SharedState = Arc<GatewayState>;

impl GatewayState {
    pub fn new(dispatcher: Arc<TierDispatcher>) -> SharedState {
        Arc::new(Self {
            dispatcher,
            latency: LatencyStats::new(),
            start_time: chrono::Utc::now(),
        })
    }
}

/// Build the Axum router with all gateway routes.
pub fn build_router(state: SharedState) -> Router {
    // CORS: only the local voice frontend by default.
    let cors = tower_http::cors::CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::exact(
            header::HeaderValue::from_static("http://localhost:8080"),
        ))
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers([header::CONTENT_TYPE])
        .max_age(std::time::Duration::from_secs(3600));

    Router::new()
        .route("/chat", post(chat_handler))
        .route("/chat/clear", post(chat_clear_handler))
        .route("/health/summary", get(health_summary_handler))
        .layer(cors)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Start the gateway HTTP server.
pub async fn serve(
    state: SharedState,
    host: &str,
    port: u16,
) -> Result<(), Box<dyn std::error::Error>> {
    let addr = format!("{host}:{port}");
    let app = build_router(state);

    info!(addr = %addr, "Gateway listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

// ── Request / Response types ──────────────────────────────────────────

#[derive(Deserialize)]
struct ChatRequest {
    /// The user's prompt.
    prompt: String,
    /// Session to continue (omit to start a new one).
    #[serde(default)]
    session_id: Option<String>,
    /// Per-request overrides over the tier defaults.
    #[serde(default)]
    max_tokens: Option<u32>,
    #[serde(default)]
    temperature: Option<f32>,
}

#[derive(Deserialize)]
struct ClearRequest {
    session_id: String,
}

#[derive(Serialize)]
struct ClearResponse {
    session_id: String,
    cleared: bool,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
}

#[derive(Serialize)]
struct HealthSummaryResponse {
    status: &'static str,
    version: &'static str,
    uptime_secs: i64,
    #[serde(flatten)]
    snapshot: HealthSnapshot,
    latency: LatencySummary,
}

// ── Handlers ──────────────────────────────────────────────────────────

/// Route a prompt and stream the answer back as chunked plain text.
/// The response ends when the underlying stream reaches `done`. The
/// session id (given or newly minted) comes back in `X-Session-Id`.
async fn chat_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Response, (StatusCode, Json<ErrorResponse>)> {
    let session_id = match payload.session_id {
        Some(id) => SessionId::from(id),
        None => SessionId::new(),
    };

    let caller_params = if payload.max_tokens.is_some() || payload.temperature.is_some() {
        Some(GenerationParams {
            max_tokens: payload.max_tokens,
            temperature: payload.temperature,
            ..Default::default()
        })
    } else {
        None
    };

    let started = Instant::now();
    let mut stream = state
        .dispatcher
        .generate(&session_id, &payload.prompt, caller_params)
        .await
        .map_err(map_dispatch_error)?;

    // Bridge generation events into a chunked text body. The relay
    // drops the session permit when this channel closes, so a client
    // disconnect cannot wedge the session.
    let (tx, rx) = tokio::sync::mpsc::channel::<Result<String, std::convert::Infallible>>(32);
    let state_for_stats = state.clone();
    tokio::spawn(async move {
        while let Some(event) = stream.recv().await {
            match event {
                Ok(GenerationEvent::First { ms }) => {
                    tracing::debug!(first_token_ms = ms, "Generation started");
                }
                Ok(GenerationEvent::Token { text }) => {
                    if tx.send(Ok(text)).await.is_err() {
                        return;
                    }
                }
                Ok(GenerationEvent::Done) => {
                    state_for_stats
                        .latency
                        .record(started.elapsed().as_millis() as u64);
                    return;
                }
                Err(e) => {
                    error!(error = %e, "Generation failed mid-stream");
                    let _ = tx.send(Ok("\n[generation failed]".to_string())).await;
                    return;
                }
            }
        }
    });

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    // Session ids arrive from the client; skip the header if one is not
    // representable rather than failing the whole request.
    if let Ok(value) = header::HeaderValue::from_str(session_id.as_str()) {
        headers.insert("X-Session-Id", value);
    }

    let body = Body::from_stream(ReceiverStream::new(rx));
    Ok((headers, body).into_response())
}

/// Reset a session's transcript. Idempotent.
async fn chat_clear_handler(
    State(state): State<SharedState>,
    Json(payload): Json<ClearRequest>,
) -> Json<ClearResponse> {
    let session_id = SessionId::from(payload.session_id);
    let cleared = state.dispatcher.clear_session(&session_id).await;
    Json(ClearResponse {
        session_id: session_id.as_str().to_string(),
        cleared,
    })
}

/// Aggregated health. Never fails: degraded subsystems show up as
/// structured statuses in the body.
async fn health_summary_handler(State(state): State<SharedState>) -> Json<HealthSummaryResponse> {
    let snapshot = state.dispatcher.health().await;
    Json(HealthSummaryResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        uptime_secs: (chrono::Utc::now() - state.start_time).num_seconds(),
        snapshot,
        latency: state.latency.summary(),
    })
}

fn map_dispatch_error(err: Error) -> (StatusCode, Json<ErrorResponse>) {
    match err {
        Error::Session(SessionError::Busy(id)) => (
            StatusCode::CONFLICT,
            Json(ErrorResponse {
                error: format!("session '{id}' already has a generation in flight"),
            }),
        ),
        other => {
            error!(error = %other, "Generation failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ErrorResponse {
                    error: "generation failed".into(),
                }),
            )
        }
    }
}
