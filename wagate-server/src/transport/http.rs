//! HTTP/JSON transport
//!
//! # API Endpoints
//!
//! ## GET /health
//!
//! Returns "OK" with 200 status.
//!
//! ## GET /status?scope=106540352242922
//!
//! Limiter state per category for a scope (default `global`):
//!
//! ```json
//! {
//!   "scope": "106540352242922",
//!   "categories": {
//!     "messaging": { "running": 1, "queued": 3, "reservoir": 76, "active": true },
//!     "global": { "running": 1, "queued": 0, "reservoir": 996, "active": true },
//!     "templates": { "running": 0, "queued": 0, "reservoir": 250, "active": false }
//!   }
//! }
//! ```
//!
//! ## GET /metrics
//!
//! Prometheus text format.
//!
//! ## GET /events?type=message_sent
//!
//! Server-Sent Events stream of bus events. Without `type` every event is
//! streamed.
//!
//! ## GET /webhook
//!
//! Subscription handshake: echoes `hub.challenge` when `hub.mode` is
//! `subscribe` and `hub.verify_token` matches the configured token.
//!
//! ## POST /webhook
//!
//! WhatsApp notification ingestion, admitted by the webhook limiter.
//! Replies `{"received": <messages + statuses>}`.
//!
//! ## POST /messages
//!
//! Sends the Graph API message object in the body from the configured
//! phone number and returns the Graph API response.

use super::{AppState, Transport};
use crate::client::ApiError;
use crate::events::{Event, Topic};
use crate::scheduler::RateLimitStatus;
use crate::webhook::{self, WebhookPayload};
use anyhow::Result;
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use futures::stream::{self, Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use wagate::ThrottleError;

/// Error response format
#[derive(Debug, Serialize, Deserialize)]
pub struct HttpErrorResponse {
    pub error: String,
}

type HttpError = (StatusCode, Json<HttpErrorResponse>);

fn http_error(status: StatusCode, error: impl ToString) -> HttpError {
    (
        status,
        Json(HttpErrorResponse {
            error: error.to_string(),
        }),
    )
}

fn throttle_status(error: &ThrottleError) -> StatusCode {
    match error {
        ThrottleError::QueueTimeout { .. } => StatusCode::TOO_MANY_REQUESTS,
        ThrottleError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        ThrottleError::InvalidPolicy(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// HTTP transport implementation
pub struct HttpTransport {
    addr: SocketAddr,
}

impl HttpTransport {
    pub fn new(host: &str, port: u16) -> Result<Self> {
        let addr = format!("{host}:{port}").parse()?;
        Ok(Self { addr })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn start(self, state: AppState) -> Result<()> {
        let app = router(state);

        tracing::info!("HTTP server listening on {}", self.addr);

        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        axum::serve(listener, app).await?;

        Ok(())
    }
}

/// Build the application routes
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(handle_status))
        .route("/metrics", get(handle_metrics))
        .route("/events", get(handle_events))
        .route("/webhook", get(handle_verify).post(handle_webhook))
        .route("/messages", axum::routing::post(handle_send_message))
        .with_state(Arc::new(state))
}

#[derive(Debug, Deserialize)]
struct StatusQuery {
    scope: Option<String>,
}

async fn handle_status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<StatusQuery>,
) -> Result<Json<RateLimitStatus>, HttpError> {
    state
        .scheduler
        .rate_limit_status(query.scope.as_deref())
        .await
        .map(Json)
        .map_err(|e| http_error(throttle_status(&e), e))
}

async fn handle_metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.export_prometheus(),
    )
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    #[serde(rename = "type")]
    kind: Option<String>,
}

async fn handle_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, axum::Error>>>, HttpError> {
    let topic = match query.kind.as_deref() {
        Some(kind) => kind
            .parse::<Topic>()
            .map_err(|e| http_error(StatusCode::BAD_REQUEST, e))?,
        None => Topic::All,
    };
    tracing::debug!("SSE subscriber attached to {}", topic.name());

    let subscription = state.events.subscribe(topic);
    let events = stream::unfold(subscription, |mut subscription| async move {
        subscription
            .recv()
            .await
            .map(|event| (event, subscription))
    })
    .map(|event: Event| {
        SseEvent::default()
            .event(event.kind().as_str())
            .json_data(&event)
    });

    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn handle_verify(
    State(state): State<Arc<AppState>>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token");
    let challenge = params.get("hub.challenge");

    match (&state.verify_token, mode, token, challenge) {
        (Some(expected), Some("subscribe"), Some(token), Some(challenge)) if token == expected => {
            tracing::info!("Webhook subscription verified");
            challenge.clone().into_response()
        }
        _ => {
            tracing::warn!("Webhook verification rejected");
            StatusCode::FORBIDDEN.into_response()
        }
    }
}

async fn handle_webhook(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<WebhookPayload>,
) -> Result<Json<serde_json::Value>, HttpError> {
    let events = state.events.clone();
    let summary = state
        .scheduler
        .schedule_webhook(async move { webhook::publish(&events, &payload) }, None)
        .await
        .map_err(|e| {
            tracing::error!("Webhook not admitted: {}", e);
            http_error(throttle_status(&e), e)
        })?;

    Ok(Json(serde_json::json!({ "received": summary.received() })))
}

async fn handle_send_message(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, HttpError> {
    state
        .client
        .send_message(payload)
        .await
        .map(Json)
        .map_err(|e| {
            let status = match &e {
                ApiError::Status { status, .. } => {
                    StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
                }
                ApiError::Throttle(throttled) => throttle_status(throttled),
                _ => StatusCode::BAD_GATEWAY,
            };
            http_error(status, e)
        })
}
