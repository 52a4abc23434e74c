use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tracing::{error, info};

use crate::gateway::ChatGateway;
use crate::orchestrator::FollowUpOrchestrator;
use crate::participant::Numbering;
use crate::rate_limit::CallLimiter;
use crate::reply::{handle_reply, ReplyError, ReplyRequest};
use crate::store::sent::SentRegistry;

// ── Shared state ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<FollowUpOrchestrator>,
    pub registry: SentRegistry,
    pub gateway: Arc<dyn ChatGateway>,
    pub limiter: Arc<dyn CallLimiter>,
    pub numbering: Numbering,
    pub suppression_window: Duration,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/reply-message", post(reply_message))
        .route("/send-follow-up-message", post(send_follow_up))
        .route("/cleanup-sent-numbers", post(cleanup_sent_numbers))
        .with_state(state)
}

/// Serve until `shutdown` resolves
pub async fn serve(
    bind: &str,
    state: AppState,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(bind)
        .await
        .with_context(|| format!("Failed to bind to {bind}"))?;

    info!("HTTP server listening on {}", bind);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")?;

    Ok(())
}

// ── Handlers ───────────────────────────────────────────────────────────────────

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn reply_message(
    State(state): State<AppState>,
    Json(body): Json<ReplyRequest>,
) -> Response {
    match handle_reply(
        state.gateway.as_ref(),
        state.limiter.as_ref(),
        &state.numbering,
        &body,
    )
    .await
    {
        Ok(receipt) => Json(json!({
            "success": true,
            "message": "Message sent successfully.",
            "body": receipt.body,
        }))
        .into_response(),
        Err(e) => e.into_response(),
    }
}

impl IntoResponse for ReplyError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            ReplyError::MissingField(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                json!({ "success": false, "message": self.to_string() }),
            ),
            ReplyError::ReadFailed(_) | ReplyError::Mismatch => (
                StatusCode::BAD_REQUEST,
                json!({
                    "success": false,
                    "message": "Failed to read messages or specific message did not match.",
                }),
            ),
            ReplyError::SendFailed(e) => (
                StatusCode::BAD_REQUEST,
                json!({
                    "success": false,
                    "message": "Failed to send the message.",
                    "error": format!("{:#}", e),
                }),
            ),
        };
        (status, Json(body)).into_response()
    }
}

async fn send_follow_up(State(state): State<AppState>) -> Response {
    let report = state.orchestrator.run_once().await;
    let status = if report.success {
        StatusCode::OK
    } else {
        StatusCode::BAD_REQUEST
    };
    (status, Json(report)).into_response()
}

async fn cleanup_sent_numbers(State(state): State<AppState>) -> Response {
    match state
        .registry
        .evict_older_than(state.suppression_window)
        .await
    {
        Ok(evicted) => Json(json!({ "success": true, "evicted": evicted })).into_response(),
        Err(e) => {
            error!("Cleanup failed: {:#}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "success": false, "message": "Cleanup failed." })),
            )
                .into_response()
        }
    }
}

// ── Tests ──────────────────────────────────────────────────────────────────────
