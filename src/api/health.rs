//! Health check endpoints

use std::sync::Arc;
use std::sync::atomic::Ordering;

use axum::{Json, Router, extract::State, http::StatusCode, routing::get};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::ApiState;

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

/// Detailed readiness response
#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub checks: ReadinessChecks,
}

/// Individual readiness checks
#[derive(Serialize)]
pub struct ReadinessChecks {
    pub synthesizer: CheckResult,
}

/// Result of a single health check
#[derive(Serialize)]
pub struct CheckResult {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl CheckResult {
    const fn ok() -> Self {
        Self {
            status: "ok",
            message: None,
        }
    }

    fn loading() -> Self {
        Self {
            status: "loading",
            message: Some("synthesizer is preparing".to_string()),
        }
    }
}

/// Liveness probe - is the service running?
async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// Readiness probe - can a new session start speaking immediately?
async fn ready(State(state): State<Arc<ApiState>>) -> (StatusCode, Json<ReadinessResponse>) {
    let synthesizer = if state.services.synthesizer.is_ready() {
        CheckResult::ok()
    } else {
        CheckResult::loading()
    };

    let all_ok = synthesizer.status == "ok";
    let http_status = if all_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        http_status,
        Json(ReadinessResponse {
            status: if all_ok { "ok" } else { "degraded" },
            checks: ReadinessChecks { synthesizer },
        }),
    )
}

/// Gateway status response
#[derive(Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub started_at: DateTime<Utc>,
    pub uptime_secs: i64,
    /// Connected peers
    pub sessions: usize,
    pub stt_model: String,
    pub llm_model: String,
    pub tts_provider: String,
    pub sample_rate: u32,
    pub silence_threshold_ms: u64,
}

async fn status(State(state): State<Arc<ApiState>>) -> Json<StatusResponse> {
    let config = &state.config;
    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at,
        uptime_secs: (Utc::now() - state.started_at).num_seconds(),
        sessions: state.sessions.load(Ordering::Relaxed),
        stt_model: config.stt.model.clone(),
        llm_model: config.llm.model.clone(),
        tts_provider: config.tts.provider.to_string(),
        sample_rate: state.services.synthesizer.sample_rate(),
        silence_threshold_ms: u64::try_from(config.turn.silence_threshold.as_millis())
            .unwrap_or(u64::MAX),
    })
}

/// Build health router (liveness only, no state needed)
pub fn router() -> Router {
    Router::new().route("/health", get(health))
}

/// Build readiness router (needs state for checks)
pub fn ready_router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/ready", get(ready))
        .route("/api/status", get(status))
        .with_state(state)
}
