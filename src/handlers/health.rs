use axum::{extract::State, http::StatusCode, response::Json};
use once_cell::sync::Lazy;
use serde::Serialize;
use std::time::Instant;

use crate::{db, handlers::AppState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    Up,
    Down,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub version: &'static str,
    pub git: &'static str,
    pub built_at: &'static str,
    pub timestamp: String,
    pub uptime_secs: u64,
    pub database: ComponentStatus,
    pub database_latency_ms: u64,
    pub payment_providers: Vec<String>,
}

/// Tracks application start time for uptime calculation
static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn init_start_time() {
    Lazy::force(&START_TIME);
}

fn uptime_secs() -> u64 {
    START_TIME.elapsed().as_secs()
}

/// Liveness plus a database round-trip. Answers 503 when the database is down.
pub async fn health_check(State(state): State<AppState>) -> (StatusCode, Json<HealthResponse>) {
    let started = Instant::now();
    let database = match db::check_connection(&state.db).await {
        Ok(()) => ComponentStatus::Up,
        Err(_) => ComponentStatus::Down,
    };
    let database_latency_ms = started.elapsed().as_millis() as u64;

    let body = HealthResponse {
        status: database,
        version: env!("CARGO_PKG_VERSION"),
        git: option_env!("GIT_HASH").unwrap_or("unknown"),
        built_at: option_env!("BUILD_TIME").unwrap_or("unknown"),
        timestamp: chrono::Utc::now().to_rfc3339(),
        uptime_secs: uptime_secs(),
        database,
        database_latency_ms,
        payment_providers: state
            .services
            .payments
            .providers()
            .iter()
            .map(ToString::to_string)
            .collect(),
    };
    let code = match database {
        ComponentStatus::Up => StatusCode::OK,
        ComponentStatus::Down => StatusCode::SERVICE_UNAVAILABLE,
    };
    (code, Json(body))
}
