//! # Operator HTTP Surface
//!
//! A small axum router for health checks and dashboards. It never authorizes,
//! redeems or settles anything; those operations stay inside the agent
//! process that embeds `x402-core`.
//!
//! ## Endpoints
//!
//! | Method | Path        | Description                                 |
//! |--------|-------------|---------------------------------------------|
//! | GET    | `/health`   | Liveness plus store record counts           |
//! | GET    | `/stats`    | Escrow counts and totals by status          |
//! | GET    | `/spending` | Committed spend in today's and this week's windows |
//! | GET    | `/metrics`  | Prometheus text exposition                  |

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use x402_core::X402Core;

use crate::metrics::{self, SharedMetrics};

/// State shared by every handler. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    pub core: Arc<X402Core>,
    pub metrics: SharedMetrics,
    pub started_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: String,
    pub schema_version: u32,
    pub wallet_mode: &'static str,
    pub escrow_address: String,
    pub uptime_secs: i64,
    pub records: BTreeMap<&'static str, usize>,
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    error: String,
}

pub fn create_router(state: AppState) -> Router {
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics::metrics_handler))
        .with_state(Arc::clone(&state.metrics));

    Router::new()
        .route("/health", get(health_handler))
        .route("/stats", get(stats_handler))
        .route("/spending", get(spending_handler))
        .with_state(state)
        .merge(metrics_routes)
        .layer(TraceLayer::new_for_http())
}

fn internal_error(e: impl std::fmt::Display) -> axum::response::Response {
    tracing::error!("request failed: {}", e);
    (
        StatusCode::SERVICE_UNAVAILABLE,
        Json(ErrorResponse {
            error: e.to_string(),
        }),
    )
        .into_response()
}

/// `GET /health`. 503 when the store cannot be read.
async fn health_handler(State(state): State<AppState>) -> axum::response::Response {
    let db = state.core.db();
    let schema_version = match db.schema_version() {
        Ok(v) => v,
        Err(e) => return internal_error(e),
    };
    let wallet = state.core.wallet();
    let resp = HealthResponse {
        status: "ok",
        version: state.version.clone(),
        schema_version,
        wallet_mode: wallet.mode(),
        escrow_address: wallet.escrow_address().to_string(),
        uptime_secs: (chrono::Utc::now() - state.started_at).num_seconds(),
        records: db.tree_sizes().into_iter().collect(),
    };
    (StatusCode::OK, Json(resp)).into_response()
}

/// `GET /stats`
async fn stats_handler(State(state): State<AppState>) -> axum::response::Response {
    match state.core.escrow().get_stats() {
        Ok(stats) => Json(stats).into_response(),
        Err(e) => internal_error(e),
    }
}

/// `GET /spending`
async fn spending_handler(State(state): State<AppState>) -> axum::response::Response {
    match state.core.authorizer().spending_summary() {
        Ok(summary) => Json(summary).into_response(),
        Err(e) => internal_error(e),
    }
}
