//! HTTP router for marketplace-sync
//!
//! This module defines the axum router for the read-only observability
//! endpoints:
//! - Health check
//! - Scheduler and rate limiter state
//! - Sync run history

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::database::Database;
use crate::sync::{RateLimiter, SchedulerHandle};

/// Default page size of `/api/sync-runs`
const DEFAULT_RUN_LIMIT: u32 = 50;

/// Largest page size of `/api/sync-runs`
const MAX_RUN_LIMIT: u32 = 500;

/// Shared application state
pub struct AppState<D: Database> {
    /// Database
    pub database: Arc<D>,

    /// Running scheduler
    pub scheduler: SchedulerHandle,

    /// Shared rate limiter
    pub rate_limiter: Arc<RateLimiter>,
}

impl<D: Database> Clone for AppState<D> {
    fn clone(&self) -> Self {
        Self {
            database: Arc::clone(&self.database),
            scheduler: self.scheduler.clone(),
            rate_limiter: Arc::clone(&self.rate_limiter),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub scheduler_running: bool,
}

/// Query parameters of `/api/sync-runs`
#[derive(Debug, Default, Deserialize)]
pub struct SyncRunsQuery {
    pub account_id: Option<String>,
    pub limit: Option<u32>,
}

/// Build the main application router
///
/// # Arguments
///
/// * `state` - Application state holding the database, scheduler and limiter
///
/// # Returns
///
/// An axum Router configured with all endpoints
pub fn build_router<D: Database + 'static>(state: AppState<D>) -> Router {
    Router::new()
        .route("/health", get(health_handler::<D>))
        .route("/api/scheduler", get(api_scheduler_handler::<D>))
        .route("/api/rate-limits", get(api_rate_limits_handler::<D>))
        .route("/api/sync-runs", get(api_list_sync_runs_handler::<D>))
        .route("/api/sync-runs/:id", get(api_get_sync_run_handler::<D>))
        .with_state(state)
}

// =============================================================================
// Health Handler
// =============================================================================

/// Health check endpoint handler
async fn health_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> impl IntoResponse {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        scheduler_running: state.scheduler.is_running(),
    })
}

// =============================================================================
// API Handlers
// =============================================================================

/// Scheduler status API handler
async fn api_scheduler_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> impl IntoResponse {
    let accounts = state.scheduler.status().await;
    Json(serde_json::json!({
        "running": state.scheduler.is_running(),
        "accounts": accounts
    }))
}

/// Rate limiter usage API handler
async fn api_rate_limits_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
) -> impl IntoResponse {
    let classes = state.rate_limiter.usage_all().await;
    let stats = state.rate_limiter.stats().await;
    Json(serde_json::json!({
        "classes": classes,
        "stats": stats
    }))
}

/// List sync runs handler
async fn api_list_sync_runs_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Query(query): Query<SyncRunsQuery>,
) -> impl IntoResponse {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_RUN_LIMIT)
        .clamp(1, MAX_RUN_LIMIT);

    match state.database.list_sync_runs(query.account_id, limit).await {
        Ok(runs) => (StatusCode::OK, Json(serde_json::json!({ "runs": runs }))),
        Err(e) => {
            tracing::error!(error = %e, "Failed to list sync runs");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to list sync runs" })),
            )
        }
    }
}

/// Get sync run by ID handler
async fn api_get_sync_run_handler<D: Database + 'static>(
    State(state): State<AppState<D>>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.database.get_sync_run(&id).await {
        Ok(Some(run)) => (StatusCode::OK, Json(serde_json::json!({ "run": run }))),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "Sync run not found" })),
        ),
        Err(e) => {
            tracing::error!(error = %e, sync_id = %id, "Failed to get sync run");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "Failed to get sync run" })),
            )
        }
    }
}
