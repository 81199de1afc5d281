use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use utoipa::ToSchema;

use crate::tracking::TrackingEngine;

#[derive(Clone)]
pub struct HealthState {
    pub pool: SqlitePool,
    pub engine: Arc<TrackingEngine>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    /// Whether the service is running
    pub healthy: bool,
    /// Number of routes in the durable directory
    pub route_count: i64,
    /// Number of trips with a live tracking session
    pub live_trip_count: usize,
    /// Number of trips with a stored location sample
    pub tracked_sample_count: usize,
}

/// Health check endpoint
#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "Service health status", body = HealthResponse)
    ),
    tag = "health"
)]
pub async fn health_check(State(state): State<HealthState>) -> Json<HealthResponse> {
    let route_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM routes")
        .fetch_one(&state.pool)
        .await
        .unwrap_or(0);

    let channel = state.engine.channel();

    Json(HealthResponse {
        healthy: true,
        route_count,
        live_trip_count: state.engine.live_trip_count().await,
        tracked_sample_count: channel.sample_count().await,
    })
}

pub fn router(pool: SqlitePool, engine: Arc<TrackingEngine>) -> Router {
    let state = HealthState { pool, engine };
    Router::new()
        .route("/", get(health_check))
        .with_state(state)
}
