//! Route metadata endpoints for the owner collaborator.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use sqlx::SqlitePool;
use utoipa::ToSchema;

use crate::api::{not_found, trip_error, ErrorResponse};
use crate::directory::{self, Direction, Route, RoutePatch, TripError, TripKey};
use crate::geo::Waypoint;

#[derive(Clone)]
pub struct RoutesState {
    pub pool: SqlitePool,
}

/// Merge-style route update. Absent fields keep their stored values.
#[derive(Debug, Deserialize, ToSchema)]
pub struct RouteUpsertRequest {
    pub bus_id: String,
    pub route_name: String,
    /// Full replacement waypoint list, when provided
    pub waypoints: Option<Vec<Waypoint>>,
    pub destination_name: Option<String>,
    pub direction: Option<Direction>,
}

/// Create or partially update a route record
#[utoipa::path(
    post,
    path = "/api/routes",
    request_body = RouteUpsertRequest,
    responses(
        (status = 200, description = "The route record after the merge", body = Route),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "routes"
)]
pub async fn upsert_route(
    State(state): State<RoutesState>,
    Json(request): Json<RouteUpsertRequest>,
) -> Result<Json<Route>, (StatusCode, Json<ErrorResponse>)> {
    let key = TripKey::new(&*request.bus_id, &*request.route_name);
    let patch = RoutePatch {
        waypoints: request.waypoints,
        destination_name: request.destination_name,
        direction: request.direction,
    };

    directory::upsert_route(&state.pool, &key, &patch)
        .await
        .map_err(trip_error)?;

    let route = directory::get_route(&state.pool, &key)
        .await
        .map_err(trip_error)?
        .ok_or_else(|| {
            trip_error(TripError::Persistence(
                "route missing after upsert".to_string(),
            ))
        })?;

    Ok(Json(route))
}

/// Point read of one route record
#[utoipa::path(
    get,
    path = "/api/routes/{bus_id}/{route_name}",
    params(
        ("bus_id" = String, Path, description = "Bus identifier"),
        ("route_name" = String, Path, description = "Route name")
    ),
    responses(
        (status = 200, description = "The route record", body = Route),
        (status = 404, description = "Route not found", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "routes"
)]
pub async fn get_route(
    State(state): State<RoutesState>,
    Path((bus_id, route_name)): Path<(String, String)>,
) -> Result<Json<Route>, (StatusCode, Json<ErrorResponse>)> {
    let key = TripKey::new(bus_id, route_name);
    let route = directory::get_route(&state.pool, &key)
        .await
        .map_err(trip_error)?;

    route.map(Json).ok_or_else(|| not_found("Route not found"))
}

pub fn router(pool: SqlitePool) -> Router {
    let state = RoutesState { pool };
    Router::new()
        .route("/", post(upsert_route))
        .route("/{bus_id}/{route_name}", get(get_route))
        .with_state(state)
}
