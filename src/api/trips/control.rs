//! Driver lifecycle endpoints and the observer snapshot read.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::TripsState;
use crate::api::{trip_error, ErrorResponse};
use crate::directory::{self, Route, TripError, TripKey};
use crate::tracking::feed::{self, TripView};

#[derive(Debug, Deserialize, ToSchema)]
pub struct TripRequest {
    pub bus_id: String,
    pub route_name: String,
}

impl TripRequest {
    fn key(&self) -> TripKey {
        TripKey::new(&*self.bus_id, &*self.route_name)
    }
}

#[derive(Debug, Serialize, ToSchema)]
pub struct DestinationOptionsResponse {
    /// Wire key `{bus_id}-{route_name}`
    pub trip: String,
    /// The two terminal waypoints in current read order
    pub options: Vec<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ChangeDestinationRequest {
    pub bus_id: String,
    pub route_name: String,
    /// One of the two names offered by select-route
    pub destination: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TripActionResponse {
    pub trip: String,
    pub active: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LocationFixRequest {
    pub bus_id: String,
    pub route_name: String,
    pub latitude: f64,
    pub longitude: f64,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LocationFixResponse {
    pub trip: String,
    /// Whether the fix passed the publish delta gate
    pub accepted: bool,
}

/// Load a route and derive the selectable destination pair
#[utoipa::path(
    post,
    path = "/api/trips/select-route",
    request_body = TripRequest,
    responses(
        (status = 200, description = "Destination options for the route", body = DestinationOptionsResponse),
        (status = 400, description = "Unknown or incomplete route", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn select_route(
    State(state): State<TripsState>,
    Json(request): Json<TripRequest>,
) -> Result<Json<DestinationOptionsResponse>, (StatusCode, Json<ErrorResponse>)> {
    let key = request.key();
    let options = state.engine.select_route(&key).await.map_err(trip_error)?;

    Ok(Json(DestinationOptionsResponse {
        trip: key.to_string(),
        options,
    }))
}

/// Select the travel destination, reversing the route when the opposite
/// terminal is chosen. Idempotent.
#[utoipa::path(
    post,
    path = "/api/trips/change-destination",
    request_body = ChangeDestinationRequest,
    responses(
        (status = 200, description = "The route record after the change", body = Route),
        (status = 400, description = "Destination is not a terminal waypoint", body = ErrorResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn change_destination(
    State(state): State<TripsState>,
    Json(request): Json<ChangeDestinationRequest>,
) -> Result<Json<Route>, (StatusCode, Json<ErrorResponse>)> {
    let key = TripKey::new(&*request.bus_id, &*request.route_name);
    state
        .engine
        .change_destination(&key, &request.destination)
        .await
        .map_err(trip_error)?;

    let route = directory::get_route(&state.pool, &key)
        .await
        .map_err(trip_error)?
        .ok_or_else(|| {
            trip_error(TripError::Persistence(
                "route missing after destination change".to_string(),
            ))
        })?;

    Ok(Json(route))
}

/// Start the trip: flips the directory status/mirror pair and opens the
/// live location write path
#[utoipa::path(
    post,
    path = "/api/trips/start",
    request_body = TripRequest,
    responses(
        (status = 200, description = "Trip is live", body = TripActionResponse),
        (status = 400, description = "No route or destination selected", body = ErrorResponse),
        (status = 500, description = "Directory write failed; safe to retry", body = ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn start_trip(
    State(state): State<TripsState>,
    Json(request): Json<TripRequest>,
) -> Result<Json<TripActionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let key = request.key();
    state.engine.start_trip(&key).await.map_err(trip_error)?;

    Ok(Json(TripActionResponse {
        trip: key.to_string(),
        active: true,
    }))
}

/// Cancel the trip: terminal location sample, mirror removal, session
/// teardown. Safe to call when already idle.
#[utoipa::path(
    post,
    path = "/api/trips/cancel",
    request_body = TripRequest,
    responses(
        (status = 200, description = "Trip is canceled", body = TripActionResponse),
        (status = 500, description = "Directory write failed; safe to retry", body = ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn cancel_trip(
    State(state): State<TripsState>,
    Json(request): Json<TripRequest>,
) -> Result<Json<TripActionResponse>, (StatusCode, Json<ErrorResponse>)> {
    let key = request.key();
    state.engine.cancel_trip(&key).await.map_err(trip_error)?;

    Ok(Json(TripActionResponse {
        trip: key.to_string(),
        active: false,
    }))
}

/// Driver GPS fix. Fixes for trips that are not live are discarded.
#[utoipa::path(
    post,
    path = "/api/trips/location",
    request_body = LocationFixRequest,
    responses(
        (status = 200, description = "Fix processed (accepted or gated)", body = LocationFixResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn publish_location(
    State(state): State<TripsState>,
    Json(request): Json<LocationFixRequest>,
) -> Result<Json<LocationFixResponse>, (StatusCode, Json<ErrorResponse>)> {
    let key = TripKey::new(&*request.bus_id, &*request.route_name);
    let accepted = state
        .engine
        .publish_fix(&key, request.latitude, request.longitude)
        .await
        .map_err(trip_error)?;

    Ok(Json(LocationFixResponse {
        trip: key.to_string(),
        accepted,
    }))
}

/// Merged observer snapshot of one trip
#[utoipa::path(
    get,
    path = "/api/trips/{bus_id}/{route_name}",
    params(
        ("bus_id" = String, Path, description = "Bus identifier"),
        ("route_name" = String, Path, description = "Route name")
    ),
    responses(
        (status = 200, description = "Merged route, mirror and live location view", body = TripView)
    ),
    tag = "trips"
)]
pub async fn get_trip(
    State(state): State<TripsState>,
    Path((bus_id, route_name)): Path<(String, String)>,
) -> Json<TripView> {
    let key = TripKey::new(bus_id, route_name);
    Json(feed::trip_snapshot(&state.pool, &state.channel, &key).await)
}
