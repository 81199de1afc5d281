//! Passenger search over active trips.

use axum::{extract::State, http::StatusCode, Json};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use super::TripsState;
use crate::api::{trip_error, ErrorResponse};
use crate::directory::ActiveTrip;
use crate::tracking::feed;

#[derive(Debug, Deserialize, ToSchema)]
pub struct TripSearchRequest {
    /// Name of the rider's boarding waypoint
    pub origin: String,
    /// Name of the rider's destination waypoint
    pub destination: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct TripSearchResponse {
    pub count: usize,
    pub trips: Vec<ActiveTrip>,
}

/// Active trips the rider can still board: the route passes origin before
/// destination in its current direction and the bus has not moved past the
/// boarding point.
#[utoipa::path(
    post,
    path = "/api/trips/search",
    request_body = TripSearchRequest,
    responses(
        (status = 200, description = "Boardable active trips", body = TripSearchResponse),
        (status = 500, description = "Internal server error", body = ErrorResponse)
    ),
    tag = "trips"
)]
pub async fn search_trips(
    State(state): State<TripsState>,
    Json(request): Json<TripSearchRequest>,
) -> Result<Json<TripSearchResponse>, (StatusCode, Json<ErrorResponse>)> {
    let trips = feed::search_trips(&state.pool, &request.origin, &request.destination)
        .await
        .map_err(trip_error)?;

    Ok(Json(TripSearchResponse {
        count: trips.len(),
        trips,
    }))
}
