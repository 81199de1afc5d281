pub mod control;
pub mod search;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use sqlx::SqlitePool;

use crate::tracking::{LiveLocationChannel, TrackingEngine};

#[derive(Clone)]
pub struct TripsState {
    pub pool: SqlitePool,
    pub engine: Arc<TrackingEngine>,
    pub channel: LiveLocationChannel,
}

pub fn router(
    pool: SqlitePool,
    engine: Arc<TrackingEngine>,
    channel: LiveLocationChannel,
) -> Router {
    let state = TripsState {
        pool,
        engine,
        channel,
    };
    Router::new()
        .route("/select-route", post(control::select_route))
        .route("/change-destination", post(control::change_destination))
        .route("/start", post(control::start_trip))
        .route("/cancel", post(control::cancel_trip))
        .route("/location", post(control::publish_location))
        .route("/search", post(search::search_trips))
        .route("/{bus_id}/{route_name}", get(control::get_trip))
        .with_state(state)
}
