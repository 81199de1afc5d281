pub mod error;
pub mod health;
pub mod routes;
pub mod trips;
pub mod ws;

pub use error::{not_found, trip_error, ErrorResponse};

use std::sync::Arc;

use axum::{routing::get, Router};
use sqlx::SqlitePool;

use crate::tracking::TrackingEngine;

pub fn router(pool: SqlitePool, engine: Arc<TrackingEngine>) -> Router {
    let channel = engine.channel();
    let ws_state = ws::WsState {
        pool: pool.clone(),
        channel: channel.clone(),
    };

    Router::new()
        .nest("/routes", routes::router(pool.clone()))
        .nest("/trips", trips::router(pool.clone(), engine.clone(), channel))
        .nest("/health", health::router(pool, engine))
        .route("/ws/trips", get(ws::ws_trips).with_state(ws_state))
}
