//! Read-side composition for passive observers.
//!
//! Merges the durable directory and the live channel into one view per
//! trip, and answers the passenger search query over active trips. Read
//! errors degrade to an offline view instead of raising; a canceled sample
//! is terminal regardless of what the directory still says.

use serde::Serialize;
use sqlx::SqlitePool;
use tracing::warn;
use utoipa::ToSchema;

use crate::directory::{self, ActiveTrip, Route, TripKey};
use crate::tracking::channel::{LiveLocationChannel, LocationSample, TripStatus};

/// Merged observer view of one trip.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct TripView {
    /// Wire key `{bus_id}-{route_name}`
    pub trip: String,
    pub route: Option<Route>,
    pub active_trip: Option<ActiveTrip>,
    pub last_sample: Option<LocationSample>,
    /// Derived status: canceled wins over everything, otherwise mirror
    /// presence decides whether the trip is live
    pub status: TripStatus,
}

/// Build the merged view for one trip. Never fails: directory read errors
/// degrade to an offline view.
pub async fn trip_snapshot(
    pool: &SqlitePool,
    channel: &LiveLocationChannel,
    key: &TripKey,
) -> TripView {
    let trip = key.to_string();

    let route = match directory::get_route(pool, key).await {
        Ok(route) => route,
        Err(e) => {
            warn!(trip = %trip, error = %e, "Observer route read failed, degrading to offline");
            None
        }
    };
    let active_trip = match directory::get_active_trip(pool, key).await {
        Ok(active) => active,
        Err(e) => {
            warn!(trip = %trip, error = %e, "Observer mirror read failed, degrading to offline");
            None
        }
    };
    let last_sample = channel.latest(&trip).await;

    if active_trip.is_none() {
        if let Some(route) = &route {
            if route.active {
                // Status flag without a mirror row: mirror presence is the
                // authoritative truth, the flag self-heals on the next
                // successful set_active
                warn!(trip = %trip, "Route flagged active but mirror row is missing");
            }
        }
    }

    let status = derive_status(&active_trip, &last_sample);

    TripView {
        trip,
        route,
        active_trip,
        last_sample,
        status,
    }
}

fn derive_status(
    active_trip: &Option<ActiveTrip>,
    last_sample: &Option<LocationSample>,
) -> TripStatus {
    if let Some(sample) = last_sample {
        if sample.status == TripStatus::Canceled {
            return TripStatus::Canceled;
        }
    }
    if active_trip.is_some() {
        match last_sample {
            Some(sample) => sample.status,
            None => TripStatus::Started,
        }
    } else {
        TripStatus::Offline
    }
}

/// Active trips a rider can still board: both names appear on the route
/// with the destination after the origin, and the bus has not yet passed
/// the rider's boarding point in the current direction.
pub async fn search_trips(
    pool: &SqlitePool,
    origin: &str,
    destination: &str,
) -> Result<Vec<ActiveTrip>, directory::TripError> {
    let trips = directory::list_active(pool).await?;
    Ok(trips
        .into_iter()
        .filter(|trip| trip_matches(trip, origin, destination))
        .collect())
}

fn trip_matches(trip: &ActiveTrip, origin: &str, destination: &str) -> bool {
    let origin_idx = match trip.waypoints.iter().position(|w| w.name == origin) {
        Some(idx) => idx,
        None => return false,
    };
    let destination_idx = match trip.waypoints.iter().position(|w| w.name == destination) {
        Some(idx) => idx,
        None => return false,
    };
    if destination_idx <= origin_idx {
        return false;
    }

    // A trip with no resolved city yet cannot have passed the boarding
    // point; a city no longer on the waypoint list keeps the trip visible
    // until the next recheck corrects it
    match &trip.current_city {
        None => true,
        Some(city) => trip
            .waypoints
            .iter()
            .position(|w| w.name == *city)
            .map_or(true, |city_idx| city_idx <= origin_idx),
    }
}
