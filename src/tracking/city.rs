//! Per-trip nearest-city tracker.
//!
//! One task per live trip. Event-triggered checks (every admitted location
//! publish) and the periodic recheck both funnel into the same debounced
//! [`recheck_city`] function, so a transient subscription gap cannot stall
//! the observable current city and identical resolutions never write twice.

use sqlx::SqlitePool;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::directory::{self, TripKey, TripError};
use crate::geo;
use crate::tracking::channel::{LiveLocationChannel, LocationSample, TripStatus};

pub(crate) fn spawn_city_tracker(
    pool: SqlitePool,
    channel: LiveLocationChannel,
    key: TripKey,
    recheck_interval_secs: u64,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let trip = key.to_string();
        let mut rx = channel.subscribe();
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(recheck_interval_secs));
        // Skip the first tick which fires immediately
        interval.tick().await;

        loop {
            tokio::select! {
                update = rx.recv() => match update {
                    Ok(update) if update.trip == trip => {
                        match recheck_city(&pool, &key, &update.sample).await {
                            Ok(_) => {}
                            // Stale samples are discarded silently
                            Err(TripError::StaleSample) => {}
                            Err(e) => warn!(trip = %trip, error = %e, "City recheck failed"),
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                    Err(broadcast::error::RecvError::Lagged(_)) => continue,
                },
                _ = interval.tick() => {
                    // Recheck against the last known sample, independent of
                    // new publishes
                    if let Some(sample) = channel.latest(&trip).await {
                        match recheck_city(&pool, &key, &sample).await {
                            Ok(_) => {}
                            Err(TripError::StaleSample) => {}
                            Err(e) => warn!(trip = %trip, error = %e, "Periodic city recheck failed"),
                        }
                    }
                }
            }
        }
    })
}

/// Resolve the waypoint nearest the sample and store it as the trip's
/// current city when the name changed. Returns whether a write was issued.
///
/// A sample referencing a canceled trip yields [`TripError::StaleSample`],
/// which callers drop without surfacing; coordinate-less samples, unknown
/// routes, and empty waypoint lists are discarded silently.
pub(crate) async fn recheck_city(
    pool: &SqlitePool,
    key: &TripKey,
    sample: &LocationSample,
) -> Result<bool, TripError> {
    if sample.status == TripStatus::Canceled {
        return Err(TripError::StaleSample);
    }
    let (Some(lat), Some(lon)) = (sample.latitude, sample.longitude) else {
        return Ok(false);
    };

    let Some(route) = directory::get_route(pool, key).await? else {
        debug!(trip = %key, "Discarding sample for unknown route");
        return Ok(false);
    };

    let Some(nearest) = geo::nearest_waypoint(lat, lon, &route.waypoints) else {
        // Empty waypoint list: leave current_city unset
        return Ok(false);
    };

    if route.current_city.as_deref() == Some(nearest.name.as_str()) {
        return Ok(false);
    }

    directory::set_current_city(pool, key, &nearest.name).await?;
    debug!(trip = %key, city = %nearest.name, "Current city updated");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::{upsert_route, Direction, RoutePatch};
    use crate::geo::Waypoint;
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();
        pool
    }

    fn waypoint(name: &str, lat: f64, lon: f64) -> Waypoint {
        Waypoint {
            name: name.to_string(),
            latitude: lat,
            longitude: lon,
        }
    }

    async fn seed_route(pool: &SqlitePool, key: &TripKey, waypoints: Vec<Waypoint>) {
        let patch = RoutePatch {
            waypoints: Some(waypoints),
            destination_name: Some("C".to_string()),
            direction: None,
        };
        upsert_route(pool, key, &patch).await.unwrap();
    }

    fn sample_at(lat: f64, lon: f64) -> LocationSample {
        LocationSample {
            latitude: Some(lat),
            longitude: Some(lon),
            timestamp: "2026-08-06T12:00:00Z".to_string(),
            status: TripStatus::Started,
            route_name: "line1".to_string(),
            direction: Direction::Forward,
        }
    }

    #[tokio::test]
    async fn repeated_resolutions_write_exactly_once() {
        let pool = test_pool().await;
        let key = TripKey::new("bus1", "line1");
        seed_route(
            &pool,
            &key,
            vec![
                waypoint("A", 0.0, 0.0),
                waypoint("B", 1.0, 0.0),
                waypoint("C", 2.0, 0.0),
            ],
        )
        .await;

        let mut writes = 0;
        for _ in 0..3 {
            if recheck_city(&pool, &key, &sample_at(0.9, 0.0)).await.unwrap() {
                writes += 1;
            }
        }
        assert_eq!(writes, 1);

        let route = directory::get_route(&pool, &key).await.unwrap().unwrap();
        assert_eq!(route.current_city.as_deref(), Some("B"));
    }

    #[tokio::test]
    async fn city_change_writes_again() {
        let pool = test_pool().await;
        let key = TripKey::new("bus1", "line1");
        seed_route(
            &pool,
            &key,
            vec![
                waypoint("A", 0.0, 0.0),
                waypoint("B", 1.0, 0.0),
                waypoint("C", 2.0, 0.0),
            ],
        )
        .await;

        assert!(recheck_city(&pool, &key, &sample_at(0.9, 0.0)).await.unwrap());
        assert!(recheck_city(&pool, &key, &sample_at(1.9, 0.0)).await.unwrap());

        let route = directory::get_route(&pool, &key).await.unwrap().unwrap();
        assert_eq!(route.current_city.as_deref(), Some("C"));
    }

    #[tokio::test]
    async fn canceled_sample_is_discarded() {
        let pool = test_pool().await;
        let key = TripKey::new("bus1", "line1");
        seed_route(
            &pool,
            &key,
            vec![waypoint("A", 0.0, 0.0), waypoint("B", 1.0, 0.0)],
        )
        .await;

        let mut sample = sample_at(0.9, 0.0);
        sample.status = TripStatus::Canceled;
        let err = recheck_city(&pool, &key, &sample).await.unwrap_err();
        assert!(matches!(err, TripError::StaleSample));

        let route = directory::get_route(&pool, &key).await.unwrap().unwrap();
        assert!(route.current_city.is_none());
    }

    #[tokio::test]
    async fn empty_waypoint_list_leaves_city_unset() {
        let pool = test_pool().await;
        let key = TripKey::new("bus1", "line1");
        let patch = RoutePatch {
            waypoints: Some(vec![]),
            ..Default::default()
        };
        upsert_route(&pool, &key, &patch).await.unwrap();

        assert!(!recheck_city(&pool, &key, &sample_at(0.5, 0.0)).await.unwrap());
        let route = directory::get_route(&pool, &key).await.unwrap().unwrap();
        assert!(route.current_city.is_none());
    }

    #[tokio::test]
    async fn unknown_route_is_discarded_silently() {
        let pool = test_pool().await;
        let key = TripKey::new("ghost", "line");
        assert!(!recheck_city(&pool, &key, &sample_at(0.5, 0.0)).await.unwrap());
    }
}
