//! Trip lifecycle control.
//!
//! The engine owns one explicit session object per live trip (started-at
//! timestamp plus the city-tracker task handle) and drives every
//! start/cancel transition, writing the directory and the live channel
//! together. No state lives outside the engine.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::config::TrackingConfig;
use crate::directory::{self, Direction, TripError, TripKey};
use crate::tracking::channel::{LiveLocationChannel, LocationSample, TripStatus};
use crate::tracking::city;

/// Live state of one started trip. Exists only between start and cancel.
struct TripSession {
    started_at: DateTime<Utc>,
    city_task: JoinHandle<()>,
}

/// Coordinates ride lifecycle state across the durable directory and the
/// live location channel.
pub struct TrackingEngine {
    pool: SqlitePool,
    channel: LiveLocationChannel,
    sessions: Arc<RwLock<HashMap<String, TripSession>>>,
    config: TrackingConfig,
}

impl TrackingEngine {
    pub fn new(pool: SqlitePool, config: TrackingConfig) -> Self {
        let channel = LiveLocationChannel::new(&config);
        Self {
            pool,
            channel,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// Get a handle to the live location channel for API access
    pub fn channel(&self) -> LiveLocationChannel {
        self.channel.clone()
    }

    pub async fn live_trip_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Run the background staleness sweep loop.
    pub async fn start(self: Arc<Self>) {
        info!("Starting tracking engine");

        let sweep_secs = self.config.offline_after_secs;
        let offline_after = chrono::Duration::seconds(sweep_secs as i64);
        let sweep_self = self.clone();
        let sweep_handle = tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(tokio::time::Duration::from_secs(sweep_secs));
            // Skip the first tick which fires immediately
            interval.tick().await;

            loop {
                interval.tick().await;
                let flipped = sweep_self.channel.sweep_stale(offline_after).await;
                if flipped > 0 {
                    info!(count = flipped, "Marked silent trips offline");
                }
            }
        });

        let _ = tokio::join!(sweep_handle);
    }

    /// Load the trip's route and derive the two-element destination option
    /// set (the terminal waypoints in current read order). Read-only.
    pub async fn select_route(&self, key: &TripKey) -> Result<Vec<String>, TripError> {
        let route = directory::get_route(&self.pool, key)
            .await?
            .ok_or_else(|| TripError::Validation(format!("no route stored for trip {key}")))?;

        let (Some(first), Some(last)) = (route.waypoints.first(), route.waypoints.last()) else {
            return Err(TripError::Validation(
                "route has no waypoints".to_string(),
            ));
        };
        if route.waypoints.len() < 2 {
            return Err(TripError::Validation(
                "route has fewer than two waypoints".to_string(),
            ));
        }

        Ok(vec![first.name.clone(), last.name.clone()])
    }

    /// Select the travel destination. Choosing the stored destination again
    /// is a no-op; choosing the opposite terminal reverses the route. Any
    /// other name is rejected - the driver UI only ever offers the two
    /// terminals.
    pub async fn change_destination(&self, key: &TripKey, chosen: &str) -> Result<(), TripError> {
        let route = directory::get_route(&self.pool, key)
            .await?
            .ok_or_else(|| TripError::Validation(format!("no route stored for trip {key}")))?;

        if route.destination_name.as_deref() == Some(chosen) {
            debug!(trip = %key, destination = chosen, "Destination unchanged");
            return Ok(());
        }

        let (Some(first), Some(last)) = (route.waypoints.first(), route.waypoints.last()) else {
            return Err(TripError::Validation(
                "route has no waypoints".to_string(),
            ));
        };

        if chosen == first.name {
            directory::reverse_direction(&self.pool, key).await
        } else if chosen == last.name {
            // Forward terminal chosen but no label stored yet: record it
            // without reversing
            let patch = directory::RoutePatch {
                destination_name: Some(chosen.to_string()),
                ..Default::default()
            };
            directory::upsert_route(&self.pool, key, &patch).await
        } else {
            Err(TripError::Validation(format!(
                "'{chosen}' is not a terminal waypoint of this route"
            )))
        }
    }

    /// Start the trip: validate the selection, flip the directory's
    /// status/mirror pair, open the location write path, and spawn the
    /// city tracker. A persistence failure leaves nothing opened and the
    /// call is safely retriable. Starting an already-live trip is a no-op.
    pub async fn start_trip(&self, key: &TripKey) -> Result<(), TripError> {
        {
            let sessions = self.sessions.read().await;
            if sessions.contains_key(&key.to_string()) {
                debug!(trip = %key, "Trip already started");
                return Ok(());
            }
        }

        let route = directory::get_route(&self.pool, key)
            .await?
            .ok_or_else(|| TripError::Validation(format!("no route selected for trip {key}")))?;
        if route.waypoints.len() < 2 {
            return Err(TripError::Validation(
                "route has fewer than two waypoints".to_string(),
            ));
        }
        let destination = route
            .destination_name
            .clone()
            .ok_or_else(|| TripError::Validation("no destination selected".to_string()))?;

        directory::set_active(&self.pool, key, true, Some(&destination), Some(route.direction))
            .await?;

        // Directory write succeeded: open the channel write path and the
        // city tracker subscription
        self.channel
            .publish_status(
                key,
                LocationSample::status_only(key, TripStatus::Started, route.direction),
            )
            .await;

        let city_task = city::spawn_city_tracker(
            self.pool.clone(),
            self.channel.clone(),
            key.clone(),
            self.config.city_recheck_interval_secs,
        );

        let mut sessions = self.sessions.write().await;
        sessions.insert(
            key.to_string(),
            TripSession {
                started_at: Utc::now(),
                city_task,
            },
        );

        info!(trip = %key, destination = %destination, "Trip started");
        Ok(())
    }

    /// Cancel the trip. The session is removed and the city task aborted
    /// before the terminal writes so no in-flight recheck can resurrect a
    /// canceled trip's coordinates. Safe to call when already idle.
    pub async fn cancel_trip(&self, key: &TripKey) -> Result<(), TripError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(&key.to_string())
        };
        if let Some(session) = &session {
            session.city_task.abort();
        }

        let direction = match directory::get_route(&self.pool, key).await? {
            Some(route) => route.direction,
            None => Direction::Forward,
        };

        // Terminal sample first (coordinates omitted), then the directory
        // flip; observers treat canceled in either store as authoritative
        self.channel
            .publish_status(
                key,
                LocationSample::status_only(key, TripStatus::Canceled, direction),
            )
            .await;

        directory::set_active(&self.pool, key, false, None, None).await?;

        match session {
            Some(session) => {
                let duration_secs = Utc::now()
                    .signed_duration_since(session.started_at)
                    .num_seconds();
                info!(trip = %key, duration_secs, "Trip canceled");
            }
            None => debug!(trip = %key, "Cancel for trip with no live session"),
        }
        Ok(())
    }

    /// Driver write path for one GPS fix. Fixes for trips with no live
    /// session are discarded silently. Returns whether the fix was
    /// admitted by the channel's delta gate.
    pub async fn publish_fix(
        &self,
        key: &TripKey,
        latitude: f64,
        longitude: f64,
    ) -> Result<bool, TripError> {
        let live = {
            let sessions = self.sessions.read().await;
            sessions.contains_key(&key.to_string())
        };
        if !live {
            debug!(trip = %key, "Discarding location fix for trip with no live session");
            return Ok(false);
        }

        let direction = match directory::get_route(&self.pool, key).await? {
            Some(route) => route.direction,
            None => Direction::Forward,
        };

        let sample = LocationSample::fix(key, latitude, longitude, direction);
        Ok(self.channel.publish_fix(key, sample).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::RoutePatch;
    use crate::geo::Waypoint;
    use crate::tracking::{city::recheck_city, feed};
    use sqlx::sqlite::SqlitePoolOptions;

    async fn test_engine() -> (TrackingEngine, SqlitePool) {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        sqlx::migrate!("./migrations").run(&pool).await.unwrap();

        // Long intervals keep the background tasks quiet during tests
        let config = TrackingConfig {
            city_recheck_interval_secs: 3600,
            offline_after_secs: 3600,
            ..TrackingConfig::default()
        };
        (TrackingEngine::new(pool.clone(), config), pool)
    }

    fn waypoint(name: &str, lat: f64, lon: f64) -> Waypoint {
        Waypoint {
            name: name.to_string(),
            latitude: lat,
            longitude: lon,
        }
    }

    async fn seed_abc(pool: &SqlitePool, key: &TripKey, destination: Option<&str>) {
        let patch = RoutePatch {
            waypoints: Some(vec![
                waypoint("A", 0.0, 0.0),
                waypoint("B", 1.0, 0.0),
                waypoint("C", 2.0, 0.0),
            ]),
            destination_name: destination.map(|d| d.to_string()),
            direction: None,
        };
        directory::upsert_route(pool, key, &patch).await.unwrap();
    }

    #[tokio::test]
    async fn select_route_offers_both_terminals() {
        let (engine, pool) = test_engine().await;
        let key = TripKey::new("bus1", "line1");
        seed_abc(&pool, &key, Some("C")).await;

        let options = engine.select_route(&key).await.unwrap();
        assert_eq!(options, vec!["A".to_string(), "C".to_string()]);
    }

    #[tokio::test]
    async fn start_without_route_is_validation_error() {
        let (engine, _pool) = test_engine().await;
        let key = TripKey::new("ghost", "line");

        let err = engine.start_trip(&key).await.unwrap_err();
        assert!(matches!(err, TripError::Validation(_)));
    }

    #[tokio::test]
    async fn start_without_destination_is_validation_error() {
        let (engine, pool) = test_engine().await;
        let key = TripKey::new("bus1", "line1");
        seed_abc(&pool, &key, None).await;

        let err = engine.start_trip(&key).await.unwrap_err();
        assert!(matches!(err, TripError::Validation(_)));

        // Failed start leaves no state behind
        let route = directory::get_route(&pool, &key).await.unwrap().unwrap();
        assert!(!route.active);
        assert_eq!(engine.live_trip_count().await, 0);
    }

    #[tokio::test]
    async fn change_destination_is_idempotent() {
        let (engine, pool) = test_engine().await;
        let key = TripKey::new("bus1", "line1");
        seed_abc(&pool, &key, Some("C")).await;

        engine.change_destination(&key, "A").await.unwrap();
        let after_first = directory::get_route(&pool, &key).await.unwrap().unwrap();
        let names_first: Vec<String> =
            after_first.waypoints.iter().map(|w| w.name.clone()).collect();
        assert_eq!(names_first, vec!["C", "B", "A"]);
        assert_eq!(after_first.direction, Direction::Reversed);

        // Same choice again: no second reversal
        engine.change_destination(&key, "A").await.unwrap();
        let after_second = directory::get_route(&pool, &key).await.unwrap().unwrap();
        let names_second: Vec<String> =
            after_second.waypoints.iter().map(|w| w.name.clone()).collect();
        assert_eq!(names_second, names_first);
        assert_eq!(after_second.direction, Direction::Reversed);
    }

    #[tokio::test]
    async fn change_destination_rejects_non_terminal() {
        let (engine, pool) = test_engine().await;
        let key = TripKey::new("bus1", "line1");
        seed_abc(&pool, &key, Some("C")).await;

        let err = engine.change_destination(&key, "B").await.unwrap_err();
        assert!(matches!(err, TripError::Validation(_)));
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (engine, pool) = test_engine().await;
        let key = TripKey::new("bus1", "line1");
        seed_abc(&pool, &key, Some("C")).await;

        engine.start_trip(&key).await.unwrap();
        engine.cancel_trip(&key).await.unwrap();
        engine.cancel_trip(&key).await.unwrap();

        let route = directory::get_route(&pool, &key).await.unwrap().unwrap();
        assert!(!route.active);
        assert!(directory::get_active_trip(&pool, &key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stale_fix_after_cancel_is_discarded() {
        let (engine, pool) = test_engine().await;
        let key = TripKey::new("bus1", "line1");
        seed_abc(&pool, &key, Some("C")).await;

        engine.start_trip(&key).await.unwrap();
        assert!(engine.publish_fix(&key, 0.9, 0.0).await.unwrap());
        engine.cancel_trip(&key).await.unwrap();

        // A late in-flight fix must not resurrect the trip
        assert!(!engine.publish_fix(&key, 0.95, 0.0).await.unwrap());

        let channel = engine.channel();
        let view = feed::trip_snapshot(&pool, &channel, &key).await;
        assert_eq!(view.status, TripStatus::Canceled);
    }

    #[tokio::test]
    async fn full_trip_scenario() {
        let (engine, pool) = test_engine().await;
        let key = TripKey::new("bus1", "line1");
        seed_abc(&pool, &key, Some("C")).await;
        let channel = engine.channel();

        engine.start_trip(&key).await.unwrap();
        assert!(directory::get_active_trip(&pool, &key).await.unwrap().is_some());

        // First fix near B: city resolves to B. The spawned tracker task
        // may or may not have processed the broadcast yet, so drive the
        // recheck directly and assert on the stored state.
        assert!(engine.publish_fix(&key, 0.9, 0.0).await.unwrap());
        let sample = channel.latest(&key.to_string()).await.unwrap();
        recheck_city(&pool, &key, &sample).await.unwrap();
        let route = directory::get_route(&pool, &key).await.unwrap().unwrap();
        assert_eq!(route.current_city.as_deref(), Some("B"));

        // Second fix still nearest B: the debounce issues no second write
        assert!(engine.publish_fix(&key, 0.91, 0.0).await.unwrap());
        let sample = channel.latest(&key.to_string()).await.unwrap();
        assert!(!recheck_city(&pool, &key, &sample).await.unwrap());

        // Destination change mid-trip reverses the route
        engine.change_destination(&key, "A").await.unwrap();
        let route = directory::get_route(&pool, &key).await.unwrap().unwrap();
        let names: Vec<&str> = route.waypoints.iter().map(|w| w.name.as_str()).collect();
        assert_eq!(names, vec!["C", "B", "A"]);
        assert_eq!(route.direction, Direction::Reversed);

        // Cancel: terminal sample, mirror gone, flag cleared
        engine.cancel_trip(&key).await.unwrap();
        let sample = channel.latest(&key.to_string()).await.unwrap();
        assert_eq!(sample.status, TripStatus::Canceled);
        assert!(sample.latitude.is_none());
        assert!(directory::get_active_trip(&pool, &key).await.unwrap().is_none());
        let route = directory::get_route(&pool, &key).await.unwrap().unwrap();
        assert!(!route.active);
    }

    #[tokio::test]
    async fn restart_after_cancel_reopens_tracking() {
        let (engine, pool) = test_engine().await;
        let key = TripKey::new("bus1", "line1");
        seed_abc(&pool, &key, Some("C")).await;

        engine.start_trip(&key).await.unwrap();
        engine.cancel_trip(&key).await.unwrap();
        engine.start_trip(&key).await.unwrap();

        assert!(engine.publish_fix(&key, 0.5, 0.0).await.unwrap());
        assert!(directory::get_active_trip(&pool, &key).await.unwrap().is_some());
    }
}
