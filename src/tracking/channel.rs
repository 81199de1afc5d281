//! Live location channel: keyed last-value store with broadcast fan-out.
//!
//! One record per trip, overwritten on every admitted publish; no history
//! is retained. Many readers, one writer per trip.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, RwLock};
use utoipa::ToSchema;

use crate::config::TrackingConfig;
use crate::directory::{Direction, TripKey};
use crate::geo::haversine_distance;

/// Lifecycle status carried by a location sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TripStatus {
    Started,
    Canceled,
    Offline,
}

/// The single current record for a trip. Coordinates are absent on the
/// terminal canceled sample and on the opening started sample.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct LocationSample {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    /// RFC 3339 timestamp of the sample
    pub timestamp: String,
    pub status: TripStatus,
    pub route_name: String,
    pub direction: Direction,
}

impl LocationSample {
    pub fn status_only(key: &TripKey, status: TripStatus, direction: Direction) -> Self {
        Self {
            latitude: None,
            longitude: None,
            timestamp: Utc::now().to_rfc3339(),
            status,
            route_name: key.route_name.clone(),
            direction,
        }
    }

    pub fn fix(key: &TripKey, latitude: f64, longitude: f64, direction: Direction) -> Self {
        Self {
            latitude: Some(latitude),
            longitude: Some(longitude),
            timestamp: Utc::now().to_rfc3339(),
            status: TripStatus::Started,
            route_name: key.route_name.clone(),
            direction,
        }
    }
}

/// Update notification delivered to every subscriber.
#[derive(Debug, Clone)]
pub struct LocationUpdate {
    pub trip: String,
    pub sample: LocationSample,
}

pub type LocationUpdateSender = broadcast::Sender<LocationUpdate>;

#[derive(Clone)]
pub struct LiveLocationChannel {
    samples: Arc<RwLock<HashMap<String, LocationSample>>>,
    updates_tx: LocationUpdateSender,
    min_distance_m: f64,
    min_interval: Duration,
}

impl LiveLocationChannel {
    pub fn new(config: &TrackingConfig) -> Self {
        let (updates_tx, _) = broadcast::channel(config.broadcast_capacity);
        Self {
            samples: Arc::new(RwLock::new(HashMap::new())),
            updates_tx,
            min_distance_m: config.min_publish_distance_m,
            min_interval: Duration::seconds(config.min_publish_interval_secs as i64),
        }
    }

    /// Every admitted publish, including synthetic canceled/offline values,
    /// reaches all current subscribers. Lagged receivers skip ahead.
    pub fn subscribe(&self) -> broadcast::Receiver<LocationUpdate> {
        self.updates_tx.subscribe()
    }

    /// Latest sample for a trip, if any has been published.
    pub async fn latest(&self, trip: &str) -> Option<LocationSample> {
        self.samples.read().await.get(trip).cloned()
    }

    pub async fn sample_count(&self) -> usize {
        self.samples.read().await.len()
    }

    /// Publish a coordinate fix. Returns whether the fix was admitted: a
    /// fix that moved less than the distance delta AND arrived within the
    /// interval delta of the stored sample is dropped, and a fix against a
    /// canceled trip is discarded outright (only a fresh started status
    /// reopens the key).
    pub async fn publish_fix(&self, key: &TripKey, sample: LocationSample) -> bool {
        let trip = key.to_string();
        let mut samples = self.samples.write().await;

        if let Some(prev) = samples.get(&trip) {
            if prev.status == TripStatus::Canceled {
                tracing::debug!(trip = %trip, "Discarding coordinate fix for canceled trip");
                return false;
            }
            if prev.status == TripStatus::Started {
                if let (Some(plat), Some(plon), Some(lat), Some(lon)) =
                    (prev.latitude, prev.longitude, sample.latitude, sample.longitude)
                {
                    let moved = haversine_distance(plat, plon, lat, lon);
                    let interval_elapsed = match (
                        DateTime::parse_from_rfc3339(&prev.timestamp),
                        DateTime::parse_from_rfc3339(&sample.timestamp),
                    ) {
                        (Ok(prev_ts), Ok(new_ts)) => {
                            new_ts.signed_duration_since(prev_ts) >= self.min_interval
                        }
                        // Unparseable timestamps never gate a fix
                        _ => true,
                    };
                    if moved < self.min_distance_m && !interval_elapsed {
                        return false;
                    }
                }
            }
        }

        samples.insert(trip.clone(), sample.clone());
        drop(samples);

        // Ignore send errors - they just mean no one is listening
        let _ = self.updates_tx.send(LocationUpdate { trip, sample });
        true
    }

    /// Publish a lifecycle status transition. Always overwrites, bypassing
    /// both the delta gate and the terminal guard.
    pub async fn publish_status(&self, key: &TripKey, sample: LocationSample) {
        let trip = key.to_string();
        {
            let mut samples = self.samples.write().await;
            samples.insert(trip.clone(), sample.clone());
        }
        let _ = self.updates_tx.send(LocationUpdate { trip, sample });
    }

    /// Flip started samples that have gone silent to offline and broadcast
    /// the transition. Returns how many samples were flipped.
    pub async fn sweep_stale(&self, offline_after: Duration) -> usize {
        let now = Utc::now();
        let mut flipped = Vec::new();

        {
            let mut samples = self.samples.write().await;
            for (trip, sample) in samples.iter_mut() {
                if sample.status != TripStatus::Started {
                    continue;
                }
                if let Ok(ts) = DateTime::parse_from_rfc3339(&sample.timestamp) {
                    if now.signed_duration_since(ts.with_timezone(&Utc)) > offline_after {
                        sample.status = TripStatus::Offline;
                        flipped.push((trip.clone(), sample.clone()));
                    }
                }
            }
        }

        let count = flipped.len();
        for (trip, sample) in flipped {
            let _ = self.updates_tx.send(LocationUpdate { trip, sample });
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_channel() -> LiveLocationChannel {
        LiveLocationChannel::new(&TrackingConfig::default())
    }

    fn key() -> TripKey {
        TripKey::new("bus1", "line1")
    }

    fn fix_at(lat: f64, lon: f64, timestamp: &str) -> LocationSample {
        LocationSample {
            latitude: Some(lat),
            longitude: Some(lon),
            timestamp: timestamp.to_string(),
            status: TripStatus::Started,
            route_name: "line1".to_string(),
            direction: Direction::Forward,
        }
    }

    #[tokio::test]
    async fn fix_below_both_deltas_is_dropped() {
        let channel = test_channel();
        let key = key();

        assert!(channel.publish_fix(&key, fix_at(0.0, 0.0, "2026-08-06T12:00:00Z")).await);
        // ~1.1 m north, 2 seconds later: under 10 m and under 5 s
        let admitted = channel
            .publish_fix(&key, fix_at(0.00001, 0.0, "2026-08-06T12:00:02Z"))
            .await;
        assert!(!admitted);

        let latest = channel.latest(&key.to_string()).await.unwrap();
        assert_eq!(latest.latitude, Some(0.0));
    }

    #[tokio::test]
    async fn fix_beyond_distance_delta_is_admitted() {
        let channel = test_channel();
        let key = key();

        assert!(channel.publish_fix(&key, fix_at(0.0, 0.0, "2026-08-06T12:00:00Z")).await);
        // ~111 m north, immediately: distance threshold alone admits it
        let admitted = channel
            .publish_fix(&key, fix_at(0.001, 0.0, "2026-08-06T12:00:01Z"))
            .await;
        assert!(admitted);
    }

    #[tokio::test]
    async fn fix_beyond_interval_delta_is_admitted() {
        let channel = test_channel();
        let key = key();

        assert!(channel.publish_fix(&key, fix_at(0.0, 0.0, "2026-08-06T12:00:00Z")).await);
        // Barely moved, but 10 seconds later: interval threshold admits it
        let admitted = channel
            .publish_fix(&key, fix_at(0.00001, 0.0, "2026-08-06T12:00:10Z"))
            .await;
        assert!(admitted);
    }

    #[tokio::test]
    async fn canceled_trip_discards_late_fixes() {
        let channel = test_channel();
        let key = key();

        assert!(channel.publish_fix(&key, fix_at(0.5, 0.0, "2026-08-06T12:00:00Z")).await);
        channel
            .publish_status(
                &key,
                LocationSample::status_only(&key, TripStatus::Canceled, Direction::Forward),
            )
            .await;

        // A stale in-flight fix must not resurrect the trip's coordinates
        let admitted = channel
            .publish_fix(&key, fix_at(0.6, 0.0, "2026-08-06T12:05:00Z"))
            .await;
        assert!(!admitted);
        let latest = channel.latest(&key.to_string()).await.unwrap();
        assert_eq!(latest.status, TripStatus::Canceled);
        assert!(latest.latitude.is_none());
    }

    #[tokio::test]
    async fn started_status_reopens_canceled_key() {
        let channel = test_channel();
        let key = key();

        channel
            .publish_status(
                &key,
                LocationSample::status_only(&key, TripStatus::Canceled, Direction::Forward),
            )
            .await;
        channel
            .publish_status(
                &key,
                LocationSample::status_only(&key, TripStatus::Started, Direction::Forward),
            )
            .await;

        let admitted = channel
            .publish_fix(&key, fix_at(0.5, 0.0, "2026-08-06T12:00:00Z"))
            .await;
        assert!(admitted);
    }

    #[tokio::test]
    async fn subscribers_receive_admitted_publishes() {
        let channel = test_channel();
        let key = key();
        let mut rx = channel.subscribe();

        channel
            .publish_fix(&key, fix_at(1.0, 2.0, "2026-08-06T12:00:00Z"))
            .await;

        let update = rx.recv().await.unwrap();
        assert_eq!(update.trip, "bus1-line1");
        assert_eq!(update.sample.latitude, Some(1.0));
        assert_eq!(update.sample.longitude, Some(2.0));
    }

    #[tokio::test]
    async fn sweep_flips_silent_started_samples_to_offline() {
        let channel = test_channel();
        let key = key();

        // A sample stamped far in the past is well beyond any offline window
        channel
            .publish_fix(&key, fix_at(0.0, 0.0, "2020-01-01T00:00:00Z"))
            .await;

        let flipped = channel.sweep_stale(Duration::seconds(90)).await;
        assert_eq!(flipped, 1);
        let latest = channel.latest(&key.to_string()).await.unwrap();
        assert_eq!(latest.status, TripStatus::Offline);

        // Second sweep has nothing left to flip
        assert_eq!(channel.sweep_stale(Duration::seconds(90)).await, 0);
    }
}
