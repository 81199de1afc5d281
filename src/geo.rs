//! Great-circle geometry for nearest-waypoint resolution.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A named geographic point on a route (origin, destination, or
/// intermediate stop).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct Waypoint {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
}

/// Great-circle distance in meters between two coordinates.
pub fn haversine_distance(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().asin();

    EARTH_RADIUS_M * c
}

/// Nearest waypoint to a position. Ties break to the first occurrence in
/// list order; an empty list yields `None`.
pub fn nearest_waypoint<'a>(lat: f64, lon: f64, waypoints: &'a [Waypoint]) -> Option<&'a Waypoint> {
    let mut best: Option<(&Waypoint, f64)> = None;

    for waypoint in waypoints {
        let dist = haversine_distance(lat, lon, waypoint.latitude, waypoint.longitude);
        // Strict inequality keeps the earliest waypoint on equal distance;
        // a NaN distance never replaces an existing candidate.
        if best.map_or(true, |(_, d)| dist < d) {
            best = Some((waypoint, dist));
        }
    }

    best.map(|(waypoint, _)| waypoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn waypoint(name: &str, lat: f64, lon: f64) -> Waypoint {
        Waypoint {
            name: name.to_string(),
            latitude: lat,
            longitude: lon,
        }
    }

    #[test]
    fn haversine_one_degree_longitude_at_equator() {
        // One degree of longitude at the equator is ~111.195 km
        let dist = haversine_distance(0.0, 0.0, 0.0, 1.0);
        assert!((dist - 111_195.0).abs() < 100.0, "got {dist}");
    }

    #[test]
    fn haversine_zero_for_identical_points() {
        assert_eq!(haversine_distance(48.37, 10.89, 48.37, 10.89), 0.0);
    }

    #[test]
    fn nearest_at_exact_waypoint_returns_that_waypoint() {
        let waypoints = vec![
            waypoint("A", 0.0, 0.0),
            waypoint("B", 1.0, 0.0),
            waypoint("C", 2.0, 0.0),
        ];
        for expected in &waypoints {
            let found =
                nearest_waypoint(expected.latitude, expected.longitude, &waypoints).unwrap();
            assert_eq!(found.name, expected.name);
        }
    }

    #[test]
    fn nearest_picks_minimum_distance() {
        let waypoints = vec![
            waypoint("A", 0.0, 0.0),
            waypoint("B", 1.0, 0.0),
            waypoint("C", 2.0, 0.0),
        ];
        let found = nearest_waypoint(0.9, 0.0, &waypoints).unwrap();
        assert_eq!(found.name, "B");
    }

    #[test]
    fn nearest_tie_breaks_to_first_occurrence() {
        let waypoints = vec![
            waypoint("first", 10.0, 10.0),
            waypoint("second", 10.0, 10.0),
        ];
        let found = nearest_waypoint(10.0, 10.0, &waypoints).unwrap();
        assert_eq!(found.name, "first");
    }

    #[test]
    fn nearest_on_empty_list_is_none() {
        assert!(nearest_waypoint(0.0, 0.0, &[]).is_none());
    }
}
