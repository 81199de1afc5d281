//! Durable route directory.
//!
//! Two partitions in one SQLite database: `routes` holds the authoritative
//! per-trip record, `active_trips` mirrors the subset of routes that are
//! currently live. A mirror row exists iff the route's active flag is set;
//! the pair is only ever flipped together inside one transaction.

use std::fmt;

use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::debug;
use utoipa::ToSchema;

use crate::geo::Waypoint;

/// Identifier of one trip: `{bus_id}-{route_name}` on the wire, a column
/// pair in storage. Bus ids must not contain `-`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TripKey {
    pub bus_id: String,
    pub route_name: String,
}

impl TripKey {
    pub fn new(bus_id: impl Into<String>, route_name: impl Into<String>) -> Self {
        Self {
            bus_id: bus_id.into(),
            route_name: route_name.into(),
        }
    }

    /// Parse a `{bus_id}-{route_name}` wire key. Splits on the first dash.
    pub fn parse(raw: &str) -> Option<Self> {
        let (bus_id, route_name) = raw.split_once('-')?;
        if bus_id.is_empty() || route_name.is_empty() {
            return None;
        }
        Some(Self::new(bus_id, route_name))
    }
}

impl fmt::Display for TripKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.bus_id, self.route_name)
    }
}

/// Read order of a route's waypoint list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Forward,
    Reversed,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Forward => "forward",
            Direction::Reversed => "reversed",
        }
    }

    pub fn from_db(raw: &str) -> Self {
        match raw {
            "reversed" => Direction::Reversed,
            _ => Direction::Forward,
        }
    }

    pub fn flipped(self) -> Self {
        match self {
            Direction::Forward => Direction::Reversed,
            Direction::Reversed => Direction::Forward,
        }
    }
}

/// The authoritative route record.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct Route {
    pub bus_id: String,
    pub route_name: String,
    pub waypoints: Vec<Waypoint>,
    pub direction: Direction,
    /// Name of the waypoint nearest the bus's last known position
    pub current_city: Option<String>,
    pub active: bool,
    pub destination_name: Option<String>,
    pub updated_at: String,
}

/// One row of the active-trip mirror partition. Its existence is the
/// authoritative signal that the trip is live.
#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct ActiveTrip {
    pub bus_id: String,
    pub route_name: String,
    pub waypoints: Vec<Waypoint>,
    pub direction: Direction,
    pub current_city: Option<String>,
    pub destination_name: Option<String>,
    pub started_at: String,
    pub updated_at: String,
}

/// Merge-style partial update of route metadata. Unspecified fields are
/// left untouched.
#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
pub struct RoutePatch {
    pub waypoints: Option<Vec<Waypoint>>,
    pub destination_name: Option<String>,
    pub direction: Option<Direction>,
}

#[derive(Debug, FromRow)]
struct RouteRow {
    bus_id: String,
    route_name: String,
    waypoints: String,
    direction: String,
    current_city: Option<String>,
    active: i64,
    destination_name: Option<String>,
    updated_at: String,
}

#[derive(Debug, FromRow)]
struct ActiveTripRow {
    bus_id: String,
    route_name: String,
    waypoints: String,
    direction: String,
    current_city: Option<String>,
    destination_name: Option<String>,
    started_at: String,
    updated_at: String,
}

fn encode_waypoints(waypoints: &[Waypoint]) -> Result<String, TripError> {
    serde_json::to_string(waypoints).map_err(|e| TripError::Persistence(e.to_string()))
}

fn decode_waypoints(raw: &str) -> Result<Vec<Waypoint>, TripError> {
    serde_json::from_str(raw)
        .map_err(|e| TripError::InconsistentState(format!("corrupt waypoint list: {e}")))
}

fn decode_route(row: RouteRow) -> Result<Route, TripError> {
    Ok(Route {
        waypoints: decode_waypoints(&row.waypoints)?,
        direction: Direction::from_db(&row.direction),
        bus_id: row.bus_id,
        route_name: row.route_name,
        current_city: row.current_city,
        active: row.active != 0,
        destination_name: row.destination_name,
        updated_at: row.updated_at,
    })
}

fn decode_active_trip(row: ActiveTripRow) -> Result<ActiveTrip, TripError> {
    Ok(ActiveTrip {
        waypoints: decode_waypoints(&row.waypoints)?,
        direction: Direction::from_db(&row.direction),
        bus_id: row.bus_id,
        route_name: row.route_name,
        current_city: row.current_city,
        destination_name: row.destination_name,
        started_at: row.started_at,
        updated_at: row.updated_at,
    })
}

/// Point read of the authoritative route record.
pub async fn get_route(pool: &SqlitePool, key: &TripKey) -> Result<Option<Route>, TripError> {
    let row: Option<RouteRow> = sqlx::query_as(
        r#"
        SELECT bus_id, route_name, waypoints, direction, current_city, active,
               destination_name, updated_at
        FROM routes
        WHERE bus_id = ?1 AND route_name = ?2
        "#,
    )
    .bind(&key.bus_id)
    .bind(&key.route_name)
    .fetch_optional(pool)
    .await
    .map_err(|e| TripError::Persistence(e.to_string()))?;

    row.map(decode_route).transpose()
}

/// Point read of the mirror partition.
pub async fn get_active_trip(
    pool: &SqlitePool,
    key: &TripKey,
) -> Result<Option<ActiveTrip>, TripError> {
    let row: Option<ActiveTripRow> = sqlx::query_as(
        r#"
        SELECT bus_id, route_name, waypoints, direction, current_city,
               destination_name, started_at, updated_at
        FROM active_trips
        WHERE bus_id = ?1 AND route_name = ?2
        "#,
    )
    .bind(&key.bus_id)
    .bind(&key.route_name)
    .fetch_optional(pool)
    .await
    .map_err(|e| TripError::Persistence(e.to_string()))?;

    row.map(decode_active_trip).transpose()
}

/// All rows of the mirror partition.
pub async fn list_active(pool: &SqlitePool) -> Result<Vec<ActiveTrip>, TripError> {
    let rows: Vec<ActiveTripRow> = sqlx::query_as(
        r#"
        SELECT bus_id, route_name, waypoints, direction, current_city,
               destination_name, started_at, updated_at
        FROM active_trips
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| TripError::Persistence(e.to_string()))?;

    rows.into_iter().map(decode_active_trip).collect()
}

/// Merge-style upsert of route metadata. Fields absent from the patch keep
/// their stored values; a fresh row gets an empty waypoint list and the
/// forward direction unless the patch says otherwise.
pub async fn upsert_route(
    pool: &SqlitePool,
    key: &TripKey,
    patch: &RoutePatch,
) -> Result<(), TripError> {
    let waypoints_json = match &patch.waypoints {
        Some(waypoints) => Some(encode_waypoints(waypoints)?),
        None => None,
    };
    let direction = patch.direction.map(|d| d.as_str());

    sqlx::query(
        r#"
        INSERT INTO routes (bus_id, route_name, waypoints, direction, destination_name, updated_at)
        VALUES (?1, ?2, COALESCE(?3, '[]'), COALESCE(?4, 'forward'), ?5, datetime('now'))
        ON CONFLICT(bus_id, route_name) DO UPDATE SET
            waypoints = COALESCE(?3, routes.waypoints),
            direction = COALESCE(?4, routes.direction),
            destination_name = COALESCE(?5, routes.destination_name),
            updated_at = datetime('now')
        "#,
    )
    .bind(&key.bus_id)
    .bind(&key.route_name)
    .bind(waypoints_json)
    .bind(direction)
    .bind(&patch.destination_name)
    .execute(pool)
    .await
    .map_err(|e| TripError::Persistence(e.to_string()))?;

    Ok(())
}

/// Flip the route's active flag and the mirror row together, in one
/// transaction. Idempotent in both directions: activating twice refreshes
/// the mirror snapshot but keeps its original `started_at`, deactivating a
/// trip that is already idle is a no-op.
pub async fn set_active(
    pool: &SqlitePool,
    key: &TripKey,
    active: bool,
    destination_name: Option<&str>,
    direction: Option<Direction>,
) -> Result<(), TripError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| TripError::Persistence(e.to_string()))?;

    if active {
        let result = sqlx::query(
            r#"
            UPDATE routes SET
                active = 1,
                destination_name = COALESCE(?3, destination_name),
                direction = COALESCE(?4, direction),
                updated_at = datetime('now')
            WHERE bus_id = ?1 AND route_name = ?2
            "#,
        )
        .bind(&key.bus_id)
        .bind(&key.route_name)
        .bind(destination_name)
        .bind(direction.map(|d| d.as_str()))
        .execute(&mut *tx)
        .await
        .map_err(|e| TripError::Persistence(e.to_string()))?;

        if result.rows_affected() == 0 {
            return Err(TripError::Validation(format!(
                "no route stored for trip {key}"
            )));
        }

        sqlx::query(
            r#"
            INSERT INTO active_trips (bus_id, route_name, waypoints, direction,
                                      current_city, destination_name, started_at, updated_at)
            SELECT bus_id, route_name, waypoints, direction, current_city,
                   destination_name, datetime('now'), datetime('now')
            FROM routes
            WHERE bus_id = ?1 AND route_name = ?2
            ON CONFLICT(bus_id, route_name) DO UPDATE SET
                waypoints = excluded.waypoints,
                direction = excluded.direction,
                current_city = excluded.current_city,
                destination_name = excluded.destination_name,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&key.bus_id)
        .bind(&key.route_name)
        .execute(&mut *tx)
        .await
        .map_err(|e| TripError::Persistence(e.to_string()))?;
    } else {
        sqlx::query(
            r#"
            UPDATE routes SET active = 0, updated_at = datetime('now')
            WHERE bus_id = ?1 AND route_name = ?2
            "#,
        )
        .bind(&key.bus_id)
        .bind(&key.route_name)
        .execute(&mut *tx)
        .await
        .map_err(|e| TripError::Persistence(e.to_string()))?;

        sqlx::query("DELETE FROM active_trips WHERE bus_id = ?1 AND route_name = ?2")
            .bind(&key.bus_id)
            .bind(&key.route_name)
            .execute(&mut *tx)
            .await
            .map_err(|e| TripError::Persistence(e.to_string()))?;
    }

    tx.commit()
        .await
        .map_err(|e| TripError::Persistence(e.to_string()))?;

    debug!(trip = %key, active, "Updated trip active state");
    Ok(())
}

/// Reverse the stored waypoint order, flip the direction flag, and swap
/// the destination label to the new terminal waypoint, in both partitions.
/// `current_city` is left untouched for the city tracker to correct on the
/// next sample.
pub async fn reverse_direction(pool: &SqlitePool, key: &TripKey) -> Result<(), TripError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| TripError::Persistence(e.to_string()))?;

    let row: Option<(String, String)> = sqlx::query_as(
        "SELECT waypoints, direction FROM routes WHERE bus_id = ?1 AND route_name = ?2",
    )
    .bind(&key.bus_id)
    .bind(&key.route_name)
    .fetch_optional(&mut *tx)
    .await
    .map_err(|e| TripError::Persistence(e.to_string()))?;

    let Some((waypoints_json, direction_raw)) = row else {
        return Err(TripError::Validation(format!(
            "no route stored for trip {key}"
        )));
    };

    let mut waypoints = decode_waypoints(&waypoints_json)?;
    if waypoints.len() < 2 {
        return Err(TripError::Validation(
            "route has fewer than two waypoints".to_string(),
        ));
    }

    waypoints.reverse();
    let reversed_json = encode_waypoints(&waypoints)?;
    let direction = Direction::from_db(&direction_raw).flipped();
    let destination_name = waypoints
        .last()
        .map(|w| w.name.clone())
        .ok_or_else(|| TripError::Validation("route has no waypoints".to_string()))?;

    sqlx::query(
        r#"
        UPDATE routes SET
            waypoints = ?3,
            direction = ?4,
            destination_name = ?5,
            updated_at = datetime('now')
        WHERE bus_id = ?1 AND route_name = ?2
        "#,
    )
    .bind(&key.bus_id)
    .bind(&key.route_name)
    .bind(&reversed_json)
    .bind(direction.as_str())
    .bind(&destination_name)
    .execute(&mut *tx)
    .await
    .map_err(|e| TripError::Persistence(e.to_string()))?;

    // Mirror row only exists while the trip is live; zero rows is fine.
    sqlx::query(
        r#"
        UPDATE active_trips SET
            waypoints = ?3,
            direction = ?4,
            destination_name = ?5,
            updated_at = datetime('now')
        WHERE bus_id = ?1 AND route_name = ?2
        "#,
    )
    .bind(&key.bus_id)
    .bind(&key.route_name)
    .bind(&reversed_json)
    .bind(direction.as_str())
    .bind(&destination_name)
    .execute(&mut *tx)
    .await
    .map_err(|e| TripError::Persistence(e.to_string()))?;

    tx.commit()
        .await
        .map_err(|e| TripError::Persistence(e.to_string()))?;

    debug!(trip = %key, direction = direction.as_str(), "Reversed route direction");
    Ok(())
}

/// Write the resolved nearest-city name into both partitions. Used only by
/// the city tracker.
pub async fn set_current_city(
    pool: &SqlitePool,
    key: &TripKey,
    city: &str,
) -> Result<(), TripError> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| TripError::Persistence(e.to_string()))?;

    sqlx::query(
        r#"
        UPDATE routes SET current_city = ?3, updated_at = datetime('now')
        WHERE bus_id = ?1 AND route_name = ?2
        "#,
    )
    .bind(&key.bus_id)
    .bind(&key.route_name)
    .bind(city)
    .execute(&mut *tx)
    .await
    .map_err(|e| TripError::Persistence(e.to_string()))?;

    sqlx::query(
        r#"
        UPDATE active_trips SET current_city = ?3, updated_at = datetime('now')
        WHERE bus_id = ?1 AND route_name = ?2
        "#,
    )
    .bind(&key.bus_id)
    .bind(&key.route_name)
    .bind(city)
    .execute(&mut *tx)
    .await
    .map_err(|e| TripError::Persistence(e.to_string()))?;

    tx.commit()
        .await
        .map_err(|e| TripError::Persistence(e.to_string()))?;

    Ok(())
}

#[derive(Debug, thiserror::Error)]
pub enum TripError {
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Persistence error: {0}")]
    Persistence(String),
    #[error("Inconsistent trip state: {0}")]
    InconsistentState(String),
    #[error("Stale location sample")]
    StaleSample,
}
