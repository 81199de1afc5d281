use axum::{http::StatusCode, Json};
use serde::Serialize;
use utoipa::ToSchema;

use crate::directory::TripError;

#[derive(Debug, Serialize, ToSchema)]
pub struct ErrorResponse {
    pub error: String,
}

/// Map a trip error onto its HTTP status. Validation failures reject the
/// request before any write; persistence failures mean the operation did
/// not happen and may be retried.
pub fn trip_error(err: TripError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        TripError::Validation(_) => StatusCode::BAD_REQUEST,
        TripError::InconsistentState(_) | TripError::StaleSample => StatusCode::CONFLICT,
        TripError::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
}

pub fn not_found(message: &str) -> (StatusCode, Json<ErrorResponse>) {
    (
        StatusCode::NOT_FOUND,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_maps_to_bad_request() {
        let (status, _) = trip_error(TripError::Validation("no destination selected".into()));
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn persistence_maps_to_internal_error() {
        let (status, _) = trip_error(TripError::Persistence("disk full".into()));
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn inconsistent_state_maps_to_conflict() {
        let (status, _) = trip_error(TripError::InconsistentState("mirror missing".into()));
        assert_eq!(status, StatusCode::CONFLICT);
    }
}
