//! Live trip tracking engine.
//!
//! This module handles:
//! - Ride lifecycle transitions (start/cancel) across the durable
//!   directory and the live location channel
//! - Ingestion and fan-out of driver GPS fixes
//! - Nearest-city resolution per active trip
//! - The merged read-side view consumed by maps and search

pub mod channel;
pub mod city;
pub mod feed;
pub mod lifecycle;

// Re-export types for API access
pub use channel::{LiveLocationChannel, LocationSample, LocationUpdate, TripStatus};
pub use feed::TripView;
pub use lifecycle::TrackingEngine;
