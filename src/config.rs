use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Allowed CORS origins. Required unless cors_permissive is true.
    #[serde(default)]
    pub cors_origins: Vec<String>,
    /// Explicitly allow all origins (development only). Defaults to false.
    #[serde(default)]
    pub cors_permissive: bool,
    /// Live trip tracking configuration
    #[serde(default)]
    pub tracking: TrackingConfig,
}

/// Configuration for the live trip tracking engine.
///
/// The two publish deltas together define the location write policy: a
/// coordinate fix is dropped only when it moved less than
/// `min_publish_distance_m` AND arrived sooner than
/// `min_publish_interval_secs` after the stored sample. Either threshold
/// passing admits the fix, which bounds both write volume and how long the
/// city tracker can lag behind the bus.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackingConfig {
    /// Minimum movement in meters before a new fix is published (default: 10)
    #[serde(default = "TrackingConfig::default_min_publish_distance_m")]
    pub min_publish_distance_m: f64,
    /// Minimum seconds between published fixes (default: 5)
    #[serde(default = "TrackingConfig::default_min_publish_interval_secs")]
    pub min_publish_interval_secs: u64,
    /// Interval in seconds between background nearest-city rechecks per
    /// active trip (default: 30)
    #[serde(default = "TrackingConfig::default_city_recheck_interval_secs")]
    pub city_recheck_interval_secs: u64,
    /// Seconds of silence after which a started trip is reported as
    /// offline (default: 90)
    #[serde(default = "TrackingConfig::default_offline_after_secs")]
    pub offline_after_secs: u64,
    /// Capacity of the location update broadcast channel (default: 64 -
    /// observers rebuild from the latest state anyway)
    #[serde(default = "TrackingConfig::default_broadcast_capacity")]
    pub broadcast_capacity: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            min_publish_distance_m: Self::default_min_publish_distance_m(),
            min_publish_interval_secs: Self::default_min_publish_interval_secs(),
            city_recheck_interval_secs: Self::default_city_recheck_interval_secs(),
            offline_after_secs: Self::default_offline_after_secs(),
            broadcast_capacity: Self::default_broadcast_capacity(),
        }
    }
}

impl TrackingConfig {
    fn default_min_publish_distance_m() -> f64 {
        10.0
    }
    fn default_min_publish_interval_secs() -> u64 {
        5
    }
    fn default_city_recheck_interval_secs() -> u64 {
        30
    }
    fn default_offline_after_secs() -> u64 {
        90
    }
    fn default_broadcast_capacity() -> usize {
        64
    }

    pub fn validate(&self) {
        if self.city_recheck_interval_secs == 0 {
            panic!("tracking.city_recheck_interval_secs must be greater than zero");
        }
        if self.offline_after_secs == 0 {
            panic!("tracking.offline_after_secs must be greater than zero");
        }
        if self.broadcast_capacity == 0 {
            panic!("tracking.broadcast_capacity must be greater than zero");
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),
    #[error("Failed to parse config: {0}")]
    ParseError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracking_defaults_applied_for_empty_section() {
        let config: Config = serde_yaml::from_str("cors_permissive: true").unwrap();
        assert_eq!(config.tracking.min_publish_distance_m, 10.0);
        assert_eq!(config.tracking.min_publish_interval_secs, 5);
        assert_eq!(config.tracking.city_recheck_interval_secs, 30);
        assert_eq!(config.tracking.offline_after_secs, 90);
    }

    #[test]
    fn tracking_overrides_parsed() {
        let yaml = r#"
cors_origins: ["http://localhost:5173"]
tracking:
  min_publish_distance_m: 25.0
  city_recheck_interval_secs: 10
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.cors_origins.len(), 1);
        assert_eq!(config.tracking.min_publish_distance_m, 25.0);
        assert_eq!(config.tracking.city_recheck_interval_secs, 10);
        // Unspecified fields keep their defaults
        assert_eq!(config.tracking.min_publish_interval_secs, 5);
    }

    #[test]
    #[should_panic]
    fn validate_rejects_zero_recheck_interval() {
        let config = TrackingConfig {
            city_recheck_interval_secs: 0,
            ..TrackingConfig::default()
        };
        config.validate();
    }
}
