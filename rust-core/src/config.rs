//! Engine configuration.
//!
//! Every numeric threshold the engine consults lives here, grouped by the
//! component that reads it. Configurations round-trip through YAML so a
//! deployment can tune thresholds without a rebuild.

use std::path::Path;

use chrono::Duration;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration handed to [`crate::engine::TripEngine::new`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub gate: GateConfig,
    pub location: LocationConfig,
    pub geofence: GeofenceConfig,
    pub query: QueryConfig,
    pub monitoring: MonitoringConfig,
    pub active: ActiveConfig,
    pub resumption: ResumptionConfig,
    pub close: TripCloseConfig,
    pub deferral: DeferralConfig,
}

/// Power/authorization gate thresholds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Battery fraction below which tracking is suspended.
    pub low_battery_threshold: f64,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            low_battery_threshold: 0.2, // 20% battery
        }
    }
}

/// Sample acceptance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Fixes with a horizontal accuracy worse than this are dropped (meters).
    pub acceptable_accuracy_m: f64,
    /// Samples at or below this speed are not "moving" for speed statistics (m/s).
    pub moving_speed_floor: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            acceptable_accuracy_m: 30.0, // Roughly one city block
            moving_speed_floor: 0.2,     // Below GPS speed noise
        }
    }
}

/// Geofence ring geometry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeofenceConfig {
    /// Number of enter-triggered regions on the ring.
    pub ring_region_count: usize,
    /// Distance from the center to each ring region, in degrees.
    pub ring_offset_degrees: f64,
    /// Radius of each ring region (meters).
    pub ring_region_radius_m: f64,
    /// Radius of the exit-triggered backup region (meters).
    pub backup_radius_m: f64,
    /// Identifier prefix shared by every ring region.
    pub ring_identifier_prefix: String,
    /// Identifier of the backup region.
    pub backup_identifier: String,
}

impl Default for GeofenceConfig {
    fn default() -> Self {
        Self {
            ring_region_count: 9,
            ring_offset_degrees: 0.0035, // ~390m north-south
            ring_region_radius_m: 80.0,
            backup_radius_m: 150.0,
            ring_identifier_prefix: "trip-detection.ring.".to_string(),
            backup_identifier: "trip-detection.backup".to_string(),
        }
    }
}

/// Classification query cadence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueryConfig {
    /// Interval between queries in the first tier (seconds).
    pub fast_interval_secs: u64,
    /// Number of queries issued at the fast interval.
    pub fast_query_count: u32,
    /// Interval in the second tier (seconds).
    pub medium_interval_secs: u64,
    /// Number of queries issued at the medium interval before falling to the slow tier.
    pub medium_query_count: u32,
    /// Interval once both earlier tiers are exhausted (seconds).
    pub slow_interval_secs: u64,
    /// An unanswered query older than this is abandoned (seconds).
    pub bail_out_secs: u64,
    /// Length of the sensor window attached to each query (seconds).
    pub window_secs: u64,
    /// Motion readings older than this many window lengths are dropped.
    pub max_buffered_readings: usize,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            fast_interval_secs: 10,
            fast_query_count: 6,
            medium_interval_secs: 60,
            medium_query_count: 5,
            slow_interval_secs: 180,
            bail_out_secs: 30,
            window_secs: 10,
            max_buffered_readings: 4096,
        }
    }
}

/// Promotion/demotion decision table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitoringConfig {
    pub high_confidence: f64,
    pub low_confidence: f64,
    /// Minimum moving speed for a confident automotive promotion (m/s).
    pub motorized_min_moving_speed: f64,
    /// Minimum moving speed for a confident cycling promotion (m/s).
    pub cycling_min_moving_speed: f64,
    /// Lower bound of the moving-speed band accepted for low-confidence cycling (m/s).
    pub low_confidence_cycling_min_speed: f64,
    /// Upper bound (exclusive) of that band (m/s).
    pub low_confidence_cycling_max_speed: f64,
    /// Speeds under this count as "not going anywhere" for demotion (m/s).
    pub near_zero_speed: f64,
    /// Consecutive ambiguous results tolerated before monitoring is abandoned.
    pub max_ambiguous_queries: u32,
    /// Bus and rail promote like automotive when true.
    pub promote_all_motorized: bool,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            high_confidence: 0.8,
            low_confidence: 0.4,
            motorized_min_moving_speed: 4.0,
            cycling_min_moving_speed: 2.0,
            low_confidence_cycling_min_speed: 2.5,
            low_confidence_cycling_max_speed: 9.0, // Faster than this is likely a car
            near_zero_speed: 0.5,
            max_ambiguous_queries: 6,
            promote_all_motorized: true,
        }
    }
}

/// Stop detection while a trip is in progress.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ActiveConfig {
    /// A sample at or above this speed is definitively moving (m/s).
    pub continue_speed: f64,
    /// Manual speeds at or above this are treated as GPS jumps (m/s).
    pub manual_speed_cap: f64,
    /// Consecutive low-speed GPS samples that end the trip.
    pub non_moving_run_threshold: u32,
    /// Maximum time since the last moving sample (seconds).
    pub max_time_since_moving_secs: u64,
}

impl Default for ActiveConfig {
    fn default() -> Self {
        Self {
            continue_speed: 2.0,
            manual_speed_cap: 20.0, // ~45 mph between two fixes is a jump
            non_moving_run_threshold: 60,
            max_time_since_moving_secs: 60,
        }
    }
}

/// Rules for reopening a recently closed trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumptionConfig {
    /// Automotive, bus and rail trips may resume one another.
    pub motorized_types_compatible: bool,
    /// Cycling trips at least this long get the extended timeout (meters).
    pub long_ride_length_m: f64,
    pub long_ride_timeout_secs: u64,
    pub cycling_timeout_secs: u64,
    pub walking_timeout_secs: u64,
    pub default_timeout_secs: u64,
}

impl Default for ResumptionConfig {
    fn default() -> Self {
        Self {
            motorized_types_compatible: true,
            long_ride_length_m: 19_312.0, // 12 miles
            long_ride_timeout_secs: 1080,
            cycling_timeout_secs: 300,
            walking_timeout_secs: 900,
            default_timeout_secs: 600,
        }
    }
}

/// Trip close and persistence rules.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripCloseConfig {
    /// Trips with this many samples or fewer are cancelled.
    pub min_samples: usize,
    /// Motorized trips shorter than this are cancelled (meters).
    pub motorized_min_length_m: f64,
    /// Cycling trips averaging below this moving speed are relabelled walking (m/s).
    pub walking_reclass_speed: f64,
    /// Average moving speed above which the vote yields aviation (m/s).
    pub aviation_speed: f64,
    /// Ramer-Douglas-Peucker tolerance in degrees.
    pub simplify_epsilon_degrees: f64,
    /// The trip is saved every this many appended samples.
    pub save_every_samples: usize,
}

impl Default for TripCloseConfig {
    fn default() -> Self {
        Self {
            min_samples: 6,
            motorized_min_length_m: 250.0,
            walking_reclass_speed: 2.0,
            aviation_speed: 70.0, // ~250 km/h
            simplify_epsilon_degrees: 0.00005,
            save_every_samples: 10,
        }
    }
}

/// Deferred (batched) location delivery.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferralConfig {
    /// Maximum batching delay requested from the platform (seconds).
    pub timeout_secs: u64,
    /// Added to the timeout to form the staleness cutoff (seconds).
    pub stale_margin_secs: u64,
}

impl Default for DeferralConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 120,
            stale_margin_secs: 10,
        }
    }
}

impl DeferralConfig {
    pub fn timeout(&self) -> Duration {
        secs(self.timeout_secs)
    }

    /// Samples older than this relative to "now" are stale.
    pub fn stale_after(&self) -> Duration {
        secs(self.timeout_secs.saturating_add(self.stale_margin_secs))
    }
}

impl QueryConfig {
    /// Interval before the next query given how many were already issued.
    pub fn interval_after(&self, issued: u32) -> Duration {
        if issued < self.fast_query_count {
            secs(self.fast_interval_secs)
        } else if issued < self.fast_query_count + self.medium_query_count {
            secs(self.medium_interval_secs)
        } else {
            secs(self.slow_interval_secs)
        }
    }

    pub fn bail_out(&self) -> Duration {
        secs(self.bail_out_secs)
    }

    pub fn window(&self) -> Duration {
        secs(self.window_secs)
    }
}

/// Upper bound for any duration given in seconds (one week).
pub const MAX_CONFIG_SECS: u64 = 7 * 24 * 60 * 60;

pub(crate) fn secs(value: u64) -> Duration {
    Duration::seconds(value.min(MAX_CONFIG_SECS) as i64)
}

impl EngineConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = serde_yaml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.gate.low_battery_threshold) {
            return Err(Error::Config(
                "Low battery threshold must be between 0.0 and 1.0".to_string(),
            ));
        }
        if self.location.acceptable_accuracy_m <= 0.0 {
            return Err(Error::Config(
                "Acceptable accuracy must be greater than 0".to_string(),
            ));
        }

        let g = &self.geofence;
        if g.ring_region_count == 0 {
            return Err(Error::Config(
                "Geofence ring needs at least one region".to_string(),
            ));
        }
        if g.ring_offset_degrees <= 0.0 || g.ring_region_radius_m <= 0.0 || g.backup_radius_m <= 0.0 {
            return Err(Error::Config(
                "Geofence offsets and radii must be greater than 0".to_string(),
            ));
        }
        if g.ring_identifier_prefix.is_empty() || g.backup_identifier.starts_with(&g.ring_identifier_prefix) {
            return Err(Error::Config(
                "Backup identifier must not share the ring identifier prefix".to_string(),
            ));
        }

        let q = &self.query;
        if q.fast_interval_secs == 0 || q.medium_interval_secs == 0 || q.slow_interval_secs == 0 {
            return Err(Error::Config("Query intervals must be greater than 0".to_string()));
        }
        if q.bail_out_secs == 0 || q.window_secs == 0 {
            return Err(Error::Config(
                "Query bail-out and window must be greater than 0".to_string(),
            ));
        }

        let m = &self.monitoring;
        if !(0.0..=1.0).contains(&m.low_confidence)
            || !(0.0..=1.0).contains(&m.high_confidence)
            || m.low_confidence > m.high_confidence
        {
            return Err(Error::Config(
                "Confidence bands must satisfy 0 <= low <= high <= 1".to_string(),
            ));
        }
        if m.low_confidence_cycling_min_speed >= m.low_confidence_cycling_max_speed {
            return Err(Error::Config(
                "Low-confidence cycling speed band is empty".to_string(),
            ));
        }
        if m.max_ambiguous_queries == 0 {
            return Err(Error::Config(
                "Max ambiguous queries must be greater than 0".to_string(),
            ));
        }

        if self.active.continue_speed <= 0.0 || self.active.manual_speed_cap <= self.active.continue_speed {
            return Err(Error::Config(
                "Manual speed cap must exceed the continue speed".to_string(),
            ));
        }
        if self.active.non_moving_run_threshold == 0 || self.active.max_time_since_moving_secs == 0 {
            return Err(Error::Config("Stop thresholds must be greater than 0".to_string()));
        }

        if self.close.save_every_samples == 0 {
            return Err(Error::Config("Save cadence must be greater than 0".to_string()));
        }
        if self.close.simplify_epsilon_degrees < 0.0 {
            return Err(Error::Config("Simplify tolerance must not be negative".to_string()));
        }

        let r = &self.resumption;
        let durations = [
            ("query.fast_interval_secs", q.fast_interval_secs),
            ("query.medium_interval_secs", q.medium_interval_secs),
            ("query.slow_interval_secs", q.slow_interval_secs),
            ("query.bail_out_secs", q.bail_out_secs),
            ("query.window_secs", q.window_secs),
            ("active.max_time_since_moving_secs", self.active.max_time_since_moving_secs),
            ("resumption.long_ride_timeout_secs", r.long_ride_timeout_secs),
            ("resumption.cycling_timeout_secs", r.cycling_timeout_secs),
            ("resumption.walking_timeout_secs", r.walking_timeout_secs),
            ("resumption.default_timeout_secs", r.default_timeout_secs),
            ("deferral.timeout_secs", self.deferral.timeout_secs),
            ("deferral.stale_margin_secs", self.deferral.stale_margin_secs),
        ];
        if let Some((name, value)) = durations.iter().find(|(_, value)| *value > MAX_CONFIG_SECS) {
            return Err(Error::Config(format!(
                "{} is {}s, must not exceed {}s",
                name, value, MAX_CONFIG_SECS
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        EngineConfig::default()
            .validate()
            .expect("default config must be valid");
    }

    #[test]
    fn test_query_tiers() {
        let q = QueryConfig::default();
        assert_eq!(q.interval_after(0), Duration::seconds(10));
        assert_eq!(q.interval_after(5), Duration::seconds(10));
        assert_eq!(q.interval_after(6), Duration::seconds(60));
        assert_eq!(q.interval_after(10), Duration::seconds(60));
        assert_eq!(q.interval_after(11), Duration::seconds(180));
        assert_eq!(q.interval_after(500), Duration::seconds(180));
    }

    #[test]
    fn test_stale_cutoff_includes_margin() {
        let d = DeferralConfig::default();
        assert_eq!(d.stale_after(), Duration::seconds(130));
    }

    #[test]
    fn test_rejects_oversized_durations() {
        let mut config = EngineConfig::default();
        config.deferral.timeout_secs = u64::MAX;
        config.deferral.stale_margin_secs = u64::MAX;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        // Helpers stay finite even on an unvalidated config
        assert_eq!(config.deferral.stale_after(), Duration::seconds(MAX_CONFIG_SECS as i64));

        let mut config = EngineConfig::default();
        config.resumption.long_ride_timeout_secs = MAX_CONFIG_SECS + 1;
        assert!(config.validate().is_err());
        config.resumption.long_ride_timeout_secs = MAX_CONFIG_SECS;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_oversized_duration_in_yaml_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("huge.yaml");
        std::fs::write(&path, "deferral:\n  timeout_secs: 18446744073709551615\n").expect("write");
        assert!(matches!(EngineConfig::from_file(&path), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_inverted_confidence_bands() {
        let mut config = EngineConfig::default();
        config.monitoring.low_confidence = 0.9;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_rejects_backup_sharing_ring_prefix() {
        let mut config = EngineConfig::default();
        config.geofence.backup_identifier = format!("{}backup", config.geofence.ring_identifier_prefix);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_yaml_round_trip_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.yaml");

        let mut config = EngineConfig::default();
        config.resumption.long_ride_timeout_secs = 1200;
        config.to_file(&path).expect("write config");

        let loaded = EngineConfig::from_file(&path).expect("read config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let config: EngineConfig =
            serde_yaml::from_str("gate:\n  low_battery_threshold: 0.1\n").expect("parse");
        assert_eq!(config.gate.low_battery_threshold, 0.1);
        assert_eq!(config.geofence.ring_region_count, 9);
        assert_eq!(config.active.continue_speed, 2.0);
    }

    #[test]
    fn test_from_file_rejects_invalid_values() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("bad.yaml");
        std::fs::write(&path, "geofence:\n  ring_region_count: 0\n").expect("write");
        assert!(matches!(EngineConfig::from_file(&path), Err(Error::Config(_))));
    }
}
