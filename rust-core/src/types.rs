//! Core data types for the trip detection engine.
//!
//! This module defines the values that flow between the engine and its
//! collaborators: location fixes, motion readings, classification results,
//! and the identifiers that tie them to trips.
//!
//! Design principle: if a concept exists, it gets a type. Speeds carry an
//! explicit "unknown" sentinel instead of silently defaulting to zero.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Sentinel used by platforms for an unknown speed or course.
pub const UNKNOWN_SPEED: f64 = -1.0;

/// Mode of travel predicted by the classifier or assigned to a trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActivityType {
    #[default]
    Unknown,
    Stationary,
    Walking,
    Running,
    Cycling,
    Automotive,
    Bus,
    Rail,
    Aviation,
}

impl ActivityType {
    /// Returns true for road and rail vehicles.
    pub fn is_motorized(&self) -> bool {
        matches!(
            self,
            ActivityType::Automotive | ActivityType::Bus | ActivityType::Rail
        )
    }

    /// Returns true for travel on foot.
    pub fn is_pedestrian(&self) -> bool {
        matches!(self, ActivityType::Walking | ActivityType::Running)
    }

    /// Fastest speed a person could plausibly sustain in this mode (m/s).
    /// `None` when any speed is plausible.
    pub fn plausible_max_speed(&self) -> Option<f64> {
        match self {
            ActivityType::Walking => Some(3.0),
            ActivityType::Running => Some(7.0),
            ActivityType::Cycling => Some(16.0),
            ActivityType::Stationary => Some(1.0),
            _ => None,
        }
    }

    /// Returns a human-readable description of the activity.
    pub fn description(&self) -> &'static str {
        match self {
            ActivityType::Unknown => "unknown",
            ActivityType::Stationary => "stationary",
            ActivityType::Walking => "walking",
            ActivityType::Running => "running",
            ActivityType::Cycling => "cycling",
            ActivityType::Automotive => "driving",
            ActivityType::Bus => "bus",
            ActivityType::Rail => "rail",
            ActivityType::Aviation => "flight",
        }
    }
}

/// WGS-84 coordinate in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coordinate {
    pub latitude: f64,
    pub longitude: f64,
}

impl Coordinate {
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self { latitude, longitude }
    }

    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && (-90.0..=90.0).contains(&self.latitude)
            && (-180.0..=180.0).contains(&self.longitude)
    }
}

/// A single location fix delivered by the platform.
///
/// Immutable once received. `speed` and `course` use [`UNKNOWN_SPEED`]
/// when the platform could not compute them.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LocationSample {
    pub timestamp: DateTime<Utc>,
    pub coordinate: Coordinate,
    /// Horizontal accuracy radius (meters). Negative means invalid.
    pub horizontal_accuracy: f64,
    /// Ground speed (m/s), negative if unknown.
    pub speed: f64,
    /// Course over ground (degrees), negative if unknown.
    pub course: f64,
    /// Delivered as the result of a geofence wake-up rather than regular updates.
    pub is_geofenced: bool,
}

impl LocationSample {
    pub fn new(timestamp: DateTime<Utc>, coordinate: Coordinate, horizontal_accuracy: f64, speed: f64) -> Self {
        Self {
            timestamp,
            coordinate,
            horizontal_accuracy,
            speed,
            course: UNKNOWN_SPEED,
            is_geofenced: false,
        }
    }

    pub fn geofenced(mut self) -> Self {
        self.is_geofenced = true;
        self
    }

    pub fn has_known_speed(&self) -> bool {
        self.speed.is_finite() && self.speed >= 0.0
    }

    /// Accurate enough to be kept, or explicitly tagged as a geofence wake-up.
    pub fn is_acceptable(&self, acceptable_accuracy_m: f64) -> bool {
        if !self.coordinate.is_valid() {
            return false;
        }
        self.is_geofenced
            || (self.horizontal_accuracy >= 0.0 && self.horizontal_accuracy <= acceptable_accuracy_m)
    }

    /// Speed derived from distance and elapsed time since `previous`.
    ///
    /// Returns `None` when both fixes share a timestamp.
    pub fn calculated_speed_from(&self, previous: &LocationSample) -> Option<f64> {
        let elapsed = (self.timestamp - previous.timestamp).num_milliseconds().abs() as f64 / 1000.0;
        if elapsed <= 0.0 {
            return None;
        }
        Some(crate::geometry::haversine_m(previous.coordinate, self.coordinate) / elapsed)
    }
}

/// One motion-sensor snapshot. Never interpreted by the engine, only
/// windowed and handed to the classifier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MotionReading {
    pub timestamp: DateTime<Utc>,
    /// Accelerometer [x, y, z] in m/s².
    pub accel: [f64; 3],
    /// Gyroscope [x, y, z] in rad/s.
    pub gyro: [f64; 3],
}

impl MotionReading {
    pub fn new(timestamp: DateTime<Utc>, accel: [f64; 3], gyro: [f64; 3]) -> Self {
        Self { timestamp, accel, gyro }
    }

    pub fn accel_magnitude(&self) -> f64 {
        self.accel.iter().map(|a| a * a).sum::<f64>().sqrt()
    }
}

/// Average speeds over a set of samples (m/s).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SpeedStats {
    /// Mean over samples with a known speed.
    pub average_speed: f64,
    /// Mean over samples faster than the moving-speed floor.
    pub average_moving_speed: f64,
    /// Number of samples with a known speed.
    pub sample_count: usize,
}

impl SpeedStats {
    /// Compute averages from samples, ignoring unknown speeds.
    pub fn from_samples<'a, I>(samples: I, moving_speed_floor: f64) -> Self
    where
        I: IntoIterator<Item = &'a LocationSample>,
    {
        let mut total = 0.0;
        let mut count = 0usize;
        let mut moving_total = 0.0;
        let mut moving_count = 0usize;

        for sample in samples.into_iter().filter(|s| s.has_known_speed()) {
            total += sample.speed;
            count += 1;
            if sample.speed > moving_speed_floor {
                moving_total += sample.speed;
                moving_count += 1;
            }
        }

        Self {
            average_speed: if count > 0 { total / count as f64 } else { 0.0 },
            average_moving_speed: if moving_count > 0 {
                moving_total / moving_count as f64
            } else {
                0.0
            },
            sample_count: count,
        }
    }
}

/// What the classifier concluded about one sensor window.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ClassificationResult {
    pub activity_type: ActivityType,
    /// Confidence in [0, 1].
    pub confidence: f64,
    pub average_speed: f64,
    pub average_moving_speed: f64,
}

impl ClassificationResult {
    pub fn new(activity_type: ActivityType, confidence: f64, average_speed: f64, average_moving_speed: f64) -> Self {
        Self {
            activity_type,
            confidence: confidence.max(0.0).min(1.0),
            average_speed,
            average_moving_speed,
        }
    }

    /// Replace the classifier's speed estimates with ones computed from samples.
    pub fn with_speeds(mut self, stats: SpeedStats) -> Self {
        self.average_speed = stats.average_speed;
        self.average_moving_speed = stats.average_moving_speed;
        self
    }
}

/// Stable identifier for a persisted trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TripHandle(pub Uuid);

impl TripHandle {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TripHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TripHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Which of the three exclusive states the engine is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrackingStateKind {
    Idle,
    Monitoring,
    Active,
}

impl TrackingStateKind {
    pub fn description(&self) -> &'static str {
        match self {
            TrackingStateKind::Idle => "idle, geofences armed",
            TrackingStateKind::Monitoring => "monitoring for a trip",
            TrackingStateKind::Active => "trip in progress",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_motorized_and_pedestrian() {
        assert!(ActivityType::Bus.is_motorized());
        assert!(ActivityType::Rail.is_motorized());
        assert!(!ActivityType::Cycling.is_motorized());
        assert!(ActivityType::Running.is_pedestrian());
        assert!(!ActivityType::Aviation.is_pedestrian());
    }

    #[test]
    fn test_sample_acceptance() {
        let coord = Coordinate::new(45.52, -122.68);
        let good = LocationSample::new(t0(), coord, 10.0, 3.0);
        let poor = LocationSample::new(t0(), coord, 65.0, 3.0);
        let invalid = LocationSample::new(t0(), coord, -1.0, 3.0);

        assert!(good.is_acceptable(30.0));
        assert!(!poor.is_acceptable(30.0));
        assert!(!invalid.is_acceptable(30.0));
        assert!(poor.geofenced().is_acceptable(30.0));
    }

    #[test]
    fn test_calculated_speed() {
        let a = LocationSample::new(t0(), Coordinate::new(45.0, -122.0), 5.0, UNKNOWN_SPEED);
        // 0.001 degrees of latitude is ~111m
        let b = LocationSample::new(t0() + Duration::seconds(10), Coordinate::new(45.001, -122.0), 5.0, UNKNOWN_SPEED);

        let speed = b.calculated_speed_from(&a).unwrap();
        assert!((speed - 11.1).abs() < 0.2, "speed was {speed}");
        assert!(a.calculated_speed_from(&a).is_none());
    }

    #[test]
    fn test_speed_stats_ignore_unknown_and_floor() {
        let coord = Coordinate::new(45.0, -122.0);
        let samples: Vec<_> = [0.5, 0.5, 6.0, 6.0, 6.0, UNKNOWN_SPEED, 0.1]
            .iter()
            .map(|&s| LocationSample::new(t0(), coord, 5.0, s))
            .collect();

        let stats = SpeedStats::from_samples(&samples, 0.2);
        assert_eq!(stats.sample_count, 6);
        assert!((stats.average_speed - 19.1 / 6.0).abs() < 1e-9);
        assert!((stats.average_moving_speed - 19.0 / 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_classification_confidence_clamped() {
        let result = ClassificationResult::new(ActivityType::Cycling, 1.4, 5.0, 5.0);
        assert_eq!(result.confidence, 1.0);
    }

    #[test]
    fn test_activity_serializes_snake_case() {
        let json = serde_json::to_string(&ActivityType::Automotive).unwrap();
        assert_eq!(json, "\"automotive\"");
    }
}
