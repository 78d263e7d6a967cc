//! Trip records.
//!
//! A [`Trip`] is what the engine persists: an ordered list of accepted
//! samples, the sensor windows classified along the way, and the activity
//! type that best describes them. Samples arrive in per-batch order, but no
//! ordering is assumed across batches, so first/last lookups scan for the
//! min/max timestamp explicitly.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classification::{QueryToken, SensorWindow};
use crate::geometry;
use crate::types::{ActivityType, ClassificationResult, Coordinate, LocationSample, TripHandle};

/// One classified (or pending) sensor window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorDataCollection {
    pub token: QueryToken,
    pub window: SensorWindow,
    pub result: Option<ClassificationResult>,
}

impl SensorDataCollection {
    pub fn pending(token: QueryToken, window: SensorWindow) -> Self {
        Self {
            token,
            window,
            result: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.result.is_some()
    }
}

/// Attach `result` to the collection issued for `token`. Returns false if
/// no such collection exists.
pub fn resolve_collection(
    collections: &mut [SensorDataCollection],
    token: QueryToken,
    result: ClassificationResult,
) -> bool {
    match collections.iter_mut().find(|c| c.token == token) {
        Some(collection) => {
            collection.result = Some(result);
            true
        }
        None => false,
    }
}

pub(crate) fn earliest(samples: &[LocationSample]) -> Option<&LocationSample> {
    samples.iter().min_by_key(|s| s.timestamp)
}

pub(crate) fn latest(samples: &[LocationSample]) -> Option<&LocationSample> {
    samples.iter().max_by_key(|s| s.timestamp)
}

/// A trip in progress or recently closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trip {
    pub handle: TripHandle,
    pub created_at: DateTime<Utc>,
    pub activity_type: ActivityType,
    pub samples: Vec<LocationSample>,
    pub collections: Vec<SensorDataCollection>,
    pub battery_at_start: Option<f64>,
    pub battery_at_end: Option<f64>,
    pub closed: bool,
    pub stopped_manually: bool,
    /// Simplified path length, computed at close (meters).
    pub length_m: f64,
}

impl Trip {
    pub fn new(created_at: DateTime<Utc>, battery_at_start: Option<f64>) -> Self {
        Self {
            handle: TripHandle::new(),
            created_at,
            activity_type: ActivityType::Unknown,
            samples: Vec::new(),
            collections: Vec::new(),
            battery_at_start,
            battery_at_end: None,
            closed: false,
            stopped_manually: false,
            length_m: 0.0,
        }
    }

    /// Reopen for appending. Previous close results are discarded.
    pub fn reopen(&mut self) {
        self.closed = false;
        self.stopped_manually = false;
        self.battery_at_end = None;
    }

    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    pub fn first_sample(&self) -> Option<&LocationSample> {
        earliest(&self.samples)
    }

    pub fn last_sample(&self) -> Option<&LocationSample> {
        latest(&self.samples)
    }

    /// Newest sample within `acceptable_accuracy_m`, falling back to the
    /// newest sample of any accuracy.
    pub fn last_accurate_sample(&self, acceptable_accuracy_m: f64) -> Option<&LocationSample> {
        self.samples
            .iter()
            .filter(|s| s.is_acceptable(acceptable_accuracy_m))
            .max_by_key(|s| s.timestamp)
            .or_else(|| self.last_sample())
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.first_sample().map(|s| s.timestamp).unwrap_or(self.created_at)
    }

    pub fn ended_at(&self) -> DateTime<Utc> {
        self.last_sample().map(|s| s.timestamp).unwrap_or(self.created_at)
    }

    /// Samples sorted by timestamp; the path is drawn in time order even when
    /// batches arrived out of order.
    pub fn ordered_path(&self) -> Vec<Coordinate> {
        let mut samples: Vec<&LocationSample> = self.samples.iter().collect();
        samples.sort_by_key(|s| s.timestamp);
        samples.iter().map(|s| s.coordinate).collect()
    }

    pub fn compute_length(&mut self, epsilon_degrees: f64) -> f64 {
        self.length_m = geometry::simplified_length_m(&self.ordered_path(), epsilon_degrees);
        self.length_m
    }

    pub fn resolved_results(&self) -> impl Iterator<Item = &ClassificationResult> {
        self.collections.iter().filter_map(|c| c.result.as_ref())
    }

    pub fn battery_used(&self) -> Option<f64> {
        match (self.battery_at_start, self.battery_at_end) {
            (Some(start), Some(end)) => Some((start - end).max(0.0)),
            _ => None,
        }
    }

    pub fn summary(&self) -> TripSummary {
        TripSummary {
            handle: self.handle,
            activity_type: self.activity_type,
            started_at: self.started_at(),
            ended_at: self.ended_at(),
            length_m: self.length_m,
            sample_count: self.sample_count(),
            closed: self.closed,
            stopped_manually: self.stopped_manually,
        }
    }
}

/// Lightweight view of a stored trip, enough to decide on resumption.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    pub handle: TripHandle,
    pub activity_type: ActivityType,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub length_m: f64,
    pub sample_count: usize,
    pub closed: bool,
    pub stopped_manually: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::classification::Generation;
    use chrono::{Duration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn sample(offset_s: i64, lat: f64) -> LocationSample {
        LocationSample::new(t0() + Duration::seconds(offset_s), Coordinate::new(lat, -122.0), 5.0, 5.0)
    }

    #[test]
    fn test_first_and_last_ignore_arrival_order() {
        let mut trip = Trip::new(t0(), Some(0.9));
        trip.samples = vec![sample(20, 45.002), sample(0, 45.0), sample(40, 45.004), sample(10, 45.001)];

        assert_eq!(trip.started_at(), t0());
        assert_eq!(trip.ended_at(), t0() + Duration::seconds(40));
    }

    #[test]
    fn test_last_accurate_sample_skips_poor_fixes() {
        let mut trip = Trip::new(t0(), None);
        let mut poor = sample(30, 45.5);
        poor.horizontal_accuracy = 200.0;
        trip.samples = vec![sample(0, 45.0), sample(10, 45.001), poor];

        assert_eq!(trip.last_sample().map(|s| s.timestamp), Some(t0() + Duration::seconds(30)));
        assert_eq!(trip.last_accurate_sample(30.0).map(|s| s.coordinate.latitude), Some(45.001));

        trip.samples = vec![poor];
        assert_eq!(trip.last_accurate_sample(30.0).map(|s| s.coordinate.latitude), Some(45.5));
    }

    #[test]
    fn test_ordered_path_length() {
        let mut trip = Trip::new(t0(), None);
        trip.samples = vec![sample(20, 45.002), sample(0, 45.0), sample(10, 45.001)];
        let length = trip.compute_length(0.00005);
        // Two legs of ~111m; out-of-order storage must not double back
        assert!((length - 222.4).abs() < 1.0, "length was {length}");
    }

    #[test]
    fn test_resolve_collection() {
        let token = QueryToken {
            generation: Generation::default(),
            query_id: 3,
        };
        let window = SensorWindow {
            start: t0(),
            end: t0() + Duration::seconds(10),
            readings: Vec::new(),
        };
        let mut collections = vec![SensorDataCollection::pending(token, window)];
        let result = ClassificationResult::new(ActivityType::Cycling, 0.8, 5.0, 5.5);

        assert!(resolve_collection(&mut collections, token, result));
        assert!(collections[0].is_resolved());

        let other = QueryToken { query_id: 4, ..token };
        assert!(!resolve_collection(&mut collections, other, result));
    }

    #[test]
    fn test_battery_used() {
        let mut trip = Trip::new(t0(), Some(0.8));
        assert_eq!(trip.battery_used(), None);
        trip.battery_at_end = Some(0.65);
        assert!((trip.battery_used().unwrap() - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_reopen_clears_close_flags() {
        let mut trip = Trip::new(t0(), Some(0.8));
        trip.closed = true;
        trip.stopped_manually = true;
        trip.battery_at_end = Some(0.5);
        trip.reopen();
        assert!(!trip.closed && !trip.stopped_manually);
        assert_eq!(trip.battery_at_end, None);
    }
}
