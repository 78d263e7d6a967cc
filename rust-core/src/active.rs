//! Active-trip controller.
//!
//! Appends every fix with a valid coordinate to the trip and watches for the
//! trip ending. Two independent signals can end it: a run of consecutive slow
//! GPS fixes, or too long since the last fix that was definitively moving.
//! Only fixes within the accuracy threshold count as moving. Fixes without a
//! GPS speed fall back to a speed computed from the previous accurate fix;
//! those can prove movement but never extend the slow run.

use chrono::{DateTime, Duration, Utc};
use log::{debug, trace};

use crate::classification::{QueryToken, SensorWindow};
use crate::config::{ActiveConfig, LocationConfig};
use crate::trip::{resolve_collection, SensorDataCollection, Trip};
use crate::types::{ClassificationResult, LocationSample, SpeedStats};
use crate::vote::{final_activity_type, VoteRules};

/// Why a trip ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    NonMovingRun,
    NoRecentMovement,
    LowBattery,
    PermissionDenied,
    Paused,
    Manual,
    Aborted,
    /// Left open by a previous process and closed at startup.
    Interrupted,
}

impl StopReason {
    pub fn description(&self) -> &'static str {
        match self {
            StopReason::NonMovingRun => "stopped moving",
            StopReason::NoRecentMovement => "no movement recently",
            StopReason::LowBattery => "battery low",
            StopReason::PermissionDenied => "location permission revoked",
            StopReason::Paused => "tracking paused",
            StopReason::Manual => "stopped by user",
            StopReason::Aborted => "aborted",
            StopReason::Interrupted => "interrupted",
        }
    }

    /// Aborted trips are cancelled regardless of their length.
    pub fn is_abort(&self) -> bool {
        matches!(self, StopReason::Aborted)
    }
}

/// How a single fix's speed was determined.
#[derive(Debug, Clone, Copy, PartialEq)]
enum SpeedSource {
    Gps(f64),
    Manual(f64),
    Unknown,
}

/// Result of feeding one batch.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub accepted: Vec<LocationSample>,
    /// The save cadence was reached during this batch.
    pub save_due: bool,
}

#[derive(Debug, Clone)]
pub struct ActiveTripController {
    trip: Trip,
    config: ActiveConfig,
    location: LocationConfig,
    save_every: usize,
    non_moving_run: u32,
    last_moving: DateTime<Utc>,
    latest: DateTime<Utc>,
    previous_fix: Option<LocationSample>,
    unsaved: usize,
}

impl ActiveTripController {
    /// `moving_since` seeds the last-moving timestamp, normally the newest
    /// sample handed over from monitoring.
    pub fn new(
        trip: Trip,
        moving_since: DateTime<Utc>,
        config: ActiveConfig,
        location: LocationConfig,
        save_every: usize,
    ) -> Self {
        let previous_fix = trip.last_sample().copied();
        Self {
            trip,
            config,
            location,
            save_every: save_every.max(1),
            non_moving_run: 0,
            last_moving: moving_since,
            latest: moving_since,
            previous_fix,
            unsaved: 0,
        }
    }

    pub fn trip(&self) -> &Trip {
        &self.trip
    }

    pub fn trip_mut(&mut self) -> &mut Trip {
        &mut self.trip
    }

    pub fn into_trip(self) -> Trip {
        self.trip
    }

    pub fn non_moving_run(&self) -> u32 {
        self.non_moving_run
    }

    pub fn last_moving(&self) -> DateTime<Utc> {
        self.last_moving
    }

    pub fn latest(&self) -> DateTime<Utc> {
        self.latest
    }

    /// Newest fix within the accuracy threshold, if the trip has one.
    pub fn last_location(&self) -> Option<LocationSample> {
        self.trip
            .last_accurate_sample(self.location.acceptable_accuracy_m)
            .copied()
    }

    fn speed_of(&self, sample: &LocationSample) -> SpeedSource {
        if sample.has_known_speed() {
            return SpeedSource::Gps(sample.speed);
        }
        match self.previous_fix.and_then(|prev| sample.calculated_speed_from(&prev)) {
            Some(speed) if speed < self.config.manual_speed_cap => SpeedSource::Manual(speed),
            Some(speed) => {
                trace!("Ignoring manual speed {:.1} m/s as a jump", speed);
                SpeedSource::Unknown
            }
            None => SpeedSource::Unknown,
        }
    }

    fn mark_moving(&mut self, at: DateTime<Utc>) {
        self.last_moving = self.last_moving.max(at);
        self.non_moving_run = 0;
    }

    /// Append a batch of fixes in delivery order.
    pub fn ingest(&mut self, samples: &[LocationSample]) -> BatchReport {
        let mut report = BatchReport::default();

        for sample in samples {
            if !sample.coordinate.is_valid() {
                continue;
            }

            let accurate = sample.is_acceptable(self.location.acceptable_accuracy_m);
            match self.speed_of(sample) {
                SpeedSource::Gps(speed) if speed >= self.config.continue_speed => {
                    if accurate {
                        self.mark_moving(sample.timestamp)
                    }
                }
                SpeedSource::Gps(_) => self.non_moving_run += 1,
                SpeedSource::Manual(speed) if accurate && speed >= self.config.continue_speed => {
                    self.mark_moving(sample.timestamp)
                }
                SpeedSource::Manual(_) | SpeedSource::Unknown => {}
            }

            self.latest = self.latest.max(sample.timestamp);
            if accurate {
                self.previous_fix = Some(*sample);
            }
            self.trip.samples.push(*sample);
            report.accepted.push(*sample);
        }

        self.unsaved += report.accepted.len();
        if self.unsaved >= self.save_every {
            self.unsaved = 0;
            report.save_due = true;
        }

        trace!(
            "Accepted {} of {} fixes, slow run {}, last moving {}",
            report.accepted.len(),
            samples.len(),
            self.non_moving_run,
            self.last_moving
        );
        report
    }

    /// First matching stop criterion, if any.
    pub fn check_stop(&self, max_time_since_moving: Duration) -> Option<StopReason> {
        if self.non_moving_run >= self.config.non_moving_run_threshold {
            debug!("{} consecutive slow fixes", self.non_moving_run);
            return Some(StopReason::NonMovingRun);
        }
        if self.latest - self.last_moving > max_time_since_moving {
            debug!(
                "{}s since last moving fix",
                (self.latest - self.last_moving).num_seconds()
            );
            return Some(StopReason::NoRecentMovement);
        }
        None
    }

    pub fn record_query(&mut self, token: QueryToken, window: SensorWindow) {
        self.trip
            .collections
            .push(SensorDataCollection::pending(token, window));
    }

    /// Attach a result and re-run the vote so the trip's type tracks the
    /// evidence so far. Returns true if the type changed.
    pub fn on_result(&mut self, token: QueryToken, result: ClassificationResult, rules: &VoteRules) -> bool {
        if !resolve_collection(&mut self.trip.collections, token, result) {
            debug!("Result for query {} has no pending window", token.query_id);
        }

        let speeds = SpeedStats::from_samples(&self.trip.samples, self.location.moving_speed_floor);
        let current = self.trip.activity_type;
        let refined = final_activity_type(self.trip.resolved_results(), speeds, current, rules);
        if refined != current {
            debug!(
                "Trip {} refined {} -> {}",
                self.trip.handle,
                current.description(),
                refined.description()
            );
            self.trip.activity_type = refined;
            true
        } else {
            false
        }
    }
}
