//! Motion-monitoring controller.
//!
//! Owns the [`Prototrip`] while the engine is deciding whether the person is
//! actually going somewhere. Location batches are filtered into it, and each
//! classification result is run through the decision table in
//! [`crate::transitions`] with speeds recomputed from the prototrip's own
//! fresh samples.

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, trace};

use crate::classification::{QueryToken, SensorWindow};
use crate::config::{LocationConfig, MonitoringConfig};
use crate::transitions::{decide, MonitoringDecision};
use crate::trip::{self, resolve_collection, SensorDataCollection};
use crate::types::{ActivityType, ClassificationResult, LocationSample, SpeedStats};

/// A trip that has not been confirmed yet.
#[derive(Debug, Clone, PartialEq)]
pub struct Prototrip {
    pub created_at: DateTime<Utc>,
    pub battery_at_start: Option<f64>,
    pub samples: Vec<LocationSample>,
    pub collections: Vec<SensorDataCollection>,
}

impl Prototrip {
    pub fn new(created_at: DateTime<Utc>, battery_at_start: Option<f64>) -> Self {
        Self {
            created_at,
            battery_at_start,
            samples: Vec::new(),
            collections: Vec::new(),
        }
    }

    pub fn first_sample(&self) -> Option<&LocationSample> {
        trip::earliest(&self.samples)
    }

    pub fn last_sample(&self) -> Option<&LocationSample> {
        trip::latest(&self.samples)
    }
}

/// What the engine should do after a classification result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringOutcome {
    Continue,
    Promote(ActivityType),
    Demote,
    /// Too many ambiguous results since the last wake-up.
    Abandon,
}

#[derive(Debug, Clone)]
pub struct MonitoringController {
    prototrip: Prototrip,
    ambiguous_results: u32,
    location: LocationConfig,
    monitoring: MonitoringConfig,
    stale_after: Duration,
}

impl MonitoringController {
    pub fn new(
        prototrip: Prototrip,
        location: LocationConfig,
        monitoring: MonitoringConfig,
        stale_after: Duration,
    ) -> Self {
        Self {
            prototrip,
            ambiguous_results: 0,
            location,
            monitoring,
            stale_after,
        }
    }

    pub fn prototrip(&self) -> &Prototrip {
        &self.prototrip
    }

    pub fn into_prototrip(self) -> Prototrip {
        self.prototrip
    }

    pub fn ambiguous_results(&self) -> u32 {
        self.ambiguous_results
    }

    /// A geofence fired again; the person is still moving around here.
    pub fn reset_ambiguity(&mut self) {
        self.ambiguous_results = 0;
    }

    /// Append acceptable samples. Returns how many were kept.
    pub fn ingest(&mut self, samples: &[LocationSample]) -> usize {
        let before = self.prototrip.samples.len();
        for sample in samples {
            if sample.is_acceptable(self.location.acceptable_accuracy_m) {
                self.prototrip.samples.push(*sample);
            } else {
                trace!(
                    "Dropping fix with accuracy {:.0}m at {}",
                    sample.horizontal_accuracy,
                    sample.timestamp
                );
            }
        }
        self.prototrip.samples.len() - before
    }

    pub fn is_stale(&self, sample: &LocationSample, now: DateTime<Utc>) -> bool {
        now - sample.timestamp > self.stale_after
    }

    /// Samples young enough to drive decisions.
    pub fn fresh_samples(&self, now: DateTime<Utc>) -> Vec<LocationSample> {
        self.prototrip
            .samples
            .iter()
            .filter(|s| !self.is_stale(s, now))
            .copied()
            .collect()
    }

    pub fn speed_stats(&self, now: DateTime<Utc>) -> SpeedStats {
        SpeedStats::from_samples(&self.fresh_samples(now), self.location.moving_speed_floor)
    }

    /// Latest sample that is not stale, used to anchor geofences.
    pub fn last_fresh_sample(&self, now: DateTime<Utc>) -> Option<LocationSample> {
        self.fresh_samples(now).into_iter().max_by_key(|s| s.timestamp)
    }

    pub fn record_query(&mut self, token: QueryToken, window: SensorWindow) {
        self.prototrip
            .collections
            .push(SensorDataCollection::pending(token, window));
    }

    /// Apply a current-generation classification result.
    pub fn on_result(
        &mut self,
        token: QueryToken,
        result: ClassificationResult,
        now: DateTime<Utc>,
    ) -> MonitoringOutcome {
        let stats = self.speed_stats(now);
        let result = if stats.sample_count > 0 {
            result.with_speeds(stats)
        } else {
            result
        };

        if !resolve_collection(&mut self.prototrip.collections, token, result) {
            debug!("Result for query {} has no pending window", token.query_id);
        }

        let decision = decide(&result, &self.monitoring);
        debug!(
            "{} {:.2} at {:.1} m/s moving: {}",
            result.activity_type.description(),
            result.confidence,
            result.average_moving_speed,
            decision.description()
        );

        match decision {
            MonitoringDecision::Promote(activity) => MonitoringOutcome::Promote(activity),
            MonitoringDecision::Demote => MonitoringOutcome::Demote,
            MonitoringDecision::Continue => {
                self.ambiguous_results += 1;
                if self.ambiguous_results >= self.monitoring.max_ambiguous_queries {
                    info!(
                        "{} ambiguous results since last wake-up, abandoning monitoring",
                        self.ambiguous_results
                    );
                    MonitoringOutcome::Abandon
                } else {
                    MonitoringOutcome::Continue
                }
            }
        }
    }
}
