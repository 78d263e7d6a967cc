//! Trip lifecycle adapter.
//!
//! Turns engine decisions into store operations: create or resume a trip on
//! promotion, close or cancel it on stop, and sweep trips a previous process
//! left open. The resumption and close rules are pure functions so they can
//! be tested without a store.

use chrono::{DateTime, Duration, Utc};
use log::{info, warn};

use crate::active::StopReason;
use crate::config::{secs, LocationConfig, ResumptionConfig, TripCloseConfig};
use crate::error::Result;
use crate::monitoring::Prototrip;
use crate::platform::TripStore;
use crate::trip::{Trip, TripSummary};
use crate::types::{ActivityType, SpeedStats};
use crate::vote::{final_activity_type, VoteRules};

// ============================================================================
// Resumption
// ============================================================================

/// How long after `prior` ended a compatible trip may still resume it.
pub fn resumption_timeout(prior: &TripSummary, config: &ResumptionConfig) -> Duration {
    match prior.activity_type {
        ActivityType::Cycling if prior.length_m >= config.long_ride_length_m => secs(config.long_ride_timeout_secs),
        ActivityType::Cycling => secs(config.cycling_timeout_secs),
        ActivityType::Walking => secs(config.walking_timeout_secs),
        _ => secs(config.default_timeout_secs),
    }
}

/// Exact match, both motorized (when enabled), a stationary candidate, or a
/// prior trip of unknown type.
pub fn types_compatible(prior: ActivityType, candidate: ActivityType, config: &ResumptionConfig) -> bool {
    prior == candidate
        || (config.motorized_types_compatible && prior.is_motorized() && candidate.is_motorized())
        || candidate == ActivityType::Stationary
        || prior == ActivityType::Unknown
}

pub fn can_resume(
    prior: &TripSummary,
    candidate: ActivityType,
    candidate_start: DateTime<Utc>,
    config: &ResumptionConfig,
) -> bool {
    if prior.stopped_manually || !types_compatible(prior.activity_type, candidate, config) {
        return false;
    }
    let gap = candidate_start - prior.ended_at;
    gap.abs() < resumption_timeout(prior, config)
}

// ============================================================================
// Closing
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    TooFewSamples,
    Aborted,
    ShortMotorized,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseDisposition {
    Closed,
    Cancelled(CancelReason),
}

/// Decide the fate of a finished trip and, if it survives, fill in its final
/// activity type, length and close flags.
pub fn finalize(
    trip: &mut Trip,
    reason: StopReason,
    battery: Option<f64>,
    close: &TripCloseConfig,
    location: &LocationConfig,
    rules: &VoteRules,
) -> CloseDisposition {
    if reason.is_abort() {
        return CloseDisposition::Cancelled(CancelReason::Aborted);
    }
    if trip.sample_count() <= close.min_samples {
        return CloseDisposition::Cancelled(CancelReason::TooFewSamples);
    }

    let speeds = SpeedStats::from_samples(&trip.samples, location.moving_speed_floor);
    let mut activity = final_activity_type(trip.resolved_results(), speeds, trip.activity_type, rules);
    let length = trip.compute_length(close.simplify_epsilon_degrees);

    if activity.is_motorized() && (trip.sample_count() <= 2 || length < close.motorized_min_length_m) {
        return CloseDisposition::Cancelled(CancelReason::ShortMotorized);
    }
    if activity == ActivityType::Cycling
        && speeds.average_moving_speed > 0.0
        && speeds.average_moving_speed < close.walking_reclass_speed
    {
        activity = ActivityType::Walking;
    }

    trip.activity_type = activity;
    trip.closed = true;
    trip.stopped_manually = reason == StopReason::Manual;
    trip.battery_at_end = battery.or(trip.battery_at_end);
    CloseDisposition::Closed
}

// ============================================================================
// Store operations
// ============================================================================

/// Either a new trip or a reopened one, with the prototrip folded in.
#[derive(Debug, Clone)]
pub struct StartedTrip {
    pub trip: Trip,
    pub resumed: bool,
}

/// Create or resume a trip from a promoted prototrip.
pub fn begin_trip(
    store: &mut dyn TripStore,
    prototrip: Prototrip,
    activity: ActivityType,
    config: &ResumptionConfig,
) -> Result<StartedTrip> {
    let candidate_start = prototrip
        .first_sample()
        .map(|s| s.timestamp)
        .unwrap_or(prototrip.created_at);

    let prior = match store.most_recent_trip() {
        Ok(prior) => prior,
        Err(e) => {
            warn!("Could not load most recent trip, starting fresh: {}", e);
            None
        }
    };

    if let Some(prior) = prior.filter(|p| can_resume(p, activity, candidate_start, config)) {
        match store.resume_trip(prior.handle) {
            Ok(mut trip) => {
                trip.reopen();
                if activity != ActivityType::Stationary {
                    trip.activity_type = activity;
                }
                store.append_samples(trip.handle, &prototrip.samples)?;
                trip.samples.extend(prototrip.samples);
                trip.collections.extend(prototrip.collections);
                store.save_trip(&trip)?;
                info!(
                    "Resumed trip {} ({}s after it ended)",
                    trip.handle,
                    (candidate_start - prior.ended_at).num_seconds()
                );
                return Ok(StartedTrip { trip, resumed: true });
            }
            Err(e) => warn!("Could not resume trip {}, starting fresh: {}", prior.handle, e),
        }
    }

    let mut trip = Trip::new(prototrip.created_at, prototrip.battery_at_start);
    trip.activity_type = activity;
    trip.samples = prototrip.samples;
    trip.collections = prototrip.collections;
    store.create_trip(&trip)?;
    info!("Started {} trip {}", activity.description(), trip.handle);
    Ok(StartedTrip { trip, resumed: false })
}

/// Persist the outcome of [`finalize`].
pub fn end_trip(
    store: &mut dyn TripStore,
    trip: &mut Trip,
    reason: StopReason,
    battery: Option<f64>,
    close: &TripCloseConfig,
    location: &LocationConfig,
    rules: &VoteRules,
) -> Result<CloseDisposition> {
    let disposition = finalize(trip, reason, battery, close, location, rules);
    match disposition {
        CloseDisposition::Closed => {
            store.close_trip(trip)?;
            info!(
                "Closed {} trip {}: {} fixes, {:.0}m ({})",
                trip.activity_type.description(),
                trip.handle,
                trip.sample_count(),
                trip.length_m,
                reason.description()
            );
        }
        CloseDisposition::Cancelled(why) => {
            store.cancel_trip(trip.handle)?;
            info!("Cancelled trip {}: {:?} ({})", trip.handle, why, reason.description());
        }
    }
    Ok(disposition)
}

/// Close or cancel every trip left open by a previous process.
/// Returns how many were handled.
pub fn sweep_open_trips(
    store: &mut dyn TripStore,
    close: &TripCloseConfig,
    location: &LocationConfig,
    rules: &VoteRules,
) -> Result<usize> {
    let open = store.open_trips()?;
    let count = open.len();
    for mut trip in open {
        end_trip(store, &mut trip, StopReason::Interrupted, None, close, location, rules)?;
    }
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::InMemoryTripStore;
    use crate::types::{Coordinate, LocationSample, TripHandle};
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    fn rules() -> VoteRules {
        VoteRules {
            near_zero_speed: 0.5,
            aviation_speed: 70.0,
        }
    }

    fn summary(activity: ActivityType, length_m: f64) -> TripSummary {
        TripSummary {
            handle: TripHandle::new(),
            activity_type: activity,
            started_at: t0() - Duration::hours(1),
            ended_at: t0(),
            length_m,
            sample_count: 500,
            closed: true,
            stopped_manually: false,
        }
    }

    fn samples(count: usize, step_deg: f64, speed: f64) -> Vec<LocationSample> {
        (0..count)
            .map(|i| {
                LocationSample::new(
                    t0() + Duration::seconds(i as i64 * 5),
                    Coordinate::new(45.0 + i as f64 * step_deg, -122.0),
                    5.0,
                    speed,
                )
            })
            .collect()
    }

    #[test]
    fn test_long_ride_resumption_boundary() {
        let config = ResumptionConfig::default();
        let prior = summary(ActivityType::Cycling, 20_000.0);

        assert!(can_resume(&prior, ActivityType::Cycling, t0() + Duration::seconds(1000), &config));
        assert!(can_resume(&prior, ActivityType::Cycling, t0() + Duration::seconds(1079), &config));
        assert!(!can_resume(&prior, ActivityType::Cycling, t0() + Duration::seconds(1080), &config));
        assert!(!can_resume(&prior, ActivityType::Cycling, t0() + Duration::seconds(1081), &config));
    }

    #[test]
    fn test_short_ride_uses_cycling_timeout() {
        let config = ResumptionConfig::default();
        let prior = summary(ActivityType::Cycling, 5_000.0);
        assert!(can_resume(&prior, ActivityType::Cycling, t0() + Duration::seconds(299), &config));
        assert!(!can_resume(&prior, ActivityType::Cycling, t0() + Duration::seconds(1000), &config));
    }

    #[test]
    fn test_timeouts_per_type() {
        let config = ResumptionConfig::default();
        assert_eq!(resumption_timeout(&summary(ActivityType::Walking, 0.0), &config), Duration::seconds(900));
        assert_eq!(resumption_timeout(&summary(ActivityType::Automotive, 0.0), &config), Duration::seconds(600));
    }

    #[test]
    fn test_compatibility() {
        let config = ResumptionConfig::default();
        assert!(types_compatible(ActivityType::Bus, ActivityType::Automotive, &config));
        assert!(types_compatible(ActivityType::Walking, ActivityType::Stationary, &config));
        assert!(types_compatible(ActivityType::Unknown, ActivityType::Cycling, &config));
        assert!(!types_compatible(ActivityType::Cycling, ActivityType::Automotive, &config));

        let strict = ResumptionConfig {
            motorized_types_compatible: false,
            ..config
        };
        assert!(!types_compatible(ActivityType::Bus, ActivityType::Automotive, &strict));
    }

    #[test]
    fn test_manually_stopped_never_resumes() {
        let config = ResumptionConfig::default();
        let mut prior = summary(ActivityType::Automotive, 10_000.0);
        prior.stopped_manually = true;
        assert!(!can_resume(&prior, ActivityType::Automotive, t0() + Duration::seconds(10), &config));
    }

    #[test]
    fn test_discard_law() {
        let close = TripCloseConfig::default();
        let mut trip = Trip::new(t0(), Some(0.9));
        trip.samples = samples(6, 0.001, 5.0);
        assert_eq!(
            finalize(&mut trip, StopReason::NoRecentMovement, None, &close, &LocationConfig::default(), &rules()),
            CloseDisposition::Cancelled(CancelReason::TooFewSamples)
        );
        assert!(!trip.closed);

        trip.samples = samples(7, 0.001, 5.0);
        assert_eq!(
            finalize(&mut trip, StopReason::NoRecentMovement, None, &close, &LocationConfig::default(), &rules()),
            CloseDisposition::Closed
        );
        assert!(trip.closed);
    }

    #[test]
    fn test_abort_cancels_long_trip() {
        let mut trip = Trip::new(t0(), None);
        trip.samples = samples(100, 0.001, 5.0);
        assert_eq!(
            finalize(
                &mut trip,
                StopReason::Aborted,
                None,
                &TripCloseConfig::default(),
                &LocationConfig::default(),
                &rules()
            ),
            CloseDisposition::Cancelled(CancelReason::Aborted)
        );
    }

    #[test]
    fn test_short_motorized_cancelled() {
        let mut trip = Trip::new(t0(), None);
        trip.activity_type = ActivityType::Automotive;
        // 10 fixes ~11m apart, ~100m total
        trip.samples = samples(10, 0.0001, 5.0);
        assert_eq!(
            finalize(
                &mut trip,
                StopReason::NonMovingRun,
                None,
                &TripCloseConfig::default(),
                &LocationConfig::default(),
                &rules()
            ),
            CloseDisposition::Cancelled(CancelReason::ShortMotorized)
        );
    }

    #[test]
    fn test_slow_cycling_relabelled_walking() {
        let mut trip = Trip::new(t0(), Some(0.8));
        trip.activity_type = ActivityType::Cycling;
        trip.samples = samples(20, 0.0001, 1.3);
        let disposition = finalize(
            &mut trip,
            StopReason::Manual,
            Some(0.7),
            &TripCloseConfig::default(),
            &LocationConfig::default(),
            &rules(),
        );
        assert_eq!(disposition, CloseDisposition::Closed);
        assert_eq!(trip.activity_type, ActivityType::Walking);
        assert!(trip.stopped_manually);
        assert_eq!(trip.battery_at_end, Some(0.7));
    }

    #[test]
    fn test_begin_trip_resumes_recent_compatible() {
        let store = InMemoryTripStore::new();
        let mut boxed: Box<dyn TripStore> = Box::new(store.clone());

        let mut prior = Trip::new(t0() - Duration::hours(1), Some(0.9));
        prior.activity_type = ActivityType::Automotive;
        prior.samples = samples(10, 0.001, 10.0);
        prior.closed = true;
        store.insert(prior.clone());

        let mut prototrip = Prototrip::new(prior.ended_at() + Duration::seconds(120), Some(0.85));
        prototrip.samples = samples(3, 0.001, 10.0)
            .into_iter()
            .map(|mut s| {
                s.timestamp = s.timestamp + Duration::seconds(200);
                s
            })
            .collect();

        let started = begin_trip(boxed.as_mut(), prototrip, ActivityType::Bus, &ResumptionConfig::default())
            .expect("begin");
        assert!(started.resumed);
        assert_eq!(started.trip.handle, prior.handle);
        assert_eq!(started.trip.sample_count(), 13);
        assert!(!started.trip.closed);
        assert_eq!(store.trip(prior.handle).map(|t| t.sample_count()), Some(13));
    }

    #[test]
    fn test_begin_trip_creates_when_incompatible() {
        let store = InMemoryTripStore::new();
        let mut boxed: Box<dyn TripStore> = Box::new(store.clone());

        let mut prior = Trip::new(t0() - Duration::hours(1), None);
        prior.activity_type = ActivityType::Cycling;
        prior.samples = samples(10, 0.001, 5.0);
        prior.closed = true;
        store.insert(prior.clone());

        let prototrip = Prototrip::new(t0() + Duration::seconds(60), None);
        let started = begin_trip(boxed.as_mut(), prototrip, ActivityType::Automotive, &ResumptionConfig::default())
            .expect("begin");
        assert!(!started.resumed);
        assert_ne!(started.trip.handle, prior.handle);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_sweep_open_trips() {
        let store = InMemoryTripStore::new();
        let mut boxed: Box<dyn TripStore> = Box::new(store.clone());

        let mut short = Trip::new(t0(), None);
        short.samples = samples(3, 0.001, 5.0);
        let mut long = Trip::new(t0(), None);
        long.activity_type = ActivityType::Cycling;
        long.samples = samples(30, 0.001, 5.0);
        store.insert(short.clone());
        store.insert(long.clone());

        let handled = sweep_open_trips(
            boxed.as_mut(),
            &TripCloseConfig::default(),
            &LocationConfig::default(),
            &rules(),
        )
        .expect("sweep");
        assert_eq!(handled, 2);
        assert!(store.trip(short.handle).is_none());
        assert!(store.trip(long.handle).map(|t| t.closed).unwrap_or(false));
        assert!(store.open_trips().expect("open").is_empty());
    }
}
