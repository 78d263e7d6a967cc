//! The trip detection engine.
//!
//! A single owner of [`TrackingState`] that consumes [`EngineEvent`]s one at
//! a time and drives the collaborators. Exactly one of Idle, Monitoring and
//! Active holds; entering a state releases the resources of the previous
//! one, and every transition advances the classification [`Generation`] so
//! completions issued under an older state are dropped.
//!
//! # Flow
//! ```text
//!   Idle --wake/coarse fix--> Monitoring --promote--> Active
//!    ^                           |                      |
//!    +------demote/abandon-------+-------stop-----------+
//! ```
//!
//! Errors from collaborators never escape [`TripEngine::handle_event`]; they
//! are logged and the engine carries on in the most conservative state.

use chrono::{DateTime, Utc};
use log::{debug, error, info, trace, warn};
use serde::Serialize;

use crate::active::{ActiveTripController, StopReason};
use crate::classification::{ClassificationOutcome, ClassificationQuery, Generation, MotionBuffer, QueryScheduler, Stamped};
use crate::config::{secs, EngineConfig};
use crate::deferral::{DeferralError, DeferralScheduler};
use crate::error::Result;
use crate::events::{EngineEvent, EngineNotification, ObserverId, Observers, TripObserver};
use crate::gate::{AuthorizationStatus, BatteryTransition, PowerGate};
use crate::geofence::{GeofenceManager, RegionEventKind};
use crate::lifecycle::{self, CloseDisposition};
use crate::monitoring::{MonitoringController, MonitoringOutcome, Prototrip};
use crate::platform::{Collaborators, TrackingMode};
use crate::trip::{Trip, TripSummary};
use crate::types::{ActivityType, Coordinate, LocationSample, MotionReading, TrackingStateKind};
use crate::vote::VoteRules;

/// Nothing in progress; geofences (if any) are armed around `anchor`.
#[derive(Debug, Clone, Default)]
pub struct IdleContext {
    pub anchor: Option<Coordinate>,
}

/// The engine's one and only state.
#[derive(Debug, Clone)]
pub enum TrackingState {
    Idle(IdleContext),
    Monitoring(MonitoringController),
    Active(ActiveTripController),
}

impl TrackingState {
    pub fn kind(&self) -> TrackingStateKind {
        match self {
            TrackingState::Idle(_) => TrackingStateKind::Idle,
            TrackingState::Monitoring(_) => TrackingStateKind::Monitoring,
            TrackingState::Active(_) => TrackingStateKind::Active,
        }
    }
}

/// Point-in-time view of the engine, cheap to clone and serialize.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EngineSnapshot {
    pub state: TrackingStateKind,
    pub generation: u64,
    pub geofences_installed: usize,
    pub prototrip_samples: Option<usize>,
    pub trip: Option<TripSummary>,
    pub tracking_allowed: bool,
    pub deferring: bool,
}

pub struct TripEngine {
    config: EngineConfig,
    state: TrackingState,
    generation: Generation,
    gate: PowerGate,
    geofences: GeofenceManager,
    deferral: DeferralScheduler,
    queries: QueryScheduler,
    motion: MotionBuffer,
    collab: Collaborators,
    observers: Observers,
    vote_rules: VoteRules,
    last_known: Option<LocationSample>,
}

impl TripEngine {
    /// Fails only if `config` does not validate.
    pub fn new(config: EngineConfig, collab: Collaborators) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            gate: PowerGate::new(config.gate.clone()),
            geofences: GeofenceManager::new(config.geofence.clone()),
            deferral: DeferralScheduler::new(config.deferral.clone()),
            queries: QueryScheduler::new(config.query.clone()),
            motion: MotionBuffer::new(config.query.max_buffered_readings),
            vote_rules: VoteRules {
                near_zero_speed: config.monitoring.near_zero_speed,
                aviation_speed: config.close.aviation_speed,
            },
            state: TrackingState::Idle(IdleContext::default()),
            generation: Generation::default(),
            observers: Observers::new(),
            last_known: None,
            collab,
            config,
        })
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> &TrackingState {
        &self.state
    }

    pub fn state_kind(&self) -> TrackingStateKind {
        self.state.kind()
    }

    pub fn generation(&self) -> Generation {
        self.generation
    }

    pub fn gate(&self) -> &PowerGate {
        &self.gate
    }

    pub fn geofences(&self) -> &GeofenceManager {
        &self.geofences
    }

    pub fn is_deferring(&self) -> bool {
        self.deferral.is_deferring()
    }

    pub fn current_trip(&self) -> Option<&Trip> {
        match &self.state {
            TrackingState::Active(active) => Some(active.trip()),
            _ => None,
        }
    }

    pub fn prototrip(&self) -> Option<&Prototrip> {
        match &self.state {
            TrackingState::Monitoring(monitoring) => Some(monitoring.prototrip()),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot {
            state: self.state_kind(),
            generation: self.generation.value(),
            geofences_installed: self.geofences.installed_count(),
            prototrip_samples: self.prototrip().map(|p| p.samples.len()),
            trip: self.current_trip().map(Trip::summary),
            tracking_allowed: self.gate.is_tracking_allowed(),
            deferring: self.deferral.is_deferring(),
        }
    }

    pub fn subscribe(&mut self, observer: Box<dyn TripObserver>) -> ObserverId {
        self.observers.subscribe(observer)
    }

    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        self.observers.unsubscribe(id)
    }

    // ========================================================================
    // Entry points
    // ========================================================================

    /// Close trips a previous process left open, then start looking for a
    /// first fix if tracking is allowed.
    pub fn start(&mut self) {
        match lifecycle::sweep_open_trips(
            self.collab.store.as_mut(),
            &self.config.close,
            &self.config.location,
            &self.vote_rules,
        ) {
            Ok(0) => {}
            Ok(count) => info!("Closed {} trips left open by a previous run", count),
            Err(e) => error!("Startup sweep of open trips failed: {}", e),
        }

        if self.gate.is_tracking_allowed() {
            self.enter_monitoring();
        } else {
            info!("Tracking not allowed at startup: {:?}", self.gate.block_reason());
            self.collab.location.set_tracking_mode(TrackingMode::Off);
        }
    }

    /// Process one event to completion.
    pub fn handle_event(&mut self, event: EngineEvent) {
        trace!("Handling {} in {:?}", event.name(), self.state_kind());
        match event {
            EngineEvent::Locations(batch) => self.on_locations(batch),
            EngineEvent::MotionReadings(readings) => self.on_motion(readings),
            EngineEvent::Geofence { identifier, kind } => self.on_geofence(&identifier, kind),
            EngineEvent::GeofenceMonitoringFailed(reason) => self.on_geofence_failure(&reason),
            EngineEvent::ClassificationCompleted(stamped) => self.on_classification(stamped),
            EngineEvent::BatteryLevel(level) => self.on_battery(level),
            EngineEvent::Authorization(status) => self.on_authorization(status),
            EngineEvent::Pause(until) => self.on_pause(until),
            EngineEvent::Resume => self.on_resume(),
            EngineEvent::DeferralFinished(error) => self.on_deferral_finished(error),
            EngineEvent::StopTripRequested => self.on_stop_requested(StopReason::Manual),
            EngineEvent::AbortTripRequested => self.on_stop_requested(StopReason::Aborted),
        }
    }

    // ========================================================================
    // Event handlers
    // ========================================================================

    fn on_locations(&mut self, batch: Vec<LocationSample>) {
        let now = self.collab.clock.now();

        if self.gate.resume_if_expired(now) {
            self.notify(EngineNotification::TrackingResumed);
        }
        if !self.gate.is_tracking_allowed() {
            trace!("Dropping {} fixes: {:?}", batch.len(), self.gate.block_reason());
            return;
        }

        let accuracy = self.config.location.acceptable_accuracy_m;
        if let Some(best) = batch
            .iter()
            .filter(|s| s.is_acceptable(accuracy))
            .max_by_key(|s| s.timestamp)
        {
            if self.last_known.map_or(true, |known| best.timestamp >= known.timestamp) {
                self.last_known = Some(*best);
            }
        }

        if let TrackingState::Idle(_) = self.state {
            debug!("Coarse location change while idle");
            self.enter_monitoring();
        }

        let mut stop = None;
        let mut update = None;
        match &mut self.state {
            TrackingState::Idle(_) => return,
            TrackingState::Monitoring(monitoring) => {
                let kept = monitoring.ingest(&batch);
                trace!("Prototrip kept {} of {} fixes", kept, batch.len());
            }
            TrackingState::Active(active) => {
                let report = active.ingest(&batch);
                if !report.accepted.is_empty() {
                    let trip = active.trip();
                    if let Err(e) = self.collab.store.append_samples(trip.handle, &report.accepted) {
                        warn!("Could not append fixes to trip {}: {}", trip.handle, e);
                    }
                    if report.save_due {
                        if let Err(e) = self.collab.store.save_trip(trip) {
                            warn!("Could not save trip {}: {}", trip.handle, e);
                        }
                    }
                    update = Some(EngineNotification::TripUpdated {
                        handle: trip.handle,
                        sample_count: trip.sample_count(),
                        activity_type: trip.activity_type,
                    });
                }
                let base = secs(self.config.active.max_time_since_moving_secs);
                stop = active.check_stop(self.deferral.max_time_since_moving(base));
            }
        }

        if let Some(update) = update {
            self.notify(update);
        }
        if let Some(reason) = stop {
            self.stop_trip(reason);
            return;
        }
        if self.state_kind() == TrackingStateKind::Active {
            self.deferral.begin_if_appropriate(self.collab.location.as_mut());
        }
        self.poll_query(now);
    }

    fn on_motion(&mut self, readings: Vec<MotionReading>) {
        if self.state_kind() == TrackingStateKind::Idle || !self.gate.is_tracking_allowed() {
            return;
        }
        self.motion.extend(readings);
        let now = self.collab.clock.now();
        self.poll_query(now);
    }

    fn on_geofence(&mut self, identifier: &str, kind: RegionEventKind) {
        if !self.geofences.is_wake_event(identifier, kind) {
            trace!("Ignoring {:?} for region {}", kind, identifier);
            return;
        }
        if !self.gate.is_tracking_allowed() {
            debug!("Geofence {} fired but tracking is blocked", identifier);
            return;
        }

        info!("Woken by geofence {} ({:?})", identifier, kind);
        if let TrackingState::Monitoring(monitoring) = &mut self.state {
            monitoring.reset_ambiguity();
        } else if self.state_kind() == TrackingStateKind::Idle {
            self.enter_monitoring();
        }
    }

    fn on_geofence_failure(&mut self, reason: &str) {
        warn!("Geofence monitoring failed: {}", reason);
        self.fall_back_to_coarse_wakeups();
    }

    /// With no wake regions only coarse location changes can wake an idle
    /// engine, so keep low-power delivery running.
    fn fall_back_to_coarse_wakeups(&mut self) {
        self.geofences.teardown(self.collab.location.as_mut());
        if self.state_kind() == TrackingStateKind::Idle && self.gate.is_tracking_allowed() {
            self.collab.location.set_tracking_mode(TrackingMode::LowPower);
        }
    }

    fn on_classification(&mut self, stamped: Stamped<ClassificationOutcome>) {
        let Some((token, outcome)) = stamped.apply_if_current(self.generation, |token, outcome| (token, outcome))
        else {
            return;
        };
        self.queries.complete(token);

        let result = match outcome {
            Ok(result) => result,
            Err(reason) => {
                warn!("Classification query {} failed: {}", token.query_id, reason);
                return;
            }
        };

        let now = self.collab.clock.now();
        match &mut self.state {
            TrackingState::Idle(_) => {}
            TrackingState::Monitoring(monitoring) => match monitoring.on_result(token, result, now) {
                MonitoringOutcome::Continue => {}
                MonitoringOutcome::Promote(activity) => self.promote(activity),
                MonitoringOutcome::Demote | MonitoringOutcome::Abandon => self.return_to_idle(),
            },
            TrackingState::Active(active) => {
                if active.on_result(token, result, &self.vote_rules) {
                    let trip = active.trip();
                    let update = EngineNotification::TripUpdated {
                        handle: trip.handle,
                        sample_count: trip.sample_count(),
                        activity_type: trip.activity_type,
                    };
                    self.notify(update);
                }
            }
        }
    }

    fn on_battery(&mut self, level: f64) {
        match self.gate.set_battery_level(level) {
            BatteryTransition::BecameLow => match self.state_kind() {
                TrackingStateKind::Active => {
                    self.stop_trip(StopReason::LowBattery);
                    self.notify(EngineNotification::LowBatteryPause);
                }
                TrackingStateKind::Monitoring => self.return_to_idle(),
                TrackingStateKind::Idle => {}
            },
            BatteryTransition::Recovered => {
                if self.state_kind() == TrackingStateKind::Idle && self.gate.is_tracking_allowed() {
                    self.enter_monitoring();
                }
            }
            BatteryTransition::Unchanged => {}
        }
    }

    fn on_authorization(&mut self, status: AuthorizationStatus) {
        let previous = self.gate.set_authorization(status);
        if status == previous {
            return;
        }

        if status == AuthorizationStatus::Authorized {
            if self.state_kind() == TrackingStateKind::Idle && self.gate.is_tracking_allowed() {
                self.enter_monitoring();
            }
            return;
        }

        match self.state_kind() {
            TrackingStateKind::Active => self.stop_trip(StopReason::PermissionDenied),
            _ => self.go_dormant(),
        }
        if status == AuthorizationStatus::Denied {
            self.notify(EngineNotification::PermissionNeeded);
        }
    }

    fn on_pause(&mut self, until: Option<DateTime<Utc>>) {
        self.gate.pause(until);
        match self.state_kind() {
            TrackingStateKind::Active => self.stop_trip(StopReason::Paused),
            _ => self.go_dormant(),
        }
        self.notify(EngineNotification::TrackingPaused { until });
    }

    fn on_resume(&mut self) {
        if !self.gate.resume() {
            return;
        }
        self.notify(EngineNotification::TrackingResumed);
        if self.state_kind() == TrackingStateKind::Idle && self.gate.is_tracking_allowed() {
            self.enter_monitoring();
        }
    }

    fn on_deferral_finished(&mut self, error: Option<DeferralError>) {
        let still_active = self.state_kind() == TrackingStateKind::Active;
        self.deferral
            .on_finished(error, still_active, self.collab.location.as_mut());
    }

    fn on_stop_requested(&mut self, reason: StopReason) {
        match self.state_kind() {
            TrackingStateKind::Active => self.stop_trip(reason),
            TrackingStateKind::Monitoring => {
                info!("Trip {} while monitoring, discarding prototrip", reason.description());
                self.return_to_idle();
            }
            TrackingStateKind::Idle => debug!("No trip to stop"),
        }
    }

    // ========================================================================
    // Transitions
    // ========================================================================

    fn take_state(&mut self) -> TrackingState {
        std::mem::replace(&mut self.state, TrackingState::Idle(IdleContext::default()))
    }

    /// Install `next`, advancing the generation so in-flight queries for the
    /// old state become stale.
    fn install_state(&mut self, from: TrackingStateKind, next: TrackingState) {
        let to = next.kind();
        self.state = next;
        self.generation.advance();
        self.queries.reset();
        if to == TrackingStateKind::Idle {
            self.motion.clear();
        }
        info!("{:?} -> {:?} ({})", from, to, to.description());
        self.notify(EngineNotification::StateChanged { from, to });
    }

    fn enter_monitoring(&mut self) {
        if self.state_kind() != TrackingStateKind::Idle {
            return;
        }
        let now = self.collab.clock.now();

        self.geofences.teardown(self.collab.location.as_mut());
        self.collab.location.set_tracking_mode(TrackingMode::Monitoring);

        let controller = MonitoringController::new(
            Prototrip::new(now, self.gate.battery_level()),
            self.config.location.clone(),
            self.config.monitoring.clone(),
            self.config.deferral.stale_after(),
        );
        self.install_state(TrackingStateKind::Idle, TrackingState::Monitoring(controller));
        self.poll_query(now);
    }

    fn promote(&mut self, activity: ActivityType) {
        let TrackingState::Monitoring(monitoring) = self.take_state() else {
            return;
        };
        let prototrip = monitoring.into_prototrip();
        let now = self.collab.clock.now();
        let moving_since = prototrip.last_sample().map(|s| s.timestamp).unwrap_or(now);
        let anchor = prototrip
            .last_sample()
            .map(|s| s.coordinate)
            .or(self.last_known.map(|s| s.coordinate));

        let started = match lifecycle::begin_trip(
            self.collab.store.as_mut(),
            prototrip,
            activity,
            &self.config.resumption,
        ) {
            Ok(started) => started,
            Err(e) => {
                error!("Could not start trip: {}", e);
                self.arm_idle(TrackingStateKind::Monitoring, anchor);
                return;
            }
        };

        self.collab.location.set_tracking_mode(TrackingMode::ActiveGps);
        self.deferral.reset_for_session();

        let handle = started.trip.handle;
        let activity_type = started.trip.activity_type;
        let controller = ActiveTripController::new(
            started.trip,
            moving_since,
            self.config.active.clone(),
            self.config.location.clone(),
            self.config.close.save_every_samples,
        );
        self.install_state(TrackingStateKind::Monitoring, TrackingState::Active(controller));
        self.notify(EngineNotification::TripStarted {
            handle,
            activity_type,
            resumed: started.resumed,
        });
        self.deferral.begin_if_appropriate(self.collab.location.as_mut());
    }

    /// Discard whatever is in progress and arm geofences around the last
    /// good location.
    fn return_to_idle(&mut self) {
        let from = self.state_kind();
        let now = self.collab.clock.now();
        let anchor = match self.take_state() {
            TrackingState::Monitoring(monitoring) => monitoring
                .last_fresh_sample(now)
                .map(|s| s.coordinate)
                .or(self.last_known.map(|s| s.coordinate)),
            TrackingState::Active(active) => active.last_location().map(|s| s.coordinate),
            TrackingState::Idle(idle) => idle.anchor,
        };
        self.arm_idle(from, anchor);
    }

    /// Enter Idle with geofences around `anchor`. If there is no anchor or
    /// registration fails, the engine takes the same path as a platform
    /// monitoring failure.
    fn arm_idle(&mut self, from: TrackingStateKind, anchor: Option<Coordinate>) {
        self.collab.location.set_tracking_mode(TrackingMode::LowPower);
        let armed = match anchor {
            Some(center) => self.geofences.install(center, self.collab.location.as_mut()),
            None => {
                warn!("No location to anchor geofences, relying on coarse wake-ups");
                false
            }
        };
        self.install_state(from, TrackingState::Idle(IdleContext { anchor }));
        if !armed {
            self.fall_back_to_coarse_wakeups();
        }
    }

    /// Discard a prototrip (if any) and install nothing: used for pause and
    /// revoked permission. Active trips go through [`Self::stop_trip`].
    fn go_dormant(&mut self) {
        let from = self.state_kind();
        self.take_state();
        self.geofences.teardown(self.collab.location.as_mut());
        self.collab.location.set_tracking_mode(TrackingMode::Off);
        if from != TrackingStateKind::Idle {
            self.install_state(from, TrackingState::Idle(IdleContext::default()));
        }
    }

    fn stop_trip(&mut self, reason: StopReason) {
        let TrackingState::Active(active) = self.take_state() else {
            return;
        };
        self.deferral.end(self.collab.location.as_mut());

        let mut trip = active.into_trip();
        let anchor = trip
            .last_accurate_sample(self.config.location.acceptable_accuracy_m)
            .map(|s| s.coordinate);

        match lifecycle::end_trip(
            self.collab.store.as_mut(),
            &mut trip,
            reason,
            self.gate.battery_level(),
            &self.config.close,
            &self.config.location,
            &self.vote_rules,
        ) {
            Ok(CloseDisposition::Closed) => self.notify(EngineNotification::TripStopped {
                handle: trip.handle,
                activity_type: trip.activity_type,
                length_m: trip.length_m,
                sample_count: trip.sample_count(),
                battery_used: trip.battery_used(),
            }),
            Ok(CloseDisposition::Cancelled(_)) => {
                self.notify(EngineNotification::TripCancelled { handle: trip.handle })
            }
            Err(e) => error!("Could not finish trip {}: {}", trip.handle, e),
        }

        match reason {
            StopReason::PermissionDenied | StopReason::Paused => {
                self.geofences.teardown(self.collab.location.as_mut());
                self.collab.location.set_tracking_mode(TrackingMode::Off);
                self.install_state(TrackingStateKind::Active, TrackingState::Idle(IdleContext::default()));
            }
            _ => self.arm_idle(TrackingStateKind::Active, anchor),
        }
    }

    // ========================================================================
    // Classification queries
    // ========================================================================

    fn poll_query(&mut self, now: DateTime<Utc>) {
        if self.state_kind() == TrackingStateKind::Idle {
            return;
        }
        let Some(token) = self.queries.poll(now, self.generation) else {
            return;
        };

        let window = self.motion.window(now, self.config.query.window());
        let stale_after = self.config.deferral.stale_after();
        let samples = match &mut self.state {
            TrackingState::Idle(_) => return,
            TrackingState::Monitoring(monitoring) => {
                monitoring.record_query(token, window.clone());
                monitoring.fresh_samples(now)
            }
            TrackingState::Active(active) => {
                active.record_query(token, window.clone());
                active
                    .trip()
                    .samples
                    .iter()
                    .filter(|s| now - s.timestamp <= stale_after)
                    .copied()
                    .collect()
            }
        };

        debug!(
            "Issuing classification query {} over {} readings",
            token.query_id,
            window.readings.len()
        );
        let query = ClassificationQuery { token, window, samples };
        if let Err(e) = self.collab.classifier.issue_query(query) {
            warn!("Could not issue classification query: {}", e);
            self.queries.issue_failed(token);
        }
    }

    fn notify(&mut self, notification: EngineNotification) {
        debug!("Notify {:?}", notification);
        self.observers.notify(&notification);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::SimulatedPlatform;

    #[test]
    fn test_new_rejects_invalid_config() {
        let platform = SimulatedPlatform::new();
        let mut config = EngineConfig::default();
        config.geofence.ring_region_count = 0;
        assert!(TripEngine::new(config, platform.collaborators()).is_err());
    }

    #[test]
    fn test_starts_idle_and_blocked_until_authorized() {
        let platform = SimulatedPlatform::new();
        let mut engine = TripEngine::new(EngineConfig::default(), platform.collaborators()).unwrap();
        engine.start();
        assert_eq!(engine.state_kind(), TrackingStateKind::Idle);
        assert_eq!(platform.location.last_mode(), Some(TrackingMode::Off));

        engine.handle_event(EngineEvent::Authorization(AuthorizationStatus::Authorized));
        assert_eq!(engine.state_kind(), TrackingStateKind::Monitoring);
        assert_eq!(platform.location.last_mode(), Some(TrackingMode::Monitoring));
    }

    #[test]
    fn test_every_transition_advances_generation() {
        let platform = SimulatedPlatform::new();
        let mut engine = TripEngine::new(EngineConfig::default(), platform.collaborators()).unwrap();
        let g0 = engine.generation();
        engine.handle_event(EngineEvent::Authorization(AuthorizationStatus::Authorized));
        let g1 = engine.generation();
        engine.handle_event(EngineEvent::StopTripRequested);
        let g2 = engine.generation();
        assert!(g0 < g1 && g1 < g2);
    }

    #[test]
    fn test_snapshot_serializes() {
        let platform = SimulatedPlatform::new();
        let engine = TripEngine::new(EngineConfig::default(), platform.collaborators()).unwrap();
        let json = serde_json::to_value(engine.snapshot()).unwrap();
        assert_eq!(json["state"], "idle");
        assert_eq!(json["geofences_installed"], 0);
    }
}
