//! In-memory collaborators.
//!
//! Shared-state test doubles for every outbound interface, plus a few track
//! generators. Each double is cheap to clone; clones share state through an
//! `Arc<Mutex<_>>`, so a test keeps one clone for assertions and boxes the
//! other into [`Collaborators`]. The demo binary replays scenarios through
//! the same doubles.

use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Duration, Utc};

use crate::classification::{ClassificationOutcome, ClassificationQuery, QueryToken, Stamped};
use crate::error::{Error, Result};
use crate::events::{EngineEvent, EngineNotification, TripObserver};
use crate::geofence::GeofenceRegion;
use crate::platform::{ClassificationService, Clock, Collaborators, LocationServices, TrackingMode, TripStore};
use crate::trip::{Trip, TripSummary};
use crate::types::{ClassificationResult, Coordinate, LocationSample, TripHandle};

/// 2024-05-01T08:00:00Z, a Wednesday morning commute.
pub const SIMULATION_EPOCH: i64 = 1_714_550_400;

/// Meters per degree of latitude.
const METERS_PER_DEGREE: f64 = 111_195.0;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn simulation_epoch() -> DateTime<Utc> {
    DateTime::from_timestamp(SIMULATION_EPOCH, 0).unwrap_or_default()
}

// ============================================================================
// Clock
// ============================================================================

#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }

    pub fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut now = lock(&self.now);
        *now += by;
        *now
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

// ============================================================================
// Trip store
// ============================================================================

#[derive(Debug, Default)]
struct StoreState {
    trips: Vec<Trip>,
    cancelled: Vec<TripHandle>,
    saves: usize,
    fail_writes: bool,
}

impl StoreState {
    fn find(&mut self, handle: TripHandle) -> Result<&mut Trip> {
        self.trips
            .iter_mut()
            .find(|t| t.handle == handle)
            .ok_or_else(|| Error::Persistence(format!("unknown trip {}", handle)))
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes {
            Err(Error::Persistence("store is read-only".to_string()))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct InMemoryTripStore {
    state: Arc<Mutex<StoreState>>,
}

impl InMemoryTripStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a trip as if a previous run had stored it.
    pub fn insert(&self, trip: Trip) {
        lock(&self.state).trips.push(trip);
    }

    pub fn trip(&self, handle: TripHandle) -> Option<Trip> {
        lock(&self.state).trips.iter().find(|t| t.handle == handle).cloned()
    }

    pub fn trips(&self) -> Vec<Trip> {
        lock(&self.state).trips.clone()
    }

    pub fn closed_trips(&self) -> Vec<Trip> {
        lock(&self.state).trips.iter().filter(|t| t.closed).cloned().collect()
    }

    pub fn cancelled(&self) -> Vec<TripHandle> {
        lock(&self.state).cancelled.clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.state).trips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn save_count(&self) -> usize {
        lock(&self.state).saves
    }

    pub fn fail_writes(&self, fail: bool) {
        lock(&self.state).fail_writes = fail;
    }
}

impl TripStore for InMemoryTripStore {
    fn most_recent_trip(&self) -> Result<Option<TripSummary>> {
        Ok(lock(&self.state)
            .trips
            .iter()
            .filter(|t| t.closed)
            .max_by_key(|t| t.ended_at())
            .map(Trip::summary))
    }

    fn open_trips(&self) -> Result<Vec<Trip>> {
        Ok(lock(&self.state).trips.iter().filter(|t| !t.closed).cloned().collect())
    }

    fn create_trip(&mut self, trip: &Trip) -> Result<()> {
        let mut state = lock(&self.state);
        state.check_writable()?;
        if state.trips.iter().any(|t| t.handle == trip.handle) {
            return Err(Error::Persistence(format!("trip {} already exists", trip.handle)));
        }
        state.trips.push(trip.clone());
        state.saves += 1;
        Ok(())
    }

    fn resume_trip(&mut self, handle: TripHandle) -> Result<Trip> {
        let mut state = lock(&self.state);
        state.check_writable()?;
        let stored = state.find(handle)?;
        stored.reopen();
        Ok(stored.clone())
    }

    fn append_samples(&mut self, handle: TripHandle, samples: &[LocationSample]) -> Result<()> {
        let mut state = lock(&self.state);
        state.check_writable()?;
        state.find(handle)?.samples.extend_from_slice(samples);
        Ok(())
    }

    fn save_trip(&mut self, trip: &Trip) -> Result<()> {
        let mut state = lock(&self.state);
        state.check_writable()?;
        *state.find(trip.handle)? = trip.clone();
        state.saves += 1;
        Ok(())
    }

    fn close_trip(&mut self, trip: &Trip) -> Result<()> {
        self.save_trip(trip)
    }

    fn cancel_trip(&mut self, handle: TripHandle) -> Result<()> {
        let mut state = lock(&self.state);
        state.check_writable()?;
        state.trips.retain(|t| t.handle != handle);
        state.cancelled.push(handle);
        Ok(())
    }
}

// ============================================================================
// Location services
// ============================================================================

/// One call that touched geofences.
#[derive(Debug, Clone, PartialEq)]
pub enum GeofenceCall {
    Install(usize),
    Teardown,
}

#[derive(Debug, Default)]
struct LocationState {
    modes: Vec<TrackingMode>,
    geofences: Vec<GeofenceRegion>,
    calls: Vec<GeofenceCall>,
    deferral_requests: usize,
    deferral_disallowed: usize,
    fail_geofences: bool,
    fail_deferral: bool,
}

#[derive(Debug, Clone, Default)]
pub struct RecordingLocationServices {
    state: Arc<Mutex<LocationState>>,
}

impl RecordingLocationServices {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_mode(&self) -> Option<TrackingMode> {
        lock(&self.state).modes.last().copied()
    }

    pub fn modes(&self) -> Vec<TrackingMode> {
        lock(&self.state).modes.clone()
    }

    pub fn geofences(&self) -> Vec<GeofenceRegion> {
        lock(&self.state).geofences.clone()
    }

    pub fn geofence_count(&self) -> usize {
        lock(&self.state).geofences.len()
    }

    pub fn geofence_calls(&self) -> Vec<GeofenceCall> {
        lock(&self.state).calls.clone()
    }

    /// Every install was immediately preceded by a teardown.
    pub fn teardown_always_preceded_install(&self) -> bool {
        let calls = lock(&self.state).calls.clone();
        calls.iter().enumerate().all(|(i, call)| match call {
            GeofenceCall::Install(_) => i > 0 && calls[i - 1] == GeofenceCall::Teardown,
            GeofenceCall::Teardown => true,
        })
    }

    pub fn deferral_requests(&self) -> usize {
        lock(&self.state).deferral_requests
    }

    pub fn deferral_disallowed(&self) -> usize {
        lock(&self.state).deferral_disallowed
    }

    pub fn fail_geofence_registration(&self, fail: bool) {
        lock(&self.state).fail_geofences = fail;
    }

    pub fn fail_deferral_requests(&self, fail: bool) {
        lock(&self.state).fail_deferral = fail;
    }
}

impl LocationServices for RecordingLocationServices {
    fn set_tracking_mode(&mut self, mode: TrackingMode) {
        lock(&self.state).modes.push(mode);
    }

    fn install_geofences(&mut self, regions: &[GeofenceRegion]) -> Result<()> {
        let mut state = lock(&self.state);
        state.calls.push(GeofenceCall::Install(regions.len()));
        if state.fail_geofences {
            return Err(Error::Geofence("monitoring unavailable".to_string()));
        }
        state.geofences.extend_from_slice(regions);
        Ok(())
    }

    fn teardown_geofences(&mut self) {
        let mut state = lock(&self.state);
        state.calls.push(GeofenceCall::Teardown);
        state.geofences.clear();
    }

    fn request_deferred_delivery(&mut self, _timeout: Duration) -> Result<()> {
        let mut state = lock(&self.state);
        if state.fail_deferral {
            return Err(Error::Deferral("deferred updates not supported".to_string()));
        }
        state.deferral_requests += 1;
        Ok(())
    }

    fn disallow_deferred_delivery(&mut self) {
        lock(&self.state).deferral_disallowed += 1;
    }
}

// ============================================================================
// Classifier
// ============================================================================

/// Records queries; the test or replay decides what each one returns.
#[derive(Debug, Clone, Default)]
pub struct QueuedClassificationService {
    queries: Arc<Mutex<Vec<ClassificationQuery>>>,
    fail: Arc<Mutex<bool>>,
}

impl QueuedClassificationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query_count(&self) -> usize {
        lock(&self.queries).len()
    }

    pub fn queries(&self) -> Vec<ClassificationQuery> {
        lock(&self.queries).clone()
    }

    pub fn last_token(&self) -> Option<QueryToken> {
        lock(&self.queries).last().map(|q| q.token)
    }

    pub fn fail_queries(&self, fail: bool) {
        *lock(&self.fail) = fail;
    }

    /// Completion event answering the most recent query.
    pub fn complete_last(&self, result: ClassificationResult) -> Option<EngineEvent> {
        self.last_token().map(|token| respond(token, Ok(result)))
    }
}

impl ClassificationService for QueuedClassificationService {
    fn issue_query(&mut self, query: ClassificationQuery) -> Result<()> {
        if *lock(&self.fail) {
            return Err(Error::Classification("classifier unavailable".to_string()));
        }
        lock(&self.queries).push(query);
        Ok(())
    }
}

/// Completion event for `token`.
pub fn respond(token: QueryToken, outcome: ClassificationOutcome) -> EngineEvent {
    EngineEvent::ClassificationCompleted(Stamped::new(token, outcome))
}

// ============================================================================
// Observer
// ============================================================================

#[derive(Debug, Clone, Default)]
pub struct NotificationLog {
    entries: Arc<Mutex<Vec<EngineNotification>>>,
}

impl NotificationLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn all(&self) -> Vec<EngineNotification> {
        lock(&self.entries).clone()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn count(&self, predicate: impl Fn(&EngineNotification) -> bool) -> usize {
        lock(&self.entries).iter().filter(|n| predicate(n)).count()
    }

    pub fn clear(&self) {
        lock(&self.entries).clear();
    }
}

impl TripObserver for NotificationLog {
    fn on_notification(&mut self, notification: &EngineNotification) {
        lock(&self.entries).push(notification.clone());
    }
}

// ============================================================================
// Platform bundle
// ============================================================================

/// One of each double, sharing state with whatever [`Self::collaborators`]
/// hands to the engine.
#[derive(Debug, Clone)]
pub struct SimulatedPlatform {
    pub store: InMemoryTripStore,
    pub location: RecordingLocationServices,
    pub classifier: QueuedClassificationService,
    pub clock: ManualClock,
}

impl SimulatedPlatform {
    pub fn new() -> Self {
        Self {
            store: InMemoryTripStore::new(),
            location: RecordingLocationServices::new(),
            classifier: QueuedClassificationService::new(),
            clock: ManualClock::new(simulation_epoch()),
        }
    }

    pub fn collaborators(&self) -> Collaborators {
        Collaborators::new(
            Box::new(self.store.clone()),
            Box::new(self.location.clone()),
            Box::new(self.classifier.clone()),
            Box::new(self.clock.clone()),
        )
    }
}

impl Default for SimulatedPlatform {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Tracks
// ============================================================================

/// Fixes heading due north at `speed_mps`, one every `interval_s` seconds.
/// The reported GPS speed is `reported_speed`, which may be the unknown
/// sentinel.
pub fn northbound_track(
    start: Coordinate,
    start_time: DateTime<Utc>,
    count: usize,
    interval_s: i64,
    speed_mps: f64,
    reported_speed: f64,
) -> Vec<LocationSample> {
    let step_deg = speed_mps * interval_s as f64 / METERS_PER_DEGREE;
    (0..count)
        .map(|i| {
            LocationSample::new(
                start_time + Duration::seconds(i as i64 * interval_s),
                Coordinate::new(start.latitude + step_deg * i as f64, start.longitude),
                5.0,
                reported_speed,
            )
        })
        .collect()
}

/// Fixes at one spot.
pub fn stationary_fixes(
    at: Coordinate,
    start_time: DateTime<Utc>,
    count: usize,
    interval_s: i64,
    reported_speed: f64,
) -> Vec<LocationSample> {
    northbound_track(at, start_time, count, interval_s, 0.0, reported_speed)
}
