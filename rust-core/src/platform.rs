//! Outbound collaborator interfaces.
//!
//! The engine never touches storage, the location stack, or the classifier
//! directly. Each is a trait object handed in at construction so the engine
//! runs the same against a phone, a replay harness, or a test double.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::classification::ClassificationQuery;
use crate::error::Result;
use crate::geofence::GeofenceRegion;
use crate::trip::{Trip, TripSummary};
use crate::types::{LocationSample, TripHandle};

/// Source of "now".
pub trait Clock: Send {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Power profile requested from the location stack.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackingMode {
    /// No location updates at all.
    Off,
    /// Geofences and significant-change wake-ups only.
    LowPower,
    /// Frequent, moderately accurate updates while deciding.
    Monitoring,
    /// Full-accuracy GPS for an in-progress trip.
    ActiveGps,
}

/// Platform location stack.
pub trait LocationServices: Send {
    fn set_tracking_mode(&mut self, mode: TrackingMode);

    fn install_geofences(&mut self, regions: &[GeofenceRegion]) -> Result<()>;

    fn teardown_geofences(&mut self);

    fn request_deferred_delivery(&mut self, timeout: Duration) -> Result<()>;

    fn disallow_deferred_delivery(&mut self);
}

/// Persistent trip storage. Writes are at-least-once; the engine may save
/// the same trip repeatedly.
pub trait TripStore: Send {
    /// Most recently closed trip, if any.
    fn most_recent_trip(&self) -> Result<Option<TripSummary>>;

    /// Trips left open, e.g. by a previous process that was killed.
    fn open_trips(&self) -> Result<Vec<Trip>>;

    fn create_trip(&mut self, trip: &Trip) -> Result<()>;

    /// Reopen a closed trip, returning it with its samples.
    fn resume_trip(&mut self, handle: TripHandle) -> Result<Trip>;

    fn append_samples(&mut self, handle: TripHandle, samples: &[LocationSample]) -> Result<()>;

    fn save_trip(&mut self, trip: &Trip) -> Result<()>;

    fn close_trip(&mut self, trip: &Trip) -> Result<()>;

    fn cancel_trip(&mut self, handle: TripHandle) -> Result<()>;
}

/// Motion classifier. Queries are fire-and-forget; results come back as
/// [`crate::events::EngineEvent::ClassificationCompleted`].
pub trait ClassificationService: Send {
    fn issue_query(&mut self, query: ClassificationQuery) -> Result<()>;
}

/// Everything the engine talks to.
pub struct Collaborators {
    pub store: Box<dyn TripStore>,
    pub location: Box<dyn LocationServices>,
    pub classifier: Box<dyn ClassificationService>,
    pub clock: Box<dyn Clock>,
}

impl Collaborators {
    pub fn new(
        store: Box<dyn TripStore>,
        location: Box<dyn LocationServices>,
        classifier: Box<dyn ClassificationService>,
        clock: Box<dyn Clock>,
    ) -> Self {
        Self {
            store,
            location,
            classifier,
            clock,
        }
    }
}
