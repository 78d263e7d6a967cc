//! Inbound events and outbound notifications.
//!
//! Everything the engine reacts to is an [`EngineEvent`], processed one at a
//! time to completion. Everything it announces is an [`EngineNotification`]
//! delivered to registered [`TripObserver`]s in registration order.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::classification::{ClassificationOutcome, Stamped};
use crate::deferral::DeferralError;
use crate::gate::AuthorizationStatus;
use crate::geofence::RegionEventKind;
use crate::types::{ActivityType, LocationSample, MotionReading, TrackingStateKind, TripHandle};

/// Something that happened outside the engine.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// A batch of fixes, possibly deferred, in platform order.
    Locations(Vec<LocationSample>),
    /// Raw motion readings for the classification window buffer.
    MotionReadings(Vec<MotionReading>),
    Geofence {
        identifier: String,
        kind: RegionEventKind,
    },
    /// The platform stopped monitoring our regions.
    GeofenceMonitoringFailed(String),
    ClassificationCompleted(Stamped<ClassificationOutcome>),
    /// Battery fraction in [0, 1].
    BatteryLevel(f64),
    Authorization(AuthorizationStatus),
    /// Pause until the timestamp, or indefinitely.
    Pause(Option<DateTime<Utc>>),
    Resume,
    DeferralFinished(Option<DeferralError>),
    StopTripRequested,
    AbortTripRequested,
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::Locations(_) => "locations",
            EngineEvent::MotionReadings(_) => "motion_readings",
            EngineEvent::Geofence { .. } => "geofence",
            EngineEvent::GeofenceMonitoringFailed(_) => "geofence_monitoring_failed",
            EngineEvent::ClassificationCompleted(_) => "classification_completed",
            EngineEvent::BatteryLevel(_) => "battery_level",
            EngineEvent::Authorization(_) => "authorization",
            EngineEvent::Pause(_) => "pause",
            EngineEvent::Resume => "resume",
            EngineEvent::DeferralFinished(_) => "deferral_finished",
            EngineEvent::StopTripRequested => "stop_trip_requested",
            EngineEvent::AbortTripRequested => "abort_trip_requested",
        }
    }
}

/// Something the engine announces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineNotification {
    StateChanged {
        from: TrackingStateKind,
        to: TrackingStateKind,
    },
    TripStarted {
        handle: TripHandle,
        activity_type: ActivityType,
        resumed: bool,
    },
    TripUpdated {
        handle: TripHandle,
        sample_count: usize,
        activity_type: ActivityType,
    },
    TripStopped {
        handle: TripHandle,
        activity_type: ActivityType,
        length_m: f64,
        sample_count: usize,
        battery_used: Option<f64>,
    },
    TripCancelled {
        handle: TripHandle,
    },
    /// User-visible: tracking stopped because the battery is low.
    LowBatteryPause,
    /// User-visible: location permission is needed to continue.
    PermissionNeeded,
    TrackingPaused {
        until: Option<DateTime<Utc>>,
    },
    TrackingResumed,
}

impl EngineNotification {
    /// Notifications that surface to the person using the device.
    pub fn is_user_visible(&self) -> bool {
        matches!(
            self,
            EngineNotification::LowBatteryPause | EngineNotification::PermissionNeeded
        )
    }
}

/// Receives engine notifications.
pub trait TripObserver: Send {
    fn on_notification(&mut self, notification: &EngineNotification);
}

/// Handle returned by [`Observers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Registration-ordered observer list.
#[derive(Default)]
pub struct Observers {
    entries: Vec<(ObserverId, Box<dyn TripObserver>)>,
    next_id: u64,
}

impl Observers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&mut self, observer: Box<dyn TripObserver>) -> ObserverId {
        let id = ObserverId(self.next_id);
        self.next_id += 1;
        self.entries.push((id, observer));
        id
    }

    /// Returns true if the observer was registered.
    pub fn unsubscribe(&mut self, id: ObserverId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry_id, _)| *entry_id != id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn notify(&mut self, notification: &EngineNotification) {
        for (_, observer) in self.entries.iter_mut() {
            observer.on_notification(notification);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulation::NotificationLog;

    #[test]
    fn test_observers_notified_in_order_until_unsubscribed() {
        let first = NotificationLog::new();
        let second = NotificationLog::new();
        let mut observers = Observers::new();

        let first_id = observers.subscribe(Box::new(first.clone()));
        observers.subscribe(Box::new(second.clone()));
        observers.notify(&EngineNotification::TrackingResumed);

        assert!(observers.unsubscribe(first_id));
        assert!(!observers.unsubscribe(first_id));
        observers.notify(&EngineNotification::LowBatteryPause);

        assert_eq!(first.len(), 1);
        assert_eq!(second.len(), 2);
    }

    #[test]
    fn test_user_visible_notifications() {
        assert!(EngineNotification::PermissionNeeded.is_user_visible());
        assert!(!EngineNotification::TrackingResumed.is_user_visible());
    }

    #[test]
    fn test_notification_json_shape() {
        let json = serde_json::to_value(EngineNotification::StateChanged {
            from: TrackingStateKind::Idle,
            to: TrackingStateKind::Monitoring,
        })
        .unwrap();
        assert_eq!(json["type"], "state_changed");
        assert_eq!(json["to"], "monitoring");
    }
}
