//! Power and authorization gate.
//!
//! Answers one question: is tracking allowed right now? Tracking needs
//! location authorization, no user pause, and a battery above the low
//! threshold. Pause expiry is evaluated lazily by whoever observes the next
//! location event.

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::config::GateConfig;

/// User-requested pause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PauseState {
    NotPaused,
    Indefinitely,
    Until(DateTime<Utc>),
}

impl PauseState {
    pub fn is_paused(&self) -> bool {
        !matches!(self, PauseState::NotPaused)
    }
}

/// Location permission reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthorizationStatus {
    Authorized,
    Denied,
    NotDetermined,
}

/// Why tracking is currently disallowed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateBlock {
    PermissionDenied,
    Paused,
    LowBattery,
}

/// Effect of a battery report on the low-battery flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatteryTransition {
    BecameLow,
    Recovered,
    Unchanged,
}

#[derive(Debug, Clone)]
pub struct PowerGate {
    config: GateConfig,
    authorization: AuthorizationStatus,
    pause: PauseState,
    battery_level: Option<f64>,
}

impl PowerGate {
    pub fn new(config: GateConfig) -> Self {
        Self {
            config,
            authorization: AuthorizationStatus::NotDetermined,
            pause: PauseState::NotPaused,
            battery_level: None,
        }
    }

    pub fn authorization(&self) -> AuthorizationStatus {
        self.authorization
    }

    pub fn pause_state(&self) -> PauseState {
        self.pause
    }

    pub fn battery_level(&self) -> Option<f64> {
        self.battery_level
    }

    /// An unknown battery level is never low.
    pub fn is_low_battery(&self) -> bool {
        self.battery_level
            .map(|level| level < self.config.low_battery_threshold)
            .unwrap_or(false)
    }

    pub fn is_tracking_allowed(&self) -> bool {
        self.block_reason().is_none()
    }

    /// First reason tracking is blocked, permission taking precedence.
    pub fn block_reason(&self) -> Option<GateBlock> {
        if self.authorization != AuthorizationStatus::Authorized {
            Some(GateBlock::PermissionDenied)
        } else if self.pause.is_paused() {
            Some(GateBlock::Paused)
        } else if self.is_low_battery() {
            Some(GateBlock::LowBattery)
        } else {
            None
        }
    }

    /// Record a battery fraction in [0, 1]; out-of-range values are clamped.
    pub fn set_battery_level(&mut self, level: f64) -> BatteryTransition {
        let was_low = self.is_low_battery();
        self.battery_level = Some(level.max(0.0).min(1.0));
        let is_low = self.is_low_battery();

        match (was_low, is_low) {
            (false, true) => {
                info!("Battery at {:.0}%, below tracking threshold", level * 100.0);
                BatteryTransition::BecameLow
            }
            (true, false) => {
                info!("Battery recovered to {:.0}%", level * 100.0);
                BatteryTransition::Recovered
            }
            _ => BatteryTransition::Unchanged,
        }
    }

    /// Returns the previous status.
    pub fn set_authorization(&mut self, status: AuthorizationStatus) -> AuthorizationStatus {
        let previous = self.authorization;
        if previous != status {
            info!("Location authorization changed {:?} -> {:?}", previous, status);
        }
        self.authorization = status;
        previous
    }

    pub fn pause(&mut self, until: Option<DateTime<Utc>>) {
        self.pause = match until {
            Some(ts) => PauseState::Until(ts),
            None => PauseState::Indefinitely,
        };
        info!("Tracking paused: {:?}", self.pause);
    }

    /// Returns true if the gate was paused.
    pub fn resume(&mut self) -> bool {
        let was_paused = self.pause.is_paused();
        self.pause = PauseState::NotPaused;
        was_paused
    }

    /// Clear a timed pause whose expiry is in the past. Returns true if cleared.
    pub fn resume_if_expired(&mut self, now: DateTime<Utc>) -> bool {
        match self.pause {
            PauseState::Until(until) if until <= now => {
                debug!("Pause expired at {}", until);
                self.pause = PauseState::NotPaused;
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn authorized_gate() -> PowerGate {
        let mut gate = PowerGate::new(GateConfig::default());
        gate.set_authorization(AuthorizationStatus::Authorized);
        gate
    }

    #[test]
    fn test_not_determined_blocks_tracking() {
        let gate = PowerGate::new(GateConfig::default());
        assert_eq!(gate.block_reason(), Some(GateBlock::PermissionDenied));
    }

    #[test]
    fn test_authorized_allows_tracking() {
        assert!(authorized_gate().is_tracking_allowed());
    }

    #[test]
    fn test_low_battery_transition() {
        let mut gate = authorized_gate();
        assert_eq!(gate.set_battery_level(0.25), BatteryTransition::Unchanged);
        assert!(gate.is_tracking_allowed());
        assert_eq!(gate.set_battery_level(0.15), BatteryTransition::BecameLow);
        assert_eq!(gate.block_reason(), Some(GateBlock::LowBattery));
        assert_eq!(gate.set_battery_level(0.10), BatteryTransition::Unchanged);
        assert_eq!(gate.set_battery_level(0.50), BatteryTransition::Recovered);
        assert!(gate.is_tracking_allowed());
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mut gate = authorized_gate();
        gate.set_battery_level(0.2);
        assert!(!gate.is_low_battery());
    }

    #[test]
    fn test_timed_pause_expires_lazily() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let mut gate = authorized_gate();
        gate.pause(Some(now + Duration::minutes(30)));

        assert_eq!(gate.block_reason(), Some(GateBlock::Paused));
        assert!(!gate.resume_if_expired(now + Duration::minutes(29)));
        assert!(!gate.is_tracking_allowed());
        assert!(gate.resume_if_expired(now + Duration::minutes(30)));
        assert!(gate.is_tracking_allowed());
    }

    #[test]
    fn test_indefinite_pause_never_expires() {
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap();
        let mut gate = authorized_gate();
        gate.pause(None);
        assert!(!gate.resume_if_expired(now + Duration::days(365)));
        assert!(gate.resume());
        assert!(!gate.resume());
    }

    #[test]
    fn test_permission_takes_precedence() {
        let mut gate = authorized_gate();
        gate.pause(None);
        gate.set_battery_level(0.05);
        gate.set_authorization(AuthorizationStatus::Denied);
        assert_eq!(gate.block_reason(), Some(GateBlock::PermissionDenied));
    }
}
