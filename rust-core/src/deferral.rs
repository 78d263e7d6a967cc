//! Deferred (batched) location delivery.
//!
//! While a trip is active the platform can hold location updates and deliver
//! them in bursts, which saves a lot of power. The scheduler arms deferral
//! when appropriate, re-arms it after each burst, and stops trying for the
//! rest of the session after a genuine error. Decision logic only sees it
//! through [`DeferralScheduler::max_time_since_moving`].

use chrono::Duration;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::config::DeferralConfig;
use crate::platform::LocationServices;

/// Why a deferral ended early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeferralError {
    /// The platform cancelled it, e.g. because accuracy changed. Benign.
    Canceled,
    /// Anything else; deferral is not supported right now.
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct DeferralScheduler {
    config: DeferralConfig,
    deferring: bool,
    disabled_for_session: bool,
}

impl DeferralScheduler {
    pub fn new(config: DeferralConfig) -> Self {
        Self {
            config,
            deferring: false,
            disabled_for_session: false,
        }
    }

    pub fn is_deferring(&self) -> bool {
        self.deferring
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled_for_session
    }

    /// Start of an Active session: forget errors from earlier sessions.
    pub fn reset_for_session(&mut self) {
        self.deferring = false;
        self.disabled_for_session = false;
    }

    /// Request deferral unless one is running or errors disabled it.
    /// Returns true if a request was made and accepted.
    pub fn begin_if_appropriate(&mut self, location: &mut dyn LocationServices) -> bool {
        if self.deferring || self.disabled_for_session {
            return false;
        }
        match location.request_deferred_delivery(self.config.timeout()) {
            Ok(()) => {
                debug!("Deferred delivery requested ({}s)", self.config.timeout_secs);
                self.deferring = true;
                true
            }
            Err(e) => {
                warn!("Deferred delivery unavailable for this trip: {}", e);
                self.disabled_for_session = true;
                false
            }
        }
    }

    /// Platform reported the end of a deferral. Re-arms when `still_active`
    /// and the outcome was success or a benign cancellation.
    pub fn on_finished(
        &mut self,
        error: Option<DeferralError>,
        still_active: bool,
        location: &mut dyn LocationServices,
    ) {
        self.deferring = false;
        match error {
            None | Some(DeferralError::Canceled) => {
                if still_active {
                    self.begin_if_appropriate(location);
                }
            }
            Some(DeferralError::Failed(reason)) => {
                info!("Deferred delivery failed ({}), not re-arming this session", reason);
                self.disabled_for_session = true;
            }
        }
    }

    /// Leaving Active: stop any running deferral.
    pub fn end(&mut self, location: &mut dyn LocationServices) {
        if self.deferring {
            location.disallow_deferred_delivery();
        }
        self.deferring = false;
    }

    /// Stop threshold, extended by the deferral timeout while updates are
    /// being held back.
    pub fn max_time_since_moving(&self, base: Duration) -> Duration {
        if self.deferring {
            base + self.config.timeout()
        } else {
            base
        }
    }
}
