//! Monitoring decision table.
//!
//! While the engine is considering a trip, every classification result is
//! reduced to one of three decisions: promote to an active trip, demote back
//! to idle, or keep watching. The table is a pure function of the result and
//! the thresholds, keyed by activity, confidence band, and speed.
//!
//! # Table
//! | activity            | confidence | moving speed      | decision |
//! |---------------------|------------|-------------------|----------|
//! | automotive          | high       | >= motorized min  | promote  |
//! | cycling             | high       | >= cycling min    | promote  |
//! | cycling             | low        | in [2.5, 9)       | promote  |
//! | walking, stationary | high       | average near zero | demote   |
//! | anything else       |            |                   | continue |

use crate::config::MonitoringConfig;
use crate::types::{ActivityType, ClassificationResult};

/// Outcome of one classification while monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringDecision {
    /// Start (or resume) a trip of this type.
    Promote(ActivityType),
    /// Not going anywhere; discard the prototrip and return to idle.
    Demote,
    /// Ambiguous; wait for the next result.
    Continue,
}

impl MonitoringDecision {
    pub fn description(&self) -> &'static str {
        match self {
            MonitoringDecision::Promote(_) => "Movement confirmed, starting trip",
            MonitoringDecision::Demote => "No movement, returning to idle",
            MonitoringDecision::Continue => "Ambiguous, still monitoring",
        }
    }

    /// Returns true if this decision leaves the monitoring state.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, MonitoringDecision::Continue)
    }
}

/// Which confidence threshold a result clears.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfidenceBand {
    Insufficient,
    Low,
    High,
}

impl ConfidenceBand {
    pub fn of(confidence: f64, config: &MonitoringConfig) -> Self {
        if confidence > config.high_confidence {
            ConfidenceBand::High
        } else if confidence > config.low_confidence {
            ConfidenceBand::Low
        } else {
            ConfidenceBand::Insufficient
        }
    }
}

/// Apply the decision table to a result whose speeds are already final.
pub fn decide(result: &ClassificationResult, config: &MonitoringConfig) -> MonitoringDecision {
    let band = ConfidenceBand::of(result.confidence, config);
    let moving = result.average_moving_speed;
    let activity = result.activity_type;

    let promotes_as_vehicle = activity == ActivityType::Automotive
        || (config.promote_all_motorized && activity.is_motorized());

    if promotes_as_vehicle {
        if band == ConfidenceBand::High && moving >= config.motorized_min_moving_speed {
            return MonitoringDecision::Promote(activity);
        }
        return MonitoringDecision::Continue;
    }

    match (activity, band) {
        (ActivityType::Cycling, ConfidenceBand::High) if moving >= config.cycling_min_moving_speed => {
            MonitoringDecision::Promote(ActivityType::Cycling)
        }
        (ActivityType::Cycling, ConfidenceBand::High | ConfidenceBand::Low)
            if moving >= config.low_confidence_cycling_min_speed
                && moving < config.low_confidence_cycling_max_speed =>
        {
            MonitoringDecision::Promote(ActivityType::Cycling)
        }
        (ActivityType::Walking | ActivityType::Stationary, ConfidenceBand::High)
            if result.average_speed < config.near_zero_speed =>
        {
            MonitoringDecision::Demote
        }
        _ => MonitoringDecision::Continue,
    }
}
