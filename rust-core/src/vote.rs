//! Activity voting.
//!
//! A trip's final activity type is chosen by a confidence-weighted vote over
//! every classified sensor window. Each ballot weighs `confidence^1.5`, so a
//! handful of confident windows outvote many hesitant ones. Ballots that are
//! physically inconsistent with the speeds measured alongside them are zeroed
//! or down-weighted before counting.

use std::collections::HashMap;

use log::debug;

use crate::types::{ActivityType, ClassificationResult, SpeedStats};

/// Vote order; earlier entries win ties.
const CANDIDATES: [ActivityType; 7] = [
    ActivityType::Automotive,
    ActivityType::Cycling,
    ActivityType::Walking,
    ActivityType::Running,
    ActivityType::Bus,
    ActivityType::Rail,
    ActivityType::Aviation,
];

/// Multiplier for a pedestrian or cycling ballot faster than the mode allows.
const IMPLAUSIBLE_SPEED_PENALTY: f64 = 0.25;

/// Thresholds the vote consults.
#[derive(Debug, Clone, Copy)]
pub struct VoteRules {
    /// Motorized ballots with an average speed below this are zeroed (m/s).
    pub near_zero_speed: f64,
    /// A trip averaging above this moving speed is a flight (m/s).
    pub aviation_speed: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ActivityVote {
    weights: HashMap<ActivityType, f64>,
    ballots: usize,
}

impl ActivityVote {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ballots(&self) -> usize {
        self.ballots
    }

    pub fn weight_of(&self, activity: ActivityType) -> f64 {
        self.weights.get(&activity).copied().unwrap_or(0.0)
    }

    /// Add one classified window. Unknown and stationary ballots carry no
    /// weight because a trip is by definition neither.
    pub fn cast(&mut self, result: &ClassificationResult, rules: &VoteRules) {
        self.ballots += 1;
        let activity = result.activity_type;
        if matches!(activity, ActivityType::Unknown | ActivityType::Stationary) {
            return;
        }

        let mut weight = result.confidence.max(0.0).powf(1.5);

        if activity.is_motorized() && result.average_speed < rules.near_zero_speed {
            weight = 0.0;
        }
        if let Some(max) = activity.plausible_max_speed() {
            if result.average_moving_speed > max {
                weight *= IMPLAUSIBLE_SPEED_PENALTY;
            }
        }

        *self.weights.entry(activity).or_insert(0.0) += weight;
    }

    /// Highest-weighted activity, or `None` if nothing carried weight.
    pub fn winner(&self) -> Option<(ActivityType, f64)> {
        let mut best: Option<(ActivityType, f64)> = None;
        for activity in CANDIDATES {
            let weight = self.weight_of(activity);
            if weight <= 0.0 {
                continue;
            }
            match best {
                Some((_, best_weight)) if best_weight >= weight => {}
                _ => best = Some((activity, weight)),
            }
        }
        best
    }
}

/// Final activity for a trip.
///
/// Air travel wins outright when the trip's own moving speed is beyond any
/// ground mode; otherwise the vote decides, falling back to `fallback`.
pub fn final_activity_type<'a, I>(
    results: I,
    trip_speeds: SpeedStats,
    fallback: ActivityType,
    rules: &VoteRules,
) -> ActivityType
where
    I: IntoIterator<Item = &'a ClassificationResult>,
{
    if trip_speeds.average_moving_speed > rules.aviation_speed {
        debug!(
            "Average moving speed {:.1} m/s, classifying as aviation",
            trip_speeds.average_moving_speed
        );
        return ActivityType::Aviation;
    }

    let mut vote = ActivityVote::new();
    for result in results {
        vote.cast(result, rules);
    }

    match vote.winner() {
        Some((activity, weight)) => {
            debug!(
                "Vote over {} windows chose {} (weight {:.2})",
                vote.ballots(),
                activity.description(),
                weight
            );
            activity
        }
        None => fallback,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> VoteRules {
        VoteRules {
            near_zero_speed: 0.5,
            aviation_speed: 70.0,
        }
    }

    fn r(activity: ActivityType, confidence: f64, moving: f64) -> ClassificationResult {
        ClassificationResult::new(activity, confidence, moving, moving)
    }

    fn stats(moving: f64) -> SpeedStats {
        SpeedStats {
            average_speed: moving,
            average_moving_speed: moving,
            sample_count: 10,
        }
    }

    #[test]
    fn test_confident_minority_outweighs_hesitant_majority() {
        // 0.95^1.5 * 2 ~= 1.85 vs 0.45^1.5 * 5 ~= 1.51
        let results = vec![
            r(ActivityType::Cycling, 0.95, 5.0),
            r(ActivityType::Cycling, 0.95, 5.0),
            r(ActivityType::Automotive, 0.45, 5.0),
            r(ActivityType::Automotive, 0.45, 5.0),
            r(ActivityType::Automotive, 0.45, 5.0),
            r(ActivityType::Automotive, 0.45, 5.0),
            r(ActivityType::Automotive, 0.45, 5.0),
        ];
        let chosen = final_activity_type(&results, stats(5.0), ActivityType::Unknown, &rules());
        assert_eq!(chosen, ActivityType::Cycling);
    }

    #[test]
    fn test_motorized_ballot_zeroed_at_standstill() {
        let mut vote = ActivityVote::new();
        vote.cast(&r(ActivityType::Automotive, 0.99, 0.1), &rules());
        assert_eq!(vote.weight_of(ActivityType::Automotive), 0.0);
        assert!(vote.winner().is_none());
    }

    #[test]
    fn test_implausible_walking_downweighted() {
        let mut vote = ActivityVote::new();
        vote.cast(&r(ActivityType::Walking, 1.0, 12.0), &rules());
        assert!((vote.weight_of(ActivityType::Walking) - IMPLAUSIBLE_SPEED_PENALTY).abs() < 1e-9);
    }

    #[test]
    fn test_aviation_overrides_vote() {
        let results = vec![r(ActivityType::Automotive, 0.9, 30.0)];
        let chosen = final_activity_type(&results, stats(180.0), ActivityType::Automotive, &rules());
        assert_eq!(chosen, ActivityType::Aviation);
    }

    #[test]
    fn test_fallback_without_weighted_ballots() {
        let results = vec![r(ActivityType::Stationary, 0.9, 0.0)];
        let chosen = final_activity_type(&results, stats(4.0), ActivityType::Cycling, &rules());
        assert_eq!(chosen, ActivityType::Cycling);
    }

    #[test]
    fn test_tie_prefers_earlier_candidate() {
        let results = vec![r(ActivityType::Cycling, 0.8, 5.0), r(ActivityType::Automotive, 0.8, 5.0)];
        let chosen = final_activity_type(&results, stats(5.0), ActivityType::Unknown, &rules());
        assert_eq!(chosen, ActivityType::Automotive);
    }
}
