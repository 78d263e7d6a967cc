//! Classification query plumbing.
//!
//! Queries are the engine's only suspension point. Each one is stamped with
//! the [`Generation`] that was current when it was issued; the generation
//! advances on every state transition, so a completion that outlives the
//! Prototrip or Trip that asked for it can be recognised and dropped.
//!
//! [`Stamped`] keeps its payload private. The only way to read it is
//! [`Stamped::apply_if_current`], which makes stale delivery unrepresentable
//! as a silent mutation.

use std::collections::VecDeque;

use chrono::{DateTime, Duration, Utc};
use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::config::QueryConfig;
use crate::types::{ClassificationResult, LocationSample, MotionReading};

/// Epoch counter that advances on every state transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Generation(u64);

impl Generation {
    pub fn advance(&mut self) -> Generation {
        self.0 = self.0.wrapping_add(1);
        *self
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Identifies one query within one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryToken {
    pub generation: Generation,
    pub query_id: u64,
}

/// A value tagged with the token of the query that produced it.
#[derive(Debug, Clone)]
pub struct Stamped<T> {
    token: QueryToken,
    value: T,
}

impl<T> Stamped<T> {
    pub fn new(token: QueryToken, value: T) -> Self {
        Self { token, value }
    }

    pub fn token(&self) -> QueryToken {
        self.token
    }

    pub fn is_current(&self, current: Generation) -> bool {
        self.token.generation == current
    }

    /// Run `f` on the payload only if it was produced in `current`.
    /// Stale payloads are dropped and `None` returned.
    pub fn apply_if_current<R>(self, current: Generation, f: impl FnOnce(QueryToken, T) -> R) -> Option<R> {
        if self.is_current(current) {
            Some(f(self.token, self.value))
        } else {
            debug!(
                "Dropping stale completion for query {} (generation {} != {})",
                self.token.query_id,
                self.token.generation.value(),
                current.value()
            );
            None
        }
    }
}

/// What a classifier reports: a result or a failure message.
pub type ClassificationOutcome = std::result::Result<ClassificationResult, String>;

/// Bounded time window of raw motion readings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub readings: Vec<MotionReading>,
}

impl SensorWindow {
    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Everything the classifier is given for one query.
#[derive(Debug, Clone)]
pub struct ClassificationQuery {
    pub token: QueryToken,
    pub window: SensorWindow,
    /// Recent non-stale location samples, for speed-aware classifiers.
    pub samples: Vec<LocationSample>,
}

/// Ring buffer of motion readings awaiting windowing.
#[derive(Debug, Clone)]
pub struct MotionBuffer {
    readings: VecDeque<MotionReading>,
    capacity: usize,
}

impl MotionBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            readings: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    pub fn extend(&mut self, readings: impl IntoIterator<Item = MotionReading>) {
        for reading in readings {
            if self.readings.len() == self.capacity {
                self.readings.pop_front();
            }
            self.readings.push_back(reading);
        }
    }

    /// Readings in `[end - length, end]`, sorted by timestamp.
    pub fn window(&self, end: DateTime<Utc>, length: Duration) -> SensorWindow {
        let start = end - length;
        let mut readings: Vec<MotionReading> = self
            .readings
            .iter()
            .filter(|r| r.timestamp >= start && r.timestamp <= end)
            .copied()
            .collect();
        readings.sort_by_key(|r| r.timestamp);
        SensorWindow { start, end, readings }
    }

    pub fn clear(&mut self) {
        self.readings.clear();
    }
}

/// Decides when the next query is due.
///
/// Tiers come from [`QueryConfig::interval_after`]. Only one query is in
/// flight at a time; one that goes unanswered past the bail-out is abandoned
/// so a fresh one can be issued.
#[derive(Debug, Clone)]
pub struct QueryScheduler {
    config: QueryConfig,
    issued: u32,
    last_issued_at: Option<DateTime<Utc>>,
    in_flight: Option<(QueryToken, DateTime<Utc>)>,
    next_query_id: u64,
}

impl QueryScheduler {
    pub fn new(config: QueryConfig) -> Self {
        Self {
            config,
            issued: 0,
            last_issued_at: None,
            in_flight: None,
            next_query_id: 0,
        }
    }

    /// Start a fresh tier sequence. Query ids keep counting.
    pub fn reset(&mut self) {
        self.issued = 0;
        self.last_issued_at = None;
        self.in_flight = None;
    }

    pub fn issued(&self) -> u32 {
        self.issued
    }

    pub fn in_flight(&self) -> Option<QueryToken> {
        self.in_flight.map(|(token, _)| token)
    }

    /// Returns a token if a query should be issued at `now`.
    pub fn poll(&mut self, now: DateTime<Utc>, generation: Generation) -> Option<QueryToken> {
        if let Some((token, issued_at)) = self.in_flight {
            if now - issued_at < self.config.bail_out() {
                return None;
            }
            warn!(
                "Classification query {} unanswered after {}s, abandoning",
                token.query_id,
                (now - issued_at).num_seconds()
            );
            self.in_flight = None;
        }

        if let Some(last) = self.last_issued_at {
            let wait = self.config.interval_after(self.issued.saturating_sub(1));
            if now - last < wait {
                return None;
            }
        }

        let token = QueryToken {
            generation,
            query_id: self.next_query_id,
        };
        self.next_query_id += 1;
        self.issued += 1;
        self.last_issued_at = Some(now);
        self.in_flight = Some((token, now));
        Some(token)
    }

    /// The issue attempt failed; forget the in-flight marker so the next
    /// poll after the interval retries.
    pub fn issue_failed(&mut self, token: QueryToken) {
        if self.in_flight() == Some(token) {
            self.in_flight = None;
        }
    }

    /// Returns true if `token` was the query in flight.
    pub fn complete(&mut self, token: QueryToken) -> bool {
        if self.in_flight() == Some(token) {
            self.in_flight = None;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ActivityType;
    use chrono::TimeZone;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 8, 0, 0).unwrap()
    }

    #[test]
    fn test_generation_advances() {
        let mut g = Generation::default();
        let first = g;
        assert_ne!(g.advance(), first);
        assert_eq!(g.value(), 1);
    }

    #[test]
    fn test_stamped_applies_only_when_current() {
        let mut current = Generation::default();
        let token = QueryToken {
            generation: current,
            query_id: 7,
        };
        let result = ClassificationResult::new(ActivityType::Walking, 0.9, 1.0, 1.2);

        let fresh = Stamped::new(token, result);
        assert_eq!(fresh.apply_if_current(current, |_, r| r.activity_type), Some(ActivityType::Walking));

        current.advance();
        let stale = Stamped::new(token, result);
        let mut touched = false;
        assert!(stale.apply_if_current(current, |_, _| touched = true).is_none());
        assert!(!touched);
    }

    #[test]
    fn test_first_query_is_immediate() {
        let mut scheduler = QueryScheduler::new(QueryConfig::default());
        assert!(scheduler.poll(t0(), Generation::default()).is_some());
    }

    #[test]
    fn test_tiers_after_completion() {
        let config = QueryConfig::default();
        let mut scheduler = QueryScheduler::new(config.clone());
        let g = Generation::default();
        let mut now = t0();

        for _ in 0..config.fast_query_count {
            let token = scheduler.poll(now, g).expect("fast tier due");
            assert!(scheduler.complete(token));
            assert!(scheduler.poll(now + Duration::seconds(9), g).is_none());
            now += Duration::seconds(10);
        }

        // Last fast query was followed by a 10s wait, then the medium tier starts
        let token = scheduler.poll(now, g).expect("medium tier due");
        scheduler.complete(token);
        assert!(scheduler.poll(now + Duration::seconds(59), g).is_none());
        assert!(scheduler.poll(now + Duration::seconds(60), g).is_some());
    }

    #[test]
    fn test_bail_out_reissues() {
        let mut scheduler = QueryScheduler::new(QueryConfig::default());
        let g = Generation::default();
        let first = scheduler.poll(t0(), g).unwrap();

        assert!(scheduler.poll(t0() + Duration::seconds(20), g).is_none());
        let second = scheduler.poll(t0() + Duration::seconds(30), g).unwrap();
        assert_ne!(first.query_id, second.query_id);
        assert!(!scheduler.complete(first));
        assert!(scheduler.complete(second));
    }

    #[test]
    fn test_reset_keeps_ids_unique() {
        let mut scheduler = QueryScheduler::new(QueryConfig::default());
        let mut g = Generation::default();
        let first = scheduler.poll(t0(), g).unwrap();
        scheduler.reset();
        g.advance();
        let second = scheduler.poll(t0(), g).unwrap();
        assert_ne!(first, second);
        assert_eq!(scheduler.issued(), 1);
    }

    #[test]
    fn test_motion_buffer_window_and_capacity() {
        let mut buffer = MotionBuffer::new(5);
        buffer.extend((0..8).map(|i| MotionReading::new(t0() + Duration::seconds(i), [0.0, 0.0, 9.8], [0.0; 3])));
        assert_eq!(buffer.len(), 5);

        let window = buffer.window(t0() + Duration::seconds(7), Duration::seconds(2));
        assert_eq!(window.readings.len(), 3);
        assert_eq!(window.duration(), Duration::seconds(2));
    }
}
