//! Actor clock.
//!
//! Time in the protocol is measured in cycles. Cycle `n` covers
//! `[beginning_of_time + n * cycle_millis, beginning_of_time + (n + 1) * cycle_millis)`.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Maps wall-clock time to cycles and back.
///
/// # Example
///
/// ```
/// use chrono::{Duration, Utc};
/// use leasehold_runtime::actor::ActorClock;
///
/// let start = Utc::now();
/// let clock = ActorClock::new(start, 1_000);
/// assert_eq!(clock.cycle(start + Duration::milliseconds(2_500)), 2);
/// assert_eq!(clock.cycle_start(2), start + Duration::seconds(2));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActorClock {
    beginning_of_time: DateTime<Utc>,
    cycle_millis: u64,
}

impl ActorClock {
    /// A zero cycle length is bumped to one millisecond.
    #[must_use]
    pub fn new(beginning_of_time: DateTime<Utc>, cycle_millis: u64) -> Self {
        Self {
            beginning_of_time,
            cycle_millis: cycle_millis.max(1),
        }
    }

    /// Clock starting now, or at the given Unix millisecond timestamp.
    #[must_use]
    pub fn from_config(beginning_of_time_ms: Option<i64>, cycle_millis: u64) -> Self {
        let start = beginning_of_time_ms
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(Utc::now);
        Self::new(start, cycle_millis)
    }

    #[must_use]
    pub fn beginning_of_time(&self) -> DateTime<Utc> {
        self.beginning_of_time
    }

    #[must_use]
    pub fn cycle_millis(&self) -> u64 {
        self.cycle_millis
    }

    /// Cycle containing `when`. Times before the origin map to cycle 0.
    #[must_use]
    pub fn cycle(&self, when: DateTime<Utc>) -> u64 {
        let elapsed = (when - self.beginning_of_time).num_milliseconds();
        u64::try_from(elapsed).map_or(0, |ms| ms / self.cycle_millis)
    }

    #[must_use]
    pub fn current_cycle(&self) -> u64 {
        self.cycle(Utc::now())
    }

    #[must_use]
    pub fn cycle_start(&self, cycle: u64) -> DateTime<Utc> {
        self.beginning_of_time + self.cycles(cycle)
    }

    /// Last millisecond of `cycle`.
    #[must_use]
    pub fn cycle_end(&self, cycle: u64) -> DateTime<Utc> {
        self.cycle_start(cycle + 1) - Duration::milliseconds(1)
    }

    /// Duration of `count` cycles.
    #[must_use]
    pub fn cycles(&self, count: u64) -> Duration {
        let millis = count.saturating_mul(self.cycle_millis);
        Duration::milliseconds(i64::try_from(millis).unwrap_or(i64::MAX / 2))
    }

    #[must_use]
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.cycle_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn cycle_boundaries() {
        let clock = ActorClock::new(origin(), 100);
        assert_eq!(clock.cycle(origin()), 0);
        assert_eq!(clock.cycle(origin() + Duration::milliseconds(99)), 0);
        assert_eq!(clock.cycle(origin() + Duration::milliseconds(100)), 1);
        assert_eq!(clock.cycle_end(0), origin() + Duration::milliseconds(99));
    }

    #[test]
    fn before_origin_is_cycle_zero() {
        let clock = ActorClock::new(origin(), 100);
        assert_eq!(clock.cycle(origin() - Duration::seconds(5)), 0);
    }

    #[test]
    fn zero_length_cycle_is_clamped() {
        let clock = ActorClock::new(origin(), 0);
        assert_eq!(clock.cycle_millis(), 1);
    }

    #[test]
    fn from_config_uses_timestamp() {
        let ms = origin().timestamp_millis();
        let clock = ActorClock::from_config(Some(ms), 250);
        assert_eq!(clock.beginning_of_time(), origin());
        assert_eq!(clock.cycles(4), Duration::seconds(1));
    }
}
