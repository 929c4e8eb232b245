use std::time::Duration;

use rand::Rng;

/// Current wall clock as epoch milliseconds (the unit of all wire timestamps).
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Floor a timestamp to the start of its period.
///
/// Used for schedule deduplication windows and aggregation buckets.
pub fn floor_period(ts_ms: i64, period_ms: i64) -> i64 {
    if period_ms <= 0 {
        return ts_ms;
    }
    ts_ms - ts_ms.rem_euclid(period_ms)
}

/// Apply a symmetric random jitter of `fraction` (e.g. 0.05 for ±5%) to an interval.
pub fn jitter(interval_ms: i64, fraction: f64) -> i64 {
    if interval_ms <= 0 || fraction <= 0.0 {
        return interval_ms;
    }
    let spread = (interval_ms as f64 * fraction).round() as i64;
    if spread == 0 {
        return interval_ms;
    }
    interval_ms + rand::thread_rng().gen_range(-spread..=spread)
}

/// Exponential backoff state with a hard ceiling.
///
/// `next()` returns the current delay and doubles it for the next call.
#[derive(Debug, Clone)]
pub struct Backoff {
    current: Duration,
    initial: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            current: initial,
            initial,
            max,
        }
    }

    pub fn next(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    pub fn reset(&mut self) {
        self.current = self.initial;
    }

    pub fn current(&self) -> Duration {
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_floor_period_aligns_to_boundary() {
        assert_eq!(floor_period(60_999, 60_000), 0);
        assert_eq!(floor_period(61_000, 60_000), 60_000);
        assert_eq!(floor_period(125_500, 60_000), 120_000);
    }

    #[test]
    fn test_floor_period_is_idempotent() {
        let floored = floor_period(1_712_345_678_901, 3_600_000);
        assert_eq!(floor_period(floored, 3_600_000), floored);
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        for _ in 0..100 {
            let jittered = jitter(60_000, 0.05);
            assert!(
                (57_000..=63_000).contains(&jittered),
                "out of bounds: {jittered}"
            );
        }
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let mut backoff = Backoff::new(Duration::from_millis(250), Duration::from_secs(30));
        assert_eq!(backoff.next(), Duration::from_millis(250));
        assert_eq!(backoff.next(), Duration::from_millis(500));
        assert_eq!(backoff.next(), Duration::from_millis(1000));
        for _ in 0..10 {
            backoff.next();
        }
        assert_eq!(backoff.next(), Duration::from_secs(30));
        backoff.reset();
        assert_eq!(backoff.next(), Duration::from_millis(250));
    }
}
