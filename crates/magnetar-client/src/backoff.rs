//! Exponential backoff with jitter and a hard retry budget.

use rand::Rng;
use std::time::{Duration, Instant};

/// Doubling backoff, capped at `max`, jittered ±20%, with a `mandatory_stop`
/// budget: once the total elapsed time since the first attempt crosses it,
/// [`Backoff::next`] returns `None` and the caller gives up.
#[derive(Debug)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    mandatory_stop: Duration,
    current: Duration,
    first_attempt: Option<Instant>,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, mandatory_stop: Duration) -> Self {
        Self {
            initial,
            max,
            mandatory_stop,
            current: initial,
            first_attempt: None,
        }
    }

    /// Policy used for engine reconnects: 100ms doubling to 30s, giving up
    /// after the operation budget.
    pub fn for_reconnect(mandatory_stop: Duration) -> Self {
        Self::new(Duration::from_millis(100), Duration::from_secs(30), mandatory_stop)
    }

    /// Next delay to sleep, or `None` when the budget is exhausted.
    pub fn next(&mut self) -> Option<Duration> {
        let started = *self.first_attempt.get_or_insert_with(Instant::now);
        let elapsed = started.elapsed();
        if elapsed >= self.mandatory_stop {
            return None;
        }
        let remaining = self.mandatory_stop - elapsed;

        let jittered = jitter(self.current);
        self.current = (self.current * 2).min(self.max);
        Some(jittered.min(remaining))
    }

    /// Back to the initial delay with a fresh budget (called when a
    /// connection attempt succeeds).
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.first_attempt = None;
    }
}

/// ±20% so simultaneous reconnects don't stampede the broker.
fn jitter(base: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..1.2);
    base.mul_f64(factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delays_double_up_to_max() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_millis(400),
            Duration::from_secs(3600),
        );

        let mut previous = Duration::ZERO;
        for expected_ms in [100u64, 200, 400, 400] {
            let delay = backoff.next().unwrap();
            let expected = Duration::from_millis(expected_ms);
            assert!(delay >= expected.mul_f64(0.8) && delay <= expected.mul_f64(1.2));
            assert!(delay >= previous.mul_f64(0.5), "not collapsing");
            previous = delay;
        }
    }

    #[test]
    fn test_budget_exhaustion() {
        let mut backoff = Backoff::new(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Duration::ZERO,
        );
        assert!(backoff.next().is_none());
    }

    #[test]
    fn test_reset_restores_initial() {
        let mut backoff = Backoff::new(
            Duration::from_millis(100),
            Duration::from_secs(10),
            Duration::from_secs(3600),
        );
        backoff.next();
        backoff.next();
        backoff.reset();
        let delay = backoff.next().unwrap();
        assert!(delay <= Duration::from_millis(120));
    }
}
