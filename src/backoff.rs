//! Per-queue-group spawn throttling.
//!
//! When the children serving a queue group die faster than `delay_step`, the
//! governor delays the next spawn by `delay_step ^ failed_count` seconds,
//! clamped to `delay_max`. A child that survives longer than one `delay_step`
//! is considered to have made progress and clears the penalty.

use std::time::{Duration, Instant};

/// Default exponential base and too-young threshold (`DELAY_SPAWN_LIMIT`).
pub const DEFAULT_DELAY_STEP: Duration = Duration::from_secs(10);

/// Default clamp on the computed delay (`DELAY_SPAWN_MAX`).
pub const DEFAULT_DELAY_MAX: Duration = Duration::from_secs(600);

/// Exponential-backoff gate for one queue group.
#[derive(Debug, Clone)]
pub struct BackoffGovernor {
    delay_step: Duration,
    delay_max: Duration,
    failed_count: u32,
    delay_until: Option<Instant>,
}

impl BackoffGovernor {
    pub fn new(delay_step: Duration, delay_max: Duration) -> Self {
        Self {
            delay_step,
            delay_max,
            failed_count: 0,
            delay_until: None,
        }
    }

    /// Whether a new worker may be spawned right now.
    pub fn should_spawn(&self) -> bool {
        match self.delay_until {
            None => true,
            Some(until) => Instant::now() >= until,
        }
    }

    /// Record another too-young batch of deaths and push the gate out.
    ///
    /// The base of the exponential is `delay_step` itself, so the schedule is
    /// coarse (10, 100, 1000, ... seconds for the default step) and relies on
    /// `delay_max` clamping almost immediately.
    pub fn delay_spawns(&mut self) {
        self.failed_count += 1;
        let step = self.delay_step.as_secs_f64();
        let raw = step.powi(self.failed_count as i32);
        let clamped = raw.min(self.delay_max.as_secs_f64());
        self.delay_until = Some(Instant::now() + Duration::from_secs_f64(clamped));
    }

    /// Clear the failure count and the gate.
    pub fn reset(&mut self) {
        self.failed_count = 0;
        self.delay_until = None;
    }

    pub fn failed_count(&self) -> u32 {
        self.failed_count
    }

    pub fn delay_until(&self) -> Option<Instant> {
        self.delay_until
    }

    pub fn delay_step(&self) -> Duration {
        self.delay_step
    }
}

impl Default for BackoffGovernor {
    fn default() -> Self {
        Self::new(DEFAULT_DELAY_STEP, DEFAULT_DELAY_MAX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn remaining(governor: &BackoffGovernor) -> Duration {
        governor
            .delay_until()
            .expect("governor should be delaying")
            .saturating_duration_since(Instant::now())
    }

    #[test]
    fn test_fresh_governor_allows_spawning() {
        let governor = BackoffGovernor::new(Duration::from_secs(2), Duration::from_secs(10));
        assert!(governor.should_spawn());
        assert_eq!(governor.failed_count(), 0);
        assert!(governor.delay_until().is_none());
    }

    #[test]
    fn test_delay_doubles_then_clamps() {
        // step 2s, max 10s: expected schedule 2, 4, 8, 10, 10
        let mut governor = BackoffGovernor::new(Duration::from_secs(2), Duration::from_secs(10));
        let expected = [2.0, 4.0, 8.0, 10.0, 10.0];

        for (i, want) in expected.iter().enumerate() {
            governor.delay_spawns();
            assert_eq!(governor.failed_count() as usize, i + 1);
            let got = remaining(&governor).as_secs_f64();
            assert!(
                (got - want).abs() < 0.5,
                "delay {} was {:.2}s, expected {:.2}s",
                i + 1,
                got,
                want
            );
        }
    }

    #[test]
    fn test_delay_until_is_monotonic() {
        let mut governor = BackoffGovernor::new(Duration::from_secs(10), Duration::from_secs(600));
        let mut previous = None;
        for _ in 0..8 {
            governor.delay_spawns();
            let until = governor.delay_until().unwrap();
            if let Some(prev) = previous {
                assert!(until >= prev, "delay_until moved backwards");
            }
            previous = Some(until);
        }
        // 10^8 seconds is far past the clamp
        assert!(remaining(&governor).as_secs_f64() <= 600.5);
    }

    #[test]
    fn test_should_spawn_blocked_then_released() {
        let mut governor =
            BackoffGovernor::new(Duration::from_millis(5), Duration::from_millis(20));
        governor.delay_spawns();
        assert!(!governor.should_spawn());
        std::thread::sleep(Duration::from_millis(30));
        assert!(governor.should_spawn());
    }

    #[test]
    fn test_reset_clears_state() {
        let mut governor = BackoffGovernor::new(Duration::from_secs(10), Duration::from_secs(600));
        governor.delay_spawns();
        governor.delay_spawns();
        assert_eq!(governor.failed_count(), 2);

        governor.reset();
        assert_eq!(governor.failed_count(), 0);
        assert!(governor.delay_until().is_none());
        assert!(governor.should_spawn());
    }
}
