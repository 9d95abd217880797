//! Reconnect backoff.

use std::time::Duration;

use super::FailureKind;

/// Default delay ladder, in seconds.
pub const DEFAULT_LADDER: [u64; 5] = [1, 5, 10, 30, 60];

/// Per-worker backoff state over a fixed ascending ladder.
///
/// Each failure advances one rung (saturating at the top); a success resets
/// to the first rung. The failure kind scales the rung value, and the result
/// is clamped to `[floor, ladder max]` and never drops below the previous
/// delay of the same failure streak.
#[derive(Debug, Clone)]
pub struct RetryState {
    ladder: Vec<Duration>,
    floor: Duration,
    consecutive_failures: u32,
    last_delay: Option<Duration>,
}

impl RetryState {
    /// `ladder` must be non-empty; settings validation guarantees it.
    pub fn new(ladder: Vec<Duration>, floor: Duration) -> Self {
        let ladder = if ladder.is_empty() {
            DEFAULT_LADDER.iter().map(|s| Duration::from_secs(*s)).collect()
        } else {
            ladder
        };
        Self {
            ladder,
            floor,
            consecutive_failures: 0,
            last_delay: None,
        }
    }

    /// The delay the next failure of `kind` would produce.
    pub fn next_delay(&self, kind: FailureKind) -> Duration {
        let max = self.ladder.iter().copied().max().unwrap_or(self.floor);
        let index = (self.consecutive_failures as usize).min(self.ladder.len() - 1);
        let scaled = self.ladder[index].mul_f64(kind_factor(kind));

        let mut delay = scaled.clamp(self.floor.min(max), max);
        if let Some(last) = self.last_delay {
            delay = delay.max(last);
        }
        delay
    }

    /// Record a failure and return how long to wait before the next attempt.
    pub fn on_failure(&mut self, kind: FailureKind) -> Duration {
        let delay = self.next_delay(kind);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_delay = Some(delay);
        delay
    }

    pub fn on_success(&mut self) {
        self.consecutive_failures = 0;
        self.last_delay = None;
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }
}

/// Multiplier applied to the ladder rung for each failure kind.
fn kind_factor(kind: FailureKind) -> f64 {
    match kind {
        FailureKind::InvalidAddress => 0.2,
        FailureKind::Unauthorized => 2.0,
        FailureKind::Timeout
        | FailureKind::Refused
        | FailureKind::ProtocolError
        | FailureKind::Unknown => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_state() -> RetryState {
        RetryState::new(
            DEFAULT_LADDER.iter().map(|s| Duration::from_secs(*s)).collect(),
            Duration::from_millis(500),
        )
    }

    #[test]
    fn test_timeouts_walk_ladder_then_reset() {
        let mut retry = default_state();
        assert_eq!(retry.on_failure(FailureKind::Timeout), Duration::from_secs(1));
        assert_eq!(retry.on_failure(FailureKind::Timeout), Duration::from_secs(5));
        assert_eq!(retry.on_failure(FailureKind::Timeout), Duration::from_secs(10));

        retry.on_success();
        assert_eq!(retry.consecutive_failures(), 0);
        assert_eq!(retry.on_failure(FailureKind::Timeout), Duration::from_secs(1));

        // Resetting twice is the same as resetting once
        retry.on_success();
        retry.on_success();
        assert_eq!(retry.next_delay(FailureKind::Timeout), Duration::from_secs(1));
    }

    #[test]
    fn test_saturates_at_top() {
        let mut retry = default_state();
        let delays: Vec<_> = (0..8).map(|_| retry.on_failure(FailureKind::Refused)).collect();
        assert_eq!(delays[4], Duration::from_secs(60));
        assert!(delays[5..].iter().all(|d| *d == Duration::from_secs(60)));
    }

    #[test]
    fn test_invalid_address_retries_fast_but_above_floor() {
        let mut retry = default_state();
        assert_eq!(retry.on_failure(FailureKind::InvalidAddress), Duration::from_millis(500));
        assert_eq!(retry.on_failure(FailureKind::InvalidAddress), Duration::from_secs(1));
        assert_eq!(retry.on_failure(FailureKind::InvalidAddress), Duration::from_secs(2));
    }

    #[test]
    fn test_unauthorized_never_exceeds_max() {
        let mut retry = default_state();
        for _ in 0..10 {
            assert!(retry.on_failure(FailureKind::Unauthorized) <= Duration::from_secs(60));
        }
    }

    #[test]
    fn test_mixed_kinds_never_decrease() {
        let mut retry = default_state();
        let kinds = [
            FailureKind::Unauthorized,
            FailureKind::InvalidAddress,
            FailureKind::Timeout,
            FailureKind::InvalidAddress,
            FailureKind::Unknown,
            FailureKind::InvalidAddress,
        ];
        let mut previous = Duration::ZERO;
        for kind in kinds {
            let delay = retry.on_failure(kind);
            assert!(delay >= previous, "{:?} dropped below {:?}", delay, previous);
            assert!(delay >= Duration::from_millis(500));
            previous = delay;
        }
    }
}
