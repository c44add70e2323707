//! Sliding-window rate limiter.
//!
//! Grounded in the teacher's `VoiceClientConfig`-style plain-struct configs
//! and the broader corpus pattern of a `thiserror`-backed `consume()`
//! returning a `Result` instead of raising.

use std::collections::VecDeque;
use std::time::Instant;

use crate::error::GatewayError;

/// Tracks events over a rolling time window, disabled when `limit == 0` or
/// `window_seconds <= 0.0`.
#[derive(Debug)]
pub struct SlidingWindowRateLimiter {
    limit: u64,
    window_seconds: f64,
    kind: &'static str,
    events: VecDeque<Instant>,
    enabled: bool,
}

impl SlidingWindowRateLimiter {
    pub fn new(kind: &'static str, limit: u64, window_seconds: f64) -> Self {
        let enabled = limit > 0 && window_seconds > 0.0;
        Self {
            limit,
            window_seconds,
            kind,
            events: VecDeque::new(),
            enabled,
        }
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn window_seconds(&self) -> f64 {
        self.window_seconds
    }

    /// Record an event at `now`, failing with `RateLimitExceeded` if the
    /// window is already at capacity. O(1) amortized: expired entries are
    /// pruned lazily from the front of the deque.
    pub fn consume_at(&mut self, now: Instant) -> Result<(), GatewayError> {
        if !self.enabled {
            return Ok(());
        }

        let window = std::time::Duration::from_secs_f64(self.window_seconds);
        // Prune anything at or before `now - window`.
        let cutoff = now.checked_sub(window);
        if let Some(cutoff) = cutoff {
            while matches!(self.events.front(), Some(&t) if t <= cutoff) {
                self.events.pop_front();
            }
        }

        if self.events.len() as u64 >= self.limit {
            let head = *self.events.front().expect("len >= limit > 0 implies non-empty");
            let retry_at = head + window;
            let retry_in = retry_at.saturating_duration_since(now).as_secs_f64().max(0.0);
            return Err(GatewayError::RateLimitExceeded {
                kind: self.kind,
                retry_in,
                limit: self.limit,
                window_seconds: self.window_seconds,
            });
        }

        self.events.push_back(now);
        Ok(())
    }

    pub fn consume(&mut self) -> Result<(), GatewayError> {
        self.consume_at(Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn disabled_when_limit_zero() {
        let mut l = SlidingWindowRateLimiter::new("message", 0, 60.0);
        for _ in 0..1000 {
            assert!(l.consume().is_ok());
        }
    }

    #[test]
    fn disabled_when_window_non_positive() {
        let mut l = SlidingWindowRateLimiter::new("message", 5, 0.0);
        for _ in 0..1000 {
            assert!(l.consume().is_ok());
        }
    }

    #[test]
    fn allows_up_to_limit_then_rejects() {
        let mut l = SlidingWindowRateLimiter::new("message", 5, 1.0);
        let t0 = Instant::now();
        for _ in 0..5 {
            assert!(l.consume_at(t0).is_ok());
        }
        let err = l.consume_at(t0).unwrap_err();
        match err {
            GatewayError::RateLimitExceeded { kind, limit, .. } => {
                assert_eq!(kind, "message");
                assert_eq!(limit, 5);
            }
            _ => panic!("expected RateLimitExceeded"),
        }
    }

    #[test]
    fn admits_again_after_window_elapses() {
        let mut l = SlidingWindowRateLimiter::new("cancel", 2, 1.0);
        let t0 = Instant::now();
        assert!(l.consume_at(t0).is_ok());
        assert!(l.consume_at(t0).is_ok());
        assert!(l.consume_at(t0).is_err());
        let t1 = t0 + Duration::from_millis(1100);
        assert!(l.consume_at(t1).is_ok());
    }

    #[test]
    fn burst_of_six_in_one_second_with_limit_five_rejects_only_sixth() {
        // Mirrors the spec's rate-limit end-to-end scenario.
        let mut l = SlidingWindowRateLimiter::new("message", 5, 1.0);
        let t0 = Instant::now();
        let mut results = Vec::new();
        for _ in 0..6 {
            results.push(l.consume_at(t0).is_ok());
        }
        assert_eq!(results, vec![true, true, true, true, true, false]);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    // However events are spaced out, no window of `window_seconds` ever
    // admits more than `limit` of them.
    proptest! {
        #[test]
        fn never_admits_more_than_limit_per_window(
            limit in 1u64..10,
            offsets_ms in prop::collection::vec(0u64..5_000, 1..200),
        ) {
            let window_seconds = 1.0;
            let mut l = SlidingWindowRateLimiter::new("message", limit, window_seconds);
            let t0 = Instant::now();
            let mut admitted: Vec<Instant> = Vec::new();

            for ms in offsets_ms {
                let now = t0 + Duration::from_millis(ms);
                if l.consume_at(now).is_ok() {
                    admitted.push(now);
                }
            }

            let window = Duration::from_secs_f64(window_seconds);
            for start in &admitted {
                let count = admitted
                    .iter()
                    .filter(|t| **t >= *start && **t < *start + window)
                    .count();
                prop_assert!(count as u64 <= limit);
            }
        }
    }
}
