//! Token-bucket arithmetic.
//!
//! The in-memory store runs this code directly; the Redis store runs a Lua
//! port of [`BucketState::take`] server-side. Both must agree on the rules
//! below.
//!
//! Rounding: tokens are whole numbers and the refill rate is the exact ratio
//! `max_tokens / window_ms`, evaluated in integer arithmetic. A refill adds
//! `floor(elapsed_ms * max_tokens / window_ms)` tokens and advances
//! `last_refill_ms` only by the time those whole tokens account for, so a
//! fractional remainder is carried into the next check. Reaching capacity
//! snaps `last_refill_ms` to now.

use serde::{Deserialize, Serialize};

use crate::config::RateLimitConfig;

/// Parameters of one bucket, derived from [`RateLimitConfig`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketPolicy {
    pub max_tokens: i64,
    pub burst_allowance: i64,
    /// `max_tokens` accrue over this many milliseconds.
    pub window_ms: i64,
    pub penalty_ms: i64,
}

impl BucketPolicy {
    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self {
            max_tokens: config.max_messages_per_second.max(1) as i64,
            burst_allowance: config.burst_allowance as i64,
            window_ms: config.window_size_seconds.max(1) as i64 * 1000,
            penalty_ms: i64::try_from(config.penalty_duration_ms).unwrap_or(i64::MAX),
        }
    }

    /// Upper bound on tokens: `max_tokens + burst_allowance`.
    pub fn capacity(&self) -> i64 {
        self.max_tokens + self.burst_allowance
    }

    /// Lower bound on tokens: `-burst_allowance`.
    pub fn floor(&self) -> i64 {
        -self.burst_allowance
    }

    /// Milliseconds needed to accrue `tokens` whole tokens.
    pub fn millis_for(&self, tokens: i64) -> i64 {
        if tokens <= 0 {
            return 0;
        }
        let ms = (tokens as i128 * self.window_ms as i128 + self.max_tokens as i128 - 1)
            / self.max_tokens as i128;
        ms as i64
    }

    /// Whole tokens accrued over `elapsed_ms`.
    pub fn tokens_for(&self, elapsed_ms: i64) -> i64 {
        if elapsed_ms <= 0 {
            return 0;
        }
        (elapsed_ms as i128 * self.max_tokens as i128 / self.window_ms as i128) as i64
    }

    /// How long an idle bucket key must live before it is indistinguishable
    /// from a fresh (full) one: a refill from the floor to capacity, plus slack.
    pub fn idle_ttl_secs(&self) -> u64 {
        let span = self.capacity() - self.floor();
        let ms = self.millis_for(span) + 60_000;
        (ms as u64).div_ceil(1000)
    }
}

/// Stored bucket state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketState {
    pub tokens: i64,
    pub last_refill_ms: i64,
}

/// Result of one atomic take.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketDecision {
    pub allowed: bool,
    pub tokens: i64,
    /// Set when an active penalty denied the take, or when this take started one.
    pub penalty_until: Option<i64>,
    /// True only when this take pushed the bucket past its floor.
    pub penalized_now: bool,
}

impl BucketState {
    /// A fresh bucket starts full.
    pub fn full(policy: &BucketPolicy, now_ms: i64) -> Self {
        Self {
            tokens: policy.capacity(),
            last_refill_ms: now_ms,
        }
    }

    /// Pull a stored balance back into `[floor, capacity]`. A bucket written
    /// under a larger policy may sit outside the current bounds.
    pub fn clamp(&mut self, policy: &BucketPolicy) {
        self.tokens = self.tokens.clamp(policy.floor(), policy.capacity());
    }

    /// Add whole tokens for the time elapsed since the last refill.
    pub fn refill(&mut self, policy: &BucketPolicy, now_ms: i64) {
        self.clamp(policy);
        let added = policy.tokens_for(now_ms - self.last_refill_ms);
        if added <= 0 {
            return;
        }
        self.tokens = (self.tokens + added).min(policy.capacity());
        if self.tokens >= policy.capacity() {
            self.last_refill_ms = now_ms;
        } else {
            let spent = added as i128 * policy.window_ms as i128 / policy.max_tokens as i128;
            self.last_refill_ms += spent as i64;
        }
    }

    /// Refill, then try to consume one token.
    ///
    /// A denied take records one token of debt. Debt past the floor is clamped
    /// to the floor and reported as `penalized_now`; the caller writes the
    /// penalty record.
    pub fn take(&mut self, policy: &BucketPolicy, now_ms: i64) -> BucketDecision {
        self.refill(policy, now_ms);

        if self.tokens >= 1 {
            self.tokens -= 1;
            return BucketDecision {
                allowed: true,
                tokens: self.tokens,
                penalty_until: None,
                penalized_now: false,
            };
        }

        self.tokens -= 1;
        let mut penalty_until = None;
        let mut penalized_now = false;
        if self.tokens < policy.floor() {
            self.tokens = policy.floor();
            penalty_until = Some(now_ms.saturating_add(policy.penalty_ms));
            penalized_now = true;
        }
        BucketDecision {
            allowed: false,
            tokens: self.tokens,
            penalty_until,
            penalized_now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> BucketPolicy {
        BucketPolicy::from_config(&RateLimitConfig::default())
    }

    #[test]
    fn test_policy_from_defaults() {
        let p = policy();
        assert_eq!(p.max_tokens, 10);
        assert_eq!(p.capacity(), 30);
        assert_eq!(p.floor(), -20);
        // 10 tokens per 60 s window: one token every 6 s
        assert_eq!(p.millis_for(1), 6000);
    }

    #[test]
    fn test_burst_of_25_all_admitted() {
        let p = policy();
        let mut state = BucketState::full(&p, 0);
        let admitted = (0..25).filter(|_| state.take(&p, 0).allowed).count();
        assert_eq!(admitted, 25);
        assert_eq!(state.tokens, 5);
    }

    #[test]
    fn test_capacity_then_denials_then_penalty() {
        let p = policy();
        let mut state = BucketState::full(&p, 0);
        let mut admitted = 0;
        let mut first_penalty = None;
        for i in 0..60 {
            let d = state.take(&p, 0);
            if d.allowed {
                admitted += 1;
            }
            if d.penalized_now && first_penalty.is_none() {
                first_penalty = Some(i);
                assert_eq!(d.penalty_until, Some(5000));
            }
            assert!(state.tokens >= p.floor() && state.tokens <= p.capacity());
        }
        assert_eq!(admitted, 30);
        // 30 admitted, then 20 denials take the bucket to -20, the 21st overflows.
        assert_eq!(first_penalty, Some(50));
    }

    #[test]
    fn test_fractional_refill_carries_over() {
        let p = policy();
        let mut state = BucketState {
            tokens: 0,
            last_refill_ms: 0,
        };
        // 4 s is two thirds of a token: nothing added, clock not advanced.
        state.refill(&p, 4000);
        assert_eq!(state.tokens, 0);
        assert_eq!(state.last_refill_ms, 0);
        // Another 4 s completes one token; 2 s of progress remain banked.
        state.refill(&p, 8000);
        assert_eq!(state.tokens, 1);
        assert_eq!(state.last_refill_ms, 6000);
        state.refill(&p, 12000);
        assert_eq!(state.tokens, 2);
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let p = policy();
        let mut state = BucketState {
            tokens: -20,
            last_refill_ms: 0,
        };
        state.refill(&p, 10_000_000);
        assert_eq!(state.tokens, p.capacity());
        assert_eq!(state.last_refill_ms, 10_000_000);
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let p = policy();
        let mut state = BucketState {
            tokens: 3,
            last_refill_ms: 50_000,
        };
        state.refill(&p, 10_000);
        assert_eq!(state.tokens, 3);
        assert_eq!(state.last_refill_ms, 50_000);
    }

    #[test]
    fn test_shrunk_policy_clamps_stored_balance() {
        let wide = policy();
        let mut state = BucketState::full(&wide, 0);
        assert!(state.take(&wide, 0).allowed);
        assert_eq!(state.tokens, 29);

        let narrow = BucketPolicy::from_config(&RateLimitConfig {
            burst_allowance: 0,
            ..Default::default()
        });
        let admitted = (0..40).filter(|_| state.take(&narrow, 0).allowed).count();
        assert_eq!(admitted, narrow.capacity() as usize);
        assert!(state.tokens >= narrow.floor() && state.tokens <= narrow.capacity());
    }

    #[test]
    fn test_shrunk_policy_lifts_deep_debt_to_floor() {
        let narrow = BucketPolicy::from_config(&RateLimitConfig {
            burst_allowance: 5,
            ..Default::default()
        });
        let mut state = BucketState {
            tokens: -20,
            last_refill_ms: 0,
        };
        state.refill(&narrow, 0);
        assert_eq!(state.tokens, -5);
    }

    #[test]
    fn test_idle_ttl_covers_full_refill() {
        let p = policy();
        // span 50 tokens * 6 s = 300 s, plus 60 s slack
        assert_eq!(p.idle_ttl_secs(), 360);
    }
}
