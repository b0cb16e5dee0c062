//! Continuous-refill token bucket.
//!
//! The read-refill-consume-write sequence lives in two places that must stay
//! in lockstep: [`BucketState::take`] (used by in-process stores) and
//! [`TOKEN_BUCKET_SCRIPT`] (executed atomically by Redis).

use std::{sync::Arc, time::Duration};
use tracing::debug;

use crate::{
    error::{RateLimitError, Result},
    store::CounterStore,
    utils::Window,
};

/// Server-side token bucket.
///
/// KEYS[1] bucket key; ARGV: burst, rate, period seconds, now (unix seconds),
/// ttl seconds. Returns `{allowed, floor(tokens), reset_after_seconds}`.
///
/// `test_redis_script_matches_in_process_bucket` in the integration tests runs
/// this script and [`BucketState::take`] over the same inputs (needs Docker).
pub const TOKEN_BUCKET_SCRIPT: &str = r#"
local key = KEYS[1]
local burst = tonumber(ARGV[1])
local rate = tonumber(ARGV[2])
local period = tonumber(ARGV[3])
local now = tonumber(ARGV[4])
local ttl = tonumber(ARGV[5])

local state = redis.call('HMGET', key, 'tokens', 'last_time')
local tokens = tonumber(state[1])
local last_time = tonumber(state[2])

if tokens == nil or last_time == nil then
  tokens = burst
  last_time = now
end

local elapsed = now - last_time
if elapsed < 0 then
  elapsed = 0
end

tokens = tokens + (elapsed / period) * rate
if tokens > burst then
  tokens = burst
end

local allowed = 0
if tokens >= 1 then
  tokens = tokens - 1
  allowed = 1
end

redis.call('HSET', key, 'tokens', tokens, 'last_time', now)
redis.call('EXPIRE', key, ttl)

local reset_after = 0
if tokens < burst then
  reset_after = math.ceil((burst - tokens) / rate * period)
end

return {allowed, math.floor(tokens), reset_after}
"#;

/// One admission check against a single bucket
#[derive(Debug, Clone, PartialEq)]
pub struct BucketRequest {
    pub key: String,
    pub window: Window,
    pub rate: u32,
    pub burst: u32,
    /// Caller clock, fractional unix seconds
    pub now: f64,
}

impl BucketRequest {
    pub fn period_seconds(&self) -> f64 {
        self.window.to_seconds() as f64
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.window.ttl_seconds()
    }

    /// Seconds to refill an empty bucket, the largest valid reset delay
    pub fn max_reset_after_secs(&self) -> u64 {
        (self.burst as f64 / self.rate as f64 * self.period_seconds()).ceil() as u64
    }
}

/// Result of one admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketOutcome {
    pub allowed: bool,
    /// Tokens left after this check, rounded down
    pub remaining: i64,
    /// Seconds until the bucket is full again
    pub reset_after_secs: u64,
}

/// Persisted bucket fields
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketState {
    pub tokens: f64,
    pub last_time: f64,
}

impl BucketState {
    /// Apply one check to `state` (absent means a new, full bucket) and return
    /// the state to persist along with the outcome.
    pub fn take(state: Option<BucketState>, request: &BucketRequest) -> (BucketState, BucketOutcome) {
        let burst = request.burst as f64;
        let rate = request.rate as f64;
        let period = request.period_seconds();

        let BucketState { tokens, last_time } = state.unwrap_or(BucketState {
            tokens: burst,
            last_time: request.now,
        });

        let elapsed = (request.now - last_time).max(0.0);
        let mut tokens = (tokens + elapsed / period * rate).min(burst);

        let allowed = tokens >= 1.0;
        if allowed {
            tokens -= 1.0;
        }

        let reset_after_secs = if tokens < burst {
            ((burst - tokens) / rate * period).ceil() as u64
        } else {
            0
        };

        let next = BucketState {
            tokens,
            last_time: request.now,
        };
        let outcome = BucketOutcome {
            allowed,
            remaining: tokens.floor() as i64,
            reset_after_secs,
        };
        (next, outcome)
    }
}

/// Runs bucket checks against the shared store, bounded by a timeout
#[derive(Clone)]
pub struct TokenBucket {
    store: Arc<dyn CounterStore>,
    timeout: Duration,
}

impl TokenBucket {
    pub fn new(store: Arc<dyn CounterStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    pub fn store(&self) -> &Arc<dyn CounterStore> {
        &self.store
    }

    /// Perform one atomic admit/reject decision.
    ///
    /// The store applies the whole update or nothing, so abandoning the call on
    /// timeout never leaves a partially written bucket.
    pub async fn check(&self, request: &BucketRequest) -> Result<BucketOutcome> {
        if request.rate == 0 || request.burst == 0 {
            return Err(RateLimitError::InvalidConfiguration(format!(
                "bucket '{}' needs a positive rate and burst",
                request.key
            )));
        }

        let outcome = tokio::time::timeout(self.timeout, self.store.take_token(request))
            .await
            .map_err(|_| RateLimitError::StoreTimeout(self.timeout))??;

        if outcome.remaining < 0 || outcome.remaining > i64::from(request.burst) {
            return Err(RateLimitError::MalformedStoreResponse(format!(
                "remaining {} outside 0..={} for key '{}'",
                outcome.remaining, request.burst, request.key
            )));
        }
        if outcome.reset_after_secs > request.max_reset_after_secs() {
            return Err(RateLimitError::MalformedStoreResponse(format!(
                "reset after {}s exceeds a full refill of {}s for key '{}'",
                outcome.reset_after_secs,
                request.max_reset_after_secs(),
                request.key
            )));
        }

        debug!(
            key = %request.key,
            allowed = outcome.allowed,
            remaining = outcome.remaining,
            reset_after = outcome.reset_after_secs,
            "token bucket checked"
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(rate: u32, burst: u32, window: Window, now: f64) -> BucketRequest {
        BucketRequest {
            key: "ratelimit:sec:client:/api".to_string(),
            window,
            rate,
            burst,
            now,
        }
    }

    #[test]
    fn test_new_bucket_starts_full() {
        let (state, outcome) = BucketState::take(None, &request(2, 2, Window::Second, 100.0));
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 1);
        assert_eq!(outcome.reset_after_secs, 1);
        assert_eq!(state.tokens, 1.0);
        assert_eq!(state.last_time, 100.0);
    }

    #[test]
    fn test_empty_bucket_denies_without_consuming() {
        let empty = BucketState {
            tokens: 0.0,
            last_time: 100.0,
        };
        let (state, outcome) = BucketState::take(Some(empty), &request(2, 2, Window::Second, 100.0));
        assert!(!outcome.allowed);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(outcome.reset_after_secs, 1);
        assert_eq!(state.tokens, 0.0);
    }

    #[test]
    fn test_partial_refill_is_continuous() {
        let empty = BucketState {
            tokens: 0.0,
            last_time: 100.0,
        };
        // Half a second at 2/s refills exactly one token
        let (state, outcome) = BucketState::take(Some(empty), &request(2, 2, Window::Second, 100.5));
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(state.tokens, 0.0);

        // A quarter second later only half a token is back
        let (state, outcome) = BucketState::take(Some(state), &request(2, 2, Window::Second, 100.75));
        assert!(!outcome.allowed);
        assert_eq!(state.tokens, 0.5);
        // (2 - 0.5) / 2 * 1 = 0.75 -> 1
        assert_eq!(outcome.reset_after_secs, 1);
    }

    #[test]
    fn test_long_idle_is_clamped_to_burst() {
        let stale = BucketState {
            tokens: 0.0,
            last_time: 0.0,
        };
        let (state, outcome) = BucketState::take(Some(stale), &request(4, 3, Window::Minute, 86_400.0));
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 2);
        assert_eq!(state.tokens, 2.0);
        // (3 - 2) / 4 * 60 = 15
        assert_eq!(outcome.reset_after_secs, 15);
    }

    #[test]
    fn test_clock_behind_last_refill_does_not_drain() {
        let state = BucketState {
            tokens: 1.5,
            last_time: 200.0,
        };
        let (next, outcome) = BucketState::take(Some(state), &request(2, 4, Window::Second, 199.0));
        assert!(outcome.allowed);
        assert_eq!(next.tokens, 0.5);
        assert_eq!(outcome.remaining, 0);
    }

    #[test]
    fn test_reset_after_counts_missing_tokens() {
        let full = BucketState {
            tokens: 10.0,
            last_time: 0.0,
        };
        // Overfull state is clamped before consuming
        let (_, outcome) = BucketState::take(Some(full), &request(1, 1, Window::Second, 10.0));
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 0);
        assert_eq!(outcome.reset_after_secs, 1);

        let nearly = BucketState {
            tokens: 4.0,
            last_time: 0.0,
        };
        let (state, outcome) = BucketState::take(Some(nearly), &request(1, 3, Window::Second, 10.0));
        assert_eq!(state.tokens, 2.0);
        assert_eq!(outcome.reset_after_secs, 1);
    }

    #[test]
    fn test_script_contract_arguments() {
        assert!(TOKEN_BUCKET_SCRIPT.contains("KEYS[1]"));
        assert!(TOKEN_BUCKET_SCRIPT.contains("ARGV[5]"));
        assert!(TOKEN_BUCKET_SCRIPT.contains("'tokens'"));
        assert!(TOKEN_BUCKET_SCRIPT.contains("'last_time'"));

        let req = request(10, 20, Window::Minute, 0.0);
        assert_eq!(req.period_seconds(), 60.0);
        assert_eq!(req.ttl_seconds(), 120);
    }

    #[test]
    fn test_reset_after_never_exceeds_full_refill() {
        let req = request(3, 3, Window::Minute, 0.0);
        assert_eq!(req.max_reset_after_secs(), 60);
        assert_eq!(request(4, 8, Window::Second, 0.0).max_reset_after_secs(), 2);

        let mut state = None;
        for step in 0..10 {
            let req = request(3, 3, Window::Minute, step as f64 * 0.5);
            let (next, outcome) = BucketState::take(state, &req);
            assert!(outcome.reset_after_secs <= req.max_reset_after_secs());
            assert!(outcome.remaining <= i64::from(req.burst));
            state = Some(next);
        }
    }
}
