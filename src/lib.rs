//! Path Rate Limit
//!
//! Distributed per-client, per-path rate limiting backed by Redis.
//! Every instance shares its quota through the store: each admission
//! decision is a single atomic token bucket update executed server side,
//! so any number of stateless processes can enforce the same limits.

pub mod config;
pub mod enforcer;
pub mod error;
pub mod limiter;
pub mod matcher;
pub mod metrics;
pub mod middleware;
pub mod redis;
pub mod store;
pub mod token_bucket;
pub mod utils;

// Re-export main types
pub use config::{FailurePolicy, PolicySet, Rule, Settings};
pub use error::{RateLimitError, Result};
pub use limiter::{RateLimiter, Verdict};
pub use store::{CounterStore, MemoryCounterStore};
