use async_trait::async_trait;
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::{
    error::Result,
    token_bucket::{BucketOutcome, BucketRequest, BucketState},
};

/// Shared counter store holding every bucket.
///
/// `take_token` must run the whole token bucket update for one key as an
/// indivisible unit: two concurrent callers on the same key never observe the
/// same pre-update token count.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Refill, try to consume one token and persist the bucket atomically
    async fn take_token(&self, request: &BucketRequest) -> Result<BucketOutcome>;

    /// Health check for the store
    async fn health_check(&self) -> Result<()>;
}

#[derive(Debug, Clone, Copy)]
struct StoredBucket {
    state: BucketState,
    expires_at: f64,
}

/// In-process store for tests and single-instance deployments.
///
/// Expiry is evaluated against the `now` carried by each request, so tests can
/// drive time explicitly.
#[derive(Default)]
pub struct MemoryCounterStore {
    buckets: Mutex<HashMap<String, StoredBucket>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of buckets currently held, expired or not
    pub async fn len(&self) -> usize {
        self.buckets.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.buckets.lock().await.is_empty()
    }

    /// Current persisted state of a bucket, if it has not expired at `now`
    pub async fn bucket(&self, key: &str, now: f64) -> Option<BucketState> {
        let buckets = self.buckets.lock().await;
        buckets
            .get(key)
            .filter(|bucket| bucket.expires_at > now)
            .map(|bucket| bucket.state)
    }

    /// Drop buckets idle past their TTL, returning how many were removed
    pub async fn purge_expired(&self, now: f64) -> usize {
        let mut buckets = self.buckets.lock().await;
        let before = buckets.len();
        buckets.retain(|_, bucket| bucket.expires_at > now);
        before - buckets.len()
    }
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn take_token(&self, request: &BucketRequest) -> Result<BucketOutcome> {
        let mut buckets = self.buckets.lock().await;

        let current = buckets
            .get(&request.key)
            .filter(|bucket| bucket.expires_at > request.now)
            .map(|bucket| bucket.state);

        let (state, outcome) = BucketState::take(current, request);
        buckets.insert(
            request.key.clone(),
            StoredBucket {
                state,
                expires_at: request.now + request.ttl_seconds() as f64,
            },
        );

        Ok(outcome)
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
