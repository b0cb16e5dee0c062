use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use tracing::debug;

use crate::{
    config::Rule,
    error::{RateLimitError, Result},
    limiter::Verdict,
    metrics::Metrics,
    token_bucket::{BucketOutcome, BucketRequest, TokenBucket},
    utils::{bucket_key, unix_seconds, Window},
};

/// Applies a rule's per-second and per-minute buckets to one request.
///
/// The second window is checked first and a denial there returns without
/// touching the minute bucket. When both windows admit, the reported
/// remaining/reset figures come from the second window.
#[derive(Clone)]
pub struct DualWindowEnforcer {
    bucket: TokenBucket,
    key_prefix: String,
    metrics: Option<Arc<Metrics>>,
}

impl DualWindowEnforcer {
    pub fn new(bucket: TokenBucket, key_prefix: impl Into<String>) -> Self {
        Self {
            bucket,
            key_prefix: key_prefix.into(),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn bucket(&self) -> &TokenBucket {
        &self.bucket
    }

    pub async fn enforce(
        &self,
        rule: &Rule,
        identity: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        let mut reported: Option<Verdict> = None;

        for window in [Window::Second, Window::Minute] {
            let Some(limit) = rule.limit_for(window) else {
                continue;
            };

            let outcome = self.check_window(rule, window, limit, identity, path, now).await?;
            let verdict = Verdict::limited(outcome, window, now);

            if !outcome.allowed {
                debug!(
                    identity,
                    path,
                    pattern = %rule.pattern,
                    window = window.scope(),
                    "request denied"
                );
                return Ok(verdict);
            }

            if reported.is_none() {
                reported = Some(verdict);
            }
        }

        reported.ok_or_else(|| {
            RateLimitError::InvalidConfiguration(format!(
                "rule '{}' has no rate limit window configured",
                rule.pattern
            ))
        })
    }

    async fn check_window(
        &self,
        rule: &Rule,
        window: Window,
        limit: u32,
        identity: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> Result<BucketOutcome> {
        let request = BucketRequest {
            key: bucket_key(&self.key_prefix, window, identity, path),
            window,
            rate: limit,
            burst: rule.burst_size(limit),
            now: unix_seconds(now),
        };

        let timer = std::time::Instant::now();
        let result = self.bucket.check(&request).await;

        if let Some(metrics) = &self.metrics {
            let status = match &result {
                Ok(_) => "success",
                Err(e) if e.is_store_failure() => "unavailable",
                Err(_) => "error",
            };
            metrics.record_store_operation(window.scope(), status);
            metrics.record_store_operation_duration(window.scope(), timer.elapsed().as_secs_f64());
        }

        result
    }
}

/// Absolute reset time for an outcome observed at `now`, saturating at the
/// latest representable instant
pub(crate) fn reset_at(now: DateTime<Utc>, reset_after_secs: u64) -> DateTime<Utc> {
    i64::try_from(reset_after_secs)
        .ok()
        .and_then(ChronoDuration::try_seconds)
        .and_then(|delta| now.checked_add_signed(delta))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
