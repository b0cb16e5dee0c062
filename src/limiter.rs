use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::{
    config::{FailurePolicy, LimiterSettings, PolicySet, Rule},
    enforcer::{reset_at, DualWindowEnforcer},
    error::{RateLimitError, Result},
    matcher::CompiledPolicy,
    metrics::Metrics,
    store::CounterStore,
    token_bucket::{BucketOutcome, TokenBucket},
    utils::{TimeSource, Window},
};

/// Outcome of one admission check
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verdict {
    pub allowed: bool,
    /// Tokens left, or [`Verdict::UNLIMITED`] when the policy is disabled or
    /// no rule matched. A fail-open admission reports 0, never the sentinel.
    pub remaining: i64,
    /// When the reporting bucket is full again; `None` when unlimited or when
    /// the store could not be consulted and the request was admitted anyway
    pub reset_at: Option<DateTime<Utc>>,
    /// Window whose figures are reported
    pub window: Option<Window>,
    /// Produced by the failure policy instead of the store
    pub degraded: bool,
}

impl Verdict {
    pub const UNLIMITED: i64 = -1;

    /// No rule applies to the request
    pub fn unlimited() -> Self {
        Self {
            allowed: true,
            remaining: Self::UNLIMITED,
            reset_at: None,
            window: None,
            degraded: false,
        }
    }

    pub fn limited(outcome: BucketOutcome, window: Window, now: DateTime<Utc>) -> Self {
        Self {
            allowed: outcome.allowed,
            remaining: outcome.remaining,
            reset_at: Some(reset_at(now, outcome.reset_after_secs)),
            window: Some(window),
            degraded: false,
        }
    }

    pub fn is_unlimited(&self) -> bool {
        self.remaining == Self::UNLIMITED
    }

    /// Seconds from `now` until `reset_at`, rounded up, never negative
    pub fn retry_after_secs(&self, now: DateTime<Utc>) -> u64 {
        self.reset_at
            .map(|reset| {
                let millis = (reset - now).num_milliseconds().max(0) as u64;
                millis.div_ceil(1000)
            })
            .unwrap_or(0)
    }
}

/// Options for constructing a [`RateLimiter`]
#[derive(Debug, Clone)]
pub struct LimiterOptions {
    pub key_prefix: String,
    pub store_timeout: Duration,
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        LimiterSettings::default().into()
    }
}

impl From<LimiterSettings> for LimiterOptions {
    fn from(settings: LimiterSettings) -> Self {
        Self {
            store_timeout: settings.store_timeout(),
            key_prefix: settings.key_prefix,
            failure_policy: settings.failure_policy,
        }
    }
}

/// Rate limiter facade: rule selection, validation, enforcement and the
/// store failure policy.
///
/// Holds no bucket state of its own; share it freely behind an `Arc`.
pub struct RateLimiter {
    policy: RwLock<Arc<CompiledPolicy>>,
    enforcer: DualWindowEnforcer,
    failure_policy: FailurePolicy,
    time_source: TimeSource,
    metrics: Option<Arc<Metrics>>,
}

impl RateLimiter {
    /// Create a new rate limiter over the given store
    pub fn new(store: Arc<dyn CounterStore>, policy: PolicySet, options: LimiterOptions) -> Result<Self> {
        let compiled = CompiledPolicy::compile(policy)?;
        info!(
            "Rate limiter created with {} rules (enabled: {}, failure policy: {:?})",
            compiled.rule_count(),
            compiled.is_enabled(),
            options.failure_policy
        );

        let bucket = TokenBucket::new(store, options.store_timeout);
        Ok(Self {
            policy: RwLock::new(Arc::new(compiled)),
            enforcer: DualWindowEnforcer::new(bucket, options.key_prefix),
            failure_policy: options.failure_policy,
            time_source: TimeSource::new(),
            metrics: None,
        })
    }

    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.enforcer = self.enforcer.with_metrics(metrics.clone());
        self.metrics = Some(metrics);
        self
    }

    /// Swap in a new policy; checks already running keep the old one
    pub async fn update_policy(&self, policy: PolicySet) -> Result<()> {
        let compiled = match CompiledPolicy::compile(policy) {
            Ok(compiled) => compiled,
            Err(e) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_policy_load_error();
                }
                return Err(e);
            }
        };

        info!("Rate limit policy updated: {} rules", compiled.rule_count());
        *self.policy.write().await = Arc::new(compiled);
        if let Some(metrics) = &self.metrics {
            metrics.record_policy_load_success();
        }
        Ok(())
    }

    /// Snapshot of the active policy
    pub async fn policy(&self) -> Arc<CompiledPolicy> {
        self.policy.read().await.clone()
    }

    /// Check whether `identity` may call `path` now
    pub async fn allow(&self, identity: &str, path: &str) -> Result<Verdict> {
        self.allow_at(identity, path, self.time_source.utc_now()).await
    }

    /// Check whether `identity` may call `path` at the given time
    pub async fn allow_at(&self, identity: &str, path: &str, now: DateTime<Utc>) -> Result<Verdict> {
        let _timer = self.metrics.as_ref().map(|m| m.start_request_timer());

        let policy = self.policy().await;
        if !policy.is_enabled() {
            return Ok(self.record(Verdict::unlimited()));
        }

        let Some(rule) = policy.find_rule(path) else {
            debug!(identity, path, "no rate limit rule matched");
            return Ok(self.record(Verdict::unlimited()));
        };
        rule.validate()?;

        match self.enforcer.enforce(rule, identity, path, now).await {
            Ok(verdict) => Ok(self.record(verdict)),
            Err(e) if e.is_store_failure() => self.on_store_failure(e, rule_window(rule), identity, path, now),
            Err(e) => Err(e),
        }
    }

    /// Health check for the limiter
    pub async fn health_check(&self) -> Result<()> {
        self.enforcer.bucket().store().health_check().await
    }

    fn on_store_failure(
        &self,
        error: RateLimitError,
        window: Window,
        identity: &str,
        path: &str,
        now: DateTime<Utc>,
    ) -> Result<Verdict> {
        if let Some(metrics) = &self.metrics {
            metrics.record_store_failure(self.failure_policy_label());
        }

        match self.failure_policy {
            FailurePolicy::Open => {
                warn!("Rate limit store failure, admitting request: {}, identity: {}, path: {}", error, identity, path);
                Ok(self.record(Verdict {
                    allowed: true,
                    remaining: 0,
                    reset_at: None,
                    window: Some(window),
                    degraded: true,
                }))
            }
            FailurePolicy::Closed => {
                warn!("Rate limit store failure, rejecting request: {}, identity: {}, path: {}", error, identity, path);
                Ok(self.record(Verdict {
                    allowed: false,
                    remaining: 0,
                    reset_at: Some(reset_at(now, window.to_seconds())),
                    window: Some(window),
                    degraded: true,
                }))
            }
            FailurePolicy::Propagate => Err(error),
        }
    }

    fn failure_policy_label(&self) -> &'static str {
        match self.failure_policy {
            FailurePolicy::Open => "open",
            FailurePolicy::Closed => "closed",
            FailurePolicy::Propagate => "propagate",
        }
    }

    fn record(&self, verdict: Verdict) -> Verdict {
        if let Some(metrics) = &self.metrics {
            let window = verdict.window.map(Window::scope).unwrap_or("none");
            if verdict.is_unlimited() {
                metrics.record_unlimited_request();
            } else if verdict.allowed {
                metrics.record_allowed_request(window);
            } else {
                metrics.record_denied_request(window);
            }
        }
        verdict
    }
}

/// Window a fail-closed denial is reported against
fn rule_window(rule: &Rule) -> Window {
    if rule.limit_per_second > 0 {
        Window::Second
    } else {
        Window::Minute
    }
}
