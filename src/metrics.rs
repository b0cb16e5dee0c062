use prometheus::{Counter, CounterVec, Histogram, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the rate limiter
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Decision metrics
    allowed_requests: CounterVec,
    denied_requests: CounterVec,
    unlimited_requests: Counter,

    // Store metrics
    store_operations: CounterVec,
    store_operation_duration: HistogramVec,
    store_failures: CounterVec,

    // Policy metrics
    policy_load_success: Counter,
    policy_load_error: Counter,
    request_duration: Histogram,
}

impl Metrics {
    /// Create a new metrics instance
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let allowed_requests = CounterVec::new(
            Opts::new(
                "ratelimit_allowed_requests",
                "Number of requests admitted by a rate limit rule",
            ),
            &["window"],
        )?;

        let denied_requests = CounterVec::new(
            Opts::new(
                "ratelimit_denied_requests",
                "Number of requests that exceeded rate limits",
            ),
            &["window"],
        )?;

        let unlimited_requests = Counter::new(
            "ratelimit_unlimited_requests",
            "Number of requests no rate limit rule applied to",
        )?;

        let store_operations = CounterVec::new(
            Opts::new(
                "ratelimit_store_operations",
                "Number of token bucket store operations by window and result",
            ),
            &["window", "result"],
        )?;

        let store_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "ratelimit_store_operation_duration_seconds",
                "Duration of token bucket store operations in seconds",
            ),
            &["window"],
        )?;

        let store_failures = CounterVec::new(
            Opts::new(
                "ratelimit_store_failures",
                "Store failures handled by the failure policy",
            ),
            &["policy"],
        )?;

        let policy_load_success = Counter::new(
            "ratelimit_policy_load_success",
            "Number of successful policy loads",
        )?;

        let policy_load_error = Counter::new(
            "ratelimit_policy_load_error",
            "Number of rejected policy loads",
        )?;

        let request_duration = Histogram::with_opts(HistogramOpts::new(
            "ratelimit_request_duration_seconds",
            "Duration of rate limit checks in seconds",
        ))?;

        registry.register(Box::new(allowed_requests.clone()))?;
        registry.register(Box::new(denied_requests.clone()))?;
        registry.register(Box::new(unlimited_requests.clone()))?;
        registry.register(Box::new(store_operations.clone()))?;
        registry.register(Box::new(store_operation_duration.clone()))?;
        registry.register(Box::new(store_failures.clone()))?;
        registry.register(Box::new(policy_load_success.clone()))?;
        registry.register(Box::new(policy_load_error.clone()))?;
        registry.register(Box::new(request_duration.clone()))?;

        Ok(Self {
            registry,
            allowed_requests,
            denied_requests,
            unlimited_requests,
            store_operations,
            store_operation_duration,
            store_failures,
            policy_load_success,
            policy_load_error,
            request_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_allowed_request(&self, window: &str) {
        self.allowed_requests.with_label_values(&[window]).inc();
    }

    pub fn record_denied_request(&self, window: &str) {
        self.denied_requests.with_label_values(&[window]).inc();
    }

    pub fn record_unlimited_request(&self) {
        self.unlimited_requests.inc();
    }

    /// Record a store operation
    pub fn record_store_operation(&self, window: &str, result: &str) {
        self.store_operations.with_label_values(&[window, result]).inc();
    }

    /// Record store operation duration
    pub fn record_store_operation_duration(&self, window: &str, duration_seconds: f64) {
        self.store_operation_duration
            .with_label_values(&[window])
            .observe(duration_seconds);
    }

    pub fn record_store_failure(&self, policy: &str) {
        self.store_failures.with_label_values(&[policy]).inc();
    }

    pub fn record_policy_load_success(&self) {
        self.policy_load_success.inc();
    }

    pub fn record_policy_load_error(&self) {
        self.policy_load_error.inc();
    }

    /// Create a timer for measuring request duration
    pub fn start_request_timer(&self) -> prometheus::HistogramTimer {
        self.request_duration.start_timer()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}
