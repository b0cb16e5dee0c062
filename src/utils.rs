use chrono::{DateTime, Utc};

/// Wall clock used by the limiter when the caller does not supply a time
pub struct TimeSource {
    _private: (),
}

impl TimeSource {
    pub fn new() -> Self {
        Self { _private: () }
    }

    /// Get the current time as a DateTime<Utc>
    pub fn utc_now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Rate limit windows tracked per rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Window {
    Second,
    Minute,
}

impl Window {
    /// Window length in seconds
    pub fn to_seconds(self) -> u64 {
        match self {
            Window::Second => 1,
            Window::Minute => 60,
        }
    }

    /// Idle buckets expire after two full windows
    pub fn ttl_seconds(self) -> u64 {
        self.to_seconds() * 2
    }

    /// Scope segment used in store keys
    pub fn scope(self) -> &'static str {
        match self {
            Window::Second => "sec",
            Window::Minute => "min",
        }
    }

    /// Check if this is the per-second window
    pub fn is_per_second(self) -> bool {
        matches!(self, Window::Second)
    }
}

/// Convert a timestamp to fractional unix seconds (millisecond precision)
pub fn unix_seconds(time: DateTime<Utc>) -> f64 {
    time.timestamp_millis() as f64 / 1000.0
}

/// Generate the store key for a bucket: `<prefix>:<scope>:<identity>:<path>`
pub fn bucket_key(prefix: &str, window: Window, identity: &str, path: &str) -> String {
    let mut key_parts = Vec::with_capacity(4);
    if !prefix.is_empty() {
        key_parts.push(prefix);
    }
    key_parts.push(window.scope());
    key_parts.push(identity);
    key_parts.push(path);

    key_parts.join(":")
}
