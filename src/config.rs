use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::Path, time::Duration};
use tracing::info;

use crate::{
    error::{RateLimitError, Result},
    redis::RedisConfig,
    utils::Window,
};

/// Quota policy for the paths matching `pattern`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rule {
    /// Exact path, or a pattern containing `*` wildcards
    #[serde(alias = "path")]
    pub pattern: String,
    /// Requests per second, 0 disables the window
    #[serde(default)]
    pub limit_per_second: u32,
    /// Requests per minute, 0 disables the window
    #[serde(default)]
    pub limit_per_minute: u32,
    /// Bucket capacity; 0 means twice the window's limit
    #[serde(default)]
    pub burst_size: u32,
}

impl Rule {
    pub fn new(pattern: impl Into<String>, limit_per_second: u32, limit_per_minute: u32) -> Self {
        Self {
            pattern: pattern.into(),
            limit_per_second,
            limit_per_minute,
            burst_size: 0,
        }
    }

    pub fn with_burst(mut self, burst_size: u32) -> Self {
        self.burst_size = burst_size;
        self
    }

    /// Bucket capacity for a window with the given limit
    pub fn burst_size(&self, limit: u32) -> u32 {
        if self.burst_size > 0 {
            return self.burst_size;
        }
        limit.saturating_mul(2)
    }

    /// Configured limit for a window, `None` when the window is off
    pub fn limit_for(&self, window: Window) -> Option<u32> {
        let limit = match window {
            Window::Second => self.limit_per_second,
            Window::Minute => self.limit_per_minute,
        };
        (limit > 0).then_some(limit)
    }

    pub fn validate(&self) -> Result<()> {
        if self.pattern.is_empty() {
            return Err(RateLimitError::InvalidConfiguration(
                "rule pattern must not be empty".to_string(),
            ));
        }
        if self.limit_per_second == 0 && self.limit_per_minute == 0 {
            return Err(RateLimitError::InvalidConfiguration(format!(
                "rule '{}' must set limit_per_second or limit_per_minute",
                self.pattern
            )));
        }
        Ok(())
    }
}

/// Ordered rule list plus the optional fallback rule
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicySet {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub rules: Vec<Rule>,
    #[serde(default)]
    pub default_rule: Option<Rule>,
}

impl PolicySet {
    pub fn validate(&self) -> Result<()> {
        for rule in &self.rules {
            rule.validate()?;
        }
        if let Some(default_rule) = &self.default_rule {
            default_rule.validate()?;
        }
        Ok(())
    }
}

/// What the limiter answers when the counter store cannot be reached
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailurePolicy {
    /// Admit the request and log the failure
    #[default]
    Open,
    /// Deny the request
    Closed,
    /// Return the store error to the caller
    Propagate,
}

/// Load a policy set from YAML string
pub fn load_policy_from_yaml(yaml: &str) -> Result<PolicySet> {
    let policy: PolicySet = serde_yaml::from_str(yaml).map_err(|e| {
        RateLimitError::Config(format!("Failed to parse YAML: {}", e))
    })?;
    policy.validate()?;
    Ok(policy)
}

/// Load a policy set from YAML file
pub fn load_policy_from_file(path: &str) -> Result<PolicySet> {
    let content = std::fs::read_to_string(path)?;
    load_policy_from_yaml(&content)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Optional dedicated instance for the per-second buckets
    #[serde(default)]
    pub per_second_url: Option<String>,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            per_second_url: None,
            connect_timeout_ms: default_connect_timeout_ms(),
            command_timeout_ms: default_command_timeout_ms(),
        }
    }
}

impl RedisSettings {
    fn client_config(&self, url: &str) -> RedisConfig {
        RedisConfig {
            url: url.to_string(),
            connection_timeout: Some(Duration::from_millis(self.connect_timeout_ms)),
            command_timeout: Some(Duration::from_millis(self.command_timeout_ms)),
        }
    }

    pub fn primary(&self) -> RedisConfig {
        self.client_config(&self.url)
    }

    pub fn per_second(&self) -> Option<RedisConfig> {
        self.per_second_url.as_deref().map(|url| self.client_config(url))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterSettings {
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
}

impl Default for LimiterSettings {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            store_timeout_ms: default_store_timeout_ms(),
            failure_policy: FailurePolicy::default(),
        }
    }
}

impl LimiterSettings {
    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpSettings {
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,
}

impl Default for HttpSettings {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
        }
    }
}

/// Process configuration: store, limiter behaviour, HTTP listener and policy
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub redis: RedisSettings,
    #[serde(default)]
    pub limiter: LimiterSettings,
    #[serde(default)]
    pub http: HttpSettings,
    #[serde(default)]
    pub policy: PolicySet,
}

impl Settings {
    /// Load settings from an optional file, then `RATELIMIT__*` environment
    /// overrides (e.g. `RATELIMIT__REDIS__URL`).
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = ::config::Config::builder();
        if let Some(path) = path {
            info!("Loading settings from: {}", path);
            builder = builder.add_source(::config::File::with_name(path));
        }
        let settings: Settings = builder
            .add_source(
                ::config::Environment::with_prefix("RATELIMIT")
                    .prefix_separator("__")
                    .separator("__"),
            )
            .build()?
            .try_deserialize()?;

        settings.policy.validate()?;
        Ok(settings)
    }

    /// Replace marked secret values (Redis URLs) with their decrypted form
    pub fn decrypt_secrets(&mut self, decryptor: &SecretDecryptor) -> Result<()> {
        self.redis.url = decryptor.decrypt_if_marked(&self.redis.url)?;
        if let Some(url) = &self.redis.per_second_url {
            self.redis.per_second_url = Some(decryptor.decrypt_if_marked(url)?);
        }
        Ok(())
    }
}

/// Backend able to turn a ciphertext into its plaintext
pub trait SecretProvider: Send + Sync {
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Resolves `kms://NAME` to the value of the environment variable `NAME`
pub struct EnvSecretProvider;

impl SecretProvider for EnvSecretProvider {
    fn decrypt(&self, ciphertext: &str) -> Result<String> {
        std::env::var(ciphertext).map_err(|_| {
            RateLimitError::Config(format!("secret '{}' is not set in the environment", ciphertext))
        })
    }
}

/// Decrypts configuration values carrying a marker prefix, leaving others as is
pub struct SecretDecryptor {
    prefix: String,
    provider: Box<dyn SecretProvider>,
}

impl SecretDecryptor {
    pub const DEFAULT_PREFIX: &'static str = "kms://";

    pub fn new(provider: Box<dyn SecretProvider>) -> Self {
        Self::with_prefix(Self::DEFAULT_PREFIX, provider)
    }

    pub fn with_prefix(prefix: impl Into<String>, provider: Box<dyn SecretProvider>) -> Self {
        Self {
            prefix: prefix.into(),
            provider,
        }
    }

    pub fn decrypt_if_marked(&self, value: &str) -> Result<String> {
        match value.strip_prefix(self.prefix.as_str()) {
            Some(ciphertext) => self.provider.decrypt(ciphertext),
            None => Ok(value.to_string()),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_command_timeout_ms() -> u64 {
    1_000
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_store_timeout_ms() -> u64 {
    500
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

/// Load settings for the binary, reading `CONFIG_PATH` when set
pub fn load_settings_from_env() -> Result<Settings> {
    let path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &path {
        if !Path::new(path).exists() {
            return Err(RateLimitError::Config(format!("config file not found: {}", path)));
        }
    }
    Settings::load(path.as_deref())
}
