use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script, Value};
use std::time::Duration;
use tracing::{info, warn};

use crate::{
    error::{RateLimitError, Result},
    store::CounterStore,
    token_bucket::{BucketOutcome, BucketRequest, TOKEN_BUCKET_SCRIPT},
};

/// Redis client configuration
#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
    pub connection_timeout: Option<Duration>,
    pub command_timeout: Option<Duration>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            connection_timeout: Some(Duration::from_secs(5)),
            command_timeout: Some(Duration::from_secs(1)),
        }
    }
}

/// Redis client running the token bucket script
#[derive(Clone)]
pub struct RedisClient {
    connection: ConnectionManager,
    script: Script,
}

impl RedisClient {
    /// Create a new Redis client
    pub async fn new(config: RedisConfig) -> Result<Self> {
        info!("Creating Redis client for URL: {}", redact_url(&config.url));

        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            warn!("Failed to create Redis client: {}", e);
            RateLimitError::StoreUnavailable(e)
        })?;

        let connection_timeout = config.connection_timeout.unwrap_or(Duration::from_secs(10));
        let connection = match tokio::time::timeout(connection_timeout, client.get_connection_manager()).await {
            Ok(Ok(conn)) => {
                info!("Connection manager established successfully");
                conn
            }
            Ok(Err(e)) => {
                warn!("Failed to create connection manager: {}", e);
                return Err(RateLimitError::StoreUnavailable(e));
            }
            Err(_) => {
                warn!("Timeout while creating connection manager ({}s)", connection_timeout.as_secs());
                return Err(RateLimitError::StoreTimeout(connection_timeout));
            }
        };

        let redis_client = Self {
            connection,
            script: Script::new(TOKEN_BUCKET_SCRIPT),
        };

        let command_timeout = config.command_timeout.unwrap_or(Duration::from_secs(5));
        match tokio::time::timeout(command_timeout, redis_client.health_check()).await {
            Ok(Ok(())) => info!("Redis PING successful"),
            Ok(Err(e)) => {
                warn!("Redis PING failed: {}", e);
                return Err(e);
            }
            Err(_) => {
                warn!("Redis PING timeout ({}s)", command_timeout.as_secs());
                return Err(RateLimitError::StoreTimeout(command_timeout));
            }
        }

        info!("Redis client initialized successfully");
        Ok(redis_client)
    }

    /// Run the token bucket script for one key
    pub async fn take_token(&self, request: &BucketRequest) -> Result<BucketOutcome> {
        let mut conn = self.connection.clone();

        // EVALSHA, falling back to EVAL when the script cache is cold
        let reply: Value = self
            .script
            .key(&request.key)
            .arg(request.burst)
            .arg(request.rate)
            .arg(request.period_seconds())
            .arg(request.now)
            .arg(request.ttl_seconds())
            .invoke_async(&mut conn)
            .await?;

        parse_script_reply(reply)
    }

    /// Check if the connection is healthy
    pub async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection.clone();
        redis::cmd("PING").query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}

/// Decode `{allowed, remaining, reset_after}` from the script reply
fn parse_script_reply(reply: Value) -> Result<BucketOutcome> {
    let values = match reply {
        Value::Bulk(values) => values,
        other => {
            return Err(RateLimitError::MalformedStoreResponse(format!(
                "expected a 3 element array, got {:?}",
                other
            )))
        }
    };

    match values.as_slice() {
        [Value::Int(allowed), Value::Int(remaining), Value::Int(reset_after)]
            if (*allowed == 0 || *allowed == 1) && *reset_after >= 0 =>
        {
            Ok(BucketOutcome {
                allowed: *allowed == 1,
                remaining: *remaining,
                reset_after_secs: *reset_after as u64,
            })
        }
        _ => Err(RateLimitError::MalformedStoreResponse(format!(
            "unexpected token bucket reply {:?}",
            values
        ))),
    }
}

/// Hide credentials when logging a connection URL
fn redact_url(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme_end), Some(at)) if at > scheme_end => {
            format!("{}://***{}", &url[..scheme_end], &url[at..])
        }
        _ => url.to_string(),
    }
}

/// Redis clients, with an optional dedicated instance for per-second buckets
#[derive(Clone)]
pub struct RedisClientPool {
    primary_client: RedisClient,
    per_second_client: Option<RedisClient>,
}

impl RedisClientPool {
    /// Create a new Redis client pool with primary client only
    pub async fn new_single(config: RedisConfig) -> Result<Self> {
        info!("Creating single Redis client pool...");

        let primary_client = RedisClient::new(config).await?;

        info!("Single Redis pool created successfully");
        Ok(Self {
            primary_client,
            per_second_client: None,
        })
    }

    /// Create a new Redis client pool with separate per-second client
    pub async fn new_dual(primary_config: RedisConfig, per_second_config: RedisConfig) -> Result<Self> {
        info!("Creating dual Redis client pool...");

        let primary_client = RedisClient::new(primary_config).await?;
        let per_second_client = RedisClient::new(per_second_config).await?;

        info!("Dual Redis pool created successfully");
        Ok(Self {
            primary_client,
            per_second_client: Some(per_second_client),
        })
    }

    /// Get the appropriate client for the given window
    pub fn get_client(&self, is_per_second: bool) -> &RedisClient {
        match &self.per_second_client {
            Some(client) if is_per_second => client,
            _ => &self.primary_client,
        }
    }
}

#[async_trait]
impl CounterStore for RedisClientPool {
    async fn take_token(&self, request: &BucketRequest) -> Result<BucketOutcome> {
        self.get_client(request.window.is_per_second())
            .take_token(request)
            .await
    }

    /// Health check all clients
    async fn health_check(&self) -> Result<()> {
        self.primary_client.health_check().await?;
        if let Some(per_second_client) = &self.per_second_client {
            per_second_client.health_check().await?;
        }
        Ok(())
    }
}
