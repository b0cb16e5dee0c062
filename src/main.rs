use anyhow::Result;
use axum::{extract::State, http::StatusCode, response::Json, routing::get, Router};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use path_ratelimit::{
    config::{load_settings_from_env, EnvSecretProvider, SecretDecryptor, Settings},
    limiter::RateLimiter,
    metrics::Metrics,
    middleware::{rate_limit_middleware, RateLimitState},
    redis::RedisClientPool,
};

#[derive(Clone)]
struct AppState {
    limiter: Arc<RateLimiter>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "path_ratelimit=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting path rate limiter");

    let mut settings = load_settings_from_env()?;
    settings.decrypt_secrets(&SecretDecryptor::new(Box::new(EnvSecretProvider)))?;

    let metrics = Arc::new(Metrics::new()?);
    let limiter = create_limiter(&settings, metrics.clone()).await?;
    let state = AppState { limiter, metrics };

    let http_addr = settings.http.listen_addr;
    info!("HTTP server listening on {}", http_addr);

    tokio::select! {
        result = start_http_server(state, http_addr) => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

async fn create_limiter(settings: &Settings, metrics: Arc<Metrics>) -> Result<Arc<RateLimiter>> {
    let redis_pool = match settings.redis.per_second() {
        Some(per_second_config) => {
            RedisClientPool::new_dual(settings.redis.primary(), per_second_config).await?
        }
        None => RedisClientPool::new_single(settings.redis.primary()).await?,
    };

    let limiter = RateLimiter::new(
        Arc::new(redis_pool),
        settings.policy.clone(),
        settings.limiter.clone().into(),
    )?
    .with_metrics(metrics);

    Ok(Arc::new(limiter))
}

async fn start_http_server(state: AppState, addr: SocketAddr) -> Result<()> {
    let limited = Router::new()
        .fallback(passthrough)
        .layer(axum::middleware::from_fn_with_state(
            RateLimitState::new(state.limiter.clone()),
            rate_limit_middleware,
        ));

    let app = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
        .merge(limited);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>()).await?;

    Ok(())
}

async fn passthrough() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.limiter.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339()
        }))),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
