pub mod config;
pub mod core;
pub mod error;
pub mod middleware;
pub mod transport;
pub mod utils;
pub mod webhook;

use crate::config::AppConfig;
use crate::core::redis_rate_limiter::RedisRateLimiter;
use crate::core::{Gate, KeyStore};
use crate::middleware::scoped_token::ScopedTokenService;
use crate::transport::AppState;
use crate::webhook::{WebhookDispatcher, WebhookObserver};
use axum::{
    http::HeaderValue,
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;

/// Builds the full axum router: JSON-RPC gateway surface plus admin CRUD,
/// wrapped in the ambient middleware stack (request ID, content-type
/// validation, security headers, CORS), mirroring the teacher's
/// `create_app` layering (SPEC_FULL.md §4.14).
pub async fn create_app(config: AppConfig) -> anyhow::Result<(Router, Arc<AppState>)> {
    let keystore = KeyStore::new(config.state_file_path.clone());
    keystore.load().await;

    let redis_limiter = match &config.redis_url {
        Some(url) => match RedisRateLimiter::connect(url).await {
            Ok(limiter) => Some(Arc::new(limiter)),
            Err(err) => {
                tracing::warn!(error = %err, "failed to connect to Redis, continuing without distributed rate limiting");
                None
            }
        },
        None => None,
    };

    let cors_origins = config.cors_origins.clone();
    let free_methods = config.free_methods.clone();
    let admin_bootstrap_key = config.admin_bootstrap_key.clone();
    let scoped_token = Arc::new(ScopedTokenService::new(&config.scoped_token_secret));
    let (gate_config, webhook_config) = config.into_gate_config();

    let gate = Arc::new(Gate::new(keystore, gate_config));
    gate.spawn_background_workers();

    let webhook = Arc::new(WebhookDispatcher::new(webhook_config));
    gate.set_observer(Arc::new(WebhookObserver::new(webhook.clone())));

    let state = Arc::new(AppState {
        gate,
        webhook,
        redis_limiter,
        free_methods,
        admin_bootstrap_key,
        scoped_token,
    });

    let cors_layer = build_cors(&cors_origins);

    let admin_routes = Router::new()
        .route("/keys", post(transport::admin::create_key).get(transport::admin::list_keys))
        .route("/keys/:key", get(transport::admin::get_key).delete(transport::admin::revoke_key))
        .route("/keys/:key/credits", post(transport::admin::adjust_credits))
        .route("/keys/:key/auto-topup", post(transport::admin::set_auto_topup))
        .route("/usage", get(transport::admin::usage_summary))
        .route("/usage.csv", get(transport::admin::usage_csv))
        .route("/concurrency", get(transport::admin::concurrency_snapshot))
        .layer(axum_middleware::from_fn_with_state(state.clone(), middleware::admin_auth_middleware));

    let app = Router::new()
        .route("/mcp", post(transport::mcp::handle_mcp))
        .route("/mcp/batch", post(transport::mcp::handle_mcp_batch))
        .nest("/api/admin", admin_routes)
        .layer(
            ServiceBuilder::new()
                .layer(axum_middleware::from_fn(middleware::content_type_validation_middleware))
                .layer(axum_middleware::from_fn(middleware::request_id_middleware))
                .layer(axum_middleware::from_fn(middleware::security_headers_middleware))
                .layer(cors_layer),
        )
        .with_state(state.clone());

    Ok((app, state))
}

fn build_cors(origins: &[String]) -> CorsLayer {
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new().allow_origin(tower_http::cors::Any).allow_methods(tower_http::cors::Any);
    }

    let values: Vec<HeaderValue> = origins.iter().filter_map(|o| o.parse().ok()).collect();
    CorsLayer::new().allow_origin(values).allow_methods(tower_http::cors::Any).allow_headers(tower_http::cors::Any)
}
