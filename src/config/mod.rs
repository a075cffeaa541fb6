//! Process configuration, grounded on the teacher's `AppConfig::from_env`
//! pattern: environment-first with `dotenvy`, explicit `anyhow::Result`
//! propagation for anything required (spec.md §4.9/§6 "CLI surface").

use crate::core::gate::{GateConfig, ToolPricing};
use crate::core::quota::GlobalQuota;
use crate::webhook::WebhookConfig;
use anyhow::{Context, Result};
use std::collections::{HashMap, HashSet};
use std::env;
use std::path::PathBuf;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub server_host: String,
    pub server_port: u16,
    pub state_file_path: Option<PathBuf>,
    pub redis_url: Option<String>,
    pub admin_bootstrap_key: String,
    pub cors_origins: Vec<String>,
    pub free_methods: HashSet<String>,
    pub scoped_token_secret: String,
    pub gate: GateSettings,
}

/// Tunables consumed at `Gate` construction (spec.md §4.9 `GateConfig`
/// substruct).
#[derive(Debug, Clone)]
pub struct GateSettings {
    pub default_credits_per_call: i64,
    pub global_rate_limit_per_min: u32,
    pub shadow_mode: bool,
    pub refund_on_failure: bool,
    pub reservation_default_ttl_secs: i64,
    pub usage_meter_capacity: usize,
    pub concurrency_key_limit: u32,
    pub concurrency_tool_limit: u32,
    pub global_quota: GlobalQuota,
    pub tool_pricing: HashMap<String, ToolPricing>,
    pub webhook: WebhookConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let server_host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let server_port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .context("SERVER_PORT must be a valid port number")?;

        let state_file_path = env::var("STATE_FILE_PATH").ok().map(PathBuf::from);
        let redis_url = env::var("REDIS_URL").ok();

        let admin_bootstrap_key = env::var("ADMIN_BOOTSTRAP_KEY")
            .context("ADMIN_BOOTSTRAP_KEY must be set (admin API is gated by it)")?;

        // Falls back to the admin bootstrap key so scoped tokens still work
        // out of the box; set SCOPED_TOKEN_SECRET explicitly in production
        // so the two credentials can be rotated independently.
        let scoped_token_secret =
            env::var("SCOPED_TOKEN_SECRET").unwrap_or_else(|_| admin_bootstrap_key.clone());

        let cors_origins = env::var("CORS_ORIGINS")
            .unwrap_or_else(|_| "*".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        let free_methods = env::var("FREE_METHODS")
            .unwrap_or_else(|_| "initialize,tools/list".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .collect();

        let shadow_mode = env::var("SHADOW_MODE")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        let webhook = WebhookConfig {
            url: env::var("WEBHOOK_URL").ok(),
            secret: env::var("WEBHOOK_SECRET").ok(),
            max_attempts: env::var("WEBHOOK_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(5),
            max_body_bytes: env::var("WEBHOOK_MAX_BODY_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(1024 * 1024),
        };

        Ok(Self {
            server_host,
            server_port,
            state_file_path,
            redis_url,
            admin_bootstrap_key,
            cors_origins,
            free_methods,
            scoped_token_secret,
            gate: GateSettings {
                default_credits_per_call: env::var("DEFAULT_CREDITS_PER_CALL")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(1),
                global_rate_limit_per_min: env::var("GLOBAL_RATE_LIMIT_PER_MIN")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                shadow_mode,
                refund_on_failure: env::var("REFUND_ON_FAILURE")
                    .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                    .unwrap_or(true),
                reservation_default_ttl_secs: env::var("RESERVATION_DEFAULT_TTL_SECS")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(300),
                usage_meter_capacity: env::var("USAGE_METER_CAPACITY")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(crate::core::usage_meter::DEFAULT_CAPACITY),
                concurrency_key_limit: env::var("CONCURRENCY_KEY_LIMIT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                concurrency_tool_limit: env::var("CONCURRENCY_TOOL_LIMIT")
                    .ok()
                    .and_then(|v| v.parse().ok())
                    .unwrap_or(0),
                global_quota: GlobalQuota::default(),
                tool_pricing: HashMap::new(),
                webhook,
            },
        })
    }

    pub fn server_address(&self) -> String {
        format!("{}:{}", self.server_host, self.server_port)
    }

    pub fn into_gate_config(self) -> (GateConfig, WebhookConfig) {
        let webhook = self.gate.webhook.clone();
        let config = GateConfig {
            default_credits_per_call: self.gate.default_credits_per_call,
            global_rate_limit_per_min: self.gate.global_rate_limit_per_min,
            tool_pricing: self.gate.tool_pricing,
            global_quota: self.gate.global_quota,
            reservation_default_ttl_secs: self.gate.reservation_default_ttl_secs,
            usage_meter_capacity: self.gate.usage_meter_capacity,
            concurrency_key_limit: self.gate.concurrency_key_limit,
            concurrency_tool_limit: self.gate.concurrency_tool_limit,
            shadow_mode: self.gate.shadow_mode,
            refund_on_failure: self.gate.refund_on_failure,
        };
        (config, webhook)
    }
}
