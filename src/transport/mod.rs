//! HTTP/JSON-RPC transport (spec.md §6, SPEC_FULL.md §4.14), grounded on
//! the teacher's axum router wiring in `main.rs`/`lib.rs`. The gate itself
//! has no transport dependency — this module is purely the boundary that
//! decodes JSON-RPC requests into `ToolCall`/`CallContext` and encodes
//! `GateDecision`/`BatchDecision` back onto the wire.

pub mod admin;
pub mod mcp;

use crate::core::redis_rate_limiter::RedisRateLimiter;
use crate::core::Gate;
use crate::middleware::scoped_token::ScopedTokenService;
use crate::webhook::WebhookDispatcher;
use std::collections::HashSet;
use std::sync::Arc;

/// Shared application state threaded through every handler.
pub struct AppState {
    pub gate: Arc<Gate>,
    pub webhook: Arc<WebhookDispatcher>,
    pub redis_limiter: Option<Arc<RedisRateLimiter>>,
    pub free_methods: HashSet<String>,
    pub admin_bootstrap_key: String,
    pub scoped_token: Arc<ScopedTokenService>,
}

/// JSON-RPC error codes spec.md §6 mandates per deny-reason family. Takes
/// the rendered wire string (the `Display` form of a [`crate::error::DenyReason`])
/// since that is all a [`crate::core::decision::GateDecision`] carries once
/// it crosses the gate boundary.
pub fn rpc_error_code(reason: &str) -> i64 {
    if reason.starts_with("insufficient_credits")
        || reason.starts_with("spending_limit_exceeded")
        || reason.starts_with("team_budget_exceeded")
    {
        -32402
    } else if reason.starts_with("rate_limited")
        || reason.starts_with("tool_rate_limited")
        || reason.starts_with("concurrency_limit_exceeded")
    {
        -32001
    } else if reason.starts_with("missing_api_key")
        || reason.starts_with("invalid_api_key")
        || reason.starts_with("api_key_expired")
    {
        -32401
    } else {
        -32603
    }
}
