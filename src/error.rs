//! Error taxonomy for the gateway.
//!
//! Mirrors the teacher's `AppError`: a single `thiserror`-derived enum that
//! implements `IntoResponse`, logs internal detail server-side, and returns
//! a generic message to the caller. The `Gate` itself never returns a
//! `GateError` from a check — checks return a [`DenyReason`] inside a
//! [`crate::core::decision::GateDecision`]. `GateError` is reserved for
//! transport-level and persistence-level failures.

use axum::{http::StatusCode, response::{IntoResponse, Response}, Json};
use serde_json::json;
use std::fmt;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum GateError {
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized")]
    Unauthorized,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("persistence error: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, GateError>;

impl IntoResponse for GateError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            GateError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            GateError::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
            GateError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            GateError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            GateError::Persistence(err) => {
                tracing::error!("persistence error: {:?}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            GateError::Serialization(err) => {
                tracing::error!("serialization error: {:?}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
            GateError::Internal(err) => {
                tracing::error!("internal error: {:?}", err);
                (StatusCode::INTERNAL_SERVER_ERROR, "internal server error".to_string())
            }
        };

        (status, Json(json!({ "error": message, "status": status.as_u16() }))).into_response()
    }
}

/// Machine-readable deny tags named in spec.md §7.
///
/// `Display` renders the exact wire string the decision carries in
/// `GateDecision.reason`, including any interpolated detail (limits,
/// amounts). Shadow-mode evaluation prefixes the rendered string with
/// `shadow:` rather than wrapping the variant itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    MissingApiKey,
    InvalidApiKey,
    ApiKeyExpired,
    KeyRevoked,
    KeySuspended,
    IpNotAllowed { ip: String },
    ToolNotAllowed { tool: String },
    ToolDenied { tool: String },
    TokenToolNotAllowed { tool: String },
    RateLimited { limit: u32 },
    ToolRateLimited { tool: String, limit: u32 },
    InsufficientCredits { need: i64, have: i64 },
    SpendingLimitExceeded { limit: i64 },
    QuotaDailyCallsExceeded,
    QuotaMonthlyCallsExceeded,
    QuotaDailyCreditsExceeded,
    QuotaMonthlyCreditsExceeded,
    TeamBudgetExceeded,
    ReservationNotFound,
    ReservationNotHeld,
    ReservationExpired,
    BatchRejected,
    ConcurrencyLimitExceeded { scope: &'static str, limit: u32 },
    Internal(String),
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DenyReason::MissingApiKey => write!(f, "missing_api_key"),
            DenyReason::InvalidApiKey => write!(f, "invalid_api_key"),
            DenyReason::ApiKeyExpired => write!(f, "api_key_expired"),
            DenyReason::KeyRevoked => write!(f, "key_revoked"),
            DenyReason::KeySuspended => write!(f, "key_suspended"),
            DenyReason::IpNotAllowed { ip } => write!(f, "ip_not_allowed: {} not in allowlist", ip),
            DenyReason::ToolNotAllowed { tool } => {
                write!(f, "tool_not_allowed: {} not in allowedTools", tool)
            }
            DenyReason::ToolDenied { tool } => write!(f, "tool_denied: {} is in deniedTools", tool),
            DenyReason::TokenToolNotAllowed { tool } => {
                write!(f, "token_tool_not_allowed: {} not in scoped token", tool)
            }
            DenyReason::RateLimited { limit } => {
                write!(f, "rate_limited: {} calls/min exceeded", limit)
            }
            DenyReason::ToolRateLimited { tool, limit } => {
                write!(f, "tool_rate_limited: {} calls/min exceeded for {}", limit, tool)
            }
            DenyReason::InsufficientCredits { need, have } => {
                write!(f, "insufficient_credits: need {}, have {}", need, have)
            }
            DenyReason::SpendingLimitExceeded { limit } => {
                write!(f, "spending_limit_exceeded: limit {}", limit)
            }
            DenyReason::QuotaDailyCallsExceeded => write!(f, "quota_daily_calls_exceeded"),
            DenyReason::QuotaMonthlyCallsExceeded => write!(f, "quota_monthly_calls_exceeded"),
            DenyReason::QuotaDailyCreditsExceeded => write!(f, "quota_daily_credits_exceeded"),
            DenyReason::QuotaMonthlyCreditsExceeded => write!(f, "quota_monthly_credits_exceeded"),
            DenyReason::TeamBudgetExceeded => write!(f, "team_budget_exceeded"),
            DenyReason::ReservationNotFound => write!(f, "reservation_not_found"),
            DenyReason::ReservationNotHeld => write!(f, "reservation_not_held"),
            DenyReason::ReservationExpired => write!(f, "reservation_expired"),
            DenyReason::BatchRejected => write!(f, "batch_rejected"),
            DenyReason::ConcurrencyLimitExceeded { scope, limit } => {
                write!(f, "concurrency_limit_exceeded: {} inflight limit {} reached", scope, limit)
            }
            DenyReason::Internal(msg) => write!(f, "internal_error: {}", msg),
        }
    }
}

impl DenyReason {
    /// The fixed quota-boundary ordering spec.md §4.4 enumerates: daily
    /// calls, daily credits, monthly calls, monthly credits. Used by
    /// `QuotaTracker::check` to report the first boundary exceeded.
    pub fn quota_exceeded_tag(&self) -> &'static str {
        match self {
            DenyReason::QuotaDailyCallsExceeded => "quota_daily_calls_exceeded",
            DenyReason::QuotaDailyCreditsExceeded => "quota_daily_credits_exceeded",
            DenyReason::QuotaMonthlyCallsExceeded => "quota_monthly_calls_exceeded",
            DenyReason::QuotaMonthlyCreditsExceeded => "quota_monthly_credits_exceeded",
            _ => "quota_exceeded",
        }
    }
}
