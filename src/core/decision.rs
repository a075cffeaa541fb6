//! `GateDecision` and `UsageEvent` (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize)]
pub struct GateDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub credits_charged: i64,
    pub remaining_credits: i64,
}

impl GateDecision {
    pub fn allow(credits_charged: i64, remaining_credits: i64) -> Self {
        Self { allowed: true, reason: None, credits_charged, remaining_credits }
    }

    pub fn shadow_allow(reason: impl std::fmt::Display, remaining_credits: i64) -> Self {
        Self {
            allowed: true,
            reason: Some(format!("shadow:{}", reason)),
            credits_charged: 0,
            remaining_credits,
        }
    }

    pub fn deny(reason: impl std::fmt::Display, remaining_credits: i64) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.to_string()),
            credits_charged: 0,
            remaining_credits,
        }
    }
}

/// Result of `Gate::evaluate_batch`: one decision per call, plus whether
/// the whole batch committed.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDecision {
    pub all_allowed: bool,
    pub failed_index: Option<usize>,
    pub decisions: Vec<GateDecision>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageEvent {
    pub timestamp: DateTime<Utc>,
    pub api_key: String,
    pub key_name: String,
    pub tool: String,
    pub credits_charged: i64,
    pub allowed: bool,
    pub deny_reason: Option<String>,
    pub namespace: Option<String>,
}

impl UsageEvent {
    /// The key is masked to its first 10 characters per spec.md §3/§4.5.
    pub fn new(
        api_key: &str,
        key_name: &str,
        tool: &str,
        credits_charged: i64,
        allowed: bool,
        deny_reason: Option<String>,
        namespace: Option<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            api_key: mask_key(api_key),
            key_name: key_name.to_string(),
            tool: tool.to_string(),
            credits_charged,
            allowed,
            deny_reason,
            namespace,
        }
    }
}

pub fn mask_key(key: &str) -> String {
    let prefix: String = key.chars().take(10).collect();
    format!("{}...", prefix)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mask_truncates_to_ten_chars() {
        let masked = mask_key("gw_1234567890abcdef");
        assert_eq!(masked, "gw_1234567...");
    }

    #[test]
    fn mask_short_key_is_unchanged_plus_ellipsis() {
        assert_eq!(mask_key("short"), "short...");
    }
}
