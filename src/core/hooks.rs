//! Callback slots the `Gate` exposes to external collaborators
//! (spec.md §6 "Observer hooks", §9 "cyclic references").
//!
//! Unattached slots are no-ops, so `Gate` is constructable without a
//! transport, webhook dispatcher, or team-budget backend wired in.

use crate::error::DenyReason;
use async_trait::async_trait;
use std::sync::Arc;

/// Optional pre-commit team-budget gate (spec.md §4.2 step 11).
#[async_trait]
pub trait TeamChecker: Send + Sync {
    async fn check(&self, key: &str, credits: i64) -> Result<(), DenyReason>;
}

/// Optional post-commit team ledger.
#[async_trait]
pub trait TeamRecorder: Send + Sync {
    async fn record(&self, key: &str, credits: i64);
}

/// Invoked after every meter record, successful deduction, or auto-topup —
/// the seam Redis mirroring and dashboards attach to.
pub trait UsageObserver: Send + Sync {
    fn on_usage_event(&self, event: &crate::core::decision::UsageEvent) {
        let _ = event;
    }
    fn on_credits_deducted(&self, key: &str, amount: i64) {
        let _ = (key, amount);
    }
    fn on_auto_topup(&self, key: &str, amount: i64, new_balance: i64) {
        let _ = (key, amount, new_balance);
    }
}

/// Default observer: logs at `debug` via `tracing`, used when no collaborator
/// attaches one.
pub struct LoggingObserver;

impl UsageObserver for LoggingObserver {
    fn on_usage_event(&self, event: &crate::core::decision::UsageEvent) {
        tracing::debug!(
            tool = %event.tool,
            allowed = event.allowed,
            credits_charged = event.credits_charged,
            "usage event"
        );
    }

    fn on_credits_deducted(&self, key: &str, amount: i64) {
        tracing::debug!(key = %crate::utils::sanitize_for_log(key), amount, "credits deducted");
    }

    fn on_auto_topup(&self, key: &str, amount: i64, new_balance: i64) {
        tracing::info!(
            key = %crate::utils::sanitize_for_log(key),
            amount,
            new_balance,
            "auto-topup applied"
        );
    }
}

pub struct NoopTeamChecker;

#[async_trait]
impl TeamChecker for NoopTeamChecker {
    async fn check(&self, _key: &str, _credits: i64) -> Result<(), DenyReason> {
        Ok(())
    }
}

pub struct NoopTeamRecorder;

#[async_trait]
impl TeamRecorder for NoopTeamRecorder {
    async fn record(&self, _key: &str, _credits: i64) {}
}

/// Pluggable price-transform hook (spec.md §4.2 "optional transform price
/// plugin hook"). Unattached means identity.
pub trait PriceTransform: Send + Sync {
    fn transform(&self, tool: &str, base_price: i64) -> i64;
}

pub type SharedTeamChecker = Arc<dyn TeamChecker>;
pub type SharedTeamRecorder = Arc<dyn TeamRecorder>;
pub type SharedObserver = Arc<dyn UsageObserver>;
pub type SharedPriceTransform = Arc<dyn PriceTransform>;
