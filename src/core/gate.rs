//! The Gate: single authoritative check sequence for a tool invocation
//! (spec.md §4.2).

use crate::core::concurrency::ConcurrencyLimiter;
use crate::core::decision::{BatchDecision, GateDecision, UsageEvent};
use crate::core::hooks::{
    LoggingObserver, NoopTeamChecker, NoopTeamRecorder, SharedObserver, SharedPriceTransform,
    SharedTeamChecker, SharedTeamRecorder,
};
use crate::core::key_record::ApiKeyRecord;
use crate::core::keystore::{KeyLookupError, KeyStore};
use crate::core::quota::{GlobalQuota, QuotaTracker};
use crate::core::rate_limiter::RateLimiter;
use crate::core::reservation::CreditReservationManager;
use crate::core::usage_meter::UsageMeter;
use crate::error::DenyReason;
use crate::utils::json_safety::serialized_size_kb;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Per-tool pricing and rate-limit configuration (spec.md §4.2).
#[derive(Debug, Clone, Default)]
pub struct ToolPricing {
    pub credits_per_call: i64,
    pub credits_per_kb_input: f64,
    pub rate_limit_per_min: u32,
}

pub struct GateConfig {
    pub default_credits_per_call: i64,
    pub global_rate_limit_per_min: u32,
    pub tool_pricing: HashMap<String, ToolPricing>,
    pub global_quota: GlobalQuota,
    pub reservation_default_ttl_secs: i64,
    pub usage_meter_capacity: usize,
    pub concurrency_key_limit: u32,
    pub concurrency_tool_limit: u32,
    pub shadow_mode: bool,
    pub refund_on_failure: bool,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            default_credits_per_call: 1,
            global_rate_limit_per_min: 0,
            tool_pricing: HashMap::new(),
            global_quota: GlobalQuota::default(),
            reservation_default_ttl_secs: 300,
            usage_meter_capacity: crate::core::usage_meter::DEFAULT_CAPACITY,
            concurrency_key_limit: 0,
            concurrency_tool_limit: 0,
            shadow_mode: false,
            refund_on_failure: true,
        }
    }
}

/// One invocation, as the transport decodes it off the wire.
pub struct ToolCall<'a> {
    pub tool: &'a str,
    pub args: Option<&'a serde_json::Value>,
    pub scoped_tools: Option<&'a std::collections::HashSet<String>>,
}

/// Everything the gate needs about the calling context beyond the key.
pub struct CallContext<'a> {
    pub api_key: &'a str,
    pub client_ip: Option<Ipv4Addr>,
    pub key_group_pricing: Option<&'a HashMap<String, i64>>,
}

pub struct Gate {
    pub keystore: KeyStore,
    pub rate_limiter: RateLimiter,
    pub reservations: CreditReservationManager,
    pub usage_meter: UsageMeter,
    pub concurrency: ConcurrencyLimiter,
    pub config: parking_lot::RwLock<GateConfig>,
    team_checker: parking_lot::RwLock<SharedTeamChecker>,
    team_recorder: parking_lot::RwLock<SharedTeamRecorder>,
    observer: parking_lot::RwLock<SharedObserver>,
    price_transform: parking_lot::RwLock<Option<SharedPriceTransform>>,
}

impl Gate {
    pub fn new(keystore: KeyStore, config: GateConfig) -> Self {
        Self {
            rate_limiter: RateLimiter::new(config.global_rate_limit_per_min),
            reservations: CreditReservationManager::new(config.reservation_default_ttl_secs),
            usage_meter: UsageMeter::new(config.usage_meter_capacity),
            concurrency: ConcurrencyLimiter::new(config.concurrency_key_limit, config.concurrency_tool_limit),
            keystore,
            config: parking_lot::RwLock::new(config),
            team_checker: parking_lot::RwLock::new(Arc::new(NoopTeamChecker)),
            team_recorder: parking_lot::RwLock::new(Arc::new(NoopTeamRecorder)),
            observer: parking_lot::RwLock::new(Arc::new(LoggingObserver)),
            price_transform: parking_lot::RwLock::new(None),
        }
    }

    pub fn set_team_checker(&self, checker: SharedTeamChecker) {
        *self.team_checker.write() = checker;
    }

    pub fn set_team_recorder(&self, recorder: SharedTeamRecorder) {
        *self.team_recorder.write() = recorder;
    }

    pub fn set_observer(&self, observer: SharedObserver) {
        *self.observer.write() = observer;
    }

    pub fn set_price_transform(&self, transform: SharedPriceTransform) {
        *self.price_transform.write() = Some(transform);
    }

    /// Base + key-group override + input-size surcharge + optional
    /// transform hook, clamped >= 0 (spec.md §4.2).
    pub fn price_tool(&self, ctx: &CallContext, call: &ToolCall) -> i64 {
        let config = self.config.read();
        let pricing = config.tool_pricing.get(call.tool);

        let mut price = pricing
            .map(|p| p.credits_per_call)
            .unwrap_or(config.default_credits_per_call);

        if let Some(overrides) = ctx.key_group_pricing {
            if let Some(&override_price) = overrides.get(call.tool) {
                price = override_price;
            }
        }

        if let Some(pricing) = pricing {
            if pricing.credits_per_kb_input > 0.0 {
                if let Some(args) = call.args {
                    let size_kb = serialized_size_kb(args);
                    price += (size_kb * pricing.credits_per_kb_input).ceil() as i64;
                }
            }
        }
        drop(config);

        if let Some(transform) = self.price_transform.read().as_ref() {
            price = transform.transform(call.tool, price);
        }

        price.max(0)
    }

    fn rate_limit_for_tool(&self, tool: &str) -> u32 {
        self.config
            .read()
            .tool_pricing
            .get(tool)
            .map(|p| p.rate_limit_per_min)
            .unwrap_or(0)
    }

    /// Steps 1-5 of the check order: identity, ACL, IP, scoped token. Does
    /// not touch rate limit, credits, quota, or team budget. Revocation and
    /// suspension are surfaced earlier, by `KeyStore::get_key` itself —
    /// callers only reach here with an active, non-suspended record.
    fn check_identity_and_acl(
        &self,
        ctx: &CallContext,
        call: &ToolCall,
        record: &ApiKeyRecord,
    ) -> Result<(), DenyReason> {
        if record.expires_at.is_some() && record.is_expired() {
            return Err(DenyReason::ApiKeyExpired);
        }

        if !crate::utils::ip_match::check_allowlist(&record.ip_allowlist, ctx.client_ip) {
            let ip_str = ctx.client_ip.map(|ip| ip.to_string()).unwrap_or_else(|| "unknown".into());
            return Err(DenyReason::IpNotAllowed { ip: ip_str });
        }

        if !record.allowed_tools.is_empty() && !record.allowed_tools.contains(call.tool) {
            return Err(DenyReason::ToolNotAllowed { tool: call.tool.to_string() });
        }
        if record.denied_tools.contains(call.tool) {
            return Err(DenyReason::ToolDenied { tool: call.tool.to_string() });
        }

        if let Some(scoped) = call.scoped_tools {
            if !scoped.contains(call.tool) {
                return Err(DenyReason::TokenToolNotAllowed { tool: call.tool.to_string() });
            }
        }

        Ok(())
    }

    /// Single-call evaluation (spec.md §4.2).
    pub async fn evaluate(&self, ctx: CallContext<'_>, call: ToolCall<'_>) -> GateDecision {
        if ctx.api_key.is_empty() {
            return self.finish_deny(&ctx, &call, None, DenyReason::MissingApiKey);
        }

        let record = match self.keystore.get_key(ctx.api_key) {
            Ok(r) => r,
            Err(KeyLookupError::Expired) => {
                return self.finish_deny(&ctx, &call, None, DenyReason::ApiKeyExpired)
            }
            Err(KeyLookupError::Revoked) => {
                return self.finish_deny(&ctx, &call, None, DenyReason::KeyRevoked)
            }
            Err(KeyLookupError::Suspended) => {
                return self.finish_deny(&ctx, &call, None, DenyReason::KeySuspended)
            }
            Err(KeyLookupError::NotFound) => {
                return self.finish_deny(&ctx, &call, None, DenyReason::InvalidApiKey)
            }
        };

        if let Err(reason) = self.check_identity_and_acl(&ctx, &call, &record) {
            return self.finish_deny(&ctx, &call, Some(&record), reason);
        }

        // Held for the rest of this evaluation (spec.md §4.7); released
        // when this function returns.
        let _concurrency_guard = match self.concurrency.acquire_guard(ctx.api_key, call.tool) {
            Ok(guard) => guard,
            Err(denial) => {
                return self.finish_deny(
                    &ctx,
                    &call,
                    Some(&record),
                    DenyReason::ConcurrencyLimitExceeded { scope: denial.reason, limit: denial.limit },
                )
            }
        };

        let global_limit = self.config.read().global_rate_limit_per_min;
        if !self.rate_limiter.check_and_record(ctx.api_key, global_limit) {
            return self.finish_deny(&ctx, &call, Some(&record), DenyReason::RateLimited { limit: global_limit });
        }

        let tool_limit = self.rate_limit_for_tool(call.tool);
        let composite = RateLimiter::composite_key(ctx.api_key, call.tool);
        if tool_limit > 0 && !self.rate_limiter.check_and_record(&composite, tool_limit) {
            return self.finish_deny(
                &ctx,
                &call,
                Some(&record),
                DenyReason::ToolRateLimited { tool: call.tool.to_string(), limit: tool_limit },
            );
        }

        let price = self.price_tool(&ctx, &call);

        let shadow = self.config.read().shadow_mode;
        let global_quota = self.config.read().global_quota.clone();
        let mutation = self.keystore.with_record_mut(ctx.api_key, |rec| {
            KeyStore::reset_quota_if_needed(rec);

            if rec.credits < price {
                return Err(DenyReason::InsufficientCredits { need: price, have: rec.credits });
            }
            if rec.spending_limit > 0 && rec.total_spent + price > rec.spending_limit {
                return Err(DenyReason::SpendingLimitExceeded { limit: rec.spending_limit });
            }
            QuotaTracker::check(rec, price, &global_quota)?;

            // Shadow mode logs the would-be outcome but never enforces it
            // (spec.md §1/glossary): the checks above still run so a would-be
            // deny is still reported, but nothing past this point commits.
            if shadow {
                return Ok((rec.credits, None));
            }

            rec.credits -= price;
            rec.total_spent += price;
            rec.total_calls += 1;
            rec.last_used_at = Some(chrono::Utc::now());
            QuotaTracker::record(rec, price);

            let topup = Self::maybe_auto_topup(rec);
            Ok((rec.credits, topup))
        });

        let (remaining, topup) = match mutation {
            Ok(Ok(result)) => result,
            Ok(Err(reason)) => return self.finish_deny(&ctx, &call, Some(&record), reason),
            Err(()) => return self.finish_deny(&ctx, &call, None, DenyReason::InvalidApiKey),
        };

        if let Some((amount, new_balance)) = topup {
            self.observer.read().on_auto_topup(ctx.api_key, amount, new_balance);
        }
        if !shadow {
            self.observer.read().on_credits_deducted(ctx.api_key, price);
        }

        let decision = if shadow {
            GateDecision::shadow_allow("ok", remaining)
        } else {
            GateDecision::allow(price, remaining)
        };

        let event = UsageEvent::new(
            ctx.api_key,
            &record.name,
            call.tool,
            if shadow { 0 } else { price },
            true,
            decision.reason.clone(),
            Some(record.namespace.clone()).filter(|s| !s.is_empty()),
        );
        self.usage_meter.record(event.clone());
        self.observer.read().on_usage_event(&event);

        decision
    }

    fn finish_deny(
        &self,
        ctx: &CallContext,
        call: &ToolCall,
        record: Option<&ApiKeyRecord>,
        reason: DenyReason,
    ) -> GateDecision {
        let shadow = self.config.read().shadow_mode;
        let remaining = record.map(|r| r.credits).unwrap_or(0);
        let key_name = record.map(|r| r.name.clone()).unwrap_or_default();
        let namespace = record.and_then(|r| Some(r.namespace.clone()).filter(|s| !s.is_empty()));

        let decision = if shadow {
            GateDecision::shadow_allow(&reason, remaining)
        } else {
            GateDecision::deny(&reason, remaining)
        };

        let event = UsageEvent::new(
            ctx.api_key,
            &key_name,
            call.tool,
            0,
            decision.allowed,
            Some(reason.to_string()),
            namespace,
        );
        self.usage_meter.record(event.clone());
        self.observer.read().on_usage_event(&event);

        decision
    }

    /// Resets/applies auto-topup after a deduction, inside the same write
    /// lock as the deduction itself (spec.md §4.2).
    fn maybe_auto_topup(rec: &mut ApiKeyRecord) -> Option<(i64, i64)> {
        let topup = rec.auto_topup.clone()?;
        if rec.credits >= topup.threshold {
            return None;
        }

        let today = crate::core::key_record::today_utc();
        if rec.auto_topup_last_reset_day != today {
            rec.auto_topup_today_count = 0;
            rec.auto_topup_last_reset_day = today;
        }

        if topup.max_daily != 0 && rec.auto_topup_today_count >= topup.max_daily {
            return None;
        }

        rec.credits = crate::core::key_record::clamp_input_credits(rec.credits + topup.amount);
        rec.auto_topup_today_count += 1;
        Some((topup.amount, rec.credits))
    }

    /// Batch evaluation (spec.md §4.2 `evaluateBatch`): checks run over the
    /// aggregate for credits/spending/quota/team, per-call for ACL, scoped
    /// token, and per-tool rate limit (batch-aware).
    pub async fn evaluate_batch(&self, ctx: CallContext<'_>, calls: Vec<ToolCall<'_>>) -> BatchDecision {
        if ctx.api_key.is_empty() {
            let reason = DenyReason::MissingApiKey;
            return BatchDecision {
                all_allowed: false,
                failed_index: Some(0),
                decisions: vec![GateDecision::deny(&reason, 0); calls.len().max(1)],
            };
        }

        let record = match self.keystore.get_key(ctx.api_key) {
            Ok(r) => r,
            Err(KeyLookupError::Expired) => {
                return self.batch_reject(&calls, DenyReason::ApiKeyExpired, 0, 0)
            }
            Err(KeyLookupError::Revoked) => {
                return self.batch_reject(&calls, DenyReason::KeyRevoked, 0, 0)
            }
            Err(KeyLookupError::Suspended) => {
                return self.batch_reject(&calls, DenyReason::KeySuspended, 0, 0)
            }
            Err(KeyLookupError::NotFound) => {
                return self.batch_reject(&calls, DenyReason::InvalidApiKey, 0, 0)
            }
        };

        // Per-call ACL / scoped-token / per-tool rate-limit / concurrency
        // checks, batch-aware for the per-tool window (spec.md §4.2, §8).
        // Guards are held for the rest of this evaluation and released in
        // a batch once the whole function returns.
        let mut tool_occurrences: HashMap<&str, u32> = HashMap::new();
        let mut concurrency_guards = Vec::with_capacity(calls.len());
        for (i, call) in calls.iter().enumerate() {
            if let Err(reason) = self.check_identity_and_acl(&ctx, call, &record) {
                return self.batch_reject(&calls, reason, i, record.credits);
            }

            match self.concurrency.acquire_guard(ctx.api_key, call.tool) {
                Ok(guard) => concurrency_guards.push(guard),
                Err(denial) => {
                    return self.batch_reject(
                        &calls,
                        DenyReason::ConcurrencyLimitExceeded { scope: denial.reason, limit: denial.limit },
                        i,
                        record.credits,
                    )
                }
            }

            let tool_limit = self.rate_limit_for_tool(call.tool);
            if tool_limit > 0 {
                let composite = RateLimiter::composite_key(ctx.api_key, call.tool);
                let existing = self.rate_limiter.current_count(&composite);
                let occurrences = tool_occurrences.entry(call.tool).or_insert(0);
                *occurrences += 1;
                if existing + *occurrences > tool_limit {
                    return self.batch_reject(
                        &calls,
                        DenyReason::ToolRateLimited { tool: call.tool.to_string(), limit: tool_limit },
                        i,
                        record.credits,
                    );
                }
            }
        }

        let global_limit = self.config.read().global_rate_limit_per_min;
        if global_limit > 0 {
            let existing = self.rate_limiter.current_count(ctx.api_key);
            if existing + calls.len() as u32 > global_limit {
                return self.batch_reject(&calls, DenyReason::RateLimited { limit: global_limit }, 0, record.credits);
            }
        }

        let prices: Vec<i64> = calls.iter().map(|c| self.price_tool(&ctx, c)).collect();
        let total_price: i64 = prices.iter().sum();

        let shadow = self.config.read().shadow_mode;
        let global_quota = self.config.read().global_quota.clone();
        let n_calls = calls.len() as i64;
        let mutation = self.keystore.with_record_mut(ctx.api_key, |rec| {
            KeyStore::reset_quota_if_needed(rec);

            if rec.credits < total_price {
                return Err(DenyReason::InsufficientCredits { need: total_price, have: rec.credits });
            }
            if rec.spending_limit > 0 && rec.total_spent + total_price > rec.spending_limit {
                return Err(DenyReason::SpendingLimitExceeded { limit: rec.spending_limit });
            }
            QuotaTracker::check_n(rec, n_calls, total_price, &global_quota)?;

            // Dry run in shadow mode: checks above still determine the
            // would-be outcome, but nothing commits (spec.md §1/glossary).
            if shadow {
                return Ok((rec.credits, None));
            }

            rec.credits -= total_price;
            rec.total_spent += total_price;
            rec.total_calls += n_calls;
            rec.last_used_at = Some(chrono::Utc::now());
            QuotaTracker::record_n(rec, n_calls, total_price);

            let topup = Self::maybe_auto_topup(rec);
            Ok((rec.credits, topup))
        });

        let (mut remaining, topup) = match mutation {
            Ok(Ok(result)) => result,
            Ok(Err(reason)) => return self.batch_reject(&calls, reason, 0, record.credits),
            Err(()) => return self.batch_reject(&calls, DenyReason::InvalidApiKey, 0, 0),
        };

        if let Some((amount, new_balance)) = topup {
            self.observer.read().on_auto_topup(ctx.api_key, amount, new_balance);
            remaining = new_balance;
        }
        if !shadow {
            self.observer.read().on_credits_deducted(ctx.api_key, total_price);
        }

        for (tool, n) in tool_occurrences {
            let composite = RateLimiter::composite_key(ctx.api_key, tool);
            self.rate_limiter.record_n(&composite, n as usize);
        }
        if global_limit > 0 {
            self.rate_limiter.record_n(ctx.api_key, calls.len());
        }

        let mut decisions = Vec::with_capacity(calls.len());
        for (call, price) in calls.iter().zip(prices.iter()) {
            let decision = if shadow {
                GateDecision::shadow_allow("ok", remaining)
            } else {
                GateDecision::allow(*price, remaining)
            };
            let event = UsageEvent::new(
                ctx.api_key,
                &record.name,
                call.tool,
                if shadow { 0 } else { *price },
                true,
                decision.reason.clone(),
                Some(record.namespace.clone()).filter(|s| !s.is_empty()),
            );
            self.usage_meter.record(event.clone());
            self.observer.read().on_usage_event(&event);
            decisions.push(decision);
        }

        BatchDecision { all_allowed: true, failed_index: None, decisions }
    }

    fn batch_reject(
        &self,
        calls: &[ToolCall],
        reason: DenyReason,
        failed_index: usize,
        remaining: i64,
    ) -> BatchDecision {
        let mut decisions = Vec::with_capacity(calls.len());
        for i in 0..calls.len() {
            let d = if i == failed_index {
                GateDecision::deny(&reason, remaining)
            } else {
                GateDecision::deny(&DenyReason::BatchRejected, remaining)
            };
            decisions.push(d);
        }
        if decisions.is_empty() {
            decisions.push(GateDecision::deny(&reason, remaining));
        }
        BatchDecision { all_allowed: false, failed_index: Some(failed_index), decisions }
    }

    /// Undoes a prior charge: adds credits back, subtracts from
    /// `totalSpent`/`totalCalls` (floored at 0), undoes the quota record,
    /// and emits a refund event with `creditsCharged = -credits`
    /// (spec.md §4.2). A no-op (with a warning event) if the key no longer
    /// exists, per spec.md §7.
    pub async fn refund(&self, api_key: &str, tool: &str, credits: i64) -> bool {
        let result = self.keystore.with_record_mut(api_key, |rec| {
            rec.credits = crate::core::key_record::clamp_input_credits(rec.credits + credits);
            rec.total_spent = (rec.total_spent - credits).max(0);
            rec.total_calls = (rec.total_calls - 1).max(0);
            QuotaTracker::unrecord(rec, credits);
            (rec.name.clone(), rec.credits, rec.namespace.clone())
        });

        match result {
            Ok((key_name, remaining, namespace)) => {
                let event = UsageEvent::new(
                    api_key,
                    &key_name,
                    tool,
                    -credits,
                    true,
                    None,
                    Some(namespace).filter(|s| !s.is_empty()),
                );
                self.usage_meter.record(event.clone());
                self.observer.read().on_usage_event(&event);
                let _ = remaining;
                true
            }
            Err(()) => {
                tracing::warn!(
                    key = %crate::utils::sanitize_for_log(api_key),
                    "refund requested for unknown key"
                );
                false
            }
        }
    }

    /// Stops background workers and flushes one final save. Idempotent.
    pub async fn destroy(&self) {
        if let Err(err) = self.keystore.save().await {
            tracing::error!(error = %err, "final persistence flush failed during shutdown");
        }
    }

    /// Spawns the rate-limiter GC and reservation-expiry sweepers as
    /// background tasks (spec.md §5). Callers hold the returned handles
    /// only to abort them in tests; production code lets them run for the
    /// process lifetime.
    pub fn spawn_background_workers(self: &Arc<Self>) -> Vec<tokio::task::JoinHandle<()>> {
        let mut handles = Vec::new();

        let gate = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                interval.tick().await;
                gate.rate_limiter.gc();
            }
        }));

        let gate = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                interval.tick().await;
                gate.reservations.sweep_expired();
            }
        }));

        handles
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_record::KeyOptions;

    fn gate_with_tool_price(tool: &str, price: i64) -> Gate {
        let mut config = GateConfig::default();
        config.tool_pricing.insert(
            tool.to_string(),
            ToolPricing { credits_per_call: price, ..Default::default() },
        );
        Gate::new(KeyStore::in_memory(), config)
    }

    #[tokio::test]
    async fn basic_charge_scenario() {
        let gate = gate_with_tool_price("search", 5);
        let (key, _) = gate.keystore.create_key("K", 100, KeyOptions::default());

        for _ in 0..2 {
            let ctx = CallContext { api_key: &key, client_ip: None, key_group_pricing: None };
            let call = ToolCall { tool: "search", args: None, scoped_tools: None };
            let decision = gate.evaluate(ctx, call).await;
            assert!(decision.allowed);
            assert_eq!(decision.credits_charged, 5);
        }

        let record = gate.keystore.peek_key(&key).unwrap();
        assert_eq!(record.credits, 90);
        assert_eq!(record.total_calls, 2);
        assert_eq!(record.total_spent, 10);
    }

    #[tokio::test]
    async fn batch_atomicity_under_insufficient_credits() {
        let mut config = GateConfig::default();
        config.tool_pricing.insert("search".into(), ToolPricing { credits_per_call: 5, ..Default::default() });
        config.tool_pricing.insert("translate".into(), ToolPricing { credits_per_call: 3, ..Default::default() });
        let gate = Gate::new(KeyStore::in_memory(), config);
        let (key, _) = gate.keystore.create_key("K", 10, KeyOptions::default());

        let ctx = CallContext { api_key: &key, client_ip: None, key_group_pricing: None };
        let calls = vec![
            ToolCall { tool: "search", args: None, scoped_tools: None },
            ToolCall { tool: "translate", args: None, scoped_tools: None },
            ToolCall { tool: "search", args: None, scoped_tools: None },
        ];
        let result = gate.evaluate_batch(ctx, calls).await;

        assert!(!result.all_allowed);
        let reason = result.decisions[result.failed_index.unwrap()].reason.clone().unwrap();
        assert!(reason.contains("insufficient_credits"));
        assert!(reason.contains("need 13, have 10"));
        assert_eq!(gate.keystore.peek_key(&key).unwrap().credits, 10);
        assert_eq!(gate.usage_meter.len(), 0);
    }

    #[tokio::test]
    async fn per_tool_rate_limit_batch_aware() {
        let gate = gate_with_tool_price("limited", 0);
        {
            let mut config = gate.config.write();
            config.tool_pricing.get_mut("limited").unwrap().rate_limit_per_min = 2;
        }
        let (key, _) = gate.keystore.create_key("K", 1000, KeyOptions::default());

        let ctx = CallContext { api_key: &key, client_ip: None, key_group_pricing: None };
        let calls = vec![
            ToolCall { tool: "limited", args: None, scoped_tools: None },
            ToolCall { tool: "limited", args: None, scoped_tools: None },
            ToolCall { tool: "limited", args: None, scoped_tools: None },
        ];
        let result = gate.evaluate_batch(ctx, calls).await;

        assert!(!result.all_allowed);
        assert_eq!(result.failed_index, Some(2));
        let composite = RateLimiter::composite_key(&key, "limited");
        assert_eq!(gate.rate_limiter.current_count(&composite), 0);
    }

    #[tokio::test]
    async fn refund_undoes_charge() {
        let gate = gate_with_tool_price("premium", 5);
        let (key, _) = gate.keystore.create_key("K", 100, KeyOptions::default());

        let ctx = CallContext { api_key: &key, client_ip: None, key_group_pricing: None };
        let call = ToolCall { tool: "premium", args: None, scoped_tools: None };
        gate.evaluate(ctx, call).await;
        assert_eq!(gate.keystore.peek_key(&key).unwrap().credits, 95);

        gate.refund(&key, "premium", 5).await;
        let record = gate.keystore.peek_key(&key).unwrap();
        assert_eq!(record.credits, 100);
        assert_eq!(record.total_spent, 0);
        assert_eq!(record.total_calls, 0);
    }

    #[tokio::test]
    async fn ip_allowlist_cidr_enforced() {
        let gate = gate_with_tool_price("search", 1);
        let opts = KeyOptions { ip_allowlist: vec!["10.0.0.0/8".into()], ..Default::default() };
        let (key, _) = gate.keystore.create_key("K", 100, opts);

        let ctx = CallContext {
            api_key: &key,
            client_ip: Some("10.50.25.100".parse().unwrap()),
            key_group_pricing: None,
        };
        let call = ToolCall { tool: "search", args: None, scoped_tools: None };
        assert!(gate.evaluate(ctx, call).await.allowed);

        let ctx = CallContext {
            api_key: &key,
            client_ip: Some("11.0.0.1".parse().unwrap()),
            key_group_pricing: None,
        };
        let call = ToolCall { tool: "search", args: None, scoped_tools: None };
        let decision = gate.evaluate(ctx, call).await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("ip_not_allowed"));
    }

    #[tokio::test]
    async fn shadow_mode_allows_but_tags_reason() {
        let mut config = GateConfig::default();
        config.shadow_mode = true;
        let gate = Gate::new(KeyStore::in_memory(), config);
        let (key, _) = gate.keystore.create_key("K", 0, KeyOptions::default());

        let ctx = CallContext { api_key: &key, client_ip: None, key_group_pricing: None };
        let call = ToolCall { tool: "anything", args: None, scoped_tools: None };
        let decision = gate.evaluate(ctx, call).await;
        assert!(decision.allowed);
        assert!(decision.reason.unwrap().starts_with("shadow:"));
    }

    #[tokio::test]
    async fn shadow_mode_does_not_deduct_credits_on_a_would_be_allow() {
        let mut tool_pricing = HashMap::new();
        tool_pricing.insert("search".to_string(), ToolPricing { credits_per_call: 10, ..Default::default() });
        let config = GateConfig { tool_pricing, shadow_mode: true, ..Default::default() };
        let gate = Gate::new(KeyStore::in_memory(), config);
        let (key, _) = gate.keystore.create_key("K", 100, KeyOptions::default());

        let ctx = CallContext { api_key: &key, client_ip: None, key_group_pricing: None };
        let call = ToolCall { tool: "search", args: None, scoped_tools: None };
        let decision = gate.evaluate(ctx, call).await;

        assert!(decision.allowed);
        assert_eq!(decision.credits_charged, 0);
        assert_eq!(decision.remaining_credits, 100);

        let record = gate.keystore.peek_key(&key).unwrap();
        assert_eq!(record.credits, 100);
        assert_eq!(record.total_calls, 0);
    }

    #[tokio::test]
    async fn concurrency_limit_denies_and_releases_after_evaluate_returns() {
        let config = GateConfig { concurrency_key_limit: 1, ..Default::default() };
        let gate = Gate::new(KeyStore::in_memory(), config);
        let (key, _) = gate.keystore.create_key("K", 100, KeyOptions::default());

        let held_guard = gate.concurrency.acquire_guard(&key, "search").unwrap();

        let ctx = CallContext { api_key: &key, client_ip: None, key_group_pricing: None };
        let call = ToolCall { tool: "search", args: None, scoped_tools: None };
        let decision = gate.evaluate(ctx, call).await;
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("concurrency_limit_exceeded"));

        drop(held_guard);

        let ctx = CallContext { api_key: &key, client_ip: None, key_group_pricing: None };
        let call = ToolCall { tool: "search", args: None, scoped_tools: None };
        let decision = gate.evaluate(ctx, call).await;
        assert!(decision.allowed);

        let snapshot = gate.concurrency.snapshot();
        assert_eq!(snapshot.total_inflight, 0);
    }
}
