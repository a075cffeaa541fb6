//! Daily/monthly call and credit quota enforcement (spec.md §4.4).
//!
//! Counters live inside `ApiKeyRecord`; this module is stateless logic
//! operating on a borrowed `&mut ApiKeyRecord`, matching the spec's note
//! that "KeyStore lends write access via identity of the record pointer" —
//! the caller (the `Gate`) is responsible for holding the record's write
//! lock across check-then-record.

use crate::core::key_record::{month_utc, today_utc, ApiKeyRecord, KeyQuota};
use crate::error::DenyReason;

/// Global quota limits, independent of any one key (spec.md §4.4).
#[derive(Debug, Clone, Default)]
pub struct GlobalQuota {
    pub daily_calls: i64,
    pub monthly_calls: i64,
    pub daily_credits: i64,
    pub monthly_credits: i64,
}

pub struct QuotaTracker;

impl QuotaTracker {
    /// Resets daily/monthly counters on a UTC boundary crossing. Must run
    /// before any check or record so comparisons use fresh counters.
    pub fn reset_if_needed(record: &mut ApiKeyRecord) {
        let today = today_utc();
        if record.quota_last_reset_day != today {
            record.quota_daily_calls = 0;
            record.quota_daily_credits = 0;
            record.quota_last_reset_day = today;
        }
        let month = month_utc();
        if record.quota_last_reset_month != month {
            record.quota_monthly_calls = 0;
            record.quota_monthly_credits = 0;
            record.quota_last_reset_month = month;
        }
    }

    /// Checks one call of `credits` against both the per-key quota (if
    /// configured) and the global quota, in the fixed boundary order
    /// {daily calls, daily credits, monthly calls, monthly credits} ×
    /// {key-quota, global-quota}. Returns the first boundary exceeded.
    pub fn check(
        record: &ApiKeyRecord,
        credits: i64,
        global: &GlobalQuota,
    ) -> Result<(), DenyReason> {
        Self::check_n(record, 1, credits, global)
    }

    /// Aggregate form used by batch evaluation (spec.md §4.4 `checkBatch`).
    pub fn check_n(
        record: &ApiKeyRecord,
        calls: i64,
        credits: i64,
        global: &GlobalQuota,
    ) -> Result<(), DenyReason> {
        let key_quota = record.quota.clone().unwrap_or_default();

        Self::check_boundary(
            record.quota_daily_calls,
            calls,
            key_quota.daily_calls,
            global.daily_calls,
            DenyReason::QuotaDailyCallsExceeded,
        )?;
        Self::check_boundary(
            record.quota_daily_credits,
            credits,
            key_quota.daily_credits,
            global.daily_credits,
            DenyReason::QuotaDailyCreditsExceeded,
        )?;
        Self::check_boundary(
            record.quota_monthly_calls,
            calls,
            key_quota.monthly_calls,
            global.monthly_calls,
            DenyReason::QuotaMonthlyCallsExceeded,
        )?;
        Self::check_boundary(
            record.quota_monthly_credits,
            credits,
            key_quota.monthly_credits,
            global.monthly_credits,
            DenyReason::QuotaMonthlyCreditsExceeded,
        )?;
        Ok(())
    }

    fn check_boundary(
        current: i64,
        delta: i64,
        key_limit: i64,
        global_limit: i64,
        reason: DenyReason,
    ) -> Result<(), DenyReason> {
        if key_limit > 0 && current + delta > key_limit {
            return Err(reason);
        }
        if global_limit > 0 && current + delta > global_limit {
            return Err(reason);
        }
        Ok(())
    }

    pub fn record(record: &mut ApiKeyRecord, credits: i64) {
        Self::record_n(record, 1, credits);
    }

    pub fn record_n(record: &mut ApiKeyRecord, calls: i64, credits: i64) {
        record.quota_daily_calls += calls;
        record.quota_daily_credits += credits;
        record.quota_monthly_calls += calls;
        record.quota_monthly_credits += credits;
    }

    /// Undoes a record on refund, floored at zero (spec.md §4.4).
    pub fn unrecord(record: &mut ApiKeyRecord, credits: i64) {
        record.quota_daily_calls = (record.quota_daily_calls - 1).max(0);
        record.quota_daily_credits = (record.quota_daily_credits - credits).max(0);
        record.quota_monthly_calls = (record.quota_monthly_calls - 1).max(0);
        record.quota_monthly_credits = (record.quota_monthly_credits - credits).max(0);
    }
}

/// Convenience used by admins importing a key with explicit quota limits.
pub fn validated_quota(q: KeyQuota) -> KeyQuota {
    use crate::core::key_record::clamp_input_credits;
    KeyQuota {
        daily_calls: clamp_input_credits(q.daily_calls),
        monthly_calls: clamp_input_credits(q.monthly_calls),
        daily_credits: clamp_input_credits(q.daily_credits),
        monthly_credits: clamp_input_credits(q.monthly_credits),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::key_record::KeyOptions;

    fn rec_with_quota(q: KeyQuota) -> ApiKeyRecord {
        let opts = KeyOptions { quota: Some(q), ..Default::default() };
        ApiKeyRecord::new("k".into(), 1000, opts)
    }

    #[test]
    fn denies_on_key_daily_call_limit() {
        let mut rec = rec_with_quota(KeyQuota { daily_calls: 2, ..Default::default() });
        let global = GlobalQuota::default();
        QuotaTracker::record(&mut rec, 1);
        QuotaTracker::record(&mut rec, 1);
        assert_eq!(
            QuotaTracker::check(&rec, 1, &global),
            Err(DenyReason::QuotaDailyCallsExceeded)
        );
    }

    #[test]
    fn global_quota_also_enforced() {
        let mut rec = rec_with_quota(KeyQuota::default());
        let global = GlobalQuota { daily_credits: 10, ..Default::default() };
        QuotaTracker::record(&mut rec, 8);
        assert_eq!(
            QuotaTracker::check(&rec, 5, &global),
            Err(DenyReason::QuotaDailyCreditsExceeded)
        );
        assert!(QuotaTracker::check(&rec, 2, &global).is_ok());
    }

    #[test]
    fn unrecord_floors_at_zero() {
        let mut rec = rec_with_quota(KeyQuota::default());
        QuotaTracker::record(&mut rec, 3);
        QuotaTracker::unrecord(&mut rec, 10);
        assert_eq!(rec.quota_daily_credits, 0);
        assert_eq!(rec.quota_daily_calls, 0);
    }

    #[test]
    fn boundary_reset_on_day_change() {
        let mut rec = rec_with_quota(KeyQuota::default());
        rec.quota_daily_calls = 5;
        rec.quota_last_reset_day = "2000-01-01".to_string();
        QuotaTracker::reset_if_needed(&mut rec);
        assert_eq!(rec.quota_daily_calls, 0);
    }
}
