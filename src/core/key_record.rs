//! `ApiKeyRecord` and related value types (spec.md §3).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

/// Hard ceiling clamped on every admin-supplied credit/quota/spending value.
pub const MAX_CREDITS: i64 = 1_000_000_000;
pub const MAX_AUTO_TOPUP_AMOUNT: i64 = 100_000_000;
pub const MAX_TAGS: usize = 50;
pub const MAX_TAG_LEN: usize = 100;

fn clamp_credits(n: i64) -> i64 {
    n.clamp(0, MAX_CREDITS)
}

/// Per-key auto-topup policy: when credits drop below `threshold`, add
/// `amount`, at most `max_daily` times per UTC day (`0` = unlimited).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AutoTopup {
    pub threshold: i64,
    pub amount: i64,
    pub max_daily: u32,
}

/// Per-key daily/monthly call and credit limits (distinct from the global
/// quota the `Gate` is constructed with).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct KeyQuota {
    pub daily_calls: i64,
    pub monthly_calls: i64,
    pub daily_credits: i64,
    pub monthly_credits: i64,
}

/// Options accepted by `KeyStore::create_key` / `import_key`.
#[derive(Debug, Clone, Default)]
pub struct KeyOptions {
    pub spending_limit: i64,
    pub allowed_tools: HashSet<String>,
    pub denied_tools: HashSet<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub ip_allowlist: Vec<String>,
    pub tags: HashMap<String, String>,
    pub namespace: String,
    pub quota: Option<KeyQuota>,
    pub auto_topup: Option<AutoTopup>,
}

/// The authoritative record for one API key (spec.md §3).
///
/// Invariants upheld by `KeyStore`, never by the struct itself: `credits >=
/// 0`; `total_spent >= 0`; `total_calls >= 0`; `credits <= MAX_CREDITS`;
/// `spending_limit > 0 => total_spent <= spending_limit` immediately after
/// an allowed call; tag/IP/tool lists never exceed configured maxima.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub name: String,
    pub credits: i64,
    pub total_spent: i64,
    pub total_calls: i64,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub suspended: bool,
    #[serde(default)]
    pub spending_limit: i64,
    #[serde(default)]
    pub allowed_tools: HashSet<String>,
    #[serde(default)]
    pub denied_tools: HashSet<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub ip_allowlist: Vec<String>,
    #[serde(default)]
    pub tags: HashMap<String, String>,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub quota: Option<KeyQuota>,
    #[serde(default)]
    pub quota_daily_calls: i64,
    #[serde(default)]
    pub quota_monthly_calls: i64,
    #[serde(default)]
    pub quota_daily_credits: i64,
    #[serde(default)]
    pub quota_monthly_credits: i64,
    /// YYYY-MM-DD (UTC).
    #[serde(default)]
    pub quota_last_reset_day: String,
    /// YYYY-MM (UTC).
    #[serde(default)]
    pub quota_last_reset_month: String,
    #[serde(default)]
    pub auto_topup: Option<AutoTopup>,
    #[serde(default)]
    pub auto_topup_today_count: u32,
    #[serde(default)]
    pub auto_topup_last_reset_day: String,
}

fn default_true() -> bool {
    true
}

impl ApiKeyRecord {
    pub fn new(name: String, credits: i64, opts: KeyOptions) -> Self {
        let now = Utc::now();
        let mut tags = opts.tags;
        truncate_tags(&mut tags);

        Self {
            name,
            credits: clamp_credits(credits),
            total_spent: 0,
            total_calls: 0,
            created_at: now,
            last_used_at: None,
            active: true,
            suspended: false,
            spending_limit: clamp_credits(opts.spending_limit),
            allowed_tools: opts.allowed_tools,
            denied_tools: opts.denied_tools,
            expires_at: opts.expires_at,
            ip_allowlist: opts.ip_allowlist,
            tags,
            namespace: opts.namespace,
            quota: opts.quota,
            quota_daily_calls: 0,
            quota_monthly_calls: 0,
            quota_daily_credits: 0,
            quota_monthly_credits: 0,
            quota_last_reset_day: today_utc(),
            quota_last_reset_month: month_utc(),
            auto_topup: opts.auto_topup,
            auto_topup_today_count: 0,
            auto_topup_last_reset_day: today_utc(),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => Utc::now() >= exp,
            None => false,
        }
    }

    /// Non-expired, active, non-suspended: the gate rejects everything
    /// else at step 2 of the check order.
    pub fn is_usable(&self) -> bool {
        self.active && !self.suspended && !self.is_expired()
    }

    pub fn held_available(&self, held: i64) -> i64 {
        (self.credits - held).max(0)
    }
}

pub fn today_utc() -> String {
    Utc::now().format("%Y-%m-%d").to_string()
}

pub fn month_utc() -> String {
    Utc::now().format("%Y-%m").to_string()
}

/// Truncates `s` to at most `max_len` bytes, rounding down to the nearest
/// char boundary so it never splits a multibyte UTF-8 sequence.
fn truncate_str_on_char_boundary(s: &mut String, max_len: usize) {
    if s.len() <= max_len {
        return;
    }
    let mut boundary = max_len;
    while !s.is_char_boundary(boundary) {
        boundary -= 1;
    }
    s.truncate(boundary);
}

fn truncate_tags(tags: &mut HashMap<String, String>) {
    if tags.len() > MAX_TAGS {
        let keep: Vec<String> = tags.keys().take(MAX_TAGS).cloned().collect();
        tags.retain(|k, _| keep.contains(k));
    }
    let renamed: Vec<(String, String)> = tags
        .iter()
        .filter(|(k, _)| k.len() > MAX_TAG_LEN)
        .map(|(k, v)| {
            let mut truncated_key = k.clone();
            truncate_str_on_char_boundary(&mut truncated_key, MAX_TAG_LEN);
            (k.clone(), truncated_key)
        })
        .collect();
    for (old_key, new_key) in renamed {
        if let Some(v) = tags.remove(&old_key) {
            tags.insert(new_key, v);
        }
    }
    for v in tags.values_mut() {
        truncate_str_on_char_boundary(v, MAX_TAG_LEN);
    }
}

pub fn clamp_input_credits(n: i64) -> i64 {
    clamp_credits(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_key_clamps_credits() {
        let rec = ApiKeyRecord::new("k".into(), MAX_CREDITS + 1000, KeyOptions::default());
        assert_eq!(rec.credits, MAX_CREDITS);
    }

    #[test]
    fn tags_truncated_not_rejected() {
        let mut tags = HashMap::new();
        tags.insert("note".to_string(), "x".repeat(500));
        let opts = KeyOptions { tags, ..Default::default() };
        let rec = ApiKeyRecord::new("k".into(), 10, opts);
        assert_eq!(rec.tags.get("note").unwrap().len(), MAX_TAG_LEN);
    }

    #[test]
    fn multibyte_tag_value_truncates_without_panic() {
        let mut tags = HashMap::new();
        // "é" is 2 bytes; repeating it 60 times lands byte 100 mid-character.
        tags.insert("note".to_string(), "é".repeat(60));
        let opts = KeyOptions { tags, ..Default::default() };
        let rec = ApiKeyRecord::new("k".into(), 10, opts);
        let truncated = rec.tags.get("note").unwrap();
        assert!(truncated.len() <= MAX_TAG_LEN);
        assert!(truncated.is_char_boundary(truncated.len()));
    }

    #[test]
    fn overlong_tag_key_is_truncated() {
        let mut tags = HashMap::new();
        tags.insert("k".repeat(500), "v".to_string());
        let opts = KeyOptions { tags, ..Default::default() };
        let rec = ApiKeyRecord::new("k".into(), 10, opts);
        assert_eq!(rec.tags.len(), 1);
        let (key, _) = rec.tags.iter().next().unwrap();
        assert_eq!(key.len(), MAX_TAG_LEN);
    }

    #[test]
    fn expiry_detection() {
        let mut rec = ApiKeyRecord::new("k".into(), 10, KeyOptions::default());
        assert!(!rec.is_expired());
        rec.expires_at = Some(Utc::now() - chrono::Duration::seconds(1));
        assert!(rec.is_expired());
        assert!(!rec.is_usable());
    }
}
