//! KeyStore: the single authoritative registry of API-key records
//! (spec.md §4.1).
//!
//! Each record is protected by its own `parking_lot::RwLock` so that a
//! credit mutation on one key never blocks a reader of another. The
//! top-level map is a `DashMap`, giving lock-free-ish concurrent access to
//! distinct shards. `creation_order` preserves insertion order for
//! persistence (`save()` writes `[key, record]` pairs in the order keys
//! were created, matching spec.md §4.8).

pub mod persistence;

use crate::core::key_record::{clamp_input_credits, today_utc, ApiKeyRecord, KeyOptions};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rand::RngCore;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

pub type SharedRecord = Arc<RwLock<ApiKeyRecord>>;

pub struct KeyStore {
    records: DashMap<String, SharedRecord>,
    /// Alias -> canonical key, for rotated/aliased keys (spec.md §4.1).
    aliases: DashMap<String, String>,
    creation_order: Mutex<Vec<String>>,
    path: Option<PathBuf>,
    save_lock: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyLookupError {
    NotFound,
    Expired,
    Revoked,
    Suspended,
}

impl KeyStore {
    pub fn new(path: Option<PathBuf>) -> Self {
        Self {
            records: DashMap::new(),
            aliases: DashMap::new(),
            creation_order: Mutex::new(Vec::new()),
            path,
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// In-memory-only store for tests and isolated evaluation, per
    /// spec.md §4.1 "callers may opt into in-memory-only mode".
    pub fn in_memory() -> Self {
        Self::new(None)
    }

    fn generate_key() -> String {
        let mut bytes = [0u8; 24]; // 192 bits, well over the 128-bit floor
        rand::thread_rng().fill_bytes(&mut bytes);
        format!("gw_{}", hex::encode(bytes))
    }

    pub fn create_key(&self, name: &str, credits: i64, opts: KeyOptions) -> (String, ApiKeyRecord) {
        loop {
            let key = Self::generate_key();
            if !self.records.contains_key(&key) {
                let record = ApiKeyRecord::new(name.to_string(), credits, opts);
                self.records.insert(key.clone(), Arc::new(RwLock::new(record.clone())));
                self.creation_order.lock().push(key.clone());
                self.schedule_save();
                return (key, record);
            }
        }
    }

    /// Fails if `key` is already present (spec.md §4.1).
    pub fn import_key(
        &self,
        key: &str,
        name: &str,
        credits: i64,
        opts: KeyOptions,
    ) -> Result<ApiKeyRecord, ()> {
        if self.records.contains_key(key) {
            return Err(());
        }
        let record = ApiKeyRecord::new(name.to_string(), credits, opts);
        self.records.insert(key.to_string(), Arc::new(RwLock::new(record.clone())));
        self.creation_order.lock().push(key.to_string());
        self.schedule_save();
        Ok(record)
    }

    fn resolve(&self, key: &str) -> Option<String> {
        if self.records.contains_key(key) {
            return Some(key.to_string());
        }
        self.aliases.get(key).map(|v| v.clone())
    }

    pub fn add_alias(&self, alias: &str, canonical: &str) {
        self.aliases.insert(alias.to_string(), canonical.to_string());
    }

    pub fn get_shared(&self, key: &str) -> Option<SharedRecord> {
        let canonical = self.resolve(key)?;
        self.records.get(&canonical).map(|r| r.clone())
    }

    /// Returns a non-expired, non-revoked, non-suspended record snapshot,
    /// updating `last_used_at`. Distinguishes "never existed" from
    /// "existed but expired/revoked/suspended" for error messaging
    /// (spec.md §4.1, §7).
    pub fn get_key(&self, key: &str) -> Result<ApiKeyRecord, KeyLookupError> {
        let shared = self.get_shared(key).ok_or(KeyLookupError::NotFound)?;
        let mut guard = shared.write();
        if guard.is_expired() {
            return Err(KeyLookupError::Expired);
        }
        if !guard.active {
            return Err(KeyLookupError::Revoked);
        }
        if guard.suspended {
            return Err(KeyLookupError::Suspended);
        }
        guard.last_used_at = Some(chrono::Utc::now());
        Ok(guard.clone())
    }

    /// Like `get_key` but does not require usability, for admin surfaces
    /// and error-message disambiguation.
    pub fn peek_key(&self, key: &str) -> Option<ApiKeyRecord> {
        let canonical = self.resolve(key)?;
        self.records.get(&canonical).map(|r| r.read().clone())
    }

    pub fn is_expired(&self, key: &str) -> bool {
        self.peek_key(key).map(|r| r.is_expired()).unwrap_or(false)
    }

    pub fn exists(&self, key: &str) -> bool {
        self.resolve(key).is_some()
    }

    pub fn has_credits(&self, key: &str, n: i64) -> bool {
        self.peek_key(key).map(|r| r.credits >= n).unwrap_or(false)
    }

    /// Atomic with respect to `has_credits`: the caller must hold the
    /// record's write lock across "check then deduct". Use
    /// [`KeyStore::with_record_mut`] for that; this method is a
    /// convenience for callers (e.g. refunds, admin credit grants) that
    /// only need a single mutation.
    pub fn deduct_credits(&self, key: &str, n: i64) -> Result<i64, ()> {
        let shared = self.get_shared(key).ok_or(())?;
        let mut guard = shared.write();
        let n = clamp_input_credits(n);
        if guard.credits < n {
            return Err(());
        }
        guard.credits -= n;
        drop(guard);
        self.schedule_save();
        let credits = shared.read().credits;
        Ok(credits)
    }

    pub fn add_credits(&self, key: &str, n: i64) -> Result<i64, ()> {
        let shared = self.get_shared(key).ok_or(())?;
        let mut guard = shared.write();
        let n = clamp_input_credits(n);
        guard.credits = clamp_input_credits(guard.credits + n);
        drop(guard);
        self.schedule_save();
        let credits = shared.read().credits;
        Ok(credits)
    }

    /// Runs `f` under the record's single write lock, for call sites that
    /// must perform several checks-then-mutations atomically (the `Gate`'s
    /// evaluate sequence, spec.md §5).
    pub fn with_record_mut<T>(
        &self,
        key: &str,
        f: impl FnOnce(&mut ApiKeyRecord) -> T,
    ) -> Result<T, ()> {
        let shared = self.get_shared(key).ok_or(())?;
        let mut guard = shared.write();
        let result = f(&mut guard);
        drop(guard);
        self.schedule_save();
        Ok(result)
    }

    pub fn revoke_key(&self, key: &str) -> bool {
        match self.get_shared(key) {
            Some(shared) => {
                shared.write().active = false;
                self.schedule_save();
                true
            }
            None => false,
        }
    }

    pub fn check_ip(&self, key: &str, ip: Option<Ipv4Addr>) -> bool {
        let allowlist = self.peek_key(key).map(|r| r.ip_allowlist).unwrap_or_default();
        crate::utils::ip_match::check_allowlist(&allowlist, ip)
    }

    pub fn reset_quota_if_needed(record: &mut ApiKeyRecord) {
        let today = today_utc();
        if record.quota_last_reset_day != today {
            record.quota_daily_calls = 0;
            record.quota_daily_credits = 0;
            record.quota_last_reset_day = today;
        }
        let month = crate::core::key_record::month_utc();
        if record.quota_last_reset_month != month {
            record.quota_monthly_calls = 0;
            record.quota_monthly_credits = 0;
            record.quota_last_reset_month = month;
        }
        if record.auto_topup_last_reset_day != today_utc() {
            record.auto_topup_today_count = 0;
            record.auto_topup_last_reset_day = today_utc();
        }
    }

    pub fn all_keys(&self) -> Vec<(String, ApiKeyRecord)> {
        self.creation_order
            .lock()
            .iter()
            .filter_map(|k| self.records.get(k).map(|r| (k.clone(), r.read().clone())))
            .collect()
    }

    fn schedule_save(&self) {
        // Debounced persistence (spec.md §9): this implementation saves
        // synchronously-triggered but the actual write is fire-and-forget
        // so the hot path of a single evaluation never waits on disk I/O.
        if self.path.is_some() {
            let snapshot = self.all_keys();
            let path = self.path.clone().unwrap();
            // Best-effort: spawn if inside a tokio runtime, else save inline.
            if tokio::runtime::Handle::try_current().is_ok() {
                tokio::spawn(persistence::save(path, snapshot));
            } else {
                let _ = futures::executor::block_on(persistence::save_sync_caller(path, snapshot));
            }
        }
    }

    /// Explicit, awaited save — used by `Gate::destroy()` to flush the
    /// final state before shutdown (spec.md §5).
    pub async fn save(&self) -> std::io::Result<()> {
        if let Some(path) = self.path.clone() {
            let _guard = self.save_lock.lock().await;
            persistence::save(path, self.all_keys()).await
        } else {
            Ok(())
        }
    }

    /// Loads (or re-loads) state from disk, backfilling defaults for any
    /// records written by an older schema (spec.md §4.1/§8). Corrupt or
    /// missing files log and leave the store empty rather than failing.
    pub async fn load(&self) {
        if let Some(path) = self.path.clone() {
            match persistence::load(&path).await {
                Ok(pairs) => {
                    self.records.clear();
                    self.creation_order.lock().clear();
                    for (key, record) in pairs {
                        self.records.insert(key.clone(), Arc::new(RwLock::new(record)));
                        self.creation_order.lock().push(key);
                    }
                    tracing::info!(count = self.records.len(), "keystore loaded from disk");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "keystore load failed, starting empty");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_and_fetch_key() {
        let store = KeyStore::in_memory();
        let (key, _) = store.create_key("test", 100, KeyOptions::default());
        let record = store.get_key(&key).unwrap();
        assert_eq!(record.credits, 100);
    }

    #[test]
    fn import_fails_on_duplicate() {
        let store = KeyStore::in_memory();
        store.import_key("abc", "first", 10, KeyOptions::default()).unwrap();
        assert!(store.import_key("abc", "second", 10, KeyOptions::default()).is_err());
    }

    #[test]
    fn deduct_credits_is_checked() {
        let store = KeyStore::in_memory();
        let (key, _) = store.create_key("test", 10, KeyOptions::default());
        assert!(store.deduct_credits(&key, 11).is_err());
        assert_eq!(store.deduct_credits(&key, 10).unwrap(), 0);
    }

    #[test]
    fn revoked_key_is_unusable() {
        let store = KeyStore::in_memory();
        let (key, _) = store.create_key("test", 10, KeyOptions::default());
        store.revoke_key(&key);
        assert_eq!(store.get_key(&key), Err(KeyLookupError::Revoked));
    }

    #[test]
    fn ip_allowlist_cidr() {
        let store = KeyStore::in_memory();
        let opts = KeyOptions { ip_allowlist: vec!["10.0.0.0/8".into()], ..Default::default() };
        let (key, _) = store.create_key("test", 10, opts);
        assert!(store.check_ip(&key, Some("10.50.25.100".parse().unwrap())));
        assert!(!store.check_ip(&key, Some("11.0.0.1".parse().unwrap())));
    }
}
