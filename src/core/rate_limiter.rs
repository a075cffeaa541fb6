//! Sliding-window rate limiter (spec.md §4.3).
//!
//! Grounded on the teacher's `middleware/ip_rate_limiter.rs`: a `DashMap`
//! of per-key timestamp windows, pruned lazily on access rather than via a
//! single global sweep. A background GC still runs periodically to drop
//! windows that have gone fully empty, so a population of bursty one-shot
//! keys doesn't grow the map forever.

use dashmap::DashMap;
use std::time::{SystemTime, UNIX_EPOCH};

const WINDOW_MS: i64 = 60_000;

fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before unix epoch")
        .as_millis() as i64
}

pub struct RateLimiter {
    windows: DashMap<String, Vec<i64>>,
    global_limit: std::sync::atomic::AtomicU32,
}

impl RateLimiter {
    pub fn new(global_limit: u32) -> Self {
        Self {
            windows: DashMap::new(),
            global_limit: std::sync::atomic::AtomicU32::new(global_limit),
        }
    }

    pub fn set_global_limit(&self, n: u32) {
        self.global_limit.store(n, std::sync::atomic::Ordering::Relaxed);
    }

    pub fn global_limit(&self) -> u32 {
        self.global_limit.load(std::sync::atomic::Ordering::Relaxed)
    }

    fn prune(window: &mut Vec<i64>, now: i64) {
        window.retain(|&ts| ts >= now - WINDOW_MS);
    }

    /// Checks without recording. `limit == 0` means unlimited.
    pub fn check(&self, key: &str) -> bool {
        self.check_custom(key, self.global_limit())
    }

    pub fn check_custom(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }
        let now = now_ms();
        match self.windows.get_mut(key) {
            Some(mut window) => {
                Self::prune(&mut window, now);
                (window.len() as u32) < limit
            }
            None => true,
        }
    }

    pub fn record(&self, key: &str) {
        self.record_custom(key)
    }

    pub fn record_custom(&self, key: &str) {
        let now = now_ms();
        let mut window = self.windows.entry(key.to_string()).or_default();
        Self::prune(&mut window, now);
        window.push(now);
    }

    /// Atomic check-then-record, the form the gate actually calls so that
    /// two concurrent evaluators targeting the same composite key cannot
    /// both observe room for the last slot (spec.md §5).
    pub fn check_and_record(&self, key: &str, limit: u32) -> bool {
        if limit == 0 {
            return true;
        }
        let now = now_ms();
        let mut window = self.windows.entry(key.to_string()).or_default();
        Self::prune(&mut window, now);
        if (window.len() as u32) < limit {
            window.push(now);
            true
        } else {
            false
        }
    }

    /// Count after pruning, without mutating — used by batch evaluation to
    /// reason about `existingCount + occurrencesInBatch` (spec.md §4.3/§8).
    pub fn current_count(&self, key: &str) -> u32 {
        let now = now_ms();
        match self.windows.get_mut(key) {
            Some(mut window) => {
                Self::prune(&mut window, now);
                window.len() as u32
            }
            None => 0,
        }
    }

    /// Records `n` occurrences at once, for committing a batch's per-tool
    /// counts after all checks pass.
    pub fn record_n(&self, key: &str, n: usize) {
        let now = now_ms();
        let mut window = self.windows.entry(key.to_string()).or_default();
        Self::prune(&mut window, now);
        for _ in 0..n {
            window.push(now);
        }
    }

    pub fn composite_key(api_key: &str, tool: &str) -> String {
        format!("{}:tool:{}", api_key, tool)
    }

    /// Drops windows that are empty after pruning. Intended to run on a
    /// periodic timer (spec.md §5, every 60s).
    pub fn gc(&self) {
        let now = now_ms();
        self.windows.retain(|_, window| {
            Self::prune(window, now);
            !window.is_empty()
        });
    }

    pub fn window_count(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_under_limit_then_denies() {
        let rl = RateLimiter::new(2);
        assert!(rl.check_and_record("k", 2));
        assert!(rl.check_and_record("k", 2));
        assert!(!rl.check_and_record("k", 2));
    }

    #[test]
    fn zero_limit_is_unlimited() {
        let rl = RateLimiter::new(0);
        for _ in 0..100 {
            assert!(rl.check_and_record("k", 0));
        }
    }

    #[test]
    fn composite_key_isolates_tools() {
        let rl = RateLimiter::new(1);
        let a = RateLimiter::composite_key("key1", "search");
        let b = RateLimiter::composite_key("key1", "translate");
        assert!(rl.check_and_record(&a, 1));
        assert!(rl.check_and_record(&b, 1));
        assert!(!rl.check_and_record(&a, 1));
    }

    #[test]
    fn gc_drops_empty_windows() {
        let rl = RateLimiter::new(10);
        rl.record("k");
        assert_eq!(rl.window_count(), 1);
        // Simulate expiry by directly clearing (gc relies on pruning by time).
        rl.windows.get_mut("k").unwrap().clear();
        rl.gc();
        assert_eq!(rl.window_count(), 0);
    }

    #[test]
    fn current_count_reflects_pruned_state() {
        let rl = RateLimiter::new(5);
        rl.record("k");
        rl.record("k");
        assert_eq!(rl.current_count("k"), 2);
    }
}
