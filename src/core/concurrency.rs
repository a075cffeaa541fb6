//! Per-key and per-tool inflight call caps (spec.md §4.7).

use dashmap::DashMap;
use serde::Serialize;

pub struct ConcurrencyLimiter {
    by_key: DashMap<String, u32>,
    by_tool: DashMap<String, u32>,
    by_key_tool: DashMap<(String, String), u32>,
    key_limit: u32,
    tool_limit: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct AcquireDenial {
    pub reason: &'static str,
    pub current_inflight: u32,
    pub limit: u32,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConcurrencySnapshot {
    pub by_key: std::collections::HashMap<String, u32>,
    pub by_tool: std::collections::HashMap<String, u32>,
    pub by_key_tool: std::collections::HashMap<String, u32>,
    pub total_inflight: u32,
}

impl ConcurrencyLimiter {
    pub fn new(key_limit: u32, tool_limit: u32) -> Self {
        Self {
            by_key: DashMap::new(),
            by_tool: DashMap::new(),
            by_key_tool: DashMap::new(),
            key_limit,
            tool_limit,
        }
    }

    /// Increments both counters iff both are strictly below their caps. A
    /// limit of `0` disables that dimension entirely.
    pub fn acquire(&self, key: &str, tool: &str) -> Result<(), AcquireDenial> {
        if self.key_limit > 0 {
            let current = self.by_key.get(key).map(|v| *v).unwrap_or(0);
            if current >= self.key_limit {
                return Err(AcquireDenial {
                    reason: "key_concurrency_limit",
                    current_inflight: current,
                    limit: self.key_limit,
                });
            }
        }
        if self.tool_limit > 0 {
            let current = self.by_tool.get(tool).map(|v| *v).unwrap_or(0);
            if current >= self.tool_limit {
                return Err(AcquireDenial {
                    reason: "tool_concurrency_limit",
                    current_inflight: current,
                    limit: self.tool_limit,
                });
            }
        }

        if self.key_limit > 0 {
            *self.by_key.entry(key.to_string()).or_insert(0) += 1;
        }
        if self.tool_limit > 0 {
            *self.by_tool.entry(tool.to_string()).or_insert(0) += 1;
        }
        *self.by_key_tool.entry((key.to_string(), tool.to_string())).or_insert(0) += 1;
        Ok(())
    }

    pub fn release(&self, key: &str, tool: &str) {
        if let Some(mut count) = self.by_key.get_mut(key) {
            *count = count.saturating_sub(1);
        }
        if let Some(mut count) = self.by_tool.get_mut(tool) {
            *count = count.saturating_sub(1);
        }
        if let Some(mut count) = self.by_key_tool.get_mut(&(key.to_string(), tool.to_string())) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn snapshot(&self) -> ConcurrencySnapshot {
        let by_key: std::collections::HashMap<String, u32> =
            self.by_key.iter().map(|e| (e.key().clone(), *e.value())).collect();
        let by_tool: std::collections::HashMap<String, u32> =
            self.by_tool.iter().map(|e| (e.key().clone(), *e.value())).collect();
        let by_key_tool: std::collections::HashMap<String, u32> = self
            .by_key_tool
            .iter()
            .map(|e| (format!("{}:{}", e.key().0, e.key().1), *e.value()))
            .collect();
        let total_inflight = by_key_tool.values().sum();
        ConcurrencySnapshot { by_key, by_tool, by_key_tool, total_inflight }
    }
}

/// RAII handle returned by [`ConcurrencyLimiter::acquire_guard`]: releases
/// the held slot when dropped, so a caller never has to remember to call
/// `release` on every early-return path.
pub struct ConcurrencyGuard<'a> {
    limiter: &'a ConcurrencyLimiter,
    key: String,
    tool: String,
}

impl Drop for ConcurrencyGuard<'_> {
    fn drop(&mut self) {
        self.limiter.release(&self.key, &self.tool);
    }
}

impl ConcurrencyLimiter {
    pub fn acquire_guard<'a>(
        &'a self,
        key: &str,
        tool: &str,
    ) -> Result<ConcurrencyGuard<'a>, AcquireDenial> {
        self.acquire(key, tool)?;
        Ok(ConcurrencyGuard { limiter: self, key: key.to_string(), tool: tool.to_string() })
    }
}
