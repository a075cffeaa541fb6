//! Bounded in-memory usage event ring plus aggregate statistics
//! (spec.md §4.5).

use crate::core::decision::UsageEvent;
use chrono::{DateTime, Timelike, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};

pub const DEFAULT_CAPACITY: usize = 10_000;

pub struct UsageMeter {
    events: Mutex<VecDeque<UsageEvent>>,
    capacity: usize,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct UsageSummary {
    pub total_calls: u64,
    pub total_credits_charged: i64,
    pub allowed_count: u64,
    pub denied_count: u64,
    pub unique_keys: u64,
    pub per_tool: HashMap<String, ToolBreakdown>,
    /// UTC hour (0-23) with the highest call count, if any events matched.
    pub peak_hour: Option<u32>,
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ToolBreakdown {
    pub calls: u64,
    pub credits_charged: i64,
    pub allowed: u64,
    pub denied: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SummaryFilter {
    pub since: Option<DateTime<Utc>>,
    pub namespace: Option<String>,
}

impl UsageMeter {
    pub fn new(capacity: usize) -> Self {
        Self { events: Mutex::new(VecDeque::with_capacity(capacity.min(1024))), capacity }
    }

    pub fn record(&self, event: UsageEvent) {
        let mut events = self.events.lock();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get_summary(&self, filter: &SummaryFilter) -> UsageSummary {
        let events = self.events.lock();
        let mut summary = UsageSummary::default();
        let mut keys = std::collections::HashSet::new();
        let mut hour_counts: HashMap<u32, u64> = HashMap::new();

        for event in events.iter() {
            if let Some(since) = filter.since {
                if event.timestamp < since {
                    continue;
                }
            }
            if let Some(ns) = &filter.namespace {
                if event.namespace.as_deref() != Some(ns.as_str()) {
                    continue;
                }
            }

            summary.total_calls += 1;
            summary.total_credits_charged += event.credits_charged;
            if event.allowed {
                summary.allowed_count += 1;
            } else {
                summary.denied_count += 1;
            }
            keys.insert(event.api_key.clone());

            let entry = summary.per_tool.entry(event.tool.clone()).or_default();
            entry.calls += 1;
            entry.credits_charged += event.credits_charged;
            if event.allowed {
                entry.allowed += 1;
            } else {
                entry.denied += 1;
            }

            *hour_counts.entry(event.timestamp.hour()).or_insert(0) += 1;
        }

        summary.unique_keys = keys.len() as u64;
        summary.peak_hour = hour_counts.into_iter().max_by_key(|(_, c)| *c).map(|(h, _)| h);
        summary
    }

    /// Serializes the buffered events as CSV; the API key column is
    /// already masked by `UsageEvent::new` (spec.md §4.5).
    pub fn to_csv(&self) -> Result<String, csv::Error> {
        let events = self.events.lock();
        let mut writer = csv::Writer::from_writer(vec![]);
        writer.write_record([
            "timestamp",
            "api_key",
            "key_name",
            "tool",
            "credits_charged",
            "allowed",
            "deny_reason",
            "namespace",
        ])?;
        for event in events.iter() {
            writer.write_record([
                event.timestamp.to_rfc3339(),
                event.api_key.clone(),
                event.key_name.clone(),
                event.tool.clone(),
                event.credits_charged.to_string(),
                event.allowed.to_string(),
                event.deny_reason.clone().unwrap_or_default(),
                event.namespace.clone().unwrap_or_default(),
            ])?;
        }
        let bytes = writer.into_inner().map_err(|e| e.into_error())?;
        Ok(String::from_utf8(bytes).expect("csv writer only emits valid utf-8"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(tool: &str, allowed: bool, credits: i64) -> UsageEvent {
        UsageEvent::new("gw_testkey123", "test", tool, credits, allowed, None, None)
    }

    #[test]
    fn ring_buffer_drops_oldest_past_capacity() {
        let meter = UsageMeter::new(2);
        meter.record(event("a", true, 1));
        meter.record(event("b", true, 1));
        meter.record(event("c", true, 1));
        assert_eq!(meter.len(), 2);
    }

    #[test]
    fn summary_aggregates_per_tool() {
        let meter = UsageMeter::new(DEFAULT_CAPACITY);
        meter.record(event("search", true, 5));
        meter.record(event("search", false, 0));
        meter.record(event("translate", true, 3));

        let summary = meter.get_summary(&SummaryFilter::default());
        assert_eq!(summary.total_calls, 3);
        assert_eq!(summary.allowed_count, 2);
        assert_eq!(summary.denied_count, 1);
        assert_eq!(summary.per_tool["search"].calls, 2);
        assert_eq!(summary.per_tool["translate"].credits_charged, 3);
    }

    #[test]
    fn csv_masks_key_and_includes_header() {
        let meter = UsageMeter::new(DEFAULT_CAPACITY);
        meter.record(event("search", true, 5));
        let csv = meter.to_csv().unwrap();
        assert!(csv.starts_with("timestamp,api_key"));
        assert!(csv.contains("gw_testkey1..."));
        assert!(!csv.contains("gw_testkey123,"));
    }
}
