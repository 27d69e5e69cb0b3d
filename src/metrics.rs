//! Engine counters and CLI-friendly display formatting.
//!
//! Counters are plain atomics shared through [`crate::api::EngineContext`];
//! [`EngineMetrics::snapshot`] produces a consistent-enough copy for display.

use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters, updated by placement, retrieval and audit.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    pub shards_uploaded: AtomicU64,
    pub bytes_uploaded: AtomicU64,
    pub shards_fetched: AtomicU64,
    pub bytes_fetched: AtomicU64,
    pub transfer_retries: AtomicU64,
    pub integrity_violations: AtomicU64,
    pub audits_total: AtomicU64,
    pub audits_passed: AtomicU64,
    pub audits_failed: AtomicU64,
    pub audits_unreachable: AtomicU64,
    pub repairs: AtomicU64,
    pub repair_failures: AtomicU64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn add(counter: &AtomicU64, amount: u64) {
        counter.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            shards_uploaded: get(&self.shards_uploaded),
            bytes_uploaded: get(&self.bytes_uploaded),
            shards_fetched: get(&self.shards_fetched),
            bytes_fetched: get(&self.bytes_fetched),
            transfer_retries: get(&self.transfer_retries),
            integrity_violations: get(&self.integrity_violations),
            audits_total: get(&self.audits_total),
            audits_passed: get(&self.audits_passed),
            audits_failed: get(&self.audits_failed),
            audits_unreachable: get(&self.audits_unreachable),
            repairs: get(&self.repairs),
            repair_failures: get(&self.repair_failures),
        }
    }
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub shards_uploaded: u64,
    pub bytes_uploaded: u64,
    pub shards_fetched: u64,
    pub bytes_fetched: u64,
    pub transfer_retries: u64,
    pub integrity_violations: u64,
    pub audits_total: u64,
    pub audits_passed: u64,
    pub audits_failed: u64,
    pub audits_unreachable: u64,
    pub repairs: u64,
    pub repair_failures: u64,
}

impl MetricsSnapshot {
    /// Fraction of audits that verified, or 1.0 before any audit ran.
    pub fn audit_success_rate(&self) -> f64 {
        if self.audits_total == 0 {
            1.0
        } else {
            self.audits_passed as f64 / self.audits_total as f64
        }
    }

    /// Format metrics as a table for CLI output
    pub fn format_table(&self) -> String {
        let rows = [
            ("Shards uploaded", self.shards_uploaded.to_string()),
            ("Bytes uploaded", format_size(self.bytes_uploaded)),
            ("Shards fetched", self.shards_fetched.to_string()),
            ("Bytes fetched", format_size(self.bytes_fetched)),
            ("Transfer retries", self.transfer_retries.to_string()),
            ("Integrity violations", self.integrity_violations.to_string()),
            ("Audits (total)", self.audits_total.to_string()),
            ("  passed", self.audits_passed.to_string()),
            ("  failed", self.audits_failed.to_string()),
            ("  unreachable", self.audits_unreachable.to_string()),
            (
                "Audit success rate",
                format!("{:.1}%", self.audit_success_rate() * 100.0),
            ),
            ("Repairs", self.repairs.to_string()),
            ("Repair failures", self.repair_failures.to_string()),
        ];

        let mut output = String::new();
        output.push_str("  ┌────────────────────────┬────────────────┐\n");
        output.push_str("  │ Metric                 │ Value          │\n");
        output.push_str("  ├────────────────────────┼────────────────┤\n");
        for (label, value) in rows {
            output.push_str(&format!("  │ {:<22} │ {:>14} │\n", label, value));
        }
        output.push_str("  └────────────────────────┴────────────────┘\n");
        output
    }
}

/// Format byte size to human-readable string
pub fn format_size(bytes: u64) -> String {
    if bytes >= 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else if bytes >= 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{} B", bytes)
    }
}
