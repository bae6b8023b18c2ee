//! Ingestion counters.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use strum::{EnumCount, IntoEnumIterator};

use crate::models::types::RejectReason;

#[derive(Debug)]
pub struct IngestStats {
    accepted: AtomicU64,
    rejected: [AtomicU64; RejectReason::COUNT],
    shed: AtomicU64,
    processed: AtomicU64,
    evicted: AtomicU64,
}

impl Default for IngestStats {
    fn default() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            rejected: std::array::from_fn(|_| AtomicU64::new(0)),
            shed: AtomicU64::new(0),
            processed: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }
}

impl IngestStats {
    pub(crate) fn observe_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_rejected(&self, reason: RejectReason) {
        self.rejected[reason as usize].fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_shed(&self) {
        self.shed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_processed(&self) {
        self.processed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn observe_evicted(&self, count: usize) {
        self.evicted.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn rejected(&self, reason: RejectReason) -> u64 {
        self.rejected[reason as usize].load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            rejected: RejectReason::iter()
                .map(|reason| (reason.code(), self.rejected(reason)))
                .filter(|(_, count)| *count > 0)
                .collect(),
            shed: self.shed.load(Ordering::Relaxed),
            processed: self.processed.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`IngestStats`]. Rejections are keyed by reason
/// code and only list reasons seen at least once.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub rejected: BTreeMap<&'static str, u64>,
    pub shed: u64,
    pub processed: u64,
    pub evicted: u64,
}

impl StatsSnapshot {
    pub fn total_rejected(&self) -> u64 {
        self.rejected.values().sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_counts_by_reason() {
        let stats = IngestStats::default();
        stats.observe_accepted();
        stats.observe_accepted();
        stats.observe_rejected(RejectReason::TooOld);
        stats.observe_rejected(RejectReason::Duplicate);
        stats.observe_rejected(RejectReason::Duplicate);
        stats.observe_shed();
        stats.observe_evicted(3);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.accepted, 2);
        assert_eq!(snapshot.rejected.get("too_old"), Some(&1));
        assert_eq!(snapshot.rejected.get("duplicate"), Some(&2));
        assert!(!snapshot.rejected.contains_key("out_of_order"));
        assert_eq!(snapshot.total_rejected(), 3);
        assert_eq!(snapshot.shed, 1);
        assert_eq!(snapshot.evicted, 3);
        assert_eq!(snapshot.processed, 0);
    }
}
