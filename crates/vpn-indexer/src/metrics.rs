//! Indexer gauges and their Prometheus text exposition.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::SyncStatus;

/// Slot gauges updated on every sync status event.
#[derive(Debug, Default)]
pub struct IndexerMetrics {
    slot: AtomicU64,
    tip_slot: AtomicU64,
}

impl IndexerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_status(&self, status: &SyncStatus) {
        self.slot.store(status.slot, Ordering::Relaxed);
        self.tip_slot.store(status.tip_slot, Ordering::Relaxed);
    }

    pub fn slot(&self) -> u64 {
        self.slot.load(Ordering::Relaxed)
    }

    pub fn tip_slot(&self) -> u64 {
        self.tip_slot.load(Ordering::Relaxed)
    }

    /// Render the gauges in Prometheus text format.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        out.push_str("# HELP indexer_slot Indexer current slot number\n");
        out.push_str("# TYPE indexer_slot gauge\n");
        out.push_str(&format!("indexer_slot {}\n", self.slot()));

        out.push_str("# HELP indexer_tip_slot Slot number for upstream chain tip\n");
        out.push_str("# TYPE indexer_tip_slot gauge\n");
        out.push_str(&format!("indexer_tip_slot {}\n", self.tip_slot()));

        out
    }
}
