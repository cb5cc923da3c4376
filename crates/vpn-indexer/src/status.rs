//! Sync status tracking: gauges, cursor persistence, and the catch-up log.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};
use vpn_state::StateStore;

use crate::event::SyncStatus;
use crate::metrics::IndexerMetrics;

/// Default period of the catch-up progress log.
pub const SYNC_STATUS_LOG_INTERVAL: Duration = Duration::from_secs(30);

/// Applies status updates from the chain follower.
///
/// Until the chain tip is first reached, a background task logs the latest
/// status every interval. Reaching the tip stops that task for good.
pub struct SyncTracker {
    store: StateStore,
    metrics: Arc<IndexerMetrics>,
    latest: watch::Sender<Option<SyncStatus>>,
    catch_up_log: Option<JoinHandle<()>>,
    tip_reached: bool,
}

impl SyncTracker {
    pub fn new(store: StateStore, metrics: Arc<IndexerMetrics>) -> Self {
        let (latest, _) = watch::channel(None);
        Self {
            store,
            metrics,
            latest,
            catch_up_log: None,
            tip_reached: false,
        }
    }

    /// Spawn the periodic catch-up log. Does nothing once the tip has been
    /// reached or if the task is already running.
    pub fn start_catch_up_log(&mut self, interval: Duration) {
        if self.tip_reached || self.catch_up_log.is_some() {
            return;
        }
        let latest = self.latest.subscribe();
        self.catch_up_log = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let status = *latest.borrow();
                match status {
                    Some(s) => info!(
                        slot = s.slot,
                        hash = %s.block_hash,
                        tip_slot = s.tip_slot,
                        "catch-up sync in progress"
                    ),
                    None => info!("catch-up sync in progress, no status yet"),
                }
            }
        }));
    }

    /// Record a status update. Returns true on the update that first reaches
    /// the chain tip.
    pub fn update(&mut self, status: &SyncStatus) -> bool {
        self.latest.send_replace(Some(*status));
        self.metrics.record_status(status);
        if let Err(e) = self.store.add_cursor_point(&status.position()) {
            error!(slot = status.slot, error = %e, "failed to update chain cursor");
        }
        if self.tip_reached || !status.tip_reached {
            return false;
        }
        self.tip_reached = true;
        self.stop_catch_up_log();
        info!(slot = status.slot, "caught up to chain tip");
        true
    }

    pub fn tip_reached(&self) -> bool {
        self.tip_reached
    }

    pub fn latest(&self) -> Option<SyncStatus> {
        *self.latest.borrow()
    }

    pub fn catch_up_log_running(&self) -> bool {
        self.catch_up_log
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    pub fn stop_catch_up_log(&mut self) {
        if let Some(handle) = self.catch_up_log.take() {
            handle.abort();
        }
    }
}

impl Drop for SyncTracker {
    fn drop(&mut self) {
        self.stop_catch_up_log();
    }
}
