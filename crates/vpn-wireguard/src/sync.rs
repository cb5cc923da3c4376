//! Startup push of active peers to the live endpoint.

use std::sync::Arc;

use tracing::{info, warn};
use vpn_state::StateStore;

use crate::endpoint::PeerEndpoint;
use crate::error::SyncError;
use crate::registry::short_key;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncReport {
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
}

impl SyncReport {
    /// More than half of the pushes failed.
    pub fn high_failure_rate(&self) -> bool {
        self.failed * 2 > self.attempted
    }
}

pub struct SyncCoordinator {
    store: StateStore,
    endpoint: Arc<dyn PeerEndpoint>,
}

impl SyncCoordinator {
    pub fn new(store: StateStore, endpoint: Arc<dyn PeerEndpoint>) -> Self {
        Self { store, endpoint }
    }

    /// Push every unexpired peer of `region` once. Individual failures are
    /// logged and counted; the whole sync fails only when most pushes did.
    pub async fn sync_peers(&self, region: &str, now: u64) -> Result<SyncReport, SyncError> {
        let peers = self.store.active_peers_for_region(region, now)?;
        if peers.is_empty() {
            info!(%region, "no peers to sync to endpoint");
            return Ok(SyncReport::default());
        }
        info!(%region, count = peers.len(), "syncing peers to endpoint");

        let mut report = SyncReport::default();
        for peer in &peers {
            report.attempted += 1;
            match self.endpoint.add_peer(&peer.pubkey, &peer.assigned_ip).await {
                Ok(_) => report.succeeded += 1,
                Err(e) => {
                    warn!(
                        pubkey = %short_key(&peer.pubkey),
                        ip = %peer.assigned_ip,
                        error = %e,
                        "failed to sync peer to endpoint"
                    );
                    report.failed += 1;
                }
            }
        }

        info!(
            %region,
            succeeded = report.succeeded,
            failed = report.failed,
            "completed syncing peers to endpoint"
        );
        if report.high_failure_rate() {
            return Err(SyncError::HighFailureRate(report));
        }
        Ok(report)
    }
}
