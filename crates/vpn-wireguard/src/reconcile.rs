//! Cold-start rebuild of the local peer cache from the remote ledger.

use std::collections::BTreeSet;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use vpn_state::WgPeer;

use crate::error::PeerResult;
use crate::ledger::asset_name_from_key;
use crate::registry::{PeerRegistry, short_key};

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RebuildReport {
    /// The cache already had peers, so nothing was loaded.
    pub skipped: bool,
    pub records: usize,
    pub peers_loaded: usize,
    pub failures: usize,
    /// Regions whose pool hint was recomputed.
    pub regions: Vec<String>,
}

impl PeerRegistry {
    /// Load every ledger record into an empty local cache, then recompute
    /// the pool hint of each region touched plus the local one. A cache that
    /// already holds peers is left alone.
    pub async fn rebuild_from_remote(&self, cancel: &CancellationToken) -> PeerResult<RebuildReport> {
        let store = self.store();
        if store.has_wg_peers()? {
            info!("peer cache populated, skipping rebuild from ledger");
            return Ok(RebuildReport {
                skipped: true,
                ..RebuildReport::default()
            });
        }

        info!("rebuilding peer cache from ledger");
        let keys = self.ledger().list_keys(cancel).await?;
        let mut report = RebuildReport::default();
        let mut regions = BTreeSet::from([self.settings().region.clone()]);

        for key in keys {
            let Some(asset_name) = asset_name_from_key(&key) else {
                warn!(%key, "skipping ledger key without asset name");
                report.failures += 1;
                continue;
            };
            let record = match self.ledger().load(&asset_name, cancel).await {
                Ok(Some(record)) => record,
                Ok(None) => {
                    warn!(%key, "peer record vanished, skipping");
                    continue;
                }
                Err(e) => {
                    warn!(%key, error = %e, "failed to load peer record, skipping");
                    report.failures += 1;
                    continue;
                }
            };
            report.records += 1;

            for remote in record.peers {
                let peer = WgPeer {
                    asset_name: asset_name.clone(),
                    pubkey: remote.pubkey,
                    assigned_ip: remote.assigned_ip,
                    created_at: remote.created_at,
                };
                match store.add_wg_peer(&peer) {
                    Ok(()) => report.peers_loaded += 1,
                    Err(e) => {
                        warn!(pubkey = %short_key(&peer.pubkey), error = %e, "failed to cache peer");
                        report.failures += 1;
                    }
                }
            }
            if let Ok(Some(client)) = store.client_by_asset_name(&asset_name) {
                regions.insert(client.region);
            }
        }

        for region in &regions {
            store.rebuild_ip_pool(region)?;
        }
        report.regions = regions.into_iter().collect();
        info!(
            records = report.records,
            peers = report.peers_loaded,
            failures = report.failures,
            "peer cache rebuilt from ledger"
        );
        Ok(report)
    }
}
