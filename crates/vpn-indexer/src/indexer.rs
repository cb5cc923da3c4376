//! Indexer lifecycle: settings validation, resume points, and the single
//! consumer loop over a chain feed.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};
use vpn_core::{AssetId, BlockHash, ChainPosition, Config, ScriptAddress};
use vpn_state::StateStore;

use crate::error::{IndexerError, IndexerResult};
use crate::event::ChainEvent;
use crate::metrics::IndexerMetrics;
use crate::provision::ClientProvisioner;
use crate::router::{EventRouter, RouteStats};
use crate::source::ChainFeed;
use crate::status::{SYNC_STATUS_LOG_INTERVAL, SyncTracker};

/// Everything the indexer needs from configuration.
#[derive(Debug, Clone)]
pub struct IndexerSettings {
    pub script_address: String,
    /// `<policy hex>.<asset name hex>`.
    pub reference_token: String,
    /// Hex block hash of the configured start point; empty for none.
    pub intersect_hash: String,
    pub intersect_slot: u64,
    pub region: String,
    pub domain: String,
    pub port: u16,
    pub sync_log_interval: Duration,
}

impl IndexerSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            script_address: config.indexer.script_address.clone(),
            reference_token: config.indexer.reference_token.clone(),
            intersect_hash: config.indexer.intersect_hash.clone(),
            intersect_slot: config.indexer.intersect_slot,
            region: config.vpn.region.clone(),
            domain: config.vpn.domain.clone(),
            port: config.vpn.port,
            sync_log_interval: SYNC_STATUS_LOG_INTERVAL,
        }
    }
}

/// Totals for one [`Indexer::run`].
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub transactions: usize,
    pub status_updates: usize,
    pub routed: RouteStats,
}

pub struct Indexer {
    store: StateStore,
    router: EventRouter,
    tracker: SyncTracker,
    start_point: Option<ChainPosition>,
    sync_log_interval: Duration,
}

impl Indexer {
    /// Validate settings and wire the router. A malformed script address,
    /// reference token or start point is a configuration error.
    pub fn new(
        settings: IndexerSettings,
        store: StateStore,
        provisioner: Arc<dyn ClientProvisioner>,
        metrics: Arc<IndexerMetrics>,
    ) -> IndexerResult<Self> {
        let script_address = ScriptAddress::parse(&settings.script_address)
            .map_err(|e| IndexerError::Config(format!("decode script address: {e}")))?;
        let reference_token: AssetId = settings
            .reference_token
            .parse()
            .map_err(|e| IndexerError::Config(format!("decode reference token: {e}")))?;
        let start_point = if !settings.intersect_hash.is_empty() && settings.intersect_slot > 0 {
            let hash: BlockHash = settings
                .intersect_hash
                .parse()
                .map_err(|e| IndexerError::Config(format!("decode intersect hash: {e}")))?;
            Some(ChainPosition::new(hash, settings.intersect_slot))
        } else {
            None
        };

        debug!(
            script = %script_address,
            client_policy = %script_address.payment_hash(),
            reference_token = %reference_token,
            "indexer configured"
        );
        let router = EventRouter::new(
            script_address,
            reference_token,
            &settings.region,
            &settings.domain,
            settings.port,
            store.clone(),
            provisioner,
        );
        Ok(Self {
            tracker: SyncTracker::new(store.clone(), metrics),
            store,
            router,
            start_point,
            sync_log_interval: settings.sync_log_interval,
        })
    }

    /// Where to resume: stored cursor points if any, else the configured
    /// start point, else nothing (chain origin).
    pub fn intersect_points(&self) -> IndexerResult<Vec<ChainPosition>> {
        let cursor = self.store.cursor_points()?;
        if let Some(latest) = cursor.first() {
            info!(slot = latest.slot, hash = %latest.hash, "found previous chainsync cursor");
            return Ok(cursor);
        }
        if let Some(point) = self.start_point {
            info!(slot = point.slot, hash = %point.hash, "starting new chainsync at configured location");
            return Ok(vec![point]);
        }
        info!("starting chainsync from origin");
        Ok(Vec::new())
    }

    pub fn tracker(&self) -> &SyncTracker {
        &self.tracker
    }

    /// Consume the feed until its event channel closes. A message on the
    /// error channel ends the run with [`IndexerError::Pipeline`].
    pub async fn run(&mut self, feed: ChainFeed) -> IndexerResult<RunSummary> {
        let ChainFeed {
            mut events,
            mut errors,
        } = feed;
        let mut summary = RunSummary::default();
        let mut errors_open = true;
        self.tracker.start_catch_up_log(self.sync_log_interval);

        let result = loop {
            tokio::select! {
                biased;
                err = errors.recv(), if errors_open => match err {
                    Some(message) => {
                        error!(error = %message, "pipeline failed");
                        break Err(IndexerError::Pipeline(message));
                    }
                    None => errors_open = false,
                },
                event = events.recv() => match event {
                    Some(ChainEvent::Transaction(tx)) => {
                        summary.transactions += 1;
                        match self.router.handle_transaction(&tx).await {
                            Ok(stats) => summary.routed.absorb(stats),
                            Err(e) => {
                                error!(tx = %tx.tx_hash, error = %e, "failed to apply transaction");
                                break Err(e);
                            }
                        }
                    }
                    Some(ChainEvent::Status(status)) => {
                        summary.status_updates += 1;
                        self.tracker.update(&status);
                    }
                    None => {
                        // Drain a failure reported just before the feed closed.
                        if let Ok(message) = errors.try_recv() {
                            error!(error = %message, "pipeline failed");
                            break Err(IndexerError::Pipeline(message));
                        }
                        break Ok(summary);
                    }
                },
            }
        };

        self.tracker.stop_catch_up_log();
        if let Ok(summary) = &result {
            info!(
                transactions = summary.transactions,
                status_updates = summary.status_updates,
                "chain feed closed"
            );
        }
        result
    }
}
