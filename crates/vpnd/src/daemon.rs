//! `vpnd run`: startup sequence and main loop.
//!
//! 1. Opens the state store
//! 2. For WireGuard regions, rebuilds the peer cache from the ledger and
//!    pushes active peers to the endpoint
//! 3. Starts the chain source from the stored cursor
//! 4. Serves `/metrics` and `/healthz`
//! 5. Runs the indexer until the feed ends, the pipeline fails, or Ctrl-C

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vpn_core::config::{Config, VpnProtocol};
use vpn_indexer::{
    ChainSource, ChannelSource, FeedHandle, Indexer, IndexerMetrics, IndexerSettings,
    JsonLinesSource, LoggingProvisioner,
};
use vpn_state::StateStore;
use vpn_wireguard::{
    FsObjectStore, HttpPeerEndpoint, ObjectStore, PeerEndpoint, PeerLedger, PeerRegistry,
    PeerTokenIssuer, RegistrySettings, SyncCoordinator, SyncError,
};

/// Capacity of the in-process feed when no replay file is configured.
const CHANNEL_FEED_BUFFER: usize = 1024;

pub fn open_store(config: &Config) -> anyhow::Result<StateStore> {
    std::fs::create_dir_all(&config.database.dir)
        .with_context(|| format!("create database dir {}", config.database.dir.display()))?;
    let db_path = config.database.db_path();
    let store = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");
    Ok(store)
}

pub async fn run(config: Config) -> anyhow::Result<()> {
    config.validate()?;
    info!(
        region = %config.vpn.region,
        protocol = ?config.vpn.protocol,
        "vpn indexer starting"
    );

    // ── Initialize subsystems ──────────────────────────────────

    let store = open_store(&config)?;
    let shutdown = CancellationToken::new();

    if config.vpn.protocol == VpnProtocol::Wireguard {
        start_wireguard(&config, &store, &shutdown).await?;
    }

    let metrics = Arc::new(IndexerMetrics::new());
    let mut indexer = Indexer::new(
        IndexerSettings::from_config(&config),
        store.clone(),
        Arc::new(LoggingProvisioner),
        metrics.clone(),
    )?;

    // ── Start chain source ─────────────────────────────────────

    let intersect = indexer.intersect_points()?;
    // The handle keeps an in-process feed open until shutdown.
    let (feed, _feed_handle): (_, Option<FeedHandle>) = match &config.indexer.events {
        Some(path) => (JsonLinesSource::new(path).start(intersect)?, None),
        None => {
            warn!("no chain event file configured; waiting on the in-process feed");
            let (source, handle) = ChannelSource::new(CHANNEL_FEED_BUFFER);
            (source.start(intersect)?, Some(handle))
        }
    };

    // ── Start metrics listener ─────────────────────────────────

    let addr: SocketAddr = format!("{}:{}", config.metrics.address, config.metrics.port)
        .parse()
        .with_context(|| {
            format!(
                "invalid metrics listen address {}:{}",
                config.metrics.address, config.metrics.port
            )
        })?;
    let server = tokio::spawn(crate::http::serve(
        addr,
        crate::http::build_router(metrics),
        shutdown.clone(),
    ));

    // ── Run until the feed ends or a shutdown signal ───────────

    let outcome = tokio::select! {
        result = indexer.run(feed) => Some(result),
        _ = shutdown_signal() => None,
    };

    shutdown.cancel();
    match server.await {
        Ok(Err(e)) => warn!(error = %e, "metrics listener failed"),
        Err(e) => warn!(error = %e, "metrics listener task panicked"),
        Ok(Ok(())) => {}
    }

    match outcome {
        Some(Ok(summary)) => {
            info!(
                transactions = summary.transactions,
                status_updates = summary.status_updates,
                references = summary.routed.references,
                clients = summary.routed.clients,
                provisioned = summary.routed.provisioned,
                skipped = summary.routed.skipped,
                "chain feed ended"
            );
            Ok(())
        }
        Some(Err(e)) => {
            error!(error = %e, "indexer pipeline failed");
            Err(e.into())
        }
        None => {
            info!("vpn indexer stopped");
            Ok(())
        }
    }
}

/// Rebuild the peer cache and resynchronise the endpoint. Only a broken
/// configuration is fatal; ledger and endpoint failures are logged.
async fn start_wireguard(
    config: &Config,
    store: &StateStore,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let settings = RegistrySettings::from_config(config)?;
    let objects: Arc<dyn ObjectStore> = Arc::new(FsObjectStore::new(&config.ledger.dir));
    let ledger = Arc::new(PeerLedger::from_config(objects, &config.ledger));
    info!(dir = %config.ledger.dir.display(), "peer ledger opened");

    let endpoint: Option<Arc<dyn PeerEndpoint>> = match &config.wireguard.jwt_key_file {
        Some(path) => {
            let issuer = PeerTokenIssuer::from_file(path)?;
            let endpoint = HttpPeerEndpoint::new(&config.wireguard.container_url, issuer)?;
            info!(endpoint = %endpoint.authority(), "peer endpoint configured");
            let endpoint: Arc<dyn PeerEndpoint> = Arc::new(endpoint);
            Some(endpoint)
        }
        None => {
            warn!("wireguard.jwt_key_file not set; peers will not be pushed to the endpoint");
            None
        }
    };

    if let Some(endpoint) = &endpoint {
        if let Err(e) = endpoint.health().await {
            warn!(error = %e, "peer endpoint health check failed");
        }
    }

    let registry = PeerRegistry::new(store.clone(), ledger, endpoint.clone(), settings);
    match registry.rebuild_from_remote(cancel).await {
        Ok(report) if !report.skipped => info!(
            records = report.records,
            peers = report.peers_loaded,
            failures = report.failures,
            "peer cache restored from ledger"
        ),
        Ok(_) => {}
        Err(e) => error!(error = %e, "failed to rebuild peer cache from ledger"),
    }

    if let Some(endpoint) = endpoint {
        let coordinator = SyncCoordinator::new(store.clone(), endpoint);
        let now = vpn_wireguard::unix_now();
        match coordinator.sync_peers(&config.vpn.region, now).await {
            Ok(_) => {}
            Err(SyncError::HighFailureRate(report)) => error!(
                attempted = report.attempted,
                failed = report.failed,
                "most peers failed to sync to the endpoint"
            ),
            Err(e) => error!(error = %e, "failed to sync peers to endpoint"),
        }
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to install Ctrl-C handler");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
