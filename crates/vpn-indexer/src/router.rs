//! Event router: turns transaction outputs at the script address into
//! reference snapshots and client records.
//!
//! Outputs with a missing or undecodable datum are logged and skipped so one
//! bad transaction never stalls the chain follower. Store failures are
//! returned to the caller and stop the run.

use std::sync::Arc;

use tracing::{debug, error, info, warn};
use vpn_core::{AssetId, ClientDatum, ReferenceDatum, ScriptAddress};
use vpn_state::{ClientRecord, ReferenceSnapshot, StateError, StateStore};

use crate::error::IndexerResult;
use crate::event::{TransactionEvent, TxOutput};
use crate::provision::ClientProvisioner;

/// Per-transaction counters, mostly useful in tests and debug logs.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RouteStats {
    pub references: usize,
    pub clients: usize,
    pub provisioned: usize,
    pub skipped: usize,
}

impl RouteStats {
    pub(crate) fn absorb(&mut self, other: RouteStats) {
        self.references += other.references;
        self.clients += other.clients;
        self.provisioned += other.provisioned;
        self.skipped += other.skipped;
    }
}

pub struct EventRouter {
    script_address: ScriptAddress,
    reference_token: AssetId,
    region: String,
    vpn_host: String,
    vpn_port: u16,
    store: StateStore,
    provisioner: Arc<dyn ClientProvisioner>,
}

impl EventRouter {
    pub fn new(
        script_address: ScriptAddress,
        reference_token: AssetId,
        region: &str,
        domain: &str,
        vpn_port: u16,
        store: StateStore,
        provisioner: Arc<dyn ClientProvisioner>,
    ) -> Self {
        Self {
            script_address,
            reference_token,
            region: region.to_string(),
            vpn_host: format!("{region}.{domain}"),
            vpn_port,
            store,
            provisioner,
        }
    }

    pub fn vpn_host(&self) -> &str {
        &self.vpn_host
    }

    /// Route every produced output of a transaction.
    pub async fn handle_transaction(&self, tx: &TransactionEvent) -> IndexerResult<RouteStats> {
        let mut stats = RouteStats::default();
        for output in &tx.outputs {
            if output.address != self.script_address.as_str() {
                continue;
            }
            if output.assets.is_empty() {
                continue;
            }
            if output.holds(&self.reference_token) {
                stats.absorb(self.handle_reference(tx, output)?);
            }
            let policy = self.script_address.payment_hash();
            if output.assets_under(&policy).next().is_some() {
                stats.absorb(self.handle_client(tx, output).await?);
            }
        }
        Ok(stats)
    }

    fn handle_reference(
        &self,
        tx: &TransactionEvent,
        output: &TxOutput,
    ) -> IndexerResult<RouteStats> {
        let output_ref = tx.output_ref(output);
        let skipped = RouteStats {
            skipped: 1,
            ..RouteStats::default()
        };
        let Some(datum) = output.datum.as_deref() else {
            warn!(tx_output = %output_ref, "ignoring missing datum");
            return Ok(skipped);
        };
        let reference = match ReferenceDatum::from_cbor(datum) {
            Ok(reference) => reference,
            Err(e) => {
                warn!(tx_output = %output_ref, error = %e, "ignoring unknown reference datum format");
                return Ok(skipped);
            }
        };
        let snapshot = ReferenceSnapshot {
            output: output_ref,
            position: Some(tx.block),
            prices: reference.prices,
            regions: reference.regions,
        };
        match self.store.update_reference_data(&snapshot) {
            Ok(()) => {}
            Err(e @ StateError::InvalidInput(_)) => {
                warn!(tx_output = %output_ref, error = %e, "ignoring invalid reference data");
                return Ok(skipped);
            }
            Err(e) => return Err(e.into()),
        }
        info!(tx_output = %output_ref, slot = tx.block.slot, "updated reference data");
        Ok(RouteStats {
            references: 1,
            ..RouteStats::default()
        })
    }

    async fn handle_client(
        &self,
        tx: &TransactionEvent,
        output: &TxOutput,
    ) -> IndexerResult<RouteStats> {
        let output_ref = tx.output_ref(output);
        let mut stats = RouteStats::default();
        let Some(datum) = output.datum.as_deref() else {
            warn!(tx_output = %output_ref, "ignoring missing datum");
            stats.skipped = 1;
            return Ok(stats);
        };
        let client = match ClientDatum::from_cbor(datum) {
            Ok(client) => client,
            Err(e) => {
                warn!(tx_output = %output_ref, error = %e, "ignoring unknown client datum format");
                stats.skipped = 1;
                return Ok(stats);
            }
        };
        let policy = self.script_address.payment_hash();
        let Some(asset_name) = output
            .assets_under(&policy)
            .map(|a| a.name.clone())
            .find(|name| !name.is_empty())
        else {
            warn!(tx_output = %output_ref, "ignoring datum without expected asset");
            stats.skipped = 1;
            return Ok(stats);
        };

        let record = ClientRecord {
            asset_name: asset_name.clone(),
            expiration: client.expiration_secs(),
            credential: client.credential,
            region: client.region,
            origin: output_ref,
        };
        self.store.put_client(&record)?;
        stats.clients = 1;
        debug!(
            asset_name = %hex::encode(&asset_name),
            region = %record.region,
            expiration = record.expiration,
            "client recorded"
        );

        if record.region != self.region {
            return Ok(stats);
        }
        match self
            .provisioner
            .generate(&asset_name, &self.vpn_host, self.vpn_port)
            .await
        {
            Ok(client_id) => {
                info!(client = %client_id, tx_output = %output_ref, "generated client");
                stats.provisioned = 1;
            }
            Err(e) => {
                error!(
                    asset_name = %hex::encode(&asset_name),
                    tx_output = %output_ref,
                    error = %e,
                    "client generation failed"
                );
            }
        }
        Ok(stats)
    }
}
