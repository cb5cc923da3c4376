//! StateStore: redb-backed persistence for the indexer.
//!
//! Provides the chain-sync cursor, the reference snapshot and the client
//! registry. The WireGuard peer cache and IP allocator live in
//! `wireguard.rs` as a second `impl StateStore` block.

use std::path::Path;
use std::sync::Arc;

use rand::Rng;
use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::{debug, warn};
use vpn_core::ChainPosition;

use crate::error::{StateError, StateResult};
use crate::tables::*;
use crate::types::*;

/// Cursor entries kept behind the newest id when pruning.
pub const CURSOR_RETENTION: u64 = 50;

/// Fraction of cursor appends that also prune old entries.
const CURSOR_PRUNE_PROBABILITY: f64 = 0.01;

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    pub(crate) db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(map_err!(Open))?;
        }
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(CURSOR).map_err(map_err!(Table))?;
        txn.open_table(REFERENCE).map_err(map_err!(Table))?;
        txn.open_table(CLIENTS).map_err(map_err!(Table))?;
        txn.open_table(CLIENT_IDS).map_err(map_err!(Table))?;
        txn.open_table(CLIENT_ORDER).map_err(map_err!(Table))?;
        txn.open_table(WG_PEERS).map_err(map_err!(Table))?;
        txn.open_table(WG_IP_POOL).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Cursor ─────────────────────────────────────────────────────

    /// Append a chain position. About one call in a hundred also drops
    /// entries more than [`CURSOR_RETENTION`] ids behind the newest.
    pub fn add_cursor_point(&self, position: &ChainPosition) -> StateResult<u64> {
        let prune = rand::thread_rng().gen_bool(CURSOR_PRUNE_PROBABILITY);
        self.insert_cursor_point(position, prune)
    }

    pub(crate) fn insert_cursor_point(
        &self,
        position: &ChainPosition,
        prune: bool,
    ) -> StateResult<u64> {
        let value = serde_json::to_vec(position).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let id;
        let mut pruned = 0usize;
        {
            let mut table = txn.open_table(CURSOR).map_err(map_err!(Table))?;
            let max_id = table
                .last()
                .map_err(map_err!(Read))?
                .map(|(key, _)| key.value())
                .unwrap_or(0);
            id = max_id + 1;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;

            if prune {
                let cutoff = id.saturating_sub(CURSOR_RETENTION);
                let stale: Vec<u64> = table
                    .range(..cutoff)
                    .map_err(map_err!(Read))?
                    .map(|entry| entry.map(|(key, _)| key.value()))
                    .collect::<Result<_, _>>()
                    .map_err(map_err!(Read))?;
                for key in &stale {
                    table.remove(*key).map_err(map_err!(Write))?;
                }
                pruned = stale.len();
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if pruned > 0 {
            debug!(pruned, newest = id, "pruned cursor entries");
        }
        Ok(id)
    }

    /// All retained cursor entries, newest first.
    pub fn cursor_entries(&self) -> StateResult<Vec<CursorEntry>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CURSOR).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))?.rev() {
            let (key, value) = entry.map_err(map_err!(Read))?;
            let position: ChainPosition =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(CursorEntry {
                id: key.value(),
                position,
            });
        }
        Ok(results)
    }

    /// Retained chain positions, newest first.
    pub fn cursor_points(&self) -> StateResult<Vec<ChainPosition>> {
        Ok(self
            .cursor_entries()?
            .into_iter()
            .map(|entry| entry.position)
            .collect())
    }

    // ── Reference data ─────────────────────────────────────────────

    /// Replace the reference snapshot. Old prices and regions are removed in
    /// the same transaction as the new ones are written.
    pub fn update_reference_data(&self, snapshot: &ReferenceSnapshot) -> StateResult<()> {
        snapshot.validate()?;
        let value = serde_json::to_vec(snapshot).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(REFERENCE).map_err(map_err!(Table))?;
            table.remove(REFERENCE_KEY).map_err(map_err!(Write))?;
            table
                .insert(REFERENCE_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            output = %snapshot.output,
            prices = snapshot.prices.len(),
            regions = snapshot.regions.len(),
            "reference data updated"
        );
        Ok(())
    }

    /// The current reference snapshot, if one has been stored.
    pub fn reference_data(&self) -> StateResult<Option<ReferenceSnapshot>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(REFERENCE).map_err(map_err!(Table))?;
        match table.get(REFERENCE_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let snapshot: ReferenceSnapshot =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(snapshot))
            }
            None => Ok(None),
        }
    }

    // ── Clients ────────────────────────────────────────────────────

    /// Insert or replace the client with this asset name.
    pub fn put_client(&self, record: &ClientRecord) -> StateResult<()> {
        if record.asset_name.is_empty() {
            return Err(StateError::InvalidInput(
                "client asset name must not be empty".to_string(),
            ));
        }
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let replaced;
        {
            let mut table = txn.open_table(CLIENTS).map_err(map_err!(Table))?;
            replaced = table
                .insert(record.asset_name.as_slice(), value.as_slice())
                .map_err(map_err!(Write))?
                .is_some();

            // Upserts keep the id assigned on first insertion.
            let mut ids = txn.open_table(CLIENT_IDS).map_err(map_err!(Table))?;
            if ids
                .get(record.asset_name.as_slice())
                .map_err(map_err!(Read))?
                .is_none()
            {
                let mut order = txn.open_table(CLIENT_ORDER).map_err(map_err!(Table))?;
                let id = order
                    .last()
                    .map_err(map_err!(Read))?
                    .map(|(key, _)| key.value())
                    .unwrap_or(0)
                    + 1;
                order
                    .insert(id, record.asset_name.as_slice())
                    .map_err(map_err!(Write))?;
                ids.insert(record.asset_name.as_slice(), id)
                    .map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            asset_name = %hex::encode(&record.asset_name),
            region = %record.region,
            expiration = record.expiration,
            replaced,
            "client stored"
        );
        Ok(())
    }

    /// Get a client by asset name.
    pub fn client_by_asset_name(&self, asset_name: &[u8]) -> StateResult<Option<ClientRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLIENTS).map_err(map_err!(Table))?;
        match table.get(asset_name).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: ClientRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    /// List all clients, ordered by asset name.
    pub fn list_clients(&self) -> StateResult<Vec<ClientRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(CLIENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, value) = entry.map_err(map_err!(Read))?;
            match serde_json::from_slice::<ClientRecord>(value.value()) {
                Ok(record) => results.push(record),
                Err(e) => {
                    warn!(asset_name = %hex::encode(key.value()), error = %e, "skipping unreadable client row");
                }
            }
        }
        Ok(results)
    }

    /// Clients owned by a payment credential, in the order they were first
    /// stored.
    pub fn clients_by_credential(&self, credential: &[u8]) -> StateResult<Vec<ClientRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let order = txn.open_table(CLIENT_ORDER).map_err(map_err!(Table))?;
        let clients = txn.open_table(CLIENTS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in order.iter().map_err(map_err!(Read))? {
            let (_, asset_name) = entry.map_err(map_err!(Read))?;
            let Some(value) = clients.get(asset_name.value()).map_err(map_err!(Read))? else {
                continue;
            };
            match serde_json::from_slice::<ClientRecord>(value.value()) {
                Ok(record) if record.credential == credential => results.push(record),
                Ok(_) => {}
                Err(e) => {
                    warn!(asset_name = %hex::encode(asset_name.value()), error = %e, "skipping unreadable client row");
                }
            }
        }
        Ok(results)
    }

    /// Clients whose subscription ended before `now`, oldest expiry first.
    pub fn expired_clients(&self, now: u64) -> StateResult<Vec<ClientRecord>> {
        let mut expired: Vec<ClientRecord> = self
            .list_clients()?
            .into_iter()
            .filter(|c| c.is_expired(now))
            .collect();
        expired.sort_by_key(|c| c.expiration);
        Ok(expired)
    }
}
