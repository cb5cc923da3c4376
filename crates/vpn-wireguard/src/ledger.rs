//! Remote peer ledger: the authoritative list of WireGuard peers.
//!
//! One JSON document per client subscription lives at
//! `peers/<hex asset name>.json`. Every write is conditioned on the entity
//! tag seen at load time, and lost races are reloaded and retried a bounded
//! number of times. Each call runs under a deadline and can be cancelled.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use vpn_core::config::LedgerConfig;

use crate::error::{LedgerError, LedgerResult};
use crate::objects::{ObjectStore, Precondition, StoredObject};
use crate::retry::{RetryError, retry_on_conflict};

pub const PEERS_PREFIX: &str = "peers/";

/// Default deadline for single-object operations.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default deadline for listing.
pub const DEFAULT_LIST_TIMEOUT: Duration = Duration::from_secs(120);

pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Ledger key for a subscription's peer record.
pub fn peer_file_key(asset_name: &[u8]) -> String {
    format!("{PEERS_PREFIX}{}.json", hex::encode(asset_name))
}

/// Recover the asset name from a ledger key, if it is one.
pub fn asset_name_from_key(key: &str) -> Option<Vec<u8>> {
    let name = key.strip_prefix(PEERS_PREFIX)?.strip_suffix(".json")?;
    if name.is_empty() {
        return None;
    }
    hex::decode(name).ok()
}

/// Current Unix time in whole seconds.
pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}

/// A peer entry in a remote record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeer {
    pub pubkey: String,
    pub assigned_ip: String,
    /// Unix seconds.
    pub created_at: u64,
}

/// The stored document for one subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemotePeerRecord {
    /// Hex asset name.
    pub asset_name: String,
    #[serde(default)]
    pub peers: Vec<RemotePeer>,
    /// Unix seconds.
    #[serde(default)]
    pub updated_at: u64,
}

impl RemotePeerRecord {
    fn empty(asset_name: &[u8]) -> Self {
        Self {
            asset_name: hex::encode(asset_name),
            peers: Vec::new(),
            updated_at: 0,
        }
    }

    /// Add `pubkey` or move it to `assigned_ip`.
    fn upsert(&mut self, pubkey: &str, assigned_ip: &str, now: u64) {
        match self.peers.iter_mut().find(|p| p.pubkey == pubkey) {
            Some(peer) => peer.assigned_ip = assigned_ip.to_string(),
            None => self.peers.push(RemotePeer {
                pubkey: pubkey.to_string(),
                assigned_ip: assigned_ip.to_string(),
                created_at: now,
            }),
        }
        self.updated_at = now;
    }

    /// Drop `pubkey`. Returns whether it was present.
    fn remove(&mut self, pubkey: &str, now: u64) -> bool {
        let before = self.peers.len();
        self.peers.retain(|p| p.pubkey != pubkey);
        self.updated_at = now;
        self.peers.len() != before
    }
}

pub struct PeerLedger {
    store: Arc<dyn ObjectStore>,
    timeout: Duration,
    list_timeout: Duration,
    max_retries: u32,
}

impl PeerLedger {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            timeout: DEFAULT_TIMEOUT,
            list_timeout: DEFAULT_LIST_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
        }
    }

    pub fn from_config(store: Arc<dyn ObjectStore>, config: &LedgerConfig) -> Self {
        Self {
            store,
            timeout: Duration::from_secs(config.timeout_secs),
            list_timeout: Duration::from_secs(config.list_timeout_secs),
            max_retries: config.max_retries,
        }
    }

    pub fn with_timeouts(mut self, timeout: Duration, list_timeout: Duration) -> Self {
        self.timeout = timeout;
        self.list_timeout = list_timeout;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Add or update `pubkey` in the subscription's record.
    pub async fn save_peer(
        &self,
        asset_name: &[u8],
        pubkey: &str,
        assigned_ip: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<()> {
        let key = peer_file_key(asset_name);
        let work = async {
            retry_on_conflict(self.max_retries, |_| {
                self.try_save(&key, asset_name, pubkey, assigned_ip)
            })
            .await
            .map_err(|e| exhausted(&key, e))
        };
        bounded("save peer", self.timeout, cancel, work).await?;
        debug!(%key, ip = %assigned_ip, "peer saved to ledger");
        Ok(())
    }

    async fn try_save(
        &self,
        key: &str,
        asset_name: &[u8],
        pubkey: &str,
        assigned_ip: &str,
    ) -> LedgerResult<()> {
        let (mut record, precondition) = match self.load_key(key).await? {
            Some((record, etag)) => (record, Precondition::IfMatch(etag)),
            None => (RemotePeerRecord::empty(asset_name), Precondition::IfNoneMatch),
        };
        record.upsert(pubkey, assigned_ip, unix_now());
        let data = serde_json::to_vec(&record).map_err(LedgerError::Encode)?;
        self.store.put(key, data, precondition).await?;
        Ok(())
    }

    /// Remove `pubkey` from the subscription's record. A record left with no
    /// peers is written back empty, never deleted. Returns whether the peer
    /// was present.
    pub async fn remove_peer(
        &self,
        asset_name: &[u8],
        pubkey: &str,
        cancel: &CancellationToken,
    ) -> LedgerResult<bool> {
        let key = peer_file_key(asset_name);
        let work = async {
            retry_on_conflict(self.max_retries, |_| self.try_remove(&key, pubkey))
                .await
                .map_err(|e| exhausted(&key, e))
        };
        let removed = bounded("remove peer", self.timeout, cancel, work).await?;
        debug!(%key, removed, "peer removed from ledger");
        Ok(removed)
    }

    async fn try_remove(&self, key: &str, pubkey: &str) -> LedgerResult<bool> {
        let Some((mut record, etag)) = self.load_key(key).await? else {
            return Ok(false);
        };
        if !record.remove(pubkey, unix_now()) {
            return Ok(false);
        }
        let data = serde_json::to_vec(&record).map_err(LedgerError::Encode)?;
        self.store
            .put(key, data, Precondition::IfMatch(etag))
            .await?;
        Ok(true)
    }

    /// The subscription's record, if one exists.
    pub async fn load(
        &self,
        asset_name: &[u8],
        cancel: &CancellationToken,
    ) -> LedgerResult<Option<RemotePeerRecord>> {
        let key = peer_file_key(asset_name);
        let loaded = bounded("load peers", self.timeout, cancel, self.load_key(&key)).await?;
        Ok(loaded.map(|(record, _)| record))
    }

    /// Every peer record key.
    pub async fn list_keys(&self, cancel: &CancellationToken) -> LedgerResult<Vec<String>> {
        let keys = bounded(
            "list peer records",
            self.list_timeout,
            cancel,
            self.store.list(PEERS_PREFIX),
        )
        .await?;
        info!(count = keys.len(), "listed peer records");
        Ok(keys)
    }

    async fn load_key(&self, key: &str) -> LedgerResult<Option<(RemotePeerRecord, String)>> {
        let Some(StoredObject { data, etag }) = self.store.get(key).await? else {
            return Ok(None);
        };
        let record = serde_json::from_slice(&data).map_err(|source| LedgerError::Decode {
            key: key.to_string(),
            source,
        })?;
        Ok(Some((record, etag)))
    }
}

fn exhausted(key: &str, e: RetryError<LedgerError>) -> LedgerError {
    match e {
        RetryError::Exhausted { attempts, .. } => LedgerError::RetriesExhausted {
            key: key.to_string(),
            attempts,
        },
        RetryError::Fatal(e) => e,
    }
}

/// Run `work` under a deadline, giving up early if `cancel` fires.
async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    cancel: &CancellationToken,
    work: impl Future<Output = LedgerResult<T>>,
) -> LedgerResult<T> {
    tokio::select! {
        _ = cancel.cancelled() => Err(LedgerError::Cancelled),
        result = tokio::time::timeout(limit, work) => match result {
            Ok(inner) => inner,
            Err(_) => Err(LedgerError::Timeout { operation, after: limit }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::objects::{MemoryObjectStore, ObjectFuture};

    const PK1: &str = "xTIBA5rboUvnH4htodjb6e697QjLERt1NAB4mZqp8Dg=";
    const PK2: &str = "HIgo9xNzJMWLKASShiTqIybxZ0U3wGLiUeJ1PKf8ykw=";

    fn ledger() -> (PeerLedger, Arc<MemoryObjectStore>) {
        let store = Arc::new(MemoryObjectStore::new());
        (PeerLedger::new(store.clone()), store)
    }

    /// Loses the first `conflicts` writes as if another writer got there first.
    struct Contended {
        inner: MemoryObjectStore,
        conflicts: AtomicU32,
    }

    impl ObjectStore for Contended {
        fn get<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, Option<StoredObject>> {
            self.inner.get(key)
        }

        fn put<'a>(
            &'a self,
            key: &'a str,
            data: Vec<u8>,
            precondition: Precondition,
        ) -> ObjectFuture<'a, String> {
            if self
                .conflicts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Box::pin(async move {
                    Err(LedgerError::Conflict {
                        key: key.to_string(),
                    })
                });
            }
            self.inner.put(key, data, precondition)
        }

        fn list<'a>(&'a self, prefix: &'a str) -> ObjectFuture<'a, Vec<String>> {
            self.inner.list(prefix)
        }
    }

    /// Never answers.
    struct Stalled;

    impl ObjectStore for Stalled {
        fn get<'a>(&'a self, _key: &'a str) -> ObjectFuture<'a, Option<StoredObject>> {
            Box::pin(std::future::pending())
        }

        fn put<'a>(
            &'a self,
            _key: &'a str,
            _data: Vec<u8>,
            _precondition: Precondition,
        ) -> ObjectFuture<'a, String> {
            Box::pin(std::future::pending())
        }

        fn list<'a>(&'a self, _prefix: &'a str) -> ObjectFuture<'a, Vec<String>> {
            Box::pin(std::future::pending())
        }
    }

    #[test]
    fn key_round_trip() {
        assert_eq!(peer_file_key(b"sub"), "peers/737562.json");
        assert_eq!(asset_name_from_key("peers/737562.json"), Some(b"sub".to_vec()));
        assert_eq!(asset_name_from_key("peers/.json"), None);
        assert_eq!(asset_name_from_key("peers/zz.json"), None);
        assert_eq!(asset_name_from_key("other/737562.json"), None);
        assert_eq!(asset_name_from_key("peers/737562.txt"), None);
    }

    #[tokio::test]
    async fn save_creates_then_updates_record() {
        let (ledger, _store) = ledger();
        let cancel = CancellationToken::new();
        ledger.save_peer(b"sub", PK1, "10.8.0.2", &cancel).await.unwrap();
        ledger.save_peer(b"sub", PK2, "10.8.0.3", &cancel).await.unwrap();
        ledger.save_peer(b"sub", PK1, "10.8.0.9", &cancel).await.unwrap();

        let record = ledger.load(b"sub", &cancel).await.unwrap().unwrap();
        assert_eq!(record.asset_name, "737562");
        let ips: Vec<_> = record.peers.iter().map(|p| p.assigned_ip.as_str()).collect();
        assert_eq!(ips, vec!["10.8.0.9", "10.8.0.3"]);
        assert!(record.updated_at > 0);
    }

    #[tokio::test]
    async fn remove_writes_back_empty_record() {
        let (ledger, store) = ledger();
        let cancel = CancellationToken::new();
        ledger.save_peer(b"sub", PK1, "10.8.0.2", &cancel).await.unwrap();

        assert!(ledger.remove_peer(b"sub", PK1, &cancel).await.unwrap());
        assert!(!ledger.remove_peer(b"sub", PK1, &cancel).await.unwrap());
        assert!(!ledger.remove_peer(b"none", PK1, &cancel).await.unwrap());

        let raw = store.get("peers/737562.json").await.unwrap().unwrap();
        let record: RemotePeerRecord = serde_json::from_slice(&raw.data).unwrap();
        assert!(record.peers.is_empty());
    }

    #[tokio::test]
    async fn conflicts_are_retried() {
        let store = Arc::new(Contended {
            inner: MemoryObjectStore::new(),
            conflicts: AtomicU32::new(2),
        });
        let ledger = PeerLedger::new(store);
        let cancel = CancellationToken::new();
        ledger.save_peer(b"sub", PK1, "10.8.0.2", &cancel).await.unwrap();
        assert_eq!(ledger.load(b"sub", &cancel).await.unwrap().unwrap().peers.len(), 1);
    }

    #[tokio::test]
    async fn persistent_conflict_exhausts_retries() {
        let store = Arc::new(Contended {
            inner: MemoryObjectStore::new(),
            conflicts: AtomicU32::new(10),
        });
        let ledger = PeerLedger::new(store);
        let result = ledger
            .save_peer(b"sub", PK1, "10.8.0.2", &CancellationToken::new())
            .await;
        assert!(matches!(
            result,
            Err(LedgerError::RetriesExhausted { attempts: 3, .. })
        ));
    }

    #[tokio::test]
    async fn malformed_record_is_a_decode_error() {
        let (ledger, store) = ledger();
        store
            .put("peers/737562.json", b"{not json".to_vec(), Precondition::IfNoneMatch)
            .await
            .unwrap();
        let result = ledger
            .save_peer(b"sub", PK1, "10.8.0.2", &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(LedgerError::Decode { .. })));
    }

    #[tokio::test]
    async fn stalled_store_times_out() {
        let ledger = PeerLedger::new(Arc::new(Stalled))
            .with_timeouts(Duration::from_millis(20), Duration::from_millis(20));
        let cancel = CancellationToken::new();
        assert!(matches!(
            ledger.load(b"sub", &cancel).await,
            Err(LedgerError::Timeout { .. })
        ));
        assert!(matches!(
            ledger.list_keys(&cancel).await,
            Err(LedgerError::Timeout { .. })
        ));
    }

    #[tokio::test]
    async fn cancelled_call_returns_promptly() {
        let ledger = PeerLedger::new(Arc::new(Stalled));
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            ledger.save_peer(b"sub", PK1, "10.8.0.2", &cancel).await,
            Err(LedgerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn list_keys_only_returns_peer_records() {
        let (ledger, store) = ledger();
        let cancel = CancellationToken::new();
        ledger.save_peer(b"a", PK1, "10.8.0.2", &cancel).await.unwrap();
        ledger.save_peer(b"b", PK2, "10.8.0.3", &cancel).await.unwrap();
        store
            .put("index.json", b"{}".to_vec(), Precondition::IfNoneMatch)
            .await
            .unwrap();
        assert_eq!(
            ledger.list_keys(&cancel).await.unwrap(),
            vec!["peers/61.json", "peers/62.json"]
        );
    }
}
