//! vpn-wireguard: WireGuard peer registration backed by a remote ledger.
//!
//! # Architecture
//!
//! ```text
//! PeerRegistry
//!   ├── register_peer: validate → allocate_ip → PeerLedger.save_peer
//!   │                    (failure → deallocate_ip) → cache → PeerEndpoint.add_peer
//!   ├── remove_peer:   PeerLedger.remove_peer → cache delete → deallocate_ip
//!   │                    → PeerEndpoint.remove_peer
//!   └── rebuild_from_remote: list → load → add_wg_peer → rebuild_ip_pool
//!
//! PeerLedger ── ObjectStore (MemoryObjectStore | FsObjectStore)
//!   conditional writes, retry_on_conflict, deadlines, cancellation
//!
//! SyncCoordinator ── active peers → PeerEndpoint (HttpPeerEndpoint + PeerTokenIssuer)
//! ```

pub mod endpoint;
pub mod error;
pub mod ledger;
pub mod objects;
pub mod reconcile;
pub mod registry;
pub mod retry;
pub mod sync;
pub mod token;

pub use endpoint::{AddPeerResponse, HttpPeerEndpoint, PeerEndpoint, ServerInfo};
pub use error::{EndpointError, LedgerError, PeerError, SyncError, TokenError};
pub use ledger::{
    PeerLedger, RemotePeer, RemotePeerRecord, asset_name_from_key, peer_file_key,
    unix_now,
};
pub use objects::{FsObjectStore, MemoryObjectStore, ObjectStore, Precondition, StoredObject};
pub use reconcile::RebuildReport;
pub use registry::{
    Devices, PeerRegistry, Registration, RegistrySettings, Removal, StepStatus,
    is_valid_wg_pubkey,
};
pub use retry::{RetryError, Retryable, retry_on_conflict};
pub use sync::{SyncCoordinator, SyncReport};
pub use token::PeerTokenIssuer;
