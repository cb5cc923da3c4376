//! redb table definitions for the state store.
//!
//! JSON-valued tables use `&[u8]` values; the IP pool stores the bare hint.

use redb::TableDefinition;

/// Cursor points keyed by a monotonically increasing id.
pub const CURSOR: TableDefinition<u64, &[u8]> = TableDefinition::new("cursor");

/// The current reference snapshot under [`REFERENCE_KEY`].
pub const REFERENCE: TableDefinition<&str, &[u8]> = TableDefinition::new("reference");

/// Client records keyed by raw asset name bytes.
pub const CLIENTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("clients");

/// First-insertion id of each client, keyed by asset name.
pub const CLIENT_IDS: TableDefinition<&[u8], u64> = TableDefinition::new("client_ids");

/// Asset names keyed by first-insertion id.
pub const CLIENT_ORDER: TableDefinition<u64, &[u8]> = TableDefinition::new("client_order");

/// WireGuard peers keyed by base64 public key.
pub const WG_PEERS: TableDefinition<&str, &[u8]> = TableDefinition::new("wg_peers");

/// Next-octet allocation hint keyed by region.
pub const WG_IP_POOL: TableDefinition<&str, u8> = TableDefinition::new("wg_ip_pool");

/// Key of the single reference snapshot row.
pub const REFERENCE_KEY: &str = "current";
