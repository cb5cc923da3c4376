//! vpn-core: shared types for the vpn-indexer workspace.
//!
//! - [`chain`]: block/transaction hashes, policy ids, asset ids, and
//!   script address parsing.
//! - [`datum`]: the Plutus-data codec for client and reference datums.
//! - [`config`]: the `vpn-indexer.toml` configuration.
//! - [`net`]: WireGuard subnet helpers.

pub mod chain;
pub mod config;
pub mod datum;
pub mod net;

pub use chain::{
    AssetId, BlockHash, ChainError, ChainPosition, OutputRef, PolicyId, ScriptAddress, TxHash,
};
pub use config::{Config, ConfigError};
pub use datum::{
    ClientDatum, Datum, DatumError, DatumResult, FlexibleReference, PricePlan, ReferenceDatum,
    decode_reference_flexible,
};
pub use net::WgSubnet;
