//! vpn-state: embedded state store for the vpn indexer.
//!
//! Backed by [redb](https://docs.rs/redb), holds the chain-sync cursor, the
//! current reference snapshot, the client registry, the WireGuard peer cache
//! and the per-region IP allocation hints.
//!
//! # Architecture
//!
//! Domain types are JSON-serialized into redb's `&[u8]` value columns. Every
//! public operation runs in a single redb transaction, so it either fully
//! applies or not at all. redb admits one write transaction at a time, which
//! serialises concurrent IP allocations for the same region.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod store;
pub mod tables;
pub mod types;
mod wireguard;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
