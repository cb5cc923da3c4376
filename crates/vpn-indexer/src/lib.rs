//! vpn-indexer: follows the chain and keeps the state store current.
//!
//! # Architecture
//!
//! ```text
//! ChainSource (ChannelSource | JsonLinesSource)
//!   └── ChainFeed { events, errors }
//!         └── Indexer::run
//!               ├── EventRouter ← transaction events
//!               │     ├── reference token → update_reference_data
//!               │     └── client asset    → put_client → ClientProvisioner
//!               └── SyncTracker ← status events
//!                     ├── IndexerMetrics (indexer_slot, indexer_tip_slot)
//!                     ├── add_cursor_point
//!                     └── catch-up log timer (stopped at tip)
//! ```

pub mod error;
pub mod event;
pub mod indexer;
pub mod metrics;
pub mod provision;
pub mod router;
pub mod source;
pub mod status;

pub use error::{IndexerError, IndexerResult};
pub use event::{AssetEntry, ChainEvent, SyncStatus, TransactionEvent, TxOutput};
pub use indexer::{Indexer, IndexerSettings, RunSummary};
pub use metrics::IndexerMetrics;
pub use provision::{ClientProvisioner, LoggingProvisioner};
pub use router::{EventRouter, RouteStats};
pub use source::{
    ChainFeed, ChainSource, ChannelSource, FeedHandle, JsonLinesSource, feed_channel,
};
pub use status::SyncTracker;
