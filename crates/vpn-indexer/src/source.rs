//! Chain feed sources.
//!
//! A [`ChainSource`] is started with the intersect points to resume from and
//! hands back a [`ChainFeed`]: an ordered event channel plus an error channel.
//! A message on the error channel means the feed is broken and the indexer
//! must stop.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, info};
use vpn_core::ChainPosition;

use crate::error::{IndexerError, IndexerResult};
use crate::event::ChainEvent;

const FEED_BUFFER: usize = 256;

/// Receiving half of a started source.
pub struct ChainFeed {
    pub events: mpsc::Receiver<ChainEvent>,
    pub errors: mpsc::Receiver<String>,
}

/// Sending half, held by whatever produces events.
#[derive(Clone)]
pub struct FeedHandle {
    pub events: mpsc::Sender<ChainEvent>,
    pub errors: mpsc::Sender<String>,
}

/// Create a connected feed pair.
pub fn feed_channel(buffer: usize) -> (FeedHandle, ChainFeed) {
    let (event_tx, event_rx) = mpsc::channel(buffer);
    let (error_tx, error_rx) = mpsc::channel(1);
    (
        FeedHandle {
            events: event_tx,
            errors: error_tx,
        },
        ChainFeed {
            events: event_rx,
            errors: error_rx,
        },
    )
}

/// Something that can deliver chain events from a resume point.
pub trait ChainSource: Send + Sync {
    /// Start delivering events after the best of `intersect` (newest first).
    /// An empty list starts from the origin.
    fn start(&self, intersect: Vec<ChainPosition>) -> IndexerResult<ChainFeed>;
}

// ── In-process channel ─────────────────────────────────────────────

/// A source fed by the embedding process through a [`FeedHandle`].
pub struct ChannelSource {
    feed: Mutex<Option<ChainFeed>>,
    intersect: Mutex<Option<Vec<ChainPosition>>>,
}

impl ChannelSource {
    pub fn new(buffer: usize) -> (Self, FeedHandle) {
        let (handle, feed) = feed_channel(buffer);
        let source = Self {
            feed: Mutex::new(Some(feed)),
            intersect: Mutex::new(None),
        };
        (source, handle)
    }

    /// Intersect points the source was started with, if started.
    pub fn started_with(&self) -> Option<Vec<ChainPosition>> {
        self.intersect.lock().ok().and_then(|guard| guard.clone())
    }
}

impl ChainSource for ChannelSource {
    fn start(&self, intersect: Vec<ChainPosition>) -> IndexerResult<ChainFeed> {
        let mut feed = self
            .feed
            .lock()
            .map_err(|_| IndexerError::Pipeline("channel source lock poisoned".to_string()))?;
        let feed = feed
            .take()
            .ok_or_else(|| IndexerError::Pipeline("channel source already started".to_string()))?;
        if let Ok(mut seen) = self.intersect.lock() {
            *seen = Some(intersect);
        }
        Ok(feed)
    }
}

// ── JSON-lines replay ──────────────────────────────────────────────

/// Replays newline-delimited [`ChainEvent`] JSON from a file.
///
/// Events at or before the newest intersect slot are skipped, so a restart
/// resumes where the stored cursor left off. A malformed line or read
/// failure is reported on the error channel.
pub struct JsonLinesSource {
    path: PathBuf,
}

impl JsonLinesSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

fn event_slot(event: &ChainEvent) -> u64 {
    match event {
        ChainEvent::Transaction(tx) => tx.block.slot,
        ChainEvent::Status(status) => status.slot,
    }
}

impl ChainSource for JsonLinesSource {
    fn start(&self, intersect: Vec<ChainPosition>) -> IndexerResult<ChainFeed> {
        let (handle, feed) = feed_channel(FEED_BUFFER);
        let resume_after = intersect.iter().map(|p| p.slot).max();
        let path = self.path.clone();
        info!(path = %path.display(), ?resume_after, "replaying chain events");

        tokio::spawn(async move {
            if let Err(e) = replay_file(&path, resume_after, &handle).await {
                let _ = handle.errors.send(e).await;
            }
        });
        Ok(feed)
    }
}

async fn replay_file(
    path: &Path,
    resume_after: Option<u64>,
    handle: &FeedHandle,
) -> Result<(), String> {
    let file = tokio::fs::File::open(path)
        .await
        .map_err(|e| format!("open {}: {e}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let mut line_no = 0usize;
    let mut delivered = 0usize;
    while let Some(line) = lines
        .next_line()
        .await
        .map_err(|e| format!("read {}: {e}", path.display()))?
    {
        line_no += 1;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let event: ChainEvent = serde_json::from_str(line)
            .map_err(|e| format!("{}:{line_no}: {e}", path.display()))?;
        if resume_after.is_some_and(|slot| event_slot(&event) <= slot) {
            continue;
        }
        if handle.events.send(event).await.is_err() {
            debug!("chain feed receiver dropped; stopping replay");
            return Ok(());
        }
        delivered += 1;
    }
    debug!(delivered, "chain event replay finished");
    Ok(())
}
