//! Object stores backing the remote peer ledger.
//!
//! The ledger needs three things from its backend: read an object with its
//! entity tag, write it only if the tag still matches (or only if nothing is
//! there yet), and list keys under a prefix. Anything that can do that can
//! hold the ledger; this module ships an in-process store and a shared
//! directory store.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Mutex;

use fs2::FileExt;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::debug;

use crate::error::{LedgerError, LedgerResult};

/// Boxed future returned by [`ObjectStore`] methods.
pub type ObjectFuture<'a, T> = Pin<Box<dyn Future<Output = LedgerResult<T>> + Send + 'a>>;

/// An object and the tag identifying this version of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub data: Vec<u8>,
    pub etag: String,
}

/// Condition attached to a write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// Write only if the current version carries this tag.
    IfMatch(String),
    /// Write only if the key does not exist.
    IfNoneMatch,
}

impl Precondition {
    fn holds(&self, current: Option<&str>) -> bool {
        match (self, current) {
            (Precondition::IfMatch(expected), Some(etag)) => expected == etag,
            (Precondition::IfMatch(_), None) => false,
            (Precondition::IfNoneMatch, current) => current.is_none(),
        }
    }
}

pub trait ObjectStore: Send + Sync {
    /// Read `key`. A missing key is `Ok(None)`.
    fn get<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, Option<StoredObject>>;

    /// Conditionally write `key`, returning the new tag. A failed
    /// precondition is [`LedgerError::Conflict`].
    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> ObjectFuture<'a, String>;

    /// All keys starting with `prefix`, sorted.
    fn list<'a>(&'a self, prefix: &'a str) -> ObjectFuture<'a, Vec<String>>;
}

/// Entity tag for a body: hex SHA-256 of its bytes.
pub fn content_etag(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

fn conflict(key: &str) -> LedgerError {
    LedgerError::Conflict {
        key: key.to_string(),
    }
}

// ── In-process ─────────────────────────────────────────────────────

/// Ledger backend held in memory. Shared by cloning an `Arc` around it.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_objects<T>(&self, f: impl FnOnce(&mut BTreeMap<String, Vec<u8>>) -> T) -> T {
        let mut guard = match self.objects.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        f(&mut guard)
    }
}

impl ObjectStore for MemoryObjectStore {
    fn get<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, Option<StoredObject>> {
        Box::pin(async move {
            Ok(self.with_objects(|objects| {
                objects.get(key).map(|data| StoredObject {
                    etag: content_etag(data),
                    data: data.clone(),
                })
            }))
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> ObjectFuture<'a, String> {
        Box::pin(async move {
            self.with_objects(|objects| {
                let current = objects.get(key).map(|d| content_etag(d));
                if !precondition.holds(current.as_deref()) {
                    return Err(conflict(key));
                }
                let etag = content_etag(&data);
                objects.insert(key.to_string(), data);
                Ok(etag)
            })
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> ObjectFuture<'a, Vec<String>> {
        Box::pin(async move {
            Ok(self.with_objects(|objects| {
                objects
                    .keys()
                    .filter(|k| k.starts_with(prefix))
                    .cloned()
                    .collect()
            }))
        })
    }
}

// ── Shared directory ───────────────────────────────────────────────

/// Lock file under the root serialising writers across processes.
pub const LOCK_FILE: &str = ".ledger.lock";

/// Ledger backend in a directory, typically a mount shared by every
/// instance. Keys map to relative paths.
///
/// Writers take an exclusive advisory lock on [`LOCK_FILE`] around the
/// precondition check and the rename, so separate processes (and separate
/// stores in one process) see each conditional write atomically. Bodies are
/// written to a uniquely named temp file beside the target first. Dotfiles
/// are never listed.
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> LedgerResult<PathBuf> {
        let relative = Path::new(key);
        let plain = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !plain {
            return Err(LedgerError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(relative))
    }

    fn lock_root(root: &Path) -> LedgerResult<File> {
        std::fs::create_dir_all(root)?;
        let lock = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(root.join(LOCK_FILE))?;
        // Released when the file is closed.
        FileExt::lock_exclusive(&lock)?;
        Ok(lock)
    }

    fn read_current(path: &Path) -> LedgerResult<Option<Vec<u8>>> {
        match std::fs::read(path) {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn put_locked(
        root: &Path,
        path: &Path,
        key: &str,
        data: &[u8],
        precondition: &Precondition,
    ) -> LedgerResult<String> {
        let _lock = Self::lock_root(root)?;

        let current = Self::read_current(path)?;
        let current_tag = current.as_deref().map(content_etag);
        if !precondition.holds(current_tag.as_deref()) {
            return Err(conflict(key));
        }

        let parent = path
            .parent()
            .ok_or_else(|| LedgerError::InvalidKey(key.to_string()))?;
        std::fs::create_dir_all(parent)?;
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;

        match precondition {
            Precondition::IfNoneMatch => {
                tmp.persist_noclobber(path).map_err(|e| {
                    if e.error.kind() == ErrorKind::AlreadyExists {
                        conflict(key)
                    } else {
                        LedgerError::Io(e.error)
                    }
                })?;
            }
            Precondition::IfMatch(_) => {
                tmp.persist(path).map_err(|e| LedgerError::Io(e.error))?;
            }
        }
        Ok(content_etag(data))
    }
}

impl ObjectStore for FsObjectStore {
    fn get<'a>(&'a self, key: &'a str) -> ObjectFuture<'a, Option<StoredObject>> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let data = match tokio::fs::read(&path).await {
                Ok(data) => data,
                Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
                Err(e) => return Err(e.into()),
            };
            Ok(Some(StoredObject {
                etag: content_etag(&data),
                data,
            }))
        })
    }

    fn put<'a>(
        &'a self,
        key: &'a str,
        data: Vec<u8>,
        precondition: Precondition,
    ) -> ObjectFuture<'a, String> {
        Box::pin(async move {
            let path = self.path_for(key)?;
            let root = self.root.clone();
            let owned_key = key.to_string();
            let etag = tokio::task::spawn_blocking(move || {
                Self::put_locked(&root, &path, &owned_key, &data, &precondition)
            })
            .await
            .map_err(|e| LedgerError::Io(std::io::Error::other(e)))??;
            debug!(%key, %etag, "object written");
            Ok(etag)
        })
    }

    fn list<'a>(&'a self, prefix: &'a str) -> ObjectFuture<'a, Vec<String>> {
        Box::pin(async move {
            let mut keys = Vec::new();
            let mut pending = vec![self.root.clone()];
            while let Some(dir) = pending.pop() {
                let mut entries = match tokio::fs::read_dir(&dir).await {
                    Ok(entries) => entries,
                    Err(e) if e.kind() == ErrorKind::NotFound => continue,
                    Err(e) => return Err(e.into()),
                };
                while let Some(entry) = entries.next_entry().await? {
                    let path = entry.path();
                    if entry.file_type().await?.is_dir() {
                        pending.push(path);
                        continue;
                    }
                    if entry.file_name().to_string_lossy().starts_with('.') {
                        continue;
                    }
                    let Ok(relative) = path.strip_prefix(&self.root) else {
                        continue;
                    };
                    let key = relative
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy())
                        .collect::<Vec<_>>()
                        .join("/");
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
            keys.sort();
            Ok(keys)
        })
    }
}
