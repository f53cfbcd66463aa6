//! Durable per-source state storage + webhook delivery utilities for regwatch.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use regwatch_core::{Record, RunState};
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

pub mod webhook;

pub use webhook::{
    classify_reqwest_error, classify_status, BackoffPolicy, DeliveryError, RetryDisposition,
    WebhookClient, WebhookConfig,
};

const RUN_STATE_NAMESPACE: &str = "state";
const RETENTION_NAMESPACE: &str = "records";

/// Addresses one stored document: `<namespace>/<name>.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StorageKey {
    namespace: &'static str,
    name: String,
}

impl StorageKey {
    pub fn run_state(source_id: &str) -> Self {
        Self {
            namespace: RUN_STATE_NAMESPACE,
            name: source_id.to_string(),
        }
    }

    pub fn retention_set(source_id: &str) -> Self {
        Self {
            namespace: RETENTION_NAMESPACE,
            name: source_id.to_string(),
        }
    }

    pub fn relative_path(&self) -> PathBuf {
        PathBuf::from(self.namespace).join(format!("{}.json", self.name))
    }
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("stored value {key} is corrupt: {reason}")]
    Corrupt { key: String, reason: String },
    #[error("cannot read {key}: {source}")]
    Unreadable {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot write {key}: {source}")]
    Unwritable {
        key: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot encode {key}: {reason}")]
    Encode { key: String, reason: String },
}

/// Byte-level get/put keyed by [`StorageKey`]; a missing key is `Ok(None)`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError>;
    async fn put(&self, key: &StorageKey, bytes: &[u8]) -> Result<(), StorageError>;
}

#[derive(Debug, Clone)]
pub struct FileBackend {
    root: PathBuf,
}

impl FileBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn path_for(&self, key: &StorageKey) -> PathBuf {
        self.root.join(key.relative_path())
    }

    /// Sweeps temp files left in the state and records directories by an interrupted process.
    pub async fn sweep_temp_files(&self) -> std::io::Result<usize> {
        let mut removed = 0;
        for namespace in [RUN_STATE_NAMESPACE, RETENTION_NAMESPACE] {
            removed += remove_stale_temp_files(&self.root.join(namespace)).await?;
        }
        if removed > 0 {
            warn!(removed, root = %self.root.display(), "removed stale temp files");
        }
        Ok(removed)
    }
}

#[async_trait]
impl StorageBackend for FileBackend {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        match fs::read(self.path_for(key)).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StorageError::Unreadable {
                key: key.to_string(),
                source,
            }),
        }
    }

    async fn put(&self, key: &StorageKey, bytes: &[u8]) -> Result<(), StorageError> {
        write_atomic(&self.path_for(key), bytes)
            .await
            .map_err(|source| StorageError::Unwritable {
                key: key.to_string(),
                source,
            })
    }
}

/// A temp file next to its final destination, removed on drop unless persisted.
///
/// Dropping covers aborted tasks too, so a cancelled write leaves no `.tmp` behind.
#[derive(Debug)]
pub struct TempPath {
    path: PathBuf,
    armed: bool,
}

impl TempPath {
    pub fn next_to(target: &Path) -> Self {
        let parent = target.parent().unwrap_or_else(|| Path::new("."));
        let stem = target
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_default();
        Self {
            path: parent.join(format!(".{stem}.{}{TEMP_SUFFIX}", Uuid::new_v4())),
            armed: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Renames the temp file over `target`; on failure the temp file is still cleaned up.
    pub async fn persist(mut self, target: &Path) -> std::io::Result<()> {
        fs::rename(&self.path, target).await?;
        self.armed = false;
        Ok(())
    }
}

impl Drop for TempPath {
    fn drop(&mut self) {
        if self.armed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

const TEMP_SUFFIX: &str = ".tmp";

/// Replaces `path` with `bytes` via a temp file in the same directory and a rename,
/// so readers only ever observe the old or the new contents.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).await?;

    let temp = TempPath::next_to(path);
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(temp.path())
        .await?;
    file.write_all(bytes).await?;
    file.flush().await?;
    file.sync_all().await?;
    drop(file);

    temp.persist(path).await
}

/// Deletes leftover temp files in `dir` (from a crash mid-write). Missing dirs count as clean.
pub async fn remove_stale_temp_files(dir: &Path) -> std::io::Result<usize> {
    let mut entries = match fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err),
    };
    let mut removed = 0;
    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') && name.ends_with(TEMP_SUFFIX) {
            fs::remove_file(entry.path()).await?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// In-process backend; also lets callers plant raw bytes and simulate write failures.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    entries: Mutex<HashMap<StorageKey, Vec<u8>>>,
    unwritable: Mutex<HashSet<StorageKey>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_raw(&self, key: StorageKey, bytes: impl Into<Vec<u8>>) {
        self.entries.lock().await.insert(key, bytes.into());
    }

    pub async fn raw(&self, key: &StorageKey) -> Option<Vec<u8>> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn set_unwritable(&self, key: StorageKey, unwritable: bool) {
        let mut keys = self.unwritable.lock().await;
        if unwritable {
            keys.insert(key);
        } else {
            keys.remove(&key);
        }
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &StorageKey) -> Result<Option<Vec<u8>>, StorageError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &StorageKey, bytes: &[u8]) -> Result<(), StorageError> {
        if self.unwritable.lock().await.contains(key) {
            return Err(StorageError::Unwritable {
                key: key.to_string(),
                source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only"),
            });
        }
        self.entries.lock().await.insert(key.clone(), bytes.to_vec());
        Ok(())
    }
}

async fn get_json<T: DeserializeOwned>(
    backend: &dyn StorageBackend,
    key: &StorageKey,
) -> Result<Option<T>, StorageError> {
    let Some(bytes) = backend.get(key).await? else {
        return Ok(None);
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|err| StorageError::Corrupt {
            key: key.to_string(),
            reason: err.to_string(),
        })
}

async fn put_json<T: Serialize + ?Sized>(
    backend: &dyn StorageBackend,
    key: &StorageKey,
    value: &T,
) -> Result<(), StorageError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|err| StorageError::Encode {
        key: key.to_string(),
        reason: err.to_string(),
    })?;
    backend.put(key, &bytes).await
}

/// Loads and saves each source's [`RunState`].
///
/// Loading never fails: a missing, unreadable or corrupt document yields a
/// fresh state, which at worst re-emits a few records the merger dedups anyway.
#[derive(Clone)]
pub struct RunStateStore {
    backend: Arc<dyn StorageBackend>,
}

impl RunStateStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub async fn load(&self, source_id: &str) -> RunState {
        let key = StorageKey::run_state(source_id);
        match get_json(self.backend.as_ref(), &key).await {
            Ok(Some(state)) => state,
            Ok(None) => RunState::default(),
            Err(err) => {
                warn!(source_id, error = %err, "run state unusable; starting fresh");
                RunState::default()
            }
        }
    }

    pub async fn save(&self, source_id: &str, state: &RunState) -> Result<(), StorageError> {
        put_json(self.backend.as_ref(), &StorageKey::run_state(source_id), state).await
    }
}

/// Loads and saves each source's retention set (the externally visible output).
#[derive(Clone)]
pub struct RetentionStore {
    backend: Arc<dyn StorageBackend>,
}

impl RetentionStore {
    pub fn new(backend: Arc<dyn StorageBackend>) -> Self {
        Self { backend }
    }

    pub async fn load(&self, source_id: &str) -> Vec<Record> {
        let key = StorageKey::retention_set(source_id);
        match get_json(self.backend.as_ref(), &key).await {
            Ok(Some(records)) => records,
            Ok(None) => Vec::new(),
            Err(err) => {
                warn!(source_id, error = %err, "retention set unusable; treating as empty");
                Vec::new()
            }
        }
    }

    pub async fn save(&self, source_id: &str, records: &[Record]) -> Result<(), StorageError> {
        put_json(
            self.backend.as_ref(),
            &StorageKey::retention_set(source_id),
            records,
        )
        .await
    }
}
