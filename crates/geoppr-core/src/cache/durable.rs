//! Persistent key/value store backed by one JSON file per key.
//!
//! Two invalidation strategies share the same contract:
//!
//! - `Ttl`: entries older than the TTL read as absent and are deleted.
//! - `SessionBoundary`: the first initialization in a new logical session
//!   purges the whole store once; entries then live until the next session.
//!
//! The store initializes lazily on first use. If the directory cannot be
//! created it becomes unavailable: reads miss and writes are dropped, so
//! callers fall back to the network.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use chrono::Duration;
use rand::Rng;
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::Serialize;
use tokio::fs;
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

use super::CacheEntry;

/// Entries expire after one day under the TTL strategy.
pub const DEFAULT_TTL_HOURS: i64 = 24;

/// Marker file recording which session last initialized the directory.
const SESSION_MARKER: &str = ".session";

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurableStrategy {
    Ttl { ttl: Duration },
    SessionBoundary { session_id: String },
}

impl DurableStrategy {
    pub fn default_ttl() -> Self {
        DurableStrategy::Ttl {
            ttl: Duration::hours(DEFAULT_TTL_HOURS),
        }
    }

    /// Session-boundary strategy with a fresh random session id.
    pub fn new_session() -> Self {
        DurableStrategy::SessionBoundary {
            session_id: generate_session_id(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            DurableStrategy::Ttl { .. } => "ttl",
            DurableStrategy::SessionBoundary { .. } => "session",
        }
    }
}

impl Default for DurableStrategy {
    fn default() -> Self {
        Self::default_ttl()
    }
}

pub fn generate_session_id() -> String {
    let mut rng = rand::thread_rng();
    format!("{:016x}{:016x}", rng.gen::<u64>(), rng.gen::<u64>())
}

#[derive(Debug)]
enum Backend {
    Ready,
    Unavailable,
}

pub struct DurableCache {
    dir: PathBuf,
    strategy: DurableStrategy,
    backend: OnceCell<Backend>,
    purges: AtomicUsize,
}

impl DurableCache {
    /// No I/O happens until the first operation.
    pub fn new(dir: PathBuf, strategy: DurableStrategy) -> Self {
        Self {
            dir,
            strategy,
            backend: OnceCell::new(),
            purges: AtomicUsize::new(0),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn strategy(&self) -> &DurableStrategy {
        &self.strategy
    }

    /// Number of session-boundary purges this instance performed.
    pub fn purge_count(&self) -> usize {
        self.purges.load(Ordering::SeqCst)
    }

    pub async fn is_available(&self) -> bool {
        matches!(self.backend().await, Backend::Ready)
    }

    async fn backend(&self) -> &Backend {
        self.backend.get_or_init(|| self.initialize()).await
    }

    async fn initialize(&self) -> Backend {
        if let Err(e) = fs::create_dir_all(&self.dir).await {
            warn!(dir = ?self.dir, error = %e, "Durable cache unavailable, continuing without it");
            return Backend::Unavailable;
        }

        if let DurableStrategy::SessionBoundary { session_id } = &self.strategy {
            if let Err(e) = self.enter_session(session_id).await {
                // Serving a previous session's data would break the purge guarantee
                warn!(dir = ?self.dir, error = %e, "Session purge failed, durable cache disabled");
                return Backend::Unavailable;
            }
        }

        debug!(dir = ?self.dir, strategy = self.strategy.name(), "Durable cache ready");
        Backend::Ready
    }

    /// Purge the store unless the marker already names `session_id`.
    async fn enter_session(&self, session_id: &str) -> Result<bool> {
        let marker = self.dir.join(SESSION_MARKER);
        let previous = fs::read_to_string(&marker).await.ok();
        if previous.as_deref().map(str::trim) == Some(session_id) {
            debug!("Existing session, durable cache kept");
            return Ok(false);
        }

        self.remove_entries().await?;
        write_atomic(&marker, session_id.as_bytes()).await?;
        self.purges.fetch_add(1, Ordering::SeqCst);
        info!(previous = ?previous, "New session detected, durable cache purged");
        Ok(true)
    }

    fn entry_path(&self, key: &str) -> Option<PathBuf> {
        let valid = !key.is_empty()
            && key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
        if valid {
            Some(self.dir.join(format!("{}.{}", key, ENTRY_EXTENSION)))
        } else {
            warn!(key, "Rejected invalid cache key");
            None
        }
    }

    /// Store `data` under `key` with a fresh timestamp.
    pub async fn save<T: Serialize>(&self, key: &str, data: &T) -> Result<()> {
        self.write_entry(key, &CacheEntry::new(data)).await
    }

    async fn write_entry<T: Serialize>(&self, key: &str, entry: &CacheEntry<T>) -> Result<()> {
        if !matches!(self.backend().await, Backend::Ready) {
            return Ok(());
        }
        let Some(path) = self.entry_path(key) else {
            return Ok(());
        };
        let contents = serde_json::to_vec(entry)
            .with_context(|| format!("Failed to serialize cache entry: {}", key))?;
        write_atomic(&path, &contents)
            .await
            .with_context(|| format!("Failed to write cache file: {}", key))?;
        debug!(key, bytes = contents.len(), "Durable cache saved");
        Ok(())
    }

    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.get_entry(key).await.map(|entry| entry.data)
    }

    /// Read an entry, deleting it if it is expired or unreadable.
    pub async fn get_entry<T: DeserializeOwned>(&self, key: &str) -> Option<CacheEntry<T>> {
        if !matches!(self.backend().await, Backend::Ready) {
            return None;
        }
        let path = self.entry_path(key)?;

        let contents = match fs::read(&path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!(key, error = %e, "Failed to read cache file");
                return None;
            }
        };

        let entry: CacheEntry<T> = match serde_json::from_slice(&contents) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(key, error = %e, "Discarding unreadable cache entry");
                self.remove(key).await;
                return None;
            }
        };

        if let DurableStrategy::Ttl { ttl } = &self.strategy {
            if entry.is_expired(*ttl) {
                debug!(key, age_minutes = entry.age_minutes(), "Cache entry expired");
                self.remove(key).await;
                return None;
            }
        }

        Some(entry)
    }

    /// True when `key` holds a live entry. Expired entries are deleted.
    pub async fn contains(&self, key: &str) -> bool {
        self.get_entry::<IgnoredAny>(key).await.is_some()
    }

    pub async fn remove(&self, key: &str) {
        if !matches!(self.backend().await, Backend::Ready) {
            return;
        }
        let Some(path) = self.entry_path(key) else {
            return;
        };
        if let Err(e) = fs::remove_file(&path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(key, error = %e, "Failed to remove cache file");
            }
        }
    }

    /// Remove every entry. The session marker survives.
    pub async fn clear(&self) -> Result<()> {
        if !matches!(self.backend().await, Backend::Ready) {
            return Ok(());
        }
        self.remove_entries().await?;
        debug!(dir = ?self.dir, "Durable cache cleared");
        Ok(())
    }

    async fn remove_entries(&self) -> Result<()> {
        let mut dir = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("Failed to list cache directory {:?}", self.dir))?;
        while let Some(item) = dir.next_entry().await? {
            let path = item.path();
            let is_entry = path
                .extension()
                .map(|ext| ext == ENTRY_EXTENSION)
                .unwrap_or(false);
            if is_entry {
                fs::remove_file(&path)
                    .await
                    .with_context(|| format!("Failed to remove {:?}", path))?;
            }
        }
        Ok(())
    }
}

/// Write through a temporary sibling and rename, so readers only ever see
/// a complete file.
async fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let suffix: u32 = rand::thread_rng().gen();
    let tmp = path.with_extension(format!("tmp{:08x}", suffix));
    fs::write(&tmp, contents).await?;
    if let Err(e) = fs::rename(&tmp, path).await {
        let _ = fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    Ok(())
}
