//! Local copy cache wrapped around another locator.
//!
//! [`CachingLocator`] keeps copies of images fetched through an inner locator
//! under `<dir>/objects/`, keyed by the SHA-256 of the reference (the content
//! is not known before the first fetch). The index of copies is persisted to
//! `<dir>/index.msgpack` so repeated runs start warm.
//!
//! # Budget and eviction
//!
//! The bytes tracked by the index never exceed `max_bytes`. Checking the
//! budget, evicting least-recently-used copies and inserting the new copy
//! happen in one critical section under the index lock, so two workers can
//! never both believe there is room. Fetches run outside that lock; a per-key
//! async lock keeps one fetch per reference in flight.
//!
//! # Leases
//!
//! A cached [`ResolvedImage`] carries a lease that pins its copy until the
//! value is dropped. Pinned copies are never evicted or cleared.
//!
//! # Degradation
//!
//! The cache is an optimisation, not a source of truth. If a copy cannot be
//! stored (I/O failure, object bigger than the whole budget, everything
//! pinned) the request is answered from the bytes already fetched, staged
//! under `<dir>/staging/`, and counted as a bypass.
//!
//! Hit, miss, eviction and bypass counters are persisted with the index, so
//! they accumulate across processes.

mod eviction;

pub use eviction::{EvictionCandidate, plan_eviction};

use crate::core::config::LocalCacheConfig;
use crate::core::io::{is_temp_file, read_optional, write_atomic};
use crate::hash::hash_key;
use crate::locator::{ImageLocator, LocatorKind, ResolvedImage};
use crate::types::ImageRef;
use crate::{Result, SpecimenError};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

const OBJECTS_DIR: &str = "objects";
const STAGING_DIR: &str = "staging";
const INDEX_FILE: &str = "index.msgpack";
const INDEX_FORMAT_VERSION: u32 = 1;

/// Point-in-time cache statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub bypasses: u64,
    pub entries: usize,
    pub current_bytes: u64,
    pub max_bytes: u64,
}

/// One local copy tracked by the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalCopy {
    pub key: String,
    pub reference: String,
    pub size: u64,
    /// Millisecond access stamp, strictly increasing per cache instance.
    pub last_access: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct PersistedIndex {
    version: u32,
    entries: Vec<LocalCopy>,
    #[serde(default)]
    counters: PersistedCounters,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct PersistedCounters {
    hits: u64,
    misses: u64,
    evictions: u64,
    bypasses: u64,
}

#[derive(Default)]
struct IndexState {
    entries: HashMap<String, LocalCopy>,
    pins: HashMap<String, usize>,
    total_bytes: u64,
    last_stamp: u64,
}

impl IndexState {
    fn next_stamp(&mut self) -> u64 {
        let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }

    fn is_pinned(&self, key: &str) -> bool {
        self.pins.get(key).is_some_and(|count| *count > 0)
    }

    fn candidates(&self) -> Vec<EvictionCandidate> {
        self.entries
            .values()
            .map(|entry| EvictionCandidate {
                key: entry.key.clone(),
                last_access: entry.last_access,
                size: entry.size,
                pinned: self.is_pinned(&entry.key),
            })
            .collect()
    }

    fn insert(&mut self, entry: LocalCopy) {
        self.total_bytes += entry.size;
        if let Some(previous) = self.entries.insert(entry.key.clone(), entry) {
            self.total_bytes -= previous.size;
        }
    }

    fn remove(&mut self, key: &str) -> Option<LocalCopy> {
        let removed = self.entries.remove(key)?;
        self.total_bytes -= removed.size;
        Some(removed)
    }
}

#[derive(Default)]
struct CacheCounters {
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bypasses: AtomicU64,
}

impl CacheCounters {
    fn snapshot(&self) -> PersistedCounters {
        PersistedCounters {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            bypasses: self.bypasses.load(Ordering::Relaxed),
        }
    }

    fn restore(&self, counters: PersistedCounters) {
        self.hits.store(counters.hits, Ordering::Relaxed);
        self.misses.store(counters.misses, Ordering::Relaxed);
        self.evictions.store(counters.evictions, Ordering::Relaxed);
        self.bypasses.store(counters.bypasses, Ordering::Relaxed);
    }
}

struct CacheShared {
    dir: PathBuf,
    objects_dir: PathBuf,
    staging_dir: PathBuf,
    index_path: PathBuf,
    max_bytes: u64,
    index: Mutex<IndexState>,
    counters: CacheCounters,
}

impl CacheShared {
    fn object_path(&self, key: &str) -> PathBuf {
        self.objects_dir.join(key)
    }

    fn pin(self: &Arc<Self>, state: &mut IndexState, key: &str) -> CacheLease {
        *state.pins.entry(key.to_string()).or_insert(0) += 1;
        CacheLease {
            shared: Arc::clone(self),
            key: key.to_string(),
        }
    }

    /// Persist the index. Failures only cost warmth on the next start.
    fn persist(&self, state: &IndexState) {
        let mut entries: Vec<LocalCopy> = state.entries.values().cloned().collect();
        entries.sort_by(|a, b| a.key.cmp(&b.key));
        let index = PersistedIndex {
            version: INDEX_FORMAT_VERSION,
            entries,
            counters: self.counters.snapshot(),
        };

        let result = rmp_serde::to_vec(&index)
            .map_err(SpecimenError::from)
            .and_then(|bytes| write_atomic(&self.index_path, &bytes));
        if let Err(e) = result {
            tracing::warn!("Failed to persist cache index {}: {}", self.index_path.display(), e);
        }
    }

    /// Count one event and persist it.
    fn count(&self, counter: &AtomicU64) {
        let state = self.index.lock();
        counter.fetch_add(1, Ordering::Relaxed);
        self.persist(&state);
    }

    /// Delete victims chosen by the planner. Stops at the first deletion
    /// failure, leaving that entry tracked so the budget stays truthful.
    fn evict(&self, state: &mut IndexState, victims: &[String]) -> Result<()> {
        for key in victims {
            match std::fs::remove_file(self.object_path(key)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(SpecimenError::cache_with_source(
                        format!("Failed to evict local copy {}", key),
                        e,
                    ));
                }
            }
            if let Some(entry) = state.remove(key) {
                tracing::debug!("Evicted local copy of {} ({} bytes)", entry.reference, entry.size);
            }
            self.counters.evictions.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }
}

/// Keeps a copy pinned while a caller holds the resolved path.
pub struct CacheLease {
    shared: Arc<CacheShared>,
    key: String,
}

impl Drop for CacheLease {
    fn drop(&mut self) {
        let mut state = self.shared.index.lock();
        if let Some(count) = state.pins.get_mut(&self.key) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                state.pins.remove(&self.key);
            }
        }
    }
}

/// Caching decorator over any [`ImageLocator`].
///
/// From the caller's perspective `resolve`, `read_bytes` and `list` behave
/// exactly like the wrapped locator; the only observable differences are
/// latency and the files under the cache directory.
pub struct CachingLocator<L> {
    inner: L,
    shared: Arc<CacheShared>,
    fetch_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl<L: ImageLocator> CachingLocator<L> {
    /// Open (or create) the cache directory and reconcile its index with the
    /// files actually present.
    pub fn open(inner: L, config: &LocalCacheConfig) -> Result<Self> {
        Self::with_budget(inner, &config.dir, config.max_bytes)
    }

    pub fn with_budget(inner: L, dir: impl AsRef<Path>, max_bytes: u64) -> Result<Self> {
        if max_bytes == 0 {
            return Err(SpecimenError::invalid_argument("cache budget must be greater than zero"));
        }

        let dir = dir.as_ref().to_path_buf();
        let objects_dir = dir.join(OBJECTS_DIR);
        let staging_dir = dir.join(STAGING_DIR);
        for path in [&objects_dir, &staging_dir] {
            std::fs::create_dir_all(path).map_err(|e| {
                SpecimenError::cache_with_source(format!("Failed to create cache directory {}", path.display()), e)
            })?;
        }

        let shared = Arc::new(CacheShared {
            index_path: dir.join(INDEX_FILE),
            dir,
            objects_dir,
            staging_dir,
            max_bytes,
            index: Mutex::new(IndexState::default()),
            counters: CacheCounters::default(),
        });

        {
            let mut state = shared.index.lock();
            *state = load_index(&shared)?;

            if state.total_bytes > shared.max_bytes {
                let victims = plan_eviction(&state.candidates(), state.total_bytes, 0, shared.max_bytes)
                    .unwrap_or_default();
                shared.evict(&mut state, &victims)?;
            }
            shared.persist(&state);

            tracing::debug!(
                "Opened local cache {} with {} entries ({} / {} bytes)",
                shared.dir.display(),
                state.entries.len(),
                state.total_bytes,
                shared.max_bytes
            );
        }

        Ok(Self {
            inner,
            shared,
            fetch_locks: DashMap::new(),
        })
    }

    pub fn inner(&self) -> &L {
        &self.inner
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn stats(&self) -> LocalCacheStats {
        let state = self.shared.index.lock();
        let counters = &self.shared.counters;
        LocalCacheStats {
            hits: counters.hits.load(Ordering::Relaxed),
            misses: counters.misses.load(Ordering::Relaxed),
            evictions: counters.evictions.load(Ordering::Relaxed),
            bypasses: counters.bypasses.load(Ordering::Relaxed),
            entries: state.entries.len(),
            current_bytes: state.total_bytes,
            max_bytes: self.shared.max_bytes,
        }
    }

    /// Snapshot of the index, oldest access first.
    pub fn entries(&self) -> Vec<LocalCopy> {
        let state = self.shared.index.lock();
        let mut entries: Vec<LocalCopy> = state.entries.values().cloned().collect();
        entries.sort_by_key(|entry| entry.last_access);
        entries
    }

    /// Remove every local copy that is not currently leased.
    ///
    /// Returns the number of removed copies and the bytes freed.
    pub fn clear(&self) -> Result<(usize, u64)> {
        let mut state = self.shared.index.lock();
        let removable: Vec<String> = state
            .entries
            .keys()
            .filter(|key| !state.is_pinned(key))
            .cloned()
            .collect();

        let mut removed_count = 0;
        let mut removed_bytes = 0;
        for key in removable {
            match std::fs::remove_file(self.shared.object_path(&key)) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    tracing::debug!("Failed to remove local copy {}: {}", key, e);
                    continue;
                }
            }
            if let Some(entry) = state.remove(&key) {
                removed_count += 1;
                removed_bytes += entry.size;
            }
        }

        self.shared.persist(&state);
        Ok((removed_count, removed_bytes))
    }

    /// Serve a copy already in the index, touching its access stamp.
    fn lookup(&self, key: &str) -> Option<ResolvedImage> {
        let mut state = self.shared.index.lock();
        let size = state.entries.get(key)?.size;
        let path = self.shared.object_path(key);

        if !path.is_file() {
            tracing::debug!("Local copy {} vanished, dropping it from the index", key);
            state.remove(key);
            self.shared.persist(&state);
            return None;
        }

        let stamp = state.next_stamp();
        if let Some(entry) = state.entries.get_mut(key) {
            entry.last_access = stamp;
        }
        let lease = self.shared.pin(&mut state, key);
        self.shared.counters.hits.fetch_add(1, Ordering::Relaxed);
        self.shared.persist(&state);
        drop(state);

        Some(ResolvedImage::leased(path, size, lease))
    }

    /// Write the copy next to its final place, then budget check, eviction,
    /// rename and insertion as one critical section.
    async fn store(&self, key: &str, reference: &ImageRef, bytes: &[u8]) -> Result<ResolvedImage> {
        let size = bytes.len() as u64;
        let no_room = || {
            SpecimenError::cache(format!(
                "No room for {} ({} bytes) within the {} byte budget",
                reference, size, self.shared.max_bytes
            ))
        };
        if size > self.shared.max_bytes {
            return Err(no_room());
        }

        let pending = tempfile::Builder::new()
            .prefix(&format!("{}.tmp.", key))
            .tempfile_in(&self.shared.objects_dir)?
            .into_temp_path();
        tokio::fs::write(&pending, bytes).await?;

        let mut state = self.shared.index.lock();

        let victims =
            plan_eviction(&state.candidates(), state.total_bytes, size, self.shared.max_bytes).ok_or_else(no_room)?;
        self.shared.evict(&mut state, &victims)?;

        let path = self.shared.object_path(key);
        pending
            .persist(&path)
            .map_err(|e| SpecimenError::cache_with_source(format!("Failed to store local copy of {}", reference), e.error))?;

        let stamp = state.next_stamp();
        state.insert(LocalCopy {
            key: key.to_string(),
            reference: reference.to_string(),
            size,
            last_access: stamp,
        });
        let lease = self.shared.pin(&mut state, key);
        self.shared.persist(&state);
        drop(state);

        Ok(ResolvedImage::leased(path, size, lease))
    }

    /// Hand out bytes that could not be cached as a staged file.
    async fn stage(&self, bytes: &[u8]) -> Result<ResolvedImage> {
        let staged = tempfile::Builder::new()
            .prefix("bypass-")
            .tempfile_in(&self.shared.staging_dir)?
            .into_temp_path();
        tokio::fs::write(&staged, bytes).await?;
        Ok(ResolvedImage::staged(staged, bytes.len() as u64))
    }

    fn fetch_lock(&self, key: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.fetch_locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    fn release_fetch_lock(&self, key: &str) {
        self.fetch_locks.remove_if(key, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Cached copy of `reference`, fetching it through the inner locator on a
    /// miss. `Ok(Err(bytes))` means the copy could not be stored and the
    /// caller should answer from the already fetched bytes or the inner locator.
    async fn cached_copy(&self, reference: &ImageRef) -> Result<std::result::Result<ResolvedImage, Vec<u8>>> {
        let key = hash_key(reference.as_str());

        if let Some(image) = self.lookup(&key) {
            return Ok(Ok(image));
        }

        let lock = self.fetch_lock(&key);
        let outcome = {
            let _guard = lock.lock().await;

            if let Some(image) = self.lookup(&key) {
                Ok(Ok(image))
            } else {
                self.shared.counters.misses.fetch_add(1, Ordering::Relaxed);
                match self.inner.read_bytes(reference).await {
                    Ok(bytes) => match self.store(&key, reference, &bytes).await {
                        Ok(image) => Ok(Ok(image)),
                        Err(e) => {
                            tracing::warn!("Bypassing local cache for {}: {}", reference, e);
                            self.shared.count(&self.shared.counters.bypasses);
                            Ok(Err(bytes))
                        }
                    },
                    Err(e) => {
                        self.shared.persist(&self.shared.index.lock());
                        Err(e)
                    }
                }
            }
        };
        drop(lock);
        self.release_fetch_lock(&key);

        outcome
    }
}

fn load_index(shared: &CacheShared) -> Result<IndexState> {
    let mut state = IndexState::default();

    if let Some(bytes) = read_optional(&shared.index_path)? {
        match rmp_serde::from_slice::<PersistedIndex>(&bytes) {
            Ok(index) if index.version == INDEX_FORMAT_VERSION => {
                shared.counters.restore(index.counters);
                for mut entry in index.entries {
                    match std::fs::metadata(shared.object_path(&entry.key)) {
                        Ok(metadata) if metadata.is_file() => {
                            entry.size = metadata.len();
                            state.last_stamp = state.last_stamp.max(entry.last_access);
                            state.insert(entry);
                        }
                        _ => tracing::debug!("Dropping index entry {} without a local copy", entry.key),
                    }
                }
            }
            Ok(index) => {
                tracing::warn!(
                    "Ignoring cache index with unsupported format version {} at {}",
                    index.version,
                    shared.index_path.display()
                );
            }
            Err(e) => {
                tracing::warn!("Ignoring unreadable cache index {}: {}", shared.index_path.display(), e);
            }
        }
    }

    let read_dir = std::fs::read_dir(&shared.objects_dir)
        .map_err(|e| SpecimenError::cache_with_source("Failed to read cache directory", e))?;
    for entry in read_dir.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if state.entries.contains_key(&name) && !is_temp_file(&name) {
            continue;
        }
        // Never indexed: a crash between write and persist, or an abandoned temp file.
        if let Err(e) = std::fs::remove_file(entry.path()) {
            tracing::debug!("Failed to remove orphaned cache file {}: {}", name, e);
        }
    }

    if let Ok(read_dir) = std::fs::read_dir(&shared.staging_dir) {
        for entry in read_dir.flatten() {
            if let Err(e) = std::fs::remove_file(entry.path()) {
                tracing::debug!("Failed to remove stale staged file {}: {}", entry.path().display(), e);
            }
        }
    }

    Ok(state)
}

#[async_trait]
impl<L: ImageLocator> ImageLocator for CachingLocator<L> {
    fn kind(&self) -> LocatorKind {
        LocatorKind::Caching
    }

    async fn resolve(&self, reference: &ImageRef) -> Result<ResolvedImage> {
        match self.cached_copy(reference).await? {
            Ok(image) => Ok(image),
            Err(bytes) => match self.stage(&bytes).await {
                Ok(image) => Ok(image),
                Err(e) => {
                    tracing::warn!("Failed to stage {} outside the cache: {}", reference, e);
                    self.inner.resolve(reference).await
                }
            },
        }
    }

    async fn read_bytes(&self, reference: &ImageRef) -> Result<Vec<u8>> {
        match self.cached_copy(reference).await? {
            Ok(image) => Ok(tokio::fs::read(image.path()).await?),
            Err(bytes) => Ok(bytes),
        }
    }

    async fn list(&self) -> Result<Vec<ImageRef>> {
        self.inner.list().await
    }

    fn cache_stats(&self) -> Option<LocalCacheStats> {
        Some(self.stats())
    }
}
