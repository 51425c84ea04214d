mod identity;
mod loader;

pub use identity::FileIdentity;
pub use loader::{ContentLoader, Loaded};

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, trace};

use crate::access::FileContent;
use crate::errors::{EngineError, EngineResult};

/// A cached file body with the access statistics that drive eviction
#[derive(Debug, Clone)]
pub struct CacheEntry {
    identity: FileIdentity,
    content: FileContent,
    size: u64,
    last_access: Instant,
    access_count: u64,
    hot_score: f64,
    pinned: bool,
}

impl CacheEntry {
    fn new(identity: FileIdentity, content: FileContent, now: Instant) -> Self {
        let size = content.len() as u64;
        Self {
            identity,
            content,
            size,
            last_access: now,
            access_count: 1,
            hot_score: 1.0,
            pinned: false,
        }
    }

    /// Updates access statistics when this entry is used
    fn mark_accessed(&mut self, now: Instant, half_life: Duration) {
        self.access_count += 1;
        self.last_access = now;
        self.hot_score = self.score_at(now, half_life);
    }

    /// `access_count` faded by how long ago the entry was last touched
    pub fn score_at(&self, now: Instant, half_life: Duration) -> f64 {
        let idle = now.saturating_duration_since(self.last_access);
        self.access_count as f64 * decay(idle, half_life)
    }

    pub fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    pub fn content(&self) -> &FileContent {
        &self.content
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn access_count(&self) -> u64 {
        self.access_count
    }

    pub fn hot_score(&self) -> f64 {
        self.hot_score
    }

    pub fn is_pinned(&self) -> bool {
        self.pinned
    }
}

/// Exponential fade: 1.0 when fresh, 0.5 after one half-life
fn decay(idle: Duration, half_life: Duration) -> f64 {
    0.5f64.powf(idle.as_secs_f64() / half_life.as_secs_f64())
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<PathBuf, CacheEntry>,
    total_bytes: u64,
    pinned: HashSet<PathBuf>,
}

impl CacheState {
    fn remove(&mut self, path: &Path) -> Option<CacheEntry> {
        let entry = self.entries.remove(path)?;
        self.total_bytes -= entry.size;
        Some(entry)
    }
}

/// Cache statistics snapshot
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub bytes: u64,
    pub count: u64,
    pub capacity: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub evictions: u64,
    pub bypassed: u64,
}

/// Size-bounded content cache with recency/frequency eviction.
///
/// Entries are scored `access_count * 0.5^(idle / half_life)`; when an insert
/// would exceed the byte budget the lowest scores go first, ties broken by
/// [`FileIdentity`] ordering so eviction is deterministic. Insert and the
/// evictions it causes happen under one lock, so no other caller sees the
/// budget exceeded. Entries bigger than the whole budget are never cached.
///
/// A path can be pinned while a write to it is in flight. A pinned path is a
/// miss for readers, refuses inserts, cannot be evicted, and cannot be pinned
/// a second time; that last rule is what serializes writers per path.
#[derive(Debug)]
pub struct IntelligentCache {
    capacity: u64,
    half_life: Duration,
    state: Mutex<CacheState>,

    // Readable without the lock
    resident_bytes: AtomicU64,
    resident_count: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    bypassed: AtomicU64,
}

impl IntelligentCache {
    pub fn new(capacity: u64, half_life: Duration) -> Self {
        Self {
            capacity,
            half_life,
            state: Mutex::new(CacheState::default()),
            resident_bytes: AtomicU64::new(0),
            resident_count: AtomicU64::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            bypassed: AtomicU64::new(0),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Returns the cached content if it still matches `identity`. A cached
    /// entry with a different identity is stale and is dropped.
    pub fn get(&self, identity: &FileIdentity) -> Option<FileContent> {
        self.get_at(identity, Instant::now())
    }

    /// Caches `content` under `identity`. Returns false when the content was
    /// not cached (too large, path pinned, or no room without evicting
    /// pinned entries).
    pub fn put(&self, identity: FileIdentity, content: FileContent) -> bool {
        self.put_at(identity, content, Instant::now())
    }

    /// Drops whatever is cached for `path`. Idempotent.
    pub fn invalidate(&self, path: &Path) {
        let mut state = self.state.lock();
        if state.remove(path).is_some() {
            trace!("Invalidated cache entry for {}", path.display());
        }
        self.sync_resident(&state);
    }

    /// Drops every entry at or below `prefix`, for directory moves and deletes
    pub fn invalidate_prefix(&self, prefix: &Path) {
        let mut state = self.state.lock();
        let stale: Vec<PathBuf> = state
            .entries
            .keys()
            .filter(|path| path.starts_with(prefix))
            .cloned()
            .collect();
        for path in &stale {
            state.remove(path);
        }
        if !stale.is_empty() {
            trace!("Invalidated {} cache entries under {}", stale.len(), prefix.display());
        }
        self.sync_resident(&state);
    }

    /// Removes every unpinned entry
    pub fn clear(&self) {
        let mut state = self.state.lock();
        let unpinned: Vec<PathBuf> = state
            .entries
            .iter()
            .filter(|(_, entry)| !entry.pinned)
            .map(|(path, _)| path.clone())
            .collect();
        for path in unpinned {
            state.remove(&path);
        }
        self.sync_resident(&state);
    }

    /// Marks `path` as being written. Fails with `Conflict` if another writer
    /// already holds the pin; the pin is released when the guard drops.
    pub fn pin(&self, path: &Path) -> EngineResult<PinGuard<'_>> {
        let mut state = self.state.lock();
        if !state.pinned.insert(path.to_path_buf()) {
            return Err(EngineError::conflict(path));
        }
        if let Some(entry) = state.entries.get_mut(path) {
            entry.pinned = true;
        }
        trace!("Pinned {}", path.display());
        Ok(PinGuard {
            cache: self,
            path: path.to_path_buf(),
        })
    }

    pub fn is_pinned(&self, path: &Path) -> bool {
        self.state.lock().pinned.contains(path)
    }

    fn unpin(&self, path: &Path) {
        let mut state = self.state.lock();
        state.pinned.remove(path);
        if let Some(entry) = state.entries.get_mut(path) {
            entry.pinned = false;
        }
        trace!("Unpinned {}", path.display());
    }

    /// Snapshot of the entry cached for `path`
    pub fn entry(&self, path: &Path) -> Option<CacheEntry> {
        self.state.lock().entries.get(path).cloned()
    }

    pub fn stats(&self) -> CacheStats {
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);
        let lookups = hits + misses;
        CacheStats {
            bytes: self.resident_bytes.load(Ordering::Relaxed),
            count: self.resident_count.load(Ordering::Relaxed),
            capacity: self.capacity,
            hits,
            misses,
            hit_rate: if lookups == 0 {
                0.0
            } else {
                hits as f64 / lookups as f64
            },
            evictions: self.evictions.load(Ordering::Relaxed),
            bypassed: self.bypassed.load(Ordering::Relaxed),
        }
    }

    fn get_at(&self, identity: &FileIdentity, now: Instant) -> Option<FileContent> {
        let mut state = self.state.lock();

        if state.pinned.contains(&identity.path) {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        }

        let fresh = match state.entries.get_mut(&identity.path) {
            Some(entry) if entry.identity == *identity => {
                entry.mark_accessed(now, self.half_life);
                Some(entry.content.clone())
            }
            Some(_) => None,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };

        match fresh {
            Some(content) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(content)
            }
            None => {
                debug!("Stale cache entry for {}", identity.path.display());
                state.remove(&identity.path);
                self.sync_resident(&state);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    fn put_at(&self, identity: FileIdentity, content: FileContent, now: Instant) -> bool {
        let size = content.len() as u64;
        if size > self.capacity {
            trace!(
                "Bypassing cache for {} ({} bytes > {} capacity)",
                identity.path.display(),
                size,
                self.capacity
            );
            self.bypassed.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let mut state = self.state.lock();
        if state.pinned.contains(&identity.path) {
            return false;
        }

        let replaced = state.remove(&identity.path);
        if state.total_bytes + size > self.capacity {
            match self.select_victims(&state, size, now) {
                Some(victims) => {
                    for victim in &victims {
                        debug!("Evicting {} from cache", victim.display());
                        state.remove(victim);
                    }
                    self.evictions
                        .fetch_add(victims.len() as u64, Ordering::Relaxed);
                }
                None => {
                    // Put the previous entry back rather than lose it
                    if let Some(previous) = replaced {
                        state.total_bytes += previous.size;
                        state.entries.insert(previous.identity.path.clone(), previous);
                    }
                    debug!(
                        "No room to cache {}: remaining entries are pinned",
                        identity.path.display()
                    );
                    self.sync_resident(&state);
                    return false;
                }
            }
        }

        let path = identity.path.clone();
        state.total_bytes += size;
        state.entries.insert(path, CacheEntry::new(identity, content, now));
        self.sync_resident(&state);
        true
    }

    /// Lowest-scoring unpinned entries whose removal makes room for `incoming`
    /// bytes, or `None` if even evicting all of them is not enough.
    fn select_victims(&self, state: &CacheState, incoming: u64, now: Instant) -> Option<Vec<PathBuf>> {
        let mut candidates: Vec<(f64, &CacheEntry)> = state
            .entries
            .values()
            .filter(|entry| !entry.pinned)
            .map(|entry| (entry.score_at(now, self.half_life), entry))
            .collect();
        candidates.sort_by(|(sa, a), (sb, b)| {
            sa.total_cmp(sb).then_with(|| a.identity.cmp(&b.identity))
        });

        let mut total = state.total_bytes;
        let mut victims = Vec::new();
        for (_, entry) in candidates {
            if total + incoming <= self.capacity {
                break;
            }
            total -= entry.size;
            victims.push(entry.identity.path.clone());
        }

        (total + incoming <= self.capacity).then_some(victims)
    }

    fn sync_resident(&self, state: &CacheState) {
        self.resident_bytes
            .store(state.total_bytes, Ordering::Relaxed);
        self.resident_count
            .store(state.entries.len() as u64, Ordering::Relaxed);
    }
}

/// Holds a write pin on a path; dropping it releases the pin
#[derive(Debug)]
pub struct PinGuard<'a> {
    cache: &'a IntelligentCache,
    path: PathBuf,
}

impl PinGuard<'_> {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PinGuard<'_> {
    fn drop(&mut self) {
        self.cache.unpin(&self.path);
    }
}
