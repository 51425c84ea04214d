use dashmap::DashMap;
use memmap2::Mmap;
use serde::Serialize;
use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::ops::Deref;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use tracing::{debug, trace};

use crate::cache::FileIdentity;
use crate::errors::{EngineError, EngineResult};
use crate::metrics::EngineMetrics;

const BUFFER_CAPACITY: usize = 65536;

/// What the caller intends to do with an opened file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessIntent {
    Read,
    /// Reading current content ahead of a replacement. Any shared mapping of
    /// the file is dropped and a large file gets a private mapping instead.
    Write,
}

/// How a file's bytes were obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessStrategy {
    Buffered,
    Mapped,
}

/// A read-only mapping of a whole file.
///
/// Shared through `Arc`; the mapping is released when the last reader handle
/// or cache entry holding it is dropped.
pub struct MappedRegion {
    identity: FileIdentity,
    mmap: Mmap,
    metrics: EngineMetrics,
}

impl MappedRegion {
    pub fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

impl Deref for MappedRegion {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.mmap
    }
}

impl Drop for MappedRegion {
    fn drop(&mut self) {
        trace!("Unmapping {}", self.identity.path.display());
        self.metrics.record_munmap(self.mmap.len() as u64);
    }
}

impl fmt::Debug for MappedRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MappedRegion")
            .field("path", &self.identity.path)
            .field("len", &self.mmap.len())
            .finish()
    }
}

/// File bytes, either owned or backed by a shared mapping. Cloning is cheap.
#[derive(Clone)]
pub enum FileContent {
    Owned(Arc<[u8]>),
    Mapped(Arc<MappedRegion>),
}

impl FileContent {
    pub fn from_vec(bytes: Vec<u8>) -> Self {
        FileContent::Owned(bytes.into())
    }

    pub fn strategy(&self) -> AccessStrategy {
        match self {
            FileContent::Owned(_) => AccessStrategy::Buffered,
            FileContent::Mapped(_) => AccessStrategy::Mapped,
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, FileContent::Mapped(_))
    }

    /// Lossy UTF-8 view, for text payloads
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(self).into_owned()
    }
}

impl Deref for FileContent {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileContent::Owned(bytes) => bytes,
            FileContent::Mapped(region) => region,
        }
    }
}

impl AsRef<[u8]> for FileContent {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl PartialEq for FileContent {
    fn eq(&self, other: &Self) -> bool {
        **self == **other
    }
}

impl fmt::Debug for FileContent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileContent")
            .field("strategy", &self.strategy())
            .field("len", &self.len())
            .finish()
    }
}

/// An open file: its identity at open time plus its content
#[derive(Debug, Clone)]
pub struct FileHandle {
    identity: FileIdentity,
    content: FileContent,
    intent: AccessIntent,
}

impl FileHandle {
    pub fn identity(&self) -> &FileIdentity {
        &self.identity
    }

    pub fn intent(&self) -> AccessIntent {
        self.intent
    }

    pub fn strategy(&self) -> AccessStrategy {
        self.content.strategy()
    }

    pub fn len(&self) -> usize {
        self.content.len()
    }

    pub fn is_empty(&self) -> bool {
        self.content.is_empty()
    }

    /// The whole file; shares the mapping or buffer, no copy
    pub fn read_all(&self) -> FileContent {
        self.content.clone()
    }

    /// A span of the file; `len` is clamped at end of file
    pub fn read_range(&self, offset: u64, len: usize) -> EngineResult<&[u8]> {
        let total = self.content.len();
        let start = usize::try_from(offset).unwrap_or(usize::MAX);
        if start > total {
            return Err(EngineError::invalid_argument(format!(
                "offset {} is past the end of {} ({} bytes)",
                offset,
                self.identity.path.display(),
                total
            )));
        }
        let end = start.saturating_add(len).min(total);
        Ok(&self.content[start..end])
    }

    /// Releases the handle; a mapping is unmapped once nothing else holds it
    pub fn close(self) {}

    pub fn into_content(self) -> FileContent {
        self.content
    }
}

/// Opens files with the cheapest strategy for their size.
///
/// Files at or above `mmap_threshold` are memory mapped and the mapping is
/// shared between concurrent readers through a region table; smaller files
/// are read into an owned buffer in one pass. When a mapping cannot be
/// created the accessor falls back to buffered reading, which callers cannot
/// tell apart except by speed.
#[derive(Debug)]
pub struct FileAccessor {
    mmap_threshold: u64,
    mmap_enabled: bool,
    regions: DashMap<PathBuf, Weak<MappedRegion>>,
    metrics: EngineMetrics,
}

impl FileAccessor {
    pub fn new(mmap_threshold: u64, mmap_enabled: bool, metrics: EngineMetrics) -> Self {
        Self {
            mmap_threshold,
            mmap_enabled,
            regions: DashMap::new(),
            metrics,
        }
    }

    /// Strategy a file of `size` bytes would get
    pub fn strategy_for(&self, size: u64) -> AccessStrategy {
        if self.mmap_enabled && size > 0 && size >= self.mmap_threshold {
            AccessStrategy::Mapped
        } else {
            AccessStrategy::Buffered
        }
    }

    /// Opens `path` (already validated) and loads or maps its content
    pub fn open(&self, path: &Path, intent: AccessIntent) -> EngineResult<FileHandle> {
        let file = File::open(path).map_err(|e| EngineError::io(path, e))?;
        let metadata = file.metadata().map_err(|e| EngineError::io(path, e))?;
        if metadata.is_dir() {
            return Err(EngineError::invalid_argument(format!(
                "{} is a directory",
                path.display()
            )));
        }
        let identity = FileIdentity::from_metadata(path, &metadata)?;

        if intent == AccessIntent::Write {
            self.invalidate(path);
        }

        let strategy = self.strategy_for(identity.size);
        let content = match strategy {
            AccessStrategy::Mapped => match self.map(&file, &identity, intent == AccessIntent::Read) {
                Ok(region) => FileContent::Mapped(region),
                Err(e) => {
                    debug!(
                        "Mapping {} failed ({}), falling back to buffered read",
                        path.display(),
                        e
                    );
                    self.read_buffered(file, &identity)?
                }
            },
            AccessStrategy::Buffered => self.read_buffered(file, &identity)?,
        };

        self.metrics
            .record_file_processing(content.strategy(), content.len() as u64);

        Ok(FileHandle {
            identity,
            content,
            intent,
        })
    }

    /// Forgets shared mappings of `path` so later opens see fresh content.
    /// Readers holding the old mapping keep it until they finish.
    pub fn invalidate(&self, path: &Path) {
        if self.regions.remove(path).is_some() {
            trace!("Dropped region table entry for {}", path.display());
        }
    }

    /// Forgets shared mappings of every file at or below `prefix`
    pub fn invalidate_prefix(&self, prefix: &Path) {
        self.regions.retain(|path, _| !path.starts_with(prefix));
    }

    pub fn metrics(&self) -> &EngineMetrics {
        &self.metrics
    }

    /// Number of mappings currently alive
    pub fn live_regions(&self) -> usize {
        self.regions
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }

    /// Entries in the region table, dead or alive
    pub fn region_table_len(&self) -> usize {
        self.regions.len()
    }

    fn map(
        &self,
        file: &File,
        identity: &FileIdentity,
        shared: bool,
    ) -> std::io::Result<Arc<MappedRegion>> {
        if shared {
            let existing = self
                .regions
                .get(&identity.path)
                .and_then(|weak| weak.upgrade());
            match existing {
                Some(existing) if existing.identity == *identity => {
                    trace!("Sharing mapping of {}", identity.path.display());
                    return Ok(existing);
                }
                Some(_) => {}
                None => {
                    self.regions
                        .remove_if(&identity.path, |_, weak| weak.strong_count() == 0);
                }
            }
        }

        // SAFETY: the engine never writes through a mapping or into a mapped
        // file in place; replacements land via rename, so a live mapping keeps
        // pointing at the old inode. Outside truncation remains possible and
        // is accepted, as with any mmap-based reader.
        let mmap = unsafe { Mmap::map(file) }?;
        self.metrics.record_mmap(mmap.len() as u64);
        let region = Arc::new(MappedRegion {
            identity: identity.clone(),
            mmap,
            metrics: self.metrics.clone(),
        });

        // Another reader may have mapped concurrently; either mapping is valid
        if shared {
            self.regions.retain(|_, weak| weak.strong_count() > 0);
            self.regions
                .insert(identity.path.clone(), Arc::downgrade(&region));
        }
        Ok(region)
    }

    fn read_buffered(&self, file: File, identity: &FileIdentity) -> EngineResult<FileContent> {
        let capacity = usize::try_from(identity.size).unwrap_or(0);
        let mut reader = BufReader::with_capacity(BUFFER_CAPACITY, file);
        let mut bytes = Vec::with_capacity(capacity);
        reader
            .read_to_end(&mut bytes)
            .map_err(|e| EngineError::io(&identity.path, e))?;
        self.metrics.record_buffered_read(bytes.len() as u64);
        Ok(FileContent::from_vec(bytes))
    }
}
