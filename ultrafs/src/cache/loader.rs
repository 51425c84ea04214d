use std::path::Path;
use std::sync::Arc;
use tracing::trace;

use super::{FileIdentity, IntelligentCache};
use crate::access::{AccessIntent, FileAccessor, FileContent};
use crate::errors::EngineResult;

/// File content as handed to readers and search tasks
#[derive(Debug, Clone)]
pub struct Loaded {
    pub identity: FileIdentity,
    pub content: FileContent,
    pub from_cache: bool,
}

/// Read-through path from a validated file to its bytes: a fresh stat, then
/// the cache, then the accessor. Cheap to clone into scheduler tasks.
#[derive(Debug, Clone)]
pub struct ContentLoader {
    cache: Arc<IntelligentCache>,
    accessor: Arc<FileAccessor>,
}

impl ContentLoader {
    pub fn new(cache: Arc<IntelligentCache>, accessor: Arc<FileAccessor>) -> Self {
        Self { cache, accessor }
    }

    pub fn cache(&self) -> &IntelligentCache {
        &self.cache
    }

    pub fn accessor(&self) -> &FileAccessor {
        &self.accessor
    }

    pub fn load(&self, path: &Path) -> EngineResult<Loaded> {
        let identity = FileIdentity::stat(path)?;
        if let Some(content) = self.cache.get(&identity) {
            trace!("Cache hit for {}", path.display());
            self.accessor.metrics().record_cache_hit(content.len() as u64);
            return Ok(Loaded {
                identity,
                content,
                from_cache: true,
            });
        }

        let handle = self.accessor.open(path, AccessIntent::Read)?;
        let identity = handle.identity().clone();
        let content = handle.into_content();
        self.cache.put(identity.clone(), content.clone());

        Ok(Loaded {
            identity,
            content,
            from_cache: false,
        })
    }
}
