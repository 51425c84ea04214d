use serde::Serialize;
use std::fs::Metadata;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::errors::{EngineError, EngineResult};

/// Identity of a file's contents at one point in time: canonical path,
/// modification time and size.
///
/// Two identities are equal only when all three match, so a fresh stat that
/// disagrees with a cached identity means the cached bytes are stale. The
/// derived ordering (path, then mtime, then size) is what breaks eviction
/// ties deterministically.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct FileIdentity {
    pub path: PathBuf,
    pub modified: SystemTime,
    pub size: u64,
}

impl FileIdentity {
    pub fn new(path: impl Into<PathBuf>, modified: SystemTime, size: u64) -> Self {
        Self {
            path: path.into(),
            modified,
            size,
        }
    }

    /// Stats `path` (which should already be canonical)
    pub fn stat(path: &Path) -> EngineResult<Self> {
        let metadata = std::fs::metadata(path).map_err(|e| EngineError::io(path, e))?;
        Self::from_metadata(path, &metadata)
    }

    pub fn from_metadata(path: &Path, metadata: &Metadata) -> EngineResult<Self> {
        // Platforms without mtime still get a usable, if coarse, identity
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        Ok(Self::new(path, modified, metadata.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::tempdir;

    #[test]
    fn test_identity_changes_with_size() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.txt");
        std::fs::write(&path, "one").unwrap();
        let first = FileIdentity::stat(&path).unwrap();
        assert_eq!(first.size, 3);

        std::fs::write(&path, "three").unwrap();
        let second = FileIdentity::stat(&path).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_stat_missing_file() {
        let dir = tempdir().unwrap();
        let err = FileIdentity::stat(&dir.path().join("missing")).unwrap_err();
        assert!(matches!(err, EngineError::NotFound(_)));
    }

    #[test]
    fn test_ordering_is_path_first() {
        let t0 = SystemTime::UNIX_EPOCH;
        let t1 = t0 + Duration::from_secs(10);
        let a = FileIdentity::new("/data/a", t1, 1);
        let b = FileIdentity::new("/data/b", t0, 1);
        let a_old = FileIdentity::new("/data/a", t0, 100);
        assert!(a < b);
        assert!(a_old < a);
    }
}
