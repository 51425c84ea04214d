//! Atomic writes, backups and in-place edits.
//!
//! Every mutation of a file follows the same protocol:
//!
//! 1. pin the path in the cache (a second writer gets `Conflict`);
//! 2. write the new bytes to a temporary file in the target's directory and
//!    `sync_all` it;
//! 3. optionally copy the current file to a backup;
//! 4. rename the temporary file over the target;
//! 5. invalidate the cache entry and any shared mapping of the path;
//! 6. unpin.
//!
//! Readers never observe a half-written file: before step 4 they see the old
//! inode, after it the new one. A reader that mapped the old file keeps its
//! mapping until it finishes. If anything fails before the rename, the
//! temporary file is deleted and the target is untouched; a backup made in
//! step 3 is kept.

pub mod chunked;

use serde::{Deserialize, Serialize};
use std::fs::{self, Metadata};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;
use tracing::{debug, trace};

use crate::access::{AccessIntent, FileAccessor};
use crate::cache::{FileIdentity, IntelligentCache};
use crate::errors::{EngineError, EngineResult};
use crate::search::PatternMatcher;

const WRITE_BUFFER_CAPACITY: usize = 65536;

/// Which occurrences `edit` replaces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EditScope {
    First,
    #[default]
    All,
    /// The n-th occurrence, counting from 1
    Nth(usize),
}

/// Result of a successful write
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WriteOutcome {
    pub path: PathBuf,
    pub bytes_written: u64,
    pub backup: Option<PathBuf>,
}

/// Result of an edit; zero replacements means the file was left alone
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EditOutcome {
    pub path: PathBuf,
    pub replacements: usize,
    pub backup: Option<PathBuf>,
}

/// Performs atomic replacements of files inside the allowed directories.
///
/// Paths handed to the writer must already be validated; `roots` is only used
/// to name backups after the file's location inside its root.
#[derive(Debug, Clone)]
pub struct SafeWriter {
    cache: Arc<IntelligentCache>,
    accessor: Arc<FileAccessor>,
    roots: Arc<[PathBuf]>,
    backup_dir: Option<PathBuf>,
}

impl SafeWriter {
    pub fn new(
        cache: Arc<IntelligentCache>,
        accessor: Arc<FileAccessor>,
        roots: &[PathBuf],
        backup_dir: Option<PathBuf>,
    ) -> Self {
        Self {
            cache,
            accessor,
            roots: roots.into(),
            backup_dir,
        }
    }

    /// Replaces `path` with `content`, creating it (and missing parent
    /// directories) if needed.
    pub fn write_safe(&self, path: &Path, content: &[u8], backup: bool) -> EngineResult<WriteOutcome> {
        let _pin = self.cache.pin(path)?;
        self.commit(path, backup, None, |out| {
            out.write_all(content).map_err(|e| EngineError::io(path, e))?;
            Ok(content.len() as u64)
        })
    }

    /// Replaces occurrences of `find` with `replace`.
    ///
    /// The current content is scanned in place (mapped for large files) and
    /// the new content is streamed into the temporary file span by span. If
    /// the file changes between the scan and the rename the edit fails with
    /// `Conflict` and the file keeps the other writer's content.
    pub fn edit(
        &self,
        path: &Path,
        find: &str,
        replace: &str,
        scope: EditScope,
        backup: bool,
    ) -> EngineResult<EditOutcome> {
        if find.is_empty() {
            return Err(EngineError::invalid_argument("edit: find text must not be empty"));
        }
        if scope == EditScope::Nth(0) {
            return Err(EngineError::invalid_argument(
                "edit: occurrences are counted from 1",
            ));
        }
        let matcher = PatternMatcher::new(find, false, true)?;

        let _pin = self.cache.pin(path)?;
        let handle = self.accessor.open(path, AccessIntent::Write)?;
        let bytes = handle.read_all();

        let occurrences = matcher.find_matches(&bytes);
        let spans: Vec<(usize, usize)> = match scope {
            EditScope::All => occurrences,
            EditScope::First => occurrences.into_iter().take(1).collect(),
            EditScope::Nth(n) => occurrences.into_iter().nth(n - 1).into_iter().collect(),
        };
        if spans.is_empty() {
            debug!("No occurrences of {:?} in {}", find, path.display());
            return Ok(EditOutcome {
                path: path.to_path_buf(),
                replacements: 0,
                backup: None,
            });
        }

        trace!(
            "Replacing {} occurrence(s) in {} ({} bytes, {:?})",
            spans.len(),
            path.display(),
            bytes.len(),
            handle.strategy()
        );
        let outcome = self.commit(path, backup, Some(handle.identity()), |out| {
            let mut pos = 0;
            for &(start, end) in &spans {
                out.write_all(&bytes[pos..start])
                    .and_then(|()| out.write_all(replace.as_bytes()))
                    .map_err(|e| EngineError::io(path, e))?;
                pos = end;
            }
            out.write_all(&bytes[pos..])
                .map_err(|e| EngineError::io(path, e))?;
            let removed: usize = spans.iter().map(|(s, e)| e - s).sum();
            Ok((bytes.len() - removed + spans.len() * replace.len()) as u64)
        })?;

        Ok(EditOutcome {
            path: outcome.path,
            replacements: spans.len(),
            backup: outcome.backup,
        })
    }

    /// Runs protocol steps 2 to 5 for a path the caller has already pinned.
    ///
    /// `fill` writes the new content and returns the byte count. When
    /// `expected` is given the target must still have that identity right
    /// before the rename.
    pub(crate) fn commit<F>(
        &self,
        path: &Path,
        backup: bool,
        expected: Option<&FileIdentity>,
        fill: F,
    ) -> EngineResult<WriteOutcome>
    where
        F: FnOnce(&mut dyn Write) -> EngineResult<u64>,
    {
        let previous = existing_file(path)?;
        let parent = path
            .parent()
            .ok_or_else(|| EngineError::invalid_argument(format!("{} has no parent", path.display())))?;
        if previous.is_none() {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(path, e))?;
        }

        let mut temp = NamedTempFile::new_in(parent).map_err(|e| EngineError::io(path, e))?;
        let bytes_written = {
            let mut out = BufWriter::with_capacity(WRITE_BUFFER_CAPACITY, temp.as_file_mut());
            let written = fill(&mut out)?;
            out.flush().map_err(|e| EngineError::io(path, e))?;
            written
        };
        temp.as_file()
            .sync_all()
            .map_err(|e| EngineError::io(path, e))?;

        let backup_path = match (&previous, backup) {
            (Some(_), true) => Some(self.create_backup(path)?),
            _ => None,
        };

        match &previous {
            Some(metadata) => fs::set_permissions(temp.path(), metadata.permissions())
                .map_err(|e| EngineError::io(path, e))?,
            None => set_default_permissions(temp.path()).map_err(|e| EngineError::io(path, e))?,
        }

        if let Some(expected) = expected {
            let current = FileIdentity::stat(path)?;
            if current != *expected {
                debug!("{} changed during edit, abandoning", path.display());
                return Err(EngineError::conflict(path));
            }
        }

        temp.persist(path)
            .map_err(|e| EngineError::io(path, e.error))?;
        self.cache.invalidate(path);
        self.accessor.invalidate(path);

        debug!("Wrote {} bytes to {}", bytes_written, path.display());
        Ok(WriteOutcome {
            path: path.to_path_buf(),
            bytes_written,
            backup: backup_path,
        })
    }

    pub(crate) fn cache(&self) -> &IntelligentCache {
        &self.cache
    }

    pub(crate) fn accessor(&self) -> &FileAccessor {
        &self.accessor
    }

    /// Copies the current file to its backup location
    fn create_backup(&self, path: &Path) -> EngineResult<PathBuf> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);

        let base = match &self.backup_dir {
            Some(dir) => {
                fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
                let relative = self
                    .roots
                    .iter()
                    .find_map(|root| path.strip_prefix(root).ok())
                    .unwrap_or(path);
                let sanitized = relative
                    .to_string_lossy()
                    .replace(['\\', '/'], "_");
                dir.join(format!("{}.{}", sanitized, timestamp))
            }
            None => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                path.with_file_name(format!("{}.{}.bak", name, timestamp))
            }
        };

        let backup_path = unique_path(base);
        fs::copy(path, &backup_path).map_err(|e| EngineError::io(path, e))?;
        debug!("Backed up {} to {}", path.display(), backup_path.display());
        Ok(backup_path)
    }
}

/// Metadata of an existing regular file at `path`, `None` if nothing is there
fn existing_file(path: &Path) -> EngineResult<Option<Metadata>> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Err(EngineError::invalid_argument(format!(
            "{} is a directory",
            path.display()
        ))),
        Ok(metadata) => Ok(Some(metadata)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(EngineError::io(path, e)),
    }
}

/// Appends `.1`, `.2`, ... until the name is free
fn unique_path(base: PathBuf) -> PathBuf {
    if !base.exists() {
        return base;
    }
    let mut n = 1;
    loop {
        let mut name = base.clone().into_os_string();
        name.push(format!(".{}", n));
        let candidate = PathBuf::from(name);
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(unix)]
fn set_default_permissions(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(0o644))
}

#[cfg(not(unix))]
fn set_default_permissions(_path: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessStrategy;
    use crate::errors::ErrorKind;
    use crate::metrics::EngineMetrics;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    fn writer_in(dir: &TempDir, backup_dir: Option<PathBuf>) -> SafeWriter {
        let root = dir.path().canonicalize().unwrap();
        SafeWriter::new(
            Arc::new(IntelligentCache::new(1 << 20, Duration::from_secs(300))),
            Arc::new(FileAccessor::new(4096, true, EngineMetrics::new())),
            &[root],
            backup_dir,
        )
    }

    #[test]
    fn test_write_creates_file_and_parents() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().join("a/b/new.txt");

        let outcome = writer.write_safe(&path, b"hello", false).unwrap();
        assert_eq!(outcome.bytes_written, 5);
        assert_eq!(outcome.backup, None);
        assert_eq!(fs::read(&path).unwrap(), b"hello");

        // No temporary files left behind
        let entries: Vec<_> = fs::read_dir(path.parent().unwrap()).unwrap().collect();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_write_with_sibling_backup() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().join("doc.txt");
        fs::write(&path, "old").unwrap();

        let outcome = writer.write_safe(&path, b"new", true).unwrap();
        let backup = outcome.backup.unwrap();
        assert_eq!(fs::read(&backup).unwrap(), b"old");
        assert_eq!(fs::read(&path).unwrap(), b"new");
        let name = backup.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with("doc.txt.") && name.ends_with(".bak"));
    }

    #[test]
    fn test_backup_dir_uses_sanitized_relative_path() {
        let dir = tempdir().unwrap();
        let backups = tempdir().unwrap();
        let writer = writer_in(&dir, Some(backups.path().to_path_buf()));
        let root = dir.path().canonicalize().unwrap();
        fs::create_dir(root.join("src")).unwrap();
        let path = root.join("src/lib.rs");
        fs::write(&path, "v1").unwrap();

        let first = writer.write_safe(&path, b"v2", true).unwrap().backup.unwrap();
        let second = writer.write_safe(&path, b"v3", true).unwrap().backup.unwrap();

        assert_eq!(first.parent().unwrap(), backups.path());
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with("src_lib.rs."));
        assert_ne!(first, second);
        assert_eq!(fs::read(&first).unwrap(), b"v1");
        assert_eq!(fs::read(&second).unwrap(), b"v2");
    }

    #[test]
    fn test_write_invalidates_cache() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().canonicalize().unwrap().join("c.txt");
        fs::write(&path, "cached").unwrap();

        let identity = FileIdentity::stat(&path).unwrap();
        writer
            .cache()
            .put(identity, crate::access::FileContent::from_vec(b"cached".to_vec()));
        writer.write_safe(&path, b"fresh", false).unwrap();
        assert!(writer.cache().entry(&path).is_none());
        assert!(!writer.cache().is_pinned(&path));
    }

    #[test]
    fn test_concurrent_writer_conflicts() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().join("busy.txt");

        let _held = writer.cache().pin(&path).unwrap();
        let err = writer.write_safe(&path, b"x", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert!(!path.exists());
    }

    #[test]
    fn test_write_to_directory_is_rejected() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let err = writer.write_safe(dir.path(), b"x", false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_preserved() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().join("script.sh");
        fs::write(&path, "#!/bin/sh\n").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o750)).unwrap();

        writer.write_safe(&path, b"#!/bin/sh\necho hi\n", false).unwrap();
        let mode = fs::metadata(&path).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o750);
    }

    #[test]
    fn test_edit_scopes() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().join("e.txt");

        fs::write(&path, "a-a-a").unwrap();
        let outcome = writer.edit(&path, "a", "bb", EditScope::All, false).unwrap();
        assert_eq!(outcome.replacements, 3);
        assert_eq!(fs::read_to_string(&path).unwrap(), "bb-bb-bb");

        fs::write(&path, "a-a-a").unwrap();
        writer.edit(&path, "a", "X", EditScope::First, false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "X-a-a");

        fs::write(&path, "a-a-a").unwrap();
        writer.edit(&path, "a", "X", EditScope::Nth(3), false).unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "a-a-X");

        let outcome = writer.edit(&path, "a", "X", EditScope::Nth(9), false).unwrap();
        assert_eq!(outcome.replacements, 0);
    }

    #[test]
    fn test_edit_without_match_leaves_file_alone() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().join("e.txt");
        fs::write(&path, "content").unwrap();
        let before = FileIdentity::stat(&path).unwrap();

        let outcome = writer.edit(&path, "absent", "x", EditScope::All, true).unwrap();
        assert_eq!(outcome.replacements, 0);
        assert_eq!(outcome.backup, None);
        assert_eq!(FileIdentity::stat(&path).unwrap(), before);
    }

    #[test]
    fn test_edit_argument_validation() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().join("e.txt");
        fs::write(&path, "content").unwrap();

        let err = writer.edit(&path, "", "x", EditScope::All, false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = writer.edit(&path, "c", "x", EditScope::Nth(0), false).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
        let err = writer
            .edit(&dir.path().join("missing.txt"), "c", "x", EditScope::All, false)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_edit_large_mapped_file() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().join("big.txt");
        let mut content = String::new();
        for i in 0..5000 {
            content.push_str(&format!("row {} OLD\n", i));
        }
        fs::write(&path, &content).unwrap();
        assert_eq!(
            writer.accessor().strategy_for(content.len() as u64),
            AccessStrategy::Mapped
        );

        let outcome = writer.edit(&path, "OLD", "NEW", EditScope::All, false).unwrap();
        assert_eq!(outcome.replacements, 5000);
        let updated = fs::read_to_string(&path).unwrap();
        assert_eq!(updated, content.replace("OLD", "NEW"));
        assert_eq!(writer.accessor().live_regions(), 0);
    }

    #[test]
    fn test_commit_detects_concurrent_change() {
        let dir = tempdir().unwrap();
        let writer = writer_in(&dir, None);
        let path = dir.path().join("race.txt");
        fs::write(&path, "one").unwrap();
        let stale = FileIdentity::stat(&path).unwrap();
        fs::write(&path, "changed by someone else").unwrap();

        let _pin = writer.cache().pin(&path).unwrap();
        let err = writer
            .commit(&path, false, Some(&stale), |out| {
                out.write_all(b"mine").unwrap();
                Ok(4)
            })
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Conflict);
        assert_eq!(fs::read(&path).unwrap(), b"changed by someone else");
    }
}
