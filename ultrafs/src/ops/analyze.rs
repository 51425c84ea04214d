use ignore::WalkBuilder;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, warn};

use crate::access::AccessStrategy;
use crate::cache::FileIdentity;
use crate::errors::{EngineError, EngineResult};
use crate::filters::looks_binary;
use crate::scheduler::CancellationToken;

/// Files listed in [`ProjectAnalysis::largest`]
pub const LARGEST_FILES: usize = 10;
const HASH_BUFFER_CAPACITY: usize = 65536;
const NO_EXTENSION: &str = "(none)";

/// Facts about one file
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FileAnalysis {
    pub path: PathBuf,
    pub size: u64,
    pub lines: usize,
    pub words: usize,
    pub is_binary: bool,
    pub extension: Option<String>,
    pub modified: SystemTime,
    /// How the engine reads this file
    pub access_strategy: AccessStrategy,
}

/// Count and bytes for one extension
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExtensionStats {
    pub files: usize,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SizedPath {
    pub path: PathBuf,
    pub size: u64,
}

/// Aggregate view of a directory tree
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProjectAnalysis {
    pub root: PathBuf,
    pub files: usize,
    /// Directories below the root
    pub directories: usize,
    pub total_size: u64,
    pub by_extension: BTreeMap<String, ExtensionStats>,
    /// Biggest files first
    pub largest: Vec<SizedPath>,
}

/// Files with identical content
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub size: u64,
    /// Hex SHA-256 of the shared content
    pub digest: String,
    pub paths: Vec<PathBuf>,
}

/// Analyzes already loaded file content
pub fn analyze_content(
    identity: &FileIdentity,
    content: &[u8],
    access_strategy: AccessStrategy,
) -> FileAnalysis {
    let is_binary = looks_binary(content);
    let (lines, words) = if is_binary {
        (0, 0)
    } else {
        (count_lines(content), count_words(content))
    };

    FileAnalysis {
        path: identity.path.clone(),
        size: identity.size,
        lines,
        words,
        is_binary,
        extension: identity
            .path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase()),
        modified: identity.modified,
        access_strategy,
    }
}

/// Lines in `content`; a final line without a newline still counts
pub fn count_lines(content: &[u8]) -> usize {
    let newlines = content.iter().filter(|&&b| b == b'\n').count();
    match content.last() {
        Some(&b'\n') | None => newlines,
        Some(_) => newlines + 1,
    }
}

/// Whitespace-separated words in `content`
pub fn count_words(content: &[u8]) -> usize {
    content
        .split(|b| b.is_ascii_whitespace())
        .filter(|word| !word.is_empty())
        .count()
}

fn walker(root: &Path) -> WalkBuilder {
    let mut walker = WalkBuilder::new(root);
    walker
        .hidden(true)
        .ignore(true)
        .git_ignore(true)
        .git_exclude(true)
        .follow_links(false);
    walker
}

/// Walks `root`, honoring ignore files, and tallies what it finds
pub fn analyze_project(root: &Path, token: &CancellationToken) -> EngineResult<ProjectAnalysis> {
    let mut analysis = ProjectAnalysis {
        root: root.to_path_buf(),
        ..Default::default()
    };
    let mut sizes: Vec<SizedPath> = Vec::new();

    for entry in walker(root).build() {
        token.check()?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("Skipping unreadable entry under {}: {}", root.display(), e);
                continue;
            }
        };
        let Some(ft) = entry.file_type() else {
            continue;
        };

        if ft.is_dir() {
            if entry.depth() > 0 {
                analysis.directories += 1;
            }
        } else if ft.is_file() {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            let extension = entry
                .path()
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_else(|| NO_EXTENSION.to_string());

            analysis.files += 1;
            analysis.total_size += size;
            let stats = analysis.by_extension.entry(extension).or_default();
            stats.files += 1;
            stats.bytes += size;
            sizes.push(SizedPath {
                path: entry.into_path(),
                size,
            });
        }
    }

    sizes.sort_by(|a, b| b.size.cmp(&a.size).then_with(|| a.path.cmp(&b.path)));
    sizes.truncate(LARGEST_FILES);
    analysis.largest = sizes;

    debug!(
        "Analyzed {}: {} files, {} directories, {} bytes",
        root.display(),
        analysis.files,
        analysis.directories,
        analysis.total_size
    );
    Ok(analysis)
}

/// Groups non-empty files under `root` by size, keeping only sizes shared by
/// at least two files. Buckets are ordered by size, paths within a bucket by
/// path.
pub fn size_buckets(root: &Path, token: &CancellationToken) -> EngineResult<Vec<(u64, Vec<PathBuf>)>> {
    let mut by_size: HashMap<u64, Vec<PathBuf>> = HashMap::new();

    for entry in walker(root).build() {
        token.check()?;
        let Ok(entry) = entry else {
            continue;
        };
        if !entry.file_type().is_some_and(|ft| ft.is_file()) {
            continue;
        }
        let size = match entry.metadata() {
            Ok(m) => m.len(),
            Err(e) => {
                warn!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };
        if size > 0 {
            by_size.entry(size).or_default().push(entry.into_path());
        }
    }

    let mut buckets: Vec<(u64, Vec<PathBuf>)> = by_size
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .map(|(size, mut paths)| {
            paths.sort();
            (size, paths)
        })
        .collect();
    buckets.sort_by_key(|(size, _)| *size);
    Ok(buckets)
}

/// Streams `path` through SHA-256 and returns the hex digest
pub fn hash_file(path: &Path) -> EngineResult<String> {
    let file = File::open(path).map_err(|e| EngineError::io(path, e))?;
    let mut reader = BufReader::with_capacity(HASH_BUFFER_CAPACITY, file);
    let mut hasher = Sha256::new();
    io::copy(&mut reader, &mut hasher).map_err(|e| EngineError::io(path, e))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Turns the digests of one size bucket into duplicate groups
pub fn group_digests(size: u64, hashed: Vec<(PathBuf, String)>) -> Vec<DuplicateGroup> {
    let mut by_digest: BTreeMap<String, Vec<PathBuf>> = BTreeMap::new();
    for (path, digest) in hashed {
        by_digest.entry(digest).or_default().push(path);
    }

    let mut groups: Vec<DuplicateGroup> = by_digest
        .into_iter()
        .filter(|(_, paths)| paths.len() > 1)
        .map(|(digest, mut paths)| {
            paths.sort();
            DuplicateGroup { size, digest, paths }
        })
        .collect();
    groups.sort_by(|a, b| a.paths.cmp(&b.paths));
    groups
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_count_lines_and_words() {
        assert_eq!(count_lines(b""), 0);
        assert_eq!(count_lines(b"one"), 1);
        assert_eq!(count_lines(b"one\ntwo\n"), 2);
        assert_eq!(count_lines(b"one\ntwo"), 2);
        assert_eq!(count_words(b"  the quick\tbrown\n\nfox "), 4);
        assert_eq!(count_words(b""), 0);
    }

    #[test]
    fn test_analyze_content() {
        let identity = FileIdentity::new("/data/Notes.MD", SystemTime::UNIX_EPOCH, 12);
        let analysis = analyze_content(&identity, b"hello world\n", AccessStrategy::Buffered);
        assert_eq!(analysis.lines, 1);
        assert_eq!(analysis.words, 2);
        assert!(!analysis.is_binary);
        assert_eq!(analysis.extension.as_deref(), Some("md"));

        let binary = analyze_content(&identity, b"\x00\x01\n", AccessStrategy::Buffered);
        assert!(binary.is_binary);
        assert_eq!(binary.lines, 0);
    }

    #[test]
    fn test_analyze_project() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        fs::write(dir.path().join("src/main.rs"), "fn main() {}\n").unwrap();
        fs::write(dir.path().join("src/nested/lib.rs"), "x".repeat(100)).unwrap();
        fs::write(dir.path().join("README"), "readme").unwrap();

        let analysis = analyze_project(dir.path(), &CancellationToken::new()).unwrap();
        assert_eq!(analysis.files, 3);
        assert_eq!(analysis.directories, 2);
        assert_eq!(analysis.total_size, 13 + 100 + 6);
        assert_eq!(analysis.by_extension["rs"], ExtensionStats { files: 2, bytes: 113 });
        assert_eq!(analysis.by_extension[NO_EXTENSION].files, 1);
        assert!(analysis.largest[0].path.ends_with("src/nested/lib.rs"));
    }

    #[test]
    fn test_size_buckets_and_digests() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "same content").unwrap();
        fs::write(dir.path().join("b.txt"), "same content").unwrap();
        fs::write(dir.path().join("c.txt"), "diff content").unwrap();
        fs::write(dir.path().join("d.txt"), "unique length").unwrap();
        fs::write(dir.path().join("e.txt"), "").unwrap();
        fs::write(dir.path().join("f.txt"), "").unwrap();

        let buckets = size_buckets(dir.path(), &CancellationToken::new()).unwrap();
        assert_eq!(buckets.len(), 1);
        let (size, paths) = &buckets[0];
        assert_eq!(*size, 12);
        assert_eq!(paths.len(), 3);

        let hashed = paths
            .iter()
            .map(|p| (p.clone(), hash_file(p).unwrap()))
            .collect();
        let groups = group_digests(*size, hashed);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].paths.len(), 2);
        assert!(groups[0].paths[0].ends_with("a.txt"));
        assert_eq!(groups[0].digest.len(), 64);
    }

    #[test]
    fn test_cancelled_walk() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a"), "x").unwrap();
        let token = CancellationToken::new();
        token.cancel();
        assert!(analyze_project(dir.path(), &token).is_err());
    }
}
