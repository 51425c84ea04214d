//! Streaming content and file-name search.
//!
//! Nothing is read when a search starts. On first poll the [`SearchStream`]
//! walks each root with the `ignore` walker as a scheduler task and sorts
//! the candidates by path. Scanning is fanned out through the same
//! [`TaskScheduler`]: one task per small file, and for files at or above the
//! configured chunk size one task that loads the file followed by one task
//! per newline-aligned chunk. Patterns that can match a newline are always
//! scanned whole. The stream keeps at most `parallel_ops` tasks outstanding
//! and consumes them in submission order, so matches arrive sorted by path
//! and then by byte offset no matter which task finishes first.
//!
//! [`TaskScheduler`]: crate::scheduler::TaskScheduler

pub mod engine;
pub mod matcher;
pub mod processor;

use serde::{Deserialize, Serialize};

pub use engine::{search, SearchContext, SearchStream};
pub use matcher::{PatternCache, PatternMatcher, DEFAULT_PATTERN_CACHE_CAPACITY};
pub use processor::{chunk_ranges, ChunkMatch, ChunkResult, FileProcessor};

/// Knobs for a single search
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchOptions {
    /// Treat the pattern as a regular expression instead of a literal
    pub regex: bool,
    pub case_sensitive: bool,
    /// Extensions to include; empty means every extension
    pub file_types: Vec<String>,
    /// Stop after this many matches
    pub max_results: Option<usize>,
    /// Search file contents; when false the pattern is matched against names
    pub content_search: bool,
    /// Glob patterns, relative to each root, of files to skip
    pub exclude_patterns: Vec<String>,
    /// Include dot files and dot directories
    pub include_hidden: bool,
}

impl Default for SearchOptions {
    fn default() -> Self {
        Self {
            regex: false,
            case_sensitive: true,
            file_types: Vec::new(),
            max_results: None,
            content_search: true,
            exclude_patterns: Vec::new(),
            include_hidden: false,
        }
    }
}
