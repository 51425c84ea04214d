use glob::Pattern;
use std::path::Path;

use crate::errors::{EngineError, EngineResult};

/// Bytes inspected when sniffing file contents for binary data
pub const BINARY_SNIFF_LEN: usize = 8 * 1024;

/// Checks if a file should be included based on its extension
pub fn has_valid_extension(path: &Path, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            extensions
                .iter()
                .any(|e| e.trim_start_matches('.').eq_ignore_ascii_case(ext))
        })
}

/// Checks if a file is likely to be binary from its extension alone
pub fn is_likely_binary(path: &Path) -> bool {
    const BINARY_EXTENSIONS: &[&str] = &[
        "exe", "dll", "so", "dylib", "bin", "obj", "o", "class", "jar", "war", "ear", "png", "jpg",
        "jpeg", "gif", "bmp", "ico", "pdf", "doc", "docx", "xls", "xlsx", "zip", "tar", "gz", "7z",
        "rar",
    ];

    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            BINARY_EXTENSIONS
                .iter()
                .any(|&bin_ext| bin_ext.eq_ignore_ascii_case(ext))
        })
}

/// Content sniff: a NUL byte in the first [`BINARY_SNIFF_LEN`] bytes
pub fn looks_binary(bytes: &[u8]) -> bool {
    let head = &bytes[..bytes.len().min(BINARY_SNIFF_LEN)];
    head.contains(&0)
}

/// Compiled glob excludes, matched against paths relative to a search root
#[derive(Debug, Clone, Default)]
pub struct ExcludeSet {
    patterns: Vec<Pattern>,
}

impl ExcludeSet {
    pub fn new(patterns: &[String]) -> EngineResult<Self> {
        let patterns = patterns
            .iter()
            .map(|p| {
                Pattern::new(p).map_err(|e| {
                    EngineError::invalid_argument(format!("invalid exclude pattern '{}': {}", p, e))
                })
            })
            .collect::<EngineResult<Vec<_>>>()?;
        Ok(Self { patterns })
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Checks if a file should be ignored based on the exclude patterns
    pub fn should_ignore(&self, relative: &Path) -> bool {
        let path_str = relative.to_string_lossy().replace('\\', "/");

        // Always skip VCS metadata
        if path_str.starts_with(".git/") || path_str.contains("/.git/") {
            return true;
        }

        self.patterns.iter().any(|p| p.matches(&path_str))
    }
}

/// Determines if a walked file is a search candidate
pub fn should_include_file(relative: &Path, extensions: &[String], excludes: &ExcludeSet) -> bool {
    !is_likely_binary(relative)
        && has_valid_extension(relative, extensions)
        && !excludes.should_ignore(relative)
}
