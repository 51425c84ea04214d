use serde::Serialize;
use std::path::PathBuf;

/// A single search hit
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Match {
    /// The file the match was found in
    pub path: PathBuf,
    /// 1-based line number; 0 for file-name matches
    pub line_number: usize,
    /// Offset of the match from the start of the file
    pub byte_offset: u64,
    /// Byte range of the match within `line`
    pub start: usize,
    pub end: usize,
    /// The line containing the match (or the file name), lossily decoded
    pub line: String,
}

impl Match {
    /// The matched text
    pub fn matched_text(&self) -> &str {
        self.line.get(self.start..self.end).unwrap_or("")
    }
}

/// All matches found in a single file
#[derive(Debug, Clone, Serialize)]
pub struct FileResult {
    pub path: PathBuf,
    pub matches: Vec<Match>,
}

/// Matches grouped per file, in stream order
#[derive(Debug, Clone, Default, Serialize)]
pub struct SearchSummary {
    pub file_results: Vec<FileResult>,
    pub total_matches: usize,
    pub files_with_matches: usize,
}

impl SearchSummary {
    pub fn new() -> Self {
        Default::default()
    }

    /// Adds a match; consecutive matches in the same file share a group
    pub fn add_match(&mut self, m: Match) {
        self.total_matches += 1;
        match self.file_results.last_mut() {
            Some(last) if last.path == m.path => last.matches.push(m),
            _ => {
                self.files_with_matches += 1;
                self.file_results.push(FileResult {
                    path: m.path.clone(),
                    matches: vec![m],
                });
            }
        }
    }
}

impl FromIterator<Match> for SearchSummary {
    fn from_iter<I: IntoIterator<Item = Match>>(iter: I) -> Self {
        let mut summary = SearchSummary::new();
        for m in iter {
            summary.add_match(m);
        }
        summary
    }
}
