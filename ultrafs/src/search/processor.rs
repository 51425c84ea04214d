use std::ops::Range;
use std::path::Path;

use super::matcher::PatternMatcher;
use crate::results::Match;

/// A hit inside one chunk, before line numbers are made file-absolute
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkMatch {
    /// Newlines between the chunk start and the match
    pub line_in_chunk: usize,
    pub byte_offset: u64,
    pub start: usize,
    pub end: usize,
    pub line: String,
}

impl ChunkMatch {
    /// Attaches the file path and the number of lines before this chunk
    pub fn into_match(self, path: &Path, lines_before: usize) -> Match {
        Match {
            path: path.to_path_buf(),
            line_number: lines_before + self.line_in_chunk + 1,
            byte_offset: self.byte_offset,
            start: self.start,
            end: self.end,
            line: self.line,
        }
    }
}

/// Output of scanning one chunk: its hits plus how many lines it spans
#[derive(Debug, Clone, Default)]
pub struct ChunkResult {
    pub matches: Vec<ChunkMatch>,
    pub newlines: usize,
}

/// Scans byte buffers for a pattern and reports line-relative hits
#[derive(Debug, Clone)]
pub struct FileProcessor {
    matcher: PatternMatcher,
}

impl FileProcessor {
    pub fn new(matcher: PatternMatcher) -> Self {
        Self { matcher }
    }

    pub fn matcher(&self) -> &PatternMatcher {
        &self.matcher
    }

    /// Scans `bytes`, which start `base_offset` bytes into the file
    pub fn scan(&self, bytes: &[u8], base_offset: u64) -> ChunkResult {
        let mut matches = Vec::new();
        let mut line = 0;
        let mut line_start = 0;
        let mut cursor = 0;

        for (start, end) in self.matcher.find_matches(bytes) {
            for (i, &b) in bytes[cursor..start].iter().enumerate() {
                if b == b'\n' {
                    line += 1;
                    line_start = cursor + i + 1;
                }
            }
            cursor = start;

            let line_end = bytes[start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |i| start + i);
            let text = trim_cr(&bytes[line_start..line_end]);
            let end = end.min(line_start + text.len()).max(start);

            matches.push(ChunkMatch {
                line_in_chunk: line,
                byte_offset: base_offset + start as u64,
                start: start - line_start,
                end: end - line_start,
                line: String::from_utf8_lossy(text).into_owned(),
            });
        }

        let newlines = line + count_newlines(&bytes[cursor..]);
        ChunkResult { matches, newlines }
    }

    /// Matches the pattern against a file name
    pub fn match_file_name(&self, path: &Path) -> Option<Match> {
        let name = path.file_name()?.to_string_lossy();
        let (start, end) = self.matcher.first_match(name.as_bytes())?;
        Some(Match {
            path: path.to_path_buf(),
            line_number: 0,
            byte_offset: 0,
            start,
            end,
            line: name.into_owned(),
        })
    }
}

/// Splits `bytes` into spans of roughly `chunk_size`, each ending just after
/// a newline (or at end of input) so no line straddles two chunks.
pub fn chunk_ranges(bytes: &[u8], chunk_size: usize) -> Vec<Range<usize>> {
    let chunk_size = chunk_size.max(1);
    let mut ranges = Vec::new();
    let mut start = 0;

    while start < bytes.len() {
        let mut end = (start + chunk_size).min(bytes.len());
        if end < bytes.len() {
            end = match bytes[end - 1..].iter().position(|&b| b == b'\n') {
                Some(i) => end + i,
                None => bytes.len(),
            };
        }
        ranges.push(start..end);
        start = end;
    }
    ranges
}

fn count_newlines(bytes: &[u8]) -> usize {
    bytes.iter().filter(|&&b| b == b'\n').count()
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn processor(pattern: &str, regex: bool) -> FileProcessor {
        FileProcessor::new(PatternMatcher::new(pattern, regex, true).unwrap())
    }

    #[test]
    fn test_scan_reports_lines_and_offsets() {
        let text = b"alpha\nbeta pattern_1\r\ngamma\npattern_2 and pattern_3\n";
        let result = processor(r"pattern_\d", true).scan(text, 0);

        assert_eq!(result.newlines, 4);
        assert_eq!(result.matches.len(), 3);

        let first = &result.matches[0];
        assert_eq!(first.line_in_chunk, 1);
        assert_eq!(first.line, "beta pattern_1");
        assert_eq!(&first.line[first.start..first.end], "pattern_1");
        assert_eq!(first.byte_offset, 11);

        let last = &result.matches[2];
        assert_eq!(last.line_in_chunk, 3);
        assert_eq!(&last.line[last.start..last.end], "pattern_3");
    }

    #[test]
    fn test_scan_respects_base_offset() {
        let result = processor("x", false).scan(b"..x", 100);
        assert_eq!(result.matches[0].byte_offset, 102);
        assert_eq!(result.newlines, 0);
    }

    #[test]
    fn test_chunk_boundary_handling() {
        let mut content = String::new();
        for i in 0..2000 {
            content.push_str(&format!("Line {} with pattern_split", i));
            if i % 3 == 0 {
                content.push_str(" extra text to vary line length");
            }
            content.push('\n');
        }
        let bytes = content.as_bytes();
        let processor = processor("pattern_split", false);

        let whole = processor.scan(bytes, 0);

        let mut stitched = Vec::new();
        let mut lines_before = 0;
        let ranges = chunk_ranges(bytes, 997);
        assert!(ranges.len() > 10);
        for range in ranges {
            assert!(range.end == bytes.len() || bytes[range.end - 1] == b'\n');
            let part = processor.scan(&bytes[range.clone()], range.start as u64);
            for m in part.matches {
                stitched.push(m.into_match(Path::new("f"), lines_before));
            }
            lines_before += part.newlines;
        }

        assert_eq!(stitched.len(), 2000);
        for (i, (a, b)) in whole.matches.iter().zip(&stitched).enumerate() {
            assert_eq!(a.line_in_chunk + 1, b.line_number);
            assert_eq!(b.line_number, i + 1);
            assert_eq!(a.byte_offset, b.byte_offset);
        }
    }

    #[test]
    fn test_chunk_ranges_without_trailing_newline() {
        let ranges = chunk_ranges(b"aaaa\nbbbb\ncc", 3);
        assert_eq!(ranges, vec![0..5, 5..10, 10..12]);

        let ranges = chunk_ranges(b"no newline at all", 4);
        assert_eq!(ranges, vec![0..17]);

        assert!(chunk_ranges(b"", 4).is_empty());
    }

    #[test]
    fn test_match_file_name() {
        let processor = processor("report", false);
        let m = processor
            .match_file_name(Path::new("/data/q3_report.csv"))
            .unwrap();
        assert_eq!(m.line_number, 0);
        assert_eq!(m.line, "q3_report.csv");
        assert_eq!(m.matched_text(), "report");

        assert!(processor.match_file_name(Path::new("/data/notes.txt")).is_none());
    }
}
