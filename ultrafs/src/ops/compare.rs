use serde::Serialize;
use similar::{ChangeTag, DiffOp, TextDiff};

use crate::filters::looks_binary;

const CONTEXT_LINES: usize = 3;

/// One changed region between two files
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffHunk {
    /// The 1-based starting line in the first file
    pub original_start_line: usize,
    /// The 1-based starting line in the second file
    pub new_start_line: usize,
    pub original_line_count: usize,
    pub new_line_count: usize,
    /// Lines only in the first file
    pub original_lines: Vec<String>,
    /// Lines only in the second file
    pub new_lines: Vec<String>,
}

/// Result of comparing two files
#[derive(Debug, Clone, Serialize)]
pub struct Comparison {
    pub identical: bool,
    /// Unified diff with three lines of context; a one-line note for binary files
    pub unified_diff: String,
    pub hunks: Vec<DiffHunk>,
    /// Similarity between 0.0 and 1.0
    pub ratio: f32,
    pub binary: bool,
}

/// Compares two byte buffers line by line. Binary content is only compared
/// for equality.
pub fn compare_bytes(a: &[u8], b: &[u8], a_label: &str, b_label: &str) -> Comparison {
    if looks_binary(a) || looks_binary(b) {
        let identical = a == b;
        let unified_diff = if identical {
            String::new()
        } else {
            format!("Binary files {} and {} differ\n", a_label, b_label)
        };
        return Comparison {
            identical,
            unified_diff,
            hunks: Vec::new(),
            ratio: if identical { 1.0 } else { 0.0 },
            binary: true,
        };
    }

    // Line endings are normalized so CRLF and LF copies compare equal
    let old = String::from_utf8_lossy(a).replace("\r\n", "\n");
    let new = String::from_utf8_lossy(b).replace("\r\n", "\n");
    compare_text(&old, &new, a_label, b_label)
}

fn compare_text(old: &str, new: &str, a_label: &str, b_label: &str) -> Comparison {
    let diff = TextDiff::from_lines(old, new);
    let hunks = collect_hunks(&diff);
    let unified_diff = if hunks.is_empty() {
        String::new()
    } else {
        diff.unified_diff()
            .context_radius(CONTEXT_LINES)
            .header(a_label, b_label)
            .to_string()
    };

    Comparison {
        identical: hunks.is_empty(),
        unified_diff,
        hunks,
        ratio: diff.ratio(),
        binary: false,
    }
}

fn collect_hunks<'a>(diff: &TextDiff<'a, 'a, 'a, str>) -> Vec<DiffHunk> {
    let mut hunks = Vec::new();

    for group in diff.grouped_ops(CONTEXT_LINES) {
        for op in group {
            let (old_index, old_len, new_index, new_len) = match op {
                DiffOp::Equal { .. } => continue,
                DiffOp::Insert {
                    old_index,
                    new_index,
                    new_len,
                } => (old_index, 0, new_index, new_len),
                DiffOp::Delete {
                    old_index,
                    old_len,
                    new_index,
                } => (old_index, old_len, new_index, 0),
                DiffOp::Replace {
                    old_index,
                    old_len,
                    new_index,
                    new_len,
                } => (old_index, old_len, new_index, new_len),
            };

            let mut original_lines = Vec::with_capacity(old_len);
            let mut new_lines = Vec::with_capacity(new_len);
            for change in diff.iter_changes(&op) {
                let line = change.value().trim_end().to_string();
                match change.tag() {
                    ChangeTag::Delete => original_lines.push(line),
                    ChangeTag::Insert => new_lines.push(line),
                    ChangeTag::Equal => {}
                }
            }

            hunks.push(DiffHunk {
                original_start_line: old_index + 1,
                new_start_line: new_index + 1,
                original_line_count: old_len,
                new_line_count: new_len,
                original_lines,
                new_lines,
            });
        }
    }

    hunks
}
