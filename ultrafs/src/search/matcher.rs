use dashmap::DashMap;
use regex::bytes::{Regex, RegexBuilder};
use std::sync::Arc;
use tracing::{debug, trace};

use crate::errors::{EngineError, EngineResult};

/// Compiled patterns an engine keeps before starting over
pub const DEFAULT_PATTERN_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PatternKey {
    pattern: String,
    regex: bool,
    case_sensitive: bool,
}

/// Compiled search pattern over raw bytes.
///
/// Literal patterns are escaped and go through the same engine as regular
/// expressions. Cloning shares the compiled program.
#[derive(Debug, Clone)]
pub struct PatternMatcher {
    regex: Arc<Regex>,
    spans_lines: bool,
}

impl PatternMatcher {
    pub fn new(pattern: &str, regex: bool, case_sensitive: bool) -> EngineResult<Self> {
        if pattern.is_empty() {
            return Err(EngineError::invalid_argument("search pattern must not be empty"));
        }

        let source = if regex {
            pattern.to_string()
        } else {
            regex::escape(pattern)
        };
        let compiled = RegexBuilder::new(&source)
            .case_insensitive(!case_sensitive)
            .build()
            .map_err(|e| {
                EngineError::invalid_argument(format!("invalid pattern '{}': {}", pattern, e))
            })?;

        Ok(Self {
            regex: Arc::new(compiled),
            spans_lines: may_match_newline(pattern, regex),
        })
    }

    /// Whether a match might contain a newline. Such patterns cannot be
    /// scanned in independent line-aligned chunks.
    pub fn may_span_lines(&self) -> bool {
        self.spans_lines
    }

    /// Non-overlapping match spans, in order
    pub fn find_matches(&self, haystack: &[u8]) -> Vec<(usize, usize)> {
        self.regex
            .find_iter(haystack)
            .map(|m| (m.start(), m.end()))
            .collect()
    }

    pub fn first_match(&self, haystack: &[u8]) -> Option<(usize, usize)> {
        self.regex.find(haystack).map(|m| (m.start(), m.end()))
    }
}

/// Conservative check for patterns that can match `\n`: a literal newline,
/// an escape that can stand for one (`\n`, `\s`, `\W`, `\D`, Unicode and hex
/// escapes), any bracket class, or an inline flag group such as `(?s)`.
fn may_match_newline(pattern: &str, regex: bool) -> bool {
    if pattern.contains('\n') {
        return true;
    }
    if !regex {
        return false;
    }

    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                if let Some(escaped) = chars.next() {
                    if "nsWDpPxuU".contains(escaped) {
                        return true;
                    }
                }
            }
            '[' => return true,
            '(' if chars.peek() == Some(&'?') => return true,
            _ => {}
        }
    }
    false
}

/// Compiled patterns keyed by source and flags, so repeated searches skip
/// compilation. Holds at most `capacity` patterns; a full cache is cleared
/// before the next insert.
#[derive(Debug)]
pub struct PatternCache {
    entries: DashMap<PatternKey, PatternMatcher>,
    capacity: usize,
}

impl PatternCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    pub fn get_or_compile(
        &self,
        pattern: &str,
        regex: bool,
        case_sensitive: bool,
    ) -> EngineResult<PatternMatcher> {
        let key = PatternKey {
            pattern: pattern.to_string(),
            regex,
            case_sensitive,
        };
        if let Some(entry) = self.entries.get(&key) {
            trace!("Reusing compiled pattern {:?}", pattern);
            return Ok(entry.value().clone());
        }

        let matcher = PatternMatcher::new(pattern, regex, case_sensitive)?;
        if self.entries.len() >= self.capacity {
            debug!("Pattern cache full, dropping {} compiled patterns", self.entries.len());
            self.entries.clear();
        }
        self.entries.insert(key, matcher.clone());
        Ok(matcher)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for PatternCache {
    fn default() -> Self {
        Self::new(DEFAULT_PATTERN_CACHE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;

    #[test]
    fn test_literal_matching() {
        let matcher = PatternMatcher::new("a.b", false, true).unwrap();
        let text = b"a.b axb a.b";
        let matches = matcher.find_matches(text);
        assert_eq!(matches, vec![(0, 3), (8, 11)]);
    }

    #[test]
    fn test_regex_pattern_matching() {
        let matcher = PatternMatcher::new(r"\btest\w+", true, true).unwrap();
        assert_eq!(matcher.find_matches(b"testing tests tested").len(), 3);
    }

    #[test]
    fn test_case_insensitive() {
        let matcher = PatternMatcher::new("todo", false, false).unwrap();
        assert_eq!(matcher.find_matches(b"TODO: fix, Todo later").len(), 2);

        let matcher = PatternMatcher::new("todo", false, true).unwrap();
        assert!(matcher.first_match(b"TODO").is_none());
    }

    #[test]
    fn test_invalid_pattern() {
        let err = PatternMatcher::new("(unclosed", true, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);

        // The same text is fine as a literal
        assert!(PatternMatcher::new("(unclosed", false, true).is_ok());

        let err = PatternMatcher::new("", false, true).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn test_compiled_patterns_are_shared() {
        let cache = PatternCache::new(8);
        let a = cache.get_or_compile("shared_pattern_xyz", false, true).unwrap();
        let b = cache.get_or_compile("shared_pattern_xyz", false, true).unwrap();
        assert!(Arc::ptr_eq(&a.regex, &b.regex));

        let c = cache.get_or_compile("shared_pattern_xyz", false, false).unwrap();
        assert!(!Arc::ptr_eq(&a.regex, &c.regex));
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn test_pattern_cache_stays_bounded() {
        let cache = PatternCache::new(16);
        for i in 0..5000 {
            cache.get_or_compile(&format!("literal_{i}"), false, true).unwrap();
            assert!(cache.len() <= 16);
        }

        // Invalid patterns are never stored
        assert!(cache.get_or_compile("(", true, true).is_err());
        assert!(cache.len() <= 16);
    }

    #[test]
    fn test_may_span_lines() {
        let spans = |pattern: &str, regex: bool| {
            PatternMatcher::new(pattern, regex, true)
                .unwrap()
                .may_span_lines()
        };

        assert!(!spans("TODO", false));
        assert!(!spans("a.b[c]", false));
        assert!(spans("BEGIN\nEND", false));

        assert!(!spans(r"fn \w+\(\d+\)", true));
        assert!(!spans(r"a.*b", true));
        assert!(!spans(r"\[literal\]", true));
        assert!(spans(r"BEGIN\nEND", true));
        assert!(spans(r"BEGIN\s+END", true));
        assert!(spans(r"a[^x]b", true));
        assert!(spans(r"(?s)a.b", true));
        assert!(spans("BEGIN\nEND", true));
    }

    #[test]
    fn test_matches_non_utf8_bytes() {
        let matcher = PatternMatcher::new("needle", false, true).unwrap();
        let haystack = [0xff, 0xfe, b'n', b'e', b'e', b'd', b'l', b'e'];
        assert_eq!(matcher.find_matches(&haystack), vec![(2, 8)]);
    }
}
