//! Filesystem operations served by the [`Engine`](crate::Engine) beyond plain
//! reads, writes and search, plus the shared result types.

pub mod analyze;
pub mod batch;
pub mod compare;
pub mod fs;

use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};
use std::path::PathBuf;

use crate::access::{AccessStrategy, FileContent};
use crate::errors::{EngineError, EngineResult, ErrorKind};

pub use analyze::{DuplicateGroup, ExtensionStats, FileAnalysis, ProjectAnalysis, SizedPath};
pub use batch::{BatchMode, Operation, OperationOutput};
pub use compare::{Comparison, DiffHunk};
pub use fs::{DirEntryInfo, EntryKind};

/// How a payload should travel back to the caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PayloadEncoding {
    /// Small enough to embed in a structured reply
    Inline,
    /// Large; hand out as a raw byte stream
    Stream,
}

impl PayloadEncoding {
    pub fn for_len(len: u64, binary_threshold: u64) -> Self {
        if len >= binary_threshold {
            PayloadEncoding::Stream
        } else {
            PayloadEncoding::Inline
        }
    }
}

/// Result of reading one file
#[derive(Debug, Clone)]
pub struct ReadOutput {
    pub path: PathBuf,
    pub size: u64,
    pub content: FileContent,
    pub encoding: PayloadEncoding,
    pub from_cache: bool,
}

impl ReadOutput {
    pub fn strategy(&self) -> AccessStrategy {
        self.content.strategy()
    }
}

// Inline payloads are embedded as text; streamed ones are left to the caller
impl Serialize for ReadOutput {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("ReadOutput", 6)?;
        state.serialize_field("path", &self.path)?;
        state.serialize_field("size", &self.size)?;
        state.serialize_field("encoding", &self.encoding)?;
        state.serialize_field("strategy", &self.strategy())?;
        state.serialize_field("from_cache", &self.from_cache)?;
        let content = match self.encoding {
            PayloadEncoding::Inline => Some(self.content.to_string_lossy()),
            PayloadEncoding::Stream => None,
        };
        state.serialize_field("content", &content)?;
        state.end()
    }
}

/// Serializable form of an [`EngineError`] inside a multi-item reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ItemError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<EngineError> for ItemError {
    fn from(err: EngineError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one item of a multi-item operation
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome<T> {
    /// The path as the caller gave it
    pub path: PathBuf,
    pub result: Result<T, ItemError>,
}

impl<T> ItemOutcome<T> {
    pub fn new(path: impl Into<PathBuf>, result: EngineResult<T>) -> Self {
        Self {
            path: path.into(),
            result: result.map_err(ItemError::from),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.result.is_ok()
    }

    /// Kind of the failure, if the item failed
    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.result.as_ref().err().map(|e| e.kind)
    }
}
