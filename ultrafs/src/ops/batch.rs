use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use super::analyze::{DuplicateGroup, FileAnalysis, ProjectAnalysis};
use super::compare::Comparison;
use super::fs::DirEntryInfo;
use super::{ItemOutcome, ReadOutput};
use crate::engine::Engine;
use crate::errors::{EngineError, EngineResult};
use crate::metrics::OperationKind;
use crate::results::Match;
use crate::scheduler::CancellationToken;
use crate::search::SearchOptions;
use crate::write::{EditOutcome, EditScope, WriteOutcome};

/// One item of a batch, as read from a JSON batch file:
///
/// ```json
/// [
///   { "op": "write", "path": "notes/a.md", "content": "hello", "backup": true },
///   { "op": "edit", "path": "notes/a.md", "find": "hello", "replace": "hi" },
///   { "op": "search", "roots": ["notes"], "pattern": "hi", "options": { "max_results": 5 } }
/// ]
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Operation {
    Read {
        path: PathBuf,
    },
    ReadMultiple {
        paths: Vec<PathBuf>,
    },
    Write {
        path: PathBuf,
        content: String,
        #[serde(default)]
        backup: bool,
    },
    Edit {
        path: PathBuf,
        find: String,
        replace: String,
        #[serde(default)]
        scope: EditScope,
        #[serde(default)]
        backup: bool,
    },
    Move {
        from: PathBuf,
        to: PathBuf,
    },
    Copy {
        from: PathBuf,
        to: PathBuf,
    },
    Delete {
        path: PathBuf,
        #[serde(default)]
        recursive: bool,
    },
    ListDirectory {
        path: PathBuf,
    },
    CreateDirectory {
        path: PathBuf,
    },
    Search {
        #[serde(default)]
        roots: Vec<PathBuf>,
        pattern: String,
        #[serde(default)]
        options: SearchOptions,
    },
    Compare {
        a: PathBuf,
        b: PathBuf,
    },
    AnalyzeFile {
        path: PathBuf,
    },
    AnalyzeProject {
        root: PathBuf,
    },
    FindDuplicates {
        root: PathBuf,
    },
    ChunkedWrite {
        path: PathBuf,
        content: String,
        chunk_size: usize,
    },
    SplitFile {
        path: PathBuf,
        chunk_size: usize,
        out_dir: PathBuf,
    },
    JoinFiles {
        parts: Vec<PathBuf>,
        dest: PathBuf,
    },
}

impl Operation {
    pub fn kind(&self) -> OperationKind {
        match self {
            Operation::Read { .. } => OperationKind::Read,
            Operation::ReadMultiple { .. } => OperationKind::ReadMultiple,
            Operation::Write { .. } => OperationKind::Write,
            Operation::Edit { .. } => OperationKind::Edit,
            Operation::Move { .. } => OperationKind::Move,
            Operation::Copy { .. } => OperationKind::Copy,
            Operation::Delete { .. } => OperationKind::Delete,
            Operation::ListDirectory { .. } => OperationKind::ListDirectory,
            Operation::CreateDirectory { .. } => OperationKind::CreateDirectory,
            Operation::Search { .. } => OperationKind::Search,
            Operation::Compare { .. } => OperationKind::Compare,
            Operation::AnalyzeFile { .. } => OperationKind::AnalyzeFile,
            Operation::AnalyzeProject { .. } => OperationKind::AnalyzeProject,
            Operation::FindDuplicates { .. } => OperationKind::FindDuplicates,
            Operation::ChunkedWrite { .. } => OperationKind::ChunkedWrite,
            Operation::SplitFile { .. } => OperationKind::SplitFile,
            Operation::JoinFiles { .. } => OperationKind::JoinFiles,
        }
    }

    /// The path an outcome is reported under
    pub fn primary_path(&self) -> &Path {
        match self {
            Operation::Read { path }
            | Operation::Write { path, .. }
            | Operation::Edit { path, .. }
            | Operation::Delete { path, .. }
            | Operation::ListDirectory { path }
            | Operation::CreateDirectory { path }
            | Operation::AnalyzeFile { path }
            | Operation::ChunkedWrite { path, .. }
            | Operation::SplitFile { path, .. } => path,
            Operation::Move { from, .. } | Operation::Copy { from, .. } => from,
            Operation::Compare { a, .. } => a,
            Operation::AnalyzeProject { root } | Operation::FindDuplicates { root } => root,
            Operation::JoinFiles { dest, .. } => dest,
            Operation::ReadMultiple { paths } => paths.first().map_or(Path::new(""), PathBuf::as_path),
            Operation::Search { roots, .. } => roots.first().map_or(Path::new(""), PathBuf::as_path),
        }
    }

    /// Every path the operation touches. Targets may be created by earlier
    /// items of the same batch, so these are only checked for confinement.
    pub fn paths(&self) -> Vec<&Path> {
        match self {
            Operation::Read { path }
            | Operation::Write { path, .. }
            | Operation::Edit { path, .. }
            | Operation::Delete { path, .. }
            | Operation::ListDirectory { path }
            | Operation::CreateDirectory { path }
            | Operation::AnalyzeFile { path }
            | Operation::ChunkedWrite { path, .. } => vec![path.as_path()],
            Operation::ReadMultiple { paths } => paths.iter().map(PathBuf::as_path).collect(),
            Operation::Search { roots, .. } => roots.iter().map(PathBuf::as_path).collect(),
            Operation::Move { from, to } | Operation::Copy { from, to } => vec![from.as_path(), to.as_path()],
            Operation::Compare { a, b } => vec![a.as_path(), b.as_path()],
            Operation::AnalyzeProject { root } | Operation::FindDuplicates { root } => vec![root.as_path()],
            Operation::SplitFile { path, out_dir, .. } => vec![path.as_path(), out_dir.as_path()],
            Operation::JoinFiles { parts, dest } => parts
                .iter()
                .map(PathBuf::as_path)
                .chain(std::iter::once(dest.as_path()))
                .collect(),
        }
    }
}

/// Result of one batch item
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum OperationOutput {
    Read(ReadOutput),
    ReadMultiple(Vec<ItemOutcome<ReadOutput>>),
    Write(WriteOutcome),
    Edit(EditOutcome),
    /// Destination of a move, copy or directory creation
    Path(PathBuf),
    Deleted,
    Listing(Vec<DirEntryInfo>),
    Matches(Vec<Match>),
    Comparison(Comparison),
    FileAnalysis(FileAnalysis),
    ProjectAnalysis(ProjectAnalysis),
    Duplicates(Vec<DuplicateGroup>),
    Parts(Vec<PathBuf>),
}

/// How a batch reacts to failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchMode {
    /// Every item runs; each reports its own outcome
    #[default]
    Independent,
    /// All paths are validated before anything runs, and the first failure
    /// cancels the remaining items. Completed items are not rolled back.
    Atomic,
}

/// Runs one operation through the engine
pub fn execute(
    engine: &Engine,
    op: &Operation,
    token: &CancellationToken,
) -> EngineResult<OperationOutput> {
    let output = match op {
        Operation::Read { path } => OperationOutput::Read(engine.read(path)?),
        Operation::ReadMultiple { paths } => OperationOutput::ReadMultiple(engine.read_multiple(paths)),
        Operation::Write {
            path,
            content,
            backup,
        } => OperationOutput::Write(engine.write_safe(path, content.as_bytes(), *backup)?),
        Operation::Edit {
            path,
            find,
            replace,
            scope,
            backup,
        } => OperationOutput::Edit(engine.edit(path, find, replace, *scope, *backup)?),
        Operation::Move { from, to } => OperationOutput::Path(engine.move_path(from, to)?),
        Operation::Copy { from, to } => OperationOutput::Path(engine.copy_path(from, to)?),
        Operation::Delete { path, recursive } => {
            engine.delete(path, *recursive)?;
            OperationOutput::Deleted
        }
        Operation::ListDirectory { path } => OperationOutput::Listing(engine.list_directory(path)?),
        Operation::CreateDirectory { path } => OperationOutput::Path(engine.create_directory(path)?),
        Operation::Search {
            roots,
            pattern,
            options,
        } => {
            let stream = engine.search(roots, pattern, options, token)?;
            OperationOutput::Matches(stream.collect::<EngineResult<Vec<_>>>()?)
        }
        Operation::Compare { a, b } => OperationOutput::Comparison(engine.compare(a, b)?),
        Operation::AnalyzeFile { path } => OperationOutput::FileAnalysis(engine.analyze_file(path)?),
        Operation::AnalyzeProject { root } => {
            OperationOutput::ProjectAnalysis(engine.analyze_project(root)?)
        }
        Operation::FindDuplicates { root } => {
            OperationOutput::Duplicates(engine.find_duplicates(root)?)
        }
        Operation::ChunkedWrite {
            path,
            content,
            chunk_size,
        } => OperationOutput::Write(engine.chunked_write(
            path,
            content.as_bytes(),
            *chunk_size,
            token,
        )?),
        Operation::SplitFile {
            path,
            chunk_size,
            out_dir,
        } => OperationOutput::Parts(engine.split_file(path, *chunk_size, out_dir)?),
        Operation::JoinFiles { parts, dest } => OperationOutput::Write(engine.join_files(parts, dest)?),
    };
    Ok(output)
}

/// Runs `ops` in order and reports one outcome per item, in input order
pub fn run(
    engine: &Engine,
    ops: &[Operation],
    mode: BatchMode,
    token: &CancellationToken,
) -> Vec<ItemOutcome<OperationOutput>> {
    info!("Running batch of {} operations ({:?})", ops.len(), mode);

    if mode == BatchMode::Atomic {
        if let Some(rejected) = validate_all(engine, ops) {
            return rejected;
        }
    }

    let mut outcomes = Vec::with_capacity(ops.len());
    let mut stopped = false;
    for op in ops {
        let path = op.primary_path().to_path_buf();
        if stopped || token.is_cancelled() {
            outcomes.push(ItemOutcome::new(path, Err(EngineError::Cancelled)));
            continue;
        }

        let result = execute(engine, op, token);
        if let Err(e) = &result {
            debug!("Batch item {} failed: {}", op.kind().name(), e);
            stopped = mode == BatchMode::Atomic;
        }
        outcomes.push(ItemOutcome::new(path, result));
    }
    outcomes
}

/// Resolves every path up front. Returns the per-item outcomes when any
/// path is rejected: the offending items carry their error and the rest are
/// `Cancelled`.
fn validate_all(engine: &Engine, ops: &[Operation]) -> Option<Vec<ItemOutcome<OperationOutput>>> {
    let errors: Vec<Option<EngineError>> = ops
        .iter()
        .map(|op| {
            op.paths()
                .into_iter()
                .find_map(|path| engine.guard().resolve_for_create(path).err())
        })
        .collect();

    if errors.iter().all(Option::is_none) {
        return None;
    }

    debug!("Atomic batch rejected during validation");
    Some(
        ops.iter()
            .zip(errors)
            .map(|(op, error)| {
                let error = error.unwrap_or(EngineError::Cancelled);
                ItemOutcome::new(op.primary_path(), Err(error))
            })
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_operations_deserialize_from_json() {
        let json = r#"[
            { "op": "write", "path": "a.txt", "content": "hello" },
            { "op": "edit", "path": "a.txt", "find": "hello", "replace": "hi", "scope": "first" },
            { "op": "edit", "path": "a.txt", "find": "x", "replace": "y", "scope": { "nth": 2 } },
            { "op": "search", "pattern": "hi", "options": { "max_results": 5, "regex": true } },
            { "op": "delete", "path": "a.txt" }
        ]"#;
        let ops: Vec<Operation> = serde_json::from_str(json).unwrap();
        assert_eq!(ops.len(), 5);
        assert_eq!(
            ops[0],
            Operation::Write {
                path: PathBuf::from("a.txt"),
                content: "hello".to_string(),
                backup: false
            }
        );
        assert!(matches!(ops[1], Operation::Edit { scope: EditScope::First, .. }));
        assert!(matches!(ops[2], Operation::Edit { scope: EditScope::Nth(2), .. }));
        match &ops[3] {
            Operation::Search { roots, options, .. } => {
                assert!(roots.is_empty());
                assert_eq!(options.max_results, Some(5));
                assert!(options.regex);
                assert!(options.case_sensitive);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(matches!(ops[4], Operation::Delete { recursive: false, .. }));
    }

    #[test]
    fn test_unknown_operation_is_rejected() {
        let result: Result<Operation, _> = serde_json::from_str(r#"{ "op": "format_disk" }"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_kind_and_primary_path() {
        let op = Operation::Move {
            from: PathBuf::from("a"),
            to: PathBuf::from("b"),
        };
        assert_eq!(op.kind(), OperationKind::Move);
        assert_eq!(op.primary_path(), Path::new("a"));
        assert_eq!(op.paths().len(), 2);
    }
}
