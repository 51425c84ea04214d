/// This module defines the error taxonomy shared by every engine operation.
///
/// # Error Kinds
///
/// Every failure surfaced to a caller falls into exactly one [`ErrorKind`]:
///
/// | Kind | Meaning | Retry? |
/// |------|---------|--------|
/// | `AccessDenied` | path resolves outside the allowed directories | no |
/// | `NotFound` | target (or a required ancestor) does not exist | no |
/// | `PermissionDenied` | the OS refused the operation | no |
/// | `Io` | hardware/transport failure | no |
/// | `Overloaded` | scheduler admission limit reached | yes, back off |
/// | `Conflict` | a write to the same path is already in flight | no |
/// | `InvalidArgument` | malformed pattern or options | no |
/// | `Cancelled` | aborted by a cancellation token | no |
///
/// Configuration problems found at startup use a separate `Config` variant;
/// they never occur once an engine has been built.
///
/// # Path Reporting
///
/// Errors carry the path the caller asked about, not internal temporary
/// files, so a protocol layer can forward `to_string()` verbatim. Failures
/// that have no path of their own (overload, cancellation, bad arguments)
/// are wrapped in [`EngineError::Context`] with the operation's subject:
/// ```rust,ignore
/// match engine.read("notes/today.md") {
///     Ok(output) => // use output.content,
///     Err(e) if e.kind() == ErrorKind::Overloaded => // retry later,
///     Err(e) => eprintln!("{}", e),
/// }
/// ```
use serde::Serialize;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Coarse classification of an [`EngineError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ErrorKind {
    AccessDenied,
    NotFound,
    PermissionDenied,
    Io,
    Overloaded,
    Conflict,
    InvalidArgument,
    Cancelled,
    Config,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::AccessDenied => "access_denied",
            ErrorKind::NotFound => "not_found",
            ErrorKind::PermissionDenied => "permission_denied",
            ErrorKind::Io => "io_error",
            ErrorKind::Overloaded => "overloaded",
            ErrorKind::Conflict => "conflict",
            ErrorKind::InvalidArgument => "invalid_argument",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Config => "config_error",
        };
        f.write_str(name)
    }
}

/// Errors that can occur while serving filesystem operations
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Access denied: {0} is outside the allowed directories")]
    AccessDenied(PathBuf),
    #[error("File not found: {0}")]
    NotFound(PathBuf),
    #[error("Permission denied: {0}")]
    PermissionDenied(PathBuf),
    #[error("IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("Engine overloaded: {in_flight} operations in flight (limit {limit})")]
    Overloaded { in_flight: usize, limit: usize },
    #[error("Conflict: {0} already exists or is in use")]
    Conflict(PathBuf),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Operation cancelled")]
    Cancelled,
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("{source}: {path}")]
    Context {
        path: PathBuf,
        #[source]
        source: Box<EngineError>,
    },
}

impl EngineError {
    pub fn access_denied(path: impl Into<PathBuf>) -> Self {
        Self::AccessDenied(path.into())
    }

    pub fn not_found(path: impl Into<PathBuf>) -> Self {
        Self::NotFound(path.into())
    }

    pub fn permission_denied(path: impl Into<PathBuf>) -> Self {
        Self::PermissionDenied(path.into())
    }

    pub fn conflict(path: impl Into<PathBuf>) -> Self {
        Self::Conflict(path.into())
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn config_error(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Classifies an I/O error against the path it happened on
    pub fn io(path: impl AsRef<Path>, err: io::Error) -> Self {
        let path = path.as_ref().to_path_buf();
        match err.kind() {
            io::ErrorKind::NotFound => Self::NotFound(path),
            io::ErrorKind::PermissionDenied => Self::PermissionDenied(path),
            _ => Self::Io { path, source: err },
        }
    }

    /// Attaches `path` to an error that has none; other errors are returned
    /// unchanged
    pub fn with_path(self, path: impl AsRef<Path>) -> Self {
        if self.path().is_some() {
            return self;
        }
        Self::Context {
            path: path.as_ref().to_path_buf(),
            source: Box::new(self),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::AccessDenied(_) => ErrorKind::AccessDenied,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::PermissionDenied(_) => ErrorKind::PermissionDenied,
            EngineError::Io { .. } => ErrorKind::Io,
            EngineError::Overloaded { .. } => ErrorKind::Overloaded,
            EngineError::Conflict(_) => ErrorKind::Conflict,
            EngineError::InvalidArgument(_) => ErrorKind::InvalidArgument,
            EngineError::Cancelled => ErrorKind::Cancelled,
            EngineError::Config(_) => ErrorKind::Config,
            EngineError::Context { source, .. } => source.kind(),
        }
    }

    /// The path the error refers to, when there is one
    pub fn path(&self) -> Option<&Path> {
        match self {
            EngineError::AccessDenied(p)
            | EngineError::NotFound(p)
            | EngineError::PermissionDenied(p)
            | EngineError::Conflict(p) => Some(p),
            EngineError::Io { path, .. } | EngineError::Context { path, .. } => Some(path),
            _ => None,
        }
    }

    /// Only overload is worth retrying; everything else is a caller problem
    pub fn is_retriable(&self) -> bool {
        self.kind() == ErrorKind::Overloaded
    }
}

/// Strips the Windows UNC prefix (\\?\) from a path if present
pub fn strip_unc_prefix(p: &Path) -> PathBuf {
    let s = p.display().to_string();
    if let Some(stripped) = s.strip_prefix(r"\\?\") {
        PathBuf::from(stripped)
    } else {
        p.to_path_buf()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_classification() {
        let path = Path::new("data/report.csv");

        let err = EngineError::io(path, io::Error::from(io::ErrorKind::NotFound));
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = EngineError::io(path, io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), ErrorKind::PermissionDenied);

        let err = EngineError::io(path, io::Error::new(io::ErrorKind::Other, "disk on fire"));
        assert_eq!(err.kind(), ErrorKind::Io);
        assert_eq!(err.path(), Some(path));
    }

    #[test]
    fn test_error_messages() {
        let err = EngineError::access_denied("/etc/passwd");
        assert_eq!(
            err.to_string(),
            "Access denied: /etc/passwd is outside the allowed directories"
        );

        let err = EngineError::Overloaded {
            in_flight: 12,
            limit: 12,
        };
        assert_eq!(
            err.to_string(),
            "Engine overloaded: 12 operations in flight (limit 12)"
        );
        assert!(err.is_retriable());

        let err = EngineError::invalid_argument("unclosed group");
        assert_eq!(err.to_string(), "Invalid argument: unclosed group");
        assert!(!err.is_retriable());
        assert_eq!(err.path(), None);
    }

    #[test]
    fn test_with_path_keeps_kind() {
        let err = EngineError::Overloaded {
            in_flight: 4,
            limit: 4,
        }
        .with_path("logs/app.log");
        assert_eq!(err.kind(), ErrorKind::Overloaded);
        assert!(err.is_retriable());
        assert_eq!(err.path(), Some(Path::new("logs/app.log")));
        assert_eq!(
            err.to_string(),
            "Engine overloaded: 4 operations in flight (limit 4): logs/app.log"
        );

        let err = EngineError::Cancelled.with_path("a.txt");
        assert_eq!(err.kind(), ErrorKind::Cancelled);
        assert_eq!(err.path(), Some(Path::new("a.txt")));

        // Errors that already name a path keep it
        let err = EngineError::not_found("real.txt").with_path("asked.txt");
        assert!(matches!(err, EngineError::NotFound(_)));
        assert_eq!(err.path(), Some(Path::new("real.txt")));
    }

    #[test]
    fn test_kind_display() {
        assert_eq!(ErrorKind::AccessDenied.to_string(), "access_denied");
        assert_eq!(ErrorKind::Overloaded.to_string(), "overloaded");
        assert_eq!(EngineError::Cancelled.kind().to_string(), "cancelled");
    }

    #[test]
    fn test_strip_unc_prefix() {
        assert_eq!(
            strip_unc_prefix(Path::new(r"\\?\C:\work")),
            PathBuf::from(r"C:\work")
        );
        assert_eq!(strip_unc_prefix(Path::new("/srv/data")), PathBuf::from("/srv/data"));
    }
}
