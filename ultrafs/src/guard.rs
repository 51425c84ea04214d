use std::io;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::errors::{strip_unc_prefix, EngineError, EngineResult};

/// Confines every incoming path to the configured allowed directories.
///
/// Resolution happens in three steps:
/// 1. relative inputs are anchored at the first allowed directory and `.`/`..`
///    segments are folded away lexically;
/// 2. the longest existing ancestor is canonicalized, which resolves symlinks,
///    and the not-yet-existing tail is appended;
/// 3. the result must sit inside one allowed directory, compared component by
///    component so `/srv/data2` never passes for `/srv/data`.
///
/// Escapes are reported before existence, so `../../etc/passwd` is always
/// `AccessDenied` and never leaks whether the target exists.
#[derive(Debug, Clone)]
pub struct PathGuard {
    roots: Vec<PathBuf>,
}

impl PathGuard {
    pub fn new<P: AsRef<Path>>(allowed: &[P]) -> EngineResult<Self> {
        if allowed.is_empty() {
            return Err(EngineError::config_error(
                "at least one allowed directory is required",
            ));
        }

        let mut roots = Vec::with_capacity(allowed.len());
        for dir in allowed {
            let dir = dir.as_ref();
            let canonical = dir.canonicalize().map_err(|e| {
                EngineError::config_error(format!(
                    "allowed directory {} is unusable: {}",
                    dir.display(),
                    e
                ))
            })?;
            if !canonical.is_dir() {
                return Err(EngineError::config_error(format!(
                    "allowed directory {} is not a directory",
                    dir.display()
                )));
            }
            let canonical = strip_unc_prefix(&canonical);
            if !roots.contains(&canonical) {
                roots.push(canonical);
            }
        }

        debug!("Path guard roots: {:?}", roots);
        Ok(Self { roots })
    }

    /// Canonical allowed directories
    pub fn roots(&self) -> &[PathBuf] {
        &self.roots
    }

    /// Resolves a path that must already exist
    pub fn resolve(&self, raw: impl AsRef<Path>) -> EngineResult<PathBuf> {
        self.resolve_inner(raw.as_ref(), true)
    }

    /// Resolves a path that may not exist yet (write targets, new directories)
    pub fn resolve_for_create(&self, raw: impl AsRef<Path>) -> EngineResult<PathBuf> {
        self.resolve_inner(raw.as_ref(), false)
    }

    /// Whether `path` is one of the allowed directories itself
    pub fn is_root(&self, path: &Path) -> bool {
        self.roots.iter().any(|root| same_path(path, root))
    }

    /// Whether an already canonical path is inside the allowed set
    pub fn contains(&self, canonical: &Path) -> bool {
        self.roots
            .iter()
            .any(|root| starts_with_root(canonical, root))
    }

    fn resolve_inner(&self, raw: &Path, must_exist: bool) -> EngineResult<PathBuf> {
        if raw.as_os_str().is_empty() {
            return Err(EngineError::invalid_argument("path must not be empty"));
        }

        let anchored = if raw.is_absolute() {
            raw.to_path_buf()
        } else {
            self.roots[0].join(raw)
        };
        let normalized = normalize_lexically(&anchored);

        let (existing, tail) = split_existing(&normalized, raw)?;
        let mut resolved = strip_unc_prefix(&existing);
        for component in tail.iter().rev() {
            resolved.push(component);
        }

        if !self.contains(&resolved) {
            warn!("Rejected path outside allowed directories: {}", raw.display());
            return Err(EngineError::access_denied(raw));
        }

        if must_exist && !tail.is_empty() {
            return Err(EngineError::not_found(raw));
        }

        Ok(resolved)
    }
}

/// Folds `.` and `..` without touching the filesystem
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                // `..` at the root stays at the root
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Canonicalizes the longest existing ancestor of `path`. Returns it together
/// with the missing components, innermost first.
fn split_existing(path: &Path, raw: &Path) -> EngineResult<(PathBuf, Vec<std::ffi::OsString>)> {
    let mut current = path.to_path_buf();
    let mut tail = Vec::new();

    loop {
        match current.canonicalize() {
            Ok(canonical) => return Ok((canonical, tail)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                // A dangling symlink exists as an entry but points nowhere we can check
                if current.symlink_metadata().is_ok() {
                    return Err(EngineError::access_denied(raw));
                }
                match current.file_name() {
                    Some(name) => tail.push(name.to_os_string()),
                    None => return Err(EngineError::not_found(raw)),
                }
                if !current.pop() {
                    return Err(EngineError::not_found(raw));
                }
            }
            Err(e) => return Err(EngineError::io(raw, e)),
        }
    }
}

fn starts_with_root(path: &Path, root: &Path) -> bool {
    if cfg!(windows) {
        let path = path.to_string_lossy().to_lowercase();
        let root = root.to_string_lossy().to_lowercase();
        Path::new(&path).starts_with(Path::new(&root))
    } else {
        path.starts_with(root)
    }
}

fn same_path(a: &Path, b: &Path) -> bool {
    if cfg!(windows) {
        a.to_string_lossy().to_lowercase() == b.to_string_lossy().to_lowercase()
    } else {
        a == b
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::fs;
    use tempfile::tempdir;

    fn setup() -> (tempfile::TempDir, PathGuard) {
        let dir = tempdir().unwrap();
        let allowed = dir.path().join("allowed");
        fs::create_dir_all(allowed.join("sub")).unwrap();
        fs::write(allowed.join("sub/file.txt"), "hello").unwrap();
        fs::write(dir.path().join("secret.txt"), "nope").unwrap();
        let guard = PathGuard::new(&[&allowed]).unwrap();
        (dir, guard)
    }

    #[test]
    fn test_resolves_paths_inside_allowed_dir() {
        let (dir, guard) = setup();
        let root = dir.path().join("allowed").canonicalize().unwrap();

        let resolved = guard.resolve(root.join("sub/file.txt")).unwrap();
        assert_eq!(resolved, root.join("sub/file.txt"));

        // Relative paths anchor at the first root
        let resolved = guard.resolve("sub/./file.txt").unwrap();
        assert_eq!(resolved, root.join("sub/file.txt"));

        // Wandering out and back in is fine
        let resolved = guard.resolve("sub/../sub/file.txt").unwrap();
        assert_eq!(resolved, root.join("sub/file.txt"));
    }

    #[test]
    fn test_traversal_is_access_denied() {
        let (dir, guard) = setup();

        let err = guard.resolve("../secret.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);

        let err = guard.resolve("../../../../../../etc/passwd").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);

        // Escape is reported even when the target does not exist
        let err = guard.resolve("../does-not-exist").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);

        let err = guard.resolve(dir.path().join("secret.txt")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn test_sibling_with_common_prefix_is_denied() {
        let (dir, guard) = setup();
        let sibling = dir.path().join("allowed2");
        fs::create_dir_all(&sibling).unwrap();
        fs::write(sibling.join("x.txt"), "x").unwrap();

        let err = guard.resolve(sibling.join("x.txt")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn test_missing_target() {
        let (_dir, guard) = setup();

        let err = guard.resolve("sub/missing.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.path(), Some(Path::new("sub/missing.txt")));

        let created = guard.resolve_for_create("sub/new/deeper/file.txt").unwrap();
        assert!(created.ends_with("sub/new/deeper/file.txt"));
        assert!(guard.contains(&created));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_escape_is_denied() {
        let (dir, guard) = setup();
        let allowed = dir.path().join("allowed");
        std::os::unix::fs::symlink(dir.path(), allowed.join("escape")).unwrap();
        std::os::unix::fs::symlink(dir.path().join("gone"), allowed.join("dangling")).unwrap();

        let err = guard.resolve("escape/secret.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);

        let err = guard.resolve_for_create("escape/new.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);

        let err = guard.resolve_for_create("dangling").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::AccessDenied);
    }

    #[test]
    fn test_roots_and_construction() {
        let (dir, guard) = setup();
        let root = dir.path().join("allowed").canonicalize().unwrap();
        assert!(guard.is_root(&root));
        assert!(!guard.is_root(&root.join("sub")));

        let none: [&Path; 0] = [];
        assert_eq!(
            PathGuard::new(&none).unwrap_err().kind(),
            ErrorKind::Config
        );
        assert!(PathGuard::new(&[dir.path().join("missing")]).is_err());
        assert!(PathGuard::new(&[dir.path().join("secret.txt")]).is_err());
    }

    #[test]
    fn test_empty_path_is_invalid() {
        let (_dir, guard) = setup();
        assert_eq!(
            guard.resolve("").unwrap_err().kind(),
            ErrorKind::InvalidArgument
        );
    }

    #[test]
    fn test_normalize_lexically() {
        assert_eq!(
            normalize_lexically(Path::new("/a/b/../c/./d")),
            PathBuf::from("/a/c/d")
        );
        assert_eq!(
            normalize_lexically(Path::new("/../../etc")),
            PathBuf::from("/etc")
        );
    }
}
