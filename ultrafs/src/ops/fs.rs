use serde::Serialize;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, trace};

use crate::errors::{EngineError, EngineResult};

/// What a directory entry is, without following symlinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
    Other,
}

impl EntryKind {
    fn of(metadata: &Metadata) -> Self {
        let ft = metadata.file_type();
        if ft.is_symlink() {
            EntryKind::Symlink
        } else if ft.is_dir() {
            EntryKind::Directory
        } else if ft.is_file() {
            EntryKind::File
        } else {
            EntryKind::Other
        }
    }
}

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DirEntryInfo {
    pub name: String,
    pub path: PathBuf,
    pub kind: EntryKind,
    /// Length in bytes; 0 for directories
    pub size: u64,
    pub modified: Option<SystemTime>,
}

/// Lists `dir` sorted by name
pub fn list_directory(dir: &Path) -> EngineResult<Vec<DirEntryInfo>> {
    let metadata = fs::metadata(dir).map_err(|e| EngineError::io(dir, e))?;
    if !metadata.is_dir() {
        return Err(EngineError::invalid_argument(format!(
            "{} is not a directory",
            dir.display()
        )));
    }

    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(|e| EngineError::io(dir, e))? {
        let entry = entry.map_err(|e| EngineError::io(dir, e))?;
        let path = entry.path();
        let metadata = match fs::symlink_metadata(&path) {
            Ok(m) => m,
            // Raced with a delete
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => return Err(EngineError::io(&path, e)),
        };
        let kind = EntryKind::of(&metadata);
        entries.push(DirEntryInfo {
            name: entry.file_name().to_string_lossy().into_owned(),
            path,
            kind,
            size: if kind == EntryKind::Directory { 0 } else { metadata.len() },
            modified: metadata.modified().ok(),
        });
    }

    entries.sort_by(|a, b| a.name.cmp(&b.name));
    trace!("Listed {} entries in {}", entries.len(), dir.display());
    Ok(entries)
}

/// Creates `dir` and any missing parents. Succeeds if it already exists.
pub fn create_directory(dir: &Path) -> EngineResult<PathBuf> {
    match fs::metadata(dir) {
        Ok(m) if m.is_dir() => return Ok(dir.to_path_buf()),
        Ok(_) => return Err(EngineError::conflict(dir)),
        Err(_) => {}
    }
    fs::create_dir_all(dir).map_err(|e| EngineError::io(dir, e))?;
    debug!("Created directory {}", dir.display());
    Ok(dir.to_path_buf())
}

/// Moves a file or directory. The destination must not exist.
pub fn move_path(from: &Path, to: &Path) -> EngineResult<PathBuf> {
    let metadata = fs::symlink_metadata(from).map_err(|e| EngineError::io(from, e))?;
    check_destination(from, to, &metadata)?;
    ensure_parent(to)?;

    match fs::rename(from, to) {
        Ok(()) => {}
        Err(e) if is_cross_device(&e) => {
            debug!(
                "Rename across filesystems, copying {} to {}",
                from.display(),
                to.display()
            );
            copy_recursive(from, to, &metadata)?;
            remove(from, &metadata, true)?;
        }
        Err(e) => return Err(EngineError::io(from, e)),
    }

    debug!("Moved {} to {}", from.display(), to.display());
    Ok(to.to_path_buf())
}

/// Copies a file, or a directory recursively. The destination must not exist.
pub fn copy_path(from: &Path, to: &Path) -> EngineResult<PathBuf> {
    let metadata = fs::symlink_metadata(from).map_err(|e| EngineError::io(from, e))?;
    check_destination(from, to, &metadata)?;
    ensure_parent(to)?;
    copy_recursive(from, to, &metadata)?;
    debug!("Copied {} to {}", from.display(), to.display());
    Ok(to.to_path_buf())
}

/// Deletes a file, symlink or directory. A non-empty directory needs
/// `recursive`.
pub fn delete(path: &Path, recursive: bool) -> EngineResult<()> {
    let metadata = fs::symlink_metadata(path).map_err(|e| EngineError::io(path, e))?;
    remove(path, &metadata, recursive)?;
    debug!("Deleted {}", path.display());
    Ok(())
}

fn remove(path: &Path, metadata: &Metadata, recursive: bool) -> EngineResult<()> {
    let result = if metadata.is_dir() {
        if recursive {
            fs::remove_dir_all(path)
        } else {
            let mut entries = fs::read_dir(path).map_err(|e| EngineError::io(path, e))?;
            if entries.next().is_some() {
                return Err(EngineError::invalid_argument(format!(
                    "directory {} is not empty",
                    path.display()
                )));
            }
            fs::remove_dir(path)
        }
    } else {
        fs::remove_file(path)
    };
    result.map_err(|e| EngineError::io(path, e))
}

fn check_destination(from: &Path, to: &Path, metadata: &Metadata) -> EngineResult<()> {
    if fs::symlink_metadata(to).is_ok() {
        return Err(EngineError::conflict(to));
    }
    if metadata.is_dir() && to.starts_with(from) {
        return Err(EngineError::invalid_argument(format!(
            "cannot place {} inside itself",
            from.display()
        )));
    }
    Ok(())
}

fn ensure_parent(path: &Path) -> EngineResult<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => {
            fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))
        }
        _ => Ok(()),
    }
}

fn copy_recursive(from: &Path, to: &Path, metadata: &Metadata) -> EngineResult<()> {
    let ft = metadata.file_type();
    if ft.is_dir() {
        fs::create_dir(to).map_err(|e| EngineError::io(to, e))?;
        for entry in fs::read_dir(from).map_err(|e| EngineError::io(from, e))? {
            let entry = entry.map_err(|e| EngineError::io(from, e))?;
            let child = entry.path();
            let child_meta = fs::symlink_metadata(&child).map_err(|e| EngineError::io(&child, e))?;
            copy_recursive(&child, &to.join(entry.file_name()), &child_meta)?;
        }
        Ok(())
    } else if ft.is_symlink() {
        copy_symlink(from, to)
    } else {
        fs::copy(from, to).map_err(|e| EngineError::io(from, e))?;
        Ok(())
    }
}

#[cfg(unix)]
fn copy_symlink(from: &Path, to: &Path) -> EngineResult<()> {
    let target = fs::read_link(from).map_err(|e| EngineError::io(from, e))?;
    std::os::unix::fs::symlink(target, to).map_err(|e| EngineError::io(to, e))
}

#[cfg(not(unix))]
fn copy_symlink(from: &Path, to: &Path) -> EngineResult<()> {
    fs::copy(from, to).map_err(|e| EngineError::io(from, e))?;
    Ok(())
}

#[cfg(unix)]
fn is_cross_device(err: &io::Error) -> bool {
    // EXDEV on Linux and the BSDs
    err.raw_os_error() == Some(18)
}

#[cfg(not(unix))]
fn is_cross_device(err: &io::Error) -> bool {
    // ERROR_NOT_SAME_DEVICE
    err.raw_os_error() == Some(17)
}
