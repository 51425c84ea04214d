use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use super::{SafeWriter, WriteOutcome};
use crate::access::AccessIntent;
use crate::errors::{EngineError, EngineResult};
use crate::scheduler::CancellationToken;

const READ_BUFFER_CAPACITY: usize = 65536;

fn check_chunk_size(chunk_size: usize) -> EngineResult<()> {
    if chunk_size == 0 {
        return Err(EngineError::invalid_argument("chunk size must be at least 1 byte"));
    }
    Ok(())
}

/// Writes `content` in `chunk_size` pieces, checking `token` between pieces.
/// Cancellation discards everything written so far; the target only changes
/// at the final rename.
pub fn chunked_write(
    writer: &SafeWriter,
    path: &Path,
    content: &[u8],
    chunk_size: usize,
    token: &CancellationToken,
) -> EngineResult<WriteOutcome> {
    check_chunk_size(chunk_size)?;
    let _pin = writer.cache().pin(path)?;

    writer.commit(path, false, None, |out| {
        let mut written = 0u64;
        for (i, chunk) in content.chunks(chunk_size).enumerate() {
            token.check()?;
            out.write_all(chunk).map_err(|e| EngineError::io(path, e))?;
            written += chunk.len() as u64;
            trace!("Chunk {} of {} written ({} bytes)", i + 1, path.display(), chunk.len());
        }
        token.check()?;
        Ok(written)
    })
}

/// Name of the `index`-th part of `file_name` (1-based)
pub fn part_name(file_name: &str, index: usize) -> String {
    format!("{}.part{:04}", file_name, index)
}

/// Splits `path` into `chunk_size`-byte parts under `out_dir`, named
/// `<file>.part0001`, `<file>.part0002`, ... An empty file yields one empty
/// part so it can be joined back.
pub fn split_file(
    writer: &SafeWriter,
    path: &Path,
    chunk_size: usize,
    out_dir: &Path,
    token: &CancellationToken,
) -> EngineResult<Vec<PathBuf>> {
    check_chunk_size(chunk_size)?;
    let handle = writer.accessor().open(path, AccessIntent::Read)?;
    let content = handle.read_all();
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| EngineError::invalid_argument(format!("{} has no file name", path.display())))?;

    let mut chunks: Vec<&[u8]> = content.chunks(chunk_size).collect();
    if chunks.is_empty() {
        chunks.push(&[]);
    }

    let mut parts = Vec::with_capacity(chunks.len());
    for (i, chunk) in chunks.into_iter().enumerate() {
        token.check()?;
        let part = out_dir.join(part_name(&file_name, i + 1));
        writer.write_safe(&part, chunk, false)?;
        parts.push(part);
    }

    debug!("Split {} into {} parts", path.display(), parts.len());
    Ok(parts)
}

/// Concatenates `parts` in order into `dest`, atomically
pub fn join_files(
    writer: &SafeWriter,
    parts: &[PathBuf],
    dest: &Path,
    token: &CancellationToken,
) -> EngineResult<WriteOutcome> {
    if parts.is_empty() {
        return Err(EngineError::invalid_argument("join needs at least one part"));
    }
    let _pin = writer.cache().pin(dest)?;

    let outcome = writer.commit(dest, false, None, |out| {
        let mut written = 0u64;
        for part in parts {
            token.check()?;
            let file = File::open(part).map_err(|e| EngineError::io(part, e))?;
            let mut reader = BufReader::with_capacity(READ_BUFFER_CAPACITY, file);
            written += io::copy(&mut reader, &mut *out).map_err(|e| EngineError::io(part, e))?;
        }
        Ok(written)
    })?;

    debug!("Joined {} parts into {}", parts.len(), dest.display());
    Ok(outcome)
}
