//! Filesystem atoms shared by the ledger, event file manager, indices,
//! and projection store: atomic replace via temp-file + rename, and an
//! injective escape for untrusted strings used as path segments.

use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Escape a string so it is safe to use as a single path segment on
/// every supported filesystem, and so that two distinct inputs never
/// collide. Percent-encodes every byte outside `[A-Za-z0-9.-]`,
/// including `%` itself, which keeps the mapping injective. `_` is
/// escaped too: callers join two escaped segments with a literal `_`
/// (tag key/value, tag index key/value), and an unescaped `_` in either
/// half would let two distinct `(a, b)` pairs collide on one file.
pub fn safe_segment(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        let is_plain = byte.is_ascii_alphanumeric() || byte == b'.' || byte == b'-';
        if is_plain {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{:02X}", byte));
        }
    }
    out
}

/// Inverse of [`safe_segment`]: percent-decodes a segment back into
/// its original string. Used where a key must be recovered from a
/// file name rather than carried alongside the file's contents (e.g.
/// [`crate::projection::ProjectionStore::get_all`]).
pub fn unsafe_segment(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let Ok(byte) = u8::from_str_radix(&input[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Write `bytes` to `path` atomically: write to a sibling temp file,
/// optionally fsync it, then rename over the destination. The rename
/// is the commit point.
pub async fn atomic_write(path: &Path, bytes: &[u8], flush: bool) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    tokio::fs::create_dir_all(dir).await?;

    let tmp_path = sibling_tmp_path(path);

    let mut file = tokio::fs::File::create(&tmp_path).await?;
    file.write_all(bytes).await?;
    if flush {
        file.sync_all().await?;
    } else {
        file.flush().await?;
    }
    drop(file);

    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("tmp");
    let tmp_name = format!("{}.tmp.{}", file_name, uuid::Uuid::new_v4());
    path.with_file_name(tmp_name)
}

/// Read a file's bytes, returning `None` if it does not exist.
pub async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Sweep `*.tmp.*` files left behind by an interrupted atomic write.
pub async fn sweep_tmp_files(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        let is_tmp = path
            .file_name()
            .and_then(|n| n.to_str())
            .map(|n| n.contains(".tmp."))
            .unwrap_or(false);
        if is_tmp {
            if tokio::fs::remove_file(&path).await.is_ok() {
                removed += 1;
                tracing::warn!(path = %path.display(), "swept orphaned temp file");
            }
        }
    }
    Ok(removed)
}
