//! Filesystem primitives: path resolution, tree copy, delete-and-wait

use crate::{ProtectError, ProtectResult};
use std::fs;
use std::path::{Component, Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use walkdir::WalkDir;

/// One entry of a directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntryInfo {
    pub name: String,
    pub path: PathBuf,
    pub is_file: bool,
    pub is_dir: bool,
}

/// Walk entries carry the target's type when links are followed
impl From<&walkdir::DirEntry> for DirEntryInfo {
    fn from(entry: &walkdir::DirEntry) -> Self {
        let file_type = entry.file_type();
        Self {
            name: entry.file_name().to_string_lossy().into_owned(),
            path: entry.path().to_path_buf(),
            is_file: file_type.is_file(),
            is_dir: file_type.is_dir(),
        }
    }
}

/// Absolute, symlink-free form of `path`, which does not need to exist.
/// The longest existing prefix is canonicalized and the rest appended.
pub fn resolve(path: &Path) -> ProtectResult<PathBuf> {
    let absolute = std::path::absolute(path).map_err(|e| ProtectError::fs("resolve", path, e))?;
    let normalized = normalize(&absolute);

    let mut existing = normalized.as_path();
    let mut tail = Vec::new();
    loop {
        if let Ok(canonical) = existing.canonicalize() {
            let mut resolved = canonical;
            resolved.extend(tail.iter().rev());
            return Ok(resolved);
        }
        match (existing.parent(), existing.file_name()) {
            (Some(parent), Some(name)) => {
                tail.push(name.to_os_string());
                existing = parent;
            }
            _ => return Ok(normalized),
        }
    }
}

/// Lexically removes `.` and `..` components
fn normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

/// Whether `path` is relative and stays below its base (no `..`, no root)
pub fn is_contained_relative(path: &Path) -> bool {
    !path.as_os_str().is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Copy a file, creating parent directories as needed
pub fn copy_file(from: &Path, to: &Path) -> ProtectResult<()> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|e| ProtectError::fs("create directory", parent, e))?;
    }
    fs::copy(from, to).map_err(|e| ProtectError::fs("copy", from, e))?;
    Ok(())
}

/// Recursively copy `from` into `to`, following symlinks. Returns the number of files copied.
pub fn copy_tree(from: &Path, to: &Path) -> ProtectResult<usize> {
    let mut files = 0;
    for entry in WalkDir::new(from).follow_links(true).sort_by_file_name() {
        let entry = entry?;
        let rel = entry.path().strip_prefix(from).unwrap_or(entry.path());
        let dest = to.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&dest).map_err(|e| ProtectError::fs("create directory", &dest, e))?;
        } else {
            fs::copy(entry.path(), &dest).map_err(|e| ProtectError::fs("copy", entry.path(), e))?;
            files += 1;
        }
    }
    Ok(files)
}

/// Remove a file or directory tree and block until it is gone.
///
/// Some filesystems (network shares, Windows with open handles) report a
/// deletion as done before the entry disappears; recreating the same path
/// right away would then observe stale files.
pub fn remove_and_wait(path: &Path, wait: Duration, poll: Duration) -> ProtectResult<()> {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return Ok(());
    };
    if metadata.is_dir() {
        fs::remove_dir_all(path).map_err(|e| ProtectError::fs("remove", path, e))?;
    } else {
        fs::remove_file(path).map_err(|e| ProtectError::fs("remove", path, e))?;
    }

    let deadline = Instant::now() + wait;
    while fs::symlink_metadata(path).is_ok() {
        if Instant::now() >= deadline {
            return Err(ProtectError::fs(
                "remove",
                path,
                std::io::Error::new(std::io::ErrorKind::TimedOut, "still present after deletion"),
            ));
        }
        thread::sleep(poll);
    }
    tracing::debug!("Removed {}", path.display());
    Ok(())
}
