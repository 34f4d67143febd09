//! Removal of build intermediates after each build

use crate::builder::{descriptor_path, BuildOutcome, BUILD_SCRATCH_DIR};
use crate::walker::WorkItem;
use std::fs;
use std::path::{Path, PathBuf};

/// Removes what a build leaves behind besides the compiled extension
#[derive(Debug, Clone, Default)]
pub struct Cleaner {
    keep_failed_sources: bool,
}

impl Cleaner {
    pub fn new(keep_failed_sources: bool) -> Self {
        Self {
            keep_failed_sources,
        }
    }

    /// Best-effort cleanup; returns the paths that were removed.
    /// Missing artifacts are skipped and removal errors are only logged.
    pub fn clean(&self, item: &WorkItem, outcome: &BuildOutcome) -> Vec<PathBuf> {
        let dir = item.directory();
        let stem = item.stem();

        let mut targets = Vec::with_capacity(4);
        // A pre-existing build/ belongs to the project, not to us
        if outcome.created_scratch_dir {
            targets.push(dir.join(BUILD_SCRATCH_DIR));
        }
        targets.push(dir.join(format!("{stem}.c")));
        if outcome.success || !self.keep_failed_sources {
            targets.push(item.source_path.clone());
        }
        // A descriptor that was already there is not ours to delete
        if outcome.wrote_descriptor {
            targets.push(descriptor_path(item));
        }

        targets
            .into_iter()
            .filter(|path| remove_if_present(path))
            .collect()
    }
}

fn remove_if_present(path: &Path) -> bool {
    let Ok(metadata) = fs::symlink_metadata(path) else {
        return false;
    };
    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };
    match result {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!("Failed to remove {}: {}", path.display(), e);
            false
        }
    }
}
