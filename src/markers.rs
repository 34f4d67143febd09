//! Package marker bookkeeping
//!
//! `__init__.py` cannot sit next to a module while Cython builds it (the
//! build fails on Windows and the resulting extension imports wrongly on
//! Linux), so markers are moved aside for the duration of a run. The ledger
//! records every move and puts the markers back exactly once, either through
//! [`MarkerLedger::restore_all`] or, if the run unwinds first, on drop.

use crate::{ProtectError, ProtectResult};
use std::fs;
use std::path::{Path, PathBuf};

/// File name of a package marker
pub const PACKAGE_MARKER: &str = "__init__.py";

/// Suffix a hidden marker carries while builds run
pub const MARKER_SENTINEL_SUFFIX: &str = ".not_encrypt";

/// Name a marker is renamed to while builds run
pub fn sentinel_name() -> String {
    format!("{PACKAGE_MARKER}{MARKER_SENTINEL_SUFFIX}")
}

/// A package marker currently renamed to its sentinel name
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenamedMarker {
    pub current_path: PathBuf,
}

impl RenamedMarker {
    /// Where the marker lives once restored
    pub fn original_path(&self) -> PathBuf {
        self.current_path.with_file_name(PACKAGE_MARKER)
    }
}

/// Pending marker restorations for one run
#[derive(Debug, Default)]
pub struct MarkerLedger {
    pending: Vec<RenamedMarker>,
}

impl MarkerLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rename `marker` to the sentinel name and record it.
    /// A marker this ledger already hid is left alone.
    pub fn hide(&mut self, marker: &Path) -> ProtectResult<()> {
        let hidden = marker.with_file_name(sentinel_name());
        if self.pending.iter().any(|m| m.current_path == hidden) {
            return Ok(());
        }
        fs::rename(marker, &hidden).map_err(|e| ProtectError::fs("rename", marker, e))?;
        tracing::debug!("Hid package marker {}", marker.display());
        self.pending.push(RenamedMarker {
            current_path: hidden,
        });
        Ok(())
    }

    pub fn pending(&self) -> &[RenamedMarker] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Rename every recorded marker back. All markers are attempted even if
    /// some fail; the failures are reported together. Returns the number restored.
    pub fn restore_all(&mut self) -> ProtectResult<usize> {
        let mut restored = 0;
        let mut failed = Vec::new();
        for marker in self.pending.drain(..) {
            let original = marker.original_path();
            match fs::rename(&marker.current_path, &original) {
                Ok(()) => restored += 1,
                Err(e) => {
                    tracing::error!(
                        "Failed to restore {} -> {}: {}",
                        marker.current_path.display(),
                        original.display(),
                        e
                    );
                    failed.push(original);
                }
            }
        }
        if failed.is_empty() {
            Ok(restored)
        } else {
            Err(ProtectError::MarkerRestore { paths: failed })
        }
    }
}

impl Drop for MarkerLedger {
    fn drop(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        tracing::warn!(
            "Restoring {} package marker(s) left pending by an interrupted run",
            self.pending.len()
        );
        let _ = self.restore_all();
    }
}
