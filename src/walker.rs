//! Destination tree walk: classify entries, strip sources, hide markers

use crate::annotations;
use crate::fs_ops::DirEntryInfo;
use crate::markers::{MarkerLedger, PACKAGE_MARKER};
use crate::{EncryptConfig, ProtectError, ProtectResult};
use regex::Regex;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// The project's own build script, shipped as written
pub const PROJECT_SETUP_SCRIPT: &str = "setup.py";

/// Interpreter bytecode cache; trivially decompiled, so never shipped
pub const BUILD_CACHE_DIR: &str = "__pycache__";

/// Extension of files that get stripped and compiled
pub const SOURCE_EXTENSION: &str = "py";

/// Files that are never stripped or compiled: the package marker, the
/// project's build script and the entry points that must stay importable as source
pub const EXCLUDED_NAMES: [&str; 4] = [PACKAGE_MARKER, PROJECT_SETUP_SCRIPT, "main.py", "manage.py"];

/// How the walk treats one filesystem entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileClassification {
    /// `__init__.py`: hidden during builds, restored afterwards
    PackageMarker,
    /// Left exactly as copied
    Excluded,
    /// Stripped and queued for a build
    Eligible,
    /// Walked recursively
    Directory,
    /// `__pycache__`: deleted
    BuildCache,
    /// Not Python; ignored
    Ignored,
}

/// One file queued for build and clean
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub source_path: PathBuf,
}

impl WorkItem {
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self {
            source_path: source_path.into(),
        }
    }

    /// Directory the build runs in
    pub fn directory(&self) -> &Path {
        self.source_path.parent().unwrap_or_else(|| Path::new("."))
    }

    pub fn file_name(&self) -> String {
        self.source_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn stem(&self) -> String {
        self.source_path
            .file_stem()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Everything a walk produced, in pre-order
#[derive(Debug, Default)]
pub struct Collection {
    pub work_items: Vec<WorkItem>,
    pub excluded: Vec<PathBuf>,
    pub purged_caches: Vec<PathBuf>,
}

/// Decides the [`FileClassification`] of directory entries
#[derive(Debug)]
pub struct Classifier {
    entry_points: Vec<String>,
    exclude: Vec<Regex>,
}

impl Classifier {
    pub fn new(config: &EncryptConfig) -> ProtectResult<Self> {
        let exclude = config
            .exclude
            .iter()
            .map(|pattern| {
                Regex::new(&glob_to_regex(pattern)).map_err(|e| {
                    ProtectError::Config(format!("invalid exclude pattern '{pattern}': {e}"))
                })
            })
            .collect::<ProtectResult<Vec<_>>>()?;
        Ok(Self {
            entry_points: config.entry_points.clone(),
            exclude,
        })
    }

    /// Classify an entry; `rel_path` is relative to the destination root
    pub fn classify(&self, entry: &DirEntryInfo, rel_path: &Path) -> FileClassification {
        if entry.is_dir {
            return if entry.name == BUILD_CACHE_DIR {
                FileClassification::BuildCache
            } else {
                FileClassification::Directory
            };
        }
        if !entry.is_file {
            return FileClassification::Ignored;
        }
        if entry.name == PACKAGE_MARKER {
            return FileClassification::PackageMarker;
        }
        if EXCLUDED_NAMES.contains(&entry.name.as_str())
            || self.entry_points.iter().any(|n| *n == entry.name)
        {
            return FileClassification::Excluded;
        }
        if Path::new(&entry.name).extension().is_some_and(|ext| ext == SOURCE_EXTENSION) {
            if self.is_excluded(rel_path) {
                return FileClassification::Excluded;
            }
            return FileClassification::Eligible;
        }
        FileClassification::Ignored
    }

    fn is_excluded(&self, rel_path: &Path) -> bool {
        // Normalize to forward slashes for matching consistency
        let path_str = rel_path.to_string_lossy().replace('\\', "/");
        self.exclude.iter().any(|re| re.is_match(&path_str))
    }
}

/// Walks the destination tree, mutating it in place
pub struct TreeWalker<'a> {
    classifier: &'a Classifier,
    root: &'a Path,
}

impl<'a> TreeWalker<'a> {
    /// `root` is the destination root that exclude patterns are relative to
    pub fn new(classifier: &'a Classifier, root: &'a Path) -> Self {
        Self { classifier, root }
    }

    /// Pre-order walk of everything below `dir`, siblings in name order
    pub fn walk(
        &self,
        dir: &Path,
        collection: &mut Collection,
        markers: &mut MarkerLedger,
    ) -> ProtectResult<()> {
        let mut entries = WalkDir::new(dir)
            .min_depth(1)
            .follow_links(true)
            .sort_by_file_name()
            .into_iter();
        while let Some(entry) = entries.next() {
            let entry = DirEntryInfo::from(&entry?);
            if self.visit(&entry, collection, markers)? {
                // Purged; there is nothing left to descend into
                entries.skip_current_dir();
            }
        }
        Ok(())
    }

    /// Classify and handle a single file (or directory) at `path`
    pub fn visit_path(
        &self,
        path: &Path,
        collection: &mut Collection,
        markers: &mut MarkerLedger,
    ) -> ProtectResult<()> {
        let metadata = fs::metadata(path).map_err(|e| ProtectError::fs("stat", path, e))?;
        if metadata.is_dir() {
            return self.walk(path, collection, markers);
        }
        let entry = DirEntryInfo {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_path_buf(),
            is_file: metadata.is_file(),
            is_dir: metadata.is_dir(),
        };
        self.visit(&entry, collection, markers).map(|_| ())
    }

    /// Handle one entry; returns whether a directory was purged
    fn visit(
        &self,
        entry: &DirEntryInfo,
        collection: &mut Collection,
        markers: &mut MarkerLedger,
    ) -> ProtectResult<bool> {
        let rel_path = entry.path.strip_prefix(self.root).unwrap_or(&entry.path);
        match self.classifier.classify(entry, rel_path) {
            FileClassification::BuildCache => {
                fs::remove_dir_all(&entry.path)
                    .map_err(|e| ProtectError::fs("remove", &entry.path, e))?;
                tracing::debug!("Purged bytecode cache {}", rel_path.display());
                collection.purged_caches.push(entry.path.clone());
                return Ok(true);
            }
            FileClassification::Directory => {}
            FileClassification::PackageMarker => markers.hide(&entry.path)?,
            FileClassification::Excluded => {
                tracing::debug!("Skipping excluded file: {}", rel_path.display());
                collection.excluded.push(entry.path.clone());
            }
            FileClassification::Eligible => {
                strip_in_place(&entry.path)?;
                collection.work_items.push(WorkItem::new(&entry.path));
            }
            FileClassification::Ignored => {}
        }
        Ok(false)
    }
}

/// Rewrite a source file without its type annotations
pub fn strip_in_place(path: &Path) -> ProtectResult<()> {
    let bytes = fs::read(path).map_err(|e| ProtectError::fs("read", path, e))?;
    let parse_error = |source| ProtectError::Parse {
        path: path.to_path_buf(),
        source,
    };
    let source = String::from_utf8(bytes)
        .map_err(|_| parse_error(crate::ParseError::new(1, 1, "source is not valid UTF-8")))?;
    let stripped = annotations::strip(&source).map_err(parse_error)?;
    if stripped != source {
        fs::write(path, stripped).map_err(|e| ProtectError::fs("write", path, e))?;
    }
    Ok(())
}

/// Glob -> regex (supports **, *, ?)
fn glob_to_regex(pattern: &str) -> String {
    // Normalize separators in pattern too
    let pattern = pattern.replace('\\', "/");
    let chars: Vec<char> = pattern.chars().collect();

    let mut out = String::from("^");
    let mut i = 0usize;

    while i < chars.len() {
        match chars[i] {
            '*' if chars.get(i + 1) == Some(&'*') => {
                // **/ matches zero or more directories
                if chars.get(i + 2) == Some(&'/') {
                    out.push_str("(?:.*/)?");
                    i += 3;
                } else {
                    out.push_str(".*");
                    i += 2;
                }
            }
            '*' => {
                out.push_str("[^/]*");
                i += 1;
            }
            '?' => {
                out.push_str("[^/]");
                i += 1;
            }
            c => {
                out.push_str(&regex::escape(c.encode_utf8(&mut [0u8; 4])));
                i += 1;
            }
        }
    }

    out.push('$');
    out
}
