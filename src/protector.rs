//! Project protector: copy, strip, compile, clean, restore

use crate::builder::{BuildInvoker, BuildOutcome};
use crate::cleaner::Cleaner;
use crate::config::{default_toolchain, EncryptConfig, ProjectSpec};
use crate::fs_ops;
use crate::markers::MarkerLedger;
use crate::progress::{ProgressSink, TracingProgress};
use crate::walker::{Classifier, Collection, TreeWalker, WorkItem};
use crate::{ProtectError, ProtectResult};
use serde::Serialize;
use std::fmt;
use std::fs;
use std::path::{Component, Path, PathBuf};

/// Run stages, in order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Init,
    Collecting,
    Building,
    Cleaning,
    Restoring,
    Done,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "init",
            Self::Collecting => "collecting",
            Self::Building => "building",
            Self::Cleaning => "cleaning",
            Self::Restoring => "restoring",
            Self::Done => "done",
        };
        f.write_str(name)
    }
}

/// A module that compiled
#[derive(Debug, Clone, Serialize)]
pub struct CompiledArtifact {
    /// Source path inside the destination tree
    pub source: PathBuf,
    /// Compiled extension path (.pyd/.so)
    pub output: PathBuf,
    /// Stripped source size
    pub original_size: u64,
    /// Compiled file size
    pub compiled_size: u64,
}

/// A module whose build failed
#[derive(Debug, Clone, Serialize)]
pub struct FailedBuild {
    pub path: PathBuf,
    pub diagnostic: String,
}

/// Summary of a run that reached the end
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub destination: PathBuf,
    pub attempted: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub compiled: Vec<CompiledArtifact>,
    pub failures: Vec<FailedBuild>,
    pub excluded: usize,
    pub caches_purged: usize,
    pub markers_restored: usize,
    pub total_original_size: u64,
    pub total_compiled_size: u64,
}

impl RunSummary {
    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_success() {
            writeln!(
                f,
                "Protected {} of {} module(s) into {}",
                self.succeeded,
                self.attempted,
                self.destination.display()
            )?;
        } else {
            writeln!(
                f,
                "Completed with {}/{} failure(s) in {}",
                self.failed,
                self.attempted,
                self.destination.display()
            )?;
            for failure in &self.failures {
                writeln!(f, "  FAILED {}", failure.path.display())?;
                for line in failure.diagnostic.lines() {
                    writeln!(f, "    {line}")?;
                }
            }
        }
        write!(
            f,
            "{} excluded, {} bytecode cache(s) purged, {} package marker(s) restored",
            self.excluded, self.caches_purged, self.markers_restored
        )
    }
}

/// Source and destination after resolution and validation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedRoots {
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
}

/// Resolve both roots and refuse layouts that would touch the original sources
pub fn resolve_roots(spec: &ProjectSpec) -> ProtectResult<ResolvedRoots> {
    let source_root = fs_ops::resolve(&spec.source_root)?;
    if !source_root.is_dir() {
        return Err(ProtectError::SourceNotFound(spec.source_root.clone()));
    }
    let destination_root = fs_ops::resolve(&spec.destination_root)?;
    if destination_root == source_root {
        return Err(ProtectError::DestinationConflict {
            source_root,
            destination: destination_root,
        });
    }
    if destination_root.starts_with(&source_root) {
        return Err(ProtectError::DestinationInsideSource {
            source_root,
            destination: destination_root,
        });
    }
    Ok(ResolvedRoots {
        source_root,
        destination_root,
    })
}

/// Python project protector
pub struct Protector {
    spec: ProjectSpec,
    config: EncryptConfig,
    progress: Box<dyn ProgressSink>,
}

impl Protector {
    /// Create a new protector
    pub fn new(spec: ProjectSpec, config: EncryptConfig) -> Self {
        Self {
            spec,
            config,
            progress: Box::new(TracingProgress),
        }
    }

    pub fn with_progress(mut self, progress: impl ProgressSink + 'static) -> Self {
        self.progress = Box::new(progress);
        self
    }

    /// Run the whole pipeline.
    ///
    /// Returns `Err` when the run aborted (configuration, parse or filesystem
    /// error); build failures do not abort and are listed in the summary.
    /// Package markers hidden before an abort are restored before returning.
    pub fn run(&self) -> ProtectResult<RunSummary> {
        self.enter(Stage::Init);
        let roots = resolve_roots(&self.spec)?;
        let classifier = Classifier::new(&self.config)?;
        let explicit = self.validate_explicit_files(&roots)?;

        let mut markers = MarkerLedger::new();

        self.enter(Stage::Collecting);
        let collection = match self.collect(&roots, explicit.as_deref(), &classifier, &mut markers) {
            Ok(collection) => collection,
            Err(err) => {
                tracing::error!("Aborting while collecting: {err}");
                self.enter(Stage::Restoring);
                if let Err(restore_err) = markers.restore_all() {
                    tracing::error!("{restore_err}");
                }
                return Err(err);
            }
        };
        tracing::info!(
            "Collected {} module(s), {} package marker(s) hidden",
            collection.work_items.len(),
            markers.len()
        );

        let builds = self.build_all(&collection.work_items);

        self.enter(Stage::Restoring);
        let restored = markers.restore_all();
        let summary = summarize(
            roots.destination_root,
            &collection,
            builds,
            *restored.as_ref().unwrap_or(&0),
        );
        if let Err(err) = restored {
            tracing::error!("Builds finished but package markers were not restored:\n{summary}");
            return Err(ProtectError::MarkersNotRestored {
                summary: Box::new(summary),
                source: Box::new(err),
            });
        }

        self.enter(Stage::Done);
        Ok(summary)
    }

    fn enter(&self, stage: Stage) {
        tracing::debug!("Stage: {stage}");
    }

    fn toolchain(&self) -> PathBuf {
        let configured = self
            .config
            .python_path
            .as_ref()
            .filter(|_| self.spec.toolchain_path == default_toolchain())
            .map(PathBuf::from)
            .unwrap_or_else(|| self.spec.toolchain_path.clone());
        // A relative path with separators would be resolved against each
        // build's working directory, so pin it to ours
        if configured.components().count() > 1 && configured.is_relative() {
            std::path::absolute(&configured).unwrap_or(configured)
        } else {
            configured
        }
    }

    /// Checks listed paths before anything is copied
    fn validate_explicit_files(&self, roots: &ResolvedRoots) -> ProtectResult<Option<Vec<PathBuf>>> {
        let Some(files) = &self.spec.explicit_files else {
            return Ok(None);
        };
        for rel in files {
            if !fs_ops::is_contained_relative(rel) {
                return Err(ProtectError::Config(format!(
                    "listed path '{}' must be relative to the source directory",
                    rel.display()
                )));
            }
            if !roots.source_root.join(rel).exists() {
                return Err(ProtectError::SourceNotFound(roots.source_root.join(rel)));
            }
        }
        Ok(Some(collapse_listed(files, &roots.source_root)))
    }

    fn collect(
        &self,
        roots: &ResolvedRoots,
        explicit: Option<&[PathBuf]>,
        classifier: &Classifier,
        markers: &mut MarkerLedger,
    ) -> ProtectResult<Collection> {
        let source = &roots.source_root;
        let destination = &roots.destination_root;
        let walker = TreeWalker::new(classifier, destination);
        let mut collection = Collection::default();

        match explicit {
            None => {
                self.replace_with_copy(source, destination)?;
                walker.walk(destination, &mut collection, markers)?;
            }
            Some(files) => {
                fs::create_dir_all(destination)
                    .map_err(|e| ProtectError::fs("create directory", destination, e))?;
                for rel in files {
                    let item_source = source.join(rel);
                    let item_destination = destination.join(rel);
                    if item_source.is_file() {
                        fs_ops::copy_file(&item_source, &item_destination)?;
                        walker.visit_path(&item_destination, &mut collection, markers)?;
                    } else {
                        self.replace_with_copy(&item_source, &item_destination)?;
                        walker.walk(&item_destination, &mut collection, markers)?;
                    }
                }
            }
        }
        Ok(collection)
    }

    /// Delete `to` (waiting until it is really gone), then copy `from` there
    fn replace_with_copy(&self, from: &Path, to: &Path) -> ProtectResult<()> {
        fs_ops::remove_and_wait(to, self.config.delete_wait(), self.config.delete_poll())?;
        let files = fs_ops::copy_tree(from, to)?;
        tracing::info!("Copied {} file(s) from {} to {}", files, from.display(), to.display());
        Ok(())
    }

    /// Build then clean every item in order; failures never stop the loop
    fn build_all(&self, items: &[WorkItem]) -> Vec<(WorkItem, BuildOutcome, u64)> {
        let invoker = BuildInvoker::new(self.toolchain(), self.config.timeout());
        let cleaner = Cleaner::new(self.config.keep_failed_sources);
        let total = items.len();
        tracing::info!("Compiling {} module(s) with {}", total, invoker.toolchain().display());

        let mut results = Vec::with_capacity(total);
        for (index, item) in items.iter().enumerate() {
            let original_size = fs::metadata(&item.source_path).map(|m| m.len()).unwrap_or(0);

            self.enter(Stage::Building);
            let outcome = invoker.build(item);
            match (&outcome.artifact, &outcome.diagnostic) {
                (Some(artifact), _) => tracing::info!(
                    "Compiled: {} -> {}",
                    item.source_path.display(),
                    artifact.display()
                ),
                (None, diagnostic) => tracing::warn!(
                    "Failed to compile {}: {}",
                    item.source_path.display(),
                    diagnostic.as_deref().unwrap_or("unknown error")
                ),
            }

            self.enter(Stage::Cleaning);
            cleaner.clean(item, &outcome);

            let label = if outcome.success { "done" } else { "failed" };
            self.progress
                .report(index + 1, total, &format!("{} {}", item.file_name(), label));
            results.push((item.clone(), outcome, original_size));
        }
        results
    }
}

/// Listed paths without `.` components, duplicates, or entries that a
/// listed directory already covers. First-listed order is kept.
fn collapse_listed(files: &[PathBuf], source_root: &Path) -> Vec<PathBuf> {
    let normalized: Vec<PathBuf> = files
        .iter()
        .map(|rel| rel.components().filter(|c| !matches!(c, Component::CurDir)).collect())
        .collect();
    let directories: Vec<&PathBuf> = normalized
        .iter()
        .filter(|rel| source_root.join(rel).is_dir())
        .collect();

    let mut kept: Vec<PathBuf> = Vec::with_capacity(normalized.len());
    for rel in &normalized {
        let covered = directories.iter().any(|dir| *dir != rel && rel.starts_with(dir));
        if !covered && !kept.contains(rel) {
            kept.push(rel.clone());
        }
    }
    kept
}

fn summarize(
    destination: PathBuf,
    collection: &Collection,
    builds: Vec<(WorkItem, BuildOutcome, u64)>,
    markers_restored: usize,
) -> RunSummary {
    let attempted = builds.len();
    let mut compiled = Vec::new();
    let mut failures = Vec::new();
    for (item, outcome, original_size) in builds {
        match outcome.artifact.filter(|_| outcome.success) {
            Some(output) => {
                let compiled_size = fs::metadata(&output).map(|m| m.len()).unwrap_or(0);
                compiled.push(CompiledArtifact {
                    source: item.source_path,
                    output,
                    original_size,
                    compiled_size,
                });
            }
            None => failures.push(FailedBuild {
                path: item.source_path,
                diagnostic: outcome.diagnostic.unwrap_or_else(|| "build failed".to_string()),
            }),
        }
    }

    RunSummary {
        destination,
        attempted,
        succeeded: compiled.len(),
        failed: failures.len(),
        total_original_size: compiled.iter().map(|c| c.original_size).sum(),
        total_compiled_size: compiled.iter().map(|c| c.compiled_size).sum(),
        compiled,
        failures,
        excluded: collection.excluded.len(),
        caches_purged: collection.purged_caches.len(),
        markers_restored,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_destination_equal_to_source_rejected() {
        let temp = TempDir::new().unwrap();
        let spec = ProjectSpec::new(temp.path()).destination(temp.path().join("."));
        let err = resolve_roots(&spec).unwrap_err();
        assert!(matches!(err, ProtectError::DestinationConflict { .. }));
        assert_eq!(err.kind(), crate::ErrorKind::Configuration);
    }

    #[test]
    fn test_destination_inside_source_rejected() {
        let temp = TempDir::new().unwrap();
        let spec = ProjectSpec::new(temp.path()).destination(temp.path().join("out"));
        assert!(matches!(
            resolve_roots(&spec),
            Err(ProtectError::DestinationInsideSource { .. })
        ));
    }

    #[test]
    fn test_missing_source_rejected() {
        let temp = TempDir::new().unwrap();
        let spec = ProjectSpec::new(temp.path().join("nope"));
        assert!(matches!(resolve_roots(&spec), Err(ProtectError::SourceNotFound(_))));
    }

    #[test]
    fn test_explicit_paths_must_be_relative() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("proj");
        fs::create_dir_all(&source).unwrap();
        let spec = ProjectSpec::new(&source).files(["../escape.py"]);
        let err = Protector::new(spec, EncryptConfig::default()).run().unwrap_err();
        assert!(matches!(err, ProtectError::Config(_)));
        assert!(!temp.path().join("proj.encrypt").exists());
    }

    #[test]
    fn test_listed_paths_are_collapsed() {
        let temp = TempDir::new().unwrap();
        fs::create_dir_all(temp.path().join("pkg/sub")).unwrap();
        fs::write(temp.path().join("pkg/mod.py"), "").unwrap();
        fs::write(temp.path().join("a.py"), "").unwrap();

        let listed: Vec<PathBuf> = ["pkg/mod.py", "a.py", "./pkg", "pkg/sub", "pkg/", "a.py"]
            .into_iter()
            .map(PathBuf::from)
            .collect();
        assert_eq!(
            collapse_listed(&listed, temp.path()),
            vec![PathBuf::from("a.py"), PathBuf::from("pkg")]
        );

        let whole = vec![PathBuf::from("."), PathBuf::from("a.py")];
        assert_eq!(collapse_listed(&whole, temp.path()), vec![PathBuf::new()]);
    }

    #[test]
    fn test_toolchain_precedence() {
        let spec = ProjectSpec::new("/tmp/p");
        let config = EncryptConfig::new().python_path("/opt/python/bin/python3");
        assert_eq!(
            Protector::new(spec.clone(), config.clone()).toolchain(),
            PathBuf::from("/opt/python/bin/python3")
        );

        let spec = spec.toolchain("/usr/bin/python3.12");
        assert_eq!(
            Protector::new(spec, config).toolchain(),
            PathBuf::from("/usr/bin/python3.12")
        );
    }

    #[test]
    fn test_summary_display() {
        let summary = RunSummary {
            destination: PathBuf::from("/out"),
            attempted: 2,
            succeeded: 1,
            failed: 1,
            compiled: vec![],
            failures: vec![FailedBuild {
                path: PathBuf::from("/out/bad.py"),
                diagnostic: "toolchain exited with exit status: 1".to_string(),
            }],
            excluded: 0,
            caches_purged: 1,
            markers_restored: 2,
            total_original_size: 0,
            total_compiled_size: 0,
        };
        let text = summary.to_string();
        assert!(text.starts_with("Completed with 1/2 failure(s) in /out"));
        assert!(text.contains("FAILED /out/bad.py"));
        assert!(text.ends_with("2 package marker(s) restored"));
    }
}
