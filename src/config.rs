//! Configuration for project protection

use crate::{ProtectError, ProtectResult};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Suffix appended to the source directory name for the default destination
pub const DEFAULT_DESTINATION_SUFFIX: &str = ".encrypt";

fn default_delete_wait_ms() -> u64 {
    5_000
}

fn default_delete_poll_ms() -> u64 {
    50
}

/// Tunables for a protection run, usually loaded from `aurora-encrypt.toml`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct EncryptConfig {
    /// Python interpreter used to run the build descriptor
    /// (default: `python3`, `python` on Windows)
    #[serde(default)]
    pub python_path: Option<String>,

    /// Additional entry-point file names that must stay uncompiled,
    /// on top of `main.py` and `manage.py`
    #[serde(default)]
    pub entry_points: Vec<String>,

    /// Glob patterns (relative to the destination root) of `.py` files
    /// that are copied but never stripped or compiled
    #[serde(default)]
    pub exclude: Vec<String>,

    /// Kill the toolchain if a single build takes longer than this
    #[serde(default)]
    pub build_timeout_secs: Option<u64>,

    /// Upper bound for waiting on a deleted destination to disappear
    #[serde(default = "default_delete_wait_ms")]
    pub delete_wait_ms: u64,

    /// Interval between checks while waiting on a deletion
    #[serde(default = "default_delete_poll_ms")]
    pub delete_poll_ms: u64,

    /// Leave `<stem>.py` in place when its build fails
    #[serde(default)]
    pub keep_failed_sources: bool,
}

impl Default for EncryptConfig {
    fn default() -> Self {
        Self {
            python_path: None,
            entry_points: vec![],
            exclude: vec![],
            build_timeout_secs: None,
            delete_wait_ms: default_delete_wait_ms(),
            delete_poll_ms: default_delete_poll_ms(),
            keep_failed_sources: false,
        }
    }
}

impl EncryptConfig {
    /// Create new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load configuration from a TOML file
    pub fn from_toml_file(path: &Path) -> ProtectResult<Self> {
        let text = fs::read_to_string(path)
            .map_err(|e| ProtectError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> ProtectResult<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Set Python path
    pub fn python_path(mut self, path: impl Into<String>) -> Self {
        self.python_path = Some(path.into());
        self
    }

    /// Add an entry-point file name
    pub fn entry_point(mut self, name: impl Into<String>) -> Self {
        self.entry_points.push(name.into());
        self
    }

    /// Add exclude pattern
    pub fn exclude(mut self, pattern: impl Into<String>) -> Self {
        self.exclude.push(pattern.into());
        self
    }

    /// Set the per-build timeout
    pub fn build_timeout(mut self, secs: u64) -> Self {
        self.build_timeout_secs = Some(secs);
        self
    }

    pub fn keep_failed_sources(mut self, keep: bool) -> Self {
        self.keep_failed_sources = keep;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.build_timeout_secs.map(Duration::from_secs)
    }

    pub fn delete_wait(&self) -> Duration {
        Duration::from_millis(self.delete_wait_ms)
    }

    pub fn delete_poll(&self) -> Duration {
        Duration::from_millis(self.delete_poll_ms.max(1))
    }
}

/// Interpreter used when neither the CLI nor the config names one
pub fn default_toolchain() -> PathBuf {
    if cfg!(windows) {
        PathBuf::from("python")
    } else {
        PathBuf::from("python3")
    }
}

/// What to protect and where to put the result
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectSpec {
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    pub toolchain_path: PathBuf,
    /// Paths relative to `source_root`; `None` protects the whole tree
    pub explicit_files: Option<Vec<PathBuf>>,
}

impl ProjectSpec {
    /// Protect the whole of `source_root` into `<source_root>.encrypt`
    pub fn new(source_root: impl Into<PathBuf>) -> Self {
        let source_root = source_root.into();
        Self {
            destination_root: default_destination(&source_root),
            source_root,
            toolchain_path: default_toolchain(),
            explicit_files: None,
        }
    }

    pub fn destination(mut self, destination: impl Into<PathBuf>) -> Self {
        self.destination_root = destination.into();
        self
    }

    pub fn toolchain(mut self, toolchain: impl Into<PathBuf>) -> Self {
        self.toolchain_path = toolchain.into();
        self
    }

    pub fn files<I, P>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        self.explicit_files = Some(files.into_iter().map(Into::into).collect());
        self
    }
}

/// `<parent>/<name>.encrypt` next to the source directory
pub fn default_destination(source_root: &Path) -> PathBuf {
    let absolute = std::path::absolute(source_root).unwrap_or_else(|_| source_root.to_path_buf());
    let name = absolute
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());
    absolute.with_file_name(format!("{name}{DEFAULT_DESTINATION_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EncryptConfig::default();
        assert_eq!(config.python_path, None);
        assert_eq!(config.delete_wait(), Duration::from_secs(5));
        assert_eq!(config.timeout(), None);
        assert!(!config.keep_failed_sources);
    }

    #[test]
    fn test_builder() {
        let config = EncryptConfig::new()
            .python_path("/opt/py/bin/python")
            .entry_point("wsgi.py")
            .exclude("**/migrations/**")
            .build_timeout(120);
        assert_eq!(config.python_path.as_deref(), Some("/opt/py/bin/python"));
        assert_eq!(config.entry_points, vec!["wsgi.py"]);
        assert_eq!(config.timeout(), Some(Duration::from_secs(120)));
    }

    #[test]
    fn test_from_toml() {
        let config = EncryptConfig::from_toml_str(
            r#"
python_path = "python3.11"
entry_points = ["app.py"]
exclude = ["tests/**"]
build_timeout_secs = 300
"#,
        )
        .unwrap();
        assert_eq!(config.python_path.as_deref(), Some("python3.11"));
        assert_eq!(config.exclude, vec!["tests/**"]);
        assert_eq!(config.delete_poll_ms, 50);

        assert!(EncryptConfig::from_toml_str("build_timeout_secs = 'soon'").is_err());
    }

    #[test]
    fn test_default_destination() {
        let dest = default_destination(Path::new("/work/project"));
        assert_eq!(dest, PathBuf::from("/work/project.encrypt"));

        let spec = ProjectSpec::new("/work/app").files(["a.py", "pkg"]);
        assert_eq!(spec.destination_root, PathBuf::from("/work/app.encrypt"));
        assert_eq!(
            spec.explicit_files,
            Some(vec![PathBuf::from("a.py"), PathBuf::from("pkg")])
        );
    }
}
