//! Error types for aurora-encrypt

use crate::protector::RunSummary;
use std::path::PathBuf;
use thiserror::Error;

/// A source file that could not be parsed
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("line {line}, column {column}: {message}")]
pub struct ParseError {
    /// 1-based line number
    pub line: usize,
    /// 1-based column (in characters)
    pub column: usize,
    pub message: String,
}

impl ParseError {
    pub fn new(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self {
            line,
            column,
            message: message.into(),
        }
    }
}

/// Coarse error category, used for reporting and exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected before any filesystem mutation
    Configuration,
    /// A source file is not valid Python
    Parse,
    /// Copy, delete or rename failed
    Filesystem,
}

/// Protection error types
#[derive(Debug, Error)]
pub enum ProtectError {
    /// Destination resolves to the source root
    #[error("destination {destination} is the source directory itself; refusing to overwrite the original sources")]
    DestinationConflict {
        source_root: PathBuf,
        destination: PathBuf,
    },

    /// Destination lies below the source root
    #[error("destination {destination} is inside source directory {source_root}")]
    DestinationInsideSource {
        source_root: PathBuf,
        destination: PathBuf,
    },

    /// Source root or a listed file does not exist
    #[error("source not found: {0}")]
    SourceNotFound(PathBuf),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Configuration file could not be decoded
    #[error("invalid configuration file: {0}")]
    ConfigFile(#[from] toml::de::Error),

    /// Annotation stripping failed
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    /// A filesystem mutation failed
    #[error("failed to {action} {path}: {source}")]
    Filesystem {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Directory traversal failed
    #[error("directory walk failed: {0}")]
    Walk(#[from] walkdir::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// One or more package markers could not be renamed back
    #[error("failed to restore {} package marker(s): {}", paths.len(), display_paths(paths))]
    MarkerRestore { paths: Vec<PathBuf> },

    /// Every build ran, but restoring package markers afterwards failed
    #[error("{source} ({} of {} module(s) compiled)", summary.succeeded, summary.attempted)]
    MarkersNotRestored {
        summary: Box<RunSummary>,
        #[source]
        source: Box<ProtectError>,
    },
}

impl ProtectError {
    /// Wrap an IO error with the action and path that produced it
    pub fn fs(action: &'static str, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Filesystem {
            action,
            path: path.into(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::DestinationConflict { .. }
            | Self::DestinationInsideSource { .. }
            | Self::SourceNotFound(_)
            | Self::Config(_)
            | Self::ConfigFile(_) => ErrorKind::Configuration,
            Self::Parse { .. } => ErrorKind::Parse,
            Self::Filesystem { .. }
            | Self::Walk(_)
            | Self::Io(_)
            | Self::MarkerRestore { .. }
            | Self::MarkersNotRestored { .. } => ErrorKind::Filesystem,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Result type for protection operations
pub type ProtectResult<T> = Result<T, ProtectError>;
