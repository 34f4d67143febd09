//! Aurora Encrypt - Python source protection
//!
//! Turns a Python project into a copy whose modules ship as native
//! extensions (.so/.pyd) instead of readable source:
//!
//! ```text
//! source tree ──► copy ──► destination tree
//!                              │
//!                              ├─ __pycache__/       deleted
//!                              ├─ __init__.py        hidden, restored at the end
//!                              ├─ main.py, setup.py  left as-is
//!                              └─ *.py               annotations stripped
//!                                                      │
//!                                                      ▼
//!                                   setup.py + cythonize ──► mod.*.so
//!                                                      │
//!                                                      ▼
//!                                        mod.py, mod.c, build/ removed
//! ```
//!
//! The source tree is never modified.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use aurora_encrypt::{EncryptConfig, ProjectSpec, Protector};
//!
//! let spec = ProjectSpec::new("my_project").toolchain("/usr/bin/python3");
//! let summary = Protector::new(spec, EncryptConfig::default()).run()?;
//! println!("{summary}");
//! ```

pub mod annotations;
pub mod builder;
pub mod cleaner;
mod config;
mod error;
mod expr;
pub mod fs_ops;
pub mod lexer;
pub mod markers;
pub mod progress;
mod protector;
pub mod syntax;
pub mod telemetry;
pub mod walker;

pub use annotations::strip;
pub use builder::{BuildInvoker, BuildOutcome};
pub use cleaner::Cleaner;
pub use config::{default_destination, default_toolchain, EncryptConfig, ProjectSpec};
pub use error::{ErrorKind, ParseError, ProtectError, ProtectResult};
pub use markers::MarkerLedger;
pub use progress::{NoProgress, ProgressSink, TracingProgress};
pub use protector::{
    resolve_roots, CompiledArtifact, FailedBuild, Protector, ResolvedRoots, RunSummary, Stage,
};
pub use walker::{Classifier, Collection, FileClassification, TreeWalker, WorkItem};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
