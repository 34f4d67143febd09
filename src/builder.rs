//! Native build of a single module through Cython
//!
//! Each build writes a `<stem>.setup.py` next to the module that cythonizes
//! exactly that one file, then runs `<python> <stem>.setup.py build_ext --inplace`
//! with the module's directory as the child's working directory. The project's
//! own `setup.py` is never touched. Builds share `build/` in their directory,
//! so two builds in the same directory must never overlap.
//!
//! On Unix the toolchain runs in its own process group, and a timeout kills
//! the whole group so compilers it spawned do not outlive it.

use crate::walker::WorkItem;
use serde::Serialize;
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Directory distutils/setuptools uses for intermediate objects
pub const BUILD_SCRATCH_DIR: &str = "build";

/// Compiled extension suffixes on the supported platforms
pub const EXTENSION_SUFFIXES: [&str; 2] = ["so", "pyd"];

const TOOLCHAIN_ARGS: [&str; 2] = ["build_ext", "--inplace"];

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Lines of toolchain stderr kept in a failure diagnostic
const DIAGNOSTIC_TAIL_LINES: usize = 20;

/// Suffix of the per-module build descriptor
pub const DESCRIPTOR_SUFFIX: &str = ".setup.py";

/// Result of building one work item
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BuildOutcome {
    pub success: bool,
    pub diagnostic: Option<String>,
    /// Compiled extension, when the build produced one
    pub artifact: Option<PathBuf>,
    /// Whether the build created `build/` (and so owns it)
    #[serde(skip)]
    pub created_scratch_dir: bool,
    /// Whether the build wrote the descriptor (and so owns it)
    #[serde(skip)]
    pub wrote_descriptor: bool,
}

impl BuildOutcome {
    fn failed(diagnostic: impl Into<String>, created_scratch_dir: bool) -> Self {
        Self {
            success: false,
            diagnostic: Some(diagnostic.into()),
            artifact: None,
            created_scratch_dir,
            wrote_descriptor: true,
        }
    }
}

/// Path of the build descriptor for one work item: `<stem>.setup.py`
/// next to the module. The extra dot keeps it from being importable.
pub fn descriptor_path(item: &WorkItem) -> PathBuf {
    item.directory().join(format!("{}{DESCRIPTOR_SUFFIX}", item.stem()))
}

/// Render the build descriptor for one module file name
pub fn render_descriptor(file_name: &str) -> String {
    format!(
        r#"from setuptools import setup
from Cython.Build import cythonize

if __name__ == '__main__':
    setup(ext_modules=cythonize({name}, compiler_directives={{'language_level': 3}}))
"#,
        name = python_str_literal(file_name)
    )
}

fn python_str_literal(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('\'');
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\'' => out.push_str("\\'"),
            c => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Find the extension module compiled from `stem` in `dir`
/// (`stem.so`, `stem.cpython-311-x86_64-linux-gnu.so`, `stem.cp311-win_amd64.pyd`, ...)
pub fn find_artifact(dir: &Path, stem: &str) -> Option<PathBuf> {
    let prefix = format!("{stem}.");
    let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
        .ok()?
        .filter_map(Result::ok)
        .map(|entry| entry.path())
        .filter(|path| {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                return false;
            };
            name.starts_with(&prefix)
                && path
                    .extension()
                    .and_then(|ext| ext.to_str())
                    .is_some_and(|ext| EXTENSION_SUFFIXES.contains(&ext))
                && path.is_file()
        })
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// Runs the external toolchain for one work item at a time
#[derive(Debug, Clone)]
pub struct BuildInvoker {
    toolchain: PathBuf,
    timeout: Option<Duration>,
}

impl BuildInvoker {
    pub fn new(toolchain: impl Into<PathBuf>, timeout: Option<Duration>) -> Self {
        Self {
            toolchain: toolchain.into(),
            timeout,
        }
    }

    pub fn toolchain(&self) -> &Path {
        &self.toolchain
    }

    /// Build one module. Failures are reported in the outcome, never raised.
    pub fn build(&self, item: &WorkItem) -> BuildOutcome {
        let dir = item.directory();
        let created_scratch_dir = !dir.join(BUILD_SCRATCH_DIR).exists();

        let descriptor = descriptor_path(item);
        if let Err(e) = write_descriptor(&descriptor, &render_descriptor(&item.file_name())) {
            let reason = if e.kind() == ErrorKind::AlreadyExists {
                format!("{} already exists and belongs to the project", descriptor.display())
            } else {
                format!("failed to write {}: {e}", descriptor.display())
            };
            return BuildOutcome {
                wrote_descriptor: false,
                ..BuildOutcome::failed(reason, false)
            };
        }

        if let Err(diagnostic) = self.run_toolchain(dir, &descriptor) {
            return BuildOutcome::failed(diagnostic, created_scratch_dir);
        }

        match find_artifact(dir, &item.stem()) {
            Some(artifact) => BuildOutcome {
                success: true,
                diagnostic: None,
                artifact: Some(artifact),
                created_scratch_dir,
                wrote_descriptor: true,
            },
            None => BuildOutcome::failed(
                format!("toolchain succeeded but no compiled extension for '{}' was produced", item.stem()),
                created_scratch_dir,
            ),
        }
    }

    fn run_toolchain(&self, dir: &Path, descriptor: &Path) -> Result<(), String> {
        let script = descriptor.file_name().unwrap_or(descriptor.as_os_str());
        tracing::debug!(
            "Running {} {} {} in {}",
            self.toolchain.display(),
            Path::new(script).display(),
            TOOLCHAIN_ARGS.join(" "),
            dir.display()
        );
        let mut command = Command::new(&self.toolchain);
        command
            .arg(script)
            .args(TOOLCHAIN_ARGS)
            .current_dir(dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }
        let mut child = command
            .spawn()
            .map_err(|e| format!("failed to run {}: {e}", self.toolchain.display()))?;

        // Drain both pipes so a chatty compiler cannot block on a full buffer
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = self.wait(&mut child);
        let stdout = stdout.join().unwrap_or_default();
        let stderr = stderr.join().unwrap_or_default();
        if !stdout.trim().is_empty() {
            tracing::debug!("toolchain output:\n{}", stdout.trim_end());
        }

        match status {
            Ok(status) if status.success() => Ok(()),
            Ok(status) => Err(failure_diagnostic(&format!("toolchain exited with {status}"), &stderr)),
            Err(reason) => Err(failure_diagnostic(&reason, &stderr)),
        }
    }

    fn wait(&self, child: &mut Child) -> Result<ExitStatus, String> {
        let Some(timeout) = self.timeout else {
            return child.wait().map_err(|e| format!("failed to wait for toolchain: {e}"));
        };
        let deadline = Instant::now() + timeout;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(status),
                Ok(None) if Instant::now() >= deadline => {
                    kill_process_group(child);
                    let _ = child.wait();
                    return Err(format!("toolchain timed out after {}s and was killed", timeout.as_secs()));
                }
                Ok(None) => thread::sleep(POLL_INTERVAL),
                Err(e) => return Err(format!("failed to wait for toolchain: {e}")),
            }
        }
    }
}

/// Kill the toolchain and everything it spawned. The child leads its own
/// process group on Unix, so its pid is the group id.
fn kill_process_group(child: &mut Child) {
    #[cfg(unix)]
    {
        let pid = child.id() as libc::pid_t;
        // SAFETY: killpg only sends a signal; the group was created at spawn
        if unsafe { libc::killpg(pid, libc::SIGKILL) } == 0 {
            return;
        }
    }
    let _ = child.kill();
}

/// Create the descriptor, refusing to replace a file that is already there
fn write_descriptor(path: &Path, contents: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().write(true).create_new(true).open(path)?;
    file.write_all(contents.as_bytes())
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut pipe) = pipe {
            let _ = pipe.read_to_end(&mut buf);
        }
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn failure_diagnostic(reason: &str, stderr: &str) -> String {
    let lines: Vec<&str> = stderr.lines().filter(|l| !l.trim().is_empty()).collect();
    if lines.is_empty() {
        return reason.to_string();
    }
    let tail = &lines[lines.len().saturating_sub(DIAGNOSTIC_TAIL_LINES)..];
    format!("{reason}\n{}", tail.join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_descriptor_names_one_file() {
        let descriptor = render_descriptor("mod.py");
        assert!(descriptor.contains("cythonize('mod.py', compiler_directives={'language_level': 3})"));
        assert!(!descriptor.contains("except"));
    }

    #[test]
    fn test_descriptor_escapes_quotes() {
        assert_eq!(python_str_literal(r"it's\x.py"), r"'it\'s\\x.py'");
    }

    #[test]
    fn test_find_artifact() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("mod.py"), "").unwrap();
        fs::write(temp.path().join("mod.c"), "").unwrap();
        fs::write(temp.path().join("module.cpython-311-x86_64-linux-gnu.so"), "").unwrap();
        assert_eq!(find_artifact(temp.path(), "mod"), None);

        fs::write(temp.path().join("mod.cpython-311-x86_64-linux-gnu.so"), "").unwrap();
        assert_eq!(
            find_artifact(temp.path(), "mod"),
            Some(temp.path().join("mod.cpython-311-x86_64-linux-gnu.so"))
        );
    }

    #[test]
    fn test_missing_toolchain_is_a_failed_outcome() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("mod.py");
        fs::write(&source, "x = 1\n").unwrap();

        let invoker = BuildInvoker::new(temp.path().join("no-such-python"), None);
        let outcome = invoker.build(&WorkItem::new(&source));
        assert!(!outcome.success);
        assert!(outcome.diagnostic.unwrap().contains("failed to run"));
        assert!(outcome.wrote_descriptor);
        assert!(temp.path().join("mod.setup.py").exists());
        assert!(!temp.path().join("setup.py").exists());
    }

    #[test]
    fn test_existing_descriptor_is_not_overwritten() {
        let temp = TempDir::new().unwrap();
        let source = temp.path().join("mod.py");
        fs::write(&source, "x = 1\n").unwrap();
        fs::write(temp.path().join("mod.setup.py"), "# project file\n").unwrap();

        let invoker = BuildInvoker::new(temp.path().join("no-such-python"), None);
        let outcome = invoker.build(&WorkItem::new(&source));
        assert!(!outcome.success);
        assert!(!outcome.wrote_descriptor);
        assert!(outcome.diagnostic.unwrap().contains("already exists"));
        assert_eq!(
            fs::read_to_string(temp.path().join("mod.setup.py")).unwrap(),
            "# project file\n"
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_timeout_kills_the_toolchain_and_its_children() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let source = temp.path().join("mod.py");
        fs::write(&source, "x = 1\n").unwrap();
        // The grandchild inherits stdout and stderr, so the pipes stay open
        // until it is gone too
        let toolchain = temp.path().join("slow-python");
        fs::write(&toolchain, "#!/bin/sh\necho compiling >&2\nsleep 8\n").unwrap();
        fs::set_permissions(&toolchain, fs::Permissions::from_mode(0o755)).unwrap();

        let invoker = BuildInvoker::new(&toolchain, Some(Duration::from_secs(1)));
        let started = Instant::now();
        let outcome = invoker.build(&WorkItem::new(&source));
        let elapsed = started.elapsed();

        assert!(!outcome.success);
        let diagnostic = outcome.diagnostic.unwrap();
        assert!(diagnostic.contains("timed out after 1s"), "{diagnostic}");
        assert!(diagnostic.contains("compiling"), "{diagnostic}");
        assert!(elapsed < Duration::from_secs(5), "took {elapsed:?}");
    }

    #[test]
    fn test_failure_diagnostic_keeps_tail() {
        let stderr: String = (0..30).map(|i| format!("line {i}\n")).collect();
        let diagnostic = failure_diagnostic("exit status: 1", &stderr);
        assert!(diagnostic.starts_with("exit status: 1\nline 10"));
        assert!(diagnostic.ends_with("line 29"));
        assert_eq!(failure_diagnostic("boom", "  \n"), "boom");
    }
}
