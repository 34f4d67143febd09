//! Integration tests for the protection pipeline
//!
//! The Python toolchain is replaced by a shell script that behaves like
//! `python <stem>.setup.py build_ext --inplace` with Cython: it reads the
//! module named in the descriptor, then leaves `build/`, `<stem>.c` and a
//! compiled extension behind. It refuses to build when a package marker is
//! visible, when annotations survived, or when the module is called
//! `broken.py`. Building `eraser.py` deletes the hidden package marker.
#![cfg(unix)]

use aurora_encrypt::{EncryptConfig, ErrorKind, NoProgress, ProjectSpec, ProtectError, Protector};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use walkdir::WalkDir;

const FAKE_TOOLCHAIN: &str = r#"#!/bin/sh
case "$1" in *.setup.py) ;; *) echo "bad descriptor: $1" >&2; exit 9 ;; esac
[ "$2" = build_ext ] && [ "$3" = --inplace ] || { echo "bad arguments: $*" >&2; exit 9; }
unit=$(sed -n "s/.*cythonize('\([^']*\)'.*/\1/p" "$1")
stem=${unit%.py}
[ "$1" = "$stem.setup.py" ] || { echo "descriptor $1 does not match $unit" >&2; exit 9; }
if [ -e __init__.py ]; then echo "__init__.py visible while compiling $unit" >&2; exit 3; fi
if grep -q ': int' "$unit"; then echo "annotations left in $unit" >&2; exit 4; fi
echo "cythonizing $unit"
mkdir -p build/temp
echo "/* generated */" > "$stem.c"
if [ "$stem" = eraser ]; then rm -f __init__.py.not_encrypt; fi
if [ "$stem" = broken ]; then echo "Error compiling Cython file $unit" >&2; exit 1; fi
echo "ELF" > "$stem.cpython-fake.so"
"#;

struct Fixture {
    temp: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let temp = TempDir::new().unwrap();
        let toolchain = temp.path().join("fake-python");
        fs::write(&toolchain, FAKE_TOOLCHAIN).unwrap();
        fs::set_permissions(&toolchain, fs::Permissions::from_mode(0o755)).unwrap();
        fs::create_dir_all(temp.path().join("project")).unwrap();
        Self { temp }
    }

    fn source(&self) -> PathBuf {
        self.temp.path().join("project")
    }

    fn destination(&self) -> PathBuf {
        self.temp.path().join("out")
    }

    fn write(&self, rel: &str, contents: &str) {
        let path = self.source().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    fn spec(&self) -> ProjectSpec {
        ProjectSpec::new(self.source())
            .destination(self.destination())
            .toolchain(self.temp.path().join("fake-python"))
    }

    fn protector(&self, spec: ProjectSpec, config: EncryptConfig) -> Protector {
        Protector::new(spec, config).with_progress(NoProgress)
    }
}

/// Relative paths of every file under `root`, sorted
fn files_under(root: &Path) -> Vec<String> {
    let mut files: Vec<String> = WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| {
            e.path()
                .strip_prefix(root)
                .unwrap()
                .to_string_lossy()
                .replace('\\', "/")
        })
        .collect();
    files.sort();
    files
}

/// A small package: one top-level module, one package with a marker
fn two_module_project(fixture: &Fixture) {
    fixture.write("a.py", "a: int = 1\n");
    fixture.write("pkg/__init__.py", "from .mod import f\n");
    fixture.write("pkg/mod.py", "def f(x: int) -> int:\n    return x\n");
    fixture.write("pkg/__pycache__/mod.cpython-311.pyc", "bytecode");
    fixture.write("main.py", "from pkg import f\nvalue: int = f(1)\n");
    fixture.write("README.md", "# project\n");
}

#[test]
fn test_protects_whole_project() {
    let fixture = Fixture::new();
    two_module_project(&fixture);
    let before = files_under(&fixture.source());

    let summary = fixture
        .protector(fixture.spec(), EncryptConfig::default())
        .run()
        .unwrap();

    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.failed, 0);
    assert_eq!(summary.markers_restored, 1);
    assert_eq!(summary.caches_purged, 1);
    assert_eq!(summary.excluded, 1);

    assert_eq!(
        files_under(&fixture.destination()),
        vec![
            "README.md",
            "a.cpython-fake.so",
            "main.py",
            "pkg/__init__.py",
            "pkg/mod.cpython-fake.so",
        ]
    );
    // Entry points and package markers ship as written
    assert_eq!(
        fs::read_to_string(fixture.destination().join("main.py")).unwrap(),
        "from pkg import f\nvalue: int = f(1)\n"
    );
    assert_eq!(
        fs::read_to_string(fixture.destination().join("pkg/__init__.py")).unwrap(),
        "from .mod import f\n"
    );

    // The source tree is never touched
    assert_eq!(files_under(&fixture.source()), before);
    assert_eq!(fs::read_to_string(fixture.source().join("a.py")).unwrap(), "a: int = 1\n");
}

#[test]
fn test_summary_reports_sizes() {
    let fixture = Fixture::new();
    two_module_project(&fixture);

    let summary = fixture
        .protector(fixture.spec(), EncryptConfig::default())
        .run()
        .unwrap();

    let a = summary
        .compiled
        .iter()
        .find(|c| c.output.ends_with("a.cpython-fake.so"))
        .unwrap();
    assert_eq!(a.original_size, "a = 1\n".len() as u64);
    assert_eq!(a.compiled_size, "ELF\n".len() as u64);

    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["succeeded"], 2);
    assert_eq!(json["failures"].as_array().unwrap().len(), 0);
}

#[test]
fn test_destination_equal_to_source_is_refused() {
    let fixture = Fixture::new();
    two_module_project(&fixture);
    let before = files_under(&fixture.source());

    let spec = fixture.spec().destination(fixture.source());
    let err = fixture
        .protector(spec, EncryptConfig::default())
        .run()
        .unwrap_err();

    assert!(matches!(err, ProtectError::DestinationConflict { .. }));
    assert_eq!(err.kind(), ErrorKind::Configuration);
    assert_eq!(files_under(&fixture.source()), before);
    assert_eq!(
        fs::read_to_string(fixture.source().join("pkg/mod.py")).unwrap(),
        "def f(x: int) -> int:\n    return x\n"
    );
}

#[test]
fn test_destination_inside_source_is_refused() {
    let fixture = Fixture::new();
    two_module_project(&fixture);

    let spec = fixture.spec().destination(fixture.source().join("dist"));
    let err = fixture
        .protector(spec, EncryptConfig::default())
        .run()
        .unwrap_err();

    assert!(matches!(err, ProtectError::DestinationInsideSource { .. }));
    assert!(!fixture.source().join("dist").exists());
}

#[test]
fn test_failed_build_does_not_stop_the_run() {
    let fixture = Fixture::new();
    fixture.write("pkg/__init__.py", "");
    fixture.write("pkg/broken.py", "x: int = 1\n");
    fixture.write("pkg/good.py", "y = 2\n");
    fixture.write("pkg/__pycache__/broken.cpython-311.pyc", "bytecode");

    let summary = fixture
        .protector(fixture.spec(), EncryptConfig::default())
        .run()
        .unwrap();

    assert!(!summary.is_success());
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.succeeded, 1);
    assert!(summary.failures[0].path.ends_with("pkg/broken.py"));
    assert!(summary.failures[0]
        .diagnostic
        .contains("Error compiling Cython file broken.py"));

    // The cache is gone and the marker is back even though a build failed
    assert_eq!(
        files_under(&fixture.destination()),
        vec!["pkg/__init__.py", "pkg/good.cpython-fake.so"]
    );
    assert!(summary.to_string().contains("FAILED"));
}

#[test]
fn test_keep_failed_sources() {
    let fixture = Fixture::new();
    fixture.write("broken.py", "x = 1\n");

    let config = EncryptConfig::new().keep_failed_sources(true);
    let summary = fixture.protector(fixture.spec(), config).run().unwrap();

    assert_eq!(summary.failed, 1);
    assert_eq!(files_under(&fixture.destination()), vec!["broken.py"]);
}

#[test]
fn test_parse_error_aborts_and_restores_markers() {
    let fixture = Fixture::new();
    fixture.write("pkg/__init__.py", "");
    fixture.write("pkg/a.py", "a: int = 1\n");
    fixture.write("pkg/z.py", "def broken(:\n");
    fixture.write("sub/__init__.py", "");

    let err = fixture
        .protector(fixture.spec(), EncryptConfig::default())
        .run()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Parse);
    assert!(err.to_string().contains("z.py"));
    let left = files_under(&fixture.destination());
    assert!(left.contains(&"pkg/__init__.py".to_string()), "{left:?}");
    assert!(left.iter().all(|f| !f.ends_with(".not_encrypt")), "{left:?}");
}

#[test]
fn test_explicit_file_list() {
    let fixture = Fixture::new();
    two_module_project(&fixture);
    fixture.write("plugins/__init__.py", "");
    fixture.write("plugins/extra.py", "n: int = 3\n");

    let spec = fixture.spec().files(["pkg/mod.py", "plugins"]);
    let summary = fixture
        .protector(spec, EncryptConfig::default())
        .run()
        .unwrap();

    assert_eq!(summary.succeeded, 2);
    assert_eq!(
        files_under(&fixture.destination()),
        vec![
            "pkg/mod.cpython-fake.so",
            "plugins/__init__.py",
            "plugins/extra.cpython-fake.so",
        ]
    );
}

#[test]
fn test_explicit_file_must_exist() {
    let fixture = Fixture::new();
    two_module_project(&fixture);

    let spec = fixture.spec().files(["pkg/missing.py"]);
    let err = fixture
        .protector(spec, EncryptConfig::default())
        .run()
        .unwrap_err();

    assert!(matches!(err, ProtectError::SourceNotFound(_)));
    assert!(!fixture.destination().exists());
}

#[test]
fn test_stale_destination_is_replaced() {
    let fixture = Fixture::new();
    fixture.write("a.py", "a = 1\n");
    fs::create_dir_all(fixture.destination().join("old")).unwrap();
    fs::write(fixture.destination().join("old/stale.so"), "").unwrap();

    fixture
        .protector(fixture.spec(), EncryptConfig::default())
        .run()
        .unwrap();

    assert_eq!(files_under(&fixture.destination()), vec!["a.cpython-fake.so"]);
}

#[test]
fn test_exclude_patterns() {
    let fixture = Fixture::new();
    two_module_project(&fixture);
    fixture.write("tests/test_a.py", "def test(x: int): pass\n");

    let config = EncryptConfig::new().exclude("tests/**").entry_point("a.py");
    let summary = fixture.protector(fixture.spec(), config).run().unwrap();

    assert_eq!(summary.attempted, 1);
    assert_eq!(summary.excluded, 3);
    assert_eq!(
        fs::read_to_string(fixture.destination().join("tests/test_a.py")).unwrap(),
        "def test(x: int): pass\n"
    );
    assert!(fixture.destination().join("a.py").exists());
}

#[test]
fn test_missing_toolchain_fails_every_build() {
    let fixture = Fixture::new();
    fixture.write("a.py", "a = 1\n");
    fixture.write("b.py", "b = 2\n");

    let spec = fixture.spec().toolchain(fixture.temp.path().join("no-python"));
    let summary = fixture
        .protector(spec, EncryptConfig::default())
        .run()
        .unwrap();

    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.failed, 2);
    assert!(summary.failures.iter().all(|f| f.diagnostic.contains("failed to run")));
}

#[test]
fn test_project_setup_script_ships_unchanged() {
    let fixture = Fixture::new();
    let setup = "from setuptools import setup\nsetup(name='app')\n";
    fixture.write("setup.py", setup);
    fixture.write("a.py", "a: int = 1\n");
    fixture.write("pkg/__init__.py", "");
    fixture.write("pkg/setup.py", setup);
    fixture.write("pkg/mod.py", "m = 1\n");

    let summary = fixture
        .protector(fixture.spec(), EncryptConfig::default())
        .run()
        .unwrap();

    assert!(summary.is_success(), "{summary}");
    assert_eq!(summary.succeeded, 2);
    assert_eq!(
        files_under(&fixture.destination()),
        vec![
            "a.cpython-fake.so",
            "pkg/__init__.py",
            "pkg/mod.cpython-fake.so",
            "pkg/setup.py",
            "setup.py",
        ]
    );
    assert_eq!(fs::read_to_string(fixture.destination().join("setup.py")).unwrap(), setup);
    assert_eq!(fs::read_to_string(fixture.destination().join("pkg/setup.py")).unwrap(), setup);
}

#[test]
fn test_overlapping_explicit_entries() {
    for files in [["pkg", "pkg/__init__.py"], ["pkg/mod.py", "pkg"]] {
        let fixture = Fixture::new();
        two_module_project(&fixture);

        let spec = fixture.spec().files(files);
        let summary = fixture
            .protector(spec, EncryptConfig::default())
            .run()
            .unwrap();

        assert!(summary.is_success(), "{files:?}: {summary}");
        assert_eq!(summary.attempted, 1, "{files:?}");
        assert_eq!(summary.markers_restored, 1, "{files:?}");
        assert_eq!(
            files_under(&fixture.destination()),
            vec!["pkg/__init__.py", "pkg/mod.cpython-fake.so"],
            "{files:?}"
        );
    }
}

#[test]
fn test_lost_marker_still_reports_builds() {
    let fixture = Fixture::new();
    fixture.write("pkg/__init__.py", "");
    fixture.write("pkg/eraser.py", "e = 1\n");
    fixture.write("pkg/ok.py", "o = 1\n");

    let err = fixture
        .protector(fixture.spec(), EncryptConfig::default())
        .run()
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Filesystem);
    assert!(err.to_string().contains("(2 of 2 module(s) compiled)"), "{err}");
    let ProtectError::MarkersNotRestored { summary, source } = err else {
        panic!("expected a marker restore failure");
    };
    assert!(matches!(*source, ProtectError::MarkerRestore { ref paths } if paths.len() == 1));
    assert_eq!(summary.attempted, 2);
    assert_eq!(summary.succeeded, 2);
    assert_eq!(summary.compiled.len(), 2);
    assert_eq!(
        files_under(&fixture.destination()),
        vec!["pkg/eraser.cpython-fake.so", "pkg/ok.cpython-fake.so"]
    );
}
