//! Building a runtime from project configuration

use keel_config::ConfigLoader;
use keel_runtime::ffi::{
    DeclError, FfiErrorKind, FfiRuntime, LinkError, ManifestError, RuntimeError,
};
use keel_runtime::Value;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn write(dir: &Path, name: &str, content: &str) {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(path, content).unwrap();
}

fn runtime_for(dir: &Path) -> Result<FfiRuntime, RuntimeError> {
    let mut loader = ConfigLoader::with_global_config_path(dir.join("missing-global.toml"));
    let config = loader.load_from_directory(dir).unwrap();
    FfiRuntime::from_config(&config)
}

#[test]
fn empty_project_builds_empty_runtime() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "keel.toml", "[ffi]\n");

    let rt = runtime_for(dir.path()).unwrap();
    assert!(rt.table().is_empty());

    let err = rt.call_symbol("m", "cos", &[Value::Float(0.0)]).unwrap_err();
    assert_eq!(err.kind, FfiErrorKind::Unbound);
}

#[test]
fn manifest_libraries_without_functions_are_not_loaded() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "keel.toml",
        "[ffi]\nmanifests = [\"bindings/store.toml\"]\n",
    );
    write(
        dir.path(),
        "bindings/store.toml",
        "[[library]]\nname = \"store\"\npath = \"lib/libstore.so\"\n",
    );

    let rt = runtime_for(dir.path()).unwrap();
    assert!(rt.table().library(&"store".into()).is_some());
}

#[test]
fn missing_manifest_is_reported() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "keel.toml", "[ffi]\nmanifests = [\"absent.toml\"]\n");

    let err = runtime_for(dir.path()).unwrap_err();
    assert!(matches!(err, RuntimeError::Manifest(ManifestError::Io { .. })));
    assert!(err.to_string().contains("absent.toml"));
}

#[test]
fn unloadable_library_fails_at_link_time() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "keel.toml", "[ffi]\nmanifests = [\"bindings.toml\"]\n");
    write(
        dir.path(),
        "bindings.toml",
        r#"
[[library]]
name = "keel_test_missing"
path = "nowhere/libkeel_test_missing.so"

[[library.function]]
symbol = "f"
returns = { type = "i32" }
"#,
    );

    let err = runtime_for(dir.path()).unwrap_err();
    assert!(matches!(err, RuntimeError::Link(LinkError::LoadFailed { .. })));
}

#[test]
fn malformed_grant_rejected_by_config() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "keel.toml", "[security]\nforeign = [\"m::\"]\n");

    let mut loader = ConfigLoader::with_global_config_path(dir.path().join("missing-global.toml"));
    assert!(loader.load_from_directory(dir.path()).is_err());
}

#[test]
fn invalid_declarations_are_skipped() {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "keel.toml", "[ffi]\nmanifests = [\"bindings.toml\"]\n");
    write(
        dir.path(),
        "bindings.toml",
        r#"
[[library]]
name = "store"

[[library.function]]
symbol = "peek"
returns = { type = "handle", ownership = "borrowed" }
"#,
    );

    let rt = runtime_for(dir.path()).unwrap();
    assert!(rt.table().is_empty());
    assert_eq!(rt.rejected().len(), 1);
    assert!(matches!(
        &rt.rejected()[0],
        ManifestError::Declaration {
            source: DeclError::InvalidOwnershipCombination { .. },
            ..
        }
    ));
    assert!(rt.rejected()[0].to_string().contains("bindings.toml"));
}

/// Absolute path of the C library, where the platform keeps it somewhere known
#[cfg(target_os = "linux")]
fn libc_path() -> Option<&'static str> {
    [
        "/lib/x86_64-linux-gnu/libc.so.6",
        "/usr/lib/x86_64-linux-gnu/libc.so.6",
        "/lib/aarch64-linux-gnu/libc.so.6",
        "/usr/lib/aarch64-linux-gnu/libc.so.6",
        "/usr/lib64/libc.so.6",
        "/lib64/libc.so.6",
        "/usr/lib/libc.so.6",
    ]
    .into_iter()
    .find(|p| Path::new(p).exists())
}

#[cfg(target_os = "linux")]
fn libc_runtime(dir: &Path, libc: &str) -> FfiRuntime {
    write(dir, "keel.toml", "[ffi]\nmanifests = [\"libc.toml\"]\n");
    write(
        dir,
        "libc.toml",
        &format!(
            r#"
[[library]]
name = "c"
path = "{libc}"

[[library.function]]
symbol = "getpid"
returns = {{ type = "i32" }}

[[library.function]]
symbol = "peek"
returns = {{ type = "handle", ownership = "borrowed" }}

[[library.function]]
symbol = "open_stream"
link-name = "fopen"
params = [{{ name = "path", type = "text" }}, {{ name = "mode", type = "text" }}]
returns = {{ type = "handle", ownership = "owned" }}
protocol = "null-pointer"
finalizer = "fclose"
"#
        ),
    );
    runtime_for(dir).unwrap()
}

#[cfg(target_os = "linux")]
#[test]
fn valid_declarations_survive_a_rejected_one() {
    let Some(libc) = libc_path() else { return };
    let dir = TempDir::new().unwrap();
    let rt = libc_runtime(dir.path(), libc);

    assert_eq!(rt.rejected().len(), 1);
    assert!(rt.lookup("c", "peek").is_none());
    assert_eq!(
        rt.call_symbol("c", "getpid", &[]),
        Ok(Value::Int(std::process::id() as i64))
    );
}

#[cfg(target_os = "linux")]
#[test]
fn resource_outlives_its_runtime() {
    let Some(libc) = libc_path() else { return };
    let dir = TempDir::new().unwrap();
    let rt = libc_runtime(dir.path(), libc);

    let stream = rt
        .call_symbol("c", "open_stream", &[Value::text("/dev/null"), Value::text("r")])
        .unwrap();
    let resource = stream.as_resource().unwrap().clone();
    assert_eq!(resource.finalizer_symbol().as_str(), "fclose");

    drop(rt);
    drop(stream);
    assert!(!resource.is_released());
    resource.release().unwrap();
    assert!(resource.is_released());
}
