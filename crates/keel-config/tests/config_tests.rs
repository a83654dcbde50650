//! Configuration loading and precedence tests

use keel_config::{ConfigError, ConfigLoader, LogFormat, ProjectConfig};
use pretty_assertions::assert_eq;
use rstest::rstest;
use serial_test::serial;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn create_config_file(dir: &Path, content: &str) -> PathBuf {
    let config_path = dir.join("keel.toml");
    fs::write(&config_path, content).unwrap();
    config_path
}

fn loader_without_global(dir: &Path) -> ConfigLoader {
    ConfigLoader::with_global_config_path(dir.join("missing-global.toml"))
}

// ============================================================================
// Project Config Tests
// ============================================================================

#[test]
#[serial]
fn test_full_project_config() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(
        temp_dir.path(),
        r#"
[ffi]
search-paths = ["native/lib", "/opt/vendor/lib"]
manifests = ["bindings/store.toml"]
verify-overrides = false

[logging]
filter = "keel_runtime=debug"
format = "json"

[security]
foreign = ["store", "m::cos"]
"#,
    );

    let mut loader = loader_without_global(temp_dir.path());
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert_eq!(
        config.search_paths(),
        vec![
            temp_dir.path().join("native/lib"),
            PathBuf::from("/opt/vendor/lib"),
        ]
    );
    assert_eq!(
        config.manifests(),
        vec![temp_dir.path().join("bindings/store.toml")]
    );
    assert!(!config.verify_overrides());
    assert_eq!(config.log_filter(), "keel_runtime=debug");
    assert_eq!(config.log_format(), LogFormat::Json);
    assert!(config.restricts_foreign_calls());
    assert_eq!(config.foreign_grants().len(), 2);
}

#[test]
#[serial]
fn test_nested_directory_finds_project_root() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(temp_dir.path(), "[ffi]\nmanifests = [\"b.toml\"]\n");

    let nested = temp_dir.path().join("a").join("b").join("c");
    fs::create_dir_all(&nested).unwrap();

    let mut loader = loader_without_global(temp_dir.path());
    let config = loader.load_from_directory(&nested).unwrap();

    assert_eq!(config.project_root(), Some(temp_dir.path()));
    assert_eq!(config.manifests(), vec![temp_dir.path().join("b.toml")]);
}

#[test]
#[serial]
fn test_no_security_section_allows_everything() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(temp_dir.path(), "[ffi]\n");

    let mut loader = loader_without_global(temp_dir.path());
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert!(!config.restricts_foreign_calls());
    assert!(config.foreign_grants().is_empty());
}

#[test]
#[serial]
fn test_empty_security_section_denies_everything() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(temp_dir.path(), "[security]\n");

    let mut loader = loader_without_global(temp_dir.path());
    let config = loader.load_from_directory(temp_dir.path()).unwrap();

    assert!(config.restricts_foreign_calls());
    assert!(config.foreign_grants().is_empty());
}

// ============================================================================
// Validation Tests
// ============================================================================

#[rstest]
#[case("[ffi]\nsearch_paths = []\n")]
#[case("[package]\nname = \"x\"\n")]
#[case("[logging]\nlevel = \"info\"\n")]
fn test_unknown_fields_rejected(#[case] content: &str) {
    let result = toml::from_str::<ProjectConfig>(content);
    assert!(result.is_err());
}

#[rstest]
#[case("store::")]
#[case("::open")]
#[case("")]
#[serial]
fn test_malformed_grant_rejected(#[case] grant: &str) {
    let temp_dir = TempDir::new().unwrap();
    let path = create_config_file(
        temp_dir.path(),
        &format!("[security]\nforeign = [\"{}\"]\n", grant),
    );

    let mut loader = loader_without_global(temp_dir.path());
    let result = loader.load_from_file(&path);
    assert!(matches!(result, Err(ConfigError::InvalidValue { .. })));
}

#[test]
#[serial]
fn test_invalid_toml_reports_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = create_config_file(temp_dir.path(), "[ffi\n");

    let mut loader = loader_without_global(temp_dir.path());
    match loader.load_from_file(&path) {
        Err(ConfigError::TomlParseError { file, .. }) => assert_eq!(file, path),
        other => panic!("expected a parse error, got {:?}", other),
    }
}

// ============================================================================
// Precedence Tests
// ============================================================================

#[test]
#[serial]
fn test_project_overrides_global() {
    let temp_dir = TempDir::new().unwrap();
    let global_path = temp_dir.path().join("global.toml");
    fs::write(
        &global_path,
        "[logging]\nfilter = \"error\"\nformat = \"json\"\n",
    )
    .unwrap();

    let project_dir = temp_dir.path().join("project");
    fs::create_dir(&project_dir).unwrap();
    create_config_file(&project_dir, "[logging]\nfilter = \"debug\"\n");

    let mut loader = ConfigLoader::with_global_config_path(global_path);
    let config = loader.load_from_directory(&project_dir).unwrap();

    assert_eq!(config.log_filter(), "debug");
    // Not set by the project, so the global value shows through
    assert_eq!(config.log_format(), LogFormat::Json);
}

#[test]
#[serial]
fn test_environment_overrides_project() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(
        temp_dir.path(),
        "[logging]\nfilter = \"info\"\nformat = \"compact\"\n",
    );

    env::set_var("KEEL_LOG", "trace");
    env::set_var("KEEL_LOG_FORMAT", "JSON");

    let mut loader = loader_without_global(temp_dir.path());
    let result = loader.load_from_directory(temp_dir.path());

    env::remove_var("KEEL_LOG");
    env::remove_var("KEEL_LOG_FORMAT");

    let config = result.unwrap();
    assert_eq!(config.log_filter(), "trace");
    assert_eq!(config.log_format(), LogFormat::Json);
}

#[test]
#[serial]
fn test_ffi_path_searched_first() {
    let temp_dir = TempDir::new().unwrap();
    create_config_file(temp_dir.path(), "[ffi]\nsearch-paths = [\"/from/project\"]\n");

    let from_env = env::join_paths([PathBuf::from("/from/env/a"), PathBuf::from("/from/env/b")])
        .unwrap();
    env::set_var("KEEL_FFI_PATH", &from_env);

    let mut loader = loader_without_global(temp_dir.path());
    let result = loader.load_from_directory(temp_dir.path());

    env::remove_var("KEEL_FFI_PATH");

    assert_eq!(
        result.unwrap().search_paths(),
        vec![
            PathBuf::from("/from/env/a"),
            PathBuf::from("/from/env/b"),
            PathBuf::from("/from/project"),
        ]
    );
}
