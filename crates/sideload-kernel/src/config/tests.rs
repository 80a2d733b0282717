//! Tests for host configuration loading across formats.

use super::*;
use std::fs;
use tempfile::TempDir;

fn write(dir: &TempDir, filename: &str, content: &str) -> PathBuf {
    let path = dir.path().join(filename);
    fs::write(&path, content).unwrap();
    path
}

#[test]
fn test_detect_format() {
    assert_eq!(detect_format("sideload.yaml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("sideload.yml").unwrap(), FileFormat::Yaml);
    assert_eq!(detect_format("sideload.toml").unwrap(), FileFormat::Toml);
    assert_eq!(detect_format("sideload.json").unwrap(), FileFormat::Json);
    assert!(matches!(
        detect_format("sideload.txt"),
        Err(ConfigError::UnsupportedFormat(_))
    ));
    assert!(detect_format("sideload").is_err());
}

#[test]
fn test_defaults() {
    let config = SideloadConfig::default();
    assert_eq!(config.plugin_dir, PathBuf::from("sideload-plugins"));
    assert_eq!(config.archive_extension, std::env::consts::DLL_EXTENSION);
    assert!(config.watch.enabled);
    assert_eq!(config.watch.initial_delay(), Duration::from_secs(10));
    assert_eq!(config.watch.poll_interval(), Duration::from_secs(5));
}

#[test]
fn test_load_toml_with_partial_sections() {
    let dir = TempDir::new().unwrap();
    let path = write(
        &dir,
        "sideload.toml",
        r#"
plugin_dir = "/opt/host/plugins"
archive_extension = "jar"

[watch]
poll_interval_ms = 250
"#,
    );

    let config = SideloadConfig::load(&path).unwrap();
    assert_eq!(config.plugin_dir, PathBuf::from("/opt/host/plugins"));
    assert_eq!(config.archive_extension, "jar");
    assert_eq!(config.watch.poll_interval_ms, 250);
    // Untouched fields keep their defaults
    assert_eq!(config.watch.initial_delay_ms, 10_000);
    assert!(config.watch.enabled);
}

#[test]
fn test_load_yaml_and_json() {
    let dir = TempDir::new().unwrap();

    let yaml = write(
        &dir,
        "sideload.yaml",
        "plugin_dir: plugins\nwatch:\n  enabled: false\n",
    );
    let config = SideloadConfig::load(&yaml).unwrap();
    assert_eq!(config.plugin_dir, PathBuf::from("plugins"));
    assert!(!config.watch.enabled);

    let json = write(
        &dir,
        "sideload.json",
        r#"{ "archive_extension": "so", "watch": { "initial_delay_ms": 0 } }"#,
    );
    let config = SideloadConfig::load(&json).unwrap();
    assert_eq!(config.archive_extension, "so");
    assert_eq!(config.watch.initial_delay_ms, 0);
}

#[test]
fn test_env_substitution_leaves_unknown_variables() {
    let out = substitute_env_vars("dir: ${SIDELOAD_SURELY_UNSET_VAR}/x").unwrap();
    assert_eq!(out, "dir: ${SIDELOAD_SURELY_UNSET_VAR}/x");

    let out = substitute_env_vars("dir: $SIDELOAD_SURELY_UNSET_VAR").unwrap();
    assert_eq!(out, "dir: $SIDELOAD_SURELY_UNSET_VAR");
}

#[test]
fn test_env_substitution_uses_process_environment() {
    // PATH is set in every test environment
    let path = std::env::var("PATH").unwrap();
    let out = substitute_env_vars("value: ${PATH}").unwrap();
    assert_eq!(out, format!("value: {}", path));
}

#[test]
fn test_is_archive() {
    let config = SideloadConfig::default().with_archive_extension(".jar");
    assert!(config.is_archive(Path::new("/plugins/tracker.jar")));
    assert!(!config.is_archive(Path::new("/plugins/tracker.jar.tmp")));
    assert!(!config.is_archive(Path::new("/plugins/readme.md")));
    assert!(!config.is_archive(Path::new("/plugins/jar")));
}

#[test]
fn test_invalid_content_is_reported() {
    let dir = TempDir::new().unwrap();
    let path = write(&dir, "broken.toml", "plugin_dir = [");
    assert!(matches!(
        SideloadConfig::load(&path),
        Err(ConfigError::Parse(_))
    ));
}
