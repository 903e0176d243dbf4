#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io::Write;

use snapgraph_core::config::{CacheConfig, ConfigError};
use snapgraph_core::snapshot::SnapshotStore;
use tempfile::NamedTempFile;

fn write_config(text: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(text.as_bytes()).unwrap();
    file.flush().unwrap();
    file
}

#[test]
fn test_from_file_reads_values() {
    // GIVEN a config file setting expiry and batch size
    let file = write_config("snapshot_expiration_secs = 30\nmax_id_qualifier_size = 50\n");

    // WHEN loading it
    let config = CacheConfig::from_file(file.path()).unwrap();

    // THEN file values are used and the rest default
    assert_eq!(config.snapshot_expiration_secs, 30);
    assert_eq!(config.max_id_qualifier_size, 50);
    assert!(config.refresh_on_fetch);
}

#[test]
fn test_from_file_missing_path_is_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = CacheConfig::from_file(&dir.path().join("absent.toml")).unwrap_err();
    assert!(matches!(err, ConfigError::Io { .. }));
}

#[test]
fn test_from_file_rejects_unknown_field() {
    let file = write_config("snapshot_cache_sise = 10\n");
    let err = CacheConfig::from_file(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Toml { .. }));
}

#[test]
fn test_from_file_rejects_zero_batch_size() {
    let file = write_config("max_id_qualifier_size = 0\n");
    let err = CacheConfig::from_file(file.path()).unwrap_err();
    match err {
        ConfigError::Invalid { key, .. } => assert_eq!(key, "max_id_qualifier_size"),
        other => panic!("expected Invalid, got {:?}", other),
    }
}

#[test]
fn test_store_from_config_uses_capacity_and_expiry() {
    let config = CacheConfig {
        snapshot_cache_size: 3,
        snapshot_expiration_secs: 0,
        ..CacheConfig::default()
    };

    let store = SnapshotStore::from_config("configured", &config);

    assert_eq!(store.capacity(), 3);
    assert_eq!(store.name(), "configured");
}
