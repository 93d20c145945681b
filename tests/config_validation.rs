//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use serial_test::serial;
use sos_mesh::config::{MeshConfig, StoreConfig};
use sos_mesh::core::codec::WireProfile;
use std::time::Duration;

#[test]
fn test_default_config_validates() {
    let config = MeshConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_short_max_age() {
    let mut config = MeshConfig::default();
    config.store.max_age = Duration::from_secs(10);
    config.store.sweep_interval = Duration::from_secs(5);

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Max age too short")));
}

#[test]
fn test_retention_shorter_than_max_age() {
    let mut config = MeshConfig::default();
    config.store.retention = Duration::from_secs(3600);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Retention cannot be shorter than max age")));
}

#[test]
fn test_sweep_longer_than_max_age() {
    let mut config = MeshConfig::default();
    config.store.sweep_interval = config.store.max_age + Duration::from_secs(1);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Sweep interval cannot be longer than max age")));
}

#[test]
fn test_empty_store_path() {
    let mut config = MeshConfig::default();
    config.store = StoreConfig::at_path("");

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Store path cannot be empty")));
}

#[test]
fn test_tick_interval_bounds() {
    let mut config = MeshConfig::default();
    config.relay.tick_interval = Duration::from_millis(10);
    config.relay.jitter_max = Duration::ZERO;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Tick interval too short")));

    config.relay.tick_interval = Duration::from_secs(120);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Tick interval too long")));
}

#[test]
fn test_jitter_not_below_tick() {
    let mut config = MeshConfig::default();
    config.relay.jitter_max = config.relay.tick_interval;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Jitter must be shorter than the tick interval")));
}

#[test]
fn test_queue_ceiling_bounds() {
    let mut config = MeshConfig::default();
    config.relay.queue_ceiling = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Queue ceiling must be greater than 0")));

    config.relay.queue_ceiling = 50_000;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Queue ceiling too large")));
}

#[test]
fn test_safe_burst_bounds() {
    let mut config = MeshConfig::default();
    config.relay.safe_burst_count = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Safe burst count must be greater than 0")));

    config.relay.safe_burst_count = 3;
    config.relay.safe_burst_interval = Duration::from_secs(30);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Safe burst interval too long")));
}

#[test]
fn test_zero_buffers() {
    let mut config = MeshConfig::default();
    config.relay.command_buffer = 0;
    config.relay.event_buffer = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Command buffer must be greater than 0")));
    assert!(errors
        .iter()
        .any(|e| e.contains("Event buffer must be greater than 0")));
}

#[test]
fn test_verification_threshold_bounds() {
    let mut config = MeshConfig::default();
    config.verification.threshold = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Verification threshold must be greater than 0")));

    config.verification.threshold = 100;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Verification threshold too large")));
}

#[test]
fn test_empty_app_name() {
    let mut config = MeshConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = MeshConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = MeshConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = MeshConfig::default();
    config.relay.queue_ceiling = 0;

    let result = config.validate_strict();
    assert!(result.is_err());

    if let Err(e) = result {
        assert!(e.to_string().contains("Configuration validation failed"));
    }
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = MeshConfig::default();
    config.relay.queue_ceiling = 0;
    config.relay.command_buffer = 0;
    config.verification.threshold = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 4,
        "Expected at least 4 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_example_config_round_trips() {
    let text = MeshConfig::example_config();
    let parsed = MeshConfig::from_toml(&text).expect("example config should parse");
    assert!(parsed.validate().is_empty());
    assert_eq!(parsed.relay.tick_interval, Duration::from_millis(1200));
    assert_eq!(parsed.relay.queue_ceiling, 100);
}

#[test]
fn test_save_and_load_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mesh.toml");

    let config = MeshConfig::default_with_overrides(|c| {
        c.codec.profile = WireProfile::Extended;
        c.verification.threshold = 5;
    });
    config.save_to_file(&path).unwrap();

    let loaded = MeshConfig::from_file(&path).unwrap();
    assert_eq!(loaded.codec.profile, WireProfile::Extended);
    assert_eq!(loaded.verification.threshold, 5);
}

#[test]
fn test_from_file_missing() {
    let err = MeshConfig::from_file("/nonexistent/mesh.toml").unwrap_err();
    assert!(err.to_string().contains("Failed to open config file"));
}

#[test]
#[serial]
fn test_from_env_overrides() {
    std::env::set_var("SOS_MESH_WIRE_PROFILE", "extended");
    std::env::set_var("SOS_MESH_TICK_INTERVAL_MS", "800");
    std::env::set_var("SOS_MESH_QUEUE_CEILING", "42");
    std::env::set_var("SOS_MESH_STORE_PATH", "/tmp/sos-store.bin");

    let config = MeshConfig::from_env().unwrap();

    std::env::remove_var("SOS_MESH_WIRE_PROFILE");
    std::env::remove_var("SOS_MESH_TICK_INTERVAL_MS");
    std::env::remove_var("SOS_MESH_QUEUE_CEILING");
    std::env::remove_var("SOS_MESH_STORE_PATH");

    assert_eq!(config.codec.profile, WireProfile::Extended);
    assert_eq!(config.relay.tick_interval, Duration::from_millis(800));
    assert_eq!(config.relay.queue_ceiling, 42);
    assert_eq!(
        config.store.path.as_deref(),
        Some(std::path::Path::new("/tmp/sos-store.bin"))
    );
}

#[test]
#[serial]
fn test_from_env_rejects_unknown_profile() {
    std::env::set_var("SOS_MESH_WIRE_PROFILE", "morse");
    let result = MeshConfig::from_env();
    std::env::remove_var("SOS_MESH_WIRE_PROFILE");

    assert!(result.is_err());
}
