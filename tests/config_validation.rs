//! Integration tests for configuration validation

#![allow(clippy::expect_used, clippy::unwrap_used)]

use im_protocol_engine::config::{EngineConfig, LEGACY_PROTOCOL_VERSION};
use im_protocol_engine::utils::compression::CompressionKind;
use im_protocol_engine::ServerAddress;
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = EngineConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_default_with_overrides() {
    let config = EngineConfig::default_with_overrides(|config| {
        config.client.max_attempts = 5;
        config.session.servers = vec![ServerAddress::new("override.example", 443)];
    });
    assert_eq!(config.client.max_attempts, 5);
    assert_eq!(
        config.session.servers,
        vec![ServerAddress::new("override.example", 443)]
    );
    assert_eq!(
        config.client.response_timeout,
        EngineConfig::default().client.response_timeout
    );
    assert!(config.validate().is_empty());
}

#[test]
fn test_empty_account() {
    let mut config = EngineConfig::default();
    config.client.account = "  ".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Account cannot be empty")));
}

#[test]
fn test_short_connection_timeout() {
    let mut config = EngineConfig::default();
    config.client.connection_timeout = Duration::from_millis(5);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too short")));
}

#[test]
fn test_long_connection_timeout() {
    let mut config = EngineConfig::default();
    config.client.connection_timeout = Duration::from_secs(400);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too long")));
}

#[test]
fn test_attempt_bounds() {
    let mut config = EngineConfig::default();
    config.client.max_attempts = 0;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max attempts must be at least 1")));

    config.client.max_attempts = 11;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Max attempts too high")));
}

#[test]
fn test_short_heartbeat_interval() {
    let mut config = EngineConfig::default();
    config.client.heartbeat_interval = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Heartbeat interval too short")));
}

#[test]
fn test_zero_reconnect_attempts_with_auto_reconnect() {
    let mut config = EngineConfig::default();
    config.client.auto_reconnect = true;
    config.client.max_reconnect_attempts = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max reconnect attempts must be greater than 0")));

    config.client.auto_reconnect = false;
    assert!(config.validate().is_empty());
}

#[test]
fn test_unsupported_protocol_version() {
    let mut config = EngineConfig::default();
    config.transport.protocol_version = 0x0C;
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Unsupported protocol version")));

    config.transport.protocol_version = LEGACY_PROTOCOL_VERSION;
    assert!(config.validate().is_empty());
}

#[test]
fn test_tiny_max_payload_size() {
    let mut config = EngineConfig::default();
    config.transport.max_payload_size = 512;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max payload size too small")));
}

#[test]
fn test_excessive_max_payload_size() {
    let mut config = EngineConfig::default();
    config.transport.max_payload_size = 200 * 1024 * 1024;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max payload size too large")));
}

#[test]
fn test_compression_threshold_larger_than_max_payload() {
    let mut config = EngineConfig::default();
    config.transport.compression = Some(CompressionKind::Zstd);
    config.transport.max_payload_size = 2048;
    config.transport.compression_threshold_bytes = 4096;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Compression threshold cannot be larger")));
}

#[test]
fn test_zero_outbound_queue() {
    let mut config = EngineConfig::default();
    config.transport.outbound_queue_capacity = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Outbound queue capacity must be greater than 0")));
}

#[test]
fn test_invalid_server_public_key() {
    let mut config = EngineConfig::default();
    config.session.server_public_key = Some("not-hex".to_string());

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Invalid server public key")));
}

#[test]
fn test_zero_session_ttls() {
    let mut config = EngineConfig::default();
    config.session.default_session_ttl = Duration::ZERO;
    config.session.completed_request_ttl = Duration::ZERO;

    let errors = config.validate();
    assert_eq!(errors.len(), 2);
}

#[test]
fn test_empty_app_name() {
    let mut config = EngineConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_log_to_file_without_path() {
    let mut config = EngineConfig::default();
    config.logging.log_to_file = true;
    config.logging.log_file_path = None;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("log_file_path must be specified")));
}

#[test]
fn test_no_logging_outputs() {
    let mut config = EngineConfig::default();
    config.logging.log_to_console = false;
    config.logging.log_to_file = false;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("At least one logging output")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    let config = EngineConfig::default();
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = EngineConfig::default();
    config.client.account = String::new();

    let result = config.validate_strict();
    let message = result.unwrap_err().to_string();
    assert!(message.contains("Configuration validation failed"));
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = EngineConfig::default();
    config.client.account = String::new();
    config.client.max_attempts = 0;
    config.transport.outbound_queue_capacity = 0;
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
fn test_toml_round_trip() {
    let mut config = EngineConfig::default();
    config.client.account = "20002".to_string();
    config.client.response_timeout = Duration::from_millis(1500);
    config.transport.compression = Some(CompressionKind::Lz4);
    config.session.servers = vec![ServerAddress::new("10.0.0.1", 8080)];
    config.logging.log_level = Level::DEBUG;

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("engine.toml");
    config.save_to_file(&path).unwrap();

    let loaded = EngineConfig::from_file(&path).unwrap();
    assert_eq!(loaded.client.account, "20002");
    assert_eq!(loaded.client.response_timeout, Duration::from_millis(1500));
    assert_eq!(loaded.transport.compression, Some(CompressionKind::Lz4));
    assert_eq!(loaded.session.servers, config.session.servers);
    assert_eq!(loaded.logging.log_level, Level::DEBUG);
}

#[test]
fn test_partial_toml_uses_defaults() {
    let config = EngineConfig::from_toml(
        r#"
        [client]
        account = "30003"
        max_attempts = 5
        "#,
    )
    .unwrap();
    assert_eq!(config.client.account, "30003");
    assert_eq!(config.client.max_attempts, 5);
    assert_eq!(config.client.response_timeout, Duration::from_secs(5));
    assert!(config.validate().is_empty());
}

#[test]
fn test_example_config_parses() {
    let example = EngineConfig::example_config();
    let parsed = EngineConfig::from_toml(&example).unwrap();
    assert!(parsed.validate().is_empty());
}

#[test]
fn test_environment_overrides() {
    std::env::set_var("IM_ENGINE_ACCOUNT", "40004");
    std::env::set_var("IM_ENGINE_MAX_ATTEMPTS", "4");
    std::env::set_var("IM_ENGINE_SERVERS", "a.example:80, b.example:443");
    let config = EngineConfig::from_env().unwrap();
    std::env::remove_var("IM_ENGINE_ACCOUNT");
    std::env::remove_var("IM_ENGINE_MAX_ATTEMPTS");
    std::env::remove_var("IM_ENGINE_SERVERS");

    assert_eq!(config.client.account, "40004");
    assert_eq!(config.client.max_attempts, 4);
    assert_eq!(
        config.session.servers,
        vec![
            ServerAddress::new("a.example", 80),
            ServerAddress::new("b.example", 443)
        ]
    );
}
