//! # Configuration Management
//!
//! Centralized configuration for the protocol engine.
//!
//! One [`EngineConfig`] drives an engine instance: account and request policy, wire
//! options, session cache location and logging.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Environment variables (`IM_ENGINE_*`) via `from_env()`
//! - Direct instantiation with defaults, or `default_with_overrides()`
//!
//! ## Defaults
//! - Requests wait 5 s per attempt, 3 attempts
//! - Heartbeat every 60 s
//! - Current (AES-GCM) envelope version, no compression

use crate::error::{ProtocolError, Result};
use crate::transport::session_store::ServerAddress;
use crate::utils::compression::CompressionKind;
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Envelope version sealed with AES-256-GCM
pub const PROTOCOL_VERSION: u8 = 0x0B;

/// Envelope version sealed with TEA
pub const LEGACY_PROTOCOL_VERSION: u8 = 0x0A;

/// Magic bytes following the length prefix of every envelope
pub const MAGIC_BYTES: [u8; 4] = [0x00, 0x00, 0x00, 0x0B];

/// Max allowed frame size (e.g. 16 MB)
pub const MAX_PAYLOAD_SIZE: usize = 16 * 1024 * 1024;

/// Main engine configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct EngineConfig {
    /// Account and request policy
    #[serde(default)]
    pub client: ClientConfig,

    /// Wire options
    #[serde(default)]
    pub transport: TransportConfig,

    /// Session cache and key exchange
    #[serde(default)]
    pub session: SessionConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Load configuration from environment variables on top of the defaults
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Ok(account) = std::env::var("IM_ENGINE_ACCOUNT") {
            config.client.account = account;
        }

        if let Some(ms) = env_u64("IM_ENGINE_CONNECTION_TIMEOUT_MS")? {
            config.client.connection_timeout = Duration::from_millis(ms);
        }

        if let Some(ms) = env_u64("IM_ENGINE_RESPONSE_TIMEOUT_MS")? {
            config.client.response_timeout = Duration::from_millis(ms);
        }

        if let Some(attempts) = env_u64("IM_ENGINE_MAX_ATTEMPTS")? {
            config.client.max_attempts = u32::try_from(attempts).map_err(|_| {
                ProtocolError::ConfigError("IM_ENGINE_MAX_ATTEMPTS out of range".into())
            })?;
        }

        if let Some(ms) = env_u64("IM_ENGINE_HEARTBEAT_INTERVAL_MS")? {
            config.client.heartbeat_interval = Duration::from_millis(ms);
        }

        if let Ok(dir) = std::env::var("IM_ENGINE_CACHE_DIR") {
            config.session.cache_dir = Some(PathBuf::from(dir));
        }

        if let Ok(servers) = std::env::var("IM_ENGINE_SERVERS") {
            config.session.servers = servers
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::parse)
                .collect::<Result<Vec<ServerAddress>>>()?;
        }

        if let Ok(level) = std::env::var("IM_ENGINE_LOG_LEVEL") {
            config.logging.log_level = level
                .parse()
                .map_err(|_| ProtocolError::ConfigError(format!("Invalid log level: {level}")))?;
        }

        Ok(config)
    }

    /// Apply overrides to the default configuration
    pub fn default_with_overrides<F>(mutator: F) -> Self
    where
        F: FnOnce(&mut Self),
    {
        let mut config = Self::default();
        mutator(&mut config);
        config
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        toml::to_string_pretty(&Self::default())
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Save configuration to a file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to serialize config: {e}")))?;

        std::fs::write(path, content)
            .map_err(|e| ProtocolError::ConfigError(format!("Failed to write config file: {e}")))?;

        Ok(())
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        errors.extend(self.client.validate());
        errors.extend(self.transport.validate());
        errors.extend(self.session.validate());
        errors.extend(self.logging.validate());
        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProtocolError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

fn env_u64(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(raw) => raw
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ProtocolError::ConfigError(format!("{name} must be an integer, got '{raw}'"))),
        Err(_) => Ok(None),
    }
}

/// Account and request policy
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Account id written into every envelope
    pub account: String,

    /// Timeout for opening the transport
    #[serde(with = "duration_serde")]
    pub connection_timeout: Duration,

    /// Wait per request attempt
    #[serde(with = "duration_serde")]
    pub response_timeout: Duration,

    /// Transmissions per request, first one included
    pub max_attempts: u32,

    /// Interval for heartbeat requests while active
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Wait for a heartbeat answer
    #[serde(with = "duration_serde")]
    pub heartbeat_timeout: Duration,

    /// Whether to automatically reconnect on connection loss
    pub auto_reconnect: bool,

    /// Maximum number of reconnect attempts before giving up
    pub max_reconnect_attempts: u32,

    /// Delay between reconnect attempts
    #[serde(with = "duration_serde")]
    pub reconnect_delay: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            account: String::from("10000"),
            connection_timeout: timeout::DEFAULT_TIMEOUT,
            response_timeout: Duration::from_secs(5),
            max_attempts: 3,
            heartbeat_interval: timeout::KEEPALIVE_INTERVAL,
            heartbeat_timeout: Duration::from_secs(5),
            auto_reconnect: true,
            max_reconnect_attempts: 3,
            reconnect_delay: Duration::from_secs(1),
        }
    }
}

impl ClientConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.account.trim().is_empty() {
            errors.push("Account cannot be empty".to_string());
        }

        if self.connection_timeout.as_millis() < 10 {
            errors.push("Connection timeout too short (minimum: 10ms)".to_string());
        } else if self.connection_timeout.as_secs() > 300 {
            errors.push("Connection timeout too long (maximum: 300s)".to_string());
        }

        if self.response_timeout.as_millis() < 10 {
            errors.push("Response timeout too short (minimum: 10ms)".to_string());
        }

        if self.max_attempts == 0 {
            errors.push("Max attempts must be at least 1".to_string());
        } else if self.max_attempts > 10 {
            errors.push(format!("Max attempts too high: {} (maximum: 10)", self.max_attempts));
        }

        if self.heartbeat_interval.as_millis() < 100 {
            errors.push("Heartbeat interval too short (minimum: 100ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.heartbeat_timeout.is_zero() {
            errors.push("Heartbeat timeout cannot be 0".to_string());
        }

        if self.auto_reconnect && self.max_reconnect_attempts == 0 {
            errors.push(
                "Max reconnect attempts must be greater than 0 when auto_reconnect is enabled"
                    .to_string(),
            );
        }

        if self.reconnect_delay.as_secs() > 60 {
            errors.push("Reconnect delay too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Wire options
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Envelope version for outgoing packets; selects the cipher
    pub protocol_version: u8,

    /// Body compression for outgoing packets (`None` disables it)
    pub compression: Option<CompressionKind>,

    /// Minimum body size (bytes) before compression is attempted
    pub compression_threshold_bytes: usize,

    /// Maximum frame and decompressed body size in bytes
    pub max_payload_size: usize,

    /// Frames queued for the writer before `submit` waits
    pub outbound_queue_capacity: usize,

    /// A partial frame idle this long is discarded
    #[serde(with = "duration_serde")]
    pub partial_frame_timeout: Duration,

    /// Read buffer size for the transport
    pub read_buffer_size: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            compression: None,
            compression_threshold_bytes: 512,
            max_payload_size: MAX_PAYLOAD_SIZE,
            outbound_queue_capacity: 64,
            partial_frame_timeout: Duration::from_secs(1),
            read_buffer_size: 8 * 1024,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.protocol_version != PROTOCOL_VERSION
            && self.protocol_version != LEGACY_PROTOCOL_VERSION
        {
            errors.push(format!(
                "Unsupported protocol version: {:#04x} (expected {:#04x} or {:#04x})",
                self.protocol_version, PROTOCOL_VERSION, LEGACY_PROTOCOL_VERSION
            ));
        }

        if self.max_payload_size < 1024 {
            errors.push("Max payload size too small (minimum: 1 KB)".to_string());
        } else if self.max_payload_size > 100 * 1024 * 1024 {
            errors.push(format!(
                "Max payload size too large: {} bytes (maximum recommended: 100 MB)",
                self.max_payload_size
            ));
        }

        if self.compression.is_some() && self.compression_threshold_bytes > self.max_payload_size {
            errors.push("Compression threshold cannot be larger than max payload size".to_string());
        }

        if self.outbound_queue_capacity == 0 {
            errors.push("Outbound queue capacity must be greater than 0".to_string());
        } else if self.outbound_queue_capacity > 1_000_000 {
            errors.push(format!(
                "Outbound queue capacity too large: {} (max recommended: 1,000,000)",
                self.outbound_queue_capacity
            ));
        }

        if self.partial_frame_timeout.as_millis() < 10 {
            errors.push("Partial frame timeout too short (minimum: 10ms)".to_string());
        }

        if self.read_buffer_size < 64 {
            errors.push("Read buffer size too small (minimum: 64 bytes)".to_string());
        }

        errors
    }
}

/// Session cache and key exchange
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Root of the per-account cache; `None` keeps the session in memory only
    pub cache_dir: Option<PathBuf>,

    /// Hex-encoded server key overriding the compiled-in one
    pub server_public_key: Option<String>,

    /// Lifetime of a session when the server does not announce one
    #[serde(with = "duration_serde")]
    pub default_session_ttl: Duration,

    /// How long a completed request key is remembered to drop late duplicates
    #[serde(with = "duration_serde")]
    pub completed_request_ttl: Duration,

    /// Replaces the compiled-in default server list when non-empty
    pub servers: Vec<ServerAddress>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            cache_dir: None,
            server_public_key: None,
            servers: Vec::new(),
            default_session_ttl: Duration::from_secs(24 * 3600),
            completed_request_ttl: Duration::from_secs(60),
        }
    }
}

impl SessionConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if let Some(ref key) = self.server_public_key {
            if let Err(e) = parse_public_key(key) {
                errors.push(e.to_string());
            }
        }

        if self.default_session_ttl.is_zero() {
            errors.push("Default session TTL cannot be 0".to_string());
        }

        if self.completed_request_ttl.is_zero() {
            errors.push("Completed request TTL cannot be 0".to_string());
        }

        errors
    }

    /// The server key to bootstrap exchanges with
    pub fn server_key(&self) -> Result<[u8; 32]> {
        match self.server_public_key {
            Some(ref hex) => parse_public_key(hex),
            None => Ok(crate::utils::crypto::INITIAL_PUBLIC_KEY),
        }
    }
}

fn parse_public_key(hex: &str) -> Result<[u8; 32]> {
    let hex = hex.trim();
    let invalid = || ProtocolError::ConfigError(format!("Invalid server public key: '{hex}'"));
    if hex.len() != 64 || !hex.is_ascii() {
        return Err(invalid());
    }
    let mut key = [0u8; 32];
    for (i, byte) in key.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16).map_err(|_| invalid())?;
    }
    Ok(key)
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Application name for logs
    pub app_name: String,

    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to log to console
    pub log_to_console: bool,

    /// Whether to log to file
    pub log_to_file: bool,

    /// Path to log file (if log_to_file is true)
    pub log_file_path: Option<String>,

    /// Whether to use JSON formatting for logs
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            app_name: String::from("im-protocol-engine"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.app_name.is_empty() {
            errors.push("Application name cannot be empty".to_string());
        } else if self.app_name.len() > 64 {
            errors.push(format!(
                "Application name too long: {} characters (maximum: 64)",
                self.app_name.len()
            ));
        }

        if self.log_to_file {
            if let Some(ref path) = self.log_file_path {
                if let Some(parent) = Path::new(path).parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        errors.push(format!(
                            "Log file directory does not exist: {}",
                            parent.display()
                        ));
                    }
                }
            } else {
                errors.push("log_file_path must be specified when log_to_file is true".to_string());
            }
        }

        if !self.log_to_console && !self.log_to_file {
            errors
                .push("At least one logging output (console or file) must be enabled".to_string());
        }

        errors
    }
}

/// Helper module for Duration serialization/deserialization
mod duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let millis = duration.as_millis() as u64;
        millis.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

/// Helper module for tracing::Level serialization/deserialization
mod log_level_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::str::FromStr;
    use tracing::Level;

    pub fn serialize<S>(level: &Level, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let level_str = match *level {
            Level::TRACE => "trace",
            Level::DEBUG => "debug",
            Level::INFO => "info",
            Level::WARN => "warn",
            Level::ERROR => "error",
        };
        level_str.serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Level, D::Error>
    where
        D: Deserializer<'de>,
    {
        let level_str = String::deserialize(deserializer)?;
        Level::from_str(&level_str)
            .map_err(|_| serde::de::Error::custom(format!("Invalid log level: {level_str}")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;

    #[test]
    fn test_public_key_override() {
        let config = SessionConfig {
            server_public_key: Some("ab".repeat(32)),
            ..SessionConfig::default()
        };
        assert_eq!(config.server_key().unwrap(), [0xAB; 32]);
        assert!(config.validate().is_empty());

        let bad = SessionConfig {
            server_public_key: Some("zz".repeat(32)),
            ..SessionConfig::default()
        };
        assert_eq!(bad.validate().len(), 1);
        assert_eq!(
            SessionConfig::default().server_key().unwrap(),
            crate::utils::crypto::INITIAL_PUBLIC_KEY
        );
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [client]
            account = "42"
            response_timeout = 250

            [transport]
            compression = "zstd"
            "#,
        )
        .unwrap();
        assert_eq!(config.client.account, "42");
        assert_eq!(config.client.response_timeout, Duration::from_millis(250));
        assert_eq!(config.client.max_attempts, 3);
        assert_eq!(config.transport.compression, Some(CompressionKind::Zstd));
        assert_eq!(config.transport.protocol_version, PROTOCOL_VERSION);
    }
}
