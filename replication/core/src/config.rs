//! TOML Configuration File Support
//!
//! Configuration for the replication streamer, loaded from
//! `$XDG_CONFIG_HOME/replication/streamer.toml`.
//!
//! # Configuration Priority
//!
//! Configuration values are loaded with the following priority (highest first):
//! 1. CLI arguments (applied by the caller through [`ConfigOverrides`])
//! 2. Environment variables (`REPLICATION_*`)
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [server]
//! listen_addr = "0.0.0.0:9092"
//! server_name = "primary.example.com"
//! ping_interval_ms = 5000
//! ping_timeout_multiplier = 3
//! max_pending_commands = 100000
//!
//! [streams]
//! max_behind = 10000
//! send_federation = false
//! ```

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::streamer::{StreamerConfig, MAX_PING_INTERVAL};
use crate::streaming::MAX_BEHIND;

/// Default listen address
pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:9092";

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Server section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerToml {
    /// Address to listen on
    pub listen_addr: Option<String>,

    /// Name announced to workers
    pub server_name: Option<String>,

    /// Ping interval in milliseconds
    pub ping_interval_ms: Option<u64>,

    /// Ping intervals without traffic before a worker is dropped
    pub ping_timeout_multiplier: Option<u32>,

    /// Outbound queue limit per connection
    pub max_pending_commands: Option<usize>,
}

/// Streams section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamsToml {
    /// Row ceiling for a single fetch
    pub max_behind: Option<usize>,

    /// This process sends federation itself
    pub send_federation: Option<bool>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationToml {
    /// Server configuration section
    pub server: ServerToml,

    /// Streams configuration section
    pub streams: StreamsToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved configuration for the replication daemon
#[derive(Clone, Debug)]
pub struct ReplicationConfig {
    /// Address to listen on
    pub listen_addr: SocketAddr,

    /// Name announced in `SERVER`
    pub server_name: String,

    /// Ping interval
    pub ping_interval: Duration,

    /// Ping intervals without traffic before a worker is dropped
    pub ping_timeout_multiplier: u32,

    /// Row ceiling for a single fetch
    pub max_behind: usize,

    /// Outbound queue limit per connection
    pub max_pending_commands: usize,

    /// This process sends federation itself, so no federation stream
    pub send_federation: bool,

    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,

    /// Source of configuration values
    source: ConfigSource,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        let streamer = StreamerConfig::default();
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 9092)),
            server_name: streamer.server_name,
            ping_interval: streamer.ping_interval,
            ping_timeout_multiplier: streamer.ping_timeout_multiplier,
            max_behind: MAX_BEHIND,
            max_pending_commands: streamer.max_pending_commands,
            send_federation: false,
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl ReplicationConfig {
    /// Create a new configuration with default values
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Settings for the streamer
    #[must_use]
    pub fn streamer_config(&self) -> StreamerConfig {
        StreamerConfig {
            server_name: self.server_name.clone(),
            ping_interval: self.ping_interval,
            ping_timeout_multiplier: self.ping_timeout_multiplier,
            max_behind: self.max_behind,
            max_pending_commands: self.max_pending_commands,
            send_federation: self.send_federation,
        }
    }

    /// Check that every value is usable
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` naming the first bad value.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_name.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "server_name must not be empty".to_string(),
            ));
        }
        if self.server_name.contains(['\n', '\r']) {
            return Err(ConfigError::ValidationError(
                "server_name must be a single line".to_string(),
            ));
        }
        if self.ping_interval.is_zero() {
            return Err(ConfigError::ValidationError(
                "ping_interval_ms must be greater than 0".to_string(),
            ));
        }
        if self.ping_interval > MAX_PING_INTERVAL {
            return Err(ConfigError::ValidationError(format!(
                "ping_interval_ms must be at most {}",
                MAX_PING_INTERVAL.as_millis()
            )));
        }
        if self.ping_timeout_multiplier == 0 {
            return Err(ConfigError::ValidationError(
                "ping_timeout_multiplier must be at least 1".to_string(),
            ));
        }
        if self.max_behind == 0 {
            return Err(ConfigError::ValidationError(
                "max_behind must be at least 1".to_string(),
            ));
        }
        if self.max_pending_commands == 0 {
            return Err(ConfigError::ValidationError(
                "max_pending_commands must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/replication/streamer.toml` or
/// `~/.config/replication/streamer.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("replication").join("streamer.toml"))
}

/// Load configuration from the default path and the process environment
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or if
/// the result fails validation.
pub fn load_config() -> Result<ReplicationConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path and the process environment
///
/// A missing file is not an error (defaults are used).
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed, or if the result
/// fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<ReplicationConfig, ConfigError> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

/// Load configuration reading environment values through `env`
///
/// # Errors
///
/// See [`load_config_from_path`].
pub fn load_config_with_env<F>(
    path: Option<PathBuf>,
    env: F,
) -> Result<ReplicationConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = ReplicationConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: ReplicationToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config)?;
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config, env);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(
    config: &mut ReplicationConfig,
    toml: &ReplicationToml,
) -> Result<(), ConfigError> {
    // Server settings
    if let Some(ref addr) = toml.server.listen_addr {
        config.listen_addr = addr.parse().map_err(|_| {
            ConfigError::ValidationError(format!("listen_addr {addr:?} is not a socket address"))
        })?;
    }
    if let Some(ref name) = toml.server.server_name {
        config.server_name.clone_from(name);
    }
    if let Some(ms) = toml.server.ping_interval_ms {
        config.ping_interval = Duration::from_millis(ms);
    }
    if let Some(multiplier) = toml.server.ping_timeout_multiplier {
        config.ping_timeout_multiplier = multiplier;
    }
    if let Some(max) = toml.server.max_pending_commands {
        config.max_pending_commands = max;
    }

    // Stream settings
    if let Some(max) = toml.streams.max_behind {
        config.max_behind = max;
    }
    if let Some(send) = toml.streams.send_federation {
        config.send_federation = send;
    }

    Ok(())
}

/// Apply environment variable overrides to the config
///
/// Unparseable values are logged and ignored.
fn apply_env_config<F>(config: &mut ReplicationConfig, env: F)
where
    F: Fn(&str) -> Option<String>,
{
    fn parsed<T: std::str::FromStr>(key: &str, value: &str) -> Option<T> {
        let parsed = value.parse().ok();
        if parsed.is_none() {
            tracing::warn!(key, value, "Ignoring unparseable environment variable");
        }
        parsed
    }

    if let Some(value) = env("REPLICATION_LISTEN_ADDR") {
        if let Some(addr) = parsed("REPLICATION_LISTEN_ADDR", &value) {
            config.listen_addr = addr;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(name) = env("REPLICATION_SERVER_NAME") {
        config.server_name = name;
        config.source = ConfigSource::Env;
    }
    if let Some(value) = env("REPLICATION_PING_INTERVAL_MS") {
        if let Some(ms) = parsed("REPLICATION_PING_INTERVAL_MS", &value) {
            config.ping_interval = Duration::from_millis(ms);
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = env("REPLICATION_PING_TIMEOUT_MULTIPLIER") {
        if let Some(multiplier) = parsed("REPLICATION_PING_TIMEOUT_MULTIPLIER", &value) {
            config.ping_timeout_multiplier = multiplier;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = env("REPLICATION_MAX_BEHIND") {
        if let Some(max) = parsed("REPLICATION_MAX_BEHIND", &value) {
            config.max_behind = max;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = env("REPLICATION_MAX_PENDING_COMMANDS") {
        if let Some(max) = parsed("REPLICATION_MAX_PENDING_COMMANDS", &value) {
            config.max_pending_commands = max;
            config.source = ConfigSource::Env;
        }
    }
    if let Some(value) = env("REPLICATION_SEND_FEDERATION") {
        config.send_federation = value != "0" && value.to_lowercase() != "false";
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Override Support
// =============================================================================

/// Builder for applying CLI overrides to configuration
///
/// Use this after [`load_config`] to apply command-line argument overrides.
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Listen address override
    pub listen_addr: Option<SocketAddr>,

    /// Server name override
    pub server_name: Option<String>,

    /// Ping interval override (milliseconds)
    pub ping_interval_ms: Option<u64>,

    /// Fetch ceiling override
    pub max_behind: Option<usize>,

    /// Federation sending override
    pub send_federation: Option<bool>,
}

impl ConfigOverrides {
    /// Create a new empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set listen address override
    #[must_use]
    pub fn with_listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listen_addr = Some(addr);
        self
    }

    /// Set server name override
    #[must_use]
    pub fn with_server_name(mut self, name: String) -> Self {
        self.server_name = Some(name);
        self
    }

    /// Set ping interval override
    #[must_use]
    pub fn with_ping_interval_ms(mut self, ms: u64) -> Self {
        self.ping_interval_ms = Some(ms);
        self
    }

    /// Set fetch ceiling override
    #[must_use]
    pub fn with_max_behind(mut self, max: usize) -> Self {
        self.max_behind = Some(max);
        self
    }

    /// Set federation sending override
    #[must_use]
    pub fn with_send_federation(mut self, send: bool) -> Self {
        self.send_federation = Some(send);
        self
    }

    /// Apply overrides to a configuration
    ///
    /// # Errors
    ///
    /// Returns `ValidationError` if the result is not usable.
    pub fn apply(&self, config: &mut ReplicationConfig) -> Result<(), ConfigError> {
        if self.listen_addr.is_some()
            || self.server_name.is_some()
            || self.ping_interval_ms.is_some()
            || self.max_behind.is_some()
            || self.send_federation.is_some()
        {
            config.source = ConfigSource::Cli;
        }

        if let Some(addr) = self.listen_addr {
            config.listen_addr = addr;
        }
        if let Some(ref name) = self.server_name {
            config.server_name.clone_from(name);
        }
        if let Some(ms) = self.ping_interval_ms {
            config.ping_interval = Duration::from_millis(ms);
        }
        if let Some(max) = self.max_behind {
            config.max_behind = max;
        }
        if let Some(send) = self.send_federation {
            config.send_federation = send;
        }

        config.validate()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    // =========================================================================
    // Default Configuration Tests
    // =========================================================================

    #[test]
    fn test_default_config() {
        let config = ReplicationConfig::default();

        assert_eq!(config.listen_addr.to_string(), DEFAULT_LISTEN_ADDR);
        assert_eq!(config.ping_interval, Duration::from_millis(5000));
        assert_eq!(config.ping_timeout_multiplier, 3);
        assert_eq!(config.max_behind, 10_000);
        assert_eq!(config.max_pending_commands, 100_000);
        assert!(!config.send_federation);
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_config_path() {
        if let Some(path) = default_config_path() {
            assert!(path.ends_with("replication/streamer.toml"));
        }
    }

    // =========================================================================
    // File Loading Tests
    // =========================================================================

    #[test]
    fn test_parse_valid_toml() {
        let file = write_config(
            r#"
[server]
listen_addr = "0.0.0.0:9999"
server_name = "primary.test"
ping_interval_ms = 1000
ping_timeout_multiplier = 5
max_pending_commands = 50

[streams]
max_behind = 200
send_federation = true
"#,
        );

        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.listen_addr, "0.0.0.0:9999".parse().unwrap());
        assert_eq!(config.server_name, "primary.test");
        assert_eq!(config.ping_interval, Duration::from_secs(1));
        assert_eq!(config.ping_timeout_multiplier, 5);
        assert_eq!(config.max_pending_commands, 50);
        assert_eq!(config.max_behind, 200);
        assert!(config.send_federation);
        assert_eq!(config.source(), ConfigSource::File);
        assert_eq!(config.config_file_path, Some(file.path().to_path_buf()));

        let streamer = config.streamer_config();
        assert_eq!(streamer.ping_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_parse_partial_toml() {
        let file = write_config("[streams]\nmax_behind = 42\n");
        let config = load_config_with_env(Some(file.path().to_path_buf()), no_env).unwrap();

        assert_eq!(config.max_behind, 42);
        assert_eq!(config.ping_interval, Duration::from_millis(5000));
    }

    #[test]
    fn test_missing_file_graceful() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.toml");

        let config = load_config_with_env(Some(path), no_env).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
        assert!(config.config_file_path.is_none());
    }

    #[test]
    fn test_malformed_toml_error() {
        let file = write_config("[server\nping_interval_ms = \"soon\"\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result.unwrap_err(), ConfigError::ParseError(_)));
    }

    #[test]
    fn test_bad_listen_addr_rejected() {
        let file = write_config("[server]\nlisten_addr = \"nowhere\"\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_zero_values_rejected() {
        let file = write_config("[streams]\nmax_behind = 0\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));

        let file = write_config("[server]\nping_interval_ms = 0\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));
    }

    #[test]
    fn test_huge_ping_interval_rejected() {
        let file = write_config("[server]\nping_interval_ms = 9223372036854775807\n");
        let result = load_config_with_env(Some(file.path().to_path_buf()), no_env);
        assert!(matches!(result.unwrap_err(), ConfigError::ValidationError(_)));

        let mut config = ReplicationConfig::default();
        let max_ms = u64::try_from(MAX_PING_INTERVAL.as_millis()).unwrap();
        ConfigOverrides::new()
            .with_ping_interval_ms(max_ms)
            .apply(&mut config)
            .unwrap();
        assert_eq!(config.ping_interval, MAX_PING_INTERVAL);

        let result = ConfigOverrides::new()
            .with_ping_interval_ms(max_ms + 1)
            .apply(&mut config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    // =========================================================================
    // Priority Ordering Tests
    // =========================================================================

    #[test]
    fn test_env_overrides_file() {
        let file = write_config("[server]\nserver_name = \"file.test\"\nping_interval_ms = 1000\n");
        let env: HashMap<&str, &str> = [
            ("REPLICATION_SERVER_NAME", "env.test"),
            ("REPLICATION_MAX_BEHIND", "77"),
            ("REPLICATION_SEND_FEDERATION", "true"),
            ("REPLICATION_PING_TIMEOUT_MULTIPLIER", "lots"),
        ]
        .into_iter()
        .collect();

        let config = load_config_with_env(Some(file.path().to_path_buf()), |key| {
            env.get(key).map(|v| (*v).to_string())
        })
        .unwrap();

        assert_eq!(config.server_name, "env.test");
        assert_eq!(config.ping_interval, Duration::from_secs(1));
        assert_eq!(config.max_behind, 77);
        assert!(config.send_federation);
        // Unparseable value keeps the default
        assert_eq!(config.ping_timeout_multiplier, 3);
        assert_eq!(config.source(), ConfigSource::Env);
    }

    #[test]
    fn test_cli_overrides_env() {
        let mut config = load_config_with_env(None, |key| {
            (key == "REPLICATION_LISTEN_ADDR").then(|| "127.0.0.1:7000".to_string())
        })
        .unwrap();
        assert_eq!(config.listen_addr.port(), 7000);

        ConfigOverrides::new()
            .with_listen_addr("127.0.0.1:8000".parse().unwrap())
            .with_server_name("cli.test".to_string())
            .apply(&mut config)
            .unwrap();

        assert_eq!(config.listen_addr.port(), 8000);
        assert_eq!(config.server_name, "cli.test");
        assert_eq!(config.source(), ConfigSource::Cli);
    }

    #[test]
    fn test_config_overrides_empty_no_change() {
        let mut config = ReplicationConfig::default();
        ConfigOverrides::new().apply(&mut config).unwrap();
        assert_eq!(config.source(), ConfigSource::Default);
    }

    #[test]
    fn test_config_overrides_validated() {
        let mut config = ReplicationConfig::default();
        let result = ConfigOverrides::new()
            .with_ping_interval_ms(0)
            .apply(&mut config);
        assert!(matches!(result, Err(ConfigError::ValidationError(_))));
    }

    #[test]
    fn test_config_source_display() {
        assert_eq!(ConfigSource::Cli.to_string(), "CLI");
        assert_eq!(ConfigSource::Env.to_string(), "environment");
        assert_eq!(ConfigSource::File.to_string(), "config file");
        assert_eq!(ConfigSource::Default.to_string(), "default");
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::ValidationError("max_behind must be at least 1".to_string());
        assert_eq!(
            err.to_string(),
            "Invalid configuration: max_behind must be at least 1"
        );
    }
}
