//! Daemon configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use haraltd_core::opp::{DEFAULT_AUTH_TIMEOUT, DEFAULT_PACKET_FLOOR};
use haraltd_types::BluetoothAddress;

/// Daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Socket server settings.
    pub server: ServerConfig,
    /// Operation tracking settings.
    pub operations: OperationsConfig,
    /// OBEX profile settings.
    pub obex: ObexConfig,
    /// Bluetooth backend selection.
    pub stack: StackConfig,
    /// Logging settings.
    pub log: LogConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load_default() -> Result<Self, ConfigError> {
        let path = default_config_path();
        if path.exists() {
            Self::load(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load configuration from a file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Read {
            path: path.as_ref().to_path_buf(),
            source: e,
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Save configuration to a file.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self).map_err(ConfigError::Serialize)?;

        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        std::fs::write(path.as_ref(), content).map_err(|e| ConfigError::Write {
            path: path.as_ref().to_path_buf(),
            source: e,
        })
    }

    /// Validate the configuration and return any errors.
    ///
    /// This checks:
    /// - The socket path is not empty
    /// - The auth timeout is at least one second
    /// - The inbound destination directory is not empty
    /// - The packet floor is between 255 and 65535 - 256
    /// - The log level is a valid filter directive
    ///
    /// # Example
    ///
    /// ```
    /// use haraltd_service::Config;
    ///
    /// let config = Config::default();
    /// config.validate().expect("Default config should be valid");
    /// ```
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();
        errors.extend(self.server.validate());
        errors.extend(self.operations.validate());
        errors.extend(self.obex.validate());
        errors.extend(self.log.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Load and validate configuration from a file.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        config.validate()?;
        Ok(config)
    }
}

/// Socket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Path of the UNIX socket clients connect to.
    pub socket_path: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
        }
    }
}

impl ServerConfig {
    /// Validate server configuration.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.socket_path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "server.socket_path".to_string(),
                message: "socket path cannot be empty".to_string(),
            });
        }
        errors
    }
}

/// Operation tracking configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OperationsConfig {
    /// How long shutdown waits for long-running operations, in milliseconds.
    pub shutdown_grace_ms: u64,
    /// How long an inbound transfer prompt waits for an answer, in
    /// milliseconds.
    pub auth_timeout_ms: u64,
}

/// Shortest accepted prompt timeout in milliseconds.
pub const MIN_AUTH_TIMEOUT_MS: u64 = 1000;

impl Default for OperationsConfig {
    fn default() -> Self {
        Self {
            shutdown_grace_ms: 100,
            auth_timeout_ms: DEFAULT_AUTH_TIMEOUT.as_millis() as u64,
        }
    }
}

impl OperationsConfig {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    /// Validate operation settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if self.auth_timeout_ms < MIN_AUTH_TIMEOUT_MS {
            errors.push(ValidationError {
                field: "operations.auth_timeout_ms".to_string(),
                message: format!(
                    "auth timeout {} is too short (minimum {} ms)",
                    self.auth_timeout_ms, MIN_AUTH_TIMEOUT_MS
                ),
            });
        }
        errors
    }
}

/// OBEX profile configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObexConfig {
    /// Start the Object Push server with the daemon.
    pub server_enabled: bool,
    /// Local adapter address. Only the mock backend uses it.
    pub adapter_address: Option<BluetoothAddress>,
    /// Where inbound files are stored.
    pub destination_dir: PathBuf,
    /// Smallest body chunk an outbound push sends.
    pub packet_size: u16,
}

/// Largest packet floor that still leaves room for headers.
pub const MAX_PACKET_FLOOR: u16 = u16::MAX - 256;

impl Default for ObexConfig {
    fn default() -> Self {
        Self {
            server_enabled: false,
            adapter_address: None,
            destination_dir: default_destination_dir(),
            packet_size: DEFAULT_PACKET_FLOOR,
        }
    }
}

impl ObexConfig {
    /// Validate OBEX settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        if self.destination_dir.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "obex.destination_dir".to_string(),
                message: "destination directory cannot be empty".to_string(),
            });
        }

        // 255 is the smallest packet OBEX allows.
        if self.packet_size < 255 {
            errors.push(ValidationError {
                field: "obex.packet_size".to_string(),
                message: format!("packet size {} is too small (minimum 255)", self.packet_size),
            });
        } else if self.packet_size > MAX_PACKET_FLOOR {
            errors.push(ValidationError {
                field: "obex.packet_size".to_string(),
                message: format!(
                    "packet size {} is too large (maximum {})",
                    self.packet_size, MAX_PACKET_FLOOR
                ),
            });
        }

        errors
    }
}

/// Which Bluetooth backend the daemon drives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// No backend. Every Bluetooth call reports a missing adapter.
    #[default]
    None,
    /// The in-memory mock stack.
    Mock,
}

/// Backend configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StackConfig {
    pub backend: Backend,
}

/// Logging configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Filter directive added to `RUST_LOG`, e.g. `haraltd=debug`.
    pub level: Option<String>,
}

impl LogConfig {
    /// Validate logging settings.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();
        if let Some(level) = &self.level
            && level.parse::<tracing_subscriber::filter::Directive>().is_err()
        {
            errors.push(ValidationError {
                field: "log.level".to_string(),
                message: format!("invalid log level '{}'", level),
            });
        }
        errors
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("Failed to serialize config: {0}")]
    Serialize(toml::ser::Error),
    #[error("Failed to write config file {path}: {source}")]
    Write {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Configuration validation failed:\n{}", format_validation_errors(.0))]
    Validation(Vec<ValidationError>),
}

/// A single validation error with context.
#[derive(Debug, Clone)]
pub struct ValidationError {
    /// The field path (e.g., `obex.packet_size`).
    pub field: String,
    /// Description of the validation failure.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

fn format_validation_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(|e| format!("  - {}", e))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Default configuration file path.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("haraltd")
        .join("haraltd.toml")
}

/// Default socket path.
pub fn default_socket_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("haraltd")
        .join("hd.sock")
}

/// Default directory for received files.
pub fn default_destination_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("haraltd")
        .join("transfers")
}
