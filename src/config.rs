//! # Configuration Management
//!
//! Centralized configuration for servers, clients and the per-connection engine.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Copy-on-apply
//! A [`ConnectionParameters`] value is cloned and clamped when a connection is
//! created. Mutating the caller's value afterwards never changes the running
//! connection; only the transmission tempo is adjustable on a live connection.

use crate::core::serialization::SerializationFormat;
use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::Level;

/// Current supported protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Magic bytes identifying protocol parcels ("PNET")
pub const MAGIC_BYTES: [u8; 4] = [0x50, 0x4E, 0x45, 0x54];

/// Smallest transmission parcel size
pub const MIN_PARCEL_SIZE: usize = 1024;

/// Largest transmission parcel size, also the largest payload the codec accepts
pub const MAX_PARCEL_SIZE: usize = 256 * 1024;

/// Default transmission parcel size
pub const DEFAULT_PARCEL_SIZE: usize = 32 * 1024;

/// Largest file length that can be transferred (2^31 - 1)
pub const MAX_FILE_LENGTH: u64 = i32::MAX as u64;

/// Parcel queue capacity bounds
pub const MIN_PARCEL_QUEUE: usize = 10;
pub const MAX_PARCEL_QUEUE: usize = 10_000;

/// Upper bound of the object queue capacity, which also sizes the delivery semaphore
pub const MAX_OBJECT_QUEUE: usize = 1_000_000;

/// Tempo value meaning "no speed limit"
pub const TEMPO_UNLIMITED: i64 = -1;

/// Main configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NetworkConfig {
    /// Server-specific configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Client-specific configuration
    #[serde(default)]
    pub client: ClientConfig,

    /// Per-connection engine parameters, shared by both sides
    #[serde(default)]
    pub connection: ConnectionParameters,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NetworkConfig {
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

        if let Ok(addr) = std::env::var("PARCEL_NET_SERVER_ADDRESS") {
            config.server.address = addr;
        }

        if let Ok(addr) = std::env::var("PARCEL_NET_CLIENT_ADDRESS") {
            config.client.address = addr;
        }

        if let Ok(timeout) = std::env::var("PARCEL_NET_CONFIRM_TIMEOUT_MS") {
            if let Ok(val) = timeout.parse::<u64>() {
                config.connection.confirm_timeout = Duration::from_millis(val);
            }
        }

        if let Ok(period) = std::env::var("PARCEL_NET_ALIVE_PERIOD_MS") {
            if let Ok(val) = period.parse::<u64>() {
                config.connection.alive_period = Duration::from_millis(val);
            }
        }

        if let Ok(speed) = std::env::var("PARCEL_NET_TRANSMISSION_SPEED") {
            if let Ok(val) = speed.parse::<i64>() {
                config.connection.transmission_speed = val;
            }
        }

        if let Ok(dir) = std::env::var("PARCEL_NET_FILE_ROOT") {
            config.connection.file_root_dir = Some(PathBuf::from(dir));
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
        errors.extend(self.server.validate());
        errors.extend(self.client.validate());
        errors.extend(self.connection.validate());
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

/// How the server surfaces freshly handshaken connections to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AcceptMode {
    /// Pushed to server listeners as `ServerEvent::ConnectionAvailable`
    #[default]
    Listener,
    /// Queued for `Server::accept(timeout)`
    Accept,
}

/// Server-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Server listen address (e.g., "127.0.0.1:9000")
    pub address: String,

    /// Push or pull delivery of pending connections
    pub accept_mode: AcceptMode,

    /// Capacity of the pending-connection queue in `Accept` mode
    pub accept_queue_capacity: usize,

    /// Whether the server's tempo overrides tempo requests from clients
    pub tempo_primacy: bool,

    /// Maximum number of concurrent connections (surplus clients are rejected)
    pub max_connections: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            accept_mode: AcceptMode::Listener,
            accept_queue_capacity: 50,
            tempo_primacy: false,
            max_connections: 1000,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Server address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid server address format: '{}' (expected format: '0.0.0.0:8080')",
                self.address
            ));
        }

        if self.accept_queue_capacity == 0 {
            errors.push("Accept queue capacity must be greater than 0".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 100_000 {
            errors.push(format!(
                "Max connections very high: {} (ensure system resources can support this)",
                self.max_connections
            ));
        }

        errors
    }
}

/// Client-specific configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Target server address
    pub address: String,

    /// Optional local address to bind before connecting
    pub local_address: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            address: String::from("127.0.0.1:9000"),
            local_address: None,
        }
    }
}

impl ClientConfig {
    /// Validate client configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.address.is_empty() {
            errors.push("Client address cannot be empty".to_string());
        } else if self.address.parse::<std::net::SocketAddr>().is_err() {
            errors.push(format!(
                "Invalid client address format: '{}' (expected format: '127.0.0.1:9000')",
                self.address
            ));
        }

        if let Some(local) = &self.local_address {
            if local.parse::<std::net::SocketAddr>().is_err() {
                errors.push(format!("Invalid local bind address: '{local}'"));
            }
        }

        errors
    }
}

/// Which data channel the sender serves first after signals
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrder {
    /// Signals, then files, then objects
    #[default]
    FilesFirst,
    /// Signals, then objects, then files
    ObjectsFirst,
}

/// Per-connection engine parameters
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ConnectionParameters {
    /// Number of object fragments that may wait in the send queue
    pub parcel_queue_capacity: usize,

    /// Number of objects and files that may wait in the send queue, and the
    /// number of received objects buffered ahead of listener delivery
    pub object_queue_capacity: usize,

    /// Largest serialized object accepted for sending or receiving
    pub max_serialisation_size: usize,

    /// Interval between ALIVE signals, zero disables keep-alive
    #[serde(with = "duration_serde")]
    pub alive_period: Duration,

    /// Maximum wait for handshake confirmation and accept decisions
    #[serde(with = "duration_serde")]
    pub confirm_timeout: Duration,

    /// Root under which incoming files with a remote path are stored
    pub file_root_dir: Option<PathBuf>,

    /// Directory receiving temp files of incoming transfers
    pub temp_dir: PathBuf,

    /// Payload size of object and file fragments
    pub transmission_parcel_size: usize,

    /// Bytes per second, -1 for unlimited and 0 for paused
    pub transmission_speed: i64,

    /// Format used to serialize outgoing objects
    pub serialization_format: SerializationFormat,

    /// Traffic in bytes per minute below which the connection is idle, zero disables
    pub idle_threshold: u64,

    /// Interval of idle evaluation
    #[serde(with = "duration_serde")]
    pub idle_check_period: Duration,

    /// Lane order of the send queue
    pub channel_order: ChannelOrder,
}

impl Default for ConnectionParameters {
    fn default() -> Self {
        Self {
            parcel_queue_capacity: 600,
            object_queue_capacity: 200,
            max_serialisation_size: 100 * 1024 * 1024,
            alive_period: timeout::DEFAULT_ALIVE_PERIOD,
            confirm_timeout: timeout::DEFAULT_CONFIRM_TIMEOUT,
            file_root_dir: None,
            temp_dir: std::env::temp_dir(),
            transmission_parcel_size: DEFAULT_PARCEL_SIZE,
            transmission_speed: TEMPO_UNLIMITED,
            serialization_format: SerializationFormat::default(),
            idle_threshold: 0,
            idle_check_period: timeout::DEFAULT_IDLE_CHECK_PERIOD,
            channel_order: ChannelOrder::default(),
        }
    }
}

impl ConnectionParameters {
    /// Maximum wait for an ALIVE echo, twice the confirm timeout
    pub fn alive_timeout(&self) -> Duration {
        self.confirm_timeout * 2
    }

    /// Copy of these parameters with every value forced into its legal range
    pub fn clamped(&self) -> Self {
        let mut p = self.clone();
        p.parcel_queue_capacity = p
            .parcel_queue_capacity
            .clamp(MIN_PARCEL_QUEUE, MAX_PARCEL_QUEUE);
        p.object_queue_capacity = p.object_queue_capacity.clamp(1, MAX_OBJECT_QUEUE);
        p.max_serialisation_size = p.max_serialisation_size.max(MIN_PARCEL_SIZE);
        if !p.alive_period.is_zero() {
            p.alive_period = p
                .alive_period
                .clamp(timeout::MIN_ALIVE_PERIOD, timeout::MAX_ALIVE_PERIOD);
        }
        p.confirm_timeout = p.confirm_timeout.max(timeout::MIN_CONFIRM_TIMEOUT);
        p.transmission_parcel_size = p
            .transmission_parcel_size
            .clamp(MIN_PARCEL_SIZE, MAX_PARCEL_SIZE);
        if p.transmission_speed < 0 {
            p.transmission_speed = TEMPO_UNLIMITED;
        }
        p.idle_check_period = p.idle_check_period.max(timeout::MIN_IDLE_CHECK_PERIOD);
        p
    }

    /// Validate connection parameters
    ///
    /// Out-of-range values are reported here and clamped when applied.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !(MIN_PARCEL_QUEUE..=MAX_PARCEL_QUEUE).contains(&self.parcel_queue_capacity) {
            errors.push(format!(
                "Parcel queue capacity {} outside {MIN_PARCEL_QUEUE}..={MAX_PARCEL_QUEUE}",
                self.parcel_queue_capacity
            ));
        }

        if !(1..=MAX_OBJECT_QUEUE).contains(&self.object_queue_capacity) {
            errors.push(format!(
                "Object queue capacity {} outside 1..={MAX_OBJECT_QUEUE}",
                self.object_queue_capacity
            ));
        }

        if !self.alive_period.is_zero()
            && (self.alive_period < timeout::MIN_ALIVE_PERIOD
                || self.alive_period > timeout::MAX_ALIVE_PERIOD)
        {
            errors.push(format!(
                "Alive period {}ms outside 1000..=300000ms (0 disables)",
                self.alive_period.as_millis()
            ));
        }

        if self.confirm_timeout < timeout::MIN_CONFIRM_TIMEOUT {
            errors.push("Confirm timeout too short (minimum: 1000ms)".to_string());
        }

        if !(MIN_PARCEL_SIZE..=MAX_PARCEL_SIZE).contains(&self.transmission_parcel_size) {
            errors.push(format!(
                "Transmission parcel size {} outside {MIN_PARCEL_SIZE}..={MAX_PARCEL_SIZE}",
                self.transmission_parcel_size
            ));
        }

        if self.transmission_speed < TEMPO_UNLIMITED {
            errors.push(format!(
                "Transmission speed {} is invalid (-1 unlimited, 0 paused, >0 bytes/s)",
                self.transmission_speed
            ));
        }

        if self.idle_check_period < timeout::MIN_IDLE_CHECK_PERIOD {
            errors.push("Idle check period too short (minimum: 1000ms)".to_string());
        }

        if !self.temp_dir.is_dir() {
            errors.push(format!(
                "Temp directory does not exist: {}",
                self.temp_dir.display()
            ));
        }

        if let Some(root) = &self.file_root_dir {
            if !root.is_dir() {
                errors.push(format!("File root is not a directory: {}", root.display()));
            }
        }

        errors
    }
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
            app_name: String::from("parcel-net"),
            log_level: Level::INFO,
            log_to_console: true,
            log_to_file: false,
            log_file_path: None,
            json_format: false,
        }
    }
}

impl LoggingConfig {
    /// Validate logging configuration
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
mod tests {
    use super::*;

    #[test]
    fn test_clamping_applies_ranges() {
        let raw = ConnectionParameters {
            parcel_queue_capacity: 3,
            object_queue_capacity: 0,
            alive_period: Duration::from_millis(10),
            confirm_timeout: Duration::from_millis(500),
            transmission_parcel_size: 100,
            transmission_speed: -42,
            idle_check_period: Duration::from_millis(5),
            ..ConnectionParameters::default()
        };

        let p = raw.clamped();
        assert_eq!(p.parcel_queue_capacity, MIN_PARCEL_QUEUE);
        assert_eq!(p.object_queue_capacity, 1);
        assert_eq!(p.alive_period, timeout::MIN_ALIVE_PERIOD);
        assert_eq!(p.confirm_timeout, timeout::MIN_CONFIRM_TIMEOUT);
        assert_eq!(p.alive_timeout(), Duration::from_secs(2));
        assert_eq!(p.transmission_parcel_size, MIN_PARCEL_SIZE);
        assert_eq!(p.transmission_speed, TEMPO_UNLIMITED);
        assert_eq!(p.idle_check_period, timeout::MIN_IDLE_CHECK_PERIOD);
    }

    #[test]
    fn test_zero_alive_period_stays_disabled() {
        let raw = ConnectionParameters {
            alive_period: Duration::ZERO,
            ..ConnectionParameters::default()
        };
        assert!(raw.clamped().alive_period.is_zero());
    }

    #[test]
    fn test_clamped_is_a_copy() {
        let mut raw = ConnectionParameters::default();
        let applied = raw.clamped();
        raw.transmission_speed = 5000;
        raw.parcel_queue_capacity = 20;
        assert_eq!(applied.transmission_speed, TEMPO_UNLIMITED);
        assert_eq!(applied.parcel_queue_capacity, 600);
    }

    #[test]
    fn test_huge_object_queue_is_reported_and_clamped() {
        let raw = ConnectionParameters {
            object_queue_capacity: usize::MAX,
            ..ConnectionParameters::default()
        };
        let errors = raw.validate();
        assert!(errors.iter().any(|e| e.contains("Object queue capacity")), "{errors:?}");

        let p = raw.clamped();
        assert_eq!(p.object_queue_capacity, MAX_OBJECT_QUEUE);
        assert!(p.object_queue_capacity <= tokio::sync::Semaphore::MAX_PERMITS);
    }

    #[test]
    fn test_upper_bounds() {
        let raw = ConnectionParameters {
            parcel_queue_capacity: 50_000,
            alive_period: Duration::from_secs(3600),
            transmission_parcel_size: 10 * 1024 * 1024,
            ..ConnectionParameters::default()
        };
        let p = raw.clamped();
        assert_eq!(p.parcel_queue_capacity, MAX_PARCEL_QUEUE);
        assert_eq!(p.object_queue_capacity, 200);
        assert_eq!(p.alive_period, timeout::MAX_ALIVE_PERIOD);
        assert_eq!(p.transmission_parcel_size, MAX_PARCEL_SIZE);
    }
}
