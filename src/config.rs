//! # Configuration Management
//!
//! Centralized configuration for the serial multiplexer.
//!
//! This module describes the transport to open, the role this side plays, the
//! port mappings to expose, engine limits and logging options.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - `SERIAL_MUX_*` environment variables via `apply_env()`
//! - Direct instantiation with defaults, then CLI overrides
//!
//! ## Port Mapping Syntax
//! ```text
//! local-remote[,local-remote...]      each side is `host:port` or bare `port`
//! 8080-9090,127.0.0.1:2222-db:22      bare ports default to host `localhost`
//! ```

use crate::error::{Result, TunnelError};
use crate::core::packet::{ID_SIZE, MAX_PAYLOAD_SIZE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use tracing::Level;

/// Default serial line rate
pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// Capacity of the outgoing frame queue feeding the duplexer
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// How long a request waits for its response
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-connection TCP read chunk
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Host used when a mapping side is given as a bare port
pub const DEFAULT_HOST: &str = "localhost";

/// Which side of the link this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Listens on local ports and asks the peer to open matching connections
    #[default]
    Client,
    /// Dials local targets on request from the peer
    Server,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Client => f.write_str("client"),
            Role::Server => f.write_str("server"),
        }
    }
}

impl FromStr for Role {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "client" => Ok(Role::Client),
            "server" => Ok(Role::Server),
            other => Err(TunnelError::ConfigError(format!("Unknown role: {other}"))),
        }
    }
}

/// A declared tunnel route: listen on the local side, reach the remote side
/// through the peer. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortMapping {
    pub local_host: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_port: u16,
}

impl PortMapping {
    pub fn local_addr(&self) -> String {
        format!("{}:{}", self.local_host, self.local_port)
    }

    pub fn remote_addr(&self) -> String {
        format!("{}:{}", self.remote_host, self.remote_port)
    }
}

impl fmt::Display for PortMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.local_addr(), self.remote_addr())
    }
}

impl FromStr for PortMapping {
    type Err = TunnelError;

    fn from_str(s: &str) -> Result<Self> {
        let (local, remote) = match s.trim().split('-').collect::<Vec<_>>()[..] {
            [local, remote] => (local, remote),
            _ => return Err(TunnelError::InvalidMapping(s.to_string())),
        };

        let (local_host, local_port) = split_host_port(local)
            .map_err(|_| TunnelError::InvalidMapping(format!("invalid local side: {local}")))?;
        let (remote_host, remote_port) = split_host_port(remote)
            .map_err(|_| TunnelError::InvalidMapping(format!("invalid remote side: {remote}")))?;

        Ok(Self {
            local_host,
            local_port,
            remote_host,
            remote_port,
        })
    }
}

impl TryFrom<String> for PortMapping {
    type Error = TunnelError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<PortMapping> for String {
    fn from(value: PortMapping) -> Self {
        value.to_string()
    }
}

/// Split `host:port` or a bare `port` (host defaults to `localhost`).
///
/// Hosts may not contain `:` because InitProxy payloads are colon-delimited.
pub fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let parts: Vec<&str> = addr.trim().split(':').collect();
    let (host, port) = match parts[..] {
        [port] => (DEFAULT_HOST, port),
        [host, port] if !host.is_empty() => (host, port),
        _ => return Err(TunnelError::InvalidMapping(format!("invalid address: {addr}"))),
    };

    let port = port
        .parse::<u16>()
        .map_err(|_| TunnelError::InvalidMapping(format!("invalid port: {port}")))?;
    Ok((host.to_string(), port))
}

/// Parse the comma-separated mapping list used on the command line.
pub fn parse_port_mappings(mappings: &str) -> Result<Vec<PortMapping>> {
    mappings
        .split(',')
        .filter(|pair| !pair.trim().is_empty())
        .map(str::parse)
        .collect()
}

/// Top-level configuration
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct TunnelConfig {
    #[serde(default)]
    pub role: Role,

    #[serde(default)]
    pub mappings: Vec<PortMapping>,

    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub engine: EngineConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl TunnelConfig {
    /// Load configuration from a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)
            .map_err(|e| TunnelError::ConfigError(format!("Failed to open config file: {e}")))?;

        let mut contents = String::new();
        file.read_to_string(&mut contents)
            .map_err(|e| TunnelError::ConfigError(format!("Failed to read config file: {e}")))?;

        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str::<Self>(content)
            .map_err(|e| TunnelError::ConfigError(format!("Failed to parse TOML: {e}")))
    }

    /// Apply `SERIAL_MUX_*` environment overrides on top of `self`
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(|name| std::env::var(name).ok())
    }

    fn apply_overrides(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(device) = var("SERIAL_MUX_DEVICE") {
            self.transport.device = device;
        }

        if let Some(baud) = var("SERIAL_MUX_BAUD") {
            self.transport.baud_rate = baud
                .parse()
                .map_err(|_| TunnelError::ConfigError(format!("Invalid baud rate: {baud}")))?;
        }

        if let Some(role) = var("SERIAL_MUX_ROLE") {
            self.role = role.parse()?;
        }

        if let Some(ports) = var("SERIAL_MUX_PORTS") {
            self.mappings = parse_port_mappings(&ports)?;
        }

        if let Some(timeout) = var("SERIAL_MUX_REQUEST_TIMEOUT_MS") {
            let millis = timeout.parse::<u64>().map_err(|_| {
                TunnelError::ConfigError(format!("Invalid request timeout: {timeout}"))
            })?;
            self.engine.request_timeout = Duration::from_millis(millis);
        }

        Ok(())
    }

    /// Generate example configuration file content
    pub fn example_config() -> String {
        let mut example = Self::default();
        example.transport.device = "/dev/ttyUSB0".to_string();
        example.mappings = parse_port_mappings("8080-9090").unwrap_or_default();
        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| String::from("# Failed to generate example config"))
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.transport.validate());
        errors.extend(self.engine.validate());

        match self.role {
            Role::Client => {
                let mut seen = HashSet::new();
                for mapping in &self.mappings {
                    if !seen.insert((mapping.local_host.as_str(), mapping.local_port)) {
                        errors.push(format!(
                            "Duplicate local listen address: {}",
                            mapping.local_addr()
                        ));
                    }
                }
            }
            Role::Server => {
                if !self.mappings.is_empty() {
                    errors.push(
                        "Port mappings are ignored in server role (connections are opened on request)"
                            .to_string(),
                    );
                }
            }
        }

        errors
    }

    /// Validate and return Result - convenience method
    pub fn validate_strict(&self) -> Result<()> {
        let errors = self.validate();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(TunnelError::ConfigError(format!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            )))
        }
    }
}

/// Which byte stream to open as the link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TransportConfig {
    /// Serial device path, `tcp://host:port` or `tcp-listen://host:port`
    pub device: String,

    /// Serial line rate (ignored for TCP transports)
    pub baud_rate: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            device: String::new(),
            baud_rate: DEFAULT_BAUD_RATE,
        }
    }
}

impl TransportConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.device.trim().is_empty() {
            errors.push("Transport device cannot be empty".to_string());
        }

        if self.baud_rate == 0 {
            errors.push("Baud rate must be greater than 0".to_string());
        }

        errors
    }
}

/// Limits of the multiplexing engine
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    /// Maximum number of frames waiting for the duplexer
    pub queue_capacity: usize,

    /// How long a request waits for its response
    #[serde(with = "duration_serde")]
    pub request_timeout: Duration,

    /// Bytes read from a local TCP socket per Data frame
    pub read_buffer_size: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.queue_capacity == 0 {
            errors.push("Queue capacity must be greater than 0".to_string());
        }

        if self.request_timeout.as_millis() < 10 {
            errors.push("Request timeout too short (minimum: 10ms)".to_string());
        } else if self.request_timeout.as_secs() > 300 {
            errors.push("Request timeout too long (maximum: 300s)".to_string());
        }

        if self.read_buffer_size == 0 {
            errors.push("Read buffer size must be greater than 0".to_string());
        } else if self.read_buffer_size > MAX_PAYLOAD_SIZE - ID_SIZE {
            errors.push(format!(
                "Read buffer size too large: {} bytes (maximum: {})",
                self.read_buffer_size,
                MAX_PAYLOAD_SIZE - ID_SIZE
            ));
        }

        errors
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(with = "log_level_serde")]
    pub log_level: Level,

    /// Whether to print the event target (module path)
    pub show_target: bool,

    /// Whether to use ANSI colors
    pub ansi: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            show_target: false,
            ansi: true,
        }
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
        level.as_str().to_ascii_lowercase().serialize(serializer)
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
