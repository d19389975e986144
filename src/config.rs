//! # Configuration Management
//!
//! Centralized configuration for a dispatch node.
//!
//! ## Configuration Sources
//! - TOML files via `from_file()` / `from_toml()`
//! - Direct instantiation with defaults
//! - Environment-specific overrides via `from_env()`
//!
//! ## Sections
//! - `server`: listener address, advertised version, connection limits
//! - `session`: heartbeats, outbound queue sizing and overflow policy
//! - `dispatch`: handler concurrency, worker pools, deadlines
//! - `services`: per-service overrides applied when a service is added
//! - `logging`: subscriber settings used by [`crate::utils::logging`]

use crate::error::{ProtocolError, Result};
use crate::utils::timeout;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::time::Duration;
use tracing::Level;

/// Version advertised in `HandshakeAck` unless configured otherwise.
pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default outbound queue bound, in messages.
pub const DEFAULT_OUTBOUND_QUEUE_SIZE: usize = 1024;

/// Default per-session parallel worker bound.
pub const DEFAULT_WORKER_POOL_SIZE: usize = 16;

/// Default number of consecutive missed heartbeat intervals before a session is closed.
pub const DEFAULT_HEARTBEAT_MISS_TOLERANCE: u32 = 3;

/// Handler invocation policy for a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Concurrency {
    /// One invocation per session at a time, in arrival order.
    #[default]
    Serial,
    /// Invocations run concurrently, bounded by the session worker pool.
    Parallel,
}

/// What happens when a session's outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Wait for the writer to make room.
    Block,
    /// Evict the oldest queued message.
    DropOldest,
    /// Discard the message being enqueued.
    DropNewest,
    /// Close the session with cause `Backpressure`.
    #[default]
    CloseSession,
}

impl std::str::FromStr for OverflowPolicy {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "block" => Ok(Self::Block),
            "drop_oldest" => Ok(Self::DropOldest),
            "drop_newest" => Ok(Self::DropNewest),
            "close_session" => Ok(Self::CloseSession),
            other => Err(ProtocolError::ConfigError(format!(
                "Unknown overflow policy: '{other}'"
            ))),
        }
    }
}

impl std::str::FromStr for Concurrency {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "serial" => Ok(Self::Serial),
            "parallel" => Ok(Self::Parallel),
            other => Err(ProtocolError::ConfigError(format!(
                "Unknown concurrency policy: '{other}'"
            ))),
        }
    }
}

/// Main node configuration structure that contains all configurable settings
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct NodeConfig {
    /// Listener and node-wide settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Per-connection session settings
    #[serde(default)]
    pub session: SessionConfig,

    /// Handler dispatch settings
    #[serde(default)]
    pub dispatch: DispatchConfig,

    /// Per-service overrides
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub services: Vec<ServiceConfig>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl NodeConfig {
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

        if let Ok(addr) = std::env::var("CLUSTER_DISPATCH_LISTEN_ADDRESS") {
            config.server.listen_address = addr;
        }

        if let Ok(interval) = std::env::var("CLUSTER_DISPATCH_HEARTBEAT_INTERVAL_MS") {
            config.session.heartbeat_interval = Duration::from_millis(parse_env(
                "CLUSTER_DISPATCH_HEARTBEAT_INTERVAL_MS",
                &interval,
            )?);
        }

        if let Ok(tolerance) = std::env::var("CLUSTER_DISPATCH_HEARTBEAT_MISS_TOLERANCE") {
            config.session.heartbeat_miss_tolerance =
                parse_env("CLUSTER_DISPATCH_HEARTBEAT_MISS_TOLERANCE", &tolerance)?;
        }

        if let Ok(size) = std::env::var("CLUSTER_DISPATCH_OUTBOUND_QUEUE_SIZE") {
            config.session.outbound_queue_size =
                parse_env("CLUSTER_DISPATCH_OUTBOUND_QUEUE_SIZE", &size)?;
        }

        if let Ok(policy) = std::env::var("CLUSTER_DISPATCH_OUTBOUND_OVERFLOW") {
            config.session.outbound_overflow = policy.parse()?;
        }

        if let Ok(concurrency) = std::env::var("CLUSTER_DISPATCH_DEFAULT_CONCURRENCY") {
            config.dispatch.default_concurrency = concurrency.parse()?;
        }

        if let Ok(size) = std::env::var("CLUSTER_DISPATCH_WORKER_POOL_SIZE") {
            config.dispatch.worker_pool_size =
                parse_env("CLUSTER_DISPATCH_WORKER_POOL_SIZE", &size)?;
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

    /// Overrides for the named service, if any
    pub fn service(&self, name: &str) -> Option<&ServiceConfig> {
        self.services.iter().find(|s| s.name == name)
    }

    /// Validate the configuration for common issues and misconfigurations
    ///
    /// Returns a list of validation errors. Empty list means configuration is valid.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        errors.extend(self.server.validate());
        errors.extend(self.session.validate());
        errors.extend(self.dispatch.validate());

        let mut seen = HashSet::new();
        for service in &self.services {
            errors.extend(service.validate());
            if !seen.insert(service.name.as_str()) {
                errors.push(format!("Duplicate service override: '{}'", service.name));
            }
        }

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

fn parse_env<T: std::str::FromStr>(name: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ProtocolError::ConfigError(format!("Invalid value for {name}: '{value}'")))
}

/// Listener and node-wide configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g., "127.0.0.1:3010")
    pub listen_address: String,

    /// Version advertised to clients at handshake
    pub server_version: String,

    /// Maximum number of concurrent sessions
    pub max_connections: usize,

    /// How long a new connection may take to send its handshake
    #[serde(with = "duration_serde")]
    pub handshake_timeout: Duration,

    /// Default grace period for `Node::shutdown`
    #[serde(with = "duration_serde")]
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: String::from("127.0.0.1:3010"),
            server_version: String::from(SERVER_VERSION),
            max_connections: 10_000,
            handshake_timeout: timeout::HANDSHAKE_TIMEOUT,
            shutdown_grace: timeout::SHUTDOWN_GRACE,
        }
    }
}

impl ServerConfig {
    /// Validate server configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.listen_address.is_empty() {
            errors.push("Listen address cannot be empty".to_string());
        } else if !is_listen_address(&self.listen_address) {
            errors.push(format!(
                "Invalid listen address format: '{}' (expected 'host:port' or an absolute socket path)",
                self.listen_address
            ));
        }

        if self.server_version.trim().is_empty() {
            errors.push("Server version cannot be empty".to_string());
        }

        if self.max_connections == 0 {
            errors.push("Max connections must be greater than 0".to_string());
        } else if self.max_connections > 1_000_000 {
            errors.push(format!(
                "Max connections very high: {} (maximum: 1,000,000)",
                self.max_connections
            ));
        }

        if self.handshake_timeout.as_millis() < 10 {
            errors.push("Handshake timeout too short (minimum: 10ms)".to_string());
        } else if self.handshake_timeout.as_secs() > 300 {
            errors.push("Handshake timeout too long (maximum: 300s)".to_string());
        }

        if self.shutdown_grace.as_secs() > 300 {
            errors.push("Shutdown grace too long (maximum: 300s)".to_string());
        }

        errors
    }
}

fn is_listen_address(addr: &str) -> bool {
    if addr.starts_with('/') || addr.starts_with("memory://") {
        return true;
    }
    match addr.rsplit_once(':') {
        Some((host, port)) => !host.is_empty() && port.parse::<u16>().is_ok(),
        None => false,
    }
}

/// Per-connection session configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Expected client heartbeat interval, advertised at handshake
    #[serde(with = "duration_serde")]
    pub heartbeat_interval: Duration,

    /// Consecutive silent intervals tolerated before `HeartbeatTimeout`
    pub heartbeat_miss_tolerance: u32,

    /// Maximum number of messages waiting to be written
    pub outbound_queue_size: usize,

    /// Action taken when the outbound queue is full
    pub outbound_overflow: OverflowPolicy,

    /// How long a closing session may spend draining its outbound queue
    #[serde(with = "duration_serde")]
    pub close_grace: Duration,

    /// Whether route codes are offered to clients that ask for them
    pub route_compression: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: timeout::HEARTBEAT_INTERVAL,
            heartbeat_miss_tolerance: DEFAULT_HEARTBEAT_MISS_TOLERANCE,
            outbound_queue_size: DEFAULT_OUTBOUND_QUEUE_SIZE,
            outbound_overflow: OverflowPolicy::default(),
            close_grace: timeout::CLOSE_GRACE,
            route_compression: true,
        }
    }
}

impl SessionConfig {
    /// Validate session configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.heartbeat_interval.as_millis() < 10 {
            errors.push("Heartbeat interval too short (minimum: 10ms)".to_string());
        } else if self.heartbeat_interval.as_secs() > 3600 {
            errors.push("Heartbeat interval too long (maximum: 1 hour)".to_string());
        }

        if self.heartbeat_miss_tolerance == 0 {
            errors.push("Heartbeat miss tolerance must be greater than 0".to_string());
        } else if self.heartbeat_miss_tolerance > 100 {
            errors.push(format!(
                "Heartbeat miss tolerance too large: {} (maximum: 100)",
                self.heartbeat_miss_tolerance
            ));
        }

        if self.outbound_queue_size == 0 {
            errors.push("Outbound queue size must be greater than 0".to_string());
        } else if self.outbound_queue_size > 1_000_000 {
            errors.push(format!(
                "Outbound queue size too large: {} (maximum: 1,000,000)",
                self.outbound_queue_size
            ));
        }

        if self.close_grace.as_secs() > 60 {
            errors.push("Close grace too long (maximum: 60s)".to_string());
        }

        errors
    }
}

/// Handler dispatch configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Policy for services that do not choose one
    pub default_concurrency: Concurrency,

    /// Per-session bound on concurrently running parallel handlers
    pub worker_pool_size: usize,

    /// Requests buffered for the serial lane before the reader waits
    pub inbound_backlog: usize,

    /// Deadline applied to handlers of services that do not set one
    #[serde(
        default,
        with = "opt_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub default_deadline: Option<Duration>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_concurrency: Concurrency::default(),
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            inbound_backlog: 256,
            default_deadline: None,
        }
    }
}

impl DispatchConfig {
    /// Validate dispatch configuration
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.worker_pool_size == 0 {
            errors.push("Worker pool size must be greater than 0".to_string());
        } else if self.worker_pool_size > 4096 {
            errors.push(format!(
                "Worker pool size too large: {} (maximum: 4096)",
                self.worker_pool_size
            ));
        }

        if self.inbound_backlog == 0 {
            errors.push("Inbound backlog must be greater than 0".to_string());
        }

        if let Some(deadline) = self.default_deadline {
            if deadline.is_zero() {
                errors.push("Default deadline must be greater than 0".to_string());
            }
        }

        errors
    }
}

/// Overrides for one service, matched by name when the service is added
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct ServiceConfig {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<Concurrency>,

    #[serde(
        default,
        with = "opt_duration_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub deadline: Option<Duration>,
}

impl ServiceConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency: None,
            deadline: None,
        }
    }

    /// Validate service override
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.name.is_empty() {
            errors.push("Service name cannot be empty".to_string());
        } else if self.name.contains('.') {
            errors.push(format!(
                "Service name must not contain '.': '{}'",
                self.name
            ));
        }

        if matches!(self.deadline, Some(d) if d.is_zero()) {
            errors.push(format!(
                "Deadline for service '{}' must be greater than 0",
                self.name
            ));
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
            app_name: String::from("cluster-dispatch"),
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
                if let Some(parent) = std::path::Path::new(path).parent() {
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

/// Helper module for Duration serialization/deserialization (milliseconds)
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

/// Same as `duration_serde` for optional durations
mod opt_duration_serde {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        duration
            .map(|d| d.as_millis() as u64)
            .serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
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
