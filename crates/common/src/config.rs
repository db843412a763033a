use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Wire protocol constants
pub mod protocol {
    /// Default port for relay-to-relay cell traffic
    pub const DEFAULT_RELAY_PORT: u16 = 9201;

    /// Dial timeout for outbound relay and destination connections
    pub const DIAL_TIMEOUT_SECS: u64 = 10;

    /// Wait for OPENED after sending OPEN
    pub const OPEN_TIMEOUT_SECS: u64 = 10;

    /// Wait for CREATED after sending CREATE
    pub const CREATE_TIMEOUT_SECS: u64 = 10;

    /// Wait for EXTENDED after sending a relay EXTEND
    pub const EXTEND_TIMEOUT_SECS: u64 = 10;

    /// Wait for CONNECTED after sending a relay BEGIN
    pub const BEGIN_TIMEOUT_SECS: u64 = 10;

    /// Bounded wait to acquire a connection's exchange slot
    pub const EXCHANGE_WAIT_SECS: u64 = 10;

    /// Depth of each connection's outbound cell FIFO
    pub const WRITE_FIFO_DEPTH: usize = 64;
}

/// Circuit routing constants
pub mod routing {
    /// Default circuit length (number of hops)
    pub const DEFAULT_CIRCUIT_LENGTH: usize = 3;

    /// Maximum circuit length accepted from configuration
    pub const MAX_CIRCUIT_LENGTH: usize = 8;

    /// Whole-circuit build attempts before giving up (each attempt
    /// re-polls the directory for fresh candidates)
    pub const MAX_BUILD_ATTEMPTS: usize = 2;
}

/// Directory service constants
pub mod directory {
    /// Default port for the directory service
    pub const DEFAULT_PORT: u16 = 9300;

    /// Per-request timeout against the directory
    pub const REQUEST_TIMEOUT_SECS: u64 = 5;

    /// Registration lease handed out by the reference directory
    pub const LEASE_SECS: u64 = 300;
}

/// Bounded waits used by the relay engine.
///
/// Defaults come from the `protocol` constants; tests shrink these so
/// failure paths resolve quickly.
#[derive(Debug, Clone, Copy)]
pub struct ProtocolTimeouts {
    pub dial: Duration,
    pub open: Duration,
    pub create: Duration,
    pub extend: Duration,
    pub begin: Duration,
    pub exchange_wait: Duration,
}

impl Default for ProtocolTimeouts {
    fn default() -> Self {
        Self {
            dial: Duration::from_secs(protocol::DIAL_TIMEOUT_SECS),
            open: Duration::from_secs(protocol::OPEN_TIMEOUT_SECS),
            create: Duration::from_secs(protocol::CREATE_TIMEOUT_SECS),
            extend: Duration::from_secs(protocol::EXTEND_TIMEOUT_SECS),
            begin: Duration::from_secs(protocol::BEGIN_TIMEOUT_SECS),
            exchange_wait: Duration::from_secs(protocol::EXCHANGE_WAIT_SECS),
        }
    }
}

impl ProtocolTimeouts {
    /// Uniformly short waits, for exercising failure paths in tests.
    pub fn short(wait: Duration) -> Self {
        Self {
            dial: wait,
            open: wait,
            create: wait,
            extend: wait,
            begin: wait,
            exchange_wait: wait,
        }
    }
}

/// Node configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Agent group number
    pub group: u16,

    /// Agent instance number
    pub instance: u16,

    /// Listen address for relay cell traffic
    pub listen_addr: String,

    /// Listen port for relay cell traffic
    pub listen_port: u16,

    /// Directory service endpoint (host:port)
    pub directory_addr: String,

    /// Name this relay registers under
    pub name: String,

    /// HTTP proxy listen port (client mode)
    pub proxy_port: u16,

    /// Status API listen port
    pub api_port: u16,

    /// Hops per circuit built by this node
    pub circuit_length: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            group: 1,
            instance: 1,
            listen_addr: "0.0.0.0".to_string(),
            listen_port: protocol::DEFAULT_RELAY_PORT,
            directory_addr: format!("127.0.0.1:{}", directory::DEFAULT_PORT),
            name: "veilnet".to_string(),
            proxy_port: 8646,
            api_port: 8647,
            circuit_length: routing::DEFAULT_CIRCUIT_LENGTH,
        }
    }
}

impl NodeConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_agent(mut self, group: u16, instance: u16) -> Self {
        self.group = group;
        self.instance = instance;
        self
    }

    pub fn with_listen_port(mut self, port: u16) -> Self {
        self.listen_port = port;
        self
    }

    pub fn with_directory(mut self, addr: String) -> Self {
        self.directory_addr = addr;
        self
    }

    pub fn with_circuit_length(mut self, length: usize) -> Self {
        self.circuit_length = length.min(routing::MAX_CIRCUIT_LENGTH);
        self
    }

    pub fn dial_timeout(&self) -> Duration {
        Duration::from_secs(protocol::DIAL_TIMEOUT_SECS)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_secs(directory::REQUEST_TIMEOUT_SECS)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &PathBuf) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&contents).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Save configuration to a TOML file
    pub fn to_file(&self, path: &PathBuf) -> Result<(), ConfigError> {
        let contents = toml::to_string_pretty(self)
            .map_err(|e| ConfigError::SerializeError(e.to_string()))?;

        std::fs::write(path, contents).map_err(|e| ConfigError::WriteError(e.to_string()))?;

        Ok(())
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Failed to serialize config: {0}")]
    SerializeError(String),

    #[error("Failed to write config file: {0}")]
    WriteError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = NodeConfig::default();
        assert_eq!(config.listen_port, protocol::DEFAULT_RELAY_PORT);
        assert_eq!(config.circuit_length, routing::DEFAULT_CIRCUIT_LENGTH);
    }

    #[test]
    fn test_config_builder() {
        let config = NodeConfig::new()
            .with_agent(17, 3)
            .with_listen_port(9999)
            .with_circuit_length(100);

        assert_eq!(config.group, 17);
        assert_eq!(config.instance, 3);
        assert_eq!(config.listen_port, 9999);
        assert_eq!(config.circuit_length, routing::MAX_CIRCUIT_LENGTH);
    }

    #[test]
    fn test_config_toml_roundtrip() {
        let config = NodeConfig::new().with_agent(5, 9);
        let text = toml::to_string_pretty(&config).unwrap();
        let back: NodeConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.group, 5);
        assert_eq!(back.instance, 9);
        assert_eq!(back.directory_addr, config.directory_addr);
    }
}
