pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigError, NodeConfig, ProtocolTimeouts};
pub use error::{Result, VeilnetError};
pub use types::{AgentId, AgentIdError, Timestamp};
