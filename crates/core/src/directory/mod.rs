//! Relay discovery
//!
//! The overlay itself never gossips membership; relays register with a
//! directory service and initiators fetch the current relay list from it.
//! The trait keeps the initiator testable against an in-process directory
//! while deployments talk JSON lines over TCP.

mod client;
mod memory;
mod server;

pub use client::JsonDirectory;
pub use memory::MemoryDirectory;
pub use server::DirectoryServer;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use veilnet_common::AgentId;

/// One registered relay as the directory reports it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub agent: AgentId,
    pub host: String,
    pub port: u16,
}

impl RelayDescriptor {
    pub fn new(agent: AgentId, host: impl Into<String>, port: u16) -> Self {
        Self {
            agent,
            host: host.into(),
            port,
        }
    }
}

impl std::fmt::Display for RelayDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}:{}", self.agent, self.host, self.port)
    }
}

/// Where relays register and initiators look for them
#[async_trait]
pub trait Directory: Send + Sync {
    /// All live relays whose registered name starts with `prefix`.
    async fn fetch(&self, prefix: &str) -> Result<Vec<RelayDescriptor>, DirectoryError>;

    /// Register (or refresh) a relay under `name`. Returns the lease
    /// duration; the caller must re-register before it runs out.
    async fn register(
        &self,
        name: &str,
        descriptor: RelayDescriptor,
    ) -> Result<Duration, DirectoryError>;
}

/// Directory access failures
#[derive(Debug, thiserror::Error)]
pub enum DirectoryError {
    #[error("directory unreachable: {0}")]
    Unreachable(String),

    #[error("directory request timed out")]
    Timeout,

    #[error("directory rejected the request: {0}")]
    Rejected(String),

    #[error("malformed directory response: {0}")]
    Malformed(String),
}
