/// TCP client for the JSON-lines directory protocol
///
/// Connections are per-request; the directory answers one line and hangs
/// up, so there is nothing worth pooling.

use super::server::{Request, Response};
use super::{Directory, DirectoryError, RelayDescriptor};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::timeout;
use veilnet_common::config::directory::REQUEST_TIMEOUT_SECS;

pub struct JsonDirectory {
    addr: String,
    request_timeout: Duration,
}

impl JsonDirectory {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }

    pub fn with_timeout(addr: impl Into<String>, request_timeout: Duration) -> Self {
        Self {
            addr: addr.into(),
            request_timeout,
        }
    }

    async fn roundtrip(&self, request: &Request) -> Result<Response, DirectoryError> {
        timeout(self.request_timeout, self.roundtrip_inner(request))
            .await
            .map_err(|_| DirectoryError::Timeout)?
    }

    async fn roundtrip_inner(&self, request: &Request) -> Result<Response, DirectoryError> {
        let socket = TcpStream::connect(&self.addr)
            .await
            .map_err(|e| DirectoryError::Unreachable(format!("{}: {}", self.addr, e)))?;
        let (read_half, mut write_half) = socket.into_split();

        let mut wire = serde_json::to_vec(request)
            .map_err(|e| DirectoryError::Malformed(e.to_string()))?;
        wire.push(b'\n');
        write_half
            .write_all(&wire)
            .await
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;

        let mut line = String::new();
        BufReader::new(read_half)
            .read_line(&mut line)
            .await
            .map_err(|e| DirectoryError::Unreachable(e.to_string()))?;

        serde_json::from_str(line.trim_end()).map_err(|e| DirectoryError::Malformed(e.to_string()))
    }
}

#[async_trait]
impl Directory for JsonDirectory {
    async fn fetch(&self, prefix: &str) -> Result<Vec<RelayDescriptor>, DirectoryError> {
        self.roundtrip(&Request::Fetch {
            prefix: prefix.to_string(),
        })
        .await?
        .into_relays()
    }

    async fn register(
        &self,
        name: &str,
        descriptor: RelayDescriptor,
    ) -> Result<Duration, DirectoryError> {
        let lease_secs = self
            .roundtrip(&Request::Register {
                name: name.to_string(),
                descriptor,
            })
            .await?
            .into_lease()?;
        Ok(Duration::from_secs(lease_secs))
    }
}
