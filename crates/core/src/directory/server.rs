/// Directory service over JSON lines
///
/// One request per connection: the client sends a single JSON object on
/// one line, the server answers with one line and closes. Wire shapes
/// live here, shared with [`super::client`].

use super::{Directory, DirectoryError, MemoryDirectory, RelayDescriptor};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub(super) enum Request {
    Fetch {
        prefix: String,
    },
    Register {
        name: String,
        descriptor: RelayDescriptor,
    },
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub(super) enum Response {
    Relays { relays: Vec<RelayDescriptor> },
    Lease { lease_secs: u64 },
    Error { error: String },
}

pub struct DirectoryServer {
    directory: Arc<MemoryDirectory>,
}

impl DirectoryServer {
    pub fn new() -> Self {
        Self {
            directory: Arc::new(MemoryDirectory::new()),
        }
    }

    pub fn directory(&self) -> Arc<MemoryDirectory> {
        self.directory.clone()
    }

    /// Bind and serve. Returns the bound address and the accept loop's
    /// join handle.
    pub async fn listen(
        &self,
        addr: &str,
    ) -> veilnet_common::Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("directory listening on {}", local_addr);

        let directory = self.directory.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (socket, peer) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("directory: accept failed: {}", e);
                        continue;
                    }
                };
                let directory = directory.clone();
                tokio::spawn(async move {
                    if let Err(e) = serve_one(directory, socket).await {
                        debug!("directory: request from {} failed: {}", peer, e);
                    }
                });
            }
        });

        Ok((local_addr, handle))
    }
}

impl Default for DirectoryServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn serve_one(directory: Arc<MemoryDirectory>, socket: TcpStream) -> anyhow::Result<()> {
    let (read_half, mut write_half) = socket.into_split();
    let mut line = String::new();
    BufReader::new(read_half).read_line(&mut line).await?;

    let response = match serde_json::from_str::<Request>(line.trim_end()) {
        Ok(Request::Fetch { prefix }) => match directory.fetch(&prefix).await {
            Ok(relays) => Response::Relays { relays },
            Err(e) => Response::Error {
                error: e.to_string(),
            },
        },
        Ok(Request::Register { name, descriptor }) => {
            match directory.register(&name, descriptor).await {
                Ok(lease) => Response::Lease {
                    lease_secs: lease.as_secs(),
                },
                Err(e) => Response::Error {
                    error: e.to_string(),
                },
            }
        }
        Err(e) => Response::Error {
            error: format!("bad request: {}", e),
        },
    };

    let mut wire = serde_json::to_vec(&response)?;
    wire.push(b'\n');
    write_half.write_all(&wire).await?;
    write_half.shutdown().await?;
    Ok(())
}

impl Response {
    pub(super) fn into_relays(self) -> Result<Vec<RelayDescriptor>, DirectoryError> {
        match self {
            Self::Relays { relays } => Ok(relays),
            Self::Error { error } => Err(DirectoryError::Rejected(error)),
            Self::Lease { .. } => {
                Err(DirectoryError::Malformed("lease reply to fetch".to_string()))
            }
        }
    }

    pub(super) fn into_lease(self) -> Result<u64, DirectoryError> {
        match self {
            Self::Lease { lease_secs } => Ok(lease_secs),
            Self::Error { error } => Err(DirectoryError::Rejected(error)),
            Self::Relays { .. } => Err(DirectoryError::Malformed(
                "relay list reply to register".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_shape() {
        let fetch: Request = serde_json::from_str(r#"{"op":"fetch","prefix":"relay-"}"#).unwrap();
        assert!(matches!(fetch, Request::Fetch { ref prefix } if prefix == "relay-"));

        let register = serde_json::to_string(&Request::Register {
            name: "relay-1.1".to_string(),
            descriptor: RelayDescriptor::new(veilnet_common::AgentId::new(1, 1), "127.0.0.1", 9201),
        })
        .unwrap();
        assert!(register.contains(r#""op":"register""#));
        assert!(register.contains(r#""host":"127.0.0.1""#));
    }

    #[tokio::test]
    async fn test_listen_answers_a_fetch() {
        let server = DirectoryServer::new();
        let (addr, _handle) = server.listen("127.0.0.1:0").await.unwrap();

        let mut socket = TcpStream::connect(addr).await.unwrap();
        socket
            .write_all(b"{\"op\":\"fetch\",\"prefix\":\"\"}\n")
            .await
            .unwrap();
        let mut reply = String::new();
        BufReader::new(socket).read_line(&mut reply).await.unwrap();

        let response: Response = serde_json::from_str(reply.trim_end()).unwrap();
        assert!(response.into_relays().unwrap().is_empty());
    }

    #[test]
    fn test_response_discrimination() {
        let lease: Response = serde_json::from_str(r#"{"lease_secs":300}"#).unwrap();
        assert_eq!(lease.into_lease().unwrap(), 300);

        let err: Response = serde_json::from_str(r#"{"error":"nope"}"#).unwrap();
        assert!(matches!(
            err.into_relays(),
            Err(DirectoryError::Rejected(_))
        ));

        let relays: Response = serde_json::from_str(r#"{"relays":[]}"#).unwrap();
        assert!(relays.into_relays().unwrap().is_empty());
    }
}
