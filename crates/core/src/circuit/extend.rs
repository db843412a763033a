/// Circuit extension: the OPEN/CREATE round-trips toward a next hop
///
/// Used from two places with the same machinery: the initiator creating a
/// circuit's first segment, and a terminal relay servicing an EXTEND. Both
/// reuse an existing connection to the target agent when one is open and
/// run the two control round-trips through the connection's exchange slot.

use crate::cell::{Cell, CellBody, RelayCell, RelayCommand};
use crate::conn::{Connection, ExchangeError};
use crate::relay::node::RelayNode;
use crate::relay::reader::run_connection;
use crate::relay::routing::Hop;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};
use veilnet_common::AgentId;

/// Why an extension (or first-segment creation) failed
#[derive(Debug, thiserror::Error)]
pub enum ExtendError {
    #[error("dialing next hop failed: {0}")]
    Dial(String),

    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("next hop refused the OPEN handshake")]
    OpenRefused,

    #[error("next hop refused the CREATE")]
    CreateRefused,

    #[error("next hop sent an unexpected control response")]
    UnexpectedReply,

    #[error("terminal hop refused the extension")]
    Refused,

    #[error("another extension is already in flight on this circuit")]
    Busy,

    #[error("timed out waiting for the extension response")]
    Timeout,

    #[error("circuit closed during the extension")]
    CircuitClosed,
}

impl RelayNode {
    /// Establish a circuit segment toward `target` at `host:port`: reuse
    /// or dial a connection, complete the OPEN handshake if the connection
    /// is fresh, and allocate a circuit with CREATE. Returns the
    /// connection and the new circuit id.
    pub async fn open_and_create(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        target: AgentId,
    ) -> Result<(Arc<Connection>, u16), ExtendError> {
        let (conn, fresh) = match self.registry.lookup_agent(target) {
            Some(conn) if !conn.is_closed() => (conn, false),
            _ => {
                let dialed = timeout(self.timeouts.dial, TcpStream::connect((host, port)))
                    .await
                    .map_err(|_| ExtendError::Dial(format!("{}:{} timed out", host, port)))?
                    .map_err(|e| ExtendError::Dial(format!("{}:{}: {}", host, port, e)))?;
                let _ = dialed.set_nodelay(true);

                let (read_half, write_half) = dialed.into_split();
                let conn = self.registry.register(write_half, true);
                tokio::spawn(run_connection(self.clone(), conn.clone(), read_half));
                (conn, true)
            }
        };

        match self.open_create_inner(&conn, target, fresh).await {
            Ok(circuit) => Ok((conn, circuit)),
            Err(e) => {
                // a half-established fresh connection is useless; an
                // existing one stays up for its other circuits
                if fresh {
                    self.teardown_connection(&conn);
                }
                Err(e)
            }
        }
    }

    async fn open_create_inner(
        self: &Arc<Self>,
        conn: &Arc<Connection>,
        target: AgentId,
        fresh: bool,
    ) -> Result<u16, ExtendError> {
        if fresh {
            let mut ticket = conn.exchange().acquire(self.timeouts.exchange_wait).await?;
            let open = Cell::open(self.agent, target);
            let reply = ticket
                .roundtrip(|| conn.enqueue(open), self.timeouts.open)
                .await?;
            match reply.body {
                CellBody::Opened { .. } => {
                    self.registry.bind_agent(conn, target);
                }
                CellBody::OpenFailed { .. } => return Err(ExtendError::OpenRefused),
                _ => return Err(ExtendError::UnexpectedReply),
            }
        }

        let circuit = conn.next_circuit_id();
        let mut ticket = conn.exchange().acquire(self.timeouts.exchange_wait).await?;
        let create = Cell::new(circuit, CellBody::Create);
        let reply = ticket
            .roundtrip(|| conn.enqueue(create), self.timeouts.create)
            .await?;
        match reply.body {
            CellBody::Created if reply.circuit_id == circuit => Ok(circuit),
            CellBody::Created => {
                warn!(
                    "{}: CREATED for circuit {}, expected {}",
                    conn.id(),
                    reply.circuit_id,
                    circuit
                );
                Err(ExtendError::UnexpectedReply)
            }
            CellBody::CreateFailed => Err(ExtendError::CreateRefused),
            _ => Err(ExtendError::UnexpectedReply),
        }
    }

    /// Service an EXTEND received at a terminal hop: build the next
    /// segment, splice it into the hop table, and answer EXTENDED or
    /// EXTEND_FAILED toward the requesting neighbor.
    pub(crate) async fn handle_extend(
        self: Arc<Self>,
        requesting: Hop,
        stream_id: u16,
        host: String,
        port: u16,
        target: AgentId,
    ) {
        let outcome = self.open_and_create(&host, port, target).await;

        let reply = match outcome {
            Ok((next_conn, circuit)) => {
                let next = Hop::new(next_conn.id(), circuit);
                if self.hops.extend(requesting, next) {
                    debug!(
                        "relay {}: extended {} to {} via {}",
                        self.agent, requesting, target, next
                    );
                    RelayCommand::Extended
                } else {
                    // the circuit was destroyed while we were dialing;
                    // the fresh segment must not leak
                    warn!(
                        "relay {}: {} no longer extendable, destroying new segment",
                        self.agent, requesting
                    );
                    next_conn.enqueue(Cell::new(circuit, CellBody::Destroy));
                    RelayCommand::ExtendFailed
                }
            }
            Err(e) => {
                warn!(
                    "relay {}: extension of {} to {} failed: {}",
                    self.agent, requesting, target, e
                );
                RelayCommand::ExtendFailed
            }
        };

        self.registry.enqueue_write(
            requesting.conn,
            Cell::relay(requesting.circuit, RelayCell::control(stream_id, reply)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use veilnet_common::ProtocolTimeouts;

    fn node(group: u16, instance: u16) -> Arc<RelayNode> {
        RelayNode::with_timeouts(
            AgentId::new(group, instance),
            ProtocolTimeouts::short(Duration::from_millis(300)),
        )
    }

    #[tokio::test]
    async fn test_open_and_create_against_live_relay() {
        let server = node(1, 1);
        let (addr, _accept) = server.listen("127.0.0.1:0").await.unwrap();

        let client = node(2, 1);
        let (conn, circuit) = client
            .open_and_create(&addr.ip().to_string(), addr.port(), server.agent())
            .await
            .unwrap();

        assert_eq!(circuit, 3);
        assert_eq!(conn.peer_agent(), Some(server.agent()));
        assert_eq!(server.hops().len(), 1);

        // second circuit reuses the connection, no new handshake
        let (conn2, circuit2) = client
            .open_and_create(&addr.ip().to_string(), addr.port(), server.agent())
            .await
            .unwrap();
        assert_eq!(conn2.id(), conn.id());
        assert_eq!(circuit2, 5);
        assert_eq!(server.hops().len(), 2);
        assert_eq!(client.registry().connection_count(), 1);
    }

    #[tokio::test]
    async fn test_open_refused_by_wrong_identity() {
        let server = node(1, 1);
        let (addr, _accept) = server.listen("127.0.0.1:0").await.unwrap();

        let client = node(2, 1);
        let wrong = AgentId::new(9, 9);
        let err = client
            .open_and_create(&addr.ip().to_string(), addr.port(), wrong)
            .await
            .unwrap_err();
        assert!(matches!(err, ExtendError::OpenRefused));

        // the failed connection must not linger
        assert_eq!(client.registry().connection_count(), 0);
        assert_eq!(server.hops().len(), 0);
    }

    #[tokio::test]
    async fn test_dial_failure() {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let dead_port = probe.local_addr().unwrap().port();
        drop(probe);

        let client = node(2, 1);
        let err = client
            .open_and_create("127.0.0.1", dead_port, AgentId::new(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtendError::Dial(_)));
        assert_eq!(client.registry().connection_count(), 0);
    }

    #[tokio::test]
    async fn test_open_timeout_against_silent_listener() {
        // a listener that accepts but never speaks the protocol
        let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = silent.local_addr().unwrap();
        tokio::spawn(async move {
            let _held = silent.accept().await;
            tokio::time::sleep(Duration::from_secs(10)).await;
        });

        let client = node(2, 1);
        let err = client
            .open_and_create(&addr.ip().to_string(), addr.port(), AgentId::new(1, 1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExtendError::Exchange(ExchangeError::Timeout)));
        assert_eq!(client.registry().connection_count(), 0);
    }
}
