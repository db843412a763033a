/// Per-connection read and dispatch loop
///
/// One task per connection reads fixed-size cells and dispatches each by
/// command and hop-table lookup. A connection we accepted starts in
/// AWAITING_OPEN and must present a valid OPEN before anything else; a
/// connection we dialed is ACTIVE immediately (its OPENED arrives through
/// the exchange slot).

use super::exit;
use super::node::RelayNode;
use super::routing::{Hop, HopEntry};
use crate::cell::{
    parse_begin_payload, parse_extend_payload, Cell, CellBody, CellError, RelayCell, RelayCommand,
    CELL_LEN,
};
use crate::conn::Connection;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::{debug, warn};

pub(crate) async fn run_connection<R>(node: Arc<RelayNode>, conn: Arc<Connection>, mut read_half: R)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let mut buf = [0u8; CELL_LEN];

    // AWAITING_OPEN: the accepting side demands a valid handshake first
    if !conn.initiated() {
        match read_cell(&conn, &mut read_half, &mut buf).await {
            Some(()) => match Cell::decode(&buf) {
                Ok(cell) => {
                    if !answer_open(&node, &conn, &cell) {
                        node.teardown_connection(&conn);
                        return;
                    }
                }
                Err(e) => {
                    warn!("{}: malformed handshake cell: {}", conn.id(), e);
                    node.teardown_connection(&conn);
                    return;
                }
            },
            None => {
                node.teardown_connection(&conn);
                return;
            }
        }
    }

    // ACTIVE: dispatch cells in arrival order until the socket dies
    loop {
        match read_cell(&conn, &mut read_half, &mut buf).await {
            Some(()) => {}
            None => break,
        }

        let cell = match Cell::decode(&buf) {
            Ok(cell) => cell,
            Err(e) => {
                drop_malformed(&conn, &buf, e);
                continue;
            }
        };

        if !dispatch(&node, &conn, cell) {
            break;
        }
    }

    node.teardown_connection(&conn);
}

/// Read exactly one cell's worth of bytes, or None when the socket or the
/// connection is done.
async fn read_cell<R>(conn: &Connection, read_half: &mut R, buf: &mut [u8; CELL_LEN]) -> Option<()>
where
    R: AsyncRead + Unpin,
{
    tokio::select! {
        biased;
        _ = conn.wait_closed() => None,
        read = read_half.read_exact(buf) => match read {
            Ok(_) => Some(()),
            Err(e) => {
                debug!("{}: read ended: {}", conn.id(), e);
                None
            }
        },
    }
}

fn drop_malformed(conn: &Connection, buf: &[u8], err: CellError) {
    warn!(
        "{}: dropping malformed cell ({}): {}",
        conn.id(),
        err,
        hex::encode(&buf[..12.min(buf.len())])
    );
}

/// Answer an OPEN cell: valid target gets OPENED and binds the peer
/// identity, anything else gets OPEN_FAILED and the connection closed.
fn answer_open(node: &RelayNode, conn: &Arc<Connection>, cell: &Cell) -> bool {
    match cell.body {
        CellBody::Open { opener, target } => {
            if target == node.agent {
                debug!("{}: opened by agent {}", conn.id(), opener);
                node.registry.bind_agent(conn, opener);
                conn.enqueue(Cell::opened(opener, target));
                true
            } else {
                warn!(
                    "{}: OPEN addressed to {}, but we are {}",
                    conn.id(),
                    target,
                    node.agent
                );
                conn.enqueue(Cell::open_failed(opener, target));
                false
            }
        }
        _ => {
            warn!(
                "{}: expected OPEN, got {:?}",
                conn.id(),
                cell.body.command()
            );
            false
        }
    }
}

/// Classify one ACTIVE-state cell. Returns false when the connection must
/// close.
fn dispatch(node: &Arc<RelayNode>, conn: &Arc<Connection>, cell: Cell) -> bool {
    let inbound = Hop::new(conn.id(), cell.circuit_id);

    match cell.body {
        // responses to the in-flight exchange on this connection
        CellBody::Opened { .. }
        | CellBody::OpenFailed { .. }
        | CellBody::Created
        | CellBody::CreateFailed => {
            if !conn.exchange().complete(cell) {
                debug!("{}: stale control response discarded", conn.id());
            }
            true
        }

        // peers may reuse a connection for a fresh role at any time
        CellBody::Open { .. } => answer_open(node, conn, &cell),

        CellBody::Create => {
            if node.hops.claim(inbound).is_some() {
                debug!("relay {}: claimed {}", node.agent, inbound);
                conn.enqueue(Cell::new(cell.circuit_id, CellBody::Created));
            } else {
                warn!("relay {}: duplicate CREATE for {}", node.agent, inbound);
                conn.enqueue(Cell::new(cell.circuit_id, CellBody::CreateFailed));
            }
            true
        }

        CellBody::Destroy => {
            node.destroy_circuit(inbound);
            true
        }

        CellBody::Relay(relay) => {
            dispatch_relay(node, conn, inbound, relay);
            true
        }
    }
}

fn dispatch_relay(node: &Arc<RelayNode>, conn: &Arc<Connection>, inbound: Hop, relay: RelayCell) {
    match node.hops.lookup(inbound) {
        None => {
            warn!(
                "relay {}: RELAY {:?} for unknown {}",
                node.agent, relay.command, inbound
            );
        }

        Some(HopEntry::Forward(next)) => {
            // rewrite the circuit id, everything else passes unchanged;
            // EXTEND transits too, until the terminal hop consumes it
            node.registry
                .enqueue_write(next.conn, Cell::relay(next.circuit, relay));
        }

        Some(HopEntry::Exit(exit_circuit)) => {
            dispatch_terminal(node, conn, inbound, exit_circuit, relay)
        }

        Some(HopEntry::Origin(origin)) => origin.deliver(relay),
    }
}

/// Terminal-hop handling of stream traffic and extension requests.
fn dispatch_terminal(
    node: &Arc<RelayNode>,
    conn: &Arc<Connection>,
    inbound: Hop,
    exit_circuit: Arc<exit::ExitCircuit>,
    relay: RelayCell,
) {
    match relay.command {
        RelayCommand::Begin => {
            let (host, port) = match parse_begin_payload(&relay.payload) {
                Ok(dest) => dest,
                Err(e) => {
                    warn!("relay {}: malformed BEGIN on {}: {}", node.agent, inbound, e);
                    conn.enqueue(Cell::relay(
                        inbound.circuit,
                        RelayCell::control(relay.stream_id, RelayCommand::BeginFailed),
                    ));
                    return;
                }
            };

            match exit_circuit.reserve(relay.stream_id) {
                Some((from_circuit, stop)) => {
                    exit::spawn_stream(
                        node.registry.clone(),
                        exit_circuit,
                        inbound,
                        relay.stream_id,
                        host,
                        port,
                        from_circuit,
                        stop,
                        node.timeouts.dial,
                    );
                }
                None => {
                    warn!(
                        "relay {}: duplicate BEGIN for stream {} on {}",
                        node.agent, relay.stream_id, inbound
                    );
                    conn.enqueue(Cell::relay(
                        inbound.circuit,
                        RelayCell::control(relay.stream_id, RelayCommand::BeginFailed),
                    ));
                }
            }
        }

        RelayCommand::Data => {
            if !exit_circuit.deliver_data(relay.stream_id, relay.payload) {
                debug!(
                    "relay {}: DATA for unknown stream {} on {}",
                    node.agent, relay.stream_id, inbound
                );
            }
        }

        RelayCommand::End => {
            exit_circuit.remove(relay.stream_id);
        }

        RelayCommand::Extend => {
            match parse_extend_payload(&relay.payload) {
                Ok((host, port, target)) => {
                    // runs independently so a slow next hop cannot stall
                    // this connection's dispatch loop
                    let task_node = node.clone();
                    tokio::spawn(async move {
                        task_node
                            .handle_extend(inbound, relay.stream_id, host, port, target)
                            .await;
                    });
                }
                Err(e) => {
                    warn!(
                        "relay {}: malformed EXTEND on {}: {}",
                        node.agent, inbound, e
                    );
                    conn.enqueue(Cell::relay(
                        inbound.circuit,
                        RelayCell::control(relay.stream_id, RelayCommand::ExtendFailed),
                    ));
                }
            }
        }

        RelayCommand::Connected
        | RelayCommand::BeginFailed
        | RelayCommand::Extended
        | RelayCommand::ExtendFailed => {
            debug!(
                "relay {}: unexpected {:?} at terminal hop {}",
                node.agent, relay.command, inbound
            );
        }
    }
}
