/// One live relay-to-relay connection
///
/// A connection owns the outbound cell FIFO (drained by a writer task the
/// registry spawns), the even/odd circuit-id allocator, the peer agent
/// identity once the handshake binds it, and the single exchange slot for
/// control round-trips.

use super::exchange::Exchange;
use crate::cell::Cell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tracing::{debug, warn};
use veilnet_common::AgentId;

/// Local identifier for a connection, used to key hop table entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

pub struct Connection {
    id: ConnId,

    /// True when this side dialed the socket. Decides circuit-id parity:
    /// the initiator allocates odd ids, the responder even, so the two
    /// peers' independent allocations cannot collide.
    initiated: bool,

    outbound: mpsc::Sender<Cell>,
    peer: StdMutex<Option<AgentId>>,
    next_circuit: StdMutex<u16>,
    exchange: Exchange,
    closed: AtomicBool,
    shutdown: Notify,
}

impl Connection {
    pub(crate) fn new(id: ConnId, initiated: bool, outbound: mpsc::Sender<Cell>) -> Self {
        Self {
            id,
            initiated,
            outbound,
            peer: StdMutex::new(None),
            next_circuit: StdMutex::new(if initiated { 3 } else { 2 }),
            exchange: Exchange::new(),
            closed: AtomicBool::new(false),
            shutdown: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnId {
        self.id
    }

    pub fn initiated(&self) -> bool {
        self.initiated
    }

    pub fn peer_agent(&self) -> Option<AgentId> {
        *self.peer.lock().expect("peer lock poisoned")
    }

    pub(crate) fn bind_peer(&self, agent: AgentId) {
        *self.peer.lock().expect("peer lock poisoned") = Some(agent);
    }

    pub fn exchange(&self) -> &Exchange {
        &self.exchange
    }

    /// Queue a cell for the writer task. Never blocks: a closed connection
    /// or a full FIFO drops the cell with a log line.
    pub fn enqueue(&self, cell: Cell) {
        if self.is_closed() {
            debug!("{}: dropping {:?} cell, connection closed", self.id, cell.body.command());
            return;
        }
        match self.outbound.try_send(cell) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Closed(cell)) => {
                debug!(
                    "{}: dropping {:?} cell, writer gone",
                    self.id,
                    cell.body.command()
                );
            }
            Err(mpsc::error::TrySendError::Full(cell)) => {
                warn!(
                    "{}: write FIFO full, dropping {:?} cell",
                    self.id,
                    cell.body.command()
                );
            }
        }
    }

    /// Hand out the next circuit id on this connection. Initiator ids are
    /// odd, responder ids even; both sequences skip the reserved values 0
    /// and 1 when they wrap.
    pub fn next_circuit_id(&self) -> u16 {
        let mut next = self.next_circuit.lock().expect("circuit id lock poisoned");
        let id = *next;
        *next = next.wrapping_add(2);
        if *next < 2 {
            *next = if self.initiated { 3 } else { 2 };
        }
        id
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark this connection dead: fail the pending exchange and wake the
    /// reader and writer tasks. Idempotent.
    pub(crate) fn mark_closed(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.exchange.fail_pending();
            self.shutdown.notify_waiters();
        }
    }

    /// Resolve once the connection has been marked closed.
    pub(crate) async fn wait_closed(&self) {
        loop {
            let notified = self.shutdown.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("initiated", &self.initiated)
            .field("peer", &self.peer_agent())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_conn(initiated: bool) -> (Connection, mpsc::Receiver<Cell>) {
        let (tx, rx) = mpsc::channel(8);
        (Connection::new(ConnId(1), initiated, tx), rx)
    }

    #[test]
    fn test_circuit_id_parity() {
        let (initiator, _rx) = test_conn(true);
        assert_eq!(initiator.next_circuit_id(), 3);
        assert_eq!(initiator.next_circuit_id(), 5);

        let (responder, _rx) = test_conn(false);
        assert_eq!(responder.next_circuit_id(), 2);
        assert_eq!(responder.next_circuit_id(), 4);
    }

    #[test]
    fn test_circuit_id_wrap_skips_reserved() {
        let (initiator, _rx) = test_conn(true);
        let mut seen_wrap = false;
        let mut prev = 0u16;
        for i in 0..40_000u32 {
            let id = initiator.next_circuit_id();
            assert!(id > 1, "reserved id {} handed out", id);
            assert_eq!(id % 2, 1);
            if i > 0 && id < prev {
                seen_wrap = true;
                assert_eq!(id, 3);
            }
            prev = id;
        }
        assert!(seen_wrap);
    }

    #[tokio::test]
    async fn test_enqueue_after_close_is_silent() {
        let (conn, mut rx) = test_conn(true);
        conn.enqueue(Cell::new(1, crate::cell::CellBody::Create));
        assert!(rx.recv().await.is_some());

        conn.mark_closed();
        conn.enqueue(Cell::new(2, crate::cell::CellBody::Create));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_wait_closed_wakes() {
        let (conn, _rx) = test_conn(false);
        let conn = std::sync::Arc::new(conn);

        let waiter = conn.clone();
        let handle = tokio::spawn(async move { waiter.wait_closed().await });

        tokio::task::yield_now().await;
        conn.mark_closed();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .expect("wait_closed never resolved")
            .unwrap();
    }
}
