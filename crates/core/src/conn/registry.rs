/// Registry of live relay-to-relay connections
///
/// Owns the ConnId and AgentId maps, spawns the writer task that drains
/// each connection's outbound FIFO, and is the single place connections
/// are torn down. Deregistration is idempotent; cells queued for a
/// deregistered connection are discarded.

use super::connection::{ConnId, Connection};
use crate::cell::Cell;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};
use veilnet_common::config::protocol::WRITE_FIFO_DEPTH;
use veilnet_common::AgentId;

#[derive(Default)]
struct Inner {
    by_id: HashMap<ConnId, Arc<Connection>>,
    by_agent: HashMap<AgentId, ConnId>,
}

pub struct ConnRegistry {
    inner: StdMutex<Inner>,
    next_id: AtomicU64,
}

impl ConnRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: StdMutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Register a new connection around the write half of its socket and
    /// spawn the writer task draining its FIFO.
    pub fn register<W>(self: &Arc<Self>, write_half: W, initiated: bool) -> Arc<Connection>
    where
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let id = ConnId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let (tx, rx) = mpsc::channel(WRITE_FIFO_DEPTH);
        let conn = Arc::new(Connection::new(id, initiated, tx));

        self.inner
            .lock()
            .expect("registry lock poisoned")
            .by_id
            .insert(id, conn.clone());

        let registry = self.clone();
        let writer_conn = conn.clone();
        tokio::spawn(async move {
            run_writer(writer_conn.clone(), write_half, rx).await;
            // a dead writer means a dead connection
            registry.deregister(&writer_conn);
        });

        debug!("{}: registered (initiated={})", id, initiated);
        conn
    }

    /// Remove a connection and release its resources. Safe to call more
    /// than once; later calls are no-ops.
    pub fn deregister(&self, conn: &Arc<Connection>) {
        let removed = {
            let mut inner = self.inner.lock().expect("registry lock poisoned");
            let removed = inner.by_id.remove(&conn.id()).is_some();
            if let Some(agent) = conn.peer_agent() {
                if inner.by_agent.get(&agent) == Some(&conn.id()) {
                    inner.by_agent.remove(&agent);
                }
            }
            removed
        };

        // mark_closed wakes the reader and writer and fails any pending
        // exchange; it must happen even if the maps were already clean
        conn.mark_closed();

        if removed {
            debug!("{}: deregistered", conn.id());
        }
    }

    /// Record which agent answers on this connection. First binding wins;
    /// a second connection to the same agent stays reachable by ConnId
    /// only.
    pub fn bind_agent(&self, conn: &Arc<Connection>, agent: AgentId) {
        conn.bind_peer(agent);
        let mut inner = self.inner.lock().expect("registry lock poisoned");
        inner.by_agent.entry(agent).or_insert_with(|| conn.id());
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.inner
            .lock()
            .expect("registry lock poisoned")
            .by_id
            .get(&id)
            .cloned()
    }

    /// Find an already-open connection to the given agent.
    pub fn lookup_agent(&self, agent: AgentId) -> Option<Arc<Connection>> {
        let inner = self.inner.lock().expect("registry lock poisoned");
        let id = inner.by_agent.get(&agent)?;
        inner.by_id.get(id).cloned()
    }

    /// Queue a cell toward a connection by id. A missing connection is
    /// logged and the cell dropped.
    pub fn enqueue_write(&self, id: ConnId, cell: Cell) {
        match self.get(id) {
            Some(conn) => conn.enqueue(cell),
            None => debug!("{}: dropping cell for deregistered connection", id),
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().expect("registry lock poisoned").by_id.len()
    }
}

/// Drain the outbound FIFO onto the socket until the connection closes or
/// the socket fails.
async fn run_writer<W>(conn: Arc<Connection>, mut write_half: W, mut rx: mpsc::Receiver<Cell>)
where
    W: AsyncWrite + Unpin,
{
    loop {
        let cell = tokio::select! {
            biased;
            _ = conn.wait_closed() => break,
            cell = rx.recv() => match cell {
                Some(cell) => cell,
                None => break,
            },
        };

        let wire = match cell.encode() {
            Ok(wire) => wire,
            Err(e) => {
                warn!("{}: refusing to send unencodable cell: {}", conn.id(), e);
                continue;
            }
        };

        if let Err(e) = write_half.write_all(&wire).await {
            debug!("{}: write failed: {}", conn.id(), e);
            break;
        }
    }

    // flush cells queued before the close signal; enqueue refuses new
    // ones once the connection is marked closed
    while let Ok(cell) = rx.try_recv() {
        let Ok(wire) = cell.encode() else { continue };
        if write_half.write_all(&wire).await.is_err() {
            break;
        }
    }

    let _ = write_half.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::{CellBody, CELL_LEN};
    use std::time::Duration;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn test_writer_drains_fifo() {
        let registry = ConnRegistry::new();
        let (ours, mut theirs) = tokio::io::duplex(4 * CELL_LEN);

        let conn = registry.register(ours, true);
        conn.enqueue(Cell::new(7, CellBody::Create));
        conn.enqueue(Cell::new(7, CellBody::Destroy));

        let mut buf = [0u8; 2 * CELL_LEN];
        theirs.read_exact(&mut buf).await.unwrap();

        assert_eq!(
            Cell::decode(&buf[..CELL_LEN]).unwrap(),
            Cell::new(7, CellBody::Create)
        );
        assert_eq!(
            Cell::decode(&buf[CELL_LEN..]).unwrap(),
            Cell::new(7, CellBody::Destroy)
        );
    }

    #[tokio::test]
    async fn test_deregister_is_idempotent() {
        let registry = ConnRegistry::new();
        let (ours, _theirs) = tokio::io::duplex(CELL_LEN);

        let conn = registry.register(ours, false);
        assert_eq!(registry.connection_count(), 1);

        registry.deregister(&conn);
        registry.deregister(&conn);
        assert_eq!(registry.connection_count(), 0);
        assert!(conn.is_closed());

        // enqueue after deregistration must not panic
        registry.enqueue_write(conn.id(), Cell::new(1, CellBody::Create));
    }

    #[tokio::test]
    async fn test_agent_binding_and_lookup() {
        let registry = ConnRegistry::new();
        let (ours, _theirs) = tokio::io::duplex(CELL_LEN);
        let agent = AgentId::new(4, 2);

        let conn = registry.register(ours, true);
        assert!(registry.lookup_agent(agent).is_none());

        registry.bind_agent(&conn, agent);
        assert_eq!(conn.peer_agent(), Some(agent));
        assert_eq!(registry.lookup_agent(agent).unwrap().id(), conn.id());

        registry.deregister(&conn);
        assert!(registry.lookup_agent(agent).is_none());
    }

    #[tokio::test]
    async fn test_writer_death_deregisters() {
        let registry = ConnRegistry::new();
        let (ours, theirs) = tokio::io::duplex(CELL_LEN);

        let conn = registry.register(ours, true);
        drop(theirs);

        // writer hits the broken pipe and deregisters the connection
        conn.enqueue(Cell::new(1, CellBody::Create));
        conn.enqueue(Cell::new(2, CellBody::Create));

        tokio::time::timeout(Duration::from_secs(1), conn.wait_closed())
            .await
            .expect("connection never closed");
        assert_eq!(registry.connection_count(), 0);
    }
}
