/// A relay node: shared state plus the accept loop
///
/// Each node is simultaneously a server to previous hops and a client to
/// next hops. The registry and the hop table are the only state shared
/// across its connection tasks.

use super::reader::run_connection;
use super::routing::{Hop, HopEntry, HopTable};
use crate::cell::{Cell, CellBody};
use crate::conn::{ConnRegistry, Connection};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use veilnet_common::{AgentId, ProtocolTimeouts, Result};

pub struct RelayNode {
    pub(crate) agent: AgentId,
    pub(crate) registry: Arc<ConnRegistry>,
    pub(crate) hops: Arc<HopTable>,
    pub(crate) timeouts: ProtocolTimeouts,
}

/// Point-in-time counters for the status API
#[derive(Debug, Clone, Serialize)]
pub struct RelayStats {
    pub agent: String,
    pub connections: usize,
    pub hops: usize,
}

impl RelayNode {
    pub fn new(agent: AgentId) -> Arc<Self> {
        Self::with_timeouts(agent, ProtocolTimeouts::default())
    }

    pub fn with_timeouts(agent: AgentId, timeouts: ProtocolTimeouts) -> Arc<Self> {
        Arc::new(Self {
            agent,
            registry: ConnRegistry::new(),
            hops: Arc::new(HopTable::new()),
            timeouts,
        })
    }

    pub fn agent(&self) -> AgentId {
        self.agent
    }

    pub fn registry(&self) -> &Arc<ConnRegistry> {
        &self.registry
    }

    pub fn hops(&self) -> &Arc<HopTable> {
        &self.hops
    }

    pub fn timeouts(&self) -> ProtocolTimeouts {
        self.timeouts
    }

    pub fn stats(&self) -> RelayStats {
        RelayStats {
            agent: self.agent.to_string(),
            connections: self.registry.connection_count(),
            hops: self.hops.len(),
        }
    }

    /// Bind the relay listener and spawn the accept loop. Returns the
    /// bound address (useful with port 0) and the loop's join handle.
    pub async fn listen(
        self: &Arc<Self>,
        addr: &str,
    ) -> Result<(SocketAddr, JoinHandle<()>)> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("relay {} listening on {}", self.agent, local_addr);

        let node = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                let (socket, peer_addr) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!("relay {}: accept failed: {}", node.agent, e);
                        continue;
                    }
                };
                debug!("relay {}: inbound connection from {}", node.agent, peer_addr);
                let _ = socket.set_nodelay(true);

                let (read_half, write_half) = socket.into_split();
                let conn = node.registry.register(write_half, false);
                tokio::spawn(run_connection(node.clone(), conn, read_half));
            }
        });

        Ok((local_addr, handle))
    }

    /// Tear down a connection: stop its tasks, fail its pending exchange,
    /// and dismantle every circuit that used it, propagating DESTROY to
    /// the surviving neighbors.
    pub(crate) fn teardown_connection(&self, conn: &Arc<Connection>) {
        self.registry.deregister(conn);
        for (hop, entry) in self.hops.remove_connection(conn.id()) {
            debug!("relay {}: dropping {} ({:?})", self.agent, hop, entry);
            self.drop_entry(entry, true);
        }
    }

    /// Dismantle what an inbound hop mapped to. For a forwarding entry the
    /// reverse mapping goes too, and DESTROY is sent toward the far
    /// neighbor when `propagate` is set.
    pub(crate) fn drop_entry(&self, entry: HopEntry, propagate: bool) {
        match entry {
            HopEntry::Forward(next) => {
                self.hops.remove(next);
                if propagate {
                    self.registry
                        .enqueue_write(next.conn, Cell::new(next.circuit, CellBody::Destroy));
                }
            }
            HopEntry::Exit(exit) => exit.shutdown(),
            HopEntry::Origin(origin) => origin.circuit_closed(),
        }
    }

    /// Handle DESTROY for an inbound hop.
    pub(crate) fn destroy_circuit(&self, hop: Hop) {
        match self.hops.remove(hop) {
            Some(entry) => {
                debug!("relay {}: DESTROY tears down {} ({:?})", self.agent, hop, entry);
                self.drop_entry(entry, true);
            }
            None => debug!("relay {}: DESTROY for unknown {}", self.agent, hop),
        }
    }
}

impl std::fmt::Debug for RelayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayNode")
            .field("agent", &self.agent)
            .field("connections", &self.registry.connection_count())
            .field("hops", &self.hops.len())
            .finish()
    }
}
