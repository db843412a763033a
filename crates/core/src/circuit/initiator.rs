/// Circuit construction from the client side
///
/// Picks relays from the directory, creates the first segment itself, and
/// extends hop by hop through the growing circuit. Relays that fail to
/// answer are skipped; a build that runs out of candidates is retried
/// against a fresh directory fetch.

use super::origin::OriginCircuit;
use crate::directory::{Directory, DirectoryError, RelayDescriptor};
use crate::relay::node::RelayNode;
use crate::relay::routing::Hop;
use rand::seq::SliceRandom;
use std::sync::Arc;
use tracing::{debug, info, warn};
use veilnet_common::config::routing::{MAX_BUILD_ATTEMPTS, MAX_CIRCUIT_LENGTH};

/// Why a circuit could not be built
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error(transparent)]
    Directory(#[from] DirectoryError),

    #[error("invalid circuit length {0}")]
    Length(usize),

    #[error("not enough usable relays to build the circuit")]
    Exhausted,
}

pub struct CircuitInitiator<D: Directory> {
    node: Arc<RelayNode>,
    directory: Arc<D>,
    name_prefix: String,
}

impl<D: Directory> CircuitInitiator<D> {
    pub fn new(node: Arc<RelayNode>, directory: Arc<D>, name_prefix: impl Into<String>) -> Self {
        Self {
            node,
            directory,
            name_prefix: name_prefix.into(),
        }
    }

    /// Build a circuit through `length` relays. Failed candidates are
    /// skipped within an attempt; an exhausted attempt re-polls the
    /// directory up to the attempt limit.
    pub async fn build(&self, length: usize) -> Result<Arc<OriginCircuit>, BuildError> {
        if length == 0 || length > MAX_CIRCUIT_LENGTH {
            return Err(BuildError::Length(length));
        }

        let mut last_err = BuildError::Exhausted;
        for attempt in 1..=MAX_BUILD_ATTEMPTS {
            let mut candidates = self.directory.fetch(&self.name_prefix).await?;
            candidates.retain(|r| r.agent != self.node.agent());
            candidates.shuffle(&mut rand::thread_rng());
            debug!(
                "circuit build attempt {}/{}: {} candidates",
                attempt,
                MAX_BUILD_ATTEMPTS,
                candidates.len()
            );

            match self.try_build(candidates, length).await {
                Ok(circuit) => {
                    info!(
                        "built {}-hop circuit {} on {}",
                        length,
                        circuit.circuit_id(),
                        self.node.agent()
                    );
                    return Ok(circuit);
                }
                Err(e) => {
                    warn!("circuit build attempt {} failed: {}", attempt, e);
                    last_err = e;
                }
            }
        }
        Err(last_err)
    }

    async fn try_build(
        &self,
        mut candidates: Vec<RelayDescriptor>,
        length: usize,
    ) -> Result<Arc<OriginCircuit>, BuildError> {
        // first segment: this node speaks OPEN/CREATE itself
        let origin = loop {
            let relay = candidates.pop().ok_or(BuildError::Exhausted)?;
            match self
                .node
                .open_and_create(&relay.host, relay.port, relay.agent)
                .await
            {
                Ok((conn, circuit)) => {
                    let hop = Hop::new(conn.id(), circuit);
                    let origin = OriginCircuit::new(
                        hop,
                        self.node.registry().clone(),
                        self.node.hops().clone(),
                        self.node.timeouts(),
                    );
                    if !self.node.hops().install_origin(hop, origin.clone()) {
                        warn!("hop {} already occupied, abandoning segment", hop);
                        origin.destroy();
                        return Err(BuildError::Exhausted);
                    }
                    debug!("first hop {} via {}", hop, relay);
                    break origin;
                }
                Err(e) => {
                    warn!("first hop {} unusable: {}", relay, e);
                }
            }
        };

        // remaining hops: the current terminal relay does the work
        for _ in 1..length {
            let extended = loop {
                let Some(relay) = candidates.pop() else {
                    break false;
                };
                match origin
                    .request_extend(&relay.host, relay.port, relay.agent)
                    .await
                {
                    Ok(()) => {
                        debug!("extended circuit {} to {}", origin.circuit_id(), relay);
                        break true;
                    }
                    Err(e) => {
                        warn!("extension to {} failed: {}", relay, e);
                        if origin.is_closed() {
                            return Err(BuildError::Exhausted);
                        }
                    }
                }
            };
            if !extended {
                origin.destroy();
                return Err(BuildError::Exhausted);
            }
        }

        Ok(origin)
    }
}
