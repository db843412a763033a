/// Client-side state for a circuit this node originated
///
/// The origin's first-hop connection reader sees every RELAY cell coming
/// back down the circuit; this type demultiplexes them to local stream
/// handles and to the single outstanding EXTEND, which travels on the
/// reserved stream id 0.

use super::extend::ExtendError;
use super::stream::{CircuitStream, StreamError};
use crate::cell::{extend_payload, begin_payload, Cell, CellBody, RelayCell, RelayCommand};
use crate::conn::ConnRegistry;
use crate::relay::routing::{Hop, HopTable};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, warn};
use veilnet_common::{AgentId, ProtocolTimeouts};

/// Stream id carrying circuit-level EXTEND round-trips.
pub const CONTROL_STREAM_ID: u16 = 0;

/// What a local stream handle hears from the circuit
#[derive(Debug, PartialEq, Eq)]
pub enum StreamEvent {
    Connected,
    Refused,
    Data(Vec<u8>),
    End,
}

pub struct OriginCircuit {
    hop: Hop,
    registry: Arc<ConnRegistry>,
    hops: Arc<HopTable>,
    timeouts: ProtocolTimeouts,
    control: StdMutex<Option<oneshot::Sender<bool>>>,
    streams: StdMutex<HashMap<u16, mpsc::UnboundedSender<StreamEvent>>>,
    next_stream: StdMutex<u16>,
    closed: AtomicBool,
}

impl OriginCircuit {
    pub(crate) fn new(
        hop: Hop,
        registry: Arc<ConnRegistry>,
        hops: Arc<HopTable>,
        timeouts: ProtocolTimeouts,
    ) -> Arc<Self> {
        Arc::new(Self {
            hop,
            registry,
            hops,
            timeouts,
            control: StdMutex::new(None),
            streams: StdMutex::new(HashMap::new()),
            next_stream: StdMutex::new(1),
            closed: AtomicBool::new(false),
        })
    }

    pub fn circuit_id(&self) -> u16 {
        self.hop.circuit
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("origin streams poisoned").len()
    }

    /// Route a RELAY cell arriving on the first hop to its consumer.
    pub(crate) fn deliver(&self, relay: RelayCell) {
        match relay.command {
            RelayCommand::Extended => self.complete_control(true),
            RelayCommand::ExtendFailed => self.complete_control(false),
            RelayCommand::Connected => self.stream_event(relay.stream_id, StreamEvent::Connected),
            RelayCommand::BeginFailed => self.stream_event(relay.stream_id, StreamEvent::Refused),
            RelayCommand::Data => {
                self.stream_event(relay.stream_id, StreamEvent::Data(relay.payload))
            }
            RelayCommand::End => {
                self.stream_event(relay.stream_id, StreamEvent::End);
                self.remove_stream(relay.stream_id);
            }
            RelayCommand::Begin | RelayCommand::Extend => {
                warn!(
                    "origin circuit {}: unexpected {:?} from the network",
                    self.hop, relay.command
                );
            }
        }
    }

    fn stream_event(&self, stream_id: u16, event: StreamEvent) {
        let streams = self.streams.lock().expect("origin streams poisoned");
        match streams.get(&stream_id) {
            Some(tx) => {
                let _ = tx.send(event);
            }
            None => debug!(
                "origin circuit {}: event for unknown stream {}",
                self.hop, stream_id
            ),
        }
    }

    fn complete_control(&self, ok: bool) {
        let sender = self.control.lock().expect("origin control poisoned").take();
        match sender {
            Some(tx) => {
                let _ = tx.send(ok);
            }
            None => debug!(
                "origin circuit {}: stale extension response discarded",
                self.hop
            ),
        }
    }

    pub(crate) fn remove_stream(&self, stream_id: u16) {
        self.streams
            .lock()
            .expect("origin streams poisoned")
            .remove(&stream_id);
    }

    /// The circuit is gone (DESTROY received, or the first-hop connection
    /// died): every local consumer sees EOF.
    pub(crate) fn circuit_closed(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.control.lock().expect("origin control poisoned").take();
        let drained: Vec<mpsc::UnboundedSender<StreamEvent>> = {
            let mut streams = self.streams.lock().expect("origin streams poisoned");
            streams.drain().map(|(_, tx)| tx).collect()
        };
        for tx in drained {
            let _ = tx.send(StreamEvent::End);
        }
        debug!("origin circuit {}: closed", self.hop);
    }

    pub(crate) fn send_relay(&self, relay: RelayCell) {
        self.registry
            .enqueue_write(self.hop.conn, Cell::relay(self.hop.circuit, relay));
    }

    /// Ask the circuit's current terminal hop to extend to `agent` at
    /// `host:port` and await EXTENDED. One extension at a time; the
    /// initiator is the only caller.
    pub(crate) async fn request_extend(
        &self,
        host: &str,
        port: u16,
        agent: AgentId,
    ) -> Result<(), ExtendError> {
        if self.is_closed() {
            return Err(ExtendError::CircuitClosed);
        }

        let rx = {
            let mut control = self.control.lock().expect("origin control poisoned");
            if control.is_some() {
                return Err(ExtendError::Busy);
            }
            let (tx, rx) = oneshot::channel();
            *control = Some(tx);
            rx
        };

        self.send_relay(RelayCell::new(
            CONTROL_STREAM_ID,
            RelayCommand::Extend,
            extend_payload(host, port, agent),
        ));

        match timeout(self.timeouts.extend, rx).await {
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false)) => Err(ExtendError::Refused),
            Ok(Err(_)) => Err(ExtendError::CircuitClosed),
            Err(_) => {
                let _ = self.control.lock().expect("origin control poisoned").take();
                Err(ExtendError::Timeout)
            }
        }
    }

    /// Open an application stream to `host:port` through the circuit's
    /// terminal hop.
    pub async fn open_stream(
        self: &Arc<Self>,
        host: &str,
        port: u16,
    ) -> Result<CircuitStream, StreamError> {
        if self.is_closed() {
            return Err(StreamError::Closed);
        }

        let allocated = {
            let mut streams = self.streams.lock().expect("origin streams poisoned");
            let mut next = self.next_stream.lock().expect("origin stream id poisoned");
            let mut candidate = *next;
            // one full wrap of the id space at most
            let mut scanned: u32 = 0;
            loop {
                if candidate != CONTROL_STREAM_ID && !streams.contains_key(&candidate) {
                    break;
                }
                candidate = candidate.wrapping_add(1);
                scanned += 1;
                if scanned > u16::MAX as u32 {
                    break;
                }
            }
            if scanned > u16::MAX as u32 {
                None
            } else {
                *next = candidate.wrapping_add(1);
                let (tx, rx) = mpsc::unbounded_channel();
                streams.insert(candidate, tx);
                Some((candidate, rx))
            }
        };
        let (stream_id, mut rx) = match allocated {
            Some(slot) => slot,
            None => return Err(StreamError::Exhausted),
        };

        self.send_relay(RelayCell::new(
            stream_id,
            RelayCommand::Begin,
            begin_payload(host, port),
        ));

        match timeout(self.timeouts.begin, rx.recv()).await {
            Ok(Some(StreamEvent::Connected)) => {
                Ok(CircuitStream::new(self.clone(), stream_id, rx))
            }
            Ok(Some(StreamEvent::Refused)) => {
                self.remove_stream(stream_id);
                Err(StreamError::Refused)
            }
            Ok(Some(StreamEvent::End)) | Ok(None) => {
                self.remove_stream(stream_id);
                Err(StreamError::Closed)
            }
            Ok(Some(StreamEvent::Data(_))) => {
                // data before CONNECTED is a protocol violation
                self.remove_stream(stream_id);
                Err(StreamError::Closed)
            }
            Err(_) => {
                self.remove_stream(stream_id);
                Err(StreamError::Timeout)
            }
        }
    }

    /// Tear the circuit down from the client side: DESTROY toward the
    /// first hop, then fail every local consumer.
    pub fn destroy(&self) {
        if self.is_closed() {
            return;
        }
        self.hops.remove(self.hop);
        self.registry
            .enqueue_write(self.hop.conn, Cell::new(self.hop.circuit, CellBody::Destroy));
        self.circuit_closed();
    }
}

impl std::fmt::Debug for OriginCircuit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OriginCircuit")
            .field("hop", &self.hop)
            .field("streams", &self.stream_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}
