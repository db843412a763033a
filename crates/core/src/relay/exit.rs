/// Terminal-hop stream multiplexing
///
/// When this relay is a circuit's last hop, RELAY cells carry application
/// streams. Each stream owns a TCP connection to the ultimate destination:
/// a writer task drains DATA payloads toward the destination, and a reader
/// task chunks destination bytes back into DATA cells toward the circuit.

use crate::cell::{Cell, RelayCell, RelayCommand, RELAY_PAYLOAD_MAX};
use crate::conn::ConnRegistry;
use crate::relay::routing::Hop;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::time::timeout;
use tracing::{debug, warn};

struct ExitStream {
    to_dest: mpsc::UnboundedSender<Vec<u8>>,
    stop: Arc<Notify>,
}

/// Stream table for one terminal-hop circuit
pub struct ExitCircuit {
    streams: StdMutex<HashMap<u16, ExitStream>>,
}

impl ExitCircuit {
    pub(crate) fn new() -> Self {
        Self {
            streams: StdMutex::new(HashMap::new()),
        }
    }

    /// Reserve a stream id before the destination dial starts, so a
    /// duplicate BEGIN fails deterministically even while the dial is in
    /// flight. Returns None when the id is already taken.
    pub(crate) fn reserve(
        &self,
        stream_id: u16,
    ) -> Option<(mpsc::UnboundedReceiver<Vec<u8>>, Arc<Notify>)> {
        let mut streams = self.streams.lock().expect("exit stream lock poisoned");
        if streams.contains_key(&stream_id) {
            return None;
        }
        let (tx, rx) = mpsc::unbounded_channel();
        let stop = Arc::new(Notify::new());
        streams.insert(
            stream_id,
            ExitStream {
                to_dest: tx,
                stop: stop.clone(),
            },
        );
        Some((rx, stop))
    }

    /// Push DATA payload toward the stream's destination socket.
    pub(crate) fn deliver_data(&self, stream_id: u16, payload: Vec<u8>) -> bool {
        let streams = self.streams.lock().expect("exit stream lock poisoned");
        match streams.get(&stream_id) {
            Some(stream) => stream.to_dest.send(payload).is_ok(),
            None => false,
        }
    }

    /// Drop a stream, closing its destination socket. Returns false when
    /// the stream was not present.
    pub(crate) fn remove(&self, stream_id: u16) -> bool {
        let removed = self
            .streams
            .lock()
            .expect("exit stream lock poisoned")
            .remove(&stream_id);
        match removed {
            Some(stream) => {
                // notify_one stores a permit, so the destination reader
                // sees the stop even if it is not parked on the Notify
                // at this instant
                stream.stop.notify_one();
                true
            }
            None => false,
        }
    }

    /// Tear down every stream on this circuit (DESTROY or connection loss).
    pub(crate) fn shutdown(&self) {
        let drained: Vec<ExitStream> = {
            let mut streams = self.streams.lock().expect("exit stream lock poisoned");
            streams.drain().map(|(_, s)| s).collect()
        };
        for stream in drained {
            stream.stop.notify_one();
        }
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().expect("exit stream lock poisoned").len()
    }
}

/// Dial the destination for a freshly reserved stream and, on success,
/// run the bidirectional relay. Answers CONNECTED or BEGIN_FAILED toward
/// the circuit.
pub(crate) fn spawn_stream(
    registry: Arc<ConnRegistry>,
    exit: Arc<ExitCircuit>,
    back: Hop,
    stream_id: u16,
    host: String,
    port: u16,
    from_circuit: mpsc::UnboundedReceiver<Vec<u8>>,
    stop: Arc<Notify>,
    dial_timeout: Duration,
) {
    tokio::spawn(async move {
        let dialed = timeout(dial_timeout, TcpStream::connect((host.as_str(), port))).await;
        let socket = match dialed {
            Ok(Ok(socket)) => socket,
            Ok(Err(e)) => {
                debug!("stream {} on {}: dial {}:{} failed: {}", stream_id, back, host, port, e);
                exit.remove(stream_id);
                registry.enqueue_write(
                    back.conn,
                    Cell::relay(back.circuit, RelayCell::control(stream_id, RelayCommand::BeginFailed)),
                );
                return;
            }
            Err(_) => {
                debug!("stream {} on {}: dial {}:{} timed out", stream_id, back, host, port);
                exit.remove(stream_id);
                registry.enqueue_write(
                    back.conn,
                    Cell::relay(back.circuit, RelayCell::control(stream_id, RelayCommand::BeginFailed)),
                );
                return;
            }
        };

        let _ = socket.set_nodelay(true);
        debug!("stream {} on {}: connected to {}:{}", stream_id, back, host, port);
        registry.enqueue_write(
            back.conn,
            Cell::relay(back.circuit, RelayCell::control(stream_id, RelayCommand::Connected)),
        );

        let (read_half, write_half) = socket.into_split();
        tokio::spawn(run_dest_writer(write_half, from_circuit));
        run_dest_reader(registry, exit, back, stream_id, read_half, stop).await;
    });
}

/// Drain circuit DATA payloads onto the destination socket.
async fn run_dest_writer(
    mut write_half: tokio::net::tcp::OwnedWriteHalf,
    mut from_circuit: mpsc::UnboundedReceiver<Vec<u8>>,
) {
    while let Some(payload) = from_circuit.recv().await {
        if let Err(e) = write_half.write_all(&payload).await {
            debug!("destination write failed: {}", e);
            break;
        }
    }
    let _ = write_half.shutdown().await;
}

/// Chunk destination bytes into DATA cells toward the circuit until the
/// destination closes or the stream is removed.
async fn run_dest_reader(
    registry: Arc<ConnRegistry>,
    exit: Arc<ExitCircuit>,
    back: Hop,
    stream_id: u16,
    mut read_half: tokio::net::tcp::OwnedReadHalf,
    stop: Arc<Notify>,
) {
    let mut buf = vec![0u8; RELAY_PAYLOAD_MAX];
    loop {
        let read = tokio::select! {
            _ = stop.notified() => return,
            read = read_half.read(&mut buf) => read,
        };

        match read {
            Ok(0) => break,
            Ok(n) => {
                registry.enqueue_write(
                    back.conn,
                    Cell::relay(
                        back.circuit,
                        RelayCell::new(stream_id, RelayCommand::Data, buf[..n].to_vec()),
                    ),
                );
            }
            Err(e) => {
                warn!("stream {} on {}: destination read failed: {}", stream_id, back, e);
                break;
            }
        }
    }

    // destination side went away first: tell the circuit and forget the
    // stream
    if exit.remove(stream_id) {
        registry.enqueue_write(
            back.conn,
            Cell::relay(back.circuit, RelayCell::control(stream_id, RelayCommand::End)),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conn::ConnId;

    #[tokio::test]
    async fn test_stop_before_reader_waits_still_terminates() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        // keep the server side open so the read never sees EOF
        let (_server, _) = listener.accept().await.unwrap();

        let exit = Arc::new(ExitCircuit::new());
        let (_rx, stop) = exit.reserve(5).unwrap();
        // stream removed before the reader ever parks on the stop signal
        assert!(exit.remove(5));

        let (read_half, _write_half) = client.into_split();
        let reader = run_dest_reader(
            ConnRegistry::new(),
            exit,
            Hop::new(ConnId(1), 2),
            5,
            read_half,
            stop,
        );
        timeout(Duration::from_millis(500), reader).await.unwrap();
    }

    #[test]
    fn test_reserve_rejects_duplicates() {
        let exit = ExitCircuit::new();
        assert!(exit.reserve(4).is_some());
        assert!(exit.reserve(4).is_none());
        assert_eq!(exit.stream_count(), 1);

        assert!(exit.remove(4));
        assert!(!exit.remove(4));
        assert!(exit.reserve(4).is_some());
    }

    #[test]
    fn test_deliver_data_routes_to_stream() {
        let exit = ExitCircuit::new();
        let (mut rx, _stop) = exit.reserve(9).unwrap();

        assert!(exit.deliver_data(9, vec![1, 2, 3]));
        assert_eq!(rx.try_recv().unwrap(), vec![1, 2, 3]);

        assert!(!exit.deliver_data(77, vec![4]));
    }

    #[test]
    fn test_shutdown_clears_all_streams() {
        let exit = ExitCircuit::new();
        let (mut rx_a, _stop_a) = exit.reserve(1).unwrap();
        let (_rx_b, _stop_b) = exit.reserve(2).unwrap();

        exit.shutdown();
        assert_eq!(exit.stream_count(), 0);

        // senders are gone, so the writer side observes channel closure
        assert!(matches!(
            rx_a.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }
}
