/// Client stream handle over a built circuit
///
/// The byte-stream abstraction the proxy front-end consumes: open is done
/// by [`OriginCircuit::open_stream`], writes become chunked DATA cells,
/// reads drain the per-stream event channel, close sends END.

use super::origin::{OriginCircuit, StreamEvent};
use crate::cell::{RelayCell, RelayCommand, RELAY_PAYLOAD_MAX};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

#[derive(Debug)]
pub struct CircuitStream {
    origin: Arc<OriginCircuit>,
    stream_id: u16,
    events: mpsc::UnboundedReceiver<StreamEvent>,
    eof: bool,
    ended: bool,
}

impl CircuitStream {
    pub(crate) fn new(
        origin: Arc<OriginCircuit>,
        stream_id: u16,
        events: mpsc::UnboundedReceiver<StreamEvent>,
    ) -> Self {
        Self {
            origin,
            stream_id,
            events,
            eof: false,
            ended: false,
        }
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Next chunk of destination bytes, or None at end of stream.
    pub async fn read(&mut self) -> Option<Vec<u8>> {
        if self.eof {
            return None;
        }
        loop {
            match self.events.recv().await {
                Some(StreamEvent::Data(payload)) => return Some(payload),
                Some(StreamEvent::End) | None => {
                    self.eof = true;
                    return None;
                }
                Some(StreamEvent::Connected) | Some(StreamEvent::Refused) => {
                    // late duplicates of the open handshake; ignore
                    continue;
                }
            }
        }
    }

    /// Send bytes toward the destination, chunked to the cell payload
    /// limit. Returns the number of bytes accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize, StreamError> {
        if self.origin.is_closed() || self.ended {
            return Err(StreamError::Closed);
        }
        for chunk in data.chunks(RELAY_PAYLOAD_MAX) {
            self.origin.send_relay(RelayCell::new(
                self.stream_id,
                RelayCommand::Data,
                chunk.to_vec(),
            ));
        }
        Ok(data.len())
    }

    /// Pump bytes both ways between this stream and a local socket until
    /// either side closes. Used by proxy front-ends.
    pub async fn tunnel<R, W>(&mut self, mut from_local: R, mut to_local: W)
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = vec![0u8; RELAY_PAYLOAD_MAX];
        loop {
            tokio::select! {
                read = from_local.read(&mut buf) => match read {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if self.origin.is_closed() {
                            break;
                        }
                        self.origin.send_relay(RelayCell::new(
                            self.stream_id,
                            RelayCommand::Data,
                            buf[..n].to_vec(),
                        ));
                    }
                },
                event = self.events.recv() => match event {
                    Some(StreamEvent::Data(payload)) => {
                        if to_local.write_all(&payload).await.is_err() {
                            break;
                        }
                    }
                    Some(StreamEvent::End) | None => break,
                    Some(StreamEvent::Connected) | Some(StreamEvent::Refused) => {}
                },
            }
        }
        let _ = to_local.shutdown().await;
    }

    /// Close the stream: END toward the exit, local bookkeeping dropped.
    pub fn close(&mut self) {
        if self.ended {
            return;
        }
        self.ended = true;
        if !self.origin.is_closed() {
            self.origin
                .send_relay(RelayCell::control(self.stream_id, RelayCommand::End));
        }
        self.origin.remove_stream(self.stream_id);
    }
}

impl Drop for CircuitStream {
    fn drop(&mut self) {
        self.close();
    }
}

/// Stream open/IO failures surfaced to the proxy front-end
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum StreamError {
    #[error("stream refused by the exit relay")]
    Refused,

    #[error("timed out opening the stream")]
    Timeout,

    #[error("no free stream id on the circuit")]
    Exhausted,

    #[error("circuit or stream already closed")]
    Closed,
}
