/// Single-slot request/response correlation for control cells
///
/// OPENED / OPEN_FAILED / CREATED / CREATE_FAILED carry no correlation id,
/// so at most one exchange may be in flight per connection: the next
/// control response on the wire answers the outstanding request. The
/// `gate` serializes would-be concurrent exchanges; the `slot` holds the
/// completion channel the connection reader fires.

use crate::cell::Cell;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, MutexGuard};
use tokio::time::timeout;

pub struct Exchange {
    gate: Mutex<()>,
    slot: StdMutex<Option<oneshot::Sender<Cell>>>,
}

impl Exchange {
    pub fn new() -> Self {
        Self {
            gate: Mutex::new(()),
            slot: StdMutex::new(None),
        }
    }

    /// Acquire exclusive use of this connection's exchange slot, waiting at
    /// most `wait` for any in-flight exchange to finish.
    pub async fn acquire(&self, wait: Duration) -> Result<ExchangeTicket<'_>, ExchangeError> {
        let guard = timeout(wait, self.gate.lock())
            .await
            .map_err(|_| ExchangeError::Busy)?;
        Ok(ExchangeTicket {
            exchange: self,
            _guard: guard,
        })
    }

    /// Deliver a control response to the outstanding exchange, if any.
    /// Returns false when no exchange is waiting (stale or duplicate
    /// response; the caller discards the cell).
    pub(crate) fn complete(&self, cell: Cell) -> bool {
        let sender = self.slot.lock().expect("exchange slot poisoned").take();
        match sender {
            Some(tx) => tx.send(cell).is_ok(),
            None => false,
        }
    }

    /// Fail the outstanding exchange, if any. Called on connection
    /// teardown so no waiter is left pending.
    pub(crate) fn fail_pending(&self) {
        let _ = self.slot.lock().expect("exchange slot poisoned").take();
    }

    fn arm(&self) -> oneshot::Receiver<Cell> {
        let (tx, rx) = oneshot::channel();
        *self.slot.lock().expect("exchange slot poisoned") = Some(tx);
        rx
    }

    fn disarm(&self) {
        let _ = self.slot.lock().expect("exchange slot poisoned").take();
    }
}

impl Default for Exchange {
    fn default() -> Self {
        Self::new()
    }
}

/// Exclusive access to a connection's exchange slot
pub struct ExchangeTicket<'a> {
    exchange: &'a Exchange,
    _guard: MutexGuard<'a, ()>,
}

impl ExchangeTicket<'_> {
    /// Arm the response slot, run `send` to put the request on the wire,
    /// and await the response for at most `wait`.
    ///
    /// The slot is armed before the request is sent so a fast response
    /// cannot race past the waiter.
    pub async fn roundtrip<F>(&mut self, send: F, wait: Duration) -> Result<Cell, ExchangeError>
    where
        F: FnOnce(),
    {
        let rx = self.exchange.arm();
        send();

        match timeout(wait, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(ExchangeError::ConnectionClosed),
            Err(_) => {
                self.exchange.disarm();
                Err(ExchangeError::Timeout)
            }
        }
    }
}

/// Exchange failures
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ExchangeError {
    #[error("another exchange is already in flight on this connection")]
    Busy,

    #[error("timed out waiting for the response cell")]
    Timeout,

    #[error("connection closed while awaiting response")]
    ConnectionClosed,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cell::CellBody;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_roundtrip_delivers_response() {
        let exchange = Arc::new(Exchange::new());
        let mut ticket = exchange.acquire(Duration::from_millis(50)).await.unwrap();

        let responder = exchange.clone();
        let reply = ticket
            .roundtrip(
                move || {
                    // simulate the reader delivering the response
                    assert!(responder.complete(Cell::new(5, CellBody::Created)));
                },
                Duration::from_millis(200),
            )
            .await
            .unwrap();

        assert_eq!(reply, Cell::new(5, CellBody::Created));
    }

    #[tokio::test]
    async fn test_complete_without_waiter_is_discarded() {
        let exchange = Exchange::new();
        assert!(!exchange.complete(Cell::new(1, CellBody::Created)));
    }

    #[tokio::test]
    async fn test_timeout_clears_slot() {
        let exchange = Exchange::new();
        {
            let mut ticket = exchange.acquire(Duration::from_millis(50)).await.unwrap();
            let err = ticket
                .roundtrip(|| {}, Duration::from_millis(20))
                .await
                .unwrap_err();
            assert_eq!(err, ExchangeError::Timeout);
        }

        // late response after timeout must find an empty slot
        assert!(!exchange.complete(Cell::new(1, CellBody::Created)));
    }

    #[tokio::test]
    async fn test_acquire_serializes() {
        let exchange = Exchange::new();
        let ticket = exchange.acquire(Duration::from_millis(50)).await.unwrap();

        let err = exchange.acquire(Duration::from_millis(50)).await;
        assert!(matches!(err, Err(ExchangeError::Busy)));

        drop(ticket);
        assert!(exchange.acquire(Duration::from_millis(50)).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_pending_resolves_waiter() {
        let exchange = Arc::new(Exchange::new());
        let mut ticket = exchange.acquire(Duration::from_millis(50)).await.unwrap();

        let closer = exchange.clone();
        let err = ticket
            .roundtrip(
                move || closer.fail_pending(),
                Duration::from_millis(500),
            )
            .await
            .unwrap_err();

        assert_eq!(err, ExchangeError::ConnectionClosed);
    }
}
