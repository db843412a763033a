/// Connection tracking for the relay overlay
///
/// A `Connection` wraps one byte-stream socket to a peer relay; the
/// `ConnRegistry` owns the set of live connections, their writer tasks,
/// and the AgentId lookup used to reuse links during circuit extension.

mod connection;
mod exchange;
mod registry;

pub use connection::{ConnId, Connection};
pub use exchange::{Exchange, ExchangeError, ExchangeTicket};
pub use registry::ConnRegistry;
