//! Overlay engine: the fixed-size cell protocol, relay-side forwarding,
//! and client-side circuit construction and streams.
//!
//! The daemon crate wires these pieces into runnable relay and client
//! processes; everything here is plain library code driven by a tokio
//! runtime.

pub mod cell;
pub mod circuit;
pub mod conn;
pub mod directory;
pub mod relay;

pub use cell::{Cell, CellBody, CellError, RelayCell, RelayCommand, CELL_LEN};
pub use circuit::{BuildError, CircuitInitiator, CircuitStream, OriginCircuit, StreamError};
pub use conn::{ConnId, ConnRegistry, Connection};
pub use directory::{Directory, DirectoryError, DirectoryServer, JsonDirectory, RelayDescriptor};
pub use relay::{RelayNode, RelayStats};
