//! Relay-side engine: accept loop, per-connection dispatch, hop routing,
//! and terminal-hop stream handling.

pub mod exit;
pub mod node;
pub(crate) mod reader;
pub mod routing;

pub use exit::ExitCircuit;
pub use node::{RelayNode, RelayStats};
pub use routing::{Hop, HopEntry, HopTable};
