//! Client-side circuit machinery: building circuits, extending them, and
//! multiplexing application streams over them.

pub mod extend;
pub mod initiator;
pub mod origin;
pub mod stream;

pub use extend::ExtendError;
pub use initiator::{BuildError, CircuitInitiator};
pub use origin::{OriginCircuit, StreamEvent};
pub use stream::{CircuitStream, StreamError};
