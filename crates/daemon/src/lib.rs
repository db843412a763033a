/// Veilnet daemon library
///
/// Runnable pieces around the overlay engine: the HTTP proxy front-end
/// that feeds circuits, and the status API server.

pub mod api;
pub mod proxy;

pub use api::ApiServer;
pub use proxy::HttpProxy;
