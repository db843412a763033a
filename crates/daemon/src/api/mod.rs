/// Status API
///
/// A small HTTP surface for checking on a running node: liveness and
/// point-in-time relay counters.

mod handlers;
mod responses;
mod server;

pub use server::ApiServer;
