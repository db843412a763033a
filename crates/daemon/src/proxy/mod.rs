/// Proxy front-end for routing web traffic through the overlay
///
/// Applications point an ordinary HTTP proxy setting at this listener;
/// each proxied request becomes a stream on the client's circuit.

mod http;

pub use http::HttpProxy;
