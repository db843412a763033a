/// API response bodies

use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub agent: String,
    pub version: String,
    pub connections: usize,
    pub hops: usize,
    pub uptime_secs: u64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
}
