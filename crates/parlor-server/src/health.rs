//! `/health` endpoint.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Live WebSocket sessions, logged in or not.
    pub connections: usize,
    /// Distinct users with at least one session.
    pub online_users: usize,
    pub uptime_secs: u64,
}

pub fn health_check(start_time: Instant, connections: usize, online_users: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        connections,
        online_users,
        uptime_secs: start_time.elapsed().as_secs(),
    }
}
