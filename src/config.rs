//! Engine Configuration
//!
//! Endpoint URLs and timing knobs for the telemetry engine.

use std::time::Duration;

const DEFAULT_API_URL: &str = "http://localhost:3000";
const DEFAULT_SOCKET_URL: &str = "ws://localhost:3000";

/// Runtime configuration for the telemetry engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Base URL for the REST API.
    pub api_base_url: String,
    /// URL of the realtime ingestion channel.
    pub socket_url: String,
    /// Timeout applied to each REST request.
    pub request_timeout: Duration,
    /// Timeout for a single realtime connect attempt.
    pub connect_timeout: Duration,
    /// Initial delay before a reconnect attempt.
    pub reconnect_initial_delay: Duration,
    /// Upper bound on the reconnect delay.
    pub reconnect_max_delay: Duration,
    /// Cadence of the continuous reporting loop.
    pub report_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_URL.to_string(),
            socket_url: DEFAULT_SOCKET_URL.to_string(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(20),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(5),
            report_interval: Duration::from_secs(15),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from the environment, falling back to defaults.
    ///
    /// `LOCTRACK_API_URL` and `LOCTRACK_SOCKET_URL` override the endpoints.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Ok(url) = std::env::var("LOCTRACK_API_URL") {
            config.api_base_url = url;
        }
        if let Ok(url) = std::env::var("LOCTRACK_SOCKET_URL") {
            config.socket_url = url;
        }
        config
    }
}
