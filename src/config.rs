//! Process-lifetime configuration, read once at startup.

use std::time::Duration;

use uuid::Uuid;

/// Agent version reported in heartbeats and job results.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Immutable agent settings derived from the environment.
///
/// There is no hot-reload: every field is fixed for the lifetime of the
/// process.
#[derive(Debug, Clone)]
pub struct Config {
    /// Control-plane base URL, without a trailing slash.
    pub api_url: String,
    /// Hostname announced in heartbeats and job results.
    pub hostname: String,
    /// Worker identity, minted fresh on every start.
    pub worker_id: Uuid,
    /// Delay between heartbeat transmissions.
    pub heartbeat_interval: Duration,
    /// Sleep between queue polling iterations.
    pub poll_interval: Duration,
    /// Extra sleep after a polling step fails over the network.
    pub network_retry_interval: Duration,
    /// Per-request transport timeout for every control-plane call.
    pub http_timeout: Duration,
}

impl Config {
    /// Build config from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let api_url = std::env::var("API_URL")
            .unwrap_or_else(|_| "http://localhost:5000".to_string());

        let hostname = std::env::var("HOSTNAME_OVERRIDE").unwrap_or_else(|_| os_hostname());

        Self {
            api_url: normalize_base_url(&api_url),
            hostname,
            worker_id: Uuid::new_v4(),
            heartbeat_interval: secs_from_env("HEARTBEAT_INTERVAL_SECS", 5),
            poll_interval: secs_from_env("QUEUE_POLL_INTERVAL_SECS", 5),
            network_retry_interval: secs_from_env("NETWORK_RETRY_INTERVAL_SECS", 30),
            http_timeout: secs_from_env("HTTP_TIMEOUT_SECS", 3),
        }
    }
}

fn secs_from_env(key: &str, default: u64) -> Duration {
    let secs = std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default);
    Duration::from_secs(secs)
}

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn os_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "unknown".to_string())
}
