//! Server configuration.

use std::time::Duration;

use hublink_store::StoreConfig;

/// Socket write limit when keepalive is disabled.
const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(30);

/// Relay + HTTP API configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// WebSocket relay bind address
    pub ws_bind_addr: String,
    /// HTTP API bind address
    pub http_bind_addr: String,
    /// Keepalive ping interval in seconds (0 disables keepalive)
    pub heartbeat_interval_secs: u64,
    /// Per-device history cap (None = unbounded)
    pub max_history: Option<usize>,
    /// WebSocket URL advertised by `/api/websocket/info`
    pub public_ws_url: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ws_bind_addr: "0.0.0.0:3001".to_string(),
            http_bind_addr: "0.0.0.0:3000".to_string(),
            heartbeat_interval_secs: 30,
            max_history: None,
            public_ws_url: None,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Option<Duration> {
        (self.heartbeat_interval_secs > 0).then(|| Duration::from_secs(self.heartbeat_interval_secs))
    }

    /// Longest a single socket write may block before the peer is treated
    /// as gone. Follows the heartbeat period.
    pub fn send_timeout(&self) -> Duration {
        self.heartbeat_interval().unwrap_or(DEFAULT_SEND_TIMEOUT)
    }

    pub fn store_config(&self) -> StoreConfig {
        StoreConfig {
            max_history: self.max_history,
        }
    }

    /// Advertised relay URL, derived from the bind address when not set.
    pub fn ws_url(&self) -> String {
        match &self.public_ws_url {
            Some(url) => url.clone(),
            None => {
                let addr = self.ws_bind_addr.replacen("0.0.0.0", "localhost", 1);
                format!("ws://{addr}")
            }
        }
    }
}
