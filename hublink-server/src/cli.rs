//! Command-line options. Every flag can also come from the environment.

use clap::Parser;
use hublink_relay::ServerConfig;

#[derive(Debug, Clone, Parser)]
#[command(name = "hublink", version, about = "Device relay and history API")]
pub struct Args {
    /// WebSocket relay port (on 0.0.0.0)
    #[arg(long, env = "WS_PORT", default_value_t = 3001)]
    pub ws_port: u16,

    /// Full WebSocket bind address, overrides --ws-port
    #[arg(long, env = "WS_BIND")]
    pub ws_bind: Option<String>,

    /// HTTP API port (on 0.0.0.0)
    #[arg(long, env = "PORT", default_value_t = 3000)]
    pub port: u16,

    /// Full HTTP bind address, overrides --port
    #[arg(long, env = "HTTP_BIND")]
    pub http_bind: Option<String>,

    /// Keepalive ping interval in seconds, 0 disables it
    #[arg(long, env = "HEARTBEAT_SECS", default_value_t = 30)]
    pub heartbeat_secs: u64,

    /// Entries kept per device and category, 0 keeps everything
    #[arg(long, env = "MAX_HISTORY", default_value_t = 0)]
    pub max_history: usize,

    /// Relay URL advertised by /api/websocket/info
    #[arg(long, env = "PUBLIC_WS_URL")]
    pub public_ws_url: Option<String>,

    /// Log filter used when RUST_LOG is unset
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl Args {
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig {
            ws_bind_addr: self
                .ws_bind
                .clone()
                .unwrap_or_else(|| format!("0.0.0.0:{}", self.ws_port)),
            http_bind_addr: self
                .http_bind
                .clone()
                .unwrap_or_else(|| format!("0.0.0.0:{}", self.port)),
            heartbeat_interval_secs: self.heartbeat_secs,
            max_history: (self.max_history > 0).then_some(self.max_history),
            public_ws_url: self.public_ws_url.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_server_config() {
        let args = Args::try_parse_from(["hublink"]).unwrap();
        let config = args.server_config();
        let defaults = ServerConfig::default();
        assert_eq!(config.ws_bind_addr, defaults.ws_bind_addr);
        assert_eq!(config.http_bind_addr, defaults.http_bind_addr);
        assert_eq!(config.heartbeat_interval_secs, 30);
        assert!(config.max_history.is_none());
        assert_eq!(args.log_level, "info");
    }

    #[test]
    fn test_ports_and_binds() {
        let args = Args::try_parse_from([
            "hublink",
            "--ws-port",
            "9001",
            "--http-bind",
            "127.0.0.1:8080",
            "--max-history",
            "250",
        ])
        .unwrap();
        let config = args.server_config();
        assert_eq!(config.ws_bind_addr, "0.0.0.0:9001");
        assert_eq!(config.http_bind_addr, "127.0.0.1:8080");
        assert_eq!(config.max_history, Some(250));
    }

    #[test]
    fn test_rejects_bad_port() {
        assert!(Args::try_parse_from(["hublink", "--port", "http"]).is_err());
    }
}
