//! Replica configuration, parsed once at startup (see spec AMBIENT
//! Configuration section).

use std::time::Duration;

use clap::Parser;

/// Configuration for one coordinator replica. Loaded once via
/// [`ServerConfig::parse`]; nothing here is mutated after startup. Workers
/// that need tunables (heartbeat period, backoff caps) receive them
/// explicitly rather than reading this struct directly.
#[derive(Parser, Debug, Clone)]
#[command(name = "peercoordd", about = "Highly-available peer coordinator")]
pub struct ServerConfig {
    /// Address the client-facing WebSocket gateway listens on.
    #[arg(long, env = "PEERCOORD_LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// SQLite database path, or `:memory:` for an ephemeral single-replica store.
    #[arg(long, env = "PEERCOORD_STORE_PATH", default_value = ":memory:")]
    pub store_path: String,

    /// Override for [`crate::heartbeats::DEFAULT_HEARTBEAT_PERIOD`], in seconds.
    #[arg(long, env = "PEERCOORD_HEARTBEAT_PERIOD_SECS", default_value_t = 2)]
    pub heartbeat_period_secs: u64,

    /// Override for [`crate::heartbeats::DEFAULT_MISSED_HEARTBEATS`].
    #[arg(long, env = "PEERCOORD_MISSED_HEARTBEATS", default_value_t = 3)]
    pub missed_heartbeats: u32,

    /// Period between coordinator/lost-peer/tunnel cleanup sweeps, in seconds.
    #[arg(long, env = "PEERCOORD_CLEANUP_INTERVAL_SECS", default_value_t = 3600)]
    pub cleanup_interval_secs: u64,

    /// Emit JSON logs instead of the human-readable default.
    #[arg(long, env = "PEERCOORD_LOG_JSON", default_value_t = false)]
    pub log_json: bool,
}

impl ServerConfig {
    pub fn heartbeat_period(&self) -> Duration {
        Duration::from_secs(self.heartbeat_period_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}
