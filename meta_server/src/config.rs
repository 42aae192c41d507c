//! CLI config for a meta node.

use std::path::PathBuf;
use std::time::Duration;

/// Configuration for one meta node.
#[derive(Debug, Clone, PartialEq, Eq, clap::Parser)]
pub struct MetaConfig {
    /// Root directory for persisted state: the consensus log and snapshot
    /// store, plus the client's cached server list.
    #[clap(long = "dir", env = "META_SERVICE_DIR", default_value = ".")]
    pub dir: PathBuf,

    /// HTTP bind address for this meta node.
    #[clap(
        long = "bind-address",
        env = "META_SERVICE_BIND_ADDRESS",
        default_value = "127.0.0.1:8091"
    )]
    pub bind_address: String,

    /// TCP bind address handed to the consensus transport.
    #[clap(
        long = "tcp-bind-address",
        env = "META_SERVICE_TCP_BIND_ADDRESS",
        default_value = "127.0.0.1:8088"
    )]
    pub tcp_bind_address: String,

    /// Synthesize a default retention policy when a database is created
    /// without one.
    #[clap(
        long = "retention-auto-create",
        env = "META_SERVICE_RETENTION_AUTO_CREATE",
        default_value_t = true,
        action = clap::ArgAction::Set
    )]
    pub retention_auto_create: bool,

    /// Election timeout for the consensus transport.
    #[clap(
        long = "election-timeout",
        env = "META_SERVICE_ELECTION_TIMEOUT",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub election_timeout: Duration,

    /// Heartbeat timeout for the consensus transport.
    #[clap(
        long = "heartbeat-timeout",
        env = "META_SERVICE_HEARTBEAT_TIMEOUT",
        default_value = "1s",
        value_parser = humantime::parse_duration
    )]
    pub heartbeat_timeout: Duration,

    /// Serve client traffic over HTTPS.
    #[clap(long = "tls", env = "META_SERVICE_TLS", default_value_t = false)]
    pub tls: bool,
}

impl MetaConfig {
    /// The store configuration implied by this node config.
    pub fn store_config(&self) -> meta_store::StoreConfig {
        meta_store::StoreConfig {
            retention_auto_create: self.retention_auto_create,
            ..Default::default()
        }
    }
}
