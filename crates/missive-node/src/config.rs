//! Node configuration loaded from environment variables.
//!
//! Every setting has a default so a node starts with zero configuration for
//! local development.

use std::path::PathBuf;
use std::time::Duration;

use directories::ProjectDirs;
use libp2p::Multiaddr;

use missive_net::parse_peer_list;
use missive_shared::constants::{DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_QUIC_PORT};

#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// UDP port for QUIC.
    /// Env: `LISTEN_PORT`
    /// Default: `4001`
    pub listen_port: u16,

    /// Directory holding the database and the identity key.
    /// Env: `DATA_DIR`
    /// Default: the platform data directory.
    pub data_dir: Option<PathBuf>,

    /// Peers dialled at startup, comma or newline separated multiaddrs.
    /// Env: `BOOTSTRAP_PEERS`
    pub bootstrap_peers: Vec<Multiaddr>,

    /// Env: `DATASYNC_ENABLED` (true/false)
    /// Default: `true`
    pub datasync_enabled: bool,

    /// Public chats joined at startup, comma separated.
    /// Env: `PUBLIC_CHATS`
    pub public_chats: Vec<String>,

    /// Largest envelope payload in bytes.
    /// Env: `MAX_MESSAGE_SIZE`
    /// Default: 1 MiB
    pub max_message_size: usize,

    /// Env: `SEGMENT_SWEEP_SECS`
    /// Default: one hour
    pub segment_sweep_interval: Duration,

    /// Env: `RESEND_SWEEP_SECS`
    /// Default: 30 seconds
    pub resend_sweep_interval: Duration,

    /// How often the datasync batcher flushes.
    /// Env: `DATASYNC_INTERVAL_MS`
    /// Default: 300 ms
    pub datasync_interval: Duration,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen_port: DEFAULT_QUIC_PORT,
            data_dir: None,
            bootstrap_peers: Vec::new(),
            datasync_enabled: true,
            public_chats: Vec::new(),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            segment_sweep_interval: Duration::from_secs(3600),
            resend_sweep_interval: Duration::from_secs(30),
            datasync_interval: Duration::from_millis(300),
        }
    }
}

fn parse_flag(value: &str) -> bool {
    value != "false" && value != "0"
}

impl NodeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(port) = lookup("LISTEN_PORT") {
            match port.parse::<u16>() {
                Ok(port) => config.listen_port = port,
                Err(_) => tracing::warn!(value = %port, "Invalid LISTEN_PORT, using default"),
            }
        }

        if let Some(dir) = lookup("DATA_DIR") {
            if !dir.is_empty() {
                config.data_dir = Some(PathBuf::from(dir));
            }
        }

        if let Some(peers) = lookup("BOOTSTRAP_PEERS") {
            config.bootstrap_peers = parse_peer_list(&peers);
        }

        if let Some(val) = lookup("DATASYNC_ENABLED") {
            config.datasync_enabled = parse_flag(&val);
        }

        if let Some(chats) = lookup("PUBLIC_CHATS") {
            config.public_chats = chats
                .split(',')
                .map(str::trim)
                .filter(|chat| !chat.is_empty())
                .map(String::from)
                .collect();
        }

        if let Some(val) = lookup("MAX_MESSAGE_SIZE") {
            match val.parse::<usize>() {
                Ok(size) if size > 0 => config.max_message_size = size,
                _ => tracing::warn!(value = %val, "Invalid MAX_MESSAGE_SIZE, using default"),
            }
        }

        for (key, slot, unit) in [
            ("SEGMENT_SWEEP_SECS", &mut config.segment_sweep_interval, Duration::from_secs(1)),
            ("RESEND_SWEEP_SECS", &mut config.resend_sweep_interval, Duration::from_secs(1)),
            ("DATASYNC_INTERVAL_MS", &mut config.datasync_interval, Duration::from_millis(1)),
        ] {
            if let Some(val) = lookup(key) {
                match val.parse::<u32>() {
                    Ok(n) if n > 0 => *slot = unit * n,
                    _ => tracing::warn!(key, value = %val, "Invalid interval, using default"),
                }
            }
        }

        config
    }

    /// `DATA_DIR` if set, otherwise the platform data directory.
    pub fn data_dir(&self) -> anyhow::Result<PathBuf> {
        if let Some(dir) = &self.data_dir {
            return Ok(dir.clone());
        }
        ProjectDirs::from("org", "missive", "missive")
            .map(|dirs| dirs.data_dir().to_path_buf())
            .ok_or_else(|| anyhow::anyhow!("could not determine application data directory"))
    }
}
