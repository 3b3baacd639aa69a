use std::env;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

use log::warn;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_RELAY_PATH: &str = "/relay";
const DEFAULT_ROOM: &str = "lobby";
const DEFAULT_PEER_TIMEOUT_SECS: u64 = 30;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 10;
const DEFAULT_CHUNKED_MAX_BYTES: u64 = 100 * 1024 * 1024; // 100MB over the relay
const DEFAULT_SWARM_MAX_BYTES: u64 = 4 * 1024 * 1024 * 1024; // 4GB over the swarm
const DEFAULT_CHUNK_SIZE: usize = 64 * 1024; // 64KB stream reads

/// Size ceilings and read granularity for file transfers
#[derive(Debug, Clone)]
pub struct TransferLimits {
    /// Largest payload accepted over the chunked relay transport
    pub chunked_max_bytes: u64,
    /// Largest payload accepted over the swarm transport
    pub swarm_max_bytes: u64,
    /// Upper bound of a single stream read, and so of a single chunk
    pub chunk_size: usize,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            chunked_max_bytes: DEFAULT_CHUNKED_MAX_BYTES,
            swarm_max_bytes: DEFAULT_SWARM_MAX_BYTES,
            chunk_size: DEFAULT_CHUNK_SIZE,
        }
    }
}

impl TransferLimits {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let limits = Self {
            chunked_max_bytes: env_or("CHUNKED_MAX_BYTES", defaults.chunked_max_bytes),
            swarm_max_bytes: env_or("SWARM_MAX_BYTES", defaults.swarm_max_bytes),
            chunk_size: env_or("CHUNK_SIZE", defaults.chunk_size).max(1),
        };

        // The swarm exists for payloads the relay refuses
        if limits.swarm_max_bytes <= limits.chunked_max_bytes {
            warn!(
                "SWARM_MAX_BYTES ({}) should exceed CHUNKED_MAX_BYTES ({})",
                limits.swarm_max_bytes, limits.chunked_max_bytes
            );
        }

        limits
    }
}

/// Configuration for the relay server
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Address the listener binds to
    pub bind_addr: IpAddr,
    /// Port the listener binds to
    pub port: u16,
    /// Path serving the WebSocket upgrade
    pub relay_path: String,
    /// Silence after which a peer is evicted
    pub peer_timeout: Duration,
    /// How often the eviction sweep runs
    pub sweep_interval: Duration,
    /// Room every session lands in on JOIN
    pub default_room: String,
    /// Transfer ceilings
    pub limits: TransferLimits,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: DEFAULT_PORT,
            relay_path: DEFAULT_RELAY_PATH.to_string(),
            peer_timeout: Duration::from_secs(DEFAULT_PEER_TIMEOUT_SECS),
            sweep_interval: Duration::from_secs(DEFAULT_SWEEP_INTERVAL_SECS),
            default_room: DEFAULT_ROOM.to_string(),
            limits: TransferLimits::default(),
        }
    }
}

impl RelayConfig {
    /// Build the configuration from environment variables, falling back to defaults
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            bind_addr: env_or("RELAY_BIND_ADDR", defaults.bind_addr),
            port: env_or("RELAY_PORT", defaults.port),
            relay_path: normalize_path(
                &env::var("RELAY_PATH").unwrap_or(defaults.relay_path),
            ),
            peer_timeout: Duration::from_secs(env_or(
                "PEER_TIMEOUT_SECS",
                DEFAULT_PEER_TIMEOUT_SECS,
            )),
            sweep_interval: Duration::from_secs(
                env_or("SWEEP_INTERVAL_SECS", DEFAULT_SWEEP_INTERVAL_SECS).max(1),
            ),
            default_room: env::var("DEFAULT_ROOM")
                .ok()
                .filter(|room| !room.is_empty())
                .unwrap_or(defaults.default_room),
            limits: TransferLimits::from_env(),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_addr, self.port)
    }
}

/// Timing of the client-side discovery agent
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Interval between self-announcements
    pub announce_interval: Duration,
    /// A peer silent for this many intervals is dropped from the local cache
    pub stale_multiplier: u32,
    /// Delay before the single pending reconnect attempt
    pub reconnect_backoff: Duration,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            announce_interval: Duration::from_secs(5),
            stale_multiplier: 3,
            reconnect_backoff: Duration::from_secs(3),
        }
    }
}

impl DiscoveryConfig {
    pub fn stale_after(&self) -> Duration {
        self.announce_interval * self.stale_multiplier
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    parse_or(env::var(key).ok().as_deref(), default)
}

fn parse_or<T: FromStr>(raw: Option<&str>, default: T) -> T {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

fn normalize_path(path: &str) -> String {
    let trimmed = path.trim().trim_end_matches('/');
    if trimmed.is_empty() {
        "/".to_string()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}
