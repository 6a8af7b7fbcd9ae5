//! Runtime configuration.
//!
//! # Defaults
//!
//! | Field | Default |
//! |-------|---------|
//! | `num_workers` | available CPU parallelism |
//! | `debug_level` | 0 (off) |
//! | `listen` | `"local"` (no transport; single-node) |
//! | `peers` | empty |
//! | `main_node` | true |
//! | `max_fish` | 1 |
//! | `fish_backoff` | 1 ms |
//! | `heartbeat_interval` | 500 ms |
//! | `heartbeat_timeout` | 5 s |
//! | `chaos_monkey` | false |
//! | `chaos_seed` | 0 |
//!
//! The environment variables `PARSTEAL_WORKERS` and `PARSTEAL_DEBUG`
//! override `num_workers` and `debug_level` respectively.

use std::time::Duration;

/// Runtime configuration.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Number of worker threads (default: available parallelism).
    pub num_workers: usize,
    /// Debug emission level, 0..=9.
    pub debug_level: u8,
    /// Address this node listens on; also its node identity.
    ///
    /// The literal `"local"` disables the transport: the runtime is a
    /// single-node cluster.
    pub listen: String,
    /// Addresses of all other nodes.
    ///
    /// On the main node the order given here becomes the published
    /// node-list order (after the main node itself).
    pub peers: Vec<String>,
    /// Whether this node is the main node (the root of the cluster).
    pub main_node: bool,
    /// Maximum FISH messages each worker keeps in flight.
    pub max_fish: u32,
    /// Base delay before re-fishing after a NOWORK reply.
    pub fish_backoff: Duration,
    /// Interval between HEARTBEAT messages to every peer.
    pub heartbeat_interval: Duration,
    /// Silence after which a peer is considered failed.
    pub heartbeat_timeout: Duration,
    /// Enables random fault injection (for fault-tolerance tests).
    pub chaos_monkey: bool,
    /// Seed for the chaos-monkey schedule; 0 picks one from entropy.
    pub chaos_seed: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            num_workers: std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get),
            debug_level: 0,
            listen: "local".to_owned(),
            peers: Vec::new(),
            main_node: true,
            max_fish: 1,
            fish_backoff: Duration::from_millis(1),
            heartbeat_interval: Duration::from_millis(500),
            heartbeat_timeout: Duration::from_secs(5),
            chaos_monkey: false,
            chaos_seed: 0,
        }
    }
}

impl RuntimeConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the number of worker threads.
    #[must_use]
    pub fn workers(mut self, n: usize) -> Self {
        self.num_workers = n;
        self
    }

    /// Sets the debug level.
    #[must_use]
    pub fn debug(mut self, level: u8) -> Self {
        self.debug_level = level;
        self
    }

    /// Sets the listen address (and thereby the node identity).
    #[must_use]
    pub fn listen_on(mut self, addr: impl Into<String>) -> Self {
        self.listen = addr.into();
        self
    }

    /// Sets the peer addresses.
    #[must_use]
    pub fn with_peers(mut self, peers: Vec<String>) -> Self {
        self.peers = peers;
        self
    }

    /// Marks this node as main or non-main.
    #[must_use]
    pub fn main(mut self, is_main: bool) -> Self {
        self.main_node = is_main;
        self
    }

    /// Enables chaos-monkey fault injection with the given seed.
    #[must_use]
    pub fn chaos(mut self, seed: u64) -> Self {
        self.chaos_monkey = true;
        self.chaos_seed = seed;
        self
    }

    /// Applies environment variable overrides.
    #[must_use]
    pub fn from_env(mut self) -> Self {
        if let Some(n) = env_parse("PARSTEAL_WORKERS") {
            self.num_workers = n;
        }
        if let Some(d) = env_parse::<u8>("PARSTEAL_DEBUG") {
            self.debug_level = d;
        }
        self
    }

    /// Normalizes configuration values to safe ones.
    pub fn normalize(&mut self) {
        if self.num_workers == 0 {
            self.num_workers = 1;
        }
        self.debug_level = self.debug_level.min(9);
        if self.max_fish == 0 {
            self.max_fish = 1;
        }
        if self.fish_backoff.is_zero() {
            self.fish_backoff = Duration::from_micros(100);
        }
    }

    /// Returns true when the transport is disabled.
    #[must_use]
    pub fn is_single_node(&self) -> bool {
        self.peers.is_empty()
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}
