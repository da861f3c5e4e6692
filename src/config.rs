//! Node configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Raft engine parameters fixed by this runtime.
///
/// These are deliberately not user-configurable: every replica of a cluster
/// must run the same consensus timing.
pub(crate) mod raft_params {
    use std::time::Duration;

    pub const ELECTION_TICK: usize = 10;
    pub const HEARTBEAT_TICK: usize = 1;
    pub const MAX_SIZE_PER_MSG: u64 = 1024 * 1024;
    pub const MAX_INFLIGHT_MSGS: usize = 256;
    pub const TICK_INTERVAL: Duration = Duration::from_millis(100);
}

/// Default cluster id used when the caller leaves it unset.
pub const DEFAULT_CLUSTER_ID: u64 = 0x100;

/// Configuration for a replicated node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// This node's unique id. Zero means "generate a random id at first
    /// start"; the generated id is stable for the node's lifetime because
    /// it is persisted inside the cluster's membership entries.
    pub id: u64,

    /// Cluster id shared by all members. Zero means [`DEFAULT_CLUSTER_ID`].
    pub cluster_id: u64,

    /// Host this node advertises to peers (carried in join requests and
    /// membership entries). Not a bind address; listeners bind `0.0.0.0`.
    pub advertise_host: String,

    /// Listen port of the raft peer transport.
    pub raft_port: u16,

    /// Listen port of the membership HTTP API.
    pub api_port: u16,

    /// `host:api_port` addresses used exclusively to ask an existing
    /// cluster to add this node. Cleared when `bootstrap_node` is set.
    pub bootstrap_peers: Vec<String>,

    /// Seed a brand new cluster with this node as the only member.
    /// Mutually exclusive with `bootstrap_peers`.
    pub bootstrap_node: bool,

    /// Root directory for durable state (`<dir>/wal` and `<dir>/snap`).
    /// `None` keeps everything in memory and disables snapshots.
    pub data_dir: Option<PathBuf>,

    /// Backoff schedule for the join/rejoin/leave handshakes.
    pub init_backoff: BackoffConfig,

    /// Snapshot & compaction policy.
    pub snapshot: SnapshotPolicy,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            cluster_id: 0,
            advertise_host: "127.0.0.1".to_string(),
            raft_port: 0,
            api_port: 0,
            bootstrap_peers: Vec::new(),
            bootstrap_node: false,
            data_dir: None,
            init_backoff: BackoffConfig::default(),
            snapshot: SnapshotPolicy::default(),
        }
    }
}

/// Exponential backoff schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// First wait between attempts.
    pub initial_interval_ms: u64,
    /// Growth factor applied after every attempt.
    pub multiplier: f64,
    /// Jitter: each wait is scaled by a random factor in
    /// `[1 - r, 1 + r]`.
    pub randomization_factor: f64,
    /// Ceiling for a single wait.
    pub max_interval_ms: u64,
    /// Total budget; once elapsed the operation gives up.
    pub max_elapsed_ms: u64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 500,
            multiplier: 2.0,
            randomization_factor: 0.5,
            max_interval_ms: 5_000,
            max_elapsed_ms: 120_000,
        }
    }
}

impl BackoffConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms)
    }

    pub fn max_elapsed(&self) -> Duration {
        Duration::from_millis(self.max_elapsed_ms)
    }
}

/// When to snapshot the state machine and compact the log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotPolicy {
    /// Interval between snapshot attempts, in milliseconds. A value of
    /// zero or below disables snapshotting, which is only legal without a
    /// data directory.
    pub interval_ms: i64,
    /// Skip the attempt when fewer than this many entries were committed
    /// since the last snapshot.
    pub min_committed_logs: u64,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            interval_ms: -60_000,
            min_committed_logs: 0,
        }
    }
}

impl SnapshotPolicy {
    /// The ticker interval, or `None` when snapshotting is disabled.
    pub fn interval(&self) -> Option<Duration> {
        if self.interval_ms > 0 {
            Some(Duration::from_millis(self.interval_ms as u64))
        } else {
            None
        }
    }
}

impl NodeConfig {
    /// Create a new configuration builder.
    pub fn builder() -> NodeConfigBuilder {
        NodeConfigBuilder::default()
    }

    /// Fill defaults and enforce option exclusivity.
    ///
    /// A bootstrap node never dials out, so any supplied peer list is
    /// cleared rather than rejected.
    pub fn normalize(&mut self) {
        if self.bootstrap_node {
            self.bootstrap_peers.clear();
        }
        if self.id == 0 {
            self.id = generate_node_id();
        }
        if self.cluster_id == 0 {
            self.cluster_id = DEFAULT_CLUSTER_ID;
        }
    }

    /// Validate the configuration. Run after [`normalize`](Self::normalize).
    pub fn validate(&self) -> Result<(), String> {
        if self.raft_port == 0 {
            return Err("raft_port is required".to_string());
        }
        if self.api_port == 0 {
            return Err("api_port is required".to_string());
        }
        if self.raft_port == self.api_port {
            return Err(format!(
                "raft_port and api_port must differ (both {})",
                self.raft_port
            ));
        }
        if self.advertise_host.is_empty() {
            return Err("advertise_host is required".to_string());
        }
        if self.data_dir.is_some() && self.snapshot.interval_ms <= 0 {
            return Err(
                "snapshotting must not be disabled when a data_dir is configured".to_string(),
            );
        }
        if self.init_backoff.initial_interval_ms == 0 {
            return Err("init_backoff.initial_interval_ms must be positive".to_string());
        }
        if self.init_backoff.multiplier < 1.0 {
            return Err("init_backoff.multiplier must be at least 1".to_string());
        }
        if !(0.0..=1.0).contains(&self.init_backoff.randomization_factor) {
            return Err("init_backoff.randomization_factor must be within [0, 1]".to_string());
        }
        Ok(())
    }
}

/// Random non-zero 64-bit node id.
fn generate_node_id() -> u64 {
    loop {
        let id = uuid::Uuid::new_v4().as_u64_pair().0;
        if id != 0 {
            return id;
        }
    }
}

/// Builder for [`NodeConfig`].
#[derive(Debug, Default)]
pub struct NodeConfigBuilder {
    config: NodeConfig,
}

impl NodeConfigBuilder {
    pub fn id(mut self, id: u64) -> Self {
        self.config.id = id;
        self
    }

    pub fn cluster_id(mut self, id: u64) -> Self {
        self.config.cluster_id = id;
        self
    }

    pub fn advertise_host(mut self, host: impl Into<String>) -> Self {
        self.config.advertise_host = host.into();
        self
    }

    pub fn raft_port(mut self, port: u16) -> Self {
        self.config.raft_port = port;
        self
    }

    pub fn api_port(mut self, port: u16) -> Self {
        self.config.api_port = port;
        self
    }

    pub fn bootstrap_peer(mut self, addr: impl Into<String>) -> Self {
        self.config.bootstrap_peers.push(addr.into());
        self
    }

    pub fn bootstrap_peers(mut self, peers: impl IntoIterator<Item = String>) -> Self {
        self.config.bootstrap_peers = peers.into_iter().collect();
        self
    }

    pub fn bootstrap_node(mut self, bootstrap: bool) -> Self {
        self.config.bootstrap_node = bootstrap;
        self
    }

    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    pub fn snapshot_interval(mut self, interval: Duration) -> Self {
        self.config.snapshot.interval_ms = interval.as_millis() as i64;
        self
    }

    pub fn snapshot_min_committed(mut self, entries: u64) -> Self {
        self.config.snapshot.min_committed_logs = entries;
        self
    }

    pub fn backoff(mut self, backoff: BackoffConfig) -> Self {
        self.config.init_backoff = backoff;
        self
    }

    /// Normalize, validate, and build.
    pub fn build(mut self) -> Result<NodeConfig, String> {
        self.config.normalize();
        self.config.validate()?;
        Ok(self.config)
    }
}
