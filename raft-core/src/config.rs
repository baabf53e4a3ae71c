//! Raft runtime configuration.

use std::sync::Arc;

use serde::Deserialize;
use serde::Serialize;

use crate::error::ConfigError;
use crate::network::NoopMembership;
use crate::network::RaftMembership;

/// Log compaction and snapshot policy.
///
/// This governs when periodic snapshots will be taken, and also governs the point at which a
/// leader will send an `InstallSnapshot` RPC to a follower rather than catching it up with log
/// entries, based on replication lag.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SnapshotPolicy {
    /// A snapshot will be generated once the log has grown the specified number of entries past
    /// the last snapshot.
    LogsSinceLast(u64),
}

/// The runtime configuration for a Raft node.
///
/// The default values used by this type should generally work well for Raft clusters which will
/// be running with nodes in multiple datacenter availability zones with low latency between
/// zones. These values should typically be made configurable from the perspective of the
/// application which is being built on top of Raft — this type intentionally says nothing about
/// *where* those values come from (flags, a config file, environment); wiring that up is left to
/// the application.
///
/// When building the Raft configuration for your application, remember this inequality from the
/// Raft spec: `broadcastTime ≪ electionTimeout ≪ MTBF`. The broadcast time should be an order of
/// magnitude less than the election timeout so that leaders can reliably send heartbeats before
/// followers start elections; given the randomized timeout, this inequality also makes split
/// votes unlikely. The election timeout should be a few orders of magnitude less than the mean
/// time between failures so that the system makes steady progress.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// The application specific name of this Raft cluster.
    pub cluster_name: String,
    /// The minimum election timeout, in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout, in milliseconds.
    pub election_timeout_max: u64,
    /// The interval, in milliseconds, at which a leader sends heartbeats to followers. Must be
    /// strictly less than `election_timeout_min`.
    pub heartbeat_interval: u64,
    /// The timeout, in milliseconds, for sending a single `InstallSnapshot` chunk.
    pub install_snapshot_timeout: u64,
    /// The maximum number of log entries to send per `AppendEntries` RPC.
    pub max_payload_entries: u64,
    /// The number of entries a follower may fall behind before the leader considers it lagging
    /// and purges the replication buffer rather than continuing to stream it individually.
    pub replication_lag_threshold: u64,
    /// The snapshot policy to use for this node.
    pub snapshot_policy: SnapshotPolicy,
    /// The maximum snapshot chunk size, in bytes, used when streaming `InstallSnapshot`.
    pub snapshot_max_chunk_size: u64,

    /// The collaborator consulted before a new node is admitted to, or removed from, the
    /// cluster's membership. Defaults to a permissive no-op that admits every node; supply a real
    /// implementation to gate admission on authentication or capacity.
    #[serde(skip, default = "NoopMembership::arc")]
    pub membership: Arc<dyn RaftMembership>,
}

impl Config {
    /// Start building a new config with the given cluster name, and all other values defaulted.
    pub fn build(cluster_name: String) -> ConfigBuilder {
        ConfigBuilder {
            cluster_name: Some(cluster_name),
            ..Default::default()
        }
    }

    /// Generate a new random election timeout within `[election_timeout_min, election_timeout_max)`.
    ///
    /// Randomization is what keeps split votes from becoming a stable failure mode: every reset
    /// draws a fresh value, so two followers racing toward the same election are overwhelmingly
    /// unlikely to time out at the same instant twice in a row.
    pub fn new_rand_election_timeout(&self) -> u64 {
        use rand::Rng;
        rand::thread_rng().gen_range(self.election_timeout_min, self.election_timeout_max)
    }
}

/// A builder for a Raft node's runtime config, applying the same defaults as the reference
/// deployment topology (single datacenter, low inter-node latency).
#[derive(Clone, Debug, Default)]
pub struct ConfigBuilder {
    pub cluster_name: Option<String>,
    pub election_timeout_min: Option<u64>,
    pub election_timeout_max: Option<u64>,
    pub heartbeat_interval: Option<u64>,
    pub install_snapshot_timeout: Option<u64>,
    pub max_payload_entries: Option<u64>,
    pub replication_lag_threshold: Option<u64>,
    pub snapshot_policy: Option<SnapshotPolicy>,
    pub snapshot_max_chunk_size: Option<u64>,
    pub membership: Option<Arc<dyn RaftMembership>>,
}

impl ConfigBuilder {
    pub fn election_timeout_min(mut self, v: u64) -> Self {
        self.election_timeout_min = Some(v);
        self
    }

    pub fn election_timeout_max(mut self, v: u64) -> Self {
        self.election_timeout_max = Some(v);
        self
    }

    pub fn heartbeat_interval(mut self, v: u64) -> Self {
        self.heartbeat_interval = Some(v);
        self
    }

    pub fn install_snapshot_timeout(mut self, v: u64) -> Self {
        self.install_snapshot_timeout = Some(v);
        self
    }

    pub fn max_payload_entries(mut self, v: u64) -> Self {
        self.max_payload_entries = Some(v);
        self
    }

    pub fn replication_lag_threshold(mut self, v: u64) -> Self {
        self.replication_lag_threshold = Some(v);
        self
    }

    pub fn snapshot_policy(mut self, v: SnapshotPolicy) -> Self {
        self.snapshot_policy = Some(v);
        self
    }

    pub fn snapshot_max_chunk_size(mut self, v: u64) -> Self {
        self.snapshot_max_chunk_size = Some(v);
        self
    }

    pub fn membership(mut self, v: Arc<dyn RaftMembership>) -> Self {
        self.membership = Some(v);
        self
    }

    /// Validate the accumulated values, filling in defaults, and produce the final `Config`.
    ///
    /// Returns `ConfigError` if the values given are invalid, e.g. `election_timeout_min` is not
    /// less than `election_timeout_max`, or `heartbeat_interval` is not less than
    /// `election_timeout_min`.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let election_timeout_min = self.election_timeout_min.unwrap_or(150);
        let election_timeout_max = self.election_timeout_max.unwrap_or(300);
        if election_timeout_min >= election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeoutRange {
                min: election_timeout_min,
                max: election_timeout_max,
            });
        }

        let heartbeat_interval = self.heartbeat_interval.unwrap_or(50);
        if heartbeat_interval >= election_timeout_min {
            return Err(ConfigError::HeartbeatNotLessThanElectionTimeoutMin {
                heartbeat_interval,
                election_timeout_min,
            });
        }

        Ok(Config {
            cluster_name: self.cluster_name.unwrap_or_else(|| "default".into()),
            election_timeout_min,
            election_timeout_max,
            heartbeat_interval,
            install_snapshot_timeout: self.install_snapshot_timeout.unwrap_or(200),
            max_payload_entries: self.max_payload_entries.unwrap_or(300),
            replication_lag_threshold: self.replication_lag_threshold.unwrap_or(5000),
            snapshot_policy: self.snapshot_policy.unwrap_or(SnapshotPolicy::LogsSinceLast(5000)),
            snapshot_max_chunk_size: self.snapshot_max_chunk_size.unwrap_or(3 * 1024 * 1024),
            membership: self.membership.unwrap_or_else(NoopMembership::arc),
        })
    }
}
