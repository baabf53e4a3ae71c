//! Metrics published by a running Raft node, and helpers for waiting on them.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::timeout;

use crate::core::State;
use crate::raft::MembershipConfig;
use crate::replication::ReplicationMetrics;
use crate::LogId;
use crate::NodeId;

/// A snapshot of a Raft node's current state, published any time the node's state changes in a
/// way that is relevant to an observer: term, log position, role, leader, membership or snapshot.
///
/// A new value is published to `Raft::metrics()`'s `watch::Receiver` every time one of these
/// fields changes; observers should treat the channel as the source of truth, not poll the node
/// directly.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RaftMetrics {
    pub id: NodeId,
    /// The state of the Raft node.
    pub state: State,
    pub current_term: u64,
    pub last_log_index: u64,
    pub last_applied: u64,
    /// The current cluster leader, if known.
    pub current_leader: Option<NodeId>,
    pub membership_config: MembershipConfig,
    /// The last log ID included in the most recent snapshot, if any snapshot has been taken.
    pub snapshot: Option<LogId>,
    /// Leader-specific metrics, only populated while this node is the cluster leader.
    pub leader_metrics: Option<LeaderMetrics>,
}

impl RaftMetrics {
    /// Build the initial metrics payload published as soon as a node spins up, before it has
    /// done anything at all.
    pub fn new_initial(id: NodeId) -> Self {
        Self {
            id,
            state: State::Follower,
            current_term: 0,
            last_log_index: 0,
            last_applied: 0,
            current_leader: None,
            membership_config: MembershipConfig::new_initial(id),
            snapshot: None,
            leader_metrics: None,
        }
    }
}

/// Metrics about a replication stream, specific to the leader driving it.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct LeaderMetrics {
    /// Replication metrics, keyed by the target follower's node ID.
    pub replication: BTreeMap<NodeId, ReplicationMetrics>,
}

impl Default for LeaderMetrics {
    fn default() -> Self {
        Self {
            replication: BTreeMap::new(),
        }
    }
}

/// A handle for awaiting a condition over a node's metrics stream.
///
/// Built via `Raft::wait`; each method polls the underlying `watch::Receiver` until the given
/// predicate holds or `timeout` elapses.
#[derive(Clone, Debug)]
pub struct Wait {
    pub timeout: Duration,
    pub(crate) rx: watch::Receiver<RaftMetrics>,
}

/// The error produced when a `Wait` condition does not hold within its timeout.
#[derive(Clone, Debug, thiserror::Error)]
#[error("timeout ({timeout:?}) while waiting for {msg}; last metrics: {last_metrics:?}")]
pub struct WaitError {
    pub timeout: Duration,
    pub msg: String,
    pub last_metrics: Option<RaftMetrics>,
}

impl Wait {
    /// Wait until the metrics satisfy the given predicate, returning the metrics that did.
    pub async fn metrics<T>(&self, func: T, msg: impl ToString) -> Result<RaftMetrics, WaitError>
    where
        T: Fn(&RaftMetrics) -> bool + Send,
    {
        let mut rx = self.rx.clone();
        let msg = msg.to_string();
        let mut last = None;

        let fut = async {
            loop {
                let m = rx.borrow().clone();
                if func(&m) {
                    return m;
                }
                last = Some(m);
                if rx.changed().await.is_err() {
                    return rx.borrow().clone();
                }
            }
        };

        match timeout(self.timeout, fut).await {
            Ok(m) => Ok(m),
            Err(_) => Err(WaitError {
                timeout: self.timeout,
                msg,
                last_metrics: last,
            }),
        }
    }

    /// Wait until the node's last applied log index is at least `index`.
    pub async fn log(&self, index: u64, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(move |m| m.last_applied >= index, msg).await
    }

    /// Wait until the node's state becomes `state`.
    pub async fn state(&self, state: State, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(move |m| m.state == state, msg).await
    }

    /// Wait until the node believes `leader_id` to be the current cluster leader.
    pub async fn current_leader(&self, leader_id: NodeId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(move |m| m.current_leader == Some(leader_id), msg).await
    }

    /// Wait until the node's snapshot covers at least `log_id`.
    pub async fn snapshot(&self, log_id: LogId, msg: impl ToString) -> Result<RaftMetrics, WaitError> {
        self.metrics(move |m| m.snapshot.map(|s| s >= log_id).unwrap_or(false), msg).await
    }
}
