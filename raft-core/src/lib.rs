//! A Raft consensus engine.
//!
//! This crate implements leader election, log replication, commitment, joint-consensus
//! membership change, and chunked snapshot install, as independent of any particular network
//! transport or storage backend as the protocol allows. See [`RaftNetwork`], [`RaftStorage`] and
//! [`RaftMembership`] for the interfaces an application must supply.

pub mod config;
mod core;
pub mod error;
pub mod metrics;
pub mod network;
pub mod raft;
mod raft_types;
pub mod replication;
pub mod storage;

use std::fmt::Debug;

pub use async_trait;
pub use config::Config;
pub use config::SnapshotPolicy;
pub use core::State;
pub use error::ChangeConfigError;
pub use error::InitializeError;
pub use error::RaftError;
pub use metrics::RaftMetrics;
pub use network::RaftMembership;
pub use network::RaftNetwork;
pub use raft::Raft;
pub use raft_types::SnapshotId;
pub use raft_types::SnapshotSegmentId;
pub use replication::ReplicationMetrics;
pub use storage::RaftStorage;
pub use storage::RaftStorageDebug;

/// A Raft node's ID within a cluster.
pub type NodeId = u64;

/// A trait defining application specific data which will be used to support a Raft cluster's
/// client write requests.
///
/// This type must be able to be sent across tasks and threads, and must be usable in multiple
/// concurrent threads of control, so it must be `Clone`, `Send` and `Sync`. It must be encoded and
/// decoded via the application's chosen RPC encoding, and must be `Debug` for diagnostic logging.
/// There is no requirement on idempotence at this level; if your state machine requires
/// idempotent application, implement that in `RaftStorage::apply_to_state_machine`.
pub trait AppData: Clone + Debug + Send + Sync + 'static {}

/// A trait defining application specific responses produced by applying an `AppData` entry to the
/// state machine.
///
/// Must round-trip the application's chosen RPC encoding, the same as `AppData`.
pub trait AppDataResponse: Clone + Debug + Send + Sync + 'static {}

/// A log ID: the pair `(term, index)` which uniquely identifies an entry's position in the log.
///
/// Log IDs order lexicographically by `(term, index)`, which is exactly the "at least as
/// up-to-date" comparison §5.4.1 of the Raft paper requires of `RequestVote`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash, serde::Serialize, serde::Deserialize)]
pub struct LogId {
    pub term: u64,
    pub index: u64,
}

impl std::fmt::Display for LogId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.term, self.index)
    }
}

impl LogId {
    pub fn new(term: u64, index: u64) -> Self {
        Self { term, index }
    }
}

/// A trait for types which can render a short, human readable summary of themselves for tracing.
///
/// Implemented on RPC records instead of deriving from `Debug` so that large payloads (entry
/// batches, snapshot chunks) can be summarized without dumping their full contents into logs.
pub trait MessageSummary {
    fn summary(&self) -> String;
}

/// Distinguishes "replace with this value" from "leave whatever is already there" when passing
/// optional updates through channels that can't express `Option<Option<T>>` cleanly.
#[derive(Debug)]
pub enum Update<T> {
    Update(T),
    Ignore,
}

/// Quorum arithmetic shared between election and commit-index advancement.
///
/// A "quorum" in this crate is always a simple majority of a configuration group; joint consensus
/// requires a quorum in *each* group (see `MembershipConfig::is_in_joint_consensus`).
pub mod quorum {
    /// The number of affirmative votes/acks needed out of `n` members to form a majority.
    pub fn majority_of(n: usize) -> usize {
        (n / 2) + 1
    }
}
