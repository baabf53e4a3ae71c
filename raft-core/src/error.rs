//! Error types returned by this crate's public APIs.

use crate::raft_types::SnapshotSegmentId;
use crate::NodeId;

/// An error coming from a Raft node's core runtime.
///
/// These are the errors that can arise from normal execution of the Raft protocol itself, as
/// opposed to errors in the surrounding application (see `RaftNetworkError`/`RaftStorageError`,
/// which are wrapped here).
#[derive(Clone, Debug, thiserror::Error)]
pub enum RaftError {
    #[error("error from storage: {0}")]
    RaftStorage(#[from] RaftStorageError),

    #[error("error from network: {0}")]
    RaftNetwork(#[from] RaftNetworkError),

    #[error(
        "expected snapshot chunk at {expect}, but the follower is resuming a transfer at {got}; the leader must restart the transfer from offset 0"
    )]
    SnapshotMismatch { expect: SnapshotSegmentId, got: SnapshotSegmentId },

    #[error("this node is shutting down")]
    ShuttingDown,
}

/// A wrapper around `anyhow::Error` representing an error from a `RaftStorage` implementation.
///
/// Errors from the application's storage backend are always treated as fatal: log and state
/// machine integrity can't be assumed once the backend has failed, so the node that hit the error
/// shuts itself down rather than risk exposing a corrupt log to the rest of the cluster.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct RaftStorageError(std::sync::Arc<anyhow::Error>);

impl From<anyhow::Error> for RaftStorageError {
    fn from(src: anyhow::Error) -> Self {
        Self(std::sync::Arc::new(src))
    }
}

/// A wrapper around `anyhow::Error` representing an error from a `RaftNetwork` implementation.
///
/// Unlike storage errors, network errors are expected: the network is unreliable by design,
/// and a failed RPC just means the peer will be retried on the next heartbeat/replication tick.
#[derive(Clone, Debug, thiserror::Error)]
#[error("{0}")]
pub struct RaftNetworkError(std::sync::Arc<anyhow::Error>);

impl From<anyhow::Error> for RaftNetworkError {
    fn from(src: anyhow::Error) -> Self {
        Self(std::sync::Arc::new(src))
    }
}

impl From<std::io::Error> for RaftError {
    fn from(src: std::io::Error) -> Self {
        RaftError::RaftStorage(RaftStorageError::from(anyhow::Error::from(src)))
    }
}

pub type RaftResult<T> = Result<T, RaftError>;

/// An error coming from the `Raft::initialize` API.
#[derive(Clone, Debug, thiserror::Error)]
pub enum InitializeError {
    /// The node cannot initialize, as it is not in a pristine state, e.g. it already knows of
    /// a leader or has entries in its log.
    #[error("the node is not in a pristine state, and cannot be initialized")]
    NotAllowed,

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// An error coming from the client read API, i.e. `Raft::client_read`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientReadError {
    /// This node is not the cluster leader, and the given leader ID, if known, is provided so
    /// that the caller may retry their request against the true leader.
    #[error("the node is not the Raft leader, and cannot fulfill this request; last known leader: {0:?}")]
    ForwardToLeader(Option<NodeId>),

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// An error coming from the client write API, i.e. `Raft::client_write`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ClientWriteError<D: crate::AppData> {
    /// This node is not the cluster leader, and the given leader ID, if known, is provided so
    /// that the caller may retry their request against the true leader.
    ///
    /// The original data the caller submitted is returned so that it does not need to be
    /// reconstructed in order to retry the request.
    #[error("the node is not the Raft leader, and cannot fulfill this request; last known leader: {0:?}")]
    ForwardToLeader(D, Option<NodeId>),

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

/// An error coming from the `Raft::change_membership` API.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ChangeConfigError {
    /// The given config change produces no change to the current config, e.g. adding a member
    /// which is already present, or removing a member which is already absent.
    #[error("no change to the current config is produced by the given request")]
    Noop,

    /// A config change has already been proposed, and has not yet joined the cluster's config,
    /// i.e. the cluster is already in a joint consensus.
    #[error("a config change is already in progress")]
    ConfigChangeInProgress,

    /// The cluster is in a state which is not safe to perform a config change, e.g. it has not
    /// yet applied any entries from its current term.
    #[error("the cluster is not in a state which allows for a config change to be safely applied")]
    InoperableConfig,

    /// The node the request was sent to is not the cluster leader, and the given leader ID, if
    /// known, is provided so that the caller may retry their request against the true leader.
    #[error("the node is not the Raft leader, and cannot fulfill this request; last known leader: {0:?}")]
    NodeNotLeader(Option<NodeId>),

    /// The membership collaborator rejected this change, e.g. an incoming node failed
    /// authentication.
    #[error("the membership change was rejected: {0}")]
    MembershipRejected(String),

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

impl<D: crate::AppData> From<ChangeConfigError> for ResponseError {
    fn from(src: ChangeConfigError) -> Self {
        ResponseError::ChangeConfig(src.to_string())
    }
}

/// An error which may be sent over a oneshot response channel shared by several admin/client APIs.
///
/// Errors carried over these channels are erased to strings at the boundary: the originating
/// error type differs by call site (client write, admin add-member, ...), but the channel itself
/// is shared infrastructure, so it settles for a single flattened representation.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ResponseError {
    #[error("{0}")]
    ChangeConfig(String),

    #[error(transparent)]
    RaftError(#[from] RaftError),
}

impl From<RaftError> for ResponseError {
    fn from(src: RaftError) -> Self {
        ResponseError::RaftError(src)
    }
}

/// An error produced while validating a `ConfigBuilder`.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("election_timeout_min ({min}) must be less than election_timeout_max ({max})")]
    InvalidElectionTimeoutRange { min: u64, max: u64 },

    #[error("heartbeat_interval ({heartbeat_interval}) must be less than election_timeout_min ({election_timeout_min})")]
    HeartbeatNotLessThanElectionTimeoutMin { heartbeat_interval: u64, election_timeout_min: u64 },
}
