//! The interfaces an application must implement to wire a Raft node to its transport and to its
//! cluster membership policy.

use async_trait::async_trait;
use std::sync::Arc;

use crate::raft::AppendEntriesRequest;
use crate::raft::AppendEntriesResponse;
use crate::raft::InstallSnapshotRequest;
use crate::raft::InstallSnapshotResponse;
use crate::raft::MembershipConfig;
use crate::raft::VoteRequest;
use crate::raft::VoteResponse;
use crate::AppData;
use crate::NodeId;

/// A trait defining the interface for a Raft network between cluster members.
///
/// See the module-level docs for discussion of this trait and how to implement it.
#[async_trait]
pub trait RaftNetwork<D>: Send + Sync + 'static
where D: AppData
{
    /// Send an AppendEntries RPC to the target Raft node (§5).
    async fn send_append_entries(
        &self, target: NodeId, rpc: AppendEntriesRequest<D>,
    ) -> anyhow::Result<AppendEntriesResponse>;

    /// Send an InstallSnapshot RPC to the target Raft node (§7).
    async fn send_install_snapshot(
        &self, target: NodeId, rpc: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse>;

    /// Send a RequestVote RPC to the target Raft node (§5).
    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse>;
}

/// A collaborator consulted by the Raft core whenever cluster membership is about to change.
///
/// This sits outside of the Raft protocol proper: Raft only guarantees that every node agrees on
/// *what* the membership is and *when* a change takes effect, it has no opinion on whether a
/// given node should be allowed to join in the first place. An application that needs to gate
/// admission — by authenticating an incoming node's identity, checking capacity, or enforcing an
/// external allow-list — implements this trait and installs it on `Config::membership`.
///
/// Every method here runs in-band with the membership change it governs, so implementations
/// should avoid expensive or unbounded work; a stuck `validate_new_node` call stalls the admin
/// API call that triggered it, not the whole node.
#[async_trait]
pub trait RaftMembership: Send + Sync + 'static {
    /// Called before a node is added to a joint-consensus configuration, to decide whether it may
    /// join at all. Returning `Err` aborts the membership change.
    async fn validate_new_node(&self, node: NodeId) -> anyhow::Result<()> {
        let _ = node;
        Ok(())
    }

    /// Called to authenticate a node claiming a given ID, e.g. to check a credential presented
    /// out of band. Returning `false` aborts the membership change the caller is trying to make.
    async fn authenticate_node(&self, node: NodeId) -> anyhow::Result<bool> {
        let _ = node;
        Ok(true)
    }

    /// Called once a joint configuration `C_old,new` has been decided locally, before it is
    /// proposed to the cluster, giving the collaborator a chance to observe or veto the pairing
    /// of old and new member sets.
    async fn create_joint_configuration(&self, old: &[NodeId], new: &[NodeId]) -> anyhow::Result<()> {
        let _ = (old, new);
        Ok(())
    }

    /// Returns whether `node` is considered part of `config` by this collaborator's own
    /// bookkeeping. Consulted after a membership change is proposed, to cross-check the
    /// Raft-internal `MembershipConfig` against the collaborator's own view before the change is
    /// allowed to proceed; a mismatch means the two have drifted and the change is rejected.
    fn is_node_in_configuration(&self, node: NodeId, config: &MembershipConfig) -> bool {
        let _ = node;
        let _ = config;
        true
    }

    /// Called once a membership change committing the removal of `node` has been applied,
    /// so that the collaborator can release any resources it holds for that node (credentials,
    /// connection pool entries, rate limit state).
    async fn handle_node_removal(&self, node: NodeId) {
        let _ = node;
    }
}

/// A permissive `RaftMembership` which admits every node and vetoes nothing.
///
/// This is the default installed on `Config` when the application does not care to gate
/// membership changes itself.
pub struct NoopMembership;

#[async_trait]
impl RaftMembership for NoopMembership {}

impl NoopMembership {
    pub fn arc() -> Arc<dyn RaftMembership> {
        Arc::new(NoopMembership)
    }
}
