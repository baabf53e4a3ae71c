//! `SimNetwork`: a `RaftNetwork` implementation whose RPCs ride `netsim`'s connection-oriented
//! API, exactly the way a production transport would ride TCP.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;

use raft_core::raft::AppendEntriesRequest;
use raft_core::raft::AppendEntriesResponse;
use raft_core::raft::InstallSnapshotRequest;
use raft_core::raft::InstallSnapshotResponse;
use raft_core::raft::VoteRequest;
use raft_core::raft::VoteResponse;
use raft_core::NodeId;
use raft_core::RaftNetwork;

use memstore::ClientRequest;
use netsim::NodeAddr;
use netsim::Port;

use crate::rpc::RpcRequest;
use crate::rpc::RpcResponse;

/// A directory mapping Raft node IDs onto their simulated network address.
///
/// Shared (via `Arc`) across every node's `SimNetwork`, so that adding a node to the cluster
/// makes it immediately reachable by every existing member.
pub type Directory = Arc<RwLock<BTreeMap<NodeId, NodeAddr>>>;

/// A `RaftNetwork` impl that dials, writes and reads RPC frames over a `netsim::Node`'s
/// connection-oriented API, returning each connection to the node's pool when done so later
/// calls to the same peer reuse it.
pub struct SimNetwork {
    node: netsim::Node,
    directory: Directory,
    port: Port,
    rpc_timeout: Duration,
}

impl SimNetwork {
    pub fn new(node: netsim::Node, directory: Directory, port: Port, rpc_timeout: Duration) -> Self {
        Self {
            node,
            directory,
            port,
            rpc_timeout,
        }
    }

    async fn address_of(&self, target: NodeId) -> anyhow::Result<NodeAddr> {
        self.directory.read().await.get(&target).cloned().ok_or_else(|| anyhow!("no route to node {}", target))
    }

    #[tracing::instrument(level = "trace", skip(self, req))]
    async fn call(&self, target: NodeId, req: RpcRequest) -> anyhow::Result<RpcResponse> {
        let remote = self.address_of(target).await?;

        let conn = self
            .node
            .connect(&remote, self.port, self.port, self.rpc_timeout)
            .await
            .map_err(|err| anyhow!("connect to node {} ({}) failed: {}", target, remote, err))?;

        let body = serde_json::to_vec(&req)?;
        let accepted = conn
            .write(Bytes::from(body), self.rpc_timeout)
            .await
            .map_err(|err| anyhow!("write to node {} failed: {}", target, err))?;
        if !accepted {
            return Err(anyhow!("write to node {} timed out", target));
        }

        let frame = conn.read(self.rpc_timeout).await.map_err(|err| anyhow!("read from node {} failed: {}", target, err))?;
        let resp: RpcResponse = serde_json::from_slice(&frame)?;

        self.node.return_connection(conn).await;

        Ok(resp)
    }
}

#[async_trait]
impl RaftNetwork<ClientRequest> for SimNetwork {
    async fn send_append_entries(
        &self,
        target: NodeId,
        rpc: AppendEntriesRequest<ClientRequest>,
    ) -> anyhow::Result<AppendEntriesResponse> {
        match self.call(target, RpcRequest::AppendEntries(rpc)).await? {
            RpcResponse::AppendEntries(resp) => Ok(resp),
            RpcResponse::Error(msg) => Err(anyhow!(msg)),
            other => Err(anyhow!("unexpected response to AppendEntries: {:?}", other)),
        }
    }

    async fn send_install_snapshot(
        &self,
        target: NodeId,
        rpc: InstallSnapshotRequest,
    ) -> anyhow::Result<InstallSnapshotResponse> {
        match self.call(target, RpcRequest::InstallSnapshot(rpc)).await? {
            RpcResponse::InstallSnapshot(resp) => Ok(resp),
            RpcResponse::Error(msg) => Err(anyhow!(msg)),
            other => Err(anyhow!("unexpected response to InstallSnapshot: {:?}", other)),
        }
    }

    async fn send_vote(&self, target: NodeId, rpc: VoteRequest) -> anyhow::Result<VoteResponse> {
        match self.call(target, RpcRequest::Vote(rpc)).await? {
            RpcResponse::Vote(resp) => Ok(resp),
            RpcResponse::Error(msg) => Err(anyhow!(msg)),
            other => Err(anyhow!("unexpected response to Vote: {:?}", other)),
        }
    }
}
