//! `SimCluster`: wires a set of `Raft` nodes together over one `netsim::Simulator`, giving
//! end-to-end scenario tests a single handle for cluster lifecycle, topology changes and client
//! traffic.

use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use anyhow::Context;
use anyhow::Result;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use netsim::NetworkLink;
use netsim::NodeAddr;
use netsim::Port;
use netsim::Simulator;

use memstore::ClientRequest;
use memstore::ClientResponse;
use memstore::MemStore;
use raft_core::error::ClientWriteError;
use raft_core::metrics::Wait;
use raft_core::raft::ClientWriteRequest;
use raft_core::Config;
use raft_core::NodeId;
use raft_core::RaftMetrics;
use raft_core::State;

use crate::network::Directory;
use crate::network::SimNetwork;
use crate::serve;
use crate::SimRaft;

/// The fixed port every simulated node binds its Raft RPC listener on.
///
/// A single port per node address is sufficient: `netsim` scopes `(address, port)` pairs, and
/// every node in a cluster gets a distinct address.
const RPC_PORT: Port = 7000;

fn addr_of(id: NodeId) -> NodeAddr {
    format!("n{}", id)
}

struct ClusterNode {
    raft: SimRaft,
    storage: Arc<MemStore>,
    listener_task: JoinHandle<()>,
}

/// An end-to-end Raft cluster running entirely inside a deterministic `netsim::Simulator`.
pub struct SimCluster {
    pub sim: Arc<Simulator>,
    pub config: Arc<Config>,
    directory: Directory,
    nodes: RwLock<BTreeMap<NodeId, ClusterNode>>,
    link: NetworkLink,
}

impl SimCluster {
    /// Create a new, empty cluster over a simulator seeded with `seed`, linking every pair of
    /// nodes added from here on with `link`.
    pub fn new(seed: u64, config: Arc<Config>, link: NetworkLink) -> Arc<Self> {
        Arc::new(Self {
            sim: Simulator::new(seed),
            config,
            directory: Default::default(),
            nodes: Default::default(),
            link,
        })
    }

    /// Add a new node to the cluster: register it in the simulator, bind its RPC listener, and
    /// start its `Raft` task. Links it bidirectionally to every node already present.
    pub async fn add_node(self: &Arc<Self>, id: NodeId) -> Result<()> {
        let address = addr_of(id);
        let net_node = self.sim.node(address.clone()).await;

        {
            let mut dir = self.directory.write().await;
            dir.insert(id, address.clone());
        }

        {
            let existing: Vec<NodeAddr> = self.directory.read().await.values().filter(|a| **a != address).cloned().collect();
            for peer in existing {
                self.sim.topology().add_edge(address.clone(), peer.clone(), self.link);
                self.sim.topology().add_edge(peer, address.clone(), self.link);
            }
        }

        let network = Arc::new(SimNetwork::new(net_node.clone(), self.directory.clone(), RPC_PORT, self.rpc_timeout()));
        let storage = Arc::new(MemStore::new(id));
        let raft = raft_core::Raft::new(id, self.config.clone(), network, storage.clone());

        let listener = net_node.bind(RPC_PORT).await.map_err(|err| anyhow!("node {} failed to bind: {}", id, err))?;
        let listener_task = tokio::spawn(serve::serve(listener, raft.clone()));

        self.nodes.write().await.insert(
            id,
            ClusterNode {
                raft,
                storage,
                listener_task,
            },
        );

        Ok(())
    }

    fn rpc_timeout(&self) -> Duration {
        Duration::from_millis(self.config.election_timeout_min.max(200))
    }

    async fn raft(&self, id: NodeId) -> Result<SimRaft> {
        let nodes = self.nodes.read().await;
        Ok(nodes.get(&id).with_context(|| format!("node {} is not part of this cluster", id))?.raft.clone())
    }

    /// Get a handle to the storage backend for the given node, for state-machine/log assertions.
    pub async fn storage(&self, id: NodeId) -> Result<Arc<MemStore>> {
        let nodes = self.nodes.read().await;
        Ok(nodes.get(&id).with_context(|| format!("node {} is not part of this cluster", id))?.storage.clone())
    }

    /// Bootstrap the cluster from `leader`'s pristine store, with `members` as the initial
    /// configuration.
    pub async fn initialize(&self, leader: NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        self.raft(leader).await?.initialize(members).await?;
        Ok(())
    }

    /// Submit a client write to `target`, expecting it to be the current leader (or to forward
    /// to one).
    pub async fn client_write(&self, target: NodeId, req: ClientRequest) -> std::result::Result<ClientResponse, ClientWriteError<ClientRequest>> {
        let raft = self
            .raft(target)
            .await
            .map_err(|err| ClientWriteError::RaftError(raft_core::error::RaftNetworkError::from(anyhow!(err)).into()))?;
        raft.client_write(ClientWriteRequest::new(req)).await.map(|resp| resp.data)
    }

    /// Add `target` to `leader`'s cluster as a non-voter, catching it up on the log before it is
    /// eligible to join a `change_membership` call.
    pub async fn add_non_voter(&self, leader: NodeId, target: NodeId) -> Result<()> {
        self.raft(leader).await?.add_non_voter(target).await.map_err(|err| anyhow!("add_non_voter({}, {}) failed: {}", leader, target, err))
    }

    /// Drive `leader` through a joint-consensus membership change to `members`.
    pub async fn change_membership(&self, leader: NodeId, members: BTreeSet<NodeId>) -> Result<()> {
        self.raft(leader).await?.change_membership(members).await.map_err(|err| anyhow!("change_membership({}) failed: {}", leader, err))
    }

    /// Remove every edge touching `id`'s address, simulating a hard network partition.
    pub async fn isolate(&self, id: NodeId) -> Result<()> {
        let address = self.directory.read().await.get(&id).cloned().with_context(|| format!("node {} unknown", id))?;
        self.sim.topology().isolate(&address);
        Ok(())
    }

    /// Reconnect `id` to every other node currently in the cluster, with the cluster's standard
    /// link parameters.
    pub async fn restore(&self, id: NodeId) -> Result<()> {
        let address = self.directory.read().await.get(&id).cloned().with_context(|| format!("node {} unknown", id))?;
        let peers: Vec<NodeAddr> = self.directory.read().await.iter().filter(|(peer, _)| **peer != id).map(|(_, a)| a.clone()).collect();
        for peer in peers {
            self.sim.topology().add_edge(address.clone(), peer.clone(), self.link);
            self.sim.topology().add_edge(peer, address.clone(), self.link);
        }
        Ok(())
    }

    /// Get a snapshot of the current metrics for `id`.
    pub async fn metrics(&self, id: NodeId) -> Result<RaftMetrics> {
        Ok(self.raft(id).await?.metrics().borrow().clone())
    }

    /// Get a `Wait` handle for `id`'s metrics stream.
    pub async fn wait(&self, id: NodeId, timeout: Duration) -> Result<Wait> {
        Ok(self.raft(id).await?.wait(Some(timeout)))
    }

    /// Wait until `id` reports the given state.
    pub async fn wait_for_state(&self, id: NodeId, state: State, timeout: Duration, msg: &str) -> Result<RaftMetrics> {
        Ok(self.wait(id, timeout).await?.state(state, msg).await?)
    }

    /// Wait until `id`'s `last_applied` reaches at least `index`.
    pub async fn wait_for_log(&self, id: NodeId, index: u64, timeout: Duration, msg: &str) -> Result<RaftMetrics> {
        Ok(self.wait(id, timeout).await?.log(index, msg).await?)
    }

    /// Return the ID of the first node in the cluster whose own metrics report it as leader, if
    /// any. Useful once an election has settled; during an election in progress this may return
    /// `None` even though a leader is about to emerge.
    pub async fn current_leader(&self) -> Option<NodeId> {
        let nodes = self.nodes.read().await;
        for node in nodes.values() {
            if node.raft.metrics().borrow().state == State::Leader {
                return Some(node.raft.metrics().borrow().id);
            }
        }
        None
    }

    /// Shut down every node's Raft task and RPC listener.
    pub async fn shutdown(&self) -> Result<()> {
        let mut nodes = self.nodes.write().await;
        for (_, node) in nodes.iter() {
            node.raft.shutdown().await?;
            node.listener_task.abort();
        }
        nodes.clear();
        Ok(())
    }
}
