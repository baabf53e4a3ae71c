//! A harness that binds `raft-core` to `netsim`: a `RaftNetwork` transport whose RPCs ride the
//! simulator's connection-oriented API, and a `SimCluster` for standing up and driving multi-node
//! scenarios in tests.

pub mod cluster;
pub mod network;
mod rpc;
mod serve;

pub use cluster::SimCluster;
pub use network::Directory;
pub use network::SimNetwork;

/// The concrete `Raft` type every simulated node runs: `memstore`'s application data and
/// response types, over a `SimNetwork` transport and a `MemStore` backend.
pub type SimRaft = raft_core::Raft<memstore::ClientRequest, memstore::ClientResponse, SimNetwork, memstore::MemStore>;
