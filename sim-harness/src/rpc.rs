//! The wire frames exchanged over a `netsim::Connection` to carry Raft RPCs.
//!
//! Each `Connection::write`/`read` call already transmits one whole frame, so there is no
//! length-prefixing to do here: a frame is just a JSON-encoded `RpcRequest` or `RpcResponse`.

use serde::Deserialize;
use serde::Serialize;

use raft_core::raft::AppendEntriesRequest;
use raft_core::raft::AppendEntriesResponse;
use raft_core::raft::InstallSnapshotRequest;
use raft_core::raft::InstallSnapshotResponse;
use raft_core::raft::VoteRequest;
use raft_core::raft::VoteResponse;

use memstore::ClientRequest;

#[derive(Debug, Serialize, Deserialize)]
pub enum RpcRequest {
    AppendEntries(AppendEntriesRequest<ClientRequest>),
    InstallSnapshot(InstallSnapshotRequest),
    Vote(VoteRequest),
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RpcResponse {
    AppendEntries(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotResponse),
    Vote(VoteResponse),
    Error(String),
}
