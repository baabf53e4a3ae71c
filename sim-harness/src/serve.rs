//! The RPC server side: accept connections on a node's bound port and dispatch each incoming
//! frame to the local `Raft` instance.

use std::time::Duration;

use bytes::Bytes;

use netsim::Connection;
use netsim::Listener;
use netsim::NetError;

use crate::rpc::RpcRequest;
use crate::rpc::RpcResponse;
use crate::SimRaft;

const ACCEPT_TIMEOUT: Duration = Duration::from_secs(3600);
const FRAME_TIMEOUT: Duration = Duration::from_secs(3600);

/// Accept connections on `listener` forever, spawning one handler task per connection.
///
/// Runs until the listener is closed (its owning node shut down), at which point `accept`
/// resolves with `NetError::Shutdown` and this loop returns.
pub(crate) async fn serve(listener: Listener, raft: SimRaft) {
    loop {
        match listener.accept(ACCEPT_TIMEOUT).await {
            Ok(conn) => {
                let raft = raft.clone();
                tokio::spawn(async move { serve_connection(conn, raft).await });
            }
            Err(NetError::Timeout) => continue,
            Err(_) => return,
        }
    }
}

async fn serve_connection(conn: Connection, raft: SimRaft) {
    loop {
        let frame = match conn.read(FRAME_TIMEOUT).await {
            Ok(frame) => frame,
            Err(_) => return,
        };

        let req: RpcRequest = match serde_json::from_slice(&frame) {
            Ok(req) => req,
            Err(err) => {
                tracing::warn!(error=%err, "dropping malformed RPC frame");
                return;
            }
        };

        let resp = dispatch(&raft, req).await;
        let body = match serde_json::to_vec(&resp) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(error=%err, "failed to encode RPC response");
                return;
            }
        };

        if conn.write(Bytes::from(body), FRAME_TIMEOUT).await.is_err() {
            return;
        }
    }
}

async fn dispatch(raft: &SimRaft, req: RpcRequest) -> RpcResponse {
    match req {
        RpcRequest::AppendEntries(rpc) => match raft.append_entries(rpc).await {
            Ok(resp) => RpcResponse::AppendEntries(resp),
            Err(err) => RpcResponse::Error(err.to_string()),
        },
        RpcRequest::InstallSnapshot(rpc) => match raft.install_snapshot(rpc).await {
            Ok(resp) => RpcResponse::InstallSnapshot(resp),
            Err(err) => RpcResponse::Error(err.to_string()),
        },
        RpcRequest::Vote(rpc) => match raft.vote(rpc).await {
            Ok(resp) => RpcResponse::Vote(resp),
            Err(err) => RpcResponse::Error(err.to_string()),
        },
    }
}
