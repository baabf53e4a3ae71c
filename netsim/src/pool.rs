//! A per-node cache of open connections, keyed by `(remote_address, remote_port)`.

use tokio::sync::Mutex;
use std::collections::HashMap;

use crate::conn::Connection;
use crate::types::NodeAddr;
use crate::types::Port;

/// Reuses an already-established `Connection` for a repeat `connect` to the same peer instead of
/// paying for another handshake. Holds at most one connection per key; a second `put_back` for a
/// key that already has one simply drops the older connection.
#[derive(Default)]
pub struct ConnectionPool {
    open: Mutex<HashMap<(NodeAddr, Port), Connection>>,
}

impl ConnectionPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove and return a pooled connection for `(remote_address, remote_port)`, if any.
    pub async fn take(&self, remote_address: &str, remote_port: Port) -> Option<Connection> {
        self.open.lock().await.remove(&(remote_address.to_string(), remote_port))
    }

    /// Return a connection for reuse. Closed connections are dropped rather than pooled, since a
    /// future `take` would otherwise hand back a stream that can no longer read or write.
    pub async fn put_back(&self, conn: Connection) {
        if !conn.is_open() {
            return;
        }
        let key = (conn.remote_endpoint().address.clone(), conn.remote_endpoint().port);
        self.open.lock().await.insert(key, conn);
    }
}
