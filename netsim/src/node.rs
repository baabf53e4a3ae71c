//! The connectionless per-node API: `send`/`receive` over the simulated fabric.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::Mutex;

use crate::conn::Connection;
use crate::conn::Listener;
use crate::error::NetError;
use crate::pool::ConnectionPool;
use crate::scheduler::Simulator;
use crate::types::Message;
use crate::types::NodeAddr;
use crate::types::Port;

/// A handle to one simulated node's connectionless mailbox and connection-oriented endpoints.
///
/// Cheap to clone: the mailbox receiver and the connection pool are each shared behind their own
/// `Arc`, so every clone of a `Node` sees the same inbox and reuses the same pooled connections
/// rather than starting from an empty pool.
#[derive(Clone)]
pub struct Node {
    sim: Arc<Simulator>,
    address: NodeAddr,
    inbox: Arc<Mutex<mpsc::UnboundedReceiver<Message>>>,
    pub(crate) pool: Arc<ConnectionPool>,
}

impl Node {
    pub(crate) fn new(sim: Arc<Simulator>, address: NodeAddr, inbox: mpsc::UnboundedReceiver<Message>) -> Self {
        Self {
            sim,
            address,
            inbox: Arc::new(Mutex::new(inbox)),
            pool: Arc::new(ConnectionPool::new()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Offer `payload` for transmission to `to`. Resolves `true` once accepted for transmission
    /// (queued, or immediately marked as dropped internally) — acceptance does not imply
    /// delivery. Resolves `false` if no edge exists for this direction, or the deadline
    /// elapses first.
    pub async fn send(&self, to: &str, payload: impl Into<bytes::Bytes>, timeout: Duration) -> bool {
        let sim = self.sim.clone();
        let from = self.address.clone();
        let to = to.to_string();
        let payload = payload.into();
        match tokio::time::timeout(timeout, async move { sim.offer(from, to, payload) }).await {
            Ok(accepted) => accepted,
            Err(_) => false,
        }
    }

    /// Await the next message delivered to this node's mailbox.
    pub async fn receive(&self, timeout: Duration) -> Result<Message, NetError> {
        let mut inbox = self.inbox.lock().await;
        match tokio::time::timeout(timeout, inbox.recv()).await {
            Ok(Some(message)) => Ok(message),
            Ok(None) => Err(NetError::Shutdown),
            Err(_) => Err(NetError::Timeout),
        }
    }

    /// Reserve a `(this_address, port)` endpoint for incoming connections.
    pub async fn bind(&self, port: Port) -> Result<Listener, NetError> {
        Listener::bind(self.sim.clone(), self.address.clone(), port).await
    }

    /// Perform a three-step handshake with `remote_address:remote_port`, reusing a pooled
    /// connection for this `(remote_address, remote_port)` key when one is open and available.
    pub async fn connect(
        &self,
        remote_address: &str,
        remote_port: Port,
        local_port: Port,
        timeout: Duration,
    ) -> Result<Connection, NetError> {
        if let Some(conn) = self.pool.take(remote_address, remote_port).await {
            if conn.is_open() {
                return Ok(conn);
            }
        }
        Connection::connect(self.sim.clone(), self.address.clone(), local_port, remote_address, remote_port, timeout)
            .await
    }

    /// Return a connection to this node's pool for reuse by a future `connect` to the same key.
    /// A closed or faulted connection is dropped instead of pooled.
    pub async fn return_connection(&self, conn: Connection) {
        self.pool.put_back(conn).await;
    }
}
