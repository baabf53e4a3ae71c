//! The connection-oriented API: `bind`/`accept`/`connect`, and the resulting `Connection`.

use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::oneshot;
use tokio::sync::Mutex;

use crate::error::NetError;
use crate::scheduler::port_is_valid;
use crate::scheduler::Simulator;
use crate::scheduler::LISTENER_BACKLOG;
use crate::types::Endpoint;
use crate::types::NodeAddr;
use crate::types::Port;

/// A handshake request enqueued by `Node::connect`, consumed by a matching `Listener::accept`.
///
/// Holds the receive half of the client->listener frame channel and the send half of the
/// listener->client frame channel, so that whichever side's future resolves second still has
/// everything needed to build its local `Connection` without further coordination.
pub struct ConnectRequest {
    remote_endpoint: Endpoint,
    inbound: mpsc::UnboundedReceiver<Bytes>,
    outbound: mpsc::UnboundedSender<Bytes>,
    ack: oneshot::Sender<()>,
}

#[derive(Clone)]
pub(crate) struct ListenerRegistration {
    pub(crate) tx: mpsc::Sender<ConnectRequest>,
}

/// A bound `(address, port)` endpoint accepting incoming connections.
pub struct Listener {
    sim: Arc<Simulator>,
    local: Endpoint,
    rx: Mutex<mpsc::Receiver<ConnectRequest>>,
}

impl Listener {
    pub(crate) async fn bind(sim: Arc<Simulator>, address: NodeAddr, port: Port) -> Result<Self, NetError> {
        if !port_is_valid(port) {
            return Err(NetError::ProtocolError("port 0 is not bindable".into()));
        }
        let local = Endpoint::new(address, port);
        let (tx, rx) = mpsc::channel(LISTENER_BACKLOG);
        if !sim.register_listener(local.clone(), ListenerRegistration { tx }).await {
            return Err(NetError::ProtocolError(format!("{} is already bound", local)));
        }
        Ok(Self {
            sim,
            local,
            rx: Mutex::new(rx),
        })
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    /// Accept the next completed handshake, fair FIFO over this listener's pending queue.
    pub async fn accept(&self, timeout: Duration) -> Result<Connection, NetError> {
        let mut rx = self.rx.lock().await;
        let req = match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(req)) => req,
            Ok(None) => return Err(NetError::Shutdown),
            Err(_) => return Err(NetError::Timeout),
        };

        let _ = req.ack.send(());
        Ok(Connection::new(
            self.sim.clone(),
            self.local.clone(),
            req.remote_endpoint,
            req.outbound,
            req.inbound,
        ))
    }

    /// Stop accepting new connections. Requests already queued are dropped, which resolves any
    /// matching in-flight `connect` with `NetError::Shutdown` once their `ack` sender is dropped
    /// without firing.
    pub async fn close(&self) {
        self.sim.unregister_listener(&self.local).await;
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        let sim = self.sim.clone();
        let local = self.local.clone();
        tokio::spawn(async move { sim.unregister_listener(&local).await });
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// An established, full-duplex connection-oriented stream between two endpoints.
pub struct Connection {
    id: u64,
    sim: Arc<Simulator>,
    local: Endpoint,
    remote: Endpoint,
    outbound: mpsc::UnboundedSender<Bytes>,
    inbound: Mutex<mpsc::UnboundedReceiver<Bytes>>,
    open: Arc<AtomicBool>,
}

impl Connection {
    fn new(
        sim: Arc<Simulator>,
        local: Endpoint,
        remote: Endpoint,
        outbound: mpsc::UnboundedSender<Bytes>,
        inbound: mpsc::UnboundedReceiver<Bytes>,
    ) -> Self {
        Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            sim,
            local,
            remote,
            outbound,
            inbound: Mutex::new(inbound),
            open: Arc::new(AtomicBool::new(true)),
        }
    }

    /// A process-local identity for this connection object, stable across pool round-trips.
    /// Exists so tests can assert that a pooled connection is reused rather than re-dialed.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Perform the client side of a three-step handshake (SYN / SYN-ACK / ACK) against a
    /// listener bound at `remote_address:remote_port`.
    ///
    /// The simulator models the round trip as a single `edge.latency` delay applied to the
    /// connect request's arrival at the listener, rather than three discrete on-wire frames —
    /// what matters observably is the handshake's *content* (who connects to whom), not its
    /// literal frame count.
    pub(crate) async fn connect(
        sim: Arc<Simulator>,
        local_address: NodeAddr,
        local_port: Port,
        remote_address: &str,
        remote_port: Port,
        timeout: Duration,
    ) -> Result<Connection, NetError> {
        if !port_is_valid(remote_port) {
            return Err(NetError::ProtocolError("port 0 is not a valid connect target".into()));
        }
        let local = Endpoint::new(local_address.clone(), local_port);
        let remote = Endpoint::new(remote_address, remote_port);

        let link = sim
            .topology()
            .get_edge(&local_address, remote_address)
            .ok_or_else(|| NetError::NetworkError(remote.to_string()))?;

        let (tx_c2l, rx_c2l) = mpsc::unbounded_channel::<Bytes>();
        let (tx_l2c, rx_l2c) = mpsc::unbounded_channel::<Bytes>();
        let (ack_tx, ack_rx) = oneshot::channel();

        let req = ConnectRequest {
            remote_endpoint: local.clone(),
            inbound: rx_c2l,
            outbound: tx_l2c,
            ack: ack_tx,
        };

        let handshake = async {
            tokio::time::sleep(link.latency).await;
            let listener_tx = loop {
                match sim.listener_sender(&remote).await {
                    Some(tx) => break tx,
                    None => tokio::time::sleep(Duration::from_millis(1)).await,
                }
            };
            listener_tx.send(req).await.map_err(|_| NetError::NetworkError(remote.to_string()))?;
            ack_rx.await.map_err(|_| NetError::Shutdown)
        };

        match tokio::time::timeout(timeout, handshake).await {
            Ok(Ok(())) => Ok(Connection::new(sim, local, remote, tx_c2l, rx_l2c)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(NetError::Timeout),
        }
    }

    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }

    pub fn remote_endpoint(&self) -> &Endpoint {
        &self.remote
    }

    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    /// Write a single frame. Resolves `true` once accepted for transmission; `false` on timeout.
    pub async fn write(&self, payload: impl Into<Bytes>, timeout: Duration) -> Result<bool, NetError> {
        if !self.is_open() {
            return Err(NetError::ConnectionClosed);
        }
        let latency = self
            .sim
            .topology()
            .get_edge(&self.local.address, &self.remote.address)
            .map(|l| l.latency)
            .unwrap_or_default();
        let payload = payload.into();
        let tx = self.outbound.clone();
        let send = async move {
            tokio::time::sleep(latency).await;
            tx.send(payload).is_ok()
        };
        match tokio::time::timeout(timeout, send).await {
            Ok(accepted) => Ok(accepted),
            Err(_) => Ok(false),
        }
    }

    /// Read the next whole delivered frame on this stream.
    pub async fn read(&self, timeout: Duration) -> Result<Bytes, NetError> {
        if !self.is_open() {
            return Err(NetError::ConnectionClosed);
        }
        let mut inbound = self.inbound.lock().await;
        match tokio::time::timeout(timeout, inbound.recv()).await {
            Ok(Some(payload)) => Ok(payload),
            Ok(None) => {
                self.open.store(false, Ordering::SeqCst);
                Err(NetError::ConnectionClosed)
            }
            Err(_) => Err(NetError::Timeout),
        }
    }

    pub fn close(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
