//! The simulator core: topology ownership, pseudo-random drop decisions, and the priority queue
//! that schedules message delivery.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::Arc;

use rand::rngs::StdRng;
use rand::Rng;
use rand::SeedableRng;
use tokio::sync::mpsc;
use tokio::sync::Notify;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::conn::ListenerRegistration;
use crate::node::Node;
use crate::topology::Topology;
use crate::types::Endpoint;
use crate::types::Message;
use crate::types::NetworkLink;
use crate::types::NodeAddr;
use crate::types::Port;

/// A single scheduled delivery, ordered by its delivery instant and, within an instant, by
/// insertion sequence so that messages between the same ordered pair are delivered in send
/// order — the only ordering guarantee this simulator makes.
struct ScheduledDelivery {
    at: Instant,
    seq: u64,
    message: Message,
}

impl PartialEq for ScheduledDelivery {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for ScheduledDelivery {}

impl Ord for ScheduledDelivery {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed so that `BinaryHeap`, a max-heap, pops the earliest delivery first.
        other.at.cmp(&self.at).then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for ScheduledDelivery {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct Mailboxes {
    inboxes: HashMap<NodeAddr, mpsc::UnboundedSender<Message>>,
}

/// The deterministic, in-process network fabric shared by every simulated node.
///
/// Construct one `Simulator` per test, seed it for reproducibility, `add_edge` the topology, and
/// call `node(addr)` for each participant to get a handle exposing the connectionless and
/// connection-oriented APIs.
pub struct Simulator {
    pub(crate) topology: Topology,
    rng: StdMutex<StdRng>,
    mailboxes: RwLock<Mailboxes>,
    pub(crate) listeners: RwLock<HashMap<Endpoint, ListenerRegistration>>,
    queue: StdMutex<BinaryHeap<ScheduledDelivery>>,
    seq: StdMutex<u64>,
    wake: Notify,
    scheduler_task: StdMutex<Option<JoinHandle<()>>>,
}

impl Simulator {
    /// Build a simulator seeded for reproducible delivery/drop decisions.
    ///
    /// For a fixed seed, fixed event-submission order, and fixed time model, every run makes the
    /// same sequence of drop-vs-deliver decisions.
    pub fn new(seed: u64) -> Arc<Self> {
        let this = Arc::new(Self {
            topology: Topology::new(),
            rng: StdMutex::new(StdRng::seed_from_u64(seed)),
            mailboxes: RwLock::new(Mailboxes { inboxes: HashMap::new() }),
            listeners: RwLock::new(HashMap::new()),
            queue: StdMutex::new(BinaryHeap::new()),
            seq: StdMutex::new(0),
            wake: Notify::new(),
            scheduler_task: StdMutex::new(None),
        });
        let handle = tokio::spawn(Self::run_scheduler(this.clone()));
        *this.scheduler_task.lock().expect("scheduler task lock poisoned") = Some(handle);
        this
    }

    /// Register a new node address, returning a handle for its connectionless and
    /// connection-oriented APIs. Re-registering the same address replaces its mailbox, dropping
    /// any messages still addressed to the old one.
    pub async fn node(self: &Arc<Self>, address: impl Into<NodeAddr>) -> Node {
        let address = address.into();
        let (tx, rx) = mpsc::unbounded_channel();
        self.mailboxes.write().await.inboxes.insert(address.clone(), tx);
        Node::new(self.clone(), address, rx)
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    /// Try to accept `payload` for transmission on the `from -> to` edge.
    ///
    /// Returns `true` once the message has been accepted and (if not dropped) scheduled — never
    /// once it has actually been delivered. Returns `false` if no edge exists for this
    /// direction.
    pub(crate) fn offer(&self, from: NodeAddr, to: NodeAddr, payload: bytes::Bytes) -> bool {
        let link = match self.topology.get_edge(&from, &to) {
            Some(link) => link,
            None => return false,
        };
        self.schedule_if_not_dropped(from, to, payload, link);
        true
    }

    fn schedule_if_not_dropped(&self, from: NodeAddr, to: NodeAddr, payload: bytes::Bytes, link: NetworkLink) {
        let roll: f64 = self.rng.lock().expect("rng lock poisoned").gen();
        if roll >= link.reliability {
            tracing::trace!(%from, %to, roll, reliability = link.reliability, "message dropped");
            return;
        }
        let at = Instant::now() + link.latency;
        let seq = {
            let mut seq = self.seq.lock().expect("seq lock poisoned");
            *seq += 1;
            *seq
        };
        let message = Message { from, to, payload };
        self.queue.lock().expect("queue lock poisoned").push(ScheduledDelivery { at, seq, message });
        self.wake.notify_one();
    }

    async fn run_scheduler(self: Arc<Self>) {
        loop {
            let next_at = {
                let queue = self.queue.lock().expect("queue lock poisoned");
                queue.peek().map(|d| d.at)
            };

            match next_at {
                None => self.wake.notified().await,
                Some(at) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {}
                        _ = self.wake.notified() => {}
                    }
                }
            }

            self.drain_due().await;
        }
    }

    async fn drain_due(&self) {
        let now = Instant::now();
        let due = {
            let mut queue = self.queue.lock().expect("queue lock poisoned");
            let mut due = Vec::new();
            while let Some(next) = queue.peek() {
                if next.at > now {
                    break;
                }
                due.push(queue.pop().expect("peeked entry must pop").message);
            }
            due
        };

        if due.is_empty() {
            return;
        }

        let mailboxes = self.mailboxes.read().await;
        for message in due {
            if let Some(tx) = mailboxes.inboxes.get(&message.to) {
                let _ = tx.send(message);
            }
        }
    }

    pub(crate) async fn register_listener(&self, endpoint: Endpoint, registration: ListenerRegistration) -> bool {
        let mut listeners = self.listeners.write().await;
        if listeners.contains_key(&endpoint) {
            return false;
        }
        listeners.insert(endpoint, registration);
        true
    }

    pub(crate) async fn unregister_listener(&self, endpoint: &Endpoint) {
        self.listeners.write().await.remove(endpoint);
    }

    pub(crate) async fn listener_sender(&self, endpoint: &Endpoint) -> Option<mpsc::Sender<crate::conn::ConnectRequest>> {
        self.listeners.read().await.get(endpoint).map(|r| r.tx.clone())
    }
}

impl Drop for Simulator {
    fn drop(&mut self) {
        if let Some(handle) = self.scheduler_task.lock().expect("scheduler task lock poisoned").take() {
            handle.abort();
        }
    }
}

/// Fixed-size capacity for a listener's pending-connection queue. Chosen generously relative
/// to any single test's concurrency so that it
/// behaves as practically unbounded while still surfacing backpressure if a test ever floods a
/// listener faster than it accepts.
pub const LISTENER_BACKLOG: usize = 128;

pub(crate) fn port_is_valid(port: Port) -> bool {
    port != 0
}
