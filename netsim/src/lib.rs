//! A deterministic, in-process network simulator.
//!
//! A [`Simulator`] owns a directed [`Topology`] of point-to-point links (latency + reliability)
//! and a seeded pseudo-random source that decides, reproducibly, which transmitted messages are
//! actually delivered. Each participant obtains a [`Node`] handle exposing two APIs over the same
//! fabric:
//!
//! - connectionless `send`/`receive`, where each call is independently subject to the edge's
//!   latency and drop probability;
//! - connection-oriented `bind`/`accept`/`connect`, producing a [`Connection`] that, once
//!   established, behaves as a reliable, in-order stream and can be pooled and reused by
//!   [`ConnectionPool`].
//!
//! Given the same seed, the same sequence of topology edits, and the same order of calls into the
//! simulator, every run makes the same delivery decisions.

mod conn;
mod error;
mod node;
mod pool;
mod scheduler;
mod topology;
mod types;

pub use conn::Connection;
pub use conn::Listener;
pub use error::NetError;
pub use node::Node;
pub use pool::ConnectionPool;
pub use scheduler::Simulator;
pub use topology::Topology;
pub use types::Endpoint;
pub use types::Message;
pub use types::NetworkLink;
pub use types::NodeAddr;
pub use types::Port;
