//! Address, endpoint and link types shared across the simulator's APIs.

use std::time::Duration;

/// A node's address within the simulated network.
///
/// Opaque and string-like, as spec'd: the simulator attaches no meaning to its contents beyond
/// equality and hashing.
pub type NodeAddr = String;

/// A port number on a simulated node, scoping a `bind`/`connect` to one of several listeners a
/// single node address might register.
pub type Port = u16;

/// A `(address, port)` pair identifying one side of a connection-oriented stream.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: NodeAddr,
    pub port: Port,
}

impl Endpoint {
    pub fn new(address: impl Into<NodeAddr>, port: Port) -> Self {
        Self {
            address: address.into(),
            port,
        }
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.address, self.port)
    }
}

/// The properties of a directed point-to-point link between two nodes.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NetworkLink {
    /// The delay applied between a message being accepted for transmission and its scheduled
    /// delivery.
    pub latency: Duration,
    /// The probability, in `[0, 1]`, that a given transmitted message is actually delivered.
    pub reliability: f64,
}

impl NetworkLink {
    pub fn new(latency: Duration, reliability: f64) -> Self {
        debug_assert!((0.0..=1.0).contains(&reliability), "reliability must be in [0, 1]");
        Self { latency, reliability }
    }

    /// A perfectly reliable link with the given latency.
    pub fn reliable(latency: Duration) -> Self {
        Self::new(latency, 1.0)
    }
}

/// A connectionless message delivered to a node's mailbox.
#[derive(Clone, Debug)]
pub struct Message {
    pub from: NodeAddr,
    pub to: NodeAddr,
    pub payload: bytes::Bytes,
}
