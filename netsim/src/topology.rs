//! The directed graph of simulated links between node addresses.

use std::collections::HashMap;
use std::sync::RwLock;

use crate::types::NetworkLink;
use crate::types::NodeAddr;

/// A directed graph of point-to-point links.
///
/// `add_edge(a, b, link)` sets the properties of the `a -> b` direction only; the reverse
/// direction, if needed, must be added separately. An unset direction is undeliverable — `send`
/// from a node with no outbound edge to its destination is simply not accepted.
#[derive(Default)]
pub struct Topology {
    edges: RwLock<HashMap<(NodeAddr, NodeAddr), NetworkLink>>,
}

impl Topology {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set (or replace) the properties of the `from -> to` direction.
    pub fn add_edge(&self, from: impl Into<NodeAddr>, to: impl Into<NodeAddr>, link: NetworkLink) {
        let mut edges = self.edges.write().expect("topology lock poisoned");
        edges.insert((from.into(), to.into()), link);
    }

    /// Remove the `from -> to` direction, making it undeliverable. Used to simulate partitions:
    /// a full partition of a node removes both directions of every edge touching it.
    pub fn remove_edge(&self, from: &str, to: &str) {
        let mut edges = self.edges.write().expect("topology lock poisoned");
        edges.remove(&(from.to_string(), to.to_string()));
    }

    pub fn has_edge(&self, from: &str, to: &str) -> bool {
        let edges = self.edges.read().expect("topology lock poisoned");
        edges.contains_key(&(from.to_string(), to.to_string()))
    }

    pub fn get_edge(&self, from: &str, to: &str) -> Option<NetworkLink> {
        let edges = self.edges.read().expect("topology lock poisoned");
        edges.get(&(from.to_string(), to.to_string())).copied()
    }

    /// Remove every edge touching `node`, in both directions. Convenience for partition tests
    /// (spec.md S2: "Partition `N1` (remove both directions of its edges)").
    pub fn isolate(&self, node: &str) {
        let mut edges = self.edges.write().expect("topology lock poisoned");
        edges.retain(|(a, b), _| a != node && b != node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn add_edge_preserves_latency_and_reliability() {
        let topo = Topology::new();
        topo.add_edge("a", "b", NetworkLink::new(Duration::from_millis(42), 0.75));

        assert!(topo.has_edge("a", "b"));
        assert!(!topo.has_edge("b", "a"));

        let edge = topo.get_edge("a", "b").unwrap();
        assert_eq!(edge.latency, Duration::from_millis(42));
        assert_eq!(edge.reliability, 0.75);
    }

    #[test]
    fn zero_latency_is_preserved() {
        let topo = Topology::new();
        topo.add_edge("a", "b", NetworkLink::reliable(Duration::from_millis(0)));
        assert_eq!(topo.get_edge("a", "b").unwrap().latency, Duration::from_millis(0));
    }

    #[test]
    fn isolate_removes_both_directions() {
        let topo = Topology::new();
        topo.add_edge("a", "b", NetworkLink::reliable(Duration::from_millis(1)));
        topo.add_edge("b", "a", NetworkLink::reliable(Duration::from_millis(1)));
        topo.add_edge("b", "c", NetworkLink::reliable(Duration::from_millis(1)));

        topo.isolate("a");

        assert!(!topo.has_edge("a", "b"));
        assert!(!topo.has_edge("b", "a"));
        assert!(topo.has_edge("b", "c"));
    }
}
