//! In-process transport connecting replicas of one group through
//! channels, for tests and single-process deployments.
use crate::{
    commands::{Inbound, Transport},
    NodeId,
};
use bytes::Bytes;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// Inbound channel of a joined node, tagged with the join that created it
struct Route {
    generation: u64,
    sender: mpsc::UnboundedSender<(NodeId, Bytes)>,
}

#[derive(Default)]
struct Routes {
    routes: Vec<Option<Route>>,
    generations: u64,
}

/// Channels between the members of a group.
///
/// Messages from one node to another are delivered in the order sent.
/// A crashed node neither sends nor receives until it joins again.
#[derive(Clone)]
pub struct LocalNetwork {
    routes: Arc<Mutex<Routes>>,
}

impl LocalNetwork {
    /// Network for a group of `size` nodes, none of them joined
    pub fn new(size: usize) -> LocalNetwork {
        let routes = Routes { routes: (0..size).map(|_| None).collect(), generations: 0 };
        LocalNetwork { routes: Arc::new(Mutex::new(routes)) }
    }

    /// Connects a node, replacing any earlier connection for it.
    ///
    /// # Panics
    ///
    /// Panics if the node is outside the group.
    pub fn join(&self, node: NodeId) -> (LocalTransport, Inbound) {
        let mut routes = self.lock();
        assert!((node as usize) < routes.routes.len(), "node {} outside the group", node);

        routes.generations += 1;
        let generation = routes.generations;
        let (sender, inbound) = mpsc::unbounded_channel();
        routes.routes[node as usize] = Some(Route { generation, sender });
        debug!("Node {} joined the local network", node);

        let transport = LocalTransport { node, generation, routes: self.routes.clone() };
        (transport, inbound)
    }

    /// Disconnects a node. Messages already queued for it are dropped
    /// along with its inbound stream.
    pub fn crash(&self, node: NodeId) {
        if let Some(route) = self.lock().routes.get_mut(node as usize) {
            if route.take().is_some() {
                info!("Node {} disconnected from the local network", node);
            }
        }
    }

    /// Whether the node is currently joined
    pub fn is_connected(&self, node: NodeId) -> bool {
        matches!(self.lock().routes.get(node as usize), Some(Some(_)))
    }

    fn lock(&self) -> MutexGuard<'_, Routes> {
        lock(&self.routes)
    }
}

fn lock(routes: &Mutex<Routes>) -> MutexGuard<'_, Routes> {
    match routes.lock() {
        Ok(routes) => routes,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Transport for one node of a [`LocalNetwork`].
pub struct LocalTransport {
    node: NodeId,
    generation: u64,
    routes: Arc<Mutex<Routes>>,
}

impl LocalTransport {
    /// Node this transport sends from
    pub fn node(&self) -> NodeId {
        self.node
    }

    /// Delivers to every target while this connection is still the
    /// node's current one.
    fn deliver<I: Iterator<Item = NodeId>>(&self, targets: I, payload: Bytes) {
        let routes = lock(&self.routes);
        match routes.routes.get(self.node as usize) {
            Some(Some(route)) if route.generation == self.generation => {}
            _ => {
                trace!("Node {} is disconnected, dropping message", self.node);
                return;
            }
        }

        for target in targets {
            if let Some(Some(route)) = routes.routes.get(target as usize) {
                // the receiver may be gone while the replica stops
                let _ = route.sender.send((self.node, payload.clone()));
            }
        }
    }
}

impl Transport for LocalTransport {
    fn send(&self, node: NodeId, payload: Bytes) {
        self.deliver(std::iter::once(node), payload);
    }

    fn broadcast(&self, payload: Bytes) {
        let size = lock(&self.routes).routes.len() as NodeId;
        let current = self.node;
        self.deliver((0..size).filter(|n| *n != current), payload);
    }

    fn shutdown(&self) {
        let mut routes = lock(&self.routes);
        if let Some(route) = routes.routes.get_mut(self.node as usize) {
            if route.as_ref().map(|r| r.generation) == Some(self.generation) {
                *route = None;
                debug!("Node {} left the local network", self.node);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn send_and_broadcast() {
        let network = LocalNetwork::new(3);
        let (a, mut a_in) = network.join(0);
        let (b, mut b_in) = network.join(1);
        let (_c, mut c_in) = network.join(2);

        a.send(1, "one".into());
        a.send(1, "two".into());
        assert_eq!((0, Bytes::from("one")), b_in.try_recv().unwrap());
        assert_eq!((0, Bytes::from("two")), b_in.try_recv().unwrap());

        b.broadcast("all".into());
        assert_eq!((1, Bytes::from("all")), a_in.try_recv().unwrap());
        assert_eq!((1, Bytes::from("all")), c_in.try_recv().unwrap());

        // broadcast excludes the sender
        assert!(b_in.try_recv().is_err());
    }

    #[test]
    fn crashed_node_is_isolated() {
        let network = LocalNetwork::new(3);
        let (a, mut a_in) = network.join(0);
        let (b, mut b_in) = network.join(1);
        let (_c, mut c_in) = network.join(2);

        network.crash(1);
        assert!(!network.is_connected(1));

        // nothing reaches the crashed node
        a.broadcast("x".into());
        assert!(b_in.try_recv().is_err());
        assert_eq!((0, Bytes::from("x")), c_in.try_recv().unwrap());

        // nothing leaves it
        b.broadcast("y".into());
        assert!(a_in.try_recv().is_err());
        assert!(c_in.try_recv().is_err());
    }

    #[test]
    fn rejoin_replaces_connection() {
        let network = LocalNetwork::new(2);
        let (a, _a_in) = network.join(0);
        let (old, _old_in) = network.join(1);
        let (new, mut new_in) = network.join(1);

        // shutting down a stale connection leaves the new one alone
        old.shutdown();
        assert!(network.is_connected(1));

        a.send(1, "hello".into());
        assert_eq!((0, Bytes::from("hello")), new_in.try_recv().unwrap());

        new.shutdown();
        assert!(!network.is_connected(1));
    }

    #[test]
    fn unknown_nodes_ignored() {
        let network = LocalNetwork::new(2);
        let (a, _a_in) = network.join(0);
        a.send(7, "lost".into());
        network.crash(9);
        assert!(!network.is_connected(9));
    }
}
