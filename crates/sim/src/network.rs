//! The simulated network: a shared registry of live nodes and the transport
//! that dispatches RPCs to them.

use kadsim_common::{KadError, NodeId};
use kadsim_kad::contact::Contact;
use kadsim_kad::rpc::{KadRequest, KadResponse, KadTransport};
use kadsim_kad::Kad;
use rand::Rng;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::RwLock;

/// A node living on the simulated network.
pub type SimNode = Kad<SimTransport>;

#[derive(Default)]
struct Registry {
    nodes: HashMap<NodeId, Arc<SimNode>>,
    /// Registration order, for uniform bootstrap selection.
    contacts: Vec<Contact>,
}

/// Registry of every node on the simulated network.
#[derive(Default)]
pub struct SimNetwork {
    registry: RwLock<Registry>,
    offline: RwLock<HashSet<NodeId>>,
    collisions: AtomicUsize,
}

impl std::fmt::Debug for SimNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimNetwork")
            .field("collisions", &self.collisions())
            .finish_non_exhaustive()
    }
}

impl SimNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport bound to this network.
    pub fn transport(self: &Arc<Self>) -> SimTransport {
        SimTransport {
            network: Arc::downgrade(self),
        }
    }

    /// Add `node` to the network.
    ///
    /// Returns a uniformly chosen already registered node to bootstrap from,
    /// or `None` for the first node. Fails with `IdentityCollision` if the
    /// node's ID is taken.
    pub async fn register(&self, node: Arc<SimNode>) -> Result<Option<Contact>, KadError> {
        let id = node.local_id();
        let mut registry = self.registry.write().await;

        if registry.nodes.contains_key(&id) {
            self.collisions.fetch_add(1, Ordering::Relaxed);
            kadsim_metrics::metrics().collisions.inc();
            return Err(KadError::IdentityCollision(id));
        }

        let bootstrap = if registry.contacts.is_empty() {
            None
        } else {
            let pick = rand::thread_rng().gen_range(0..registry.contacts.len());
            Some(registry.contacts[pick])
        };

        registry.contacts.push(*node.local_contact());
        registry.nodes.insert(id, node);
        Ok(bootstrap)
    }

    /// Deliver `request` to the node behind `target`.
    pub async fn dispatch(
        &self,
        target: &Contact,
        request: KadRequest,
    ) -> Result<KadResponse, KadError> {
        if self.offline.read().await.contains(&target.id) {
            return Err(KadError::Unreachable(target.id));
        }
        let node = self
            .node(&target.id)
            .await
            .ok_or(KadError::NodeNotFound(target.id))?;
        Ok(node.handle_request(request).await)
    }

    /// Take a node off the air (or bring it back) without unregistering it.
    pub async fn set_online(&self, id: &NodeId, online: bool) {
        let mut offline = self.offline.write().await;
        if online {
            offline.remove(id);
        } else {
            offline.insert(*id);
        }
    }

    /// Unregister a node.
    pub async fn remove(&self, id: &NodeId) -> Option<Arc<SimNode>> {
        let mut registry = self.registry.write().await;
        let node = registry.nodes.remove(id)?;
        registry.contacts.retain(|c| c.id != *id);
        Some(node)
    }

    pub async fn node(&self, id: &NodeId) -> Option<Arc<SimNode>> {
        self.registry.read().await.nodes.get(id).cloned()
    }

    /// All registered nodes, in registration order.
    pub async fn nodes(&self) -> Vec<Arc<SimNode>> {
        let registry = self.registry.read().await;
        registry
            .contacts
            .iter()
            .filter_map(|c| registry.nodes.get(&c.id).cloned())
            .collect()
    }

    pub async fn len(&self) -> usize {
        self.registry.read().await.nodes.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of rejected registrations so far.
    pub fn collisions(&self) -> usize {
        self.collisions.load(Ordering::Relaxed)
    }

    /// `(owner, peer)` for every routing-table entry of every node.
    pub async fn edges(&self) -> Vec<(NodeId, NodeId)> {
        let mut edges = Vec::new();
        for node in self.nodes().await {
            edges.extend(node.edges().await);
        }
        edges
    }
}

/// Transport that reaches other nodes through a [`SimNetwork`].
///
/// Holds a weak reference so nodes never keep their network alive.
#[derive(Debug, Clone)]
pub struct SimTransport {
    network: Weak<SimNetwork>,
}

#[async_trait::async_trait]
impl KadTransport for SimTransport {
    async fn send_request(
        &self,
        target: &Contact,
        request: KadRequest,
    ) -> Result<KadResponse, KadError> {
        let network = self
            .network
            .upgrade()
            .ok_or_else(|| KadError::Internal("simulated network has shut down".into()))?;
        network.dispatch(target, request).await
    }
}
