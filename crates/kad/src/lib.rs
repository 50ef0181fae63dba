//! kadsim-kad: Kademlia node logic.
//!
//! This crate implements the Kademlia routing table with liveness-checked
//! eviction, the iterative parallel FIND_NODE lookup, the join sequence built
//! on top of it, and a pluggable transport layer so nodes can be wired
//! together in-process or over a real network.

pub mod chaos;
pub mod contact;
pub mod lookup;
pub mod routing_table;
pub mod rpc;

use contact::Contact;
use lookup::{ContactSink, LookupConfig, LookupOutcome};
use routing_table::{RoutingTable, UpdateResult};
use rpc::{KadRequest, KadResponse, KadTransport};

use kadsim_common::{IdSpace, KadError, NodeId};
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::time::Duration;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for a Kademlia node.
#[derive(Debug, Clone)]
pub struct KadConfig {
    /// Identifier space shared by every node of the network.
    pub space: IdSpace,
    /// Number of entries per k-bucket and number of closest nodes to return.
    pub k: usize,
    /// Parallelism factor for iterative lookups.
    pub alpha: usize,
    /// Timeout for individual RPC calls.
    pub rpc_timeout: Duration,
}

impl Default for KadConfig {
    fn default() -> Self {
        Self {
            space: IdSpace::default(),
            k: routing_table::DEFAULT_K,
            alpha: 3,
            rpc_timeout: Duration::from_secs(5),
        }
    }
}

impl KadConfig {
    fn to_lookup_config(&self) -> LookupConfig {
        LookupConfig {
            k: self.k,
            alpha: self.alpha,
            timeout: self.rpc_timeout,
        }
    }
}

// ---------------------------------------------------------------------------
// Kad node
// ---------------------------------------------------------------------------

/// A Kademlia node: one contact and one routing table.
///
/// Generic over `T: KadTransport` for testability. The routing table lock is
/// never held across a network call.
pub struct Kad<T: KadTransport> {
    local: Contact,
    routing_table: Arc<RwLock<RoutingTable>>,
    transport: Arc<T>,
    config: KadConfig,
}

impl<T: KadTransport> std::fmt::Debug for Kad<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kad")
            .field("local", &self.local)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl<T: KadTransport> Kad<T> {
    /// Create a new Kademlia node with an empty routing table.
    pub fn new(local: Contact, transport: T, config: KadConfig) -> Self {
        let routing_table = Arc::new(RwLock::new(RoutingTable::new(
            local.id,
            config.space,
            config.k,
        )));

        Self {
            local,
            routing_table,
            transport: Arc::new(transport),
            config,
        }
    }

    /// The local node's contact.
    pub fn local_contact(&self) -> &Contact {
        &self.local
    }

    /// The local node's ID.
    pub fn local_id(&self) -> NodeId {
        self.local.id
    }

    pub fn config(&self) -> &KadConfig {
        &self.config
    }

    /// Access the routing table.
    pub fn routing_table(&self) -> &Arc<RwLock<RoutingTable>> {
        &self.routing_table
    }

    pub fn transport(&self) -> &Arc<T> {
        &self.transport
    }

    // -----------------------------------------------------------------------
    // Routing table maintenance
    // -----------------------------------------------------------------------

    /// Insert or refresh `contact`, pinging the least-recently seen entry
    /// when its bucket is full.
    ///
    /// Only one such ping runs per bucket. Newcomers arriving while it is in
    /// flight (including ones reached through the ping itself) are ignored.
    pub async fn add_contact(&self, contact: Contact) -> UpdateResult {
        let first = self.routing_table.write().await.update(contact);
        let UpdateResult::Pending { to_ping, pending } = first else {
            return first;
        };

        let mut guard = PingGuard {
            table: &self.routing_table,
            pinged: to_ping.id,
            armed: true,
        };
        let alive = self.ping(&to_ping).await;
        guard.armed = false;
        let result = self
            .routing_table
            .write()
            .await
            .apply_ping_result(&to_ping.id, alive, pending);

        if !alive {
            kadsim_metrics::metrics().evictions.inc();
            tracing::debug!(
                node = %self.local.id,
                evicted = %to_ping.id,
                added = %pending.id,
                "evicted unresponsive contact"
            );
        }
        result
    }

    /// Like [`add_contact`](Self::add_contact) for a contact that may be absent.
    pub async fn try_add_contact(
        &self,
        contact: Option<Contact>,
    ) -> Result<UpdateResult, KadError> {
        let contact = contact.ok_or(KadError::MissingContact)?;
        Ok(self.add_contact(contact).await)
    }

    /// Send a PING. Any failure, including a timeout, reads as `false`.
    pub async fn ping(&self, peer: &Contact) -> bool {
        let request = KadRequest::Ping { sender: self.local };
        matches!(
            rpc::call(
                self.transport.as_ref(),
                peer,
                request,
                self.config.rpc_timeout
            )
            .await,
            Some(KadResponse::Pong { .. })
        )
    }

    // -----------------------------------------------------------------------
    // Join
    // -----------------------------------------------------------------------

    /// Join the network through `bootstrap`.
    ///
    /// 1. Seed the routing table with the bootstrap peer.
    /// 2. Look up our own ID to learn the neighbourhood.
    /// 3. Look up a far identifier, beyond the bucket of our closest peer,
    ///    to populate distant buckets.
    ///
    /// Without a bootstrap peer (first node of the network) this does nothing.
    pub async fn join(&self, bootstrap: Option<Contact>) {
        let Some(seed) = bootstrap else {
            tracing::debug!(node = %self.local.id, "no bootstrap peer, starting alone");
            return;
        };

        self.add_contact(seed).await;
        let own = self.lookup(self.local.id).await;

        let far = self.far_identifier().await;
        if let Some(far) = far {
            self.lookup(far).await;
        }

        tracing::debug!(
            node = %self.local.id,
            bootstrap = %seed.id,
            neighbours = own.closest.len(),
            "joined"
        );
    }

    /// A random identifier whose bucket lies beyond that of the closest
    /// known peer, or `None` while the routing table is empty.
    pub async fn far_identifier(&self) -> Option<NodeId> {
        let closest = self.routing_table.read().await.closest()?;
        let floor = self.local.id.bucket_index(&closest.id)?;
        Some(self.config.space.far_identifier(&self.local.id, floor))
    }

    // -----------------------------------------------------------------------
    // Lookups and queries
    // -----------------------------------------------------------------------

    /// Run an iterative lookup for `target`, seeded from our routing table.
    ///
    /// Every peer discovered on the way is offered to the routing table.
    pub async fn lookup(&self, target: NodeId) -> LookupOutcome {
        let initial = self.get_contacts(&target).await;
        lookup::find_node(
            target,
            &self.local,
            &self.config.to_lookup_config(),
            self.transport.clone(),
            initial,
            self,
        )
        .await
    }

    /// Find the k closest reachable nodes to `target`.
    pub async fn find_node(&self, target: &NodeId) -> Vec<Contact> {
        self.lookup(*target).await.closest
    }

    /// Up to `k` known contacts near `target`, closest first.
    pub async fn get_contacts(&self, target: &NodeId) -> Vec<Contact> {
        self.routing_table.read().await.get_contacts(target)
    }

    /// Whether `contact` is this node or is in its routing table.
    pub async fn contains(&self, contact: &Contact) -> bool {
        self.routing_table.read().await.contains(contact)
    }

    /// `(self, peer)` for every routing-table entry.
    pub async fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.routing_table.read().await.edges()
    }

    // -----------------------------------------------------------------------
    // Request handling (incoming RPCs)
    // -----------------------------------------------------------------------

    /// Handle an incoming RPC request.
    ///
    /// This is called by the transport layer when a remote node sends us a
    /// request. The sender is always recorded in the routing table.
    pub async fn handle_request(&self, request: KadRequest) -> KadResponse {
        kadsim_metrics::record_rpc_received(request.kind());

        match request {
            KadRequest::Ping { sender } => {
                self.add_contact(sender).await;
                KadResponse::Pong {
                    responder: self.local,
                }
            }

            KadRequest::FindNode { sender, target } => {
                let closest = self.get_contacts(&target).await;
                self.add_contact(sender).await;
                KadResponse::FindNodeResult {
                    responder: self.local,
                    closest,
                }
            }
        }
    }
}

/// Releases a bucket's pending-ping mark if `add_contact` is dropped mid-ping.
struct PingGuard<'a> {
    table: &'a Arc<RwLock<RoutingTable>>,
    pinged: NodeId,
    armed: bool,
}

impl Drop for PingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(mut table) = self.table.try_write() {
            table.abandon_ping(&self.pinged);
        } else if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let table = self.table.clone();
            let pinged = self.pinged;
            handle.spawn(async move {
                table.write().await.abandon_ping(&pinged);
            });
        }
    }
}

#[async_trait::async_trait]
impl<T: KadTransport> ContactSink for Kad<T> {
    async fn record(&self, contact: Contact) {
        self.add_contact(contact).await;
    }
}

// ---------------------------------------------------------------------------
// End-to-end tests
// ---------------------------------------------------------------------------
