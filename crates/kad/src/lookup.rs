//! Iterative parallel lookup algorithm for Kademlia.
//!
//! Implements the FIND_NODE lookup with configurable parallelism (α). Each
//! round queries up to α of the closest not-yet-contacted peers at once and
//! waits for all of them before merging what they returned.

use crate::contact::{sort_by_distance, Contact};
use crate::rpc::{self, KadRequest, KadResponse, KadTransport};
use futures::stream::FuturesUnordered;
use futures::StreamExt;
use kadsim_common::NodeId;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

/// Configuration for the iterative lookup.
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Number of closest nodes to return (the `k` parameter).
    pub k: usize,
    /// Number of parallel queries per round (the `α` parameter).
    pub alpha: usize,
    /// Timeout for individual RPC calls.
    pub timeout: Duration,
}

impl Default for LookupConfig {
    fn default() -> Self {
        Self {
            k: 20,
            alpha: 3,
            timeout: Duration::from_secs(5),
        }
    }
}

/// Receives every peer a lookup discovers for the first time.
///
/// The node implements this by inserting the peer into its routing table,
/// which is how tables grow from lookup traffic.
#[async_trait::async_trait]
pub trait ContactSink: Send + Sync {
    async fn record(&self, contact: Contact);
}

/// A sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardContacts;

#[async_trait::async_trait]
impl ContactSink for DiscardContacts {
    async fn record(&self, _contact: Contact) {}
}

/// Result of one lookup.
#[derive(Debug, Clone, Default)]
pub struct LookupOutcome {
    /// At most `k` responsive contacts, closest to the target first.
    pub closest: Vec<Contact>,
    /// Number of query rounds.
    pub rounds: usize,
    /// Number of distinct peers queried.
    pub queried: usize,
    /// Queried peers that gave no response.
    pub unreachable: usize,
}

// ---------------------------------------------------------------------------
// Iterative lookup
// ---------------------------------------------------------------------------

/// Run an iterative FIND_NODE lookup for `target`.
///
/// `initial` is the caller's own view (normally `get_contacts(target)`).
/// Every peer heard of stays a candidate, so when one of the current best
/// `k` turns out to be unreachable the next known peer takes its place.
/// Unreachable peers are dropped and never retried; no peer is queried
/// twice. The loop ends once the best `k` known peers have all answered.
pub async fn find_node<T, S>(
    target: NodeId,
    local: &Contact,
    config: &LookupConfig,
    transport: Arc<T>,
    initial: Vec<Contact>,
    sink: &S,
) -> LookupOutcome
where
    T: KadTransport,
    S: ContactSink + ?Sized,
{
    kadsim_metrics::metrics().lookups.inc();

    // Every live peer heard of so far, closest to `target` first.
    let mut known: Vec<Contact> = Vec::new();
    merge(
        &mut known,
        initial.into_iter().filter(|c| c.id != local.id),
        &target,
    );

    let mut contacted: HashSet<NodeId> = HashSet::new();
    let mut outcome = LookupOutcome::default();

    loop {
        let batch: Vec<Contact> = known
            .iter()
            .take(config.k)
            .filter(|c| !contacted.contains(&c.id))
            .take(config.alpha.max(1))
            .copied()
            .collect();
        if batch.is_empty() {
            break;
        }

        outcome.rounds += 1;
        outcome.queried += batch.len();
        for peer in &batch {
            contacted.insert(peer.id);
        }

        let mut queries = FuturesUnordered::new();
        for peer in batch {
            let transport = transport.as_ref();
            let timeout = config.timeout;
            queries.push(async move {
                let found = query(transport, local, &peer, target, timeout).await;
                (peer, found)
            });
        }

        let mut dead: HashSet<NodeId> = HashSet::new();
        let mut pool: Vec<Contact> = Vec::new();
        while let Some((peer, found)) = queries.next().await {
            let Some(found) = found else {
                outcome.unreachable += 1;
                dead.insert(peer.id);
                continue;
            };
            for contact in found {
                if contact.id == local.id
                    || contacted.contains(&contact.id)
                    || known.contains(&contact)
                    || pool.contains(&contact)
                {
                    continue;
                }
                pool.push(contact);
            }
        }

        for contact in &pool {
            sink.record(*contact).await;
        }

        known.retain(|c| !dead.contains(&c.id));
        merge(&mut known, pool, &target);

        tracing::trace!(
            key = %target,
            round = outcome.rounds,
            candidates = known.len(),
            "lookup round complete"
        );
    }

    known.truncate(config.k);

    kadsim_metrics::metrics()
        .lookup_rounds
        .observe(outcome.rounds as f64);
    tracing::debug!(
        key = %target,
        rounds = outcome.rounds,
        queried = outcome.queried,
        unreachable = outcome.unreachable,
        found = known.len(),
        "lookup finished"
    );

    outcome.closest = known;
    outcome
}

/// Issue one FIND_NODE; `None` means the peer did not answer.
async fn query<T: KadTransport>(
    transport: &T,
    local: &Contact,
    peer: &Contact,
    target: NodeId,
    timeout: Duration,
) -> Option<Vec<Contact>> {
    let request = KadRequest::FindNode {
        sender: *local,
        target,
    };
    match rpc::call(transport, peer, request, timeout).await? {
        KadResponse::FindNodeResult { closest, .. } => Some(closest),
        KadResponse::Pong { .. } => {
            tracing::debug!(peer = %peer.id, "unexpected pong to FIND_NODE");
            None
        }
    }
}

/// Fold `extra` into `set`, dropping duplicates, and keep it sorted by
/// distance to `target`.
fn merge(set: &mut Vec<Contact>, extra: impl IntoIterator<Item = Contact>, target: &NodeId) {
    let mut seen: HashSet<NodeId> = set.iter().map(|c| c.id).collect();
    set.extend(extra.into_iter().filter(|c| seen.insert(c.id)));
    sort_by_distance(set, target);
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use kadsim_common::{IdSpace, KadError};
    use std::collections::HashMap;
    use std::sync::Mutex;
    use tokio::sync::RwLock;

    // -----------------------------------------------------------------------
    // Simulated network for testing
    // -----------------------------------------------------------------------

    /// A simulated node: a contact plus the peers it knows about.
    struct SimNode {
        contact: Contact,
        known_peers: Vec<Contact>,
    }

    #[derive(Default)]
    struct SimulatedNetwork {
        nodes: RwLock<HashMap<NodeId, SimNode>>,
        /// Nodes that never answer (the call hangs until it times out).
        silent: RwLock<HashSet<NodeId>>,
        /// Every node a request was sent to, in order.
        requests: Mutex<Vec<NodeId>>,
        /// Size of FIND_NODE answers.
        answer_size: usize,
    }

    impl SimulatedNetwork {
        fn new(answer_size: usize) -> Self {
            Self {
                answer_size,
                ..Self::default()
            }
        }

        async fn add_node(&self, contact: Contact, known_peers: Vec<Contact>) {
            self.nodes.write().await.insert(
                contact.id,
                SimNode {
                    contact,
                    known_peers,
                },
            );
        }
    }

    struct SimTransport {
        network: Arc<SimulatedNetwork>,
    }

    #[async_trait::async_trait]
    impl KadTransport for SimTransport {
        async fn send_request(
            &self,
            target: &Contact,
            request: KadRequest,
        ) -> Result<KadResponse, KadError> {
            self.network.requests.lock().unwrap().push(target.id);

            if self.network.silent.read().await.contains(&target.id) {
                std::future::pending::<()>().await;
            }

            let nodes = self.network.nodes.read().await;
            let node = nodes
                .get(&target.id)
                .ok_or(KadError::NodeNotFound(target.id))?;

            match request {
                KadRequest::Ping { .. } => Ok(KadResponse::Pong {
                    responder: node.contact,
                }),
                KadRequest::FindNode { target: tgt, .. } => {
                    let mut peers = node.known_peers.clone();
                    sort_by_distance(&mut peers, &tgt);
                    peers.truncate(self.network.answer_size);
                    Ok(KadResponse::FindNodeResult {
                        responder: node.contact,
                        closest: peers,
                    })
                }
            }
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        seen: Mutex<Vec<Contact>>,
    }

    #[async_trait::async_trait]
    impl ContactSink for RecordingSink {
        async fn record(&self, contact: Contact) {
            self.seen.lock().unwrap().push(contact);
        }
    }

    fn space() -> IdSpace {
        IdSpace::new(32).unwrap()
    }

    fn random_contacts(n: usize) -> Vec<Contact> {
        let s = space();
        let mut ids = HashSet::new();
        let mut contacts = Vec::with_capacity(n);
        while contacts.len() < n {
            let id = s.random();
            if ids.insert(id) {
                contacts.push(Contact::with_dummy_addr(id));
            }
        }
        contacts
    }

    // -----------------------------------------------------------------------
    // Helpers to build networks of N nodes
    // -----------------------------------------------------------------------

    /// Every node knows every other node.
    async fn build_network(n: usize, answer_size: usize) -> (Arc<SimulatedNetwork>, Vec<Contact>) {
        let network = Arc::new(SimulatedNetwork::new(answer_size));
        let all = random_contacts(n);
        for (i, contact) in all.iter().enumerate() {
            let peers: Vec<Contact> = all
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, c)| *c)
                .collect();
            network.add_node(*contact, peers).await;
        }
        (network, all)
    }

    /// Every node knows only its `peers_per_node` nearest neighbours.
    async fn build_sparse_network(
        n: usize,
        peers_per_node: usize,
    ) -> (Arc<SimulatedNetwork>, Vec<Contact>) {
        let network = Arc::new(SimulatedNetwork::new(peers_per_node));
        let all = random_contacts(n);
        for (i, contact) in all.iter().enumerate() {
            let mut peers: Vec<Contact> = all
                .iter()
                .enumerate()
                .filter(|(j, _)| *j != i)
                .map(|(_, c)| *c)
                .collect();
            sort_by_distance(&mut peers, &contact.id);
            peers.truncate(peers_per_node);
            network.add_node(*contact, peers).await;
        }
        (network, all)
    }

    fn brute_force(all: &[Contact], exclude: &Contact, target: &NodeId, k: usize) -> Vec<NodeId> {
        let mut others: Vec<Contact> = all.iter().filter(|c| *c != exclude).copied().collect();
        sort_by_distance(&mut others, target);
        others.truncate(k);
        others.into_iter().map(|c| c.id).collect()
    }

    fn config(k: usize, alpha: usize) -> LookupConfig {
        LookupConfig {
            k,
            alpha,
            timeout: Duration::from_secs(5),
        }
    }

    // -----------------------------------------------------------------------
    // Tests
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn test_lookup_finds_exact_node() {
        let (network, all) = build_network(10, 5).await;
        let transport = Arc::new(SimTransport { network });

        let querier = all[0];
        let target = all[5].id;
        let initial = all[1..].to_vec();

        let outcome = find_node(
            target,
            &querier,
            &config(5,
            3),
            transport,
            initial,
            &DiscardContacts,
        )
        .await;
        assert!(
            outcome.closest.iter().any(|n| n.id == target),
            "target node should be in results"
        );
        assert_eq!(outcome.closest[0].id, target);
    }

    #[tokio::test]
    async fn test_lookup_matches_brute_force() {
        let (network, all) = build_network(50, 10).await;
        let transport = Arc::new(SimTransport { network });
        let querier = all[0];

        for _ in 0..10 {
            let target = space().random();
            // Start with just 3 seeds
            let initial = all[1..4].to_vec();
            let outcome = find_node(
                target,
                &querier,
                &config(10, 3),
                transport.clone(),
                initial,
                &DiscardContacts,
            )
            .await;

            let got: Vec<NodeId> = outcome.closest.iter().map(|c| c.id).collect();
            assert_eq!(got, brute_force(&all, &querier, &target, 10));
        }
    }

    #[tokio::test]
    async fn test_lookup_never_queries_a_peer_twice() {
        let (network, all) = build_sparse_network(60, 6).await;
        let transport = Arc::new(SimTransport {
            network: network.clone(),
        });

        let querier = all[0];
        let target = all[30].id;
        let initial = network.nodes.read().await[&querier.id].known_peers.clone();

        let outcome = find_node(
            target,
            &querier,
            &config(6,
            2),
            transport,
            initial,
            &DiscardContacts,
        )
        .await;

        let requests = network.requests.lock().unwrap().clone();
        let unique: HashSet<NodeId> = requests.iter().copied().collect();
        assert_eq!(unique.len(), requests.len(), "a peer was queried twice");
        assert!(!requests.contains(&querier.id), "querier queried itself");
        assert_eq!(outcome.queried, requests.len());
    }

    #[tokio::test]
    async fn test_lookup_with_alpha_1() {
        let (network, all) = build_network(20, 5).await;
        let transport = Arc::new(SimTransport { network });

        let querier = all[0];
        let target = all[10].id;
        let initial = all[1..5].to_vec();

        let outcome = find_node(
            target,
            &querier,
            &config(5,
            1),
            transport,
            initial,
            &DiscardContacts,
        )
        .await;
        assert!(!outcome.closest.is_empty(), "should find some nodes");
        assert!(outcome.closest.iter().any(|n| n.id == target));
        // One peer per round.
        assert_eq!(outcome.rounds, outcome.queried);
    }

    #[tokio::test]
    async fn test_lookup_results_sorted_and_bounded() {
        let (network, all) = build_sparse_network(40, 4).await;
        let transport = Arc::new(SimTransport { network });
        let querier = all[0];
        let target = space().random();

        let outcome = find_node(
            target,
            &querier,
            &config(4,
            3),
            transport,
            all[1..].to_vec(),
            &DiscardContacts,
        )
        .await;
        assert!(outcome.closest.len() <= 4);
        for pair in outcome.closest.windows(2) {
            assert!(pair[0].id.distance(&target) <= pair[1].id.distance(&target));
        }
    }

    #[tokio::test]
    async fn test_lookup_drops_unknown_peers() {
        let (network, all) = build_network(10, 5).await;
        let transport = Arc::new(SimTransport { network });

        let querier = all[0];
        let ghosts = random_contacts(3);
        let mut initial = ghosts.clone();
        initial.push(all[1]);

        // alpha covers the whole seed set, so every ghost is tried in round one.
        let target = ghosts[0].id;
        let outcome = find_node(
            target,
            &querier,
            &config(5,
            4),
            transport,
            initial,
            &DiscardContacts,
        )
        .await;
        assert_eq!(outcome.unreachable, 3);
        assert!(outcome.closest.iter().all(|c| !ghosts.contains(c)));
        assert!(!outcome.closest.is_empty());
    }

    #[tokio::test]
    async fn test_lookup_timeout_counts_as_no_response() {
        tokio::time::pause();

        let (network, all) = build_network(12, 4).await;
        let silent = all[3];
        network.silent.write().await.insert(silent.id);
        let transport = Arc::new(SimTransport { network });

        let querier = all[0];
        let target = silent.id;
        let cfg = LookupConfig {
            k: 4,
            alpha: 3,
            timeout: Duration::from_millis(200),
        };

        let outcome = find_node(
            target,
            &querier,
            &cfg,
            transport,
            all[1..].to_vec(),
            &DiscardContacts,
        )
        .await;
        assert_eq!(outcome.unreachable, 1);
        assert!(!outcome.closest.contains(&silent));
        assert_eq!(outcome.closest.len(), 4);
    }

    #[tokio::test]
    async fn test_dropped_peer_is_replaced_by_known_candidate() {
        tokio::time::pause();

        for _ in 0..50 {
            let (network, all) = build_network(12, 4).await;
            let silent = all[3];
            network.silent.write().await.insert(silent.id);
            let transport = Arc::new(SimTransport { network });

            let querier = all[0];
            let cfg = LookupConfig {
                k: 4,
                alpha: 3,
                timeout: Duration::from_millis(200),
            };
            let outcome = find_node(
                silent.id,
                &querier,
                &cfg,
                transport,
                all[1..].to_vec(),
                &DiscardContacts,
            )
            .await;

            let reachable: Vec<Contact> =
                all.iter().filter(|c| **c != silent).copied().collect();
            let got: Vec<NodeId> = outcome.closest.iter().map(|c| c.id).collect();
            assert_eq!(got, brute_force(&reachable, &querier, &silent.id, 4));
        }
    }

    #[tokio::test]
    async fn test_lookup_terminates_with_stale_responses() {
        // All nodes return the same set of peers (no new closer nodes discovered).
        let network = Arc::new(SimulatedNetwork::new(5));
        let all = random_contacts(5);

        let shared_peers = all[1..4].to_vec();
        for contact in &all {
            let peers: Vec<Contact> = shared_peers
                .iter()
                .filter(|p| p.id != contact.id)
                .copied()
                .collect();
            network.add_node(*contact, peers).await;
        }

        let transport = Arc::new(SimTransport { network });
        let outcome = find_node(
            space().random(),
            &all[0],
            &config(5, 3),
            transport,
            shared_peers,
            &DiscardContacts,
        )
        .await;
        assert_eq!(outcome.closest.len(), 3);
        assert_eq!(outcome.queried, 3);
    }

    #[tokio::test]
    async fn test_lookup_with_no_initial_contacts() {
        let (network, all) = build_network(3, 3).await;
        let transport = Arc::new(SimTransport { network });
        let outcome = find_node(
            all[1].id,
            &all[0],
            &config(3,
            3),
            transport,
            Vec::new(),
            &DiscardContacts,
        )
        .await;
        assert!(outcome.closest.is_empty());
        assert_eq!(outcome.rounds, 0);
    }

    #[tokio::test]
    async fn test_lookup_reports_new_contacts_to_sink() {
        let (network, all) = build_sparse_network(30, 5).await;
        let transport = Arc::new(SimTransport {
            network: network.clone(),
        });

        let querier = all[0];
        let initial = network.nodes.read().await[&querier.id].known_peers.clone();
        let sink = RecordingSink::default();

        let target = space().random();
        let outcome = find_node(
            target,
            &querier,
            &config(5,
            3),
            transport,
            initial.clone(),
            &sink,
        )
        .await;

        let seen = sink.seen.lock().unwrap().clone();
        assert!(!seen.is_empty());
        assert!(seen.iter().all(|c| c.id != querier.id));
        for contact in outcome.closest.iter().filter(|c| !initial.contains(c)) {
            assert!(seen.contains(contact), "{} was never reported", contact);
        }
    }

    #[tokio::test]
    async fn test_lookup_sparse_network() {
        let (network, all) = build_sparse_network(50, 5).await;
        let transport = Arc::new(SimTransport {
            network: network.clone(),
        });

        let querier = all[0];
        let target = all[25].id;
        let initial = network.nodes.read().await[&querier.id].known_peers.clone();

        let outcome = find_node(
            target,
            &querier,
            &config(10,
            3),
            transport,
            initial,
            &DiscardContacts,
        )
        .await;
        assert!(
            !outcome.closest.is_empty(),
            "should find some nodes even in sparse network"
        );
    }

    #[test]
    fn test_merge_dedupes_and_sorts() {
        let s = space();
        let target = s.random();
        let contacts = random_contacts(6);
        let mut set = contacts[..4].to_vec();
        merge(&mut set, contacts[2..].to_vec(), &target);
        assert_eq!(set.len(), 6);
        let unique: HashSet<NodeId> = set.iter().map(|c| c.id).collect();
        assert_eq!(unique.len(), 6);
        let expected = brute_force(&contacts, &Contact::with_dummy_addr(s.zero()), &target, 6);
        let got: Vec<NodeId> = set.iter().map(|c| c.id).collect();
        // The zero id is astronomically unlikely to be among the random ones.
        assert_eq!(got, expected);
    }
}
