//! Building a network node by node.

use crate::network::{SimNetwork, SimNode};
use crate::SimError;
use kadsim_common::{IdHasher, KadError, NodeId};
use kadsim_config::SimParams;
use kadsim_kad::contact::Contact;
use kadsim_kad::{Kad, KadConfig};
use rand::Rng;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Lowest port a simulated node listens on.
pub const MIN_PORT: u16 = 1024;
/// Highest port a simulated node listens on.
pub const MAX_PORT: u16 = 65354;

/// Node configuration for a run.
pub fn kad_config(params: &SimParams) -> KadConfig {
    KadConfig {
        space: params.space,
        k: params.bucket_size,
        alpha: params.alpha,
        rpc_timeout: params.rpc_timeout,
    }
}

/// A random IPv4 address and a port in `MIN_PORT..=MAX_PORT`.
pub fn random_addr() -> SocketAddrV4 {
    let mut rng = rand::thread_rng();
    let ip = Ipv4Addr::from(rng.gen::<[u8; 4]>());
    SocketAddrV4::new(ip, rng.gen_range(MIN_PORT..=MAX_PORT))
}

/// Run `attempt` until it succeeds or fails with something other than an
/// identity collision, at most `max_attempts` times.
pub async fn retry_on_collision<T, F, Fut>(
    max_attempts: usize,
    mut attempt: F,
) -> Result<T, SimError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KadError>>,
{
    for n in 1..=max_attempts {
        match attempt().await {
            Ok(value) => return Ok(value),
            Err(KadError::IdentityCollision(id)) => {
                tracing::debug!(attempt = n, id = %id, "identity collision, retrying");
            }
            Err(e) => return Err(e.into()),
        }
    }
    Err(SimError::RetriesExhausted {
        attempts: max_attempts,
    })
}

/// Summary of [`Simulation::populate`].
#[derive(Debug, Clone, Copy)]
pub struct PopulateReport {
    pub nodes: usize,
    pub elapsed: Duration,
    pub collisions: usize,
}

/// Owns a network and knows how to add nodes to it.
pub struct Simulation {
    network: Arc<SimNetwork>,
    config: KadConfig,
    hasher: Arc<dyn IdHasher>,
    max_join_attempts: usize,
}

impl std::fmt::Debug for Simulation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulation")
            .field("config", &self.config)
            .field("hasher", &self.hasher)
            .field("max_join_attempts", &self.max_join_attempts)
            .finish_non_exhaustive()
    }
}

impl Simulation {
    pub fn new(config: KadConfig, hasher: Arc<dyn IdHasher>, max_join_attempts: usize) -> Self {
        Self {
            network: SimNetwork::new(),
            config,
            hasher,
            max_join_attempts,
        }
    }

    pub fn from_params(params: &SimParams) -> Self {
        Self::new(
            kad_config(params),
            params.hash.hasher(),
            params.max_join_attempts,
        )
    }

    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    pub fn config(&self) -> &KadConfig {
        &self.config
    }

    /// Create a node at a random address and join it to the network,
    /// drawing a fresh address whenever the derived ID is already taken.
    pub async fn spawn_node(&self) -> Result<Arc<SimNode>, SimError> {
        retry_on_collision(self.max_join_attempts, move || {
            self.spawn_node_at(random_addr())
        })
        .await
    }

    /// Create a node at `addr` and join it to the network. A single attempt.
    pub async fn spawn_node_at(&self, addr: SocketAddrV4) -> Result<Arc<SimNode>, KadError> {
        let contact = Contact::new(&self.config.space, self.hasher.as_ref(), addr);
        let node = Arc::new(Kad::new(
            contact,
            self.network.transport(),
            self.config.clone(),
        ));

        let bootstrap = self.network.register(node.clone()).await?;
        node.join(bootstrap).await;
        kadsim_metrics::metrics().nodes_joined.inc();
        Ok(node)
    }

    /// Spawn `n` nodes one after another.
    pub async fn populate(&self, n: usize) -> Result<PopulateReport, SimError> {
        let start = Instant::now();
        let collisions_before = self.network.collisions();
        let progress_every = (n / 10).max(1);

        for i in 0..n {
            self.spawn_node().await?;
            if (i + 1) % progress_every == 0 {
                tracing::info!(joined = i + 1, total = n, "building network");
            }
        }

        Ok(PopulateReport {
            nodes: n,
            elapsed: start.elapsed(),
            collisions: self.network.collisions() - collisions_before,
        })
    }

    /// `(owner, peer)` for every routing-table entry in the network.
    pub async fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.network.edges().await
    }
}
