//! Fault injection for exercising timeouts and eviction.
//!
//! [`ChaosTransport`] sits in front of one node's transport and decides, per
//! outgoing request, whether it goes through, fails, hangs or is delayed.

use crate::contact::Contact;
use crate::rpc::{KadRequest, KadResponse, KadTransport};
use kadsim_common::{KadError, NodeId};
use rand::Rng;
use std::collections::HashSet;
use tokio::sync::RwLock;
use tokio::time::Duration;

/// Faults applied to every request.
#[derive(Debug, Clone, Default)]
pub struct ChaosConfig {
    /// Probability in \[0.0, 1.0\] that a request fails outright.
    pub failure_rate: f64,
    /// Delay before a request is forwarded.
    pub latency: Duration,
}

#[derive(Debug, Default)]
struct Faults {
    config: ChaosConfig,
    /// Peers this node cannot reach at all.
    cut: HashSet<NodeId>,
    /// Peers that swallow requests without answering.
    silent: HashSet<NodeId>,
}

/// What happens to one request.
enum Fate {
    Cut,
    Hang,
    Fail,
    Deliver(Duration),
}

impl Faults {
    fn fate(&self, target: &NodeId) -> Fate {
        if self.cut.contains(target) {
            return Fate::Cut;
        }
        if self.silent.contains(target) {
            return Fate::Hang;
        }
        let rate = self.config.failure_rate.clamp(0.0, 1.0);
        if rate > 0.0 && rand::thread_rng().gen_bool(rate) {
            return Fate::Fail;
        }
        Fate::Deliver(self.config.latency)
    }
}

/// One node's outgoing transport, with faults.
///
/// Requests to a silent peer never complete; the caller's RPC timeout
/// decides when to give up.
pub struct ChaosTransport<T: KadTransport> {
    inner: T,
    local_id: NodeId,
    faults: RwLock<Faults>,
}

impl<T: KadTransport> std::fmt::Debug for ChaosTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChaosTransport")
            .field("local_id", &self.local_id)
            .finish_non_exhaustive()
    }
}

impl<T: KadTransport> ChaosTransport<T> {
    pub fn new(inner: T, local_id: NodeId, config: ChaosConfig) -> Self {
        Self {
            inner,
            local_id,
            faults: RwLock::new(Faults {
                config,
                ..Faults::default()
            }),
        }
    }

    pub async fn set_failure_rate(&self, rate: f64) {
        self.faults.write().await.config.failure_rate = rate;
    }

    pub async fn set_latency(&self, latency: Duration) {
        self.faults.write().await.config.latency = latency;
    }

    /// Make `peer` unreachable from this node.
    pub async fn cut_link(&self, peer: NodeId) {
        self.faults.write().await.cut.insert(peer);
    }

    pub async fn restore_link(&self, peer: NodeId) {
        self.faults.write().await.cut.remove(&peer);
    }

    /// Make requests to `peer` hang (or stop hanging).
    pub async fn set_unresponsive(&self, peer: NodeId, unresponsive: bool) {
        let mut faults = self.faults.write().await;
        if unresponsive {
            faults.silent.insert(peer);
        } else {
            faults.silent.remove(&peer);
        }
    }

    /// Drop every cut link and silent peer. Rate and latency stay.
    pub async fn heal_all(&self) {
        let mut faults = self.faults.write().await;
        faults.cut.clear();
        faults.silent.clear();
    }
}

#[async_trait::async_trait]
impl<T: KadTransport> KadTransport for ChaosTransport<T> {
    async fn send_request(
        &self,
        target: &Contact,
        request: KadRequest,
    ) -> Result<KadResponse, KadError> {
        let fate = self.faults.read().await.fate(&target.id);
        match fate {
            Fate::Cut => Err(KadError::Unreachable(target.id)),
            Fate::Hang => std::future::pending().await,
            Fate::Fail => {
                tracing::trace!(from = %self.local_id, to = %target.id, "injected failure");
                Err(KadError::Internal("injected failure".into()))
            }
            Fate::Deliver(delay) => {
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                self.inner.send_request(target, request).await
            }
        }
    }
}
