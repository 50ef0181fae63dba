//! Kademlia RPC types and the transport abstraction trait.

use crate::contact::Contact;
use kadsim_common::{KadError, NodeId};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Request / Response types
// ---------------------------------------------------------------------------

/// A Kademlia RPC request.
#[derive(Debug, Clone)]
pub enum KadRequest {
    Ping { sender: Contact },
    FindNode { sender: Contact, target: NodeId },
}

impl KadRequest {
    /// Return the sender from any request variant.
    pub fn sender(&self) -> &Contact {
        match self {
            KadRequest::Ping { sender } => sender,
            KadRequest::FindNode { sender, .. } => sender,
        }
    }

    /// Short label used for logging and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            KadRequest::Ping { .. } => "ping",
            KadRequest::FindNode { .. } => "find_node",
        }
    }
}

/// A Kademlia RPC response.
#[derive(Debug, Clone)]
pub enum KadResponse {
    Pong {
        responder: Contact,
    },
    FindNodeResult {
        responder: Contact,
        closest: Vec<Contact>,
    },
}

impl KadResponse {
    pub fn responder(&self) -> &Contact {
        match self {
            KadResponse::Pong { responder } => responder,
            KadResponse::FindNodeResult { responder, .. } => responder,
        }
    }
}

// ---------------------------------------------------------------------------
// Transport trait
// ---------------------------------------------------------------------------

/// Abstraction over the network transport.
///
/// The lookup engine and the node only talk to peers through this trait, so
/// the in-process simulator can be swapped for a real network without
/// touching them. An `Err` is always interpreted as "no response".
#[async_trait::async_trait]
pub trait KadTransport: Send + Sync + 'static {
    /// Send a request to a target node and await the response.
    async fn send_request(
        &self,
        target: &Contact,
        request: KadRequest,
    ) -> Result<KadResponse, KadError>;
}

/// Send `request` to `peer`, bounded by `timeout`.
///
/// Returns `None` for every failure: transport error, unknown or offline
/// peer, or timeout. Callers treat that as "no response".
pub(crate) async fn call<T: KadTransport>(
    transport: &T,
    peer: &Contact,
    request: KadRequest,
    timeout: Duration,
) -> Option<KadResponse> {
    let kind = request.kind();
    kadsim_metrics::record_rpc_sent(kind);
    let _timer = kadsim_metrics::start_rpc_timer(kind);

    let outcome = match tokio::time::timeout(timeout, transport.send_request(peer, request)).await {
        Ok(result) => result,
        Err(_) => Err(KadError::Timeout(peer.id)),
    };
    match outcome {
        Ok(response) => Some(response),
        Err(e) => {
            kadsim_metrics::metrics().rpcs_unreachable.inc();
            tracing::debug!(peer = %peer.id, rpc = kind, "no response: {}", e);
            None
        }
    }
}
