//! kadsim-sim: an in-process network of Kademlia nodes.
//!
//! [`network::SimNetwork`] is the registry every simulated node talks
//! through, [`simulation::Simulation`] builds nodes and joins them one by
//! one, and [`export`] writes the resulting routing-table graph.

pub mod export;
pub mod network;
pub mod simulation;

pub use network::{SimNetwork, SimNode, SimTransport};
pub use simulation::{retry_on_collision, PopulateReport, Simulation};

use kadsim_common::KadError;
use kadsim_config::ConfigError;

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error(transparent)]
    Kad(#[from] KadError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("gave up after {attempts} identity collisions in a row")]
    RetriesExhausted { attempts: usize },
}
