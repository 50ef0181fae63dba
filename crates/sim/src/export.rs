//! Routing-table graph export.
//!
//! One line per routing-table entry, `owner;peer`, both as lowercase hex.

use crate::network::SimNetwork;
use crate::SimError;
use kadsim_common::NodeId;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Write `edges` as `owner;peer` lines.
pub fn write_edges<W: Write>(edges: &[(NodeId, NodeId)], mut writer: W) -> io::Result<()> {
    for (owner, peer) in edges {
        writeln!(writer, "{};{}", owner.to_hex(), peer.to_hex())?;
    }
    writer.flush()
}

/// `C-{collisions}_m-{bits}_n-{nodes}_k-{k}`, no extension.
pub fn edge_file_name(collisions: usize, bits: usize, nodes: usize, k: usize) -> String {
    format!("C-{collisions}_m-{bits}_n-{nodes}_k-{k}")
}

/// Dump the routing-table graph of `network` into `dir` and return the
/// path written.
pub async fn save_edges(
    network: &SimNetwork,
    dir: &Path,
    bits: usize,
    nodes: usize,
    k: usize,
) -> Result<PathBuf, SimError> {
    let edges = network.edges().await;
    let path = dir.join(edge_file_name(network.collisions(), bits, nodes, k));

    let mut buf = Vec::new();
    write_edges(&edges, &mut buf)?;
    tokio::fs::create_dir_all(dir).await?;
    tokio::fs::write(&path, buf).await?;

    tracing::info!(path = %path.display(), edges = edges.len(), "routing tables exported");
    Ok(path)
}
