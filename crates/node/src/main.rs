//! kadsim: build a simulated Kademlia network and dump its routing tables.
//!
//! Reads the identifier length, network size and bucket capacity from the
//! command line and/or a YAML config, joins the nodes one after another,
//! then writes the resulting routing-table graph to disk.

use anyhow::Context;
use clap::Parser;
use kadsim_common::HashAlgorithm;
use kadsim_config::{SimParams, SimParamsBuilder};
use kadsim_sim::export::save_edges;
use kadsim_sim::Simulation;
use std::path::PathBuf;

#[derive(Debug, Parser)]
#[command(name = "kadsim", version, about = "Simulate the construction of a Kademlia network")]
struct Args {
    /// Identifier length in bits.
    #[arg(value_name = "M")]
    id_bits: Option<usize>,

    /// Number of nodes to join.
    #[arg(value_name = "N")]
    network_size: Option<usize>,

    /// Bucket capacity.
    #[arg(value_name = "K")]
    bucket_size: Option<usize>,

    /// YAML config file. Command-line values must agree with it.
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Lookup parallelism.
    #[arg(long)]
    alpha: Option<usize>,

    /// Hash used to derive node identifiers (shake256, sha1).
    #[arg(long)]
    hash: Option<HashAlgorithm>,

    #[arg(long, value_name = "MS")]
    rpc_timeout_ms: Option<u64>,

    /// Directory the edge list is written to.
    #[arg(long, value_name = "DIR")]
    out: Option<PathBuf>,

    /// Skip writing the edge list.
    #[arg(long)]
    no_export: bool,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    metrics: bool,
}

impl Args {
    /// Merge the config file (if any) with the command line.
    fn params(&self) -> anyhow::Result<SimParams> {
        let mut builder = match &self.config {
            Some(path) => {
                let config = kadsim_config::load_from_file(path)
                    .with_context(|| format!("failed to load config from {}", path.display()))?;
                SimParamsBuilder::from_config(&config)?
            }
            None => SimParamsBuilder::new(),
        };

        if let Some(bits) = self.id_bits {
            builder.id_bits(bits)?;
        }
        if let Some(n) = self.network_size {
            builder.network_size(n)?;
        }
        if let Some(k) = self.bucket_size {
            builder.bucket_size(k)?;
        }
        if let Some(alpha) = self.alpha {
            builder.alpha(alpha);
        }
        if let Some(hash) = self.hash {
            builder.hash(hash);
        }
        if let Some(ms) = self.rpc_timeout_ms {
            builder.rpc_timeout_ms(ms);
        }
        if let Some(dir) = &self.out {
            builder.output_dir(dir.clone());
        }
        if self.no_export {
            builder.export_edges(false);
        }
        if self.metrics {
            builder.print_metrics(true);
        }

        builder.build().context("invalid simulation parameters")
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    kadsim_metrics::init_tracing("info");

    let args = Args::parse();
    let params = args.params()?;
    let bits = params.space.bits();

    println!(
        "M:{} N:{} K:{}",
        bits, params.network_size, params.bucket_size
    );
    tracing::info!(
        alpha = params.alpha,
        hash = %params.hash,
        rpc_timeout_ms = params.rpc_timeout.as_millis() as u64,
        "starting simulation"
    );

    let sim = Simulation::from_params(&params);
    let report = sim
        .populate(params.network_size)
        .await
        .context("failed to build the network")?;

    println!("Elapsed: {} ms", report.elapsed.as_millis());
    println!("Collisions: {}", report.collisions);

    if params.output.edges {
        let path = save_edges(
            sim.network(),
            &params.output.dir,
            bits,
            params.network_size,
            params.bucket_size,
        )
        .await
        .with_context(|| format!("failed to write edges to {}", params.output.dir.display()))?;
        println!("Edges: {}", path.display());
    }

    if params.output.metrics {
        print!("{}", kadsim_metrics::encode_metrics());
    }

    Ok(())
}
