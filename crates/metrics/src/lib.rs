//! Metrics and tracing setup for kadsim.
//!
//! Provides a global [`SimMetrics`] singleton backed by the `prometheus`
//! crate. A run can dump the registry in text exposition format once the
//! network has been built.

use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};
use std::sync::OnceLock;

// ────────────────────────── Tracing ──────────────────────────

/// Initialize the tracing subscriber with env-filter.
///
/// `default_directive` applies when `RUST_LOG` is unset. Calling this more
/// than once is harmless; later calls are ignored.
pub fn init_tracing(default_directive: &str) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive)),
        )
        .with_writer(std::io::stderr)
        .try_init();
}

// ────────────────────────── Prometheus metrics ──────────────────────────

/// Global metrics instance.
static METRICS: OnceLock<SimMetrics> = OnceLock::new();

/// Retrieve (or lazily create) the global metrics singleton.
pub fn metrics() -> &'static SimMetrics {
    METRICS.get_or_init(SimMetrics::new)
}

/// All Prometheus metrics for a kadsim process.
pub struct SimMetrics {
    pub registry: Registry,

    // ── RPC counters ──
    pub rpcs_sent_by_type: IntCounterVec,
    pub rpcs_received_by_type: IntCounterVec,
    pub rpcs_unreachable: IntCounter,

    // ── RPC latency ──
    pub rpc_latency_secs: HistogramVec,

    // ── Lookups ──
    pub lookups: IntCounter,
    pub lookup_rounds: Histogram,

    // ── Routing tables ──
    pub evictions: IntCounter,

    // ── Network construction ──
    pub nodes_joined: IntGauge,
    pub collisions: IntCounter,
}

// Manual Debug impl because prometheus types don't derive Debug.
impl std::fmt::Debug for SimMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimMetrics").finish_non_exhaustive()
    }
}

/// Histogram buckets (seconds) for in-process RPC latency.
const LATENCY_BUCKETS: &[f64] = &[
    0.000_01, 0.000_05, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 1.0,
];

/// Histogram buckets for the number of rounds one lookup takes.
const ROUND_BUCKETS: &[f64] = &[1.0, 2.0, 3.0, 4.0, 6.0, 8.0, 12.0, 16.0, 32.0];

impl SimMetrics {
    fn new() -> Self {
        let registry = Registry::new();

        let rpcs_sent_by_type = IntCounterVec::new(
            Opts::new(
                "kadsim_rpcs_sent_by_type_total",
                "Outbound RPCs sent, by type",
            ),
            &["rpc_type"],
        )
        .expect("rpcs_sent_by_type counter vec");
        let rpcs_received_by_type = IntCounterVec::new(
            Opts::new(
                "kadsim_rpcs_received_by_type_total",
                "Inbound RPCs received, by type",
            ),
            &["rpc_type"],
        )
        .expect("rpcs_received_by_type counter vec");
        let rpcs_unreachable = IntCounter::with_opts(Opts::new(
            "kadsim_rpcs_unreachable_total",
            "Outbound RPCs that timed out or hit an offline node",
        ))
        .expect("rpcs_unreachable counter");

        let rpc_latency_secs = HistogramVec::new(
            HistogramOpts::new("kadsim_rpc_latency_seconds", "RPC latency in seconds")
                .buckets(LATENCY_BUCKETS.to_vec()),
            &["rpc_type"],
        )
        .expect("rpc_latency_secs histogram");

        let lookups = IntCounter::with_opts(Opts::new(
            "kadsim_lookups_total",
            "Iterative FIND_NODE lookups started",
        ))
        .expect("lookups counter");
        let lookup_rounds = Histogram::with_opts(
            HistogramOpts::new("kadsim_lookup_rounds", "Query rounds per lookup")
                .buckets(ROUND_BUCKETS.to_vec()),
        )
        .expect("lookup_rounds histogram");

        let evictions = IntCounter::with_opts(Opts::new(
            "kadsim_bucket_evictions_total",
            "Unresponsive contacts evicted from a full bucket",
        ))
        .expect("evictions counter");

        let nodes_joined = IntGauge::with_opts(Opts::new(
            "kadsim_nodes_joined",
            "Nodes that completed their join",
        ))
        .expect("nodes_joined gauge");
        let collisions = IntCounter::with_opts(Opts::new(
            "kadsim_identity_collisions_total",
            "Joins retried because the derived identifier was taken",
        ))
        .expect("collisions counter");

        // Register all metrics
        registry
            .register(Box::new(rpcs_sent_by_type.clone()))
            .expect("register rpcs_sent_by_type");
        registry
            .register(Box::new(rpcs_received_by_type.clone()))
            .expect("register rpcs_received_by_type");
        registry
            .register(Box::new(rpcs_unreachable.clone()))
            .expect("register rpcs_unreachable");
        registry
            .register(Box::new(rpc_latency_secs.clone()))
            .expect("register rpc_latency_secs");
        registry
            .register(Box::new(lookups.clone()))
            .expect("register lookups");
        registry
            .register(Box::new(lookup_rounds.clone()))
            .expect("register lookup_rounds");
        registry
            .register(Box::new(evictions.clone()))
            .expect("register evictions");
        registry
            .register(Box::new(nodes_joined.clone()))
            .expect("register nodes_joined");
        registry
            .register(Box::new(collisions.clone()))
            .expect("register collisions");

        Self {
            registry,
            rpcs_sent_by_type,
            rpcs_received_by_type,
            rpcs_unreachable,
            rpc_latency_secs,
            lookups,
            lookup_rounds,
            evictions,
            nodes_joined,
            collisions,
        }
    }
}

/// Encode all registered metrics in Prometheus text exposition format.
pub fn encode_metrics() -> String {
    let m = metrics();
    let encoder = TextEncoder::new();
    let mut buf = Vec::new();
    if let Err(e) = encoder.encode(&m.registry.gather(), &mut buf) {
        tracing::warn!("prometheus text encoding failed: {}", e);
        return String::new();
    }
    String::from_utf8_lossy(&buf).into_owned()
}

/// Helper: start an RPC latency timer. Returns a guard that records
/// elapsed time on drop.
pub fn start_rpc_timer(rpc_type: &str) -> prometheus::HistogramTimer {
    metrics()
        .rpc_latency_secs
        .with_label_values(&[rpc_type])
        .start_timer()
}

/// Count one outbound RPC of the given type.
pub fn record_rpc_sent(rpc_type: &str) {
    metrics()
        .rpcs_sent_by_type
        .with_label_values(&[rpc_type])
        .inc();
}

/// Count one inbound RPC of the given type.
pub fn record_rpc_received(rpc_type: &str) {
    metrics()
        .rpcs_received_by_type
        .with_label_values(&[rpc_type])
        .inc();
}

// ────────────────────────── Tests ──────────────────────────
