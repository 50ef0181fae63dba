//! Configuration schema and loader for kadsim runs.
//!
//! The three process-wide parameters (identifier length `m`, network size
//! `n` and bucket capacity `k`) go through [`SimParamsBuilder`], which fixes
//! each of them exactly once. Everything else has a default.

use kadsim_common::{HashAlgorithm, IdSpace, KadError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level simulation configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SimConfig {
    /// Identifier length in bits (`m`).
    #[serde(default)]
    pub id_bits: Option<usize>,

    /// Number of nodes to construct (`n`).
    #[serde(default)]
    pub network_size: Option<usize>,

    /// Bucket capacity (`k`).
    #[serde(default)]
    pub bucket_size: Option<usize>,

    /// Kademlia settings.
    #[serde(default)]
    pub kademlia: KademliaConfig,

    /// Export settings.
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KademliaConfig {
    /// Lookup parallelism (alpha).
    #[serde(default = "default_alpha")]
    pub alpha: usize,

    /// RPC timeout in milliseconds.
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,

    /// One-way function used to derive identifiers from addresses.
    #[serde(default)]
    pub hash: HashAlgorithm,

    /// How many fresh identities a joining node tries before giving up.
    #[serde(default = "default_max_join_attempts")]
    pub max_join_attempts: usize,
}

impl Default for KademliaConfig {
    fn default() -> Self {
        Self {
            alpha: default_alpha(),
            rpc_timeout_ms: default_rpc_timeout_ms(),
            hash: HashAlgorithm::default(),
            max_join_attempts: default_max_join_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    /// Directory the edge list is written to.
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Whether to write the edge list at all.
    #[serde(default = "default_true")]
    pub edges: bool,

    /// Whether to print Prometheus metrics after the run.
    #[serde(default)]
    pub metrics: bool,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            edges: true,
            metrics: false,
        }
    }
}

// --- Defaults ---

fn default_alpha() -> usize {
    3
}
fn default_rpc_timeout_ms() -> u64 {
    5000
}
fn default_max_join_attempts() -> usize {
    1000
}
fn default_output_dir() -> PathBuf {
    PathBuf::from(".")
}
fn default_true() -> bool {
    true
}

// --- Errors ---

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
    #[error("{param} is already fixed to {current}, cannot change it to {requested}")]
    AlreadyFixed {
        param: &'static str,
        current: usize,
        requested: usize,
    },
    #[error("{0} must be set before the simulation starts")]
    Missing(&'static str),
}

impl From<ConfigError> for KadError {
    fn from(err: ConfigError) -> Self {
        KadError::Configuration(err.to_string())
    }
}

// --- Set-once parameters ---

/// A value that can be fixed once; re-fixing it to the same value is a no-op.
#[derive(Debug, Clone, Copy, Default)]
struct FixedOnce {
    value: Option<usize>,
}

impl FixedOnce {
    fn fix(&mut self, param: &'static str, requested: usize) -> Result<(), ConfigError> {
        match self.value {
            Some(current) if current != requested => Err(ConfigError::AlreadyFixed {
                param,
                current,
                requested,
            }),
            _ => {
                self.value = Some(requested);
                Ok(())
            }
        }
    }

    fn get(&self, param: &'static str) -> Result<usize, ConfigError> {
        self.value.ok_or(ConfigError::Missing(param))
    }
}

/// Validated, immutable parameters of one simulation run.
#[derive(Debug, Clone)]
pub struct SimParams {
    pub space: IdSpace,
    pub network_size: usize,
    pub bucket_size: usize,
    pub alpha: usize,
    pub rpc_timeout: Duration,
    pub hash: HashAlgorithm,
    pub max_join_attempts: usize,
    pub output: OutputConfig,
}

/// Collects parameters from the config file and the command line.
///
/// `m`, `n` and `k` can each be fixed only once: a second call with a
/// different value fails with [`ConfigError::AlreadyFixed`].
#[derive(Debug, Clone, Default)]
pub struct SimParamsBuilder {
    id_bits: FixedOnce,
    network_size: FixedOnce,
    bucket_size: FixedOnce,
    kademlia: KademliaConfig,
    output: OutputConfig,
}

impl SimParamsBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start from a parsed config file.
    pub fn from_config(config: &SimConfig) -> Result<Self, ConfigError> {
        let mut builder = Self {
            kademlia: config.kademlia.clone(),
            output: config.output.clone(),
            ..Self::default()
        };
        if let Some(bits) = config.id_bits {
            builder.id_bits(bits)?;
        }
        if let Some(n) = config.network_size {
            builder.network_size(n)?;
        }
        if let Some(k) = config.bucket_size {
            builder.bucket_size(k)?;
        }
        Ok(builder)
    }

    pub fn id_bits(&mut self, bits: usize) -> Result<&mut Self, ConfigError> {
        self.id_bits.fix("id_bits", bits)?;
        Ok(self)
    }

    pub fn network_size(&mut self, n: usize) -> Result<&mut Self, ConfigError> {
        self.network_size.fix("network_size", n)?;
        Ok(self)
    }

    pub fn bucket_size(&mut self, k: usize) -> Result<&mut Self, ConfigError> {
        self.bucket_size.fix("bucket_size", k)?;
        Ok(self)
    }

    pub fn alpha(&mut self, alpha: usize) -> &mut Self {
        self.kademlia.alpha = alpha;
        self
    }

    pub fn rpc_timeout_ms(&mut self, ms: u64) -> &mut Self {
        self.kademlia.rpc_timeout_ms = ms;
        self
    }

    pub fn hash(&mut self, hash: HashAlgorithm) -> &mut Self {
        self.kademlia.hash = hash;
        self
    }

    pub fn output_dir(&mut self, dir: PathBuf) -> &mut Self {
        self.output.dir = dir;
        self
    }

    pub fn export_edges(&mut self, enabled: bool) -> &mut Self {
        self.output.edges = enabled;
        self
    }

    pub fn print_metrics(&mut self, enabled: bool) -> &mut Self {
        self.output.metrics = enabled;
        self
    }

    /// Validate and freeze the parameters.
    pub fn build(&self) -> Result<SimParams, ConfigError> {
        let bits = self.id_bits.get("id_bits")?;
        let network_size = self.network_size.get("network_size")?;
        let bucket_size = self.bucket_size.get("bucket_size")?;

        let space = IdSpace::new(bits).map_err(|e| ConfigError::Invalid(e.to_string()))?;
        if bucket_size == 0 {
            return Err(ConfigError::Invalid("bucket_size must be > 0".into()));
        }
        if self.kademlia.alpha == 0 {
            return Err(ConfigError::Invalid("kademlia.alpha must be > 0".into()));
        }
        if self.kademlia.max_join_attempts == 0 {
            return Err(ConfigError::Invalid(
                "kademlia.max_join_attempts must be > 0".into(),
            ));
        }
        if network_size as u128 > space.capacity() {
            return Err(ConfigError::Invalid(format!(
                "network_size ({}) exceeds the {} identifiers of a {}-bit space",
                network_size,
                space.capacity(),
                bits
            )));
        }

        Ok(SimParams {
            space,
            network_size,
            bucket_size,
            alpha: self.kademlia.alpha,
            rpc_timeout: Duration::from_millis(self.kademlia.rpc_timeout_ms),
            hash: self.kademlia.hash,
            max_join_attempts: self.kademlia.max_join_attempts,
            output: self.output.clone(),
        })
    }
}

// --- Loading ---

/// Load a `SimConfig` from a YAML file path.
pub fn load_from_file(path: &Path) -> Result<SimConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    load_from_str(&contents)
}

/// Load a `SimConfig` from a YAML string.
pub fn load_from_str(yaml: &str) -> Result<SimConfig, ConfigError> {
    let config: SimConfig = serde_yaml::from_str(yaml)?;
    Ok(config)
}
