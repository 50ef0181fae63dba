//! Pluggable one-way functions used to derive identifiers from addresses.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use sha3::digest::{ExtendableOutput, Update, XofReader};
use sha3::Shake256;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// A one-way function with caller-chosen output length.
pub trait IdHasher: Send + Sync + fmt::Debug {
    /// Hash `input` and fill `out` completely with the digest.
    fn fill(&self, input: &[u8], out: &mut [u8]);
}

/// SHAKE256 extendable-output function. Produces any output length natively.
#[derive(Debug, Clone, Copy, Default)]
pub struct Shake256Hasher;

impl IdHasher for Shake256Hasher {
    fn fill(&self, input: &[u8], out: &mut [u8]) {
        let mut hasher = Shake256::default();
        hasher.update(input);
        hasher.finalize_xof().read(out);
    }
}

/// SHA-1, stretched in counter mode when more than 20 bytes are requested.
///
/// Block `i` is `SHA1(input || i as u32 big-endian)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha1Hasher;

impl IdHasher for Sha1Hasher {
    fn fill(&self, input: &[u8], out: &mut [u8]) {
        for (counter, chunk) in out.chunks_mut(20).enumerate() {
            let mut hasher = Sha1::new();
            Digest::update(&mut hasher, input);
            Digest::update(&mut hasher, (counter as u32).to_be_bytes());
            let block = hasher.finalize();
            chunk.copy_from_slice(&block[..chunk.len()]);
        }
    }
}

/// Named choice of identifier hash, as it appears in config files and on the
/// command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Shake256,
    Sha1,
}

impl HashAlgorithm {
    /// Instantiate the hasher.
    pub fn hasher(self) -> Arc<dyn IdHasher> {
        match self {
            HashAlgorithm::Shake256 => Arc::new(Shake256Hasher),
            HashAlgorithm::Sha1 => Arc::new(Sha1Hasher),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            HashAlgorithm::Shake256 => "shake256",
            HashAlgorithm::Sha1 => "sha1",
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HashAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "shake256" => Ok(HashAlgorithm::Shake256),
            "sha1" => Ok(HashAlgorithm::Sha1),
            other => Err(format!(
                "unknown hash algorithm '{}' (expected shake256 or sha1)",
                other
            )),
        }
    }
}
