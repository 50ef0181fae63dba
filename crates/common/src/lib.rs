//! kadsim-common: shared types for the kadsim project.
//!
//! Provides the `m`-bit `NodeId` and `Distance` types that form the
//! foundation of the Kademlia XOR metric space, the `IdSpace` that fixes
//! `m` for a process, and the error taxonomy shared by every crate.

pub mod hash;

pub use hash::{HashAlgorithm, IdHasher, Sha1Hasher, Shake256Hasher};

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Largest supported identifier length in bits.
pub const MAX_ID_BITS: usize = 256;

/// Largest supported identifier length in bytes.
pub const MAX_ID_BYTES: usize = MAX_ID_BITS / 8; // 32

/// Identifier length used when nothing else is configured.
pub const DEFAULT_ID_BITS: usize = 160;

// ---------------------------------------------------------------------------
// IdSpace
// ---------------------------------------------------------------------------

/// The identifier space of a simulation: every `NodeId` in a process has
/// exactly `bits` significant bits.
///
/// Identifiers occupy `ceil(bits / 8)` big-endian bytes. When `bits` is not a
/// multiple of eight, the unused high bits of the first byte are always zero.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct IdSpace {
    bits: usize,
}

impl IdSpace {
    /// Create an identifier space of `bits` bits (`1..=MAX_ID_BITS`).
    pub fn new(bits: usize) -> Result<Self, KadError> {
        if bits == 0 || bits > MAX_ID_BITS {
            return Err(KadError::Configuration(format!(
                "identifier length must be in 1..={} bits, got {}",
                MAX_ID_BITS, bits
            )));
        }
        Ok(Self { bits })
    }

    /// Number of significant bits (`m`).
    pub fn bits(&self) -> usize {
        self.bits
    }

    /// Number of bytes an identifier occupies.
    pub fn byte_len(&self) -> usize {
        self.bits.div_ceil(8)
    }

    /// Number of distinct identifiers, saturating at `u128::MAX`.
    pub fn capacity(&self) -> u128 {
        if self.bits >= 128 {
            u128::MAX
        } else {
            1u128 << self.bits
        }
    }

    /// Mask applied to the most significant byte.
    fn top_mask(&self) -> u8 {
        match self.bits % 8 {
            0 => 0xFF,
            rem => (1u8 << rem) - 1,
        }
    }

    fn masked(&self, mut bytes: [u8; MAX_ID_BYTES]) -> NodeId {
        bytes[0] &= self.top_mask();
        NodeId {
            bytes,
            len: self.byte_len() as u8,
        }
    }

    /// The all-zeros identifier of this space.
    pub fn zero(&self) -> NodeId {
        self.masked([0u8; MAX_ID_BYTES])
    }

    /// Build an identifier from exactly `byte_len()` bytes.
    ///
    /// Bits above `m` in the first byte are cleared.
    pub fn from_bytes(&self, bytes: &[u8]) -> Result<NodeId, KadError> {
        if bytes.len() != self.byte_len() {
            return Err(KadError::Configuration(format!(
                "identifier must be {} bytes for a {}-bit space, got {}",
                self.byte_len(),
                self.bits,
                bytes.len()
            )));
        }
        let mut buf = [0u8; MAX_ID_BYTES];
        buf[..bytes.len()].copy_from_slice(bytes);
        Ok(self.masked(buf))
    }

    /// Generate a uniformly random identifier.
    pub fn random(&self) -> NodeId {
        self.random_with(&mut rand::thread_rng())
    }

    /// Generate a uniformly random identifier from the given RNG.
    pub fn random_with<R: Rng + ?Sized>(&self, rng: &mut R) -> NodeId {
        let mut buf = [0u8; MAX_ID_BYTES];
        rng.fill(&mut buf[..self.byte_len()]);
        self.masked(buf)
    }

    /// Derive an identifier by hashing `input` down (or up) to `m` bits.
    pub fn derive(&self, hasher: &dyn IdHasher, input: &[u8]) -> NodeId {
        let mut buf = [0u8; MAX_ID_BYTES];
        hasher.fill(input, &mut buf[..self.byte_len()]);
        self.masked(buf)
    }

    /// Generate a random `NodeId` that would fall into bucket `bucket_index`
    /// relative to `local_id`.
    ///
    /// The generated ID differs from `local_id` at bit `bucket_index`
    /// (counting from the least significant bit), matches it on every more
    /// significant bit, and is random below.
    pub fn random_id_in_bucket(&self, local_id: &NodeId, bucket_index: usize) -> NodeId {
        assert!(
            bucket_index < self.bits,
            "bucket_index must be < {}",
            self.bits
        );

        let mut rng = rand::thread_rng();
        let len = self.byte_len();
        let mut result = local_id.bytes;

        let byte_idx = len - 1 - bucket_index / 8;
        let bit_idx = bucket_index % 8; // bit within byte, 0 = LSB

        result[byte_idx] ^= 1 << bit_idx;

        if bit_idx > 0 {
            let mask = (1u8 << bit_idx) - 1;
            let random_byte: u8 = rng.gen();
            result[byte_idx] = (result[byte_idx] & !mask) | (random_byte & mask);
        }

        for byte in result.iter_mut().take(len).skip(byte_idx + 1) {
            *byte = rng.gen();
        }

        self.masked(result)
    }

    /// Generate a random identifier farther from `local_id` than bucket
    /// `floor_bucket`.
    ///
    /// The result lands in a bucket strictly above `floor_bucket`, or in the
    /// top bucket when `floor_bucket` already is the top bucket.
    pub fn far_identifier(&self, local_id: &NodeId, floor_bucket: usize) -> NodeId {
        let top = self.bits - 1;
        let bucket = if floor_bucket >= top {
            top
        } else {
            rand::thread_rng().gen_range(floor_bucket + 1..=top)
        };
        self.random_id_in_bucket(local_id, bucket)
    }
}

impl Default for IdSpace {
    fn default() -> Self {
        Self {
            bits: DEFAULT_ID_BITS,
        }
    }
}

impl TryFrom<usize> for IdSpace {
    type Error = KadError;

    fn try_from(bits: usize) -> Result<Self, Self::Error> {
        Self::new(bits)
    }
}

impl From<IdSpace> for usize {
    fn from(space: IdSpace) -> usize {
        space.bits
    }
}

impl fmt::Debug for IdSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdSpace({} bits)", self.bits)
    }
}

// ---------------------------------------------------------------------------
// NodeId
// ---------------------------------------------------------------------------

/// An `m`-bit identifier used for both node IDs and lookup targets.
///
/// Only the first `len` bytes are significant; the rest are always zero, so
/// the derived ordering is the big-endian unsigned ordering of the
/// significant bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    bytes: [u8; MAX_ID_BYTES],
    len: u8,
}

impl NodeId {
    /// Return the significant bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    /// Number of significant bytes.
    pub fn byte_len(&self) -> usize {
        self.len as usize
    }

    /// Byte-wise XOR with another identifier of the same space.
    pub fn xor(&self, other: &Self) -> NodeId {
        debug_assert_eq!(self.len, other.len, "identifiers from different spaces");
        let mut bytes = [0u8; MAX_ID_BYTES];
        for (i, byte) in bytes.iter_mut().enumerate().take(self.len as usize) {
            *byte = self.bytes[i] ^ other.bytes[i];
        }
        NodeId {
            bytes,
            len: self.len,
        }
    }

    /// XOR distance to another `NodeId`.
    pub fn distance(&self, other: &Self) -> Distance {
        Distance(self.xor(other))
    }

    /// Returns the index of the highest differing bit between `self` and
    /// `other`, counted from the least significant bit. This is the k-bucket
    /// index. Returns `None` if `self == other`.
    pub fn bucket_index(&self, other: &Self) -> Option<usize> {
        let dist = self.distance(other);
        if dist.is_zero() {
            None
        } else {
            Some(dist.bucket_index())
        }
    }

    /// Whether every bit is zero.
    pub fn is_zero(&self) -> bool {
        self.as_bytes().iter().all(|b| *b == 0)
    }

    /// Full lowercase hex rendering.
    pub fn to_hex(&self) -> String {
        self.as_bytes().iter().map(|b| format!("{:02x}", b)).collect()
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Show first 4 bytes as hex for readability
        let bytes = self.as_bytes();
        for byte in bytes.iter().take(4) {
            write!(f, "{:02x}", byte)?;
        }
        if bytes.len() > 4 {
            write!(f, "…")?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Distance
// ---------------------------------------------------------------------------

/// XOR distance between two `NodeId`s.
///
/// Ordered by big-endian unsigned byte comparison, so sorting by `Distance`
/// sorts by closeness.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Distance(NodeId);

impl Distance {
    /// The raw XOR value.
    pub fn as_id(&self) -> &NodeId {
        &self.0
    }

    /// Returns the number of leading zero bits within the significant bytes.
    pub fn leading_zeros(&self) -> usize {
        let bytes = self.0.as_bytes();
        for (i, byte) in bytes.iter().enumerate() {
            if *byte != 0 {
                return i * 8 + byte.leading_zeros() as usize;
            }
        }
        bytes.len() * 8
    }

    /// Returns `true` if the distance is zero (identical nodes).
    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    /// Index of the most significant set bit (bit 0 = least significant).
    ///
    /// The zero distance maps to bucket 0.
    pub fn bucket_index(&self) -> usize {
        let total = self.0.byte_len() * 8;
        let lz = self.leading_zeros();
        if lz >= total {
            0
        } else {
            total - 1 - lz
        }
    }
}

impl fmt::Debug for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Distance(lz={})", self.leading_zeros())
    }
}

impl fmt::Display for Distance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum KadError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("invalid address: {0}")]
    InvalidAddress(String),

    #[error("identity collision: {0} is already registered")]
    IdentityCollision(NodeId),

    #[error("cannot add a missing contact to the routing table")]
    MissingContact,

    #[error("RPC timeout contacting {0}")]
    Timeout(NodeId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("node unreachable: {0}")]
    Unreachable(NodeId),

    #[error("internal error: {0}")]
    Internal(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn space(bits: usize) -> IdSpace {
        IdSpace::new(bits).unwrap()
    }

    fn id(space: &IdSpace, bytes: &[u8]) -> NodeId {
        space.from_bytes(bytes).unwrap()
    }

    #[test]
    fn test_id_space_rejects_bad_lengths() {
        assert!(IdSpace::new(0).is_err());
        assert!(IdSpace::new(MAX_ID_BITS + 1).is_err());
        assert_eq!(space(8).byte_len(), 1);
        assert_eq!(space(12).byte_len(), 2);
        assert_eq!(space(160).byte_len(), 20);
        assert_eq!(space(MAX_ID_BITS).byte_len(), MAX_ID_BYTES);
    }

    #[test]
    fn test_from_bytes_masks_high_bits() {
        let s = space(12);
        let a = id(&s, &[0xFF, 0xFF]);
        assert_eq!(a.as_bytes(), &[0x0F, 0xFF]);
        assert!(s.from_bytes(&[0x01]).is_err());
    }

    #[test]
    fn test_xor_distance_identity() {
        let s = IdSpace::default();
        let a = s.random();
        assert!(a.distance(&a).is_zero());
        assert_eq!(a.xor(&a), s.zero());
    }

    #[test]
    fn test_xor_distance_symmetry() {
        for bits in [3, 8, 13, 160, 256] {
            let s = space(bits);
            let a = s.random();
            let b = s.random();
            assert_eq!(a.distance(&b), b.distance(&a));
            assert_eq!(a.xor(&b).cmp(&b.xor(&a)), std::cmp::Ordering::Equal);
        }
    }

    #[test]
    fn test_distance_ordering() {
        let s = space(16);
        let d1 = id(&s, &[0x01, 0x00]).distance(&s.zero()); // small
        let d2 = id(&s, &[0x80, 0x00]).distance(&s.zero()); // large
        let d3 = id(&s, &[0x00, 0xFF]).distance(&s.zero());

        assert!(d1 < d2, "0x0100 should be closer than 0x8000");
        assert!(d3 < d1, "0x00ff should be closer than 0x0100");
        assert!(s.zero().distance(&s.zero()) < d3);
    }

    #[test]
    fn test_leading_zeros() {
        let s = space(16);
        assert_eq!(s.zero().distance(&s.zero()).leading_zeros(), 16);
        assert_eq!(id(&s, &[0x80, 0]).distance(&s.zero()).leading_zeros(), 0);
        assert_eq!(id(&s, &[0x01, 0]).distance(&s.zero()).leading_zeros(), 7);
        assert_eq!(id(&s, &[0x00, 0x01]).distance(&s.zero()).leading_zeros(), 15);
    }

    #[test]
    fn test_bucket_index_self() {
        let s = IdSpace::default();
        let a = s.random();
        assert_eq!(a.bucket_index(&a), None);
        assert_eq!(a.distance(&a).bucket_index(), 0);
    }

    #[test]
    fn test_bucket_index_known_values() {
        let s = IdSpace::default();
        let a = s.zero();
        let mut bytes = [0u8; 20];

        // differs only in the last bit -> bucket 0
        bytes[19] = 0x01;
        assert_eq!(a.bucket_index(&id(&s, &bytes)), Some(0));

        // differs in the MSB -> bucket 159
        bytes = [0u8; 20];
        bytes[0] = 0x80;
        assert_eq!(a.bucket_index(&id(&s, &bytes)), Some(159));

        // second byte MSB -> bucket 151
        bytes = [0u8; 20];
        bytes[1] = 0x80;
        assert_eq!(a.bucket_index(&id(&s, &bytes)), Some(151));
    }

    #[test]
    fn test_bucket_index_respects_short_spaces() {
        let s = space(5);
        let top = id(&s, &[0b1_0000]);
        assert_eq!(s.zero().bucket_index(&top), Some(4));

        let s = space(10);
        let top = id(&s, &[0b10, 0]);
        assert_eq!(s.zero().bucket_index(&top), Some(9));
        let low = id(&s, &[0, 0b100]);
        assert_eq!(s.zero().bucket_index(&low), Some(2));
    }

    #[test]
    fn test_random_ids_are_masked() {
        let s = space(11);
        for _ in 0..200 {
            let r = s.random();
            assert_eq!(r.as_bytes()[0] & 0xF8, 0);
            if let Some(b) = s.zero().bucket_index(&r) {
                assert!(b < 11);
            }
        }
    }

    #[test]
    fn test_random_id_in_bucket() {
        for bits in [8, 13, 160] {
            let s = space(bits);
            let local = s.random();
            for bucket in [0, 1, bits / 2, bits - 1] {
                let generated = s.random_id_in_bucket(&local, bucket);
                assert_eq!(
                    local.bucket_index(&generated),
                    Some(bucket),
                    "expected bucket {} in a {}-bit space",
                    bucket,
                    bits
                );
            }
        }
    }

    #[test]
    fn test_random_id_in_bucket_randomness() {
        let s = IdSpace::default();
        let local = s.random();
        let ids: Vec<NodeId> = (0..100).map(|_| s.random_id_in_bucket(&local, 80)).collect();
        let unique: std::collections::HashSet<NodeId> = ids.iter().copied().collect();
        assert!(unique.len() > 1, "random IDs in same bucket should vary");
    }

    #[test]
    fn test_far_identifier_is_beyond_floor() {
        let s = space(8);
        let local = s.random();
        for floor in 0..8 {
            for _ in 0..50 {
                let far = s.far_identifier(&local, floor);
                let bucket = local.bucket_index(&far).unwrap();
                if floor < 7 {
                    assert!(bucket > floor, "bucket {} not beyond {}", bucket, floor);
                } else {
                    assert_eq!(bucket, 7);
                }
            }
        }
    }

    #[test]
    fn test_derive_is_deterministic_and_masked() {
        let s = space(12);
        let hasher = Shake256Hasher;
        let a = s.derive(&hasher, b"10.0.0.1:4000");
        let b = s.derive(&hasher, b"10.0.0.1:4000");
        assert_eq!(a, b);
        assert_eq!(a.as_bytes()[0] & 0xF0, 0);

        let wide = IdSpace::default();
        assert_ne!(
            wide.derive(&hasher, b"10.0.0.1:4000"),
            wide.derive(&hasher, b"10.0.0.1:4001")
        );
    }

    #[test]
    fn test_display_and_debug() {
        let s = IdSpace::default();
        let mut bytes = [0u8; 20];
        bytes[..4].copy_from_slice(&[0xAB, 0xCD, 0xEF, 0x01]);
        let a = id(&s, &bytes);
        assert_eq!(format!("{}", a), "abcdef01…");
        assert!(format!("{:?}", a).starts_with("NodeId("));

        let short = id(&space(8), &[0x2a]);
        assert_eq!(format!("{}", short), "2a");
        assert_eq!(short.to_hex(), "2a");
    }

    #[test]
    fn test_distance_xor_identity() {
        // d(a,c) = d(a,b) XOR d(b,c)
        let s = space(64);
        for _ in 0..100 {
            let a = s.random();
            let b = s.random();
            let c = s.random();
            let lhs = a.xor(&c);
            let rhs = a.xor(&b).xor(&b.xor(&c));
            assert_eq!(lhs, rhs);
        }
    }

    #[test]
    fn test_serde_roundtrip() {
        let s = space(40);
        let a = s.random();
        let json = serde_json::to_string(&a).unwrap();
        let back: NodeId = serde_json::from_str(&json).unwrap();
        assert_eq!(a, back);

        let json = serde_json::to_string(&s).unwrap();
        assert_eq!(json, "40");
        let back: IdSpace = serde_json::from_str(&json).unwrap();
        assert_eq!(s, back);
        assert!(serde_json::from_str::<IdSpace>("0").is_err());
    }
}
