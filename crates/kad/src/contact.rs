//! Descriptor for a known peer: an identifier bound to an IPv4 address.

use kadsim_common::{IdHasher, IdSpace, KadError, NodeId};
use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

/// Descriptor for a peer node in the Kademlia network.
///
/// The identifier is derived from the address once, when the contact is
/// built, and never recomputed. Two contacts are equal iff their identifiers
/// are equal; the address is not part of identity.
#[derive(Debug, Clone, Copy)]
pub struct Contact {
    /// The node's `m`-bit Kademlia identifier.
    pub id: NodeId,
    /// Address the identifier was derived from.
    pub addr: SocketAddrV4,
}

impl Contact {
    /// Build a contact whose identifier is `hash(ip || port)` truncated to the
    /// space's width. The port is hashed big-endian.
    pub fn new(space: &IdSpace, hasher: &dyn IdHasher, addr: SocketAddrV4) -> Self {
        let mut input = [0u8; 6];
        input[..4].copy_from_slice(&addr.ip().octets());
        input[4..].copy_from_slice(&addr.port().to_be_bytes());
        Self {
            id: space.derive(hasher, &input),
            addr,
        }
    }

    /// Build a contact from unchecked numeric address parts.
    pub fn from_raw(
        space: &IdSpace,
        hasher: &dyn IdHasher,
        octets: [i64; 4],
        port: i64,
    ) -> Result<Self, KadError> {
        let mut ip = [0u8; 4];
        for (slot, value) in ip.iter_mut().zip(octets) {
            *slot = u8::try_from(value).map_err(|_| {
                KadError::InvalidAddress(format!("IP octet {} is outside 0..=255", value))
            })?;
        }
        let port = u16::try_from(port)
            .map_err(|_| KadError::InvalidAddress(format!("port {} is outside 0..=65535", port)))?;
        Ok(Self::new(
            space,
            hasher,
            SocketAddrV4::new(Ipv4Addr::from(ip), port),
        ))
    }

    /// Parse `"a.b.c.d:port"` and build the contact.
    pub fn parse(space: &IdSpace, hasher: &dyn IdHasher, s: &str) -> Result<Self, KadError> {
        let addr: SocketAddrV4 = s
            .trim()
            .parse()
            .map_err(|e| KadError::InvalidAddress(format!("'{}': {}", s, e)))?;
        Ok(Self::new(space, hasher, addr))
    }

    /// Assemble a contact from an identifier reported by a peer.
    pub fn from_parts(id: NodeId, addr: SocketAddrV4) -> Self {
        Self { id, addr }
    }

    /// Create a `Contact` with a dummy address (useful for testing).
    pub fn with_dummy_addr(id: NodeId) -> Self {
        Self::from_parts(id, SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0))
    }
}

impl PartialEq for Contact {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Contact {}

impl std::hash::Hash for Contact {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Display for Contact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.id, self.addr)
    }
}

/// Sort contacts by ascending XOR distance to `pivot`.
///
/// The sort is stable, so contacts at equal distance keep their relative
/// order, and sorting an already sorted slice leaves it unchanged.
pub fn sort_by_distance(contacts: &mut [Contact], pivot: &NodeId) {
    contacts.sort_by_key(|c| c.id.distance(pivot));
}
