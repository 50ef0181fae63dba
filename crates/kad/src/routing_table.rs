//! Kademlia routing table with k-buckets.
//!
//! The routing table organises known peers into `m` buckets, one per
//! bit-distance from the local node. Each bucket holds at most `k` entries
//! in LRU order (head = least-recently seen, tail = most-recently seen) and
//! is only allocated once something lands in it.

use crate::contact::{sort_by_distance, Contact};
use kadsim_common::{IdSpace, KadError, NodeId};

/// Default k-bucket capacity.
pub const DEFAULT_K: usize = 20;

// ---------------------------------------------------------------------------
// UpdateResult
// ---------------------------------------------------------------------------

/// Outcome of inserting/updating a node in the routing table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateResult {
    /// Node was added to its bucket (had room).
    Added,
    /// Node was already present; its position was moved to tail (most-recently seen).
    Updated,
    /// The bucket is full. The caller should ping `to_ping` (the least-recently
    /// seen node), then call `apply_ping_result` with the outcome.
    Pending { to_ping: Contact, pending: Contact },
    /// The node was not added: it is the owner, it lost its slot, or its
    /// bucket is already waiting on a ping.
    Ignored,
}

// ---------------------------------------------------------------------------
// KBucket
// ---------------------------------------------------------------------------

/// A single k-bucket: a bounded list of peers ordered by recency.
#[derive(Debug)]
struct KBucket {
    /// Entries ordered: index 0 = least-recently seen, last = most-recently seen.
    entries: Vec<Contact>,
    capacity: usize,
    /// An eviction ping for the head is in flight.
    pinging: bool,
}

impl KBucket {
    fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
            pinging: false,
        }
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    /// Find the position of a node by ID.
    fn position(&self, id: &NodeId) -> Option<usize> {
        self.entries.iter().position(|e| e.id == *id)
    }

    /// Move an existing entry to the tail (most-recently seen).
    fn move_to_tail(&mut self, idx: usize) {
        let entry = self.entries.remove(idx);
        self.entries.push(entry);
    }

    /// Push a new entry to the tail.
    fn push(&mut self, contact: Contact) {
        debug_assert!(!self.is_full());
        self.entries.push(contact);
    }

    /// Remove a specific node by ID.
    fn remove(&mut self, id: &NodeId) -> Option<Contact> {
        let idx = self.position(id)?;
        Some(self.entries.remove(idx))
    }

    /// Get the head (least-recently seen) entry.
    fn head(&self) -> Option<&Contact> {
        self.entries.first()
    }

    /// Return all entries as a slice (LRU order).
    fn entries(&self) -> &[Contact] {
        &self.entries
    }
}

// ---------------------------------------------------------------------------
// RoutingTable
// ---------------------------------------------------------------------------

/// The Kademlia routing table.
///
/// Contains `m` k-buckets indexed by XOR distance. Bucket `i` stores nodes
/// whose XOR distance from the local node has its highest set bit at
/// position `i` (i.e., `bucket_index` returns `i`). The local node itself is
/// never stored.
#[derive(Debug)]
pub struct RoutingTable {
    local_id: NodeId,
    space: IdSpace,
    buckets: Vec<Option<KBucket>>,
    k: usize,
}

impl RoutingTable {
    /// Create a new routing table for the given local node ID.
    pub fn new(local_id: NodeId, space: IdSpace, k: usize) -> Self {
        let buckets = (0..space.bits()).map(|_| None).collect();
        Self {
            local_id,
            space,
            buckets,
            k,
        }
    }

    /// The local node's ID.
    pub fn local_id(&self) -> NodeId {
        self.local_id
    }

    /// The k parameter (bucket capacity).
    pub fn k(&self) -> usize {
        self.k
    }

    pub fn space(&self) -> IdSpace {
        self.space
    }

    /// Determine which bucket a node belongs to.
    /// Returns `None` if `node_id == self.local_id`.
    pub fn bucket_index(&self, node_id: &NodeId) -> Option<usize> {
        self.local_id.bucket_index(node_id)
    }

    fn bucket_mut(&mut self, idx: usize) -> &mut KBucket {
        let k = self.k;
        self.buckets[idx].get_or_insert_with(|| KBucket::new(k))
    }

    /// Insert or update a node in the routing table.
    ///
    /// - If the node is us, returns `Ignored`.
    /// - If the node is already known, moves it to the tail of its bucket → `Updated`.
    /// - If the bucket has room, adds the node → `Added`.
    /// - If the bucket is full, returns `Pending` with the LRS node to ping
    ///   and marks the bucket as pinging until the result is applied. While
    ///   that ping is in flight, further newcomers to the bucket are `Ignored`.
    pub fn update(&mut self, contact: Contact) -> UpdateResult {
        let idx = match self.bucket_index(&contact.id) {
            Some(idx) => idx,
            None => return UpdateResult::Ignored, // self
        };

        let bucket = self.bucket_mut(idx);

        // Already in the bucket? Move to tail.
        if let Some(pos) = bucket.position(&contact.id) {
            bucket.move_to_tail(pos);
            return UpdateResult::Updated;
        }

        // Room in the bucket? Add.
        if !bucket.is_full() {
            bucket.push(contact);
            return UpdateResult::Added;
        }

        if bucket.pinging {
            return UpdateResult::Ignored;
        }

        // Bucket full: return the LRS node for the caller to ping.
        match bucket.head().copied() {
            Some(head) => {
                bucket.pinging = true;
                UpdateResult::Pending {
                    to_ping: head,
                    pending: contact,
                }
            }
            // A zero-capacity bucket never admits anyone.
            None => UpdateResult::Ignored,
        }
    }

    /// Like [`update`](Self::update), but for a contact that may be absent.
    ///
    /// An absent contact is rejected with `MissingContact` and the table is
    /// left untouched.
    pub fn try_update(&mut self, contact: Option<Contact>) -> Result<UpdateResult, KadError> {
        let contact = contact.ok_or(KadError::MissingContact)?;
        Ok(self.update(contact))
    }

    /// Resolve a pending insertion after the caller has pinged the LRS node.
    ///
    /// - If `alive` is true: the LRS node responded, so move it to tail and
    ///   discard the pending node.
    /// - If `alive` is false: evict the LRS node and add the pending node if
    ///   its bucket now has room.
    ///
    /// The bucket may have changed while the ping was in flight; each branch
    /// re-checks membership instead of assuming the earlier snapshot.
    pub fn apply_ping_result(
        &mut self,
        pinged_id: &NodeId,
        alive: bool,
        pending: Contact,
    ) -> UpdateResult {
        let idx = match self.bucket_index(pinged_id) {
            Some(idx) => idx,
            None => return UpdateResult::Ignored,
        };
        self.bucket_mut(idx).pinging = false;

        if alive {
            // LRS is alive: move it to tail, discard the pending node.
            let bucket = self.bucket_mut(idx);
            if let Some(pos) = bucket.position(pinged_id) {
                bucket.move_to_tail(pos);
            }
            return UpdateResult::Updated;
        }

        // LRS is dead: evict it, add the pending node.
        self.bucket_mut(idx).remove(pinged_id);

        let pending_idx = match self.bucket_index(&pending.id) {
            Some(i) => i,
            None => return UpdateResult::Ignored,
        };
        let bucket = self.bucket_mut(pending_idx);
        if let Some(pos) = bucket.position(&pending.id) {
            bucket.move_to_tail(pos);
            UpdateResult::Updated
        } else if bucket.is_full() {
            UpdateResult::Ignored
        } else {
            bucket.push(pending);
            UpdateResult::Added
        }
    }

    /// Clear the pending-ping mark left by `update` when the ping of `pinged_id`
    /// was abandoned before its result could be applied.
    pub fn abandon_ping(&mut self, pinged_id: &NodeId) {
        if let Some(idx) = self.bucket_index(pinged_id) {
            if let Some(bucket) = self.buckets[idx].as_mut() {
                bucket.pinging = false;
            }
        }
    }

    /// Up to `k` known contacts near `target`, in ascending distance order.
    ///
    /// Buckets are scanned outward from the bucket `target` falls into
    /// relative to the local node, with offsets 0, -1, +1, -2, +2, ...
    /// wrapping around the table. Each bucket is visited once and its entries
    /// are taken closest-first until `k` contacts are collected.
    pub fn get_contacts(&self, target: &NodeId) -> Vec<Contact> {
        let m = self.buckets.len();
        let mut result: Vec<Contact> = Vec::with_capacity(self.k);
        if m == 0 || self.k == 0 {
            return result;
        }

        let start = self.bucket_index(target).unwrap_or(0);
        let mut visited = vec![false; m];
        let mut remaining = m;
        let mut step = 0usize;

        while remaining > 0 && result.len() < self.k {
            let radius = step.div_ceil(2) as isize;
            let offset = if step % 2 == 1 { -radius } else { radius };
            step += 1;

            let idx = (start as isize + offset).rem_euclid(m as isize) as usize;
            if visited[idx] {
                continue;
            }
            visited[idx] = true;
            remaining -= 1;

            let Some(bucket) = &self.buckets[idx] else {
                continue;
            };
            let mut candidates = bucket.entries().to_vec();
            sort_by_distance(&mut candidates, target);
            for contact in candidates {
                if result.len() >= self.k {
                    break;
                }
                if !result.contains(&contact) {
                    result.push(contact);
                }
            }
        }

        sort_by_distance(&mut result, target);
        result
    }

    /// Whether `contact` is the owner or is stored in its bucket.
    pub fn contains(&self, contact: &Contact) -> bool {
        match self.bucket_index(&contact.id) {
            None => true,
            Some(idx) => self.buckets[idx]
                .as_ref()
                .is_some_and(|b| b.position(&contact.id).is_some()),
        }
    }

    /// The contact closest to the owner within the lowest non-empty bucket.
    pub fn closest(&self) -> Option<Contact> {
        let local = self.local_id;
        self.buckets
            .iter()
            .flatten()
            .find(|b| b.len() > 0)
            .and_then(|b| b.entries().iter().min_by_key(|c| c.id.distance(&local)))
            .copied()
    }

    /// Remove a node from the routing table.
    pub fn remove(&mut self, node_id: &NodeId) -> Option<Contact> {
        let idx = self.bucket_index(node_id)?;
        self.buckets[idx].as_mut()?.remove(node_id)
    }

    /// Look up a specific node by ID.
    pub fn get(&self, node_id: &NodeId) -> Option<&Contact> {
        let idx = self.bucket_index(node_id)?;
        let bucket = self.buckets[idx].as_ref()?;
        bucket.entries().iter().find(|e| e.id == *node_id)
    }

    /// Entries of bucket `idx` in LRU order, if that bucket exists.
    pub fn bucket(&self, idx: usize) -> Option<&[Contact]> {
        self.buckets.get(idx)?.as_ref().map(KBucket::entries)
    }

    /// Indices of buckets holding at least one contact.
    pub fn populated_buckets(&self) -> Vec<usize> {
        self.buckets
            .iter()
            .enumerate()
            .filter(|(_, b)| b.as_ref().is_some_and(|b| b.len() > 0))
            .map(|(i, _)| i)
            .collect()
    }

    /// Iterate over all known nodes in the table.
    pub fn all_nodes(&self) -> Vec<Contact> {
        self.buckets
            .iter()
            .flatten()
            .flat_map(|b| b.entries().iter().copied())
            .collect()
    }

    /// One `(owner, peer)` pair per stored contact.
    pub fn edges(&self) -> Vec<(NodeId, NodeId)> {
        self.buckets
            .iter()
            .flatten()
            .flat_map(|b| b.entries().iter().map(|c| (self.local_id, c.id)))
            .collect()
    }

    /// Total number of known nodes.
    pub fn len(&self) -> usize {
        self.buckets.iter().flatten().map(KBucket::len).sum()
    }

    /// Whether the table has no known nodes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
