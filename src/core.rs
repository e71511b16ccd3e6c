//! Keyspace primitives shared by every lookup strategy.
//!
//! This module contains the leaf data types of the lookup engine:
//!
//! - **Identity & Hashing**: [`OverlayKey`], [`derive_node_id`], [`hash_content`]
//! - **Distance Metrics**: the pluggable [`KeyMetric`] with [`XorMetric`] and [`RingMetric`]
//! - **Peers**: [`NodeHandle`] and the closest-first, key-deduplicated [`NodeVector`]
//! - **Local candidates**: [`RoutingTable`], a bounded neighbour cache
//! - **Virtual time**: [`Timestamp`] as seen by the discrete-event loop

use std::cmp::Ordering;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::num::NonZeroUsize;
use std::ops::{Add, Sub};
use std::time::Duration;

use iroh_blake3::Hasher;
use lru::LruCache;
use serde::{Deserialize, Serialize};

// ============================================================================
// Overlay Keys
// ============================================================================

/// Width of an [`OverlayKey`] in bytes.
pub const KEY_LEN: usize = 32;

/// A 256-bit position in the overlay's keyspace.
///
/// The derived `Ord` is the raw big-endian byte order. It carries no routing
/// meaning and is only used to break distance ties deterministically; use a
/// [`KeyMetric`] to decide which of two keys is closer to a target.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct OverlayKey(pub [u8; KEY_LEN]);

impl OverlayKey {
    pub const ZERO: OverlayKey = OverlayKey([0u8; KEY_LEN]);
    pub const MAX: OverlayKey = OverlayKey([0xFF; KEY_LEN]);

    pub fn from_bytes(bytes: [u8; KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Hash arbitrary bytes into the keyspace with BLAKE3.
    pub fn hash(data: &[u8]) -> Self {
        Self(blake3_digest(data))
    }

    pub fn as_bytes(&self) -> &[u8; KEY_LEN] {
        &self.0
    }

    /// Bitwise XOR of two keys.
    pub fn xor(&self, other: &OverlayKey) -> OverlayKey {
        let mut out = [0u8; KEY_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        OverlayKey(out)
    }

    /// `self - other` modulo 2^256.
    pub fn wrapping_sub(&self, other: &OverlayKey) -> OverlayKey {
        let mut out = [0u8; KEY_LEN];
        let mut borrow = 0i16;
        for i in (0..KEY_LEN).rev() {
            let mut diff = self.0[i] as i16 - other.0[i] as i16 - borrow;
            if diff < 0 {
                diff += 256;
                borrow = 1;
            } else {
                borrow = 0;
            }
            out[i] = diff as u8;
        }
        OverlayKey(out)
    }

    /// Short hex prefix used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..4])
    }
}

impl fmt::Display for OverlayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for OverlayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OverlayKey({}..)", self.short())
    }
}

// ============================================================================
// Hashing Functions
// ============================================================================

fn blake3_digest(data: &[u8]) -> [u8; KEY_LEN] {
    let mut hasher = Hasher::new();
    hasher.update(data);
    let digest = hasher.finalize();

    let mut out = [0u8; KEY_LEN];
    out.copy_from_slice(digest.as_bytes());
    out
}

/// Derive a stable node key by hashing arbitrary input with BLAKE3.
///
/// ```
/// use overlay_kbr::derive_node_id;
///
/// let key = derive_node_id(b"example-public-key-bytes");
/// assert_eq!(key, derive_node_id(b"example-public-key-bytes"));
/// ```
pub fn derive_node_id(data: &[u8]) -> OverlayKey {
    OverlayKey::hash(data)
}

/// Compute a content-addressed lookup key as the BLAKE3 hash of content bytes.
pub fn hash_content(data: &[u8]) -> OverlayKey {
    OverlayKey::hash(data)
}

// ============================================================================
// Distance Metrics
// ============================================================================

/// The overlay's notion of "closer to a target".
///
/// Lookups never assume a geometry. They only ask a metric to order two
/// keys relative to a target, so the same engine drives Kademlia-style XOR
/// trees and Chord-style rings.
pub trait KeyMetric: Clone + fmt::Debug + Default + 'static {
    /// Distance from `key` to `target`. Smaller is closer.
    fn distance(&self, key: &OverlayKey, target: &OverlayKey) -> OverlayKey;

    /// Total order of `a` and `b` by closeness to `target`.
    ///
    /// Equal distances fall back to the raw key so sorting is reproducible.
    fn compare(&self, target: &OverlayKey, a: &OverlayKey, b: &OverlayKey) -> Ordering {
        self.distance(a, target)
            .cmp(&self.distance(b, target))
            .then_with(|| a.cmp(b))
    }

    /// True if `a` is strictly closer to `target` than `b`.
    fn closer_to(&self, target: &OverlayKey, a: &OverlayKey, b: &OverlayKey) -> bool {
        self.compare(target, a, b) == Ordering::Less
    }

    fn name(&self) -> &'static str;
}

/// Kademlia XOR metric.
///
/// - `distance(a, a) == 0`
/// - `distance(a, b) == distance(b, a)`
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct XorMetric;

impl KeyMetric for XorMetric {
    fn distance(&self, key: &OverlayKey, target: &OverlayKey) -> OverlayKey {
        key.xor(target)
    }

    fn name(&self) -> &'static str {
        "xor"
    }
}

/// Clockwise ring distance from the target to a node.
///
/// The closest node to a key is its successor on the ring, which is the node
/// a Chord-style overlay makes responsible for it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RingMetric;

impl KeyMetric for RingMetric {
    fn distance(&self, key: &OverlayKey, target: &OverlayKey) -> OverlayKey {
        key.wrapping_sub(target)
    }

    fn name(&self) -> &'static str {
        "ring"
    }
}

// ============================================================================
// Node Handles
// ============================================================================

/// Address and key of a remote peer, with no claim about its liveness.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeHandle {
    pub key: OverlayKey,
    pub addr: SocketAddr,
}

impl NodeHandle {
    /// Placeholder for "no node", e.g. the recommender of a locally seeded candidate.
    pub const UNSPECIFIED: NodeHandle = NodeHandle {
        key: OverlayKey::ZERO,
        addr: SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)),
    };

    pub fn new(key: OverlayKey, addr: SocketAddr) -> Self {
        Self { key, addr }
    }

    pub fn is_unspecified(&self) -> bool {
        self.addr.port() == 0 && self.addr.ip().is_unspecified()
    }
}

impl fmt::Debug for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key.short(), self.addr)
    }
}

impl fmt::Display for NodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Anything that sits at a position in the keyspace.
pub trait Keyed {
    fn key(&self) -> &OverlayKey;
}

impl Keyed for NodeHandle {
    fn key(&self) -> &OverlayKey {
        &self.key
    }
}

/// Bounded vector kept sorted closest-first to a target.
///
/// Entries are deduplicated by key. Inserting into a full vector evicts the
/// farthest entry; items farther than every entry of a full vector are refused.
#[derive(Clone, Debug)]
pub struct NodeVector<T, M> {
    target: OverlayKey,
    capacity: usize,
    metric: M,
    items: Vec<T>,
}

impl<T: Keyed, M: KeyMetric> NodeVector<T, M> {
    pub fn new(target: OverlayKey, capacity: usize, metric: M) -> Self {
        Self {
            target,
            capacity,
            metric,
            items: Vec::with_capacity(capacity.min(64)),
        }
    }

    pub fn target(&self) -> &OverlayKey {
        &self.target
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Insert `item`, returning its position, or `None` if it was a duplicate
    /// or fell outside the capacity.
    pub fn add(&mut self, item: T) -> Option<usize> {
        if self.capacity == 0 {
            return None;
        }
        let target = self.target;
        let pos = match self
            .items
            .binary_search_by(|probe| self.metric.compare(&target, probe.key(), item.key()))
        {
            Ok(_) => return None,
            Err(pos) => pos,
        };
        if pos >= self.capacity {
            return None;
        }
        self.items.insert(pos, item);
        self.items.truncate(self.capacity);
        Some(pos)
    }

    /// Whether an item with `key` would currently be kept by [`add`](Self::add).
    pub fn is_addable(&self, key: &OverlayKey) -> bool {
        if self.capacity == 0 {
            return false;
        }
        match self.items.last() {
            Some(last) if self.is_full() => self.metric.closer_to(&self.target, key, last.key()),
            _ => true,
        }
    }

    pub fn position(&self, key: &OverlayKey) -> Option<usize> {
        self.items.iter().position(|item| item.key() == key)
    }

    pub fn contains_key(&self, key: &OverlayKey) -> bool {
        self.position(key).is_some()
    }

    pub fn remove_key(&mut self, key: &OverlayKey) -> Option<T> {
        self.position(key).map(|pos| self.items.remove(pos))
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        self.items.get(index)
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        self.items.get_mut(index)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.items.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, T> {
        self.items.iter_mut()
    }

    pub fn retain(&mut self, keep: impl FnMut(&T) -> bool) {
        self.items.retain(keep);
    }

    pub fn truncate(&mut self, len: usize) {
        self.items.truncate(len);
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }

    pub fn as_slice(&self) -> &[T] {
        &self.items
    }

    pub fn into_vec(self) -> Vec<T> {
        self.items
    }
}

// ============================================================================
// Virtual Time
// ============================================================================

/// A point in simulated time, measured from the start of the event loop.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(Duration);

impl Timestamp {
    pub const ZERO: Timestamp = Timestamp(Duration::ZERO);

    pub fn from_millis(ms: u64) -> Self {
        Self(Duration::from_millis(ms))
    }

    pub fn since_start(&self) -> Duration {
        self.0
    }

    pub fn saturating_since(&self, earlier: Timestamp) -> Duration {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(rhs))
    }
}

impl Sub for Timestamp {
    type Output = Duration;

    fn sub(self, rhs: Timestamp) -> Duration {
        self.saturating_since(rhs)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.3}s", self.0.as_secs_f64())
    }
}

// ============================================================================
// Routing Table
// ============================================================================

/// Bounded neighbour cache that seeds lookups with local candidates.
///
/// Maintenance (finger tables, bucket refresh) belongs to the overlay; this
/// table only remembers the most recently seen peers, evicting the least
/// recently seen one when full, and answers closest-node queries under the
/// overlay's metric.
#[derive(Debug)]
pub struct RoutingTable<M: KeyMetric> {
    self_key: OverlayKey,
    metric: M,
    cache: LruCache<OverlayKey, NodeHandle>,
}

impl<M: KeyMetric> RoutingTable<M> {
    pub fn new(self_key: OverlayKey, metric: M, capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            self_key,
            metric,
            cache: LruCache::new(capacity),
        }
    }

    /// Add or refresh a peer. Returns true if the peer was not known before.
    pub fn update(&mut self, node: NodeHandle) -> bool {
        if node.key == self.self_key || node.is_unspecified() {
            return false;
        }
        self.cache.put(node.key, node).is_none()
    }

    pub fn remove(&mut self, key: &OverlayKey) -> Option<NodeHandle> {
        self.cache.pop(key)
    }

    pub fn contains(&self, key: &OverlayKey) -> bool {
        self.cache.contains(key)
    }

    /// Change the capacity, evicting the least recently seen peers if needed.
    pub fn set_capacity(&mut self, capacity: usize) {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        self.cache.resize(capacity);
    }

    /// Up to `count` known peers, closest to `target` first.
    pub fn closest(&self, target: &OverlayKey, count: usize) -> Vec<NodeHandle> {
        let mut all: Vec<NodeHandle> = self.cache.iter().map(|(_, node)| *node).collect();
        all.sort_by(|a, b| self.metric.compare(target, &a.key, &b.key));
        all.truncate(count);
        all
    }

    pub fn nodes(&self) -> impl Iterator<Item = &NodeHandle> {
        self.cache.iter().map(|(_, node)| node)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn metric(&self) -> &M {
        &self.metric
    }
}
