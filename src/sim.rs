//! Discrete event simulation of an overlay network.
//!
//! Every node is a full [`Overlay`]. Messages are encoded to frames, delayed
//! by the [`LinkModel`] and decoded on arrival; RPC timers fire as scheduled
//! events. Events are processed in `(time, sequence)` order, so a run is fully
//! determined by its seed.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, trace};

use crate::config::OverlayConfig;
use crate::core::{KeyMetric, NodeHandle, NodeVector, OverlayKey, Timestamp};
use crate::error::LookupError;
use crate::framing::{decode_envelope, encode_envelope};
use crate::lookup::{LookupOutcome, OneshotListener};
use crate::overlay::{Outgoing, Overlay};
use crate::protocol::{Nonce, RoutingMode};

/// Latency and loss applied to every message between two distinct nodes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkModel {
    #[serde(with = "crate::config::duration_ms")]
    pub latency: Duration,
    /// Uniform extra delay in `[0, jitter)`.
    #[serde(with = "crate::config::duration_ms")]
    pub jitter: Duration,
    /// Probability in `[0, 1]` that a message is lost.
    pub loss_rate: f64,
}

impl Default for LinkModel {
    fn default() -> Self {
        Self {
            latency: Duration::from_millis(50),
            jitter: Duration::from_millis(20),
            loss_rate: 0.0,
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SimStats {
    pub events: u64,
    pub messages_sent: u64,
    pub messages_delivered: u64,
    pub messages_lost: u64,
    /// Messages addressed to a failed or unknown node.
    pub messages_undeliverable: u64,
    pub frames_rejected: u64,
    pub timers_fired: u64,
}

#[derive(Debug)]
enum Event {
    Deliver { to: SocketAddr, frame: Vec<u8> },
    RpcTimer { node: SocketAddr, nonce: Nonce, deadline: Timestamp },
}

#[derive(Debug)]
struct ScheduledEvent {
    time: Timestamp,
    seq: u64,
    event: Event,
}

// BinaryHeap is a max-heap; reverse so the earliest event pops first.
impl PartialEq for ScheduledEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.seq == other.seq
    }
}

impl Eq for ScheduledEvent {}

impl PartialOrd for ScheduledEvent {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledEvent {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .time
            .cmp(&self.time)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct SimNode<M: KeyMetric> {
    overlay: Overlay<M>,
    alive: bool,
}

pub struct Simulator<M: KeyMetric> {
    config: OverlayConfig,
    link: LinkModel,
    metric: M,
    nodes: HashMap<SocketAddr, SimNode<M>>,
    order: Vec<SocketAddr>,
    queue: BinaryHeap<ScheduledEvent>,
    now: Timestamp,
    next_seq: u64,
    rng: StdRng,
    stats: SimStats,
}

impl<M: KeyMetric> Simulator<M> {
    pub fn new(config: OverlayConfig, link: LinkModel, seed: u64) -> Self {
        Self {
            config,
            link,
            metric: M::default(),
            nodes: HashMap::new(),
            order: Vec::new(),
            queue: BinaryHeap::new(),
            now: Timestamp::ZERO,
            next_seq: 0,
            rng: StdRng::seed_from_u64(seed),
            stats: SimStats::default(),
        }
    }

    pub fn now(&self) -> Timestamp {
        self.now
    }

    pub fn stats(&self) -> &SimStats {
        &self.stats
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Handles of every node, in insertion order.
    pub fn handles(&self) -> Vec<NodeHandle> {
        self.order
            .iter()
            .filter_map(|addr| self.nodes.get(addr))
            .map(|node| node.overlay.node())
            .collect()
    }

    pub fn alive_handles(&self) -> Vec<NodeHandle> {
        self.order
            .iter()
            .filter_map(|addr| self.nodes.get(addr))
            .filter(|node| node.alive)
            .map(|node| node.overlay.node())
            .collect()
    }

    pub fn node(&self, addr: &SocketAddr) -> Option<&Overlay<M>> {
        self.nodes.get(addr).map(|node| &node.overlay)
    }

    pub fn node_mut(&mut self, addr: &SocketAddr) -> Option<&mut Overlay<M>> {
        self.nodes.get_mut(addr).map(|node| &mut node.overlay)
    }

    /// Add a node with the given key; it gets the next free address.
    pub fn add_node(&mut self, key: OverlayKey) -> NodeHandle {
        let index = self.order.len() as u32 + 1;
        let ip = Ipv4Addr::from(0x0a00_0000 | index);
        let addr = SocketAddr::V4(SocketAddrV4::new(ip, 1024));
        let handle = NodeHandle::new(key, addr);
        let seed = self.rng.gen();
        let mut overlay = Overlay::new(handle, self.metric.clone(), self.config.clone(), seed);
        overlay.set_time(self.now);
        self.nodes.insert(addr, SimNode { overlay, alive: true });
        self.order.push(addr);
        handle
    }

    /// Add `count` nodes with keys drawn from the simulator's RNG.
    pub fn add_random_nodes(&mut self, count: usize) -> Vec<NodeHandle> {
        (0..count)
            .map(|_| {
                let mut key = [0u8; 32];
                self.rng.fill(&mut key);
                self.add_node(OverlayKey::from_bytes(key))
            })
            .collect()
    }

    /// Teach every node about every other node, up to its table capacity.
    pub fn connect_all(&mut self) {
        let handles = self.handles();
        for node in self.nodes.values_mut() {
            for peer in &handles {
                node.overlay.routing_table_mut().update(*peer);
            }
        }
    }

    /// Teach every node about `k` random peers.
    pub fn connect_random(&mut self, k: usize) {
        let handles = self.handles();
        for addr in self.order.clone() {
            let peers: Vec<NodeHandle> = handles
                .choose_multiple(&mut self.rng, k)
                .copied()
                .collect();
            if let Some(node) = self.nodes.get_mut(&addr) {
                for peer in peers {
                    node.overlay.routing_table_mut().update(peer);
                }
            }
        }
    }

    /// Stop a node: it no longer receives messages or fires timers.
    pub fn fail_node(&mut self, addr: &SocketAddr) -> bool {
        match self.nodes.get_mut(addr) {
            Some(node) if node.alive => {
                node.alive = false;
                node.overlay.finish_lookups();
                debug!(node = %node.overlay.node(), "node failed");
                true
            }
            _ => false,
        }
    }

    /// Start a lookup from `from` with the configured routing mode.
    pub fn lookup(
        &mut self,
        from: &SocketAddr,
        key: OverlayKey,
        num_siblings: usize,
    ) -> Result<oneshot::Receiver<LookupOutcome>, LookupError> {
        let routing = self.config.routing;
        self.lookup_with(from, routing, key, num_siblings, 0)
    }

    pub fn lookup_with(
        &mut self,
        from: &SocketAddr,
        routing: RoutingMode,
        key: OverlayKey,
        num_siblings: usize,
        retries: u32,
    ) -> Result<oneshot::Receiver<LookupOutcome>, LookupError> {
        let (listener, rx) = OneshotListener::channel();
        let id = match self.nodes.get_mut(from) {
            Some(node) => {
                node.overlay.set_time(self.now);
                node.overlay
                    .lookup_with(routing, key, num_siblings, retries, Some(listener))?
            }
            None => return Err(LookupError::UnknownNode(*from)),
        };
        trace!(from = %from, lookup = id, key = %key.short(), "lookup scheduled");
        self.collect_outgoing(*from);
        Ok(rx)
    }

    /// Process events until the queue is empty.
    pub fn run_until_idle(&mut self) {
        while let Some(scheduled) = self.queue.pop() {
            self.process(scheduled);
        }
    }

    /// Process events scheduled up to and including `until`.
    pub fn run_until(&mut self, until: Timestamp) {
        while self.queue.peek().is_some_and(|next| next.time <= until) {
            if let Some(scheduled) = self.queue.pop() {
                self.process(scheduled);
            }
        }
        self.now = self.now.max(until);
    }

    /// The `count` live nodes closest to `key` by global knowledge.
    pub fn true_siblings(&self, key: &OverlayKey, count: usize) -> Vec<NodeHandle> {
        let mut closest = NodeVector::new(*key, count, self.metric.clone());
        for node in self.alive_handles() {
            closest.add(node);
        }
        closest.into_vec()
    }

    fn process(&mut self, scheduled: ScheduledEvent) {
        self.now = self.now.max(scheduled.time);
        self.stats.events += 1;
        let now = self.now;
        match scheduled.event {
            Event::Deliver { to, frame } => {
                let Some(node) = self.nodes.get_mut(&to).filter(|node| node.alive) else {
                    self.stats.messages_undeliverable += 1;
                    return;
                };
                let envelope = match decode_envelope(&frame) {
                    Ok(envelope) => envelope,
                    Err(err) => {
                        debug!(to = %to, %err, "rejected frame");
                        self.stats.frames_rejected += 1;
                        return;
                    }
                };
                self.stats.messages_delivered += 1;
                node.overlay.handle_envelope(envelope, now);
                self.collect_outgoing(to);
            }
            Event::RpcTimer { node, nonce, deadline } => {
                let Some(sim_node) = self.nodes.get_mut(&node).filter(|node| node.alive) else {
                    return;
                };
                self.stats.timers_fired += 1;
                sim_node.overlay.handle_timer(nonce, deadline, now);
                self.collect_outgoing(node);
            }
        }
    }

    fn collect_outgoing(&mut self, from: SocketAddr) {
        let outgoing = match self.nodes.get_mut(&from) {
            Some(node) => node.overlay.take_outgoing(),
            None => return,
        };
        for item in outgoing {
            match item {
                Outgoing::Message { to, envelope } => {
                    self.stats.messages_sent += 1;
                    let frame = match encode_envelope(&envelope) {
                        Ok(frame) => frame,
                        Err(err) => {
                            debug!(from = %from, %err, "unencodable envelope");
                            self.stats.frames_rejected += 1;
                            continue;
                        }
                    };
                    if to == from {
                        self.schedule(self.now, Event::Deliver { to, frame });
                        continue;
                    }
                    let lost = self.link.loss_rate > 0.0
                        && self.rng.gen_bool(self.link.loss_rate.min(1.0));
                    if lost {
                        self.stats.messages_lost += 1;
                        continue;
                    }
                    let delay = self.link_delay();
                    self.schedule(self.now + delay, Event::Deliver { to, frame });
                }
                Outgoing::Timer { nonce, deadline } => {
                    self.schedule(deadline, Event::RpcTimer { node: from, nonce, deadline });
                }
            }
        }
    }

    fn link_delay(&mut self) -> Duration {
        let jitter_ms = self.link.jitter.as_millis() as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(self.rng.gen_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };
        self.link.latency + jitter
    }

    fn schedule(&mut self, time: Timestamp, event: Event) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.queue.push(ScheduledEvent { time, seq, event });
    }
}
