//! Iterative lookup: the caller probes candidates itself, in parallel paths.
//!
//! The seeds from the local routing table are split round-robin across
//! `parallel_paths` independent paths. Each path keeps its own closest-first
//! candidate list and keeps up to `parallel_rpcs` find calls in flight. A
//! destination probed by several paths at once receives a single call whose
//! answer is fanned out to all of them.
//!
//! A path ends in one of three ways:
//!
//! - a responder answers as a sibling of the key, and its nodes become sibling
//!   candidates;
//! - nothing is left to probe, and the path converges on the closest nodes
//!   that actually answered;
//! - its hop ceiling or the lookup timeout is reached, and it fails.
//!
//! The lookup stops once every path has ended and no sibling verification is
//! pending, or once nothing at all is in flight.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;

use tracing::{debug, trace};

use crate::config::IterativeLookupConfig;
use crate::core::{KeyMetric, Keyed, NodeHandle, NodeVector, OverlayKey, Timestamp};
use crate::error::LookupError;
use crate::lookup::{AbstractLookup, LookupHost, LookupId, LookupListener, RpcListener};
use crate::protocol::{
    FailedNodeCall, FindNodeCall, FindNodeResponse, Nonce, RpcCall, RpcResponse, StatType,
};
use crate::rpc::{RpcReply, RpcRequest, RpcTimeout};

const CTX_FIND_NODE: u64 = 0;
const CTX_PING: u64 = 1;
const CTX_FAILED_NODE: u64 = 2;

/// A next-hop candidate of one path.
#[derive(Clone, Copy, Debug)]
struct Candidate {
    handle: NodeHandle,
    already_used: bool,
    responded: bool,
}

impl Keyed for Candidate {
    fn key(&self) -> &OverlayKey {
        &self.handle.key
    }
}

struct Path<M> {
    next_hops: NodeVector<Candidate, M>,
    /// Recommender of every node this path has ever considered.
    sources: HashMap<OverlayKey, NodeHandle>,
    step: u32,
    hops: u32,
    pending_rpcs: usize,
    finished: bool,
    success: bool,
}

/// One find call shared by every path that wanted the same destination.
struct InFlight {
    nonce: Nonce,
    dest: NodeHandle,
    /// `(path, step)` of every path waiting on the answer.
    waiters: Vec<(usize, u32)>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Phase {
    Idle,
    Probing,
    Finished,
}

pub struct IterativeLookup<M: KeyMetric> {
    id: LookupId,
    metric: M,
    config: IterativeLookupConfig,
    exhaustive: bool,
    app_lookup: bool,
    phase: Phase,

    key: OverlayKey,
    num_siblings: usize,
    hop_count_max: u32,
    retries: u32,
    listener: Option<Box<dyn LookupListener>>,

    this_node: NodeHandle,
    start_time: Timestamp,
    paths: Vec<Path<M>>,
    finished_paths: usize,
    successful_paths: usize,
    accumulated_hops: u32,
    success: bool,
    /// Whether the current attempt has put any call on the wire.
    attempt_sent: bool,

    siblings: NodeVector<NodeHandle, M>,
    /// Paths that proposed each sibling candidate.
    votes: HashMap<OverlayKey, HashSet<usize>>,
    /// Nodes a find call has been sent to.
    visited: HashSet<SocketAddr>,
    /// Nodes known to be alive because they answered.
    responded: HashSet<SocketAddr>,
    dead: HashSet<SocketAddr>,

    in_flight: HashMap<SocketAddr, InFlight>,
    pending_pings: HashMap<Nonce, (NodeHandle, usize)>,
    failed_node_calls: HashMap<Nonce, (NodeHandle, usize)>,
    /// Find calls sent over the lifetime of the lookup, per destination.
    probes: HashMap<SocketAddr, u32>,
}

impl<M: KeyMetric> IterativeLookup<M> {
    pub fn new(
        id: LookupId,
        metric: M,
        config: IterativeLookupConfig,
        exhaustive: bool,
        app_lookup: bool,
    ) -> Self {
        Self {
            id,
            siblings: NodeVector::new(OverlayKey::ZERO, 1, metric.clone()),
            metric,
            config,
            exhaustive,
            app_lookup,
            phase: Phase::Idle,
            key: OverlayKey::ZERO,
            num_siblings: 1,
            hop_count_max: 0,
            retries: 0,
            listener: None,
            this_node: NodeHandle::UNSPECIFIED,
            start_time: Timestamp::ZERO,
            paths: Vec::new(),
            finished_paths: 0,
            successful_paths: 0,
            accumulated_hops: 0,
            success: false,
            attempt_sent: false,
            votes: HashMap::new(),
            visited: HashSet::new(),
            responded: HashSet::new(),
            dead: HashSet::new(),
            in_flight: HashMap::new(),
            pending_pings: HashMap::new(),
            failed_node_calls: HashMap::new(),
            probes: HashMap::new(),
        }
    }

    pub fn id(&self) -> LookupId {
        self.id
    }

    pub fn config(&self) -> &IterativeLookupConfig {
        &self.config
    }

    /// Destinations with a find call in flight.
    pub fn in_flight(&self) -> Vec<NodeHandle> {
        self.in_flight.values().map(|flight| flight.dest).collect()
    }

    /// How many find calls were sent to `node` during this lookup.
    pub fn probe_count(&self, node: &NodeHandle) -> u32 {
        self.probes.get(&node.addr).copied().unwrap_or(0)
    }

    pub fn is_visited(&self, node: &NodeHandle) -> bool {
        self.visited.contains(&node.addr)
    }

    pub fn is_dead(&self, node: &NodeHandle) -> bool {
        self.dead.contains(&node.addr)
    }

    fn sibling_capacity(&self) -> usize {
        let wanted = self.num_siblings.max(1);
        if self.config.majority_siblings && self.config.parallel_paths > 1 {
            // Keep minority candidates around until the vote is counted.
            wanted.max(self.config.redundant_nodes)
        } else {
            wanted
        }
    }

    fn stat_type(&self) -> StatType {
        if self.app_lookup {
            StatType::AppLookup
        } else {
            StatType::Maintenance
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Seed and launch one attempt. Stop conditions are checked by the caller.
    fn begin_attempt(&mut self, host: &mut dyn LookupHost) {
        self.this_node = host.this_node();
        self.start_time = host.now();
        self.paths.clear();
        self.finished_paths = 0;
        self.successful_paths = 0;
        self.success = false;
        self.attempt_sent = false;
        self.siblings = NodeVector::new(self.key, self.sibling_capacity(), self.metric.clone());
        self.votes.clear();
        self.visited.clear();
        self.responded.clear();
        self.dead.clear();
        self.visited.insert(self.this_node.addr);
        self.responded.insert(self.this_node.addr);

        if self.num_siblings == 0 && self.this_node.key == self.key {
            self.siblings.add(self.this_node);
            self.successful_paths = 1;
            return;
        }

        if !self.exhaustive
            && self.num_siblings > 0
            && host.is_sibling_for(&self.key, self.num_siblings)
        {
            for node in host.closest_nodes(&self.key, self.config.redundant_nodes) {
                self.add_sibling(host, 0, node);
            }
            self.successful_paths = 1;
            trace!(lookup = self.id, "local node is a sibling");
            return;
        }

        let seeds = host.closest_nodes(&self.key, self.config.redundant_nodes);
        let num_paths = self.config.parallel_paths.min(seeds.len());
        for _ in 0..num_paths {
            self.paths.push(Path {
                next_hops: NodeVector::new(
                    self.key,
                    self.config.redundant_nodes,
                    self.metric.clone(),
                ),
                sources: HashMap::new(),
                step: 0,
                hops: 0,
                pending_rpcs: 0,
                finished: false,
                success: false,
            });
        }
        for (i, seed) in seeds.into_iter().enumerate() {
            let responded = self.responded.contains(&seed.addr);
            let path = &mut self.paths[i % num_paths];
            path.sources.insert(seed.key, NodeHandle::UNSPECIFIED);
            path.next_hops.add(Candidate {
                handle: seed,
                already_used: false,
                responded,
            });
        }
        debug!(
            lookup = self.id,
            key = %self.key.short(),
            paths = num_paths,
            num_siblings = self.num_siblings,
            "iterative lookup probing"
        );

        for p in 0..self.paths.len() {
            self.send_rpcs(host, p, self.config.parallel_rpcs);
        }
    }

    fn cancel_outstanding(&mut self, host: &mut dyn LookupHost) {
        for (_, flight) in self.in_flight.drain() {
            host.cancel_rpc_message(flight.nonce);
        }
        for (nonce, _) in self.pending_pings.drain() {
            host.cancel_rpc_message(nonce);
        }
        for (nonce, _) in self.failed_node_calls.drain() {
            host.cancel_rpc_message(nonce);
        }
    }

    fn nothing_outstanding(&self) -> bool {
        self.in_flight.is_empty()
            && self.pending_pings.is_empty()
            && self.failed_node_calls.is_empty()
    }

    fn should_stop(&self) -> bool {
        let paths_done = self.finished_paths == self.paths.len() && self.pending_pings.is_empty();
        let exact_done = self.num_siblings == 0
            && self.successful_paths > 0
            && self.siblings.contains_key(&self.key);
        paths_done || self.nothing_outstanding() || exact_done
    }

    /// Finish or restart the lookup if a stop condition holds.
    ///
    /// Restarts run in this loop rather than recursively. An attempt that put
    /// nothing on the wire is final.
    fn check_stop(&mut self, host: &mut dyn LookupHost) {
        while self.phase == Phase::Probing && self.should_stop() {
            if self.config.majority_siblings && self.paths.len() > 1 {
                let needed = self.paths.len() / 2 + 1;
                let votes = &self.votes;
                self.siblings
                    .retain(|node| votes.get(&node.key).map_or(0, HashSet::len) >= needed);
            }
            self.siblings.truncate(self.num_siblings.max(1));
            self.success = self.successful_paths > 0 && !self.siblings.is_empty();

            if self.success || self.retries == 0 || !self.attempt_sent {
                self.finish(host);
                return;
            }
            self.retries -= 1;
            debug!(
                lookup = self.id,
                retries_left = self.retries,
                "iterative lookup failed, retrying"
            );
            self.cancel_outstanding(host);
            self.begin_attempt(host);
        }
    }

    fn finish(&mut self, host: &mut dyn LookupHost) {
        self.cancel_outstanding(host);
        for path in &self.paths {
            if !path.finished {
                self.accumulated_hops += path.hops;
            }
        }
        self.phase = Phase::Finished;
        debug!(
            lookup = self.id,
            key = %self.key.short(),
            valid = self.success,
            siblings = self.siblings.len(),
            hops = self.accumulated_hops,
            "iterative lookup finished"
        );
        if let Some(mut listener) = self.listener.take() {
            listener.lookup_finished(self);
        }
    }

    fn finish_path(&mut self, p: usize, success: bool) {
        let path = &mut self.paths[p];
        if path.finished {
            return;
        }
        path.finished = true;
        path.success = success;
        self.finished_paths += 1;
        if success {
            self.successful_paths += 1;
        }
        self.accumulated_hops += path.hops;
        trace!(lookup = self.id, path = p, success, hops = path.hops, "path finished");
    }

    fn past_deadline(&self, host: &dyn LookupHost) -> bool {
        host.now().saturating_since(self.start_time) > self.config.lookup_timeout
    }

    // ------------------------------------------------------------------------
    // Probing
    // ------------------------------------------------------------------------

    /// Send up to `num` find calls from path `p`; converge the path if it is
    /// left with nothing in flight.
    fn send_rpcs(&mut self, host: &mut dyn LookupHost, p: usize, num: usize) {
        if self.phase != Phase::Probing || self.paths[p].finished {
            return;
        }
        if self.hop_count_max > 0 && self.paths[p].hops >= self.hop_count_max {
            trace!(lookup = self.id, path = p, "hop ceiling reached");
            self.finish_path(p, false);
            return;
        }

        let parallel_rpcs = self.config.parallel_rpcs;
        let pending = self.paths[p].pending_rpcs;
        let mut num = num;
        if self.config.strict_parallel_rpcs {
            num = num.min(parallel_rpcs.saturating_sub(pending));
        }
        if num == 0 && pending == 0 && !self.config.finish_on_first_unchanged {
            num = parallel_rpcs;
        }

        let mut sent = 0;
        let mut i = 0;
        while sent < num && i < self.paths[p].next_hops.len().min(self.config.redundant_nodes) {
            let Some(candidate) = self.paths[p].next_hops.get(i).copied() else {
                break;
            };
            i += 1;
            let addr = candidate.handle.addr;
            if candidate.already_used
                || candidate.handle.key == self.this_node.key
                || self.dead.contains(&addr)
                || (self.config.visit_only_once && self.visited.contains(&addr))
            {
                continue;
            }
            if let Some(entry) = self.paths[p].next_hops.get_mut(i - 1) {
                entry.already_used = true;
            }
            self.send_find_node(host, p, candidate.handle);
            sent += 1;
        }

        if self.paths[p].pending_rpcs == 0 {
            self.converge_path(host, p);
        }
    }

    fn send_find_node(&mut self, host: &mut dyn LookupHost, p: usize, node: NodeHandle) {
        let step = self.paths[p].step;
        self.paths[p].pending_rpcs += 1;
        self.visited.insert(node.addr);

        if let Some(flight) = self.in_flight.get_mut(&node.addr) {
            flight.waiters.push((p, step));
            return;
        }

        let call = FindNodeCall {
            lookup_key: self.key,
            num_redundant_nodes: self.config.redundant_nodes,
            num_siblings: self.num_siblings,
            stat_type: self.stat_type(),
            exhaustive_iterative: self.exhaustive,
        };
        let request = RpcRequest::to_node(node, RpcCall::FindNode(call), self.id)
            .with_context(CTX_FIND_NODE);
        let nonce = host.send_route_rpc_call(request);
        self.attempt_sent = true;
        *self.probes.entry(node.addr).or_insert(0) += 1;
        trace!(lookup = self.id, path = p, step, dest = %node, nonce, "find node sent");
        self.in_flight.insert(
            node.addr,
            InFlight {
                nonce,
                dest: node,
                waiters: vec![(p, step)],
            },
        );
    }

    /// Nothing left to ask: the closest nodes that answered are the result.
    fn converge_path(&mut self, host: &mut dyn LookupHost, p: usize) {
        if self.paths[p].finished {
            return;
        }
        let wanted = self.num_siblings.max(1);
        let exact = self.num_siblings == 0;
        let key = self.key;
        let answered: Vec<NodeHandle> = self.paths[p]
            .next_hops
            .iter()
            .filter(|c| c.responded && !self.dead.contains(&c.handle.addr))
            .filter(|c| !exact || c.handle.key == key)
            .map(|c| c.handle)
            .take(wanted)
            .collect();
        trace!(lookup = self.id, path = p, answered = answered.len(), "path converged");
        let success = !answered.is_empty();
        for node in answered {
            self.add_sibling(host, p, node);
        }
        self.finish_path(p, success);
    }

    // ------------------------------------------------------------------------
    // Siblings
    // ------------------------------------------------------------------------

    /// Propose `node` as a sibling on behalf of path `p`.
    fn add_sibling(&mut self, host: &mut dyn LookupHost, p: usize, node: NodeHandle) {
        self.votes.entry(node.key).or_default().insert(p);
        let confirmed = self.responded.contains(&node.addr) || node.key == self.this_node.key;
        if !self.config.verify_siblings || confirmed {
            self.siblings.add(node);
            return;
        }
        if self.dead.contains(&node.addr)
            || self.pending_pings.values().any(|(pending, _)| pending.addr == node.addr)
        {
            return;
        }
        let request = RpcRequest::to_node(node, RpcCall::Ping, self.id).with_context(CTX_PING);
        let nonce = host.send_route_rpc_call(request);
        self.attempt_sent = true;
        trace!(lookup = self.id, dest = %node, nonce, "verifying sibling");
        self.pending_pings.insert(nonce, (node, p));
    }

    // ------------------------------------------------------------------------
    // Find node outcomes
    // ------------------------------------------------------------------------

    fn flight_for(&self, nonce: Nonce) -> Option<SocketAddr> {
        self.in_flight
            .iter()
            .find(|(_, flight)| flight.nonce == nonce)
            .map(|(addr, _)| *addr)
    }

    fn on_find_node_response(
        &mut self,
        host: &mut dyn LookupHost,
        nonce: Nonce,
        response: RpcResponse,
    ) {
        let Some(addr) = self.flight_for(nonce) else {
            return;
        };
        let Some(flight) = self.in_flight.remove(&addr) else {
            return;
        };
        let kind = response.kind();
        let RpcResponse::FindNode(response) = response else {
            debug!(lookup = self.id, kind, "malformed find node answer");
            self.on_find_node_failure(host, flight);
            return;
        };

        self.responded.insert(addr);
        for (p, step) in flight.waiters {
            if !self.paths[p].finished {
                self.path_response(host, p, step, flight.dest, &response);
            }
        }
        self.check_stop(host);
    }

    fn path_response(
        &mut self,
        host: &mut dyn LookupHost,
        p: usize,
        step: u32,
        source: NodeHandle,
        response: &FindNodeResponse,
    ) {
        let path = &mut self.paths[p];
        path.pending_rpcs = path.pending_rpcs.saturating_sub(1);
        if let Some(pos) = path.next_hops.position(&source.key) {
            if let Some(entry) = path.next_hops.get_mut(pos) {
                entry.responded = true;
            }
        }
        if self.past_deadline(host) {
            debug!(lookup = self.id, path = p, "lookup timeout exceeded");
            self.finish_path(p, false);
            return;
        }

        let sibling_answer =
            response.is_sibling_response && !self.exhaustive && !response.closest_nodes.is_empty();
        let current = step == self.paths[p].step || self.config.use_all_parallel_responses;
        if !current && !(sibling_answer && self.config.accept_late_siblings) {
            trace!(lookup = self.id, path = p, step, "late answer only confirms liveness");
            let num = usize::from(self.config.new_rpc_on_every_response);
            self.send_rpcs(host, p, num);
            return;
        }

        let path = &mut self.paths[p];
        path.step += 1;
        path.hops += 1;
        if !self.config.merge {
            path.next_hops.retain(|c| c.responded);
        }

        if sibling_answer {
            for node in &response.closest_nodes {
                if !self.dead.contains(&node.addr) {
                    self.add_sibling(host, p, *node);
                }
            }
            self.finish_path(p, true);
            return;
        }

        let mut new_rpcs = 0;
        for node in &response.closest_nodes {
            if self.dead.contains(&node.addr) || node.is_unspecified() {
                continue;
            }
            let responded = self.responded.contains(&node.addr);
            let path = &mut self.paths[p];
            if let Some(pos) = path.next_hops.add(Candidate {
                handle: *node,
                already_used: false,
                responded,
            }) {
                path.sources.entry(node.key).or_insert(source);
                if pos < self.config.parallel_rpcs {
                    new_rpcs += 1;
                }
            }
        }
        if self.config.new_rpc_on_every_response {
            new_rpcs = new_rpcs.max(1);
        }
        self.send_rpcs(host, p, new_rpcs);
    }

    fn on_find_node_timeout(&mut self, host: &mut dyn LookupHost, nonce: Nonce) {
        let Some(addr) = self.flight_for(nonce) else {
            return;
        };
        if let Some(flight) = self.in_flight.remove(&addr) {
            self.on_find_node_failure(host, flight);
        }
    }

    fn on_find_node_failure(&mut self, host: &mut dyn LookupHost, flight: InFlight) {
        self.dead.insert(flight.dest.addr);
        for (p, _) in flight.waiters {
            if !self.paths[p].finished {
                self.path_timeout(host, p, flight.dest);
            }
        }
        self.check_stop(host);
    }

    fn path_timeout(&mut self, host: &mut dyn LookupHost, p: usize, failed: NodeHandle) {
        let path = &mut self.paths[p];
        path.pending_rpcs = path.pending_rpcs.saturating_sub(1);
        path.next_hops.remove_key(&failed.key);
        if self.past_deadline(host) {
            self.finish_path(p, false);
            return;
        }

        if self.config.failed_node_rpcs {
            let source = self.paths[p].sources.get(&failed.key).copied();
            match source {
                Some(source) if !source.is_unspecified() && source.key != self.this_node.key => {
                    let request = RpcRequest::to_node(
                        source,
                        RpcCall::FailedNode(FailedNodeCall { failed }),
                        self.id,
                    )
                    .with_context(CTX_FAILED_NODE);
                    let nonce = host.send_route_rpc_call(request);
                    self.attempt_sent = true;
                    trace!(lookup = self.id, path = p, %failed, %source, "reporting failed node");
                    self.failed_node_calls.insert(nonce, (source, p));
                    self.paths[p].pending_rpcs += 1;
                }
                _ => {
                    if host.handle_failed_node(&failed) {
                        self.reseed(host, p);
                    }
                }
            }
        }
        self.send_new_rpc_after_timeout(host, p);
    }

    fn send_new_rpc_after_timeout(&mut self, host: &mut dyn LookupHost, p: usize) {
        if self.config.new_rpc_on_every_timeout {
            self.send_rpcs(host, p, 1);
        } else if self.paths[p].pending_rpcs == 0 {
            self.send_rpcs(host, p, self.config.parallel_rpcs);
        }
    }

    /// Refill path `p` from the local routing table.
    fn reseed(&mut self, host: &mut dyn LookupHost, p: usize) {
        for node in host.closest_nodes(&self.key, self.config.redundant_nodes) {
            if self.dead.contains(&node.addr) {
                continue;
            }
            let responded = self.responded.contains(&node.addr);
            let path = &mut self.paths[p];
            if path
                .next_hops
                .add(Candidate {
                    handle: node,
                    already_used: false,
                    responded,
                })
                .is_some()
            {
                path.sources.entry(node.key).or_insert(NodeHandle::UNSPECIFIED);
            }
        }
    }

    // ------------------------------------------------------------------------
    // Pings and failed node reports
    // ------------------------------------------------------------------------

    fn on_ping_outcome(&mut self, host: &mut dyn LookupHost, nonce: Nonce, alive: bool) {
        let Some((node, p)) = self.pending_pings.remove(&nonce) else {
            return;
        };
        if alive {
            self.responded.insert(node.addr);
            self.add_sibling(host, p, node);
        } else {
            self.dead.insert(node.addr);
        }
        self.check_stop(host);
    }

    fn on_failed_node_outcome(&mut self, host: &mut dyn LookupHost, nonce: Nonce, try_again: bool) {
        let Some((source, p)) = self.failed_node_calls.remove(&nonce) else {
            return;
        };
        let path = &mut self.paths[p];
        path.pending_rpcs = path.pending_rpcs.saturating_sub(1);
        if path.finished {
            self.check_stop(host);
            return;
        }
        if try_again && !self.dead.contains(&source.addr) {
            // The recommender dropped the dead node and may now know a better one.
            trace!(lookup = self.id, path = p, %source, "asking recommender again");
            self.visited.remove(&source.addr);
            let path = &mut self.paths[p];
            match path.next_hops.position(&source.key) {
                Some(pos) => {
                    if let Some(entry) = path.next_hops.get_mut(pos) {
                        entry.already_used = false;
                    }
                }
                None => {
                    path.next_hops.add(Candidate {
                        handle: source,
                        already_used: false,
                        responded: true,
                    });
                }
            }
        }
        self.send_new_rpc_after_timeout(host, p);
        self.check_stop(host);
    }
}

impl<M: KeyMetric> AbstractLookup for IterativeLookup<M> {
    fn lookup(
        &mut self,
        host: &mut dyn LookupHost,
        key: OverlayKey,
        num_siblings: usize,
        hop_count_max: u32,
        retries: u32,
        listener: Option<Box<dyn LookupListener>>,
    ) -> Result<(), LookupError> {
        if self.phase != Phase::Idle {
            return Err(LookupError::AlreadyStarted);
        }
        if self.exhaustive && num_siblings == 0 {
            return Err(LookupError::ExactKeyNeedsSiblings);
        }
        self.config.validate()?;
        self.key = key;
        self.num_siblings = num_siblings;
        self.hop_count_max = hop_count_max;
        self.retries = retries;
        self.listener = listener;
        self.phase = Phase::Probing;
        self.begin_attempt(host);
        self.check_stop(host);
        Ok(())
    }

    fn result(&self) -> &[NodeHandle] {
        if self.is_valid() {
            self.siblings.as_slice()
        } else {
            &[]
        }
    }

    fn is_valid(&self) -> bool {
        self.phase == Phase::Finished && self.success
    }

    fn abort_lookup(&mut self, host: &mut dyn LookupHost) {
        if self.phase == Phase::Probing {
            debug!(lookup = self.id, key = %self.key.short(), "iterative lookup aborted");
            self.cancel_outstanding(host);
        }
        self.listener = None;
        self.success = false;
        self.phase = Phase::Finished;
    }

    fn accumulated_hops(&self) -> u32 {
        self.accumulated_hops
    }

    fn key(&self) -> Option<OverlayKey> {
        (self.phase != Phase::Idle).then_some(self.key)
    }

    fn is_finished(&self) -> bool {
        self.phase == Phase::Finished
    }
}

impl<M: KeyMetric> RpcListener for IterativeLookup<M> {
    fn handle_rpc_response(&mut self, host: &mut dyn LookupHost, reply: RpcReply) {
        if self.phase != Phase::Probing {
            return;
        }
        match reply.context {
            CTX_FIND_NODE => self.on_find_node_response(host, reply.nonce, reply.response),
            CTX_PING => {
                let alive = matches!(reply.response, RpcResponse::Pong);
                self.on_ping_outcome(host, reply.nonce, alive);
            }
            CTX_FAILED_NODE => {
                let try_again = matches!(
                    reply.response,
                    RpcResponse::FailedNode(ref answer) if answer.try_again
                );
                self.on_failed_node_outcome(host, reply.nonce, try_again);
            }
            _ => {}
        }
    }

    fn handle_rpc_timeout(&mut self, host: &mut dyn LookupHost, timeout: RpcTimeout) {
        if self.phase != Phase::Probing {
            return;
        }
        match timeout.context {
            CTX_FIND_NODE => self.on_find_node_timeout(host, timeout.nonce),
            CTX_PING => self.on_ping_outcome(host, timeout.nonce, false),
            CTX_FAILED_NODE => self.on_failed_node_outcome(host, timeout.nonce, false),
            _ => {}
        }
    }
}
