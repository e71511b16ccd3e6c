//! An overlay node: owner of the correlation layer, the neighbour cache and
//! every active lookup.
//!
//! The node is driven from outside, one event at a time:
//!
//! - [`Overlay::handle_envelope`] for a message received from the wire,
//! - [`Overlay::handle_timer`] for an RPC timer that came due,
//! - [`Overlay::lookup`] and friends for local callers.
//!
//! Everything the node wants done in return (messages to send, timers to arm)
//! is queued and collected with [`Overlay::take_outgoing`].

use std::collections::HashMap;
use std::net::SocketAddr;

use tracing::{debug, trace, warn};

use crate::config::OverlayConfig;
use crate::core::{KeyMetric, NodeHandle, NodeVector, OverlayKey, RoutingTable, Timestamp};
use crate::error::LookupError;
use crate::lookup::{AbstractLookup, Lookup, LookupHost, LookupId, LookupListener, RpcListener};
use crate::protocol::{Body, Envelope, Nonce, RoutingMode};
use crate::rpc::{RpcAction, RpcCorrelator, RpcEvent, RpcRequest, RpcTarget};
use crate::server;

/// Work produced by a node for its transport and event loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Outgoing {
    Message { to: SocketAddr, envelope: Envelope },
    Timer { nonce: Nonce, deadline: Timestamp },
}

pub struct Overlay<M: KeyMetric> {
    this_node: NodeHandle,
    metric: M,
    config: OverlayConfig,
    routing_table: RoutingTable<M>,
    rpc: RpcCorrelator,
    lookups: HashMap<LookupId, Lookup<M>>,
    next_lookup_id: LookupId,
    now: Timestamp,
    outbox: Vec<Outgoing>,
}

impl<M: KeyMetric> Overlay<M> {
    pub fn new(this_node: NodeHandle, metric: M, config: OverlayConfig, seed: u64) -> Self {
        let routing_table =
            RoutingTable::new(this_node.key, metric.clone(), config.routing_table_size);
        let rpc = RpcCorrelator::new(config.rpc.clone(), seed);
        Self {
            this_node,
            metric,
            config,
            routing_table,
            rpc,
            lookups: HashMap::new(),
            next_lookup_id: 1,
            now: Timestamp::ZERO,
            outbox: Vec::new(),
        }
    }

    pub fn node(&self) -> NodeHandle {
        self.this_node
    }

    pub fn config(&self) -> &OverlayConfig {
        &self.config
    }

    pub fn routing_table(&self) -> &RoutingTable<M> {
        &self.routing_table
    }

    pub fn routing_table_mut(&mut self) -> &mut RoutingTable<M> {
        &mut self.routing_table
    }

    pub fn rpc(&self) -> &RpcCorrelator {
        &self.rpc
    }

    /// Advance the node's clock; events never move it backwards.
    pub fn set_time(&mut self, now: Timestamp) {
        self.now = self.now.max(now);
    }

    // ------------------------------------------------------------------------
    // Lookup ownership
    // ------------------------------------------------------------------------

    /// Build a lookup for `routing` and register it. The lookup is idle until started.
    pub fn create_lookup(
        &mut self,
        routing: RoutingMode,
        app_lookup: bool,
    ) -> Result<LookupId, LookupError> {
        let id = self.next_lookup_id;
        let config = self.config.lookup_config(routing);
        let lookup = Lookup::new(id, self.metric.clone(), config, app_lookup)?;
        self.next_lookup_id += 1;
        self.lookups.insert(id, lookup);
        Ok(id)
    }

    /// Start a lookup created with [`create_lookup`](Self::create_lookup).
    pub fn start_lookup(
        &mut self,
        id: LookupId,
        key: OverlayKey,
        num_siblings: usize,
        hop_count_max: u32,
        retries: u32,
        listener: Option<Box<dyn LookupListener>>,
    ) -> Result<(), LookupError> {
        let mut lookup = self.lookups.remove(&id).ok_or(LookupError::UnknownLookup(id))?;
        let started = lookup.lookup(self, key, num_siblings, hop_count_max, retries, listener);
        if !lookup.is_finished() {
            self.lookups.insert(id, lookup);
        }
        self.flush_rpc_actions();
        started
    }

    /// Create and start an application lookup with the configured routing mode.
    pub fn lookup(
        &mut self,
        key: OverlayKey,
        num_siblings: usize,
        listener: Box<dyn LookupListener>,
    ) -> Result<LookupId, LookupError> {
        let routing = self.config.routing;
        self.lookup_with(routing, key, num_siblings, 0, Some(listener))
    }

    pub fn lookup_with(
        &mut self,
        routing: RoutingMode,
        key: OverlayKey,
        num_siblings: usize,
        retries: u32,
        listener: Option<Box<dyn LookupListener>>,
    ) -> Result<LookupId, LookupError> {
        let id = self.create_lookup(routing, true)?;
        let hop_count_max = self.config.hop_count_max;
        let started = self.start_lookup(id, key, num_siblings, hop_count_max, retries, listener);
        if let Err(err) = started {
            self.lookups.remove(&id);
            return Err(err);
        }
        Ok(id)
    }

    /// Cancel a lookup without notifying its listener.
    pub fn abort_lookup(&mut self, id: LookupId) -> Result<(), LookupError> {
        let mut lookup = self.remove_lookup(id).ok_or(LookupError::UnknownLookup(id))?;
        lookup.abort_lookup(self);
        Ok(())
    }

    /// Deregister a lookup and hand it to the caller. Its outstanding calls
    /// stay live until the caller aborts it.
    pub fn remove_lookup(&mut self, id: LookupId) -> Option<Lookup<M>> {
        self.lookups.remove(&id)
    }

    /// Abort every active lookup; used on teardown.
    pub fn finish_lookups(&mut self) {
        let ids: Vec<LookupId> = self.lookups.keys().copied().collect();
        for id in ids {
            if let Some(mut lookup) = self.remove_lookup(id) {
                lookup.abort_lookup(self);
            }
        }
        debug!(node = %self.this_node, "all lookups aborted");
    }

    pub fn active_lookup(&self, id: LookupId) -> Option<&Lookup<M>> {
        self.lookups.get(&id)
    }

    pub fn active_lookups(&self) -> usize {
        self.lookups.len()
    }

    // ------------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------------

    pub fn handle_envelope(&mut self, envelope: Envelope, now: Timestamp) {
        self.set_time(now);
        self.routing_table.update(envelope.src);

        match envelope.body {
            Body::Call(_) if envelope.dest_key.is_some() => self.route_call(envelope),
            Body::Call(_) => self.answer_call(envelope),
            Body::Response(response) => {
                let event = self.rpc.on_response(
                    envelope.nonce,
                    envelope.src,
                    response,
                    envelope.hop_count,
                    self.now,
                );
                if let Some(event) = event {
                    self.dispatch(event);
                }
            }
        }
        self.flush_rpc_actions();
    }

    pub fn handle_timer(&mut self, nonce: Nonce, deadline: Timestamp, now: Timestamp) {
        self.set_time(now);
        if let Some(event) = self.rpc.on_timeout(nonce, deadline, self.now) {
            self.dispatch(event);
        }
        self.flush_rpc_actions();
    }

    pub fn take_outgoing(&mut self) -> Vec<Outgoing> {
        self.flush_rpc_actions();
        std::mem::take(&mut self.outbox)
    }

    /// Hand an RPC outcome to its lookup, dropping the lookup once it finished.
    fn dispatch(&mut self, event: RpcEvent) {
        let id = event.listener();
        let Some(mut lookup) = self.lookups.remove(&id) else {
            warn!(lookup = id, "no lookup for rpc outcome");
            return;
        };
        lookup.handle_rpc_event(self, event);
        if lookup.is_finished() {
            trace!(lookup = id, "dropping finished lookup");
        } else {
            self.lookups.insert(id, lookup);
        }
    }

    fn flush_rpc_actions(&mut self) {
        loop {
            let actions = self.rpc.take_actions();
            if actions.is_empty() {
                return;
            }
            for action in actions {
                match action {
                    RpcAction::Transmit {
                        nonce,
                        target,
                        call,
                        routing,
                        hop_count_max,
                    } => {
                        let envelope = Envelope {
                            nonce,
                            src: self.this_node,
                            dest_key: match target {
                                RpcTarget::Key(key) => Some(key),
                                RpcTarget::Node(_) => None,
                            },
                            routing,
                            hop_count: 0,
                            hop_count_max,
                            body: Body::Call(call),
                        };
                        match target {
                            RpcTarget::Node(node) => self.outbox.push(Outgoing::Message {
                                to: node.addr,
                                envelope,
                            }),
                            RpcTarget::Key(_) => self.route_call(envelope),
                        }
                    }
                    RpcAction::ArmTimer { nonce, deadline } => {
                        self.outbox.push(Outgoing::Timer { nonce, deadline });
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Key-based routing and call handling
    // ------------------------------------------------------------------------

    /// Known node strictly closer to `key` than this one.
    fn next_hop(&self, key: &OverlayKey) -> Option<NodeHandle> {
        self.routing_table
            .closest(key, 1)
            .into_iter()
            .find(|node| self.metric.closer_to(key, &node.key, &self.this_node.key))
    }

    /// Forward a key-routed call greedily, or answer it if no known node is closer.
    fn route_call(&mut self, mut envelope: Envelope) {
        let Some(key) = envelope.dest_key else {
            self.answer_call(envelope);
            return;
        };
        match self.next_hop(&key) {
            Some(next) => {
                if envelope.hop_count_max > 0 && envelope.hop_count >= envelope.hop_count_max {
                    debug!(
                        nonce = envelope.nonce,
                        hops = envelope.hop_count,
                        "hop ceiling reached, dropping call"
                    );
                    return;
                }
                envelope.hop_count += 1;
                trace!(
                    nonce = envelope.nonce,
                    next = %next,
                    hops = envelope.hop_count,
                    "forwarding call"
                );
                self.outbox.push(Outgoing::Message {
                    to: next.addr,
                    envelope,
                });
            }
            None => self.answer_call(envelope),
        }
    }

    fn answer_call(&mut self, envelope: Envelope) {
        let Body::Call(call) = &envelope.body else {
            return;
        };
        let response = server::handle_call(self, &envelope.src, call);
        let reply = Envelope {
            nonce: envelope.nonce,
            src: self.this_node,
            dest_key: None,
            routing: RoutingMode::Direct,
            hop_count: envelope.hop_count,
            hop_count_max: 0,
            body: Body::Response(response),
        };
        self.outbox.push(Outgoing::Message {
            to: envelope.src.addr,
            envelope: reply,
        });
    }
}

impl<M: KeyMetric> LookupHost for Overlay<M> {
    fn this_node(&self) -> NodeHandle {
        self.this_node
    }

    /// This node and its neighbours, closest to `key` first.
    fn closest_nodes(&self, key: &OverlayKey, count: usize) -> Vec<NodeHandle> {
        let mut nodes = NodeVector::new(*key, count, self.metric.clone());
        nodes.add(self.this_node);
        for node in self.routing_table.closest(key, count) {
            nodes.add(node);
        }
        nodes.into_vec()
    }

    fn is_sibling_for(&self, key: &OverlayKey, num_siblings: usize) -> bool {
        if num_siblings == 0 {
            return *key == self.this_node.key;
        }
        let closer = self
            .routing_table
            .nodes()
            .filter(|node| self.metric.closer_to(key, &node.key, &self.this_node.key))
            .take(num_siblings)
            .count();
        closer < num_siblings
    }

    fn send_route_rpc_call(&mut self, request: RpcRequest) -> Nonce {
        self.rpc.send_call(request, self.now)
    }

    fn cancel_rpc_message(&mut self, nonce: Nonce) {
        self.rpc.cancel(nonce);
    }

    fn handle_failed_node(&mut self, node: &NodeHandle) -> bool {
        self.routing_table.remove(&node.key).is_some()
    }

    fn now(&self) -> Timestamp {
        self.now
    }
}
