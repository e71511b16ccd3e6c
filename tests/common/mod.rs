#![allow(dead_code)]

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use overlay_kbr::config::RpcConfig;
use overlay_kbr::core::{KeyMetric, NodeHandle, NodeVector, OverlayKey, Timestamp, XorMetric};
use overlay_kbr::lookup::{AbstractLookup, LookupHost, LookupListener, LookupOutcome, RpcListener};
use overlay_kbr::protocol::{FindNodeResponse, Nonce, RpcCall, RpcResponse};
use overlay_kbr::rpc::{RpcAction, RpcCorrelator, RpcRequest, RpcTarget};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Key whose first byte is `byte` and every other byte zero.
///
/// Against the zero key under XOR, the first byte is the distance.
pub fn make_node_id(byte: u8) -> OverlayKey {
    let mut id = [0u8; 32];
    id[0] = byte;
    OverlayKey::from_bytes(id)
}

pub fn make_handle(byte: u8) -> NodeHandle {
    NodeHandle::new(make_node_id(byte), SocketAddr::from(([10, 0, 0, byte], 1024)))
}

/// A call the host put on the wire.
#[derive(Clone, Debug)]
pub struct Sent {
    pub nonce: Nonce,
    pub target: RpcTarget,
    pub call: RpcCall,
}

impl Sent {
    pub fn dest(&self) -> Option<NodeHandle> {
        self.target.node().copied()
    }
}

/// A hand-driven [`LookupHost`]: a fixed neighbour set, a real correlator, and
/// a log of everything sent, cancelled and dropped.
pub struct ScriptedHost {
    pub node: NodeHandle,
    pub metric: XorMetric,
    pub known: Vec<NodeHandle>,
    /// Answer to `is_sibling_for`, when forced.
    pub local_sibling: Option<bool>,
    pub rpc: RpcCorrelator,
    pub sent: Vec<Sent>,
    pub timers: Vec<(Nonce, Timestamp)>,
    pub cancelled: Vec<Nonce>,
    pub failed: Vec<NodeHandle>,
    /// Answer to `handle_failed_node`.
    pub forget_failed: bool,
    pub now: Timestamp,
}

impl ScriptedHost {
    pub fn new(node: NodeHandle, known: Vec<NodeHandle>) -> Self {
        Self {
            node,
            metric: XorMetric,
            known,
            local_sibling: Some(false),
            rpc: RpcCorrelator::new(RpcConfig::default(), 11),
            sent: Vec::new(),
            timers: Vec::new(),
            cancelled: Vec::new(),
            failed: Vec::new(),
            forget_failed: false,
            now: Timestamp::ZERO,
        }
    }

    fn flush(&mut self) {
        for action in self.rpc.take_actions() {
            match action {
                RpcAction::Transmit { nonce, target, call, .. } => {
                    self.sent.push(Sent { nonce, target, call })
                }
                RpcAction::ArmTimer { nonce, deadline } => self.timers.push((nonce, deadline)),
            }
        }
    }

    /// Find calls sent to `node`, retransmissions included.
    pub fn find_calls_to(&self, node: &NodeHandle) -> usize {
        self.sent
            .iter()
            .filter(|sent| sent.dest() == Some(*node) && matches!(sent.call, RpcCall::FindNode(_)))
            .count()
    }

    /// The live call sent to `node`.
    pub fn nonce_for(&self, node: &NodeHandle) -> Nonce {
        self.sent
            .iter()
            .rev()
            .find(|sent| sent.dest() == Some(*node) && self.rpc.contains(sent.nonce))
            .map(|sent| sent.nonce)
            .unwrap_or_else(|| panic!("no live call to {node}"))
    }

    pub fn live_calls(&self) -> Vec<Sent> {
        self.sent
            .iter()
            .filter(|sent| self.rpc.contains(sent.nonce))
            .cloned()
            .collect()
    }
}

impl LookupHost for ScriptedHost {
    fn this_node(&self) -> NodeHandle {
        self.node
    }

    fn closest_nodes(&self, key: &OverlayKey, count: usize) -> Vec<NodeHandle> {
        let mut nodes = NodeVector::new(*key, count, self.metric);
        for node in &self.known {
            nodes.add(*node);
        }
        nodes.into_vec()
    }

    fn is_sibling_for(&self, key: &OverlayKey, num_siblings: usize) -> bool {
        match self.local_sibling {
            Some(answer) => answer,
            None if num_siblings == 0 => *key == self.node.key,
            None => !self
                .known
                .iter()
                .any(|node| self.metric.closer_to(key, &node.key, &self.node.key)),
        }
    }

    fn send_route_rpc_call(&mut self, request: RpcRequest) -> Nonce {
        let nonce = self.rpc.send_call(request, self.now);
        self.flush();
        nonce
    }

    fn cancel_rpc_message(&mut self, nonce: Nonce) {
        if self.rpc.cancel(nonce) {
            self.cancelled.push(nonce);
        }
    }

    fn handle_failed_node(&mut self, node: &NodeHandle) -> bool {
        self.failed.push(*node);
        self.known.retain(|known| known.key != node.key);
        self.forget_failed
    }

    fn now(&self) -> Timestamp {
        self.now
    }
}

/// Deliver `response` for `nonce` as if `from` sent it.
pub fn deliver<L: RpcListener>(
    host: &mut ScriptedHost,
    lookup: &mut L,
    nonce: Nonce,
    from: NodeHandle,
    response: RpcResponse,
) {
    deliver_with_hops(host, lookup, nonce, from, response, 0)
}

pub fn deliver_with_hops<L: RpcListener>(
    host: &mut ScriptedHost,
    lookup: &mut L,
    nonce: Nonce,
    from: NodeHandle,
    response: RpcResponse,
    hops: u32,
) {
    let now = host.now;
    if let Some(event) = host.rpc.on_response(nonce, from, response, hops, now) {
        lookup.handle_rpc_event(host, event);
    }
    host.flush();
}

pub fn find_node_response(sibling: bool, nodes: &[NodeHandle]) -> RpcResponse {
    RpcResponse::FindNode(FindNodeResponse {
        is_sibling_response: sibling,
        closest_nodes: nodes.to_vec(),
    })
}

/// Answer the live call to `from` with `nodes`.
pub fn answer<L: RpcListener>(
    host: &mut ScriptedHost,
    lookup: &mut L,
    from: NodeHandle,
    nodes: &[NodeHandle],
) {
    let nonce = host.nonce_for(&from);
    deliver(host, lookup, nonce, from, find_node_response(false, nodes));
}

/// Fire the most recent timer armed for `nonce`, advancing the clock to it.
/// Returns false if no timer is armed.
pub fn expire<L: RpcListener>(host: &mut ScriptedHost, lookup: &mut L, nonce: Nonce) -> bool {
    let Some(deadline) = host
        .timers
        .iter()
        .rev()
        .find(|(armed, _)| *armed == nonce)
        .map(|(_, deadline)| *deadline)
    else {
        return false;
    };
    host.now = host.now.max(deadline);
    let now = host.now;
    if let Some(event) = host.rpc.on_timeout(nonce, deadline, now) {
        lookup.handle_rpc_event(host, event);
    }
    host.flush();
    true
}

/// Collects every completion notification.
#[derive(Clone, Default)]
pub struct RecordingListener {
    pub outcomes: Rc<RefCell<Vec<LookupOutcome>>>,
}

impl RecordingListener {
    pub fn boxed(&self) -> Box<dyn LookupListener> {
        Box::new(self.clone())
    }

    pub fn calls(&self) -> usize {
        self.outcomes.borrow().len()
    }

    pub fn last(&self) -> Option<LookupOutcome> {
        self.outcomes.borrow().last().cloned()
    }
}

impl LookupListener for RecordingListener {
    fn lookup_finished(&mut self, lookup: &dyn AbstractLookup) {
        self.outcomes.borrow_mut().push(LookupOutcome::of(lookup));
    }
}

/// Handles sorted closest-first to `key`.
pub fn sorted<M: KeyMetric>(metric: &M, key: &OverlayKey, nodes: &[NodeHandle]) -> Vec<NodeHandle> {
    let mut nodes = nodes.to_vec();
    nodes.sort_by(|a, b| metric.compare(key, &a.key, &b.key));
    nodes
}
