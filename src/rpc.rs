//! RPC correlation: pairs calls with their responses and timeouts.
//!
//! [`RpcCorrelator`] owns the only shared table of the lookup engine, the map
//! from nonce to [`RpcState`]. It never touches the network or the clock
//! itself. `send_call` and `on_timeout` queue [`RpcAction`]s (transmit this
//! call, arm this timer) that the owning overlay drains and executes, and
//! `on_response` / `on_timeout` hand back an [`RpcEvent`] for the listener.
//!
//! A nonce is live from `send_call` until exactly one of a response, an
//! exhausted timeout or a cancel retires it. Anything delivered for a nonce
//! that is not live is dropped, which is what makes duplicate responses, late
//! timers and post-abort traffic harmless.

use std::collections::HashMap;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, trace, warn};

use crate::config::RpcConfig;
use crate::core::{NodeHandle, OverlayKey, Timestamp};
use crate::lookup::LookupId;
use crate::protocol::{Nonce, RoutingMode, RpcCall, RpcResponse};

/// Where a call is headed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum RpcTarget {
    /// A specific peer, reached directly.
    Node(NodeHandle),
    /// Whichever node the overlay routes the key to.
    Key(OverlayKey),
}

impl RpcTarget {
    pub fn node(&self) -> Option<&NodeHandle> {
        match self {
            RpcTarget::Node(node) => Some(node),
            RpcTarget::Key(_) => None,
        }
    }

    pub fn key(&self) -> &OverlayKey {
        match self {
            RpcTarget::Node(node) => &node.key,
            RpcTarget::Key(key) => key,
        }
    }
}

/// Parameters of one `send_call`.
#[derive(Clone, Debug)]
pub struct RpcRequest {
    pub target: RpcTarget,
    pub call: RpcCall,
    pub listener: LookupId,
    /// Opaque value handed back with the response or timeout.
    pub context: u64,
    pub routing: RoutingMode,
    pub hop_count_max: u32,
    pub retries: u32,
    /// `None` picks the configured timeout for the target kind.
    pub timeout: Option<Duration>,
}

impl RpcRequest {
    pub fn to_node(node: NodeHandle, call: RpcCall, listener: LookupId) -> Self {
        Self {
            target: RpcTarget::Node(node),
            call,
            listener,
            context: 0,
            routing: RoutingMode::Direct,
            hop_count_max: 0,
            retries: 0,
            timeout: None,
        }
    }

    pub fn by_key(
        key: OverlayKey,
        call: RpcCall,
        listener: LookupId,
        routing: RoutingMode,
    ) -> Self {
        Self {
            target: RpcTarget::Key(key),
            call,
            listener,
            context: 0,
            routing,
            hop_count_max: 0,
            retries: 0,
            timeout: None,
        }
    }

    pub fn with_context(mut self, context: u64) -> Self {
        self.context = context;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_hop_count_max(mut self, hop_count_max: u32) -> Self {
        self.hop_count_max = hop_count_max;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Book-keeping for one outstanding call.
#[derive(Clone, Debug)]
pub struct RpcState {
    pub nonce: Nonce,
    pub target: RpcTarget,
    pub call: RpcCall,
    pub listener: LookupId,
    pub context: u64,
    pub routing: RoutingMode,
    pub hop_count_max: u32,
    pub retries: u32,
    pub time_sent: Timestamp,
    pub rto: Duration,
    /// Deadline of the armed timer, if any.
    pub deadline: Option<Timestamp>,
}

/// Work for the transport and the event loop.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RpcAction {
    Transmit {
        nonce: Nonce,
        target: RpcTarget,
        call: RpcCall,
        routing: RoutingMode,
        hop_count_max: u32,
    },
    ArmTimer {
        nonce: Nonce,
        deadline: Timestamp,
    },
}

/// A call answered by its destination.
#[derive(Clone, Debug)]
pub struct RpcReply {
    pub listener: LookupId,
    pub context: u64,
    pub nonce: Nonce,
    pub response: RpcResponse,
    pub rtt: Duration,
    pub from: NodeHandle,
    /// Overlay hops the call took to reach `from`.
    pub hops: u32,
}

/// A call whose retries are exhausted.
#[derive(Clone, Debug)]
pub struct RpcTimeout {
    pub listener: LookupId,
    pub context: u64,
    pub nonce: Nonce,
    pub call: RpcCall,
    pub target: RpcTarget,
}

/// Terminal outcome of a call, addressed to its listener.
#[derive(Clone, Debug)]
pub enum RpcEvent {
    Response(RpcReply),
    Timeout(RpcTimeout),
}

impl RpcEvent {
    pub fn listener(&self) -> LookupId {
        match self {
            RpcEvent::Response(reply) => reply.listener,
            RpcEvent::Timeout(timeout) => timeout.listener,
        }
    }
}

pub struct RpcCorrelator {
    config: RpcConfig,
    states: HashMap<Nonce, RpcState>,
    rng: StdRng,
    actions: Vec<RpcAction>,
}

impl RpcCorrelator {
    pub fn new(config: RpcConfig, seed: u64) -> Self {
        Self {
            config,
            states: HashMap::new(),
            rng: StdRng::seed_from_u64(seed),
            actions: Vec::new(),
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Register a call, queue its transmission and arm its timer.
    pub fn send_call(&mut self, request: RpcRequest, now: Timestamp) -> Nonce {
        let nonce = self.fresh_nonce();
        let rto = request.timeout.unwrap_or(match request.target {
            RpcTarget::Node(_) => self.config.udp_timeout,
            RpcTarget::Key(_) => self.config.key_timeout,
        });

        let mut state = RpcState {
            nonce,
            target: request.target,
            call: request.call,
            listener: request.listener,
            context: request.context,
            routing: request.routing,
            hop_count_max: request.hop_count_max,
            retries: request.retries,
            time_sent: now,
            rto,
            deadline: None,
        };
        trace!(
            nonce,
            kind = state.call.kind(),
            dest = ?state.target,
            retries = state.retries,
            "sending rpc"
        );
        self.transmit(&mut state, now);
        self.states.insert(nonce, state);
        nonce
    }

    /// Match a response to its call.
    ///
    /// Returns `None` when the nonce is not live, or when a call sent to a
    /// specific node is answered by a different one. In the latter case the
    /// call stays outstanding and will time out normally.
    pub fn on_response(
        &mut self,
        nonce: Nonce,
        from: NodeHandle,
        response: RpcResponse,
        hops: u32,
        now: Timestamp,
    ) -> Option<RpcEvent> {
        let Some(state) = self.states.get(&nonce) else {
            debug!(nonce, from = %from, "dropping response for unknown nonce");
            return None;
        };
        if let RpcTarget::Node(expected) = &state.target {
            if expected.key != from.key {
                warn!(nonce, expected = %expected, from = %from, "response from unexpected node");
                return None;
            }
        }

        let state = self.states.remove(&nonce)?;
        let rtt = now.saturating_since(state.time_sent);
        trace!(nonce, kind = response.kind(), ?rtt, "rpc answered");
        Some(RpcEvent::Response(RpcReply {
            listener: state.listener,
            context: state.context,
            nonce,
            response,
            rtt,
            from,
            hops,
        }))
    }

    /// Handle the timer armed for `deadline`.
    ///
    /// Retransmits while retries remain; the listener only hears about the
    /// call once the budget is spent. Timers that no longer match the live
    /// deadline are ignored.
    pub fn on_timeout(
        &mut self,
        nonce: Nonce,
        deadline: Timestamp,
        now: Timestamp,
    ) -> Option<RpcEvent> {
        let state = self.states.get_mut(&nonce)?;
        if state.deadline != Some(deadline) {
            trace!(nonce, "ignoring stale rpc timer");
            return None;
        }

        if state.retries > 0 {
            state.retries -= 1;
            if self.config.exponential_backoff {
                state.rto = state.rto.saturating_mul(2);
            }
            trace!(nonce, retries_left = state.retries, rto = ?state.rto, "retransmitting rpc");
            let mut state = state.clone();
            self.transmit(&mut state, now);
            self.states.insert(nonce, state);
            return None;
        }

        let state = self.states.remove(&nonce)?;
        debug!(nonce, kind = state.call.kind(), dest = ?state.target, "rpc timed out");
        Some(RpcEvent::Timeout(RpcTimeout {
            listener: state.listener,
            context: state.context,
            nonce,
            call: state.call,
            target: state.target,
        }))
    }

    /// Retire a call without telling anyone. Returns false if it was not live.
    pub fn cancel(&mut self, nonce: Nonce) -> bool {
        self.states.remove(&nonce).is_some()
    }

    /// Retire every call of `listener`, returning their nonces.
    pub fn cancel_listener(&mut self, listener: LookupId) -> Vec<Nonce> {
        let nonces: Vec<Nonce> = self
            .states
            .values()
            .filter(|state| state.listener == listener)
            .map(|state| state.nonce)
            .collect();
        for nonce in &nonces {
            self.states.remove(nonce);
        }
        nonces
    }

    pub fn contains(&self, nonce: Nonce) -> bool {
        self.states.contains_key(&nonce)
    }

    pub fn state(&self, nonce: Nonce) -> Option<&RpcState> {
        self.states.get(&nonce)
    }

    pub fn pending(&self) -> usize {
        self.states.len()
    }

    pub fn take_actions(&mut self) -> Vec<RpcAction> {
        std::mem::take(&mut self.actions)
    }

    fn transmit(&mut self, state: &mut RpcState, now: Timestamp) {
        state.time_sent = now;
        self.actions.push(RpcAction::Transmit {
            nonce: state.nonce,
            target: state.target,
            call: state.call.clone(),
            routing: state.routing,
            hop_count_max: state.hop_count_max,
        });
        if state.rto.is_zero() {
            state.deadline = None;
        } else {
            let deadline = now + state.rto;
            state.deadline = Some(deadline);
            self.actions.push(RpcAction::ArmTimer {
                nonce: state.nonce,
                deadline,
            });
        }
    }

    fn fresh_nonce(&mut self) -> Nonce {
        loop {
            let candidate: Nonce = self.rng.gen();
            if candidate != 0 && !self.states.contains_key(&candidate) {
                return candidate;
            }
        }
    }
}
