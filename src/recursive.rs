//! Recursive lookup: one call routed by key, forwarded hop by hop by the overlay.

use tracing::debug;

use crate::config::RecursiveLookupConfig;
use crate::core::{NodeHandle, OverlayKey};
use crate::error::LookupError;
use crate::lookup::{AbstractLookup, LookupHost, LookupId, LookupListener, RpcListener};
use crate::protocol::{FindNodeCall, Nonce, RoutingMode, RpcCall, RpcResponse, StatType};
use crate::rpc::{RpcReply, RpcRequest, RpcTimeout};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    Idle,
    AwaitingResponse { nonce: Nonce },
    Done,
}

/// Delegates resolution to the overlay's key-based routing.
///
/// At most one RPC is ever outstanding. The lookup is valid only if the node
/// the call reaches answers as a sibling of the key.
pub struct RecursiveLookup {
    id: LookupId,
    config: RecursiveLookupConfig,
    routing: RoutingMode,
    app_lookup: bool,
    state: State,
    key: Option<OverlayKey>,
    num_siblings: usize,
    siblings: Vec<NodeHandle>,
    valid: bool,
    hops: u32,
    listener: Option<Box<dyn LookupListener>>,
}

impl RecursiveLookup {
    pub fn new(
        id: LookupId,
        config: RecursiveLookupConfig,
        routing: RoutingMode,
        app_lookup: bool,
    ) -> Self {
        Self {
            id,
            config,
            routing,
            app_lookup,
            state: State::Idle,
            key: None,
            num_siblings: 1,
            siblings: Vec::new(),
            valid: false,
            hops: 0,
            listener: None,
        }
    }

    pub fn id(&self) -> LookupId {
        self.id
    }

    pub fn config(&self) -> &RecursiveLookupConfig {
        &self.config
    }

    /// The nonce of the single outstanding call, if any.
    pub fn outstanding(&self) -> Option<Nonce> {
        match self.state {
            State::AwaitingResponse { nonce } => Some(nonce),
            _ => None,
        }
    }

    fn finish(&mut self, valid: bool) {
        self.valid = valid;
        if !valid {
            self.siblings.clear();
        }
        self.state = State::Done;
        debug!(
            lookup = self.id,
            key = ?self.key,
            valid,
            siblings = self.siblings.len(),
            hops = self.hops,
            "recursive lookup finished"
        );
        if let Some(mut listener) = self.listener.take() {
            listener.lookup_finished(self);
        }
    }
}

impl AbstractLookup for RecursiveLookup {
    fn lookup(
        &mut self,
        host: &mut dyn LookupHost,
        key: OverlayKey,
        num_siblings: usize,
        hop_count_max: u32,
        retries: u32,
        listener: Option<Box<dyn LookupListener>>,
    ) -> Result<(), LookupError> {
        if self.state != State::Idle {
            return Err(LookupError::AlreadyStarted);
        }
        self.key = Some(key);
        self.num_siblings = num_siblings;
        self.listener = listener;

        let call = FindNodeCall {
            lookup_key: key,
            num_redundant_nodes: self.config.redundant_nodes,
            num_siblings,
            stat_type: if self.app_lookup {
                StatType::AppLookup
            } else {
                StatType::Maintenance
            },
            exhaustive_iterative: false,
        };
        let retries = if retries > 0 {
            retries
        } else {
            self.config.num_retries
        };
        let request = RpcRequest::by_key(key, RpcCall::FindNode(call), self.id, self.routing)
            .with_hop_count_max(hop_count_max)
            .with_retries(retries);
        let nonce = host.send_route_rpc_call(request);
        debug!(lookup = self.id, key = %key.short(), nonce, retries, "recursive lookup started");
        self.state = State::AwaitingResponse { nonce };
        Ok(())
    }

    fn result(&self) -> &[NodeHandle] {
        if self.valid {
            &self.siblings
        } else {
            &[]
        }
    }

    fn is_valid(&self) -> bool {
        self.valid
    }

    fn abort_lookup(&mut self, host: &mut dyn LookupHost) {
        if let State::AwaitingResponse { nonce } = self.state {
            host.cancel_rpc_message(nonce);
            debug!(lookup = self.id, nonce, "recursive lookup aborted");
        }
        self.listener = None;
        self.state = State::Done;
    }

    fn accumulated_hops(&self) -> u32 {
        self.hops
    }

    fn key(&self) -> Option<OverlayKey> {
        self.key
    }

    fn is_finished(&self) -> bool {
        self.state == State::Done
    }
}

impl RpcListener for RecursiveLookup {
    fn handle_rpc_response(&mut self, _host: &mut dyn LookupHost, reply: RpcReply) {
        if self.outstanding() != Some(reply.nonce) {
            return;
        }
        self.hops = reply.hops;
        match reply.response {
            RpcResponse::FindNode(response)
                if response.is_sibling_response && !response.closest_nodes.is_empty() =>
            {
                let mut siblings = response.closest_nodes;
                siblings.truncate(self.num_siblings.max(1));
                self.siblings = siblings;
                self.finish(true);
            }
            other => {
                debug!(
                    lookup = self.id,
                    kind = other.kind(),
                    "recursive lookup got no sibling answer"
                );
                self.finish(false);
            }
        }
    }

    fn handle_rpc_timeout(&mut self, _host: &mut dyn LookupHost, timeout: RpcTimeout) {
        if self.outstanding() != Some(timeout.nonce) {
            return;
        }
        self.finish(false);
    }
}
