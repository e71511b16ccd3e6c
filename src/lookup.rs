//! Contracts shared by the lookup strategies.
//!
//! - [`LookupHost`]: what a strategy may ask of the overlay that owns it
//! - [`AbstractLookup`]: the caller-facing operation set
//! - [`RpcListener`]: how the overlay feeds RPC outcomes back into a lookup
//! - [`LookupListener`]: the one-shot completion callback
//! - [`Lookup`]: the tagged union built by [`Lookup::new`] from a [`LookupConfig`]
//!
//! Lookups are plain values owned by their overlay. A strategy never
//! destroys itself: after it has notified its listener it reports
//! [`AbstractLookup::is_finished`] and the owner drops it.

use tokio::sync::oneshot;

use crate::config::LookupConfig;
use crate::core::{KeyMetric, NodeHandle, OverlayKey, Timestamp};
use crate::error::LookupError;
use crate::iterative::IterativeLookup;
use crate::protocol::Nonce;
use crate::recursive::RecursiveLookup;
use crate::rpc::{RpcEvent, RpcReply, RpcRequest, RpcTimeout};

/// Identifies a lookup within its overlay; also the listener id of its RPCs.
pub type LookupId = u64;

/// The overlay as seen from inside a lookup.
pub trait LookupHost {
    fn this_node(&self) -> NodeHandle;

    /// Up to `count` known nodes closest to `key`, closest first.
    fn closest_nodes(&self, key: &OverlayKey, count: usize) -> Vec<NodeHandle>;

    /// Whether this node is among the `num_siblings` nodes responsible for `key`.
    fn is_sibling_for(&self, key: &OverlayKey, num_siblings: usize) -> bool;

    /// Hand a call to the correlation layer.
    fn send_route_rpc_call(&mut self, request: RpcRequest) -> Nonce;

    /// Retire a call silently. Unknown nonces are ignored.
    fn cancel_rpc_message(&mut self, nonce: Nonce);

    /// Drop `node` from local routing state. Returns true if it was known.
    fn handle_failed_node(&mut self, node: &NodeHandle) -> bool;

    fn now(&self) -> Timestamp;
}

/// Called exactly once when a lookup reaches a terminal state.
pub trait LookupListener {
    fn lookup_finished(&mut self, lookup: &dyn AbstractLookup);
}

pub trait AbstractLookup {
    /// Start resolving `key`. A lookup can only be started once.
    fn lookup(
        &mut self,
        host: &mut dyn LookupHost,
        key: OverlayKey,
        num_siblings: usize,
        hop_count_max: u32,
        retries: u32,
        listener: Option<Box<dyn LookupListener>>,
    ) -> Result<(), LookupError>;

    /// Siblings closest-first; empty until the lookup finished valid.
    fn result(&self) -> &[NodeHandle];

    fn is_valid(&self) -> bool;

    /// Cancel every outstanding RPC. The listener is dropped without a call.
    fn abort_lookup(&mut self, host: &mut dyn LookupHost);

    fn accumulated_hops(&self) -> u32;

    /// The key passed to [`lookup`](Self::lookup), if started.
    fn key(&self) -> Option<OverlayKey>;

    /// True once the lookup finished or was aborted; the owner may drop it.
    fn is_finished(&self) -> bool;
}

/// Receives the outcome of the RPCs a lookup sent.
pub trait RpcListener {
    fn handle_rpc_response(&mut self, host: &mut dyn LookupHost, reply: RpcReply);

    fn handle_rpc_timeout(&mut self, host: &mut dyn LookupHost, timeout: RpcTimeout);

    fn handle_rpc_event(&mut self, host: &mut dyn LookupHost, event: RpcEvent) {
        match event {
            RpcEvent::Response(reply) => self.handle_rpc_response(host, reply),
            RpcEvent::Timeout(timeout) => self.handle_rpc_timeout(host, timeout),
        }
    }
}

/// Snapshot of a finished lookup.
#[derive(Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub struct LookupOutcome {
    pub key: Option<OverlayKey>,
    pub valid: bool,
    pub siblings: Vec<NodeHandle>,
    pub hops: u32,
}

impl LookupOutcome {
    pub fn of(lookup: &dyn AbstractLookup) -> Self {
        Self {
            key: lookup.key(),
            valid: lookup.is_valid(),
            siblings: lookup.result().to_vec(),
            hops: lookup.accumulated_hops(),
        }
    }
}

/// Delivers the [`LookupOutcome`] over a oneshot channel.
///
/// A dropped receiver is not an error; the caller simply stopped waiting.
pub struct OneshotListener {
    tx: Option<oneshot::Sender<LookupOutcome>>,
}

impl OneshotListener {
    pub fn channel() -> (Box<dyn LookupListener>, oneshot::Receiver<LookupOutcome>) {
        let (tx, rx) = oneshot::channel();
        (Box::new(Self { tx: Some(tx) }), rx)
    }
}

impl LookupListener for OneshotListener {
    fn lookup_finished(&mut self, lookup: &dyn AbstractLookup) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(LookupOutcome::of(lookup));
        }
    }
}

/// Adapts a closure into a [`LookupListener`].
pub struct FnListener<F>(Option<F>);

impl<F: FnOnce(&dyn AbstractLookup)> FnListener<F> {
    pub fn boxed(f: F) -> Box<dyn LookupListener>
    where
        F: 'static,
    {
        Box::new(Self(Some(f)))
    }
}

impl<F: FnOnce(&dyn AbstractLookup)> LookupListener for FnListener<F> {
    fn lookup_finished(&mut self, lookup: &dyn AbstractLookup) {
        if let Some(f) = self.0.take() {
            f(lookup);
        }
    }
}

/// One lookup of either strategy.
pub enum Lookup<M: KeyMetric> {
    Recursive(RecursiveLookup),
    Iterative(IterativeLookup<M>),
}

impl<M: KeyMetric> Lookup<M> {
    /// Build the strategy selected by `config`.
    pub fn new(
        id: LookupId,
        metric: M,
        config: LookupConfig,
        app_lookup: bool,
    ) -> Result<Self, LookupError> {
        config.validate()?;
        Ok(match config {
            LookupConfig::Recursive { config, routing } => {
                Lookup::Recursive(RecursiveLookup::new(id, config, routing, app_lookup))
            }
            LookupConfig::Iterative { config, exhaustive } => {
                Lookup::Iterative(IterativeLookup::new(id, metric, config, exhaustive, app_lookup))
            }
        })
    }

    pub fn id(&self) -> LookupId {
        match self {
            Lookup::Recursive(lookup) => lookup.id(),
            Lookup::Iterative(lookup) => lookup.id(),
        }
    }

    fn as_dyn(&self) -> &dyn AbstractLookup {
        match self {
            Lookup::Recursive(lookup) => lookup,
            Lookup::Iterative(lookup) => lookup,
        }
    }

    fn as_dyn_mut(&mut self) -> &mut dyn AbstractLookup {
        match self {
            Lookup::Recursive(lookup) => lookup,
            Lookup::Iterative(lookup) => lookup,
        }
    }
}

impl<M: KeyMetric> AbstractLookup for Lookup<M> {
    fn lookup(
        &mut self,
        host: &mut dyn LookupHost,
        key: OverlayKey,
        num_siblings: usize,
        hop_count_max: u32,
        retries: u32,
        listener: Option<Box<dyn LookupListener>>,
    ) -> Result<(), LookupError> {
        self.as_dyn_mut()
            .lookup(host, key, num_siblings, hop_count_max, retries, listener)
    }

    fn result(&self) -> &[NodeHandle] {
        self.as_dyn().result()
    }

    fn is_valid(&self) -> bool {
        self.as_dyn().is_valid()
    }

    fn abort_lookup(&mut self, host: &mut dyn LookupHost) {
        self.as_dyn_mut().abort_lookup(host)
    }

    fn accumulated_hops(&self) -> u32 {
        self.as_dyn().accumulated_hops()
    }

    fn key(&self) -> Option<OverlayKey> {
        self.as_dyn().key()
    }

    fn is_finished(&self) -> bool {
        self.as_dyn().is_finished()
    }
}

impl<M: KeyMetric> RpcListener for Lookup<M> {
    fn handle_rpc_response(&mut self, host: &mut dyn LookupHost, reply: RpcReply) {
        match self {
            Lookup::Recursive(lookup) => lookup.handle_rpc_response(host, reply),
            Lookup::Iterative(lookup) => lookup.handle_rpc_response(host, reply),
        }
    }

    fn handle_rpc_timeout(&mut self, host: &mut dyn LookupHost, timeout: RpcTimeout) {
        match self {
            Lookup::Recursive(lookup) => lookup.handle_rpc_timeout(host, timeout),
            Lookup::Iterative(lookup) => lookup.handle_rpc_timeout(host, timeout),
        }
    }
}
