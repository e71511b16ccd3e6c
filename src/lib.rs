//! # Overlay KBR
//!
//! Key-based routing lookups for structured peer-to-peer overlays. Given a
//! key, a lookup finds the nodes currently responsible for it (its
//! *siblings*), either by handing one call to the overlay's routing
//! (recursive) or by probing candidates itself (iterative).
//!
//! The engine is single-threaded and event driven. An [`Overlay`] node is fed
//! received messages and due timers one at a time and queues the messages and
//! timers it wants in return. This keeps it independent of any transport: the
//! bundled [`Simulator`] drives many nodes over a simulated network, and a
//! socket-based driver would do the same with real frames.
//!
//! The crate is split into modules that can be used on their own:
//!
//! - [`core`]: keys, metrics, node handles, closest-first vectors and the
//!   neighbour cache.
//! - [`protocol`]: the serialisable calls, responses and envelopes.
//! - [`framing`]: length-prefixed frames for envelopes.
//! - [`rpc`]: nonce correlation, timeouts and retransmission of calls.
//! - [`lookup`]: the lookup contracts and the strategy factory.
//! - [`recursive`] and [`iterative`]: the two lookup strategies.
//! - [`overlay`]: a node that owns all of the above.
//! - [`server`]: answers to incoming calls.
//! - [`sim`]: the discrete event simulator.
//!
//! ## Getting started
//!
//! ```
//! use overlay_kbr::{LinkModel, OverlayConfig, OverlayKey, Simulator, XorMetric};
//!
//! let mut sim = Simulator::<XorMetric>::new(OverlayConfig::default(), LinkModel::default(), 42);
//! let nodes = sim.add_random_nodes(32);
//! sim.connect_all();
//!
//! let key = OverlayKey::hash(b"some content");
//! let mut rx = sim.lookup(&nodes[0].addr, key, 3).unwrap();
//! sim.run_until_idle();
//!
//! let outcome = rx.try_recv().unwrap();
//! assert!(outcome.valid);
//! assert_eq!(outcome.siblings, sim.true_siblings(&key, 3));
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod framing;
pub mod iterative;
pub mod lookup;
pub mod overlay;
pub mod protocol;
pub mod recursive;
pub mod rpc;
pub mod server;
pub mod sim;

pub use crate::config::{
    IterativeLookupConfig, LookupConfig, OverlayConfig, RecursiveLookupConfig, RpcConfig,
};
pub use crate::core::{
    derive_node_id, hash_content, KeyMetric, NodeHandle, NodeVector, OverlayKey, RingMetric,
    RoutingTable, Timestamp, XorMetric,
};
pub use crate::error::{ConfigError, LookupError};
pub use crate::iterative::IterativeLookup;
pub use crate::lookup::{
    AbstractLookup, FnListener, Lookup, LookupHost, LookupId, LookupListener, LookupOutcome,
    OneshotListener, RpcListener,
};
pub use crate::overlay::{Outgoing, Overlay};
pub use crate::protocol::{Envelope, Nonce, RoutingMode, RpcCall, RpcResponse};
pub use crate::recursive::RecursiveLookup;
pub use crate::rpc::{RpcCorrelator, RpcEvent, RpcReply, RpcRequest, RpcTimeout};
pub use crate::sim::{LinkModel, SimStats, Simulator};
