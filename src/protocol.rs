//! Lookup protocol message definitions.
//!
//! Calls and responses exchanged between overlay nodes while resolving a key.
//! Every message is serde-serialisable so it can cross the simulated wire as a
//! JSON [`Envelope`] inside a length-prefixed frame (see [`crate::framing`]).

use serde::{Deserialize, Serialize};

use crate::core::{NodeHandle, OverlayKey};

/// Opaque correlation token pairing a call with its response or timeout.
pub type Nonce = u32;

/// Whether a lookup was issued by an application or by overlay maintenance.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum StatType {
    #[default]
    AppLookup,
    Maintenance,
}

/// How a call reaches its destination.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingMode {
    /// The caller probes candidates itself, one hop per RPC.
    #[default]
    Iterative,
    /// Iterative, but responders never claim to be siblings so the lookup
    /// always runs until it converges.
    ExhaustiveIterative,
    /// Forwarded hop by hop; the responsible node replies directly.
    SemiRecursive,
    /// Forwarded hop by hop; the reply travels back the same way.
    FullRecursive,
    /// Forwarded hop by hop; the reply is sent to the source address.
    RecursiveSource,
    /// Sent straight to a transport address without overlay routing.
    Direct,
}

impl RoutingMode {
    pub fn is_iterative(&self) -> bool {
        matches!(self, RoutingMode::Iterative | RoutingMode::ExhaustiveIterative)
    }

    pub fn is_recursive(&self) -> bool {
        matches!(
            self,
            RoutingMode::SemiRecursive | RoutingMode::FullRecursive | RoutingMode::RecursiveSource
        )
    }
}

/// Ask a node for the nodes it knows closest to `lookup_key`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeCall {
    pub lookup_key: OverlayKey,
    /// How many next-hop candidates to return.
    pub num_redundant_nodes: usize,
    /// How many siblings the caller wants; 0 asks for an exact key match.
    pub num_siblings: usize,
    pub stat_type: StatType,
    #[serde(default)]
    pub exhaustive_iterative: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FindNodeResponse {
    /// The responder is responsible for the key and `closest_nodes` are its siblings.
    pub is_sibling_response: bool,
    /// Closest-first.
    pub closest_nodes: Vec<NodeHandle>,
}

/// Tell the node that recommended `failed` that it did not answer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedNodeCall {
    pub failed: NodeHandle,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedNodeResponse {
    /// The recommender dropped the failed node and is worth asking again.
    pub try_again: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcCall {
    FindNode(FindNodeCall),
    Ping,
    FailedNode(FailedNodeCall),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RpcResponse {
    FindNode(FindNodeResponse),
    Pong,
    FailedNode(FailedNodeResponse),
}

impl RpcCall {
    pub fn kind(&self) -> &'static str {
        match self {
            RpcCall::FindNode(_) => "find_node",
            RpcCall::Ping => "ping",
            RpcCall::FailedNode(_) => "failed_node",
        }
    }
}

impl RpcResponse {
    pub fn kind(&self) -> &'static str {
        match self {
            RpcResponse::FindNode(_) => "find_node",
            RpcResponse::Pong => "pong",
            RpcResponse::FailedNode(_) => "failed_node",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Body {
    Call(RpcCall),
    Response(RpcResponse),
}

/// A message on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub nonce: Nonce,
    /// The caller for calls, the responder for responses.
    pub src: NodeHandle,
    /// Set on calls routed by key rather than to a fixed node.
    pub dest_key: Option<OverlayKey>,
    pub routing: RoutingMode,
    /// Overlay hops taken so far. Responses echo the hops their call took.
    pub hop_count: u32,
    /// 0 means unlimited.
    pub hop_count_max: u32,
    pub body: Body,
}
