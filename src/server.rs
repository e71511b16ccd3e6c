//! Answers to incoming calls.
//!
//! Every node serves the three calls a lookup can make. The handlers only
//! read and prune local routing state through [`LookupHost`], so they work
//! for any host implementation.

use tracing::trace;

use crate::core::NodeHandle;
use crate::lookup::LookupHost;
use crate::protocol::{FailedNodeResponse, FindNodeCall, FindNodeResponse, RpcCall, RpcResponse};

/// Build the response to `call`, received from `from`.
pub fn handle_call<H: LookupHost + ?Sized>(
    host: &mut H,
    from: &NodeHandle,
    call: &RpcCall,
) -> RpcResponse {
    match call {
        RpcCall::FindNode(call) => RpcResponse::FindNode(handle_find_node(host, call)),
        RpcCall::Ping => RpcResponse::Pong,
        RpcCall::FailedNode(call) => {
            let try_again = host.handle_failed_node(&call.failed);
            trace!(%from, failed = %call.failed, try_again, "failed node reported");
            RpcResponse::FailedNode(FailedNodeResponse { try_again })
        }
    }
}

/// Closest known nodes to the key, flagged as siblings when this node is
/// responsible for it.
///
/// Exhaustive iterative callers never get the sibling flag, so they keep
/// probing until their own candidate list stops improving.
pub fn handle_find_node<H: LookupHost + ?Sized>(
    host: &mut H,
    call: &FindNodeCall,
) -> FindNodeResponse {
    let is_sibling_response =
        !call.exhaustive_iterative && host.is_sibling_for(&call.lookup_key, call.num_siblings);
    let count = if is_sibling_response {
        call.num_siblings.max(1)
    } else {
        call.num_redundant_nodes
    };
    let closest_nodes = if call.num_siblings == 0 && is_sibling_response {
        vec![host.this_node()]
    } else {
        host.closest_nodes(&call.lookup_key, count)
    };
    FindNodeResponse {
        is_sibling_response,
        closest_nodes,
    }
}
