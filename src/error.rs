use thiserror::Error;

use crate::lookup::LookupId;

/// Invalid lookup configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },
    #[error("{flag} requires merge to be enabled")]
    NeedsMerge { flag: &'static str },
    #[error("parallel_rpcs ({parallel_rpcs}) exceeds redundant_nodes ({redundant_nodes})")]
    TooManyParallelRpcs {
        parallel_rpcs: usize,
        redundant_nodes: usize,
    },
}

/// Misuse of the lookup API. RPC failures are never reported this way; they
/// reach the listener as an invalid result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LookupError {
    #[error("lookup was already started; lookups are single-use")]
    AlreadyStarted,
    #[error("invalid lookup configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
    #[error("no active lookup with id {0}")]
    UnknownLookup(LookupId),
    #[error("no node at {0}")]
    UnknownNode(std::net::SocketAddr),
    #[error("exhaustive iterative routing needs num_siblings > 0")]
    ExactKeyNeedsSiblings,
}
