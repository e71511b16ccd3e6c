//! Lookup and RPC parameters.
//!
//! All records deserialize from JSON with every field optional; missing
//! fields take the defaults below. Durations are written as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::protocol::RoutingMode;

/// Serde adapter for `Duration` as integer milliseconds.
pub(crate) mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

/// Timeouts of the correlation layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RpcConfig {
    /// Retransmit timeout for calls sent to a known node. Zero disables the timer.
    #[serde(with = "duration_ms")]
    pub udp_timeout: Duration,
    /// Retransmit timeout for calls routed by key over several hops.
    #[serde(with = "duration_ms")]
    pub key_timeout: Duration,
    /// Double the retransmit timeout on every retry.
    pub exponential_backoff: bool,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            udp_timeout: Duration::from_millis(1500),
            key_timeout: Duration::from_secs(10),
            exponential_backoff: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecursiveLookupConfig {
    pub redundant_nodes: usize,
    /// Retries used when `lookup()` is called with a zero retry budget.
    pub num_retries: u32,
    pub failed_node_rpcs: bool,
}

impl Default for RecursiveLookupConfig {
    fn default() -> Self {
        Self {
            redundant_nodes: 16,
            num_retries: 0,
            failed_node_rpcs: false,
        }
    }
}

impl RecursiveLookupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redundant_nodes == 0 {
            return Err(ConfigError::Zero {
                field: "redundant_nodes",
            });
        }
        Ok(())
    }
}

/// Parameters of the iterative strategy.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterativeLookupConfig {
    /// Candidates kept per path and requested from every responder.
    pub redundant_nodes: usize,
    /// Independent paths the seeds are split across.
    pub parallel_paths: usize,
    /// RPCs a path keeps in flight.
    pub parallel_rpcs: usize,
    /// Never exceed `parallel_rpcs` in flight, even when replacing timeouts.
    pub strict_parallel_rpcs: bool,
    /// Process every response of a round instead of only the first.
    pub use_all_parallel_responses: bool,
    pub new_rpc_on_every_timeout: bool,
    pub new_rpc_on_every_response: bool,
    /// Stop a path as soon as a round yields no new candidates.
    pub finish_on_first_unchanged: bool,
    /// Ping sibling candidates that have not answered before admitting them.
    pub verify_siblings: bool,
    /// Only keep siblings reported by a strict majority of paths.
    pub majority_siblings: bool,
    /// Merge responses into the candidate list instead of replacing it.
    pub merge: bool,
    /// Report unresponsive nodes to whoever recommended them.
    pub failed_node_rpcs: bool,
    pub visit_only_once: bool,
    /// Honour sibling responses that arrive after their round has moved on.
    pub accept_late_siblings: bool,
    /// Budget of a single path, measured from the start of the lookup.
    #[serde(with = "duration_ms")]
    pub lookup_timeout: Duration,
}

impl Default for IterativeLookupConfig {
    fn default() -> Self {
        Self {
            redundant_nodes: 16,
            parallel_paths: 1,
            parallel_rpcs: 1,
            strict_parallel_rpcs: false,
            use_all_parallel_responses: false,
            new_rpc_on_every_timeout: false,
            new_rpc_on_every_response: false,
            finish_on_first_unchanged: false,
            verify_siblings: false,
            majority_siblings: false,
            merge: true,
            failed_node_rpcs: false,
            visit_only_once: true,
            accept_late_siblings: true,
            lookup_timeout: Duration::from_secs(10),
        }
    }
}

impl IterativeLookupConfig {
    /// Kademlia-like settings: `alpha` RPCs in flight, a fresh RPC for every answer.
    pub fn kademlia(alpha: usize, k: usize) -> Self {
        Self {
            redundant_nodes: k,
            parallel_rpcs: alpha,
            use_all_parallel_responses: true,
            new_rpc_on_every_response: true,
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (field, value) in [
            ("redundant_nodes", self.redundant_nodes),
            ("parallel_paths", self.parallel_paths),
            ("parallel_rpcs", self.parallel_rpcs),
        ] {
            if value == 0 {
                return Err(ConfigError::Zero { field });
            }
        }
        if self.parallel_rpcs > self.redundant_nodes {
            return Err(ConfigError::TooManyParallelRpcs {
                parallel_rpcs: self.parallel_rpcs,
                redundant_nodes: self.redundant_nodes,
            });
        }
        if !self.merge {
            if self.parallel_paths > 1 {
                return Err(ConfigError::NeedsMerge {
                    flag: "parallel_paths > 1",
                });
            }
            for (flag, set) in [
                ("verify_siblings", self.verify_siblings),
                ("majority_siblings", self.majority_siblings),
                ("use_all_parallel_responses", self.use_all_parallel_responses),
            ] {
                if set {
                    return Err(ConfigError::NeedsMerge { flag });
                }
            }
        }
        Ok(())
    }
}

/// Strategy selection for the lookup factory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LookupConfig {
    Recursive {
        config: RecursiveLookupConfig,
        routing: RoutingMode,
    },
    Iterative {
        config: IterativeLookupConfig,
        exhaustive: bool,
    },
}

impl LookupConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            LookupConfig::Recursive { config, .. } => config.validate(),
            LookupConfig::Iterative { config, .. } => config.validate(),
        }
    }
}

/// Everything an overlay node needs to run lookups.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverlayConfig {
    pub rpc: RpcConfig,
    pub recursive: RecursiveLookupConfig,
    pub iterative: IterativeLookupConfig,
    /// Routing mode of lookups that do not ask for one.
    pub routing: RoutingMode,
    /// Capacity of the neighbour cache.
    pub routing_table_size: usize,
    /// Hop ceiling of lookups that do not set one; 0 is unlimited.
    pub hop_count_max: u32,
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            rpc: RpcConfig::default(),
            recursive: RecursiveLookupConfig::default(),
            iterative: IterativeLookupConfig::default(),
            routing: RoutingMode::Iterative,
            routing_table_size: 20,
            hop_count_max: 0,
        }
    }
}

impl OverlayConfig {
    /// The factory key for a lookup with the given routing mode.
    pub fn lookup_config(&self, routing: RoutingMode) -> LookupConfig {
        match routing {
            RoutingMode::Iterative | RoutingMode::ExhaustiveIterative => LookupConfig::Iterative {
                config: self.iterative.clone(),
                exhaustive: routing == RoutingMode::ExhaustiveIterative,
            },
            _ => LookupConfig::Recursive {
                config: self.recursive.clone(),
                routing,
            },
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.recursive.validate()?;
        self.iterative.validate()
    }
}
