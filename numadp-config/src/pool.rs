//! Node pool sizing and startup behaviour.

use numadp_core::{PoolSizing, PoolSystemConfig};
use serde::{Deserialize, Serialize};
use validator::Validate;

use crate::validation;

/// Pool system configuration.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
#[validate(schema(function = validation::validate_pool_sizing))]
pub struct PoolConfig {
    /// Share of total physical memory reserved across all nodes.
    #[serde(default = "default_fraction")]
    #[validate(range(exclusive_min = 0.0, max = 0.95))]
    pub fraction: f64,

    /// Explicit bytes per node; overrides `fraction` when set.
    #[serde(default)]
    pub per_node_bytes: Option<usize>,

    #[serde(default = "default_true")]
    pub prefault: bool,

    #[serde(default)]
    pub strict_affinity: bool,

    #[serde(default)]
    pub trace_allocations: bool,
}

fn default_fraction() -> f64 {
    0.25
}

fn default_true() -> bool {
    true
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            fraction: default_fraction(),
            per_node_bytes: None,
            prefault: default_true(),
            strict_affinity: false,
            trace_allocations: false,
        }
    }
}

impl PoolConfig {
    pub fn sizing(&self) -> PoolSizing {
        match self.per_node_bytes {
            Some(bytes) => PoolSizing::PerNode(bytes),
            None => PoolSizing::Fraction(self.fraction),
        }
    }

    pub fn to_pool_system_config(&self) -> PoolSystemConfig {
        PoolSystemConfig {
            sizing: self.sizing(),
            prefault: self.prefault,
            strict_affinity: self.strict_affinity,
            trace_allocations: self.trace_allocations,
        }
    }
}
