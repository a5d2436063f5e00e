//! Per-node carve-out counts and worker layout.

use numadp_core::CarveCounts;
use serde::{Deserialize, Serialize};
use validator::Validate;

/// Blocks carved on every node at startup.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct BlocksConfig {
    #[serde(default = "default_small")]
    #[validate(range(max = 16777216))]
    pub small: usize,

    #[serde(default = "default_medium")]
    #[validate(range(max = 8388608))]
    pub medium: usize,

    /// 1 GiB blocks; off unless asked for.
    #[serde(default)]
    #[validate(range(max = 1024))]
    pub large: usize,
}

fn default_small() -> usize {
    1024
}

fn default_medium() -> usize {
    512
}

impl Default for BlocksConfig {
    fn default() -> Self {
        Self {
            small: default_small(),
            medium: default_medium(),
            large: 0,
        }
    }
}

impl BlocksConfig {
    pub fn carve_counts(&self) -> CarveCounts {
        CarveCounts {
            small: self.small,
            medium: self.medium,
            large: self.large,
        }
    }
}

/// Bound worker threads spawned per node by the exerciser.
#[derive(Debug, Serialize, Deserialize, Validate, Clone)]
pub struct WorkersConfig {
    #[serde(default = "default_per_node")]
    #[validate(range(min = 1, max = 1024))]
    pub per_node: usize,
}

fn default_per_node() -> usize {
    num_cpus::get().clamp(1, 4)
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            per_node: default_per_node(),
        }
    }
}
