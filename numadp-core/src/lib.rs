//! # numadp-core
//!
//! NUMA-aware memory allocation for data processing workers. One pinned,
//! pre-faulted pool per node, brought up in parallel, with a fixed-size block
//! allocator carved out of each pool.
//!
//! ### Expectations (Production):
//! - Node-local memory for threads bound to that node
//! - No page faults on the allocation hot path
//! - No lock shared between nodes
//!
//! ### Key Submodules:
//! - `topology`: node discovery and raw node-bound memory behind `NumaPlatform`
//! - `affinity`: binding threads to a node's CPUs
//! - `pool`: per-node pools and the bump allocator
//! - `block`: size classes, block registries and the fixed block allocator
//!
//! ### Future:
//! - Opt-in borrowing from a neighbouring node on class exhaustion

pub mod affinity;
pub mod block;
pub mod error;
pub mod pool;
pub mod stats;
pub mod topology;

pub mod prelude {
    pub use crate::block::*;
    pub use crate::error::*;
    pub use crate::pool::*;
    pub use crate::stats::*;
    pub use crate::topology::{host_platform, probe, NodeId, NumaPlatform, SimulatedPlatform};
}

pub use block::{CarveCounts, FixedBlockAllocator, SizeClass};
pub use error::AllocError;
pub use pool::{PoolSizing, PoolSystem, PoolSystemConfig};
pub use topology::{host_platform, NodeId, NumaPlatform};
