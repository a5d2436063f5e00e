//! ## numadp-core::pool
//! **Per-node pinned memory pools**
//!
//! One contiguous, node-bound region per online NUMA node, brought up in
//! parallel by threads bound to that node.
//!
//! ### Expectations:
//! - Startup is all-or-nothing
//! - Raw allocation is a bump of a per-node offset; nothing is reclaimed here
//! - Teardown is idempotent and runs on drop
//!
//! ### Key Submodules:
//! - `node`: a single region and its bump cursor
//! - `system`: parallel init, rollback, raw allocation and destroy

pub mod node;
pub mod system;

pub use node::{NodePool, PoolUsage};
pub use system::{PoolSizing, PoolSystem, PoolSystemConfig};
