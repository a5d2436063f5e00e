//! ## numadp-core::block
//! **Fixed-size block allocation over the node pools**
//!
//! Pool capacity is carved once into same-sized blocks per (node, class);
//! allocate and free then move blocks between the free stack and the active
//! set of that pair's registry.
//!
//! ### Key Submodules:
//! - `size_class`: the three block sizes and their alignments
//! - `registry`: per-(node, class) free stack and address-keyed lookup
//! - `allocator`: carve-out, allocate and free across nodes

pub mod allocator;
pub mod registry;
pub mod size_class;

pub use allocator::{CarveCounts, FixedBlockAllocator};
pub use registry::{Block, BlockRegistry, BlockState, RegistryCounts};
pub use size_class::SizeClass;
