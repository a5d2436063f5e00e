//! ## numadp-core::topology
//! **NUMA topology probe and raw node-local memory primitives**
//!
//! Everything the allocator needs from the operating system sits behind
//! [`NumaPlatform`]: node enumeration, per-node capacity and CPU lists, thread
//! affinity, and acquire/pin/unpin/release of node-bound regions.
//!
//! ### Implementations:
//! - `linux`: sysfs + `libc` (`mmap`/`mbind`, `mlock`, `sched_setaffinity`)
//! - `simulated`: deterministic heap-backed nodes with fault injection

use std::fmt;
use std::io;
use std::ptr::NonNull;
use std::sync::Arc;

use serde::Serialize;

use crate::error::AllocError;

pub mod cpulist;
#[cfg(target_os = "linux")]
pub mod linux;
pub mod simulated;

#[cfg(target_os = "linux")]
pub use linux::LinuxPlatform;
pub use simulated::{SimulatedPlatform, SimulatedPlatformBuilder};

/// Identifier of a NUMA node as reported by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct NodeId(u32);

impl NodeId {
    #[inline]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    pub const fn id(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NodeId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Memory capacity of a single node, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NodeCapacity {
    pub total_bytes: u64,
    pub free_bytes: u64,
}

/// Sorted set of CPU indices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct CpuSet(Vec<usize>);

impl CpuSet {
    pub fn new(mut cpus: Vec<usize>) -> Self {
        cpus.sort_unstable();
        cpus.dedup();
        Self(cpus)
    }

    /// Parses the kernel list format, e.g. `0-3,8-11`.
    pub fn parse(list: &str) -> Result<Self, AllocError> {
        cpulist::parse_list(list).map(Self)
    }

    pub fn contains(&self, cpu: usize) -> bool {
        self.0.binary_search(&cpu).is_ok()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }

    pub fn first(&self) -> Option<usize> {
        self.0.first().copied()
    }
}

/// Operating-system surface used by the pool system and the affinity binder.
///
/// Implementations must be shareable across the per-node init threads.
pub trait NumaPlatform: Send + Sync + fmt::Debug {
    /// Fails closed: `false` whenever topology information is missing.
    fn is_numa_available(&self) -> bool;

    /// Online node IDs in ascending order. May be sparse (e.g. `0, 2, 5`).
    fn online_nodes(&self) -> Result<Vec<NodeId>, AllocError>;

    /// Highest online node ID.
    fn max_node_id(&self) -> Option<NodeId> {
        self.online_nodes().ok()?.last().copied()
    }

    fn node_capacity(&self, node: NodeId) -> Result<NodeCapacity, AllocError>;

    fn node_cpus(&self, node: NodeId) -> Result<CpuSet, AllocError>;

    /// Total physical memory of the machine.
    fn total_memory(&self) -> Option<u64>;

    fn page_size(&self) -> usize;

    /// CPU the calling thread is currently running on.
    fn current_cpu(&self) -> Option<usize>;

    /// Restricts the calling thread to `cpus`.
    fn set_affinity(&self, node: NodeId, cpus: &CpuSet) -> Result<(), AllocError>;

    /// Reserves `size` bytes whose physical pages must come from `node`.
    /// `size` is a multiple of [`page_size`](Self::page_size); the returned
    /// base is page aligned.
    fn acquire_on_node(&self, node: NodeId, size: usize) -> Result<NonNull<u8>, AllocError>;

    /// Locks the region into physical memory.
    fn pin(&self, node: NodeId, base: NonNull<u8>, size: usize) -> Result<(), AllocError>;

    fn unpin(&self, base: NonNull<u8>, size: usize) -> io::Result<()>;

    /// Returns the region to the operating system.
    ///
    /// # Safety
    ///
    /// `base` and `size` must come from a single successful
    /// [`acquire_on_node`](Self::acquire_on_node) call, the region must not
    /// have been released already, and nothing may access it afterwards.
    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> io::Result<()>;
}

/// Serializable view of what the probe sees.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopologyReport {
    pub numa_available: bool,
    pub page_size: usize,
    pub total_memory: Option<u64>,
    pub nodes: Vec<NodeReport>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NodeReport {
    pub id: NodeId,
    pub cpus: CpuSet,
    pub capacity: NodeCapacity,
}

/// Probes every online node. An unavailable platform yields an empty node list.
pub fn probe(platform: &dyn NumaPlatform) -> Result<TopologyReport, AllocError> {
    let numa_available = platform.is_numa_available();
    let nodes = if numa_available {
        platform
            .online_nodes()?
            .into_iter()
            .map(|id| {
                Ok(NodeReport {
                    id,
                    cpus: platform.node_cpus(id)?,
                    capacity: platform.node_capacity(id)?,
                })
            })
            .collect::<Result<Vec<_>, AllocError>>()?
    } else {
        Vec::new()
    };

    Ok(TopologyReport {
        numa_available,
        page_size: platform.page_size(),
        total_memory: platform.total_memory(),
        nodes,
    })
}

/// Platform backing this process: sysfs/libc on Linux, an always-unavailable
/// stub elsewhere so that startup fails closed.
pub fn host_platform() -> Arc<dyn NumaPlatform> {
    #[cfg(target_os = "linux")]
    {
        Arc::new(LinuxPlatform::new())
    }

    #[cfg(not(target_os = "linux"))]
    {
        Arc::new(SimulatedPlatform::builder().numa_available(false).build())
    }
}
