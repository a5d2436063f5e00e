//! Deterministic, heap-backed NUMA platform.
//!
//! Used to run the allocator on machines without NUMA (CI, laptops) and to
//! inject faults into node initialization. Each simulated node gets a
//! contiguous CPU range and a fixed memory budget; acquired regions come from
//! the global allocator and are tracked so tests can observe what is still
//! live or pinned.

use std::alloc::{self, Layout};
use std::cell::Cell;
use std::collections::{HashMap, HashSet};
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use super::{CpuSet, NodeCapacity, NodeId, NumaPlatform};
use crate::error::AllocError;

const DEFAULT_PAGE_SIZE: usize = 4096;

thread_local! {
    static BOUND_CPU: Cell<Option<usize>> = const { Cell::new(None) };
}

#[derive(Debug, Clone)]
struct SimNode {
    id: NodeId,
    cpus: CpuSet,
    total_bytes: u64,
}

#[derive(Debug, Clone, Copy)]
struct SimRegion {
    node: NodeId,
    size: usize,
    pinned: bool,
}

#[derive(Debug, Default, Clone)]
struct Faults {
    acquire: HashSet<NodeId>,
    pin: HashSet<NodeId>,
    bind: HashSet<NodeId>,
    unpin: HashSet<NodeId>,
    release: HashSet<NodeId>,
    panic_acquire: HashSet<NodeId>,
}

/// Simulated NUMA topology with fault injection.
#[derive(Debug)]
pub struct SimulatedPlatform {
    numa_available: bool,
    nodes: Vec<SimNode>,
    page_size: usize,
    faults: Faults,
    regions: Mutex<HashMap<usize, SimRegion>>,
    binds: AtomicUsize,
}

impl SimulatedPlatform {
    pub fn builder() -> SimulatedPlatformBuilder {
        SimulatedPlatformBuilder::default()
    }

    fn node(&self, node: NodeId) -> Result<&SimNode, AllocError> {
        self.nodes
            .iter()
            .find(|n| n.id == node)
            .ok_or(AllocError::OutOfRange(node))
    }

    fn layout(&self, size: usize) -> io::Result<Layout> {
        Layout::from_size_align(size, self.page_size)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))
    }

    /// Number of regions acquired and not yet released.
    pub fn live_regions(&self) -> usize {
        self.regions.lock().len()
    }

    /// Number of live regions that are still pinned.
    pub fn pinned_regions(&self) -> usize {
        self.regions.lock().values().filter(|r| r.pinned).count()
    }

    /// Bytes currently acquired on `node`.
    pub fn live_bytes(&self, node: NodeId) -> u64 {
        self.regions
            .lock()
            .values()
            .filter(|r| r.node == node)
            .map(|r| r.size as u64)
            .sum()
    }

    /// Successful `set_affinity` calls across all threads.
    pub fn bind_count(&self) -> usize {
        self.binds.load(Ordering::Relaxed)
    }
}

impl NumaPlatform for SimulatedPlatform {
    fn is_numa_available(&self) -> bool {
        self.numa_available && !self.nodes.is_empty()
    }

    fn online_nodes(&self) -> Result<Vec<NodeId>, AllocError> {
        if !self.numa_available {
            return Err(AllocError::NumaUnavailable);
        }
        Ok(self.nodes.iter().map(|n| n.id).collect())
    }

    fn node_capacity(&self, node: NodeId) -> Result<NodeCapacity, AllocError> {
        let total_bytes = self.node(node)?.total_bytes;
        Ok(NodeCapacity {
            total_bytes,
            free_bytes: total_bytes.saturating_sub(self.live_bytes(node)),
        })
    }

    fn node_cpus(&self, node: NodeId) -> Result<CpuSet, AllocError> {
        Ok(self.node(node)?.cpus.clone())
    }

    fn total_memory(&self) -> Option<u64> {
        self.numa_available
            .then(|| self.nodes.iter().map(|n| n.total_bytes).sum())
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn current_cpu(&self) -> Option<usize> {
        BOUND_CPU
            .with(|cpu| cpu.get())
            .or_else(|| self.nodes.iter().find_map(|n| n.cpus.first()))
    }

    fn set_affinity(&self, node: NodeId, cpus: &CpuSet) -> Result<(), AllocError> {
        if self.faults.bind.contains(&node) {
            return Err(AllocError::BindFailed {
                node,
                reason: "simulated sched_setaffinity rejection".into(),
            });
        }
        let cpu = cpus.first().ok_or_else(|| AllocError::BindFailed {
            node,
            reason: "empty cpu set".into(),
        })?;
        BOUND_CPU.with(|bound| bound.set(Some(cpu)));
        self.binds.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn acquire_on_node(&self, node: NodeId, size: usize) -> Result<NonNull<u8>, AllocError> {
        self.node(node)?;
        if self.faults.panic_acquire.contains(&node) {
            panic!("simulated acquire panic on node {node}");
        }
        if self.faults.acquire.contains(&node) {
            return Err(AllocError::AcquireFailed {
                node,
                source: io::Error::new(io::ErrorKind::OutOfMemory, "simulated mbind failure"),
            });
        }
        if size == 0 {
            return Err(AllocError::AcquireFailed {
                node,
                source: io::Error::new(io::ErrorKind::InvalidInput, "zero-sized region"),
            });
        }

        let layout = self
            .layout(size)
            .map_err(|source| AllocError::AcquireFailed { node, source })?;
        // SAFETY: layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc::alloc(layout) }).ok_or_else(|| {
            AllocError::AcquireFailed {
                node,
                source: io::Error::new(io::ErrorKind::OutOfMemory, "heap exhausted"),
            }
        })?;

        self.regions.lock().insert(
            base.as_ptr() as usize,
            SimRegion {
                node,
                size,
                pinned: false,
            },
        );
        Ok(base)
    }

    fn pin(&self, node: NodeId, base: NonNull<u8>, _size: usize) -> Result<(), AllocError> {
        if self.faults.pin.contains(&node) {
            return Err(AllocError::PinFailed {
                node,
                source: io::Error::new(
                    io::ErrorKind::PermissionDenied,
                    "simulated RLIMIT_MEMLOCK exceeded",
                ),
            });
        }
        match self.regions.lock().get_mut(&(base.as_ptr() as usize)) {
            Some(region) => {
                region.pinned = true;
                Ok(())
            }
            None => Err(AllocError::PinFailed {
                node,
                source: io::Error::new(io::ErrorKind::InvalidInput, "unknown region"),
            }),
        }
    }

    fn unpin(&self, base: NonNull<u8>, _size: usize) -> io::Result<()> {
        let mut regions = self.regions.lock();
        let region = regions
            .get_mut(&(base.as_ptr() as usize))
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown region"))?;
        if self.faults.unpin.contains(&region.node) {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "simulated munlock failure",
            ));
        }
        region.pinned = false;
        Ok(())
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> io::Result<()> {
        let mut regions = self.regions.lock();
        let addr = base.as_ptr() as usize;
        let region = regions
            .get(&addr)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "unknown region"))?;
        if region.size != size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("release size {size} does not match region size {}", region.size),
            ));
        }
        // The region stays live; Drop reclaims it.
        if self.faults.release.contains(&region.node) {
            return Err(io::Error::new(io::ErrorKind::Other, "simulated munmap failure"));
        }
        let layout = self.layout(size)?;
        regions.remove(&addr);
        // SAFETY: base was returned by alloc::alloc with this exact layout and
        // was just removed from the live map, so it is freed once.
        unsafe { alloc::dealloc(base.as_ptr(), layout) };
        Ok(())
    }
}

impl Drop for SimulatedPlatform {
    fn drop(&mut self) {
        for (addr, region) in self.regions.get_mut().drain() {
            if let Ok(layout) = Layout::from_size_align(region.size, self.page_size) {
                // SAFETY: every tracked region was allocated with this layout and never freed.
                unsafe { alloc::dealloc(addr as *mut u8, layout) };
            }
        }
    }
}

/// Builder for [`SimulatedPlatform`].
#[derive(Debug, Clone)]
pub struct SimulatedPlatformBuilder {
    node_ids: Vec<u32>,
    node_memory: u64,
    cpus_per_node: usize,
    memory_only: HashSet<u32>,
    page_size: usize,
    numa_available: bool,
    faults: Faults,
}

impl Default for SimulatedPlatformBuilder {
    fn default() -> Self {
        Self {
            node_ids: vec![0],
            node_memory: 64 * 1024 * 1024,
            cpus_per_node: 2,
            memory_only: HashSet::new(),
            page_size: DEFAULT_PAGE_SIZE,
            numa_available: true,
            faults: Faults::default(),
        }
    }
}

impl SimulatedPlatformBuilder {
    /// Dense node IDs `0..count`.
    pub fn nodes(mut self, count: u32) -> Self {
        self.node_ids = (0..count).collect();
        self
    }

    /// Explicit (possibly sparse) node IDs.
    pub fn node_ids(mut self, ids: &[u32]) -> Self {
        let mut ids = ids.to_vec();
        ids.sort_unstable();
        ids.dedup();
        self.node_ids = ids;
        self
    }

    /// Memory per node in bytes.
    pub fn node_memory(mut self, bytes: u64) -> Self {
        self.node_memory = bytes;
        self
    }

    pub fn cpus_per_node(mut self, cpus: usize) -> Self {
        self.cpus_per_node = cpus;
        self
    }

    /// Node with memory but no CPUs.
    pub fn memory_only_node(mut self, node: u32) -> Self {
        self.memory_only.insert(node);
        self
    }

    pub fn page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    pub fn numa_available(mut self, available: bool) -> Self {
        self.numa_available = available;
        self
    }

    pub fn fail_acquire_on(mut self, node: u32) -> Self {
        self.faults.acquire.insert(NodeId::new(node));
        self
    }

    pub fn fail_pin_on(mut self, node: u32) -> Self {
        self.faults.pin.insert(NodeId::new(node));
        self
    }

    pub fn fail_bind_on(mut self, node: u32) -> Self {
        self.faults.bind.insert(NodeId::new(node));
        self
    }

    pub fn fail_unpin_on(mut self, node: u32) -> Self {
        self.faults.unpin.insert(NodeId::new(node));
        self
    }

    pub fn fail_release_on(mut self, node: u32) -> Self {
        self.faults.release.insert(NodeId::new(node));
        self
    }

    /// Makes `acquire_on_node` panic for `node`, as a crashing init worker would.
    pub fn panic_acquire_on(mut self, node: u32) -> Self {
        self.faults.panic_acquire.insert(NodeId::new(node));
        self
    }

    pub fn build(self) -> SimulatedPlatform {
        let mut next_cpu = 0;
        let nodes = self
            .node_ids
            .iter()
            .map(|&id| {
                let cpus = if self.memory_only.contains(&id) {
                    CpuSet::default()
                } else {
                    let cpus: Vec<usize> = (next_cpu..next_cpu + self.cpus_per_node).collect();
                    next_cpu += self.cpus_per_node;
                    CpuSet::new(cpus)
                };
                SimNode {
                    id: NodeId::new(id),
                    cpus,
                    total_bytes: self.node_memory,
                }
            })
            .collect();

        SimulatedPlatform {
            numa_available: self.numa_available,
            nodes,
            page_size: self.page_size,
            faults: self.faults,
            regions: Mutex::new(HashMap::new()),
            binds: AtomicUsize::new(0),
        }
    }
}
