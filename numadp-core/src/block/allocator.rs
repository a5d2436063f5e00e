use std::collections::BTreeMap;
use std::ops::Range;
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use super::registry::{Block, BlockRegistry, RegistryCounts};
use super::SizeClass;
use crate::error::AllocError;
use crate::pool::PoolSystem;
use crate::topology::NodeId;

/// Blocks to carve per class on a node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CarveCounts {
    pub small: usize,
    pub medium: usize,
    pub large: usize,
}

impl CarveCounts {
    pub fn get(&self, class: SizeClass) -> usize {
        match class {
            SizeClass::Small => self.small,
            SizeClass::Medium => self.medium,
            SizeClass::Large => self.large,
        }
    }
}

#[derive(Debug)]
struct NodeBlocks {
    range: Range<usize>,
    registries: [Mutex<BlockRegistry>; SizeClass::COUNT],
}

impl NodeBlocks {
    fn registry(&self, class: SizeClass) -> &Mutex<BlockRegistry> {
        &self.registries[class.index()]
    }
}

/// Fixed-size block allocator on top of a [`PoolSystem`].
///
/// Each (node, class) pair has its own registry and lock; no lock is shared
/// between nodes. Blocks never migrate between nodes or classes.
#[derive(Debug)]
pub struct FixedBlockAllocator {
    system: Arc<PoolSystem>,
    nodes: BTreeMap<NodeId, NodeBlocks>,
}

impl FixedBlockAllocator {
    pub fn new(system: Arc<PoolSystem>) -> Self {
        let nodes = system
            .usage_all()
            .into_iter()
            .map(|usage| {
                let blocks = NodeBlocks {
                    range: usage.base..usage.base + usage.size,
                    registries: Default::default(),
                };
                (usage.node, blocks)
            })
            .collect();
        Self { system, nodes }
    }

    pub fn system(&self) -> &Arc<PoolSystem> {
        &self.system
    }

    fn node_blocks(&self, node: NodeId) -> Result<&NodeBlocks, AllocError> {
        if !self.system.contains_node(node) {
            return Err(AllocError::OutOfRange(node));
        }
        self.nodes.get(&node).ok_or(AllocError::OutOfRange(node))
    }

    /// Reserves `count` blocks of `class` from `node`'s pool and makes them
    /// available to [`allocate`](Self::allocate).
    ///
    /// Either all `count` blocks are carved or none are. Capacity committed to
    /// a class never returns to the raw pool. Returns the total number of
    /// blocks carved for the pair so far.
    #[instrument(skip(self), level = "debug")]
    pub fn carve(&self, node: NodeId, class: SizeClass, count: usize) -> Result<usize, AllocError> {
        let blocks = self.node_blocks(node)?;
        if count == 0 {
            return Ok(blocks.registry(class).lock().counts().carved);
        }

        let carved = self
            .system
            .alloc_many_on_node(node, class.size(), class.align(), count)?;

        let tracing_on = self.system.config().trace_allocations;
        if tracing_on {
            for ptr in &carved {
                trace!(node = %node, %class, addr = ?ptr.as_ptr(), "block registered");
            }
        }

        let total = {
            let mut registry = blocks.registry(class).lock();
            registry.insert_carved(node, class, blocks.range.start, carved);
            registry.counts().carved
        };
        self.system.stats().record_carved(count as u64);
        debug!(node = %node, %class, count, total, "carved blocks");
        Ok(total)
    }

    /// Carves every class for `node` in size order. Classes carved before a
    /// failure stay carved.
    pub fn carve_counts(&self, node: NodeId, counts: &CarveCounts) -> Result<(), AllocError> {
        for class in SizeClass::ALL {
            let count = counts.get(class);
            if count > 0 {
                self.carve(node, class, count)?;
            }
        }
        Ok(())
    }

    /// Hands out a free block of `class` from `node`.
    pub fn allocate(&self, node: NodeId, class: SizeClass) -> Result<NonNull<u8>, AllocError> {
        let stats = self.system.stats();
        let allocated = self
            .node_blocks(node)
            .and_then(|blocks| {
                blocks
                    .registry(class)
                    .lock()
                    .allocate()
                    .ok_or(AllocError::ClassExhausted { node, class })
            })
            .inspect_err(|_| stats.record_failure())?;

        stats.record_block_allocation();
        if self.system.config().trace_allocations {
            trace!(node = %node, %class, addr = ?allocated.as_ptr(), "block allocated");
        }
        Ok(allocated)
    }

    /// Allocates from the smallest class that holds `bytes`.
    pub fn allocate_bytes(&self, node: NodeId, bytes: usize) -> Result<NonNull<u8>, AllocError> {
        let class =
            SizeClass::for_size(bytes).inspect_err(|_| self.system.stats().record_failure())?;
        self.allocate(node, class)
    }

    /// Returns a block to its (node, class) free set. Contents are not zeroed.
    ///
    /// Only exact block start addresses handed out by
    /// [`allocate`](Self::allocate) are accepted.
    pub fn free(&self, ptr: NonNull<u8>) -> Result<(), AllocError> {
        let addr = ptr.as_ptr() as usize;
        let result = self.release(addr);
        match &result {
            Ok(block) => {
                self.system.stats().record_block_free();
                if self.system.config().trace_allocations {
                    trace!(node = %block.node, class = %block.class, addr = ?ptr.as_ptr(), "block freed");
                }
            }
            Err(e) => {
                self.system.stats().record_failure();
                debug!(addr = ?ptr.as_ptr(), error = %e, "rejected block free");
            }
        }
        result.map(|_| ())
    }

    fn release(&self, addr: usize) -> Result<Block, AllocError> {
        let (node, blocks) = self
            .nodes
            .iter()
            .find(|(_, blocks)| blocks.range.contains(&addr))
            .ok_or(AllocError::UnknownPointer(addr))?;
        if !self.system.contains_node(*node) {
            return Err(AllocError::UnknownPointer(addr));
        }

        for registry in &blocks.registries {
            let mut registry = registry.lock();
            if registry.owns(addr) {
                return registry.release(addr);
            }
        }
        Err(AllocError::UnknownPointer(addr))
    }

    /// Metadata of the block starting at `ptr`. `None` once the pool system
    /// has been destroyed.
    pub fn block(&self, ptr: NonNull<u8>) -> Option<Block> {
        let addr = ptr.as_ptr() as usize;
        let (node, blocks) = self
            .nodes
            .iter()
            .find(|(_, blocks)| blocks.range.contains(&addr))?;
        if !self.system.contains_node(*node) {
            return None;
        }
        blocks
            .registries
            .iter()
            .find_map(|registry| registry.lock().get(addr))
    }

    pub fn counts(&self, node: NodeId, class: SizeClass) -> Option<RegistryCounts> {
        self.node_blocks(node)
            .ok()
            .map(|blocks| blocks.registry(class).lock().counts())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolSystemConfig;
    use crate::topology::SimulatedPlatform;
    use tracing_test::traced_test;

    const MIB: usize = 1024 * 1024;

    fn allocator(nodes: u32, config: PoolSystemConfig) -> FixedBlockAllocator {
        let platform = Arc::new(
            SimulatedPlatform::builder()
                .nodes(nodes)
                .node_memory(4 * MIB as u64)
                .build(),
        );
        let system = PoolSystem::init(platform, config).unwrap();
        FixedBlockAllocator::new(Arc::new(system))
    }

    #[test]
    fn test_carve_is_additive_and_all_or_nothing() {
        let alloc = allocator(1, PoolSystemConfig::per_node(MIB));
        let node = NodeId::new(0);

        assert_eq!(alloc.carve(node, SizeClass::Small, 8).unwrap(), 8);
        assert_eq!(alloc.carve(node, SizeClass::Small, 8).unwrap(), 16);
        assert_eq!(alloc.carve(node, SizeClass::Small, 0).unwrap(), 16);

        let before = alloc.system().usage(node).unwrap().offset;
        assert!(matches!(
            alloc.carve(node, SizeClass::Medium, 1024),
            Err(AllocError::PoolExhausted { .. })
        ));
        assert_eq!(alloc.system().usage(node).unwrap().offset, before);
        assert_eq!(alloc.counts(node, SizeClass::Medium).unwrap().carved, 0);

        assert!(matches!(
            alloc.carve(node, SizeClass::Large, 1),
            Err(AllocError::PoolExhausted { .. })
        ));
    }

    #[test]
    fn test_carve_with_unbounded_count_fails_cleanly() {
        let alloc = allocator(1, PoolSystemConfig::per_node(MIB));
        let node = NodeId::new(0);
        alloc.carve(node, SizeClass::Small, 2).unwrap();
        let before = alloc.system().usage(node).unwrap().offset;

        for class in SizeClass::ALL {
            assert!(matches!(
                alloc.carve(node, class, usize::MAX),
                Err(AllocError::PoolExhausted { .. })
            ));
        }
        assert_eq!(alloc.system().usage(node).unwrap().offset, before);
        assert_eq!(alloc.counts(node, SizeClass::Small).unwrap().carved, 2);
        assert_eq!(alloc.system().stats().snapshot().blocks_carved, 2);
    }

    #[test]
    fn test_blocks_are_aligned_and_tagged() {
        let alloc = allocator(2, PoolSystemConfig::per_node(MIB));
        let node = NodeId::new(1);
        alloc
            .carve_counts(
                node,
                &CarveCounts {
                    small: 3,
                    medium: 2,
                    large: 0,
                },
            )
            .unwrap();

        let small = alloc.allocate(node, SizeClass::Small).unwrap();
        let medium = alloc.allocate_bytes(node, 5000).unwrap();
        assert_eq!(small.as_ptr() as usize % 4096, 0);
        assert_eq!(medium.as_ptr() as usize % 8192, 0);

        let block = alloc.block(medium).unwrap();
        assert_eq!(block.node, node);
        assert_eq!(block.class, SizeClass::Medium);
        assert_eq!(alloc.system().node_of(medium.as_ptr() as usize), Some(node));
    }

    #[test]
    fn test_free_rejects_interior_and_foreign_pointers() {
        let alloc = allocator(1, PoolSystemConfig::per_node(MIB));
        let node = NodeId::new(0);
        alloc.carve(node, SizeClass::Small, 2).unwrap();
        let ptr = alloc.allocate(node, SizeClass::Small).unwrap();

        let interior = NonNull::new(unsafe { ptr.as_ptr().add(16) }).unwrap();
        assert!(matches!(alloc.free(interior), Err(AllocError::UnknownPointer(_))));

        let mut local = 0u8;
        assert!(matches!(
            alloc.free(NonNull::from(&mut local)),
            Err(AllocError::UnknownPointer(_))
        ));

        alloc.free(ptr).unwrap();
        assert!(matches!(alloc.free(ptr), Err(AllocError::DoubleFree(_))));
        assert_eq!(
            alloc.counts(node, SizeClass::Small).unwrap(),
            RegistryCounts {
                carved: 2,
                free: 2,
                active: 0
            }
        );
        assert_eq!(alloc.system().stats().snapshot().failed_requests, 3);
    }

    #[test]
    fn test_destroyed_system_rejects_block_operations() {
        let alloc = allocator(1, PoolSystemConfig::per_node(MIB));
        let node = NodeId::new(0);
        alloc.carve(node, SizeClass::Small, 1).unwrap();
        let ptr = alloc.allocate(node, SizeClass::Small).unwrap();

        alloc.system().destroy();
        assert!(matches!(
            alloc.allocate(node, SizeClass::Small),
            Err(AllocError::OutOfRange(_))
        ));
        assert!(matches!(
            alloc.carve(node, SizeClass::Small, 1),
            Err(AllocError::OutOfRange(_))
        ));
        assert!(matches!(alloc.free(ptr), Err(AllocError::UnknownPointer(_))));
        assert!(alloc.block(ptr).is_none());
        assert!(alloc.counts(node, SizeClass::Small).is_none());
    }

    #[traced_test]
    #[test]
    fn test_trace_allocations_emits_events() {
        let config = PoolSystemConfig {
            trace_allocations: true,
            ..PoolSystemConfig::per_node(MIB)
        };
        let alloc = allocator(1, config);
        let node = NodeId::new(0);
        alloc.carve(node, SizeClass::Small, 1).unwrap();
        let ptr = alloc.allocate(node, SizeClass::Small).unwrap();
        alloc.free(ptr).unwrap();

        assert!(logs_contain("block registered"));
        assert!(logs_contain("block allocated"));
        assert!(logs_contain("block freed"));
    }

    #[traced_test]
    #[test]
    fn test_tracing_is_off_by_default() {
        let alloc = allocator(1, PoolSystemConfig::per_node(MIB));
        let node = NodeId::new(0);
        alloc.carve(node, SizeClass::Small, 1).unwrap();
        alloc.allocate(node, SizeClass::Small).unwrap();

        assert!(logs_contain("carved blocks"));
        assert!(!logs_contain("block allocated"));
    }
}
