//! Free set and reverse lookup for one (node, size class) pair.

use std::collections::HashMap;
use std::ptr::NonNull;

use serde::Serialize;

use super::SizeClass;
use crate::error::AllocError;
use crate::topology::NodeId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockState {
    Free,
    Active,
}

/// Metadata for one carved block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Block {
    pub node: NodeId,
    pub class: SizeClass,
    /// Offset from the owning pool's base.
    pub offset: usize,
    pub state: BlockState,
}

/// Carved, free and active block counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RegistryCounts {
    pub carved: usize,
    pub free: usize,
    pub active: usize,
}

/// Every block ever carved for one (node, class), keyed by address.
///
/// A block lives in exactly one of two places: the free stack or the active
/// side of the map. Misuse is reported and leaves the registry unchanged.
#[derive(Debug, Default)]
pub struct BlockRegistry {
    free: Vec<NonNull<u8>>,
    blocks: HashMap<usize, Block>,
}

// SAFETY: the registry only stores addresses; it never dereferences them.
unsafe impl Send for BlockRegistry {}

impl BlockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers freshly carved blocks as free.
    pub(crate) fn insert_carved(
        &mut self,
        node: NodeId,
        class: SizeClass,
        pool_base: usize,
        blocks: impl IntoIterator<Item = NonNull<u8>>,
    ) {
        for ptr in blocks {
            let addr = ptr.as_ptr() as usize;
            self.blocks.insert(
                addr,
                Block {
                    node,
                    class,
                    offset: addr - pool_base,
                    state: BlockState::Free,
                },
            );
            self.free.push(ptr);
        }
    }

    /// Pops the most recently freed block and marks it active.
    pub fn allocate(&mut self) -> Option<NonNull<u8>> {
        let ptr = self.free.pop()?;
        if let Some(block) = self.blocks.get_mut(&(ptr.as_ptr() as usize)) {
            block.state = BlockState::Active;
        }
        Some(ptr)
    }

    /// Returns an active block to the free stack.
    pub fn release(&mut self, addr: usize) -> Result<Block, AllocError> {
        let block = self
            .blocks
            .get_mut(&addr)
            .ok_or(AllocError::UnknownPointer(addr))?;
        if block.state == BlockState::Free {
            return Err(AllocError::DoubleFree(addr));
        }
        block.state = BlockState::Free;
        let released = *block;
        // Registered addresses came from NonNull pointers.
        if let Some(ptr) = NonNull::new(addr as *mut u8) {
            self.free.push(ptr);
        }
        Ok(released)
    }

    pub fn get(&self, addr: usize) -> Option<Block> {
        self.blocks.get(&addr).copied()
    }

    #[inline]
    pub fn owns(&self, addr: usize) -> bool {
        self.blocks.contains_key(&addr)
    }

    pub fn counts(&self) -> RegistryCounts {
        RegistryCounts {
            carved: self.blocks.len(),
            free: self.free.len(),
            active: self.blocks.len() - self.free.len(),
        }
    }
}
