//! A single node-local region with a monotonic bump cursor.

use std::ops::Range;
use std::ptr::{self, NonNull};

use parking_lot::Mutex;
use serde::Serialize;
use tracing::warn;

use crate::error::AllocError;
use crate::topology::{NodeId, NumaPlatform};

/// Pinned, pre-faulted memory owned by one NUMA node.
///
/// A `NodePool` only exists for a region that was acquired and pinned
/// successfully, so its base is always valid while the pool is reachable.
/// The offset only grows; nothing is reclaimed at this layer.
#[derive(Debug)]
pub struct NodePool {
    node: NodeId,
    base: NonNull<u8>,
    size: usize,
    offset: Mutex<usize>,
}

// SAFETY: the region is exclusively owned by the pool; the only mutable state
// (the bump offset) is behind a mutex, and handed-out memory is raw.
unsafe impl Send for NodePool {}
unsafe impl Sync for NodePool {}

/// Occupancy of one node pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolUsage {
    pub node: NodeId,
    pub base: usize,
    pub size: usize,
    pub offset: usize,
}

impl PoolUsage {
    pub fn remaining(&self) -> usize {
        self.size - self.offset
    }
}

impl NodePool {
    pub(crate) fn new(node: NodeId, base: NonNull<u8>, size: usize) -> Self {
        Self {
            node,
            base,
            size,
            offset: Mutex::new(0),
        }
    }

    #[inline]
    pub fn node(&self) -> NodeId {
        self.node
    }

    #[inline]
    pub fn base(&self) -> NonNull<u8> {
        self.base
    }

    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn offset(&self) -> usize {
        *self.offset.lock()
    }

    pub fn remaining(&self) -> usize {
        self.size - self.offset()
    }

    /// Address range `[base, base + size)`.
    pub fn range(&self) -> Range<usize> {
        let start = self.base.as_ptr() as usize;
        start..start + self.size
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        self.range().contains(&addr)
    }

    pub fn usage(&self) -> PoolUsage {
        PoolUsage {
            node: self.node,
            base: self.base.as_ptr() as usize,
            size: self.size,
            offset: self.offset(),
        }
    }

    /// Start and end offsets for `size` bytes placed after `offset`, with the
    /// absolute start address aligned to `align`.
    fn place(&self, offset: usize, size: usize, align: usize) -> Option<(usize, usize)> {
        let base = self.base.as_ptr() as usize;
        let addr = base.checked_add(offset)?;
        let aligned = addr.checked_add(align - 1)? & !(align - 1);
        let start = aligned - base;
        let end = start.checked_add(size)?;
        (end <= self.size).then_some((start, end))
    }

    fn check_request(size: usize, align: usize) -> Result<(), AllocError> {
        if !align.is_power_of_two() {
            return Err(AllocError::InvalidAlignment(align));
        }
        if size == 0 {
            return Err(AllocError::ZeroSize);
        }
        Ok(())
    }

    #[inline]
    fn ptr_at(&self, start: usize) -> NonNull<u8> {
        // SAFETY: callers only pass starts of placements that end within
        // self.size, so the result stays inside the region and is non-null.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(start)) }
    }

    /// Bumps `size` bytes aligned to `align`. On failure the offset is unchanged.
    pub(crate) fn bump(&self, size: usize, align: usize) -> Result<NonNull<u8>, AllocError> {
        Self::check_request(size, align)?;

        let mut offset = self.offset.lock();
        let (start, end) = self
            .place(*offset, size, align)
            .ok_or(AllocError::PoolExhausted {
                node: self.node,
                requested: size,
                remaining: self.size - *offset,
            })?;
        *offset = end;
        Ok(self.ptr_at(start))
    }

    /// Bumps `count` consecutive blocks under one lock acquisition. Either all
    /// blocks fit and the offset advances past the last one, or nothing changes.
    pub(crate) fn bump_many(
        &self,
        size: usize,
        align: usize,
        count: usize,
    ) -> Result<Vec<NonNull<u8>>, AllocError> {
        Self::check_request(size, align)?;

        if count == 0 {
            return Ok(Vec::new());
        }

        let mut offset = self.offset.lock();
        // Every start after the first is aligned, so blocks sit one stride apart.
        let placed = self.place(*offset, size, align).and_then(|(first, _)| {
            let stride = size.checked_next_multiple_of(align)?;
            let end = stride
                .checked_mul(count - 1)?
                .checked_add(first)?
                .checked_add(size)?;
            (end <= self.size).then_some((first, stride, end))
        });
        let (first, stride, end) = placed.ok_or(AllocError::PoolExhausted {
            node: self.node,
            requested: size.saturating_mul(count),
            remaining: self.size - *offset,
        })?;

        *offset = end;
        Ok((0..count)
            .map(|i| self.ptr_at(first + i * stride))
            .collect())
    }

    /// Touches every page once so first-touch faults happen now, not on the hot path.
    pub(crate) fn prefault(&self, page_size: usize) {
        for off in (0..self.size).step_by(page_size.max(1)) {
            // SAFETY: off < size, the region is mapped read/write and not yet shared.
            unsafe { ptr::write_volatile(self.base.as_ptr().add(off), 0) };
        }
    }

    /// Unpins and releases the region. Best-effort: an unpin failure is
    /// logged and the release still happens. Returns whether the region was
    /// released.
    pub(crate) fn teardown(self, platform: &dyn NumaPlatform) -> bool {
        if let Err(e) = platform.unpin(self.base, self.size) {
            warn!(node = %self.node, error = %e, "failed to unpin pool");
        }
        // SAFETY: base/size come from acquire_on_node; consuming `self`
        // guarantees the region is released at most once.
        match unsafe { platform.release(self.base, self.size) } {
            Ok(()) => true,
            Err(e) => {
                warn!(node = %self.node, error = %e, "failed to release pool");
                false
            }
        }
    }
}
