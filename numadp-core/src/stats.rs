//! ## numadp-core::stats
//! **Allocation counters**
//!
//! Relaxed atomic counters shared by the raw pool layer and the block
//! allocator. They are cheap enough to stay on in the hot path; exporters read
//! them through [`AllocStats::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Allocator-wide counters.
#[derive(Debug, Default)]
pub struct AllocStats {
    raw_allocations: AtomicU64,
    raw_bytes: AtomicU64,
    blocks_carved: AtomicU64,
    block_allocations: AtomicU64,
    block_frees: AtomicU64,
    failed_requests: AtomicU64,
}

/// Point-in-time copy of [`AllocStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub raw_allocations: u64,
    pub raw_bytes: u64,
    pub blocks_carved: u64,
    pub block_allocations: u64,
    pub block_frees: u64,
    pub failed_requests: u64,
}

impl AllocStats {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn record_raw(&self, allocations: u64, bytes: u64) {
        self.raw_allocations.fetch_add(allocations, Ordering::Relaxed);
        self.raw_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_carved(&self, blocks: u64) {
        self.blocks_carved.fetch_add(blocks, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_block_allocation(&self) {
        self.block_allocations.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_block_free(&self) {
        self.block_frees.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            raw_allocations: self.raw_allocations.load(Ordering::Relaxed),
            raw_bytes: self.raw_bytes.load(Ordering::Relaxed),
            blocks_carved: self.blocks_carved.load(Ordering::Relaxed),
            block_allocations: self.block_allocations.load(Ordering::Relaxed),
            block_frees: self.block_frees.load(Ordering::Relaxed),
            failed_requests: self.failed_requests.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Blocks handed out and not yet returned.
    pub fn blocks_outstanding(&self) -> u64 {
        self.block_allocations.saturating_sub(self.block_frees)
    }
}
