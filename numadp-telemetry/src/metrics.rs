//! ## numadp-telemetry::metrics
//! **Prometheus gauges for pools, blocks and allocator totals**
//!
//! Values are pulled from the core on demand ([`MetricsRecorder::observe`]);
//! nothing here sits on the allocation path. Allocator totals are gauges set
//! from a [`StatsSnapshot`].

use numadp_core::block::{FixedBlockAllocator, SizeClass};
use numadp_core::pool::PoolSystem;
use numadp_core::stats::StatsSnapshot;
use prometheus::{IntGauge, IntGaugeVec, Opts, Registry};

#[derive(Clone)]
pub struct MetricsRecorder {
    pub registry: Registry,
    pub pool_size_bytes: IntGaugeVec,
    pub pool_used_bytes: IntGaugeVec,
    pub blocks_free: IntGaugeVec,
    pub blocks_active: IntGaugeVec,
    pub raw_allocations: IntGauge,
    pub blocks_carved: IntGauge,
    pub block_allocations: IntGauge,
    pub block_frees: IntGauge,
    pub failed_requests: IntGauge,
}

impl MetricsRecorder {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let pool_size_bytes = IntGaugeVec::new(
            Opts::new("numadp_pool_size_bytes", "Bytes reserved per node pool"),
            &["node"],
        )?;
        let pool_used_bytes = IntGaugeVec::new(
            Opts::new("numadp_pool_used_bytes", "Bytes bumped from each node pool"),
            &["node"],
        )?;
        let blocks_free = IntGaugeVec::new(
            Opts::new("numadp_blocks_free", "Free blocks per node and size class"),
            &["node", "class"],
        )?;
        let blocks_active = IntGaugeVec::new(
            Opts::new("numadp_blocks_active", "Active blocks per node and size class"),
            &["node", "class"],
        )?;
        let raw_allocations =
            IntGauge::new("numadp_raw_allocations", "Raw bump allocations so far")?;
        let blocks_carved = IntGauge::new("numadp_blocks_carved", "Blocks carved so far")?;
        let block_allocations =
            IntGauge::new("numadp_block_allocations", "Block allocations so far")?;
        let block_frees = IntGauge::new("numadp_block_frees", "Block frees so far")?;
        let failed_requests =
            IntGauge::new("numadp_failed_requests", "Rejected allocator requests so far")?;

        registry.register(Box::new(pool_size_bytes.clone()))?;
        registry.register(Box::new(pool_used_bytes.clone()))?;
        registry.register(Box::new(blocks_free.clone()))?;
        registry.register(Box::new(blocks_active.clone()))?;
        registry.register(Box::new(raw_allocations.clone()))?;
        registry.register(Box::new(blocks_carved.clone()))?;
        registry.register(Box::new(block_allocations.clone()))?;
        registry.register(Box::new(block_frees.clone()))?;
        registry.register(Box::new(failed_requests.clone()))?;

        Ok(Self {
            registry,
            pool_size_bytes,
            pool_used_bytes,
            blocks_free,
            blocks_active,
            raw_allocations,
            blocks_carved,
            block_allocations,
            block_frees,
            failed_requests,
        })
    }

    pub fn observe_pools(&self, system: &PoolSystem) {
        for usage in system.usage_all() {
            let node = usage.node.to_string();
            self.pool_size_bytes
                .with_label_values(&[node.as_str()])
                .set(usage.size as i64);
            self.pool_used_bytes
                .with_label_values(&[node.as_str()])
                .set(usage.offset as i64);
        }
    }

    pub fn observe_blocks(&self, allocator: &FixedBlockAllocator) {
        for node in allocator.system().nodes() {
            let node_label = node.to_string();
            for class in SizeClass::ALL {
                if let Some(counts) = allocator.counts(node, class) {
                    let labels = [node_label.as_str(), class.as_str()];
                    self.blocks_free
                        .with_label_values(&labels)
                        .set(counts.free as i64);
                    self.blocks_active
                        .with_label_values(&labels)
                        .set(counts.active as i64);
                }
            }
        }
    }

    pub fn observe_stats(&self, stats: &StatsSnapshot) {
        self.raw_allocations.set(stats.raw_allocations as i64);
        self.blocks_carved.set(stats.blocks_carved as i64);
        self.block_allocations.set(stats.block_allocations as i64);
        self.block_frees.set(stats.block_frees as i64);
        self.failed_requests.set(stats.failed_requests as i64);
    }

    /// Refreshes every gauge from the allocator and its pool system.
    pub fn observe(&self, allocator: &FixedBlockAllocator) {
        let system = allocator.system();
        self.observe_pools(system);
        self.observe_blocks(allocator);
        self.observe_stats(&system.stats().snapshot());
    }

    pub fn gather_metrics(&self) -> Result<String, prometheus::Error> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::<u8>::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
