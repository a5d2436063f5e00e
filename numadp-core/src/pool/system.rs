//! Pool system: parallel per-node initialization, raw bump allocation and
//! coordinated teardown.

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::Arc;
use std::thread;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, error, info, instrument, trace, warn};

use super::node::{NodePool, PoolUsage};
use crate::affinity;
use crate::error::AllocError;
use crate::stats::AllocStats;
use crate::topology::{NodeId, NumaPlatform};

/// How much memory each node pool reserves. The size is uniform across nodes.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub enum PoolSizing {
    /// Fraction of total physical memory, split evenly across online nodes.
    Fraction(f64),
    /// Explicit bytes per node.
    PerNode(usize),
}

/// Startup parameters for [`PoolSystem::init`].
#[derive(Debug, Clone)]
pub struct PoolSystemConfig {
    pub sizing: PoolSizing,
    /// Touch every page during init.
    pub prefault: bool,
    /// Fail a node's init when its thread cannot be bound to the node's CPUs,
    /// instead of logging and continuing with degraded locality.
    pub strict_affinity: bool,
    /// Emit a TRACE event for every allocation and release.
    pub trace_allocations: bool,
}

impl Default for PoolSystemConfig {
    fn default() -> Self {
        Self {
            sizing: PoolSizing::Fraction(0.25),
            prefault: true,
            strict_affinity: false,
            trace_allocations: false,
        }
    }
}

impl PoolSystemConfig {
    pub fn per_node(bytes: usize) -> Self {
        Self {
            sizing: PoolSizing::PerNode(bytes),
            ..Self::default()
        }
    }
}

#[derive(Debug, Default)]
struct PoolState {
    pools: BTreeMap<NodeId, NodePool>,
    pool_size: usize,
}

/// Owns one pinned [`NodePool`] per online NUMA node.
///
/// Pools are keyed by the platform's node IDs, so sparse topologies
/// (`0, 2, 5`) map directly without placeholder slots.
pub struct PoolSystem {
    platform: Arc<dyn NumaPlatform>,
    state: RwLock<PoolState>,
    config: PoolSystemConfig,
    stats: AllocStats,
}

impl std::fmt::Debug for PoolSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.read();
        f.debug_struct("PoolSystem")
            .field("nodes", &state.pools.keys().collect::<Vec<_>>())
            .field("pool_size", &state.pool_size)
            .field("config", &self.config)
            .finish()
    }
}

impl PoolSystem {
    /// Probes the topology and brings up every node pool in parallel.
    ///
    /// Startup is all-or-nothing: if any node fails, every pool that did come
    /// up is unpinned and released, and the first failure (in node order) is
    /// returned.
    #[instrument(skip_all, fields(sizing = ?config.sizing))]
    pub fn init(
        platform: Arc<dyn NumaPlatform>,
        config: PoolSystemConfig,
    ) -> Result<Self, AllocError> {
        if !platform.is_numa_available() {
            error!("NUMA topology unavailable, refusing to start");
            return Err(AllocError::NumaUnavailable);
        }
        let nodes = platform.online_nodes()?;
        if nodes.is_empty() {
            return Err(AllocError::NumaUnavailable);
        }
        let pool_size = resolve_pool_size(platform.as_ref(), config.sizing, nodes.len())?;
        info!(nodes = nodes.len(), pool_size, "initializing node pools");

        let results = spawn_node_workers(platform.as_ref(), &nodes, pool_size, &config);

        let mut pools = BTreeMap::new();
        let mut first_error = None;
        for (node, result) in results {
            match result {
                Ok(pool) => {
                    pools.insert(node, pool);
                }
                Err(e) => {
                    error!(node = %node, error = %e, "node initialization failed");
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Some(err) = first_error {
            let rolled_back = pools.len();
            for pool in pools.into_values() {
                pool.teardown(platform.as_ref());
            }
            warn!(rolled_back, "rolled back partially initialized pool system");
            return Err(err);
        }

        info!("pool system ready");
        Ok(Self {
            platform,
            state: RwLock::new(PoolState { pools, pool_size }),
            config,
            stats: AllocStats::new(),
        })
    }

    /// Bump-allocates `size` bytes aligned to `align` from `node`'s pool.
    ///
    /// Nothing is mutated on failure.
    pub fn alloc_on_node(
        &self,
        node: NodeId,
        size: usize,
        align: usize,
    ) -> Result<NonNull<u8>, AllocError> {
        let result = self
            .state
            .read()
            .pools
            .get(&node)
            .ok_or(AllocError::OutOfRange(node))
            .and_then(|pool| pool.bump(size, align));

        match &result {
            Ok(ptr) => {
                self.stats.record_raw(1, size as u64);
                if self.config.trace_allocations {
                    trace!(node = %node, size, align, addr = ?ptr.as_ptr(), "raw allocation");
                }
            }
            Err(e) => {
                self.stats.record_failure();
                debug!(node = %node, size, align, error = %e, "raw allocation failed");
            }
        }
        result
    }

    /// Reserves `count` same-sized blocks in one step; all or none.
    pub(crate) fn alloc_many_on_node(
        &self,
        node: NodeId,
        size: usize,
        align: usize,
        count: usize,
    ) -> Result<Vec<NonNull<u8>>, AllocError> {
        let result = self
            .state
            .read()
            .pools
            .get(&node)
            .ok_or(AllocError::OutOfRange(node))
            .and_then(|pool| pool.bump_many(size, align, count));

        match &result {
            Ok(blocks) => self
                .stats
                .record_raw(blocks.len() as u64, (blocks.len() * size) as u64),
            Err(_) => self.stats.record_failure(),
        }
        result
    }

    /// Unpins and releases every pool. Idempotent and best-effort: a failure
    /// on one node is logged and teardown continues with the rest.
    ///
    /// Addresses handed out earlier dangle afterwards; callers must have
    /// stopped using them. Returns the number of regions released.
    pub fn destroy(&self) -> usize {
        let pools = {
            let mut state = self.state.write();
            state.pool_size = 0;
            std::mem::take(&mut state.pools)
        };
        if pools.is_empty() {
            return 0;
        }

        let total = pools.len();
        let released = pools
            .into_values()
            .map(|pool| pool.teardown(self.platform.as_ref()))
            .filter(|released| *released)
            .count();
        info!(released, total, "pool system destroyed");
        released
    }

    /// Binds the calling worker thread to `node`'s CPUs.
    pub fn bind_worker_to_node(&self, node: NodeId) -> Result<(), AllocError> {
        if !self.contains_node(node) {
            return Err(AllocError::OutOfRange(node));
        }
        affinity::bind_current_thread(self.platform.as_ref(), node)
    }

    /// Managed node the calling thread is currently running on, if any.
    pub fn current_node(&self) -> Option<NodeId> {
        affinity::current_node(self.platform.as_ref()).filter(|node| self.contains_node(*node))
    }

    pub fn is_initialized(&self) -> bool {
        !self.state.read().pools.is_empty()
    }

    pub fn num_nodes(&self) -> usize {
        self.state.read().pools.len()
    }

    pub fn pool_size(&self) -> usize {
        self.state.read().pool_size
    }

    pub fn nodes(&self) -> Vec<NodeId> {
        self.state.read().pools.keys().copied().collect()
    }

    pub fn contains_node(&self, node: NodeId) -> bool {
        self.state.read().pools.contains_key(&node)
    }

    pub fn usage(&self, node: NodeId) -> Option<PoolUsage> {
        self.state.read().pools.get(&node).map(NodePool::usage)
    }

    pub fn usage_all(&self) -> Vec<PoolUsage> {
        self.state.read().pools.values().map(NodePool::usage).collect()
    }

    /// Node whose pool contains `addr`.
    pub fn node_of(&self, addr: usize) -> Option<NodeId> {
        self.state
            .read()
            .pools
            .values()
            .find(|pool| pool.contains(addr))
            .map(NodePool::node)
    }

    pub fn stats(&self) -> &AllocStats {
        &self.stats
    }

    pub fn config(&self) -> &PoolSystemConfig {
        &self.config
    }

    pub fn platform(&self) -> &Arc<dyn NumaPlatform> {
        &self.platform
    }
}

impl Drop for PoolSystem {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn resolve_pool_size(
    platform: &dyn NumaPlatform,
    sizing: PoolSizing,
    nodes: usize,
) -> Result<usize, AllocError> {
    let bytes = match sizing {
        PoolSizing::PerNode(bytes) => bytes,
        PoolSizing::Fraction(fraction) => {
            if !(fraction > 0.0 && fraction <= 1.0) {
                return Err(AllocError::InvalidPoolSize);
            }
            let total = platform
                .total_memory()
                .ok_or_else(|| AllocError::Topology("total physical memory unknown".into()))?;
            let per_node = total as f64 * fraction / nodes as f64;
            usize::try_from(per_node as u64).map_err(|_| AllocError::InvalidPoolSize)?
        }
    };

    let page = platform.page_size().max(1);
    let size = bytes - bytes % page;
    if size == 0 {
        return Err(AllocError::InvalidPoolSize);
    }
    Ok(size)
}

/// Runs one named init thread per node and joins them all.
fn spawn_node_workers(
    platform: &dyn NumaPlatform,
    nodes: &[NodeId],
    pool_size: usize,
    config: &PoolSystemConfig,
) -> Vec<(NodeId, Result<NodePool, AllocError>)> {
    thread::scope(|s| {
        let handles: Vec<_> = nodes
            .iter()
            .map(|&node| {
                let handle = thread::Builder::new()
                    .name(format!("numadp-init-{node}"))
                    .spawn_scoped(s, move || init_node(platform, node, pool_size, config));
                (node, handle)
            })
            .collect();

        handles
            .into_iter()
            .map(|(node, handle)| {
                let result = match handle {
                    Ok(handle) => handle
                        .join()
                        .unwrap_or_else(|_| Err(AllocError::InitWorkerPanicked(node))),
                    Err(source) => Err(AllocError::SpawnFailed { node, source }),
                };
                (node, result)
            })
            .collect()
    })
}

fn init_node(
    platform: &dyn NumaPlatform,
    node: NodeId,
    size: usize,
    config: &PoolSystemConfig,
) -> Result<NodePool, AllocError> {
    if let Err(e) = affinity::bind_current_thread(platform, node) {
        if config.strict_affinity {
            return Err(e);
        }
        warn!(node = %node, error = %e, "continuing init without node affinity");
    }

    let capacity = platform.node_capacity(node)?;
    if capacity.free_bytes < size as u64 {
        return Err(AllocError::InsufficientCapacity {
            node,
            requested: size as u64,
            free: capacity.free_bytes,
        });
    }

    let base = platform.acquire_on_node(node, size)?;
    if let Err(e) = platform.pin(node, base, size) {
        // SAFETY: the region was acquired just above and never shared.
        if let Err(release_err) = unsafe { platform.release(base, size) } {
            warn!(node = %node, error = %release_err, "failed to release unpinned region");
        }
        return Err(e);
    }

    let pool = NodePool::new(node, base, size);
    if config.prefault {
        pool.prefault(platform.page_size());
    }
    debug!(node = %node, size, "node pool ready");
    Ok(pool)
}
