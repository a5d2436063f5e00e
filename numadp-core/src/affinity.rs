//! ## numadp-core::affinity
//! **Binds threads to the CPUs of a NUMA node**
//!
//! Used by the per-node init threads and by application workers before their
//! first node-local allocation. A failed bind degrades locality but never
//! corrupts allocator state, so callers decide whether to continue.

use tracing::debug;

use crate::error::AllocError;
use crate::topology::{NodeId, NumaPlatform};

/// Restricts the calling thread to the CPU set of `node`.
///
/// Fails with [`AllocError::BindFailed`] if the node has no CPUs (memory-only
/// node) or the scheduler rejects the mask.
pub fn bind_current_thread(platform: &dyn NumaPlatform, node: NodeId) -> Result<(), AllocError> {
    let cpus = platform.node_cpus(node)?;
    if cpus.is_empty() {
        return Err(AllocError::BindFailed {
            node,
            reason: "node has no CPUs".into(),
        });
    }

    platform.set_affinity(node, &cpus)?;

    debug!(node = %node, cpus = cpus.len(), "thread bound to node");
    Ok(())
}

/// Resolves the node of the CPU the calling thread currently runs on.
///
/// This is the boundary policy for picking a node when the caller does not
/// pass one explicitly; the allocator itself always takes an explicit node.
pub fn current_node(platform: &dyn NumaPlatform) -> Option<NodeId> {
    let cpu = platform.current_cpu()?;
    platform
        .online_nodes()
        .ok()?
        .into_iter()
        .find(|&node| {
            platform
                .node_cpus(node)
                .map(|cpus| cpus.contains(cpu))
                .unwrap_or(false)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::SimulatedPlatform;

    #[test]
    fn test_bind_and_resolve_current_node() {
        let platform = SimulatedPlatform::builder().nodes(2).cpus_per_node(4).build();

        std::thread::scope(|s| {
            s.spawn(|| {
                bind_current_thread(&platform, NodeId::new(1)).unwrap();
                assert_eq!(current_node(&platform), Some(NodeId::new(1)));
            });
        });
    }

    #[test]
    fn test_memory_only_node_fails_to_bind() {
        let platform = SimulatedPlatform::builder()
            .node_ids(&[0, 1])
            .memory_only_node(1)
            .build();

        let err = bind_current_thread(&platform, NodeId::new(1)).unwrap_err();
        assert!(matches!(err, AllocError::BindFailed { .. }));
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_unknown_node_is_out_of_range() {
        let platform = SimulatedPlatform::builder().nodes(1).build();
        assert!(matches!(
            bind_current_thread(&platform, NodeId::new(7)),
            Err(AllocError::OutOfRange(_))
        ));
    }

    #[test]
    fn test_scheduler_rejection_is_reported() {
        let platform = SimulatedPlatform::builder().nodes(2).fail_bind_on(0).build();
        assert!(matches!(
            bind_current_thread(&platform, NodeId::new(0)),
            Err(AllocError::BindFailed { .. })
        ));
        assert_eq!(platform.bind_count(), 0);
    }
}
