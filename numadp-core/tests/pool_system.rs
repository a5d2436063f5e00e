use std::sync::Arc;
use std::thread;

use numadp_core::prelude::*;

const MIB: usize = 1024 * 1024;

fn platform(nodes: u32) -> Arc<SimulatedPlatform> {
    Arc::new(
        SimulatedPlatform::builder()
            .nodes(nodes)
            .node_memory(4 * MIB as u64)
            .build(),
    )
}

#[test]
fn pin_failure_on_one_node_rolls_back_every_node() {
    let platform = Arc::new(
        SimulatedPlatform::builder()
            .nodes(4)
            .node_memory(4 * MIB as u64)
            .fail_pin_on(2)
            .build(),
    );

    let err = PoolSystem::init(platform.clone(), PoolSystemConfig::per_node(MIB)).unwrap_err();

    assert!(matches!(err, AllocError::PinFailed { node, .. } if node == NodeId::new(2)));
    assert_eq!(platform.live_regions(), 0);
    assert_eq!(platform.pinned_regions(), 0);
}

#[test]
fn acquire_failure_reports_first_failing_node() {
    let platform = Arc::new(
        SimulatedPlatform::builder()
            .nodes(4)
            .node_memory(4 * MIB as u64)
            .fail_acquire_on(3)
            .fail_acquire_on(1)
            .build(),
    );

    let err = PoolSystem::init(platform.clone(), PoolSystemConfig::per_node(MIB)).unwrap_err();

    assert!(matches!(err, AllocError::AcquireFailed { node, .. } if node == NodeId::new(1)));
    assert_eq!(platform.live_regions(), 0);
}

#[test]
fn panicking_init_worker_rolls_back_every_node() {
    let platform = Arc::new(
        SimulatedPlatform::builder()
            .nodes(4)
            .node_memory(4 * MIB as u64)
            .panic_acquire_on(2)
            .build(),
    );

    let err = PoolSystem::init(platform.clone(), PoolSystemConfig::per_node(MIB)).unwrap_err();

    assert!(matches!(err, AllocError::InitWorkerPanicked(node) if node == NodeId::new(2)));
    assert_eq!(platform.live_regions(), 0);
    assert_eq!(platform.pinned_regions(), 0);
}

#[test]
fn unavailable_numa_refuses_to_start() {
    let platform = Arc::new(SimulatedPlatform::builder().numa_available(false).build());
    let err = PoolSystem::init(platform, PoolSystemConfig::default()).unwrap_err();
    assert!(matches!(err, AllocError::NumaUnavailable));
    assert_eq!(err.severity(), Severity::Fatal);
}

#[test]
fn destroy_twice_is_same_as_once() {
    let platform = platform(2);
    let system = PoolSystem::init(platform.clone(), PoolSystemConfig::per_node(MIB)).unwrap();

    assert_eq!(system.destroy(), 2);
    let after_first = (system.num_nodes(), system.pool_size(), platform.live_regions());
    assert_eq!(system.destroy(), 0);
    let after_second = (system.num_nodes(), system.pool_size(), platform.live_regions());

    assert_eq!(after_first, (0, 0, 0));
    assert_eq!(after_first, after_second);
    assert!(matches!(
        system.alloc_on_node(NodeId::new(0), 64, 8),
        Err(AllocError::OutOfRange(_))
    ));
}

#[test]
fn destroy_continues_past_a_failed_release() {
    let platform = Arc::new(
        SimulatedPlatform::builder()
            .nodes(3)
            .node_memory(4 * MIB as u64)
            .fail_release_on(1)
            .build(),
    );
    let system = PoolSystem::init(platform.clone(), PoolSystemConfig::per_node(MIB)).unwrap();

    assert_eq!(system.destroy(), 2);
    assert_eq!(platform.live_regions(), 1);
    assert_eq!(platform.live_bytes(NodeId::new(0)), 0);
    assert_eq!(platform.live_bytes(NodeId::new(1)), MIB as u64);
    assert_eq!(platform.live_bytes(NodeId::new(2)), 0);
    assert!(!system.is_initialized());
    assert_eq!(system.destroy(), 0);
}

#[test]
fn node_one_past_last_is_out_of_range_without_mutation() {
    let system = PoolSystem::init(platform(2), PoolSystemConfig::per_node(MIB)).unwrap();
    system.alloc_on_node(NodeId::new(0), 100, 8).unwrap();
    let before = system.usage_all();

    let past_end = NodeId::new(system.num_nodes() as u32);
    assert!(matches!(
        system.alloc_on_node(past_end, 4096, 64),
        Err(AllocError::OutOfRange(n)) if n == past_end
    ));
    assert_eq!(system.usage_all(), before);
}

#[test]
fn alignment_rounds_start_before_advancing() {
    let system = PoolSystem::init(platform(2), PoolSystemConfig::per_node(MIB)).unwrap();
    let node = NodeId::new(1);
    let base = system.usage(node).unwrap().base;

    system.alloc_on_node(node, 10, 1).unwrap();
    assert_eq!(system.usage(node).unwrap().offset, 10);

    let ptr = system.alloc_on_node(node, 4096, 64).unwrap();
    assert_eq!(ptr.as_ptr() as usize - base, 64);
    assert_eq!(system.usage(node).unwrap().offset, 64 + 4096);
}

#[test]
fn invalid_requests_are_rejected_without_mutation() {
    let system = PoolSystem::init(platform(1), PoolSystemConfig::per_node(MIB)).unwrap();
    let node = NodeId::new(0);

    assert!(matches!(
        system.alloc_on_node(node, 64, 48),
        Err(AllocError::InvalidAlignment(48))
    ));
    assert!(matches!(
        system.alloc_on_node(node, 0, 8),
        Err(AllocError::ZeroSize)
    ));
    assert!(matches!(
        system.alloc_on_node(node, MIB + 1, 8),
        Err(AllocError::PoolExhausted { .. })
    ));
    assert_eq!(system.usage(node).unwrap().offset, 0);
    assert_eq!(system.stats().snapshot().failed_requests, 3);
}

#[test]
fn concurrent_raw_allocations_stay_in_bounds() {
    let system = PoolSystem::init(platform(2), PoolSystemConfig::per_node(MIB)).unwrap();

    let addrs: Vec<(NodeId, usize)> = thread::scope(|s| {
        let handles: Vec<_> = (0..8u32)
            .map(|i| {
                let system = &system;
                s.spawn(move || {
                    let node = NodeId::new(i % 2);
                    system.bind_worker_to_node(node).unwrap();
                    let mut out = Vec::new();
                    while let Ok(ptr) = system.alloc_on_node(node, 1000, 64) {
                        out.push((node, ptr.as_ptr() as usize));
                    }
                    out
                })
            })
            .collect();
        handles.into_iter().flat_map(|h| h.join().unwrap()).collect()
    });

    let usage = system.usage_all();
    let used: usize = usage.iter().map(|u| u.offset).sum();
    let capacity: usize = usage.iter().map(|u| u.size).sum();
    assert!(used <= capacity);

    let mut starts: Vec<usize> = addrs.iter().map(|(_, a)| *a).collect();
    starts.sort_unstable();
    starts.dedup();
    assert_eq!(starts.len(), addrs.len());

    for (node, addr) in addrs {
        let u = system.usage(node).unwrap();
        assert!(addr >= u.base && addr + 1000 <= u.base + u.size);
        assert_eq!(addr % 64, 0);
    }
}

#[test]
fn sparse_nodes_are_keyed_by_id() {
    let platform = Arc::new(
        SimulatedPlatform::builder()
            .node_ids(&[0, 2, 5])
            .node_memory(4 * MIB as u64)
            .build(),
    );
    let system = PoolSystem::init(platform, PoolSystemConfig::per_node(MIB)).unwrap();

    assert_eq!(system.num_nodes(), 3);
    assert_eq!(
        system.nodes(),
        vec![NodeId::new(0), NodeId::new(2), NodeId::new(5)]
    );
    assert!(system.alloc_on_node(NodeId::new(5), 64, 64).is_ok());
    assert!(matches!(
        system.alloc_on_node(NodeId::new(1), 64, 64),
        Err(AllocError::OutOfRange(_))
    ));
}

#[test]
fn memory_only_node_initializes_unless_strict() {
    let platform = Arc::new(
        SimulatedPlatform::builder()
            .nodes(2)
            .memory_only_node(1)
            .node_memory(4 * MIB as u64)
            .build(),
    );

    let system = PoolSystem::init(platform.clone(), PoolSystemConfig::per_node(MIB)).unwrap();
    assert_eq!(system.num_nodes(), 2);
    drop(system);

    let strict = PoolSystemConfig {
        strict_affinity: true,
        ..PoolSystemConfig::per_node(MIB)
    };
    let err = PoolSystem::init(platform.clone(), strict).unwrap_err();
    assert!(matches!(err, AllocError::BindFailed { node, .. } if node == NodeId::new(1)));
    assert_eq!(platform.live_regions(), 0);
}

#[test]
fn oversized_pool_fails_capacity_check() {
    let platform = platform(2);
    let err =
        PoolSystem::init(platform.clone(), PoolSystemConfig::per_node(8 * MIB)).unwrap_err();
    assert!(matches!(
        err,
        AllocError::InsufficientCapacity { requested, .. } if requested == 8 * MIB as u64
    ));
    assert!(err.is_recoverable());
    assert_eq!(platform.live_regions(), 0);
}

#[test]
fn fraction_sizing_splits_total_memory() {
    let platform = platform(4);
    let config = PoolSystemConfig {
        sizing: PoolSizing::Fraction(0.5),
        ..PoolSystemConfig::default()
    };
    let system = PoolSystem::init(platform, config).unwrap();
    // 16 MiB total, half of it over four nodes.
    assert_eq!(system.pool_size(), 2 * MIB);
}

#[test]
#[ignore = "needs NUMA sysfs and enough RLIMIT_MEMLOCK"]
fn host_platform_round_trip() {
    let platform = host_platform();
    let system = PoolSystem::init(
        platform,
        PoolSystemConfig {
            prefault: true,
            ..PoolSystemConfig::per_node(4 * MIB)
        },
    )
    .unwrap();

    let nodes = system.nodes();
    for &node in &nodes {
        let ptr = system.alloc_on_node(node, 4096, 4096).unwrap();
        unsafe { ptr.as_ptr().write_bytes(0xAB, 4096) };
        assert_eq!(system.node_of(ptr.as_ptr() as usize), Some(node));
    }
    assert_eq!(system.destroy(), nodes.len());
}
