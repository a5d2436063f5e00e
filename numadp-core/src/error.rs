use std::io;

use thiserror::Error;

use crate::block::SizeClass;
use crate::topology::NodeId;

/// How a caller is expected to react to an [`AllocError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// The platform or a node cannot support the allocator; startup must stop.
    Fatal,
    /// The caller passed an invalid argument or misused the registry.
    CallerBug,
    /// Resource pressure or degraded locality; back off, retry elsewhere or shrink the request.
    Recoverable,
}

#[derive(Debug, Error)]
pub enum AllocError {
    #[error("NUMA is not available on this platform")]
    NumaUnavailable,

    #[error("Topology probe failed: {0}")]
    Topology(String),

    #[error("Node {0} is not managed by this pool system")]
    OutOfRange(NodeId),

    #[error("Invalid size class: {0}")]
    InvalidSizeClass(String),

    #[error("Alignment {0} is not a power of two")]
    InvalidAlignment(usize),

    #[error("Zero-sized allocation requested")]
    ZeroSize,

    #[error("Configured pool size resolves to zero bytes per node")]
    InvalidPoolSize,

    #[error("Node {node} has {free} free bytes, {requested} requested")]
    InsufficientCapacity {
        node: NodeId,
        requested: u64,
        free: u64,
    },

    #[error("Pool on node {node} exhausted: {requested} bytes requested, {remaining} remaining")]
    PoolExhausted {
        node: NodeId,
        requested: usize,
        remaining: usize,
    },

    #[error("No free {class} blocks on node {node}")]
    ClassExhausted { node: NodeId, class: SizeClass },

    #[error("No size class fits a {0} byte request")]
    NoFittingClass(usize),

    #[error("Failed to acquire memory on node {node}: {source}")]
    AcquireFailed {
        node: NodeId,
        #[source]
        source: io::Error,
    },

    #[error("Failed to pin memory on node {node}: {source}")]
    PinFailed {
        node: NodeId,
        #[source]
        source: io::Error,
    },

    #[error("Failed to bind thread to node {node}: {reason}")]
    BindFailed { node: NodeId, reason: String },

    #[error("Address {0:#x} is not a block managed by this allocator")]
    UnknownPointer(usize),

    #[error("Block at {0:#x} is already free")]
    DoubleFree(usize),

    #[error("Failed to spawn initialization worker for node {node}: {source}")]
    SpawnFailed {
        node: NodeId,
        #[source]
        source: io::Error,
    },

    #[error("Initialization worker for node {0} panicked")]
    InitWorkerPanicked(NodeId),
}

impl AllocError {
    pub fn severity(&self) -> Severity {
        match self {
            AllocError::NumaUnavailable
            | AllocError::Topology(_)
            | AllocError::InvalidPoolSize
            | AllocError::AcquireFailed { .. }
            | AllocError::PinFailed { .. }
            | AllocError::SpawnFailed { .. }
            | AllocError::InitWorkerPanicked(_) => Severity::Fatal,
            AllocError::OutOfRange(_)
            | AllocError::InvalidSizeClass(_)
            | AllocError::InvalidAlignment(_)
            | AllocError::ZeroSize
            | AllocError::NoFittingClass(_)
            | AllocError::UnknownPointer(_)
            | AllocError::DoubleFree(_) => Severity::CallerBug,
            AllocError::InsufficientCapacity { .. }
            | AllocError::PoolExhausted { .. }
            | AllocError::ClassExhausted { .. }
            | AllocError::BindFailed { .. } => Severity::Recoverable,
        }
    }

    #[inline]
    pub fn is_recoverable(&self) -> bool {
        self.severity() == Severity::Recoverable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_classification() {
        assert_eq!(AllocError::NumaUnavailable.severity(), Severity::Fatal);
        assert_eq!(
            AllocError::OutOfRange(NodeId::new(3)).severity(),
            Severity::CallerBug
        );
        assert!(AllocError::ClassExhausted {
            node: NodeId::new(0),
            class: SizeClass::Small,
        }
        .is_recoverable());
        assert!(!AllocError::DoubleFree(0x1000).is_recoverable());
    }

    #[test]
    fn test_error_messages() {
        let err = AllocError::PoolExhausted {
            node: NodeId::new(1),
            requested: 4096,
            remaining: 10,
        };
        assert_eq!(
            err.to_string(),
            "Pool on node 1 exhausted: 4096 bytes requested, 10 remaining"
        );
        assert_eq!(
            AllocError::UnknownPointer(0xdead000).to_string(),
            "Address 0xdead000 is not a block managed by this allocator"
        );
    }
}
