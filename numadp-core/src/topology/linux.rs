//! Linux backend: topology from sysfs, memory placement and pinning through
//! `libc`.

use std::ffi::c_void;
use std::fs;
use std::io;
use std::mem;
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

use tracing::debug;

use super::{CpuSet, NodeCapacity, NodeId, NumaPlatform};
use crate::error::AllocError;

const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";
const FALLBACK_PAGE_SIZE: usize = 4096;

// <linux/mempolicy.h>
const MPOL_BIND: libc::c_int = 2;
const MPOL_MF_STRICT: libc::c_uint = 1;

/// NUMA platform backed by the running Linux kernel.
#[derive(Debug, Clone)]
pub struct LinuxPlatform {
    root: PathBuf,
    page_size: usize,
}

impl LinuxPlatform {
    pub fn new() -> Self {
        Self::with_sysfs_root(SYSFS_NODE_ROOT)
    }

    /// Reads topology from `root` instead of `/sys/devices/system/node`.
    pub fn with_sysfs_root<P: AsRef<Path>>(root: P) -> Self {
        // SAFETY: sysconf has no memory-safety preconditions.
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        let page_size = if page_size > 0 {
            page_size as usize
        } else {
            FALLBACK_PAGE_SIZE
        };

        Self {
            root: root.as_ref().to_path_buf(),
            page_size,
        }
    }

    fn node_file(&self, node: NodeId, name: &str) -> PathBuf {
        self.root.join(format!("node{}", node.id())).join(name)
    }

    fn read_node_file(&self, node: NodeId, name: &str) -> Result<String, AllocError> {
        let path = self.node_file(node, name);
        fs::read_to_string(&path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AllocError::OutOfRange(node),
            _ => AllocError::Topology(format!("{}: {e}", path.display())),
        })
    }

    /// Fallback for kernels without `node/online`: enumerate `node<N>` directories.
    fn scan_node_dirs(&self) -> Result<Vec<NodeId>, AllocError> {
        let entries = fs::read_dir(&self.root)
            .map_err(|e| AllocError::Topology(format!("{}: {e}", self.root.display())))?;

        let mut nodes: Vec<NodeId> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .and_then(|name| name.strip_prefix("node"))
                    .and_then(|id| id.parse::<u32>().ok())
            })
            .map(NodeId::new)
            .collect();
        nodes.sort_unstable();
        Ok(nodes)
    }
}

impl Default for LinuxPlatform {
    fn default() -> Self {
        Self::new()
    }
}

/// Extracts `MemTotal` and `MemFree` from a per-node `meminfo` file.
///
/// Lines look like `Node 0 MemTotal:       32768000 kB`.
pub fn parse_node_meminfo(content: &str) -> Option<NodeCapacity> {
    let mut total = None;
    let mut free = None;

    for line in content.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            continue;
        }
        let kib = match fields[3].parse::<u64>() {
            Ok(kib) => kib,
            Err(_) => continue,
        };
        match fields[2] {
            "MemTotal:" => total = Some(kib * 1024),
            "MemFree:" => free = Some(kib * 1024),
            _ => {}
        }
    }

    Some(NodeCapacity {
        total_bytes: total?,
        free_bytes: free?,
    })
}

/// Builds an `mbind` node mask with only `node` set.
fn node_mask(node: NodeId) -> Vec<libc::c_ulong> {
    let bits = libc::c_ulong::BITS as usize;
    let mut mask = vec![0 as libc::c_ulong; node.index() / bits + 1];
    mask[node.index() / bits] |= 1 << (node.index() % bits);
    mask
}

impl NumaPlatform for LinuxPlatform {
    fn is_numa_available(&self) -> bool {
        self.online_nodes()
            .map(|nodes| !nodes.is_empty())
            .unwrap_or(false)
    }

    fn online_nodes(&self) -> Result<Vec<NodeId>, AllocError> {
        match fs::read_to_string(self.root.join("online")) {
            Ok(list) => Ok(CpuSet::parse(&list)?
                .iter()
                .map(|id| NodeId::new(id as u32))
                .collect()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => self.scan_node_dirs(),
            Err(e) => Err(AllocError::Topology(format!("node/online: {e}"))),
        }
    }

    fn node_capacity(&self, node: NodeId) -> Result<NodeCapacity, AllocError> {
        let content = self.read_node_file(node, "meminfo")?;
        parse_node_meminfo(&content).ok_or_else(|| {
            AllocError::Topology(format!("node{}/meminfo lacks MemTotal/MemFree", node))
        })
    }

    fn node_cpus(&self, node: NodeId) -> Result<CpuSet, AllocError> {
        CpuSet::parse(&self.read_node_file(node, "cpulist")?)
    }

    fn total_memory(&self) -> Option<u64> {
        // SAFETY: sysconf has no memory-safety preconditions.
        let pages = unsafe { libc::sysconf(libc::_SC_PHYS_PAGES) };
        if pages <= 0 {
            return None;
        }
        Some(pages as u64 * self.page_size as u64)
    }

    fn page_size(&self) -> usize {
        self.page_size
    }

    fn current_cpu(&self) -> Option<usize> {
        // SAFETY: sched_getcpu takes no arguments.
        let cpu = unsafe { libc::sched_getcpu() };
        (cpu >= 0).then_some(cpu as usize)
    }

    fn set_affinity(&self, node: NodeId, cpus: &CpuSet) -> Result<(), AllocError> {
        let width = 8 * mem::size_of::<libc::cpu_set_t>();

        // SAFETY: cpu_set_t is plain data; all-zero is the empty set.
        let mut set: libc::cpu_set_t = unsafe { mem::zeroed() };
        for cpu in cpus.iter() {
            if cpu >= width {
                return Err(AllocError::BindFailed {
                    node,
                    reason: format!("cpu {cpu} exceeds affinity mask width {width}"),
                });
            }
            // SAFETY: cpu is below the bit width of `set`.
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }

        // SAFETY: `set` is a fully initialised cpu_set_t of the size passed; pid 0 is the caller.
        let rc = unsafe { libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &set) };
        if rc != 0 {
            return Err(AllocError::BindFailed {
                node,
                reason: io::Error::last_os_error().to_string(),
            });
        }
        Ok(())
    }

    fn acquire_on_node(&self, node: NodeId, size: usize) -> Result<NonNull<u8>, AllocError> {
        // SAFETY: anonymous private mapping with a kernel-chosen address; the
        // result is checked against MAP_FAILED before use.
        let addr = unsafe {
            libc::mmap(
                ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if addr == libc::MAP_FAILED {
            return Err(AllocError::AcquireFailed {
                node,
                source: io::Error::last_os_error(),
            });
        }

        let mask = node_mask(node);
        // The kernel drops the last bit of maxnode, hence the +1.
        let maxnode = (mask.len() * libc::c_ulong::BITS as usize + 1) as libc::c_ulong;

        // SAFETY: addr/size describe the mapping created above; mask outlives the call.
        let rc = unsafe {
            libc::syscall(
                libc::SYS_mbind,
                addr,
                size,
                MPOL_BIND,
                mask.as_ptr(),
                maxnode,
                MPOL_MF_STRICT,
            )
        };
        if rc != 0 {
            let source = io::Error::last_os_error();
            // SAFETY: unmapping the region we just mapped; nothing else references it.
            unsafe { libc::munmap(addr, size) };
            return Err(AllocError::AcquireFailed { node, source });
        }

        debug!(node = %node, size, "mapped and bound region");
        NonNull::new(addr.cast::<u8>()).ok_or_else(|| AllocError::AcquireFailed {
            node,
            source: io::Error::new(io::ErrorKind::OutOfMemory, "mmap returned null"),
        })
    }

    fn pin(&self, node: NodeId, base: NonNull<u8>, size: usize) -> Result<(), AllocError> {
        // SAFETY: base/size describe a live mapping owned by the caller.
        let rc = unsafe { libc::mlock(base.as_ptr() as *const c_void, size) };
        if rc != 0 {
            return Err(AllocError::PinFailed {
                node,
                source: io::Error::last_os_error(),
            });
        }
        Ok(())
    }

    fn unpin(&self, base: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: munlock only changes residency of the caller's mapping.
        let rc = unsafe { libc::munlock(base.as_ptr() as *const c_void, size) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    unsafe fn release(&self, base: NonNull<u8>, size: usize) -> io::Result<()> {
        // SAFETY: upheld by the caller per the trait contract.
        let rc = unsafe { libc::munmap(base.as_ptr() as *mut c_void, size) };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
