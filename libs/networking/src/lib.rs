//! Networking primitives for stackd.
//!
//! This library provides:
//! - [`NodePortRange`], a validated inclusive range of externally reachable ports
//! - [`PortAllocator`], exclusive allocation of ports out of that range
//!
//! The allocator is the only in-memory shared mutable state in the manager.
//! It is injected into whatever needs it; there is no global instance.

use std::collections::BTreeSet;
use std::sync::{Mutex, MutexGuard};

use thiserror::Error;
use tracing::{debug, info, warn};

/// Networking errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum NetworkError {
    /// Every port in the range is in use.
    #[error("no available node port in {min}-{max}")]
    NoAvailableNodePort { min: u16, max: u16 },

    /// The configured range is unusable.
    #[error("invalid node port range {min}-{max}: {reason}")]
    InvalidRange {
        min: u16,
        max: u16,
        reason: &'static str,
    },

    /// A port outside the range was offered to the allocator.
    #[error("port {port} is outside {min}-{max}")]
    OutOfRange { port: u16, min: u16, max: u16 },

    /// A port was reserved twice.
    #[error("port {0} is already allocated")]
    AlreadyAllocated(u16),
}

// ============================================================================
// Port range
// ============================================================================

/// Inclusive range `[min, max]` of node ports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodePortRange {
    min: u16,
    max: u16,
}

impl NodePortRange {
    /// Create a range; `min` must be non-zero and not above `max`.
    pub fn new(min: u16, max: u16) -> Result<Self, NetworkError> {
        if min == 0 {
            return Err(NetworkError::InvalidRange {
                min,
                max,
                reason: "port 0 is not allocatable",
            });
        }
        if min > max {
            return Err(NetworkError::InvalidRange {
                min,
                max,
                reason: "min is greater than max",
            });
        }
        Ok(Self { min, max })
    }

    /// Lowest port in the range.
    pub fn min(&self) -> u16 {
        self.min
    }

    /// Highest port in the range.
    pub fn max(&self) -> u16 {
        self.max
    }

    /// Number of ports in the range.
    pub fn size(&self) -> usize {
        usize::from(self.max - self.min) + 1
    }

    /// Check if a port is within this range.
    pub fn contains(&self, port: u16) -> bool {
        (self.min..=self.max).contains(&port)
    }
}

impl std::fmt::Display for NodePortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}-{}", self.min, self.max)
    }
}

// ============================================================================
// Allocator
// ============================================================================

/// Point-in-time view of allocator occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortUsage {
    pub min: u16,
    pub max: u16,
    pub capacity: usize,
    pub allocated: usize,
}

impl PortUsage {
    /// Ports still free.
    pub fn available(&self) -> usize {
        self.capacity.saturating_sub(self.allocated)
    }

    /// Fraction of the range in use, `0.0..=1.0`.
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            return 0.0;
        }
        self.allocated as f64 / self.capacity as f64
    }
}

/// Hands out exclusive node ports from a fixed range.
///
/// `allocate` always returns the lowest free port. All mutation happens under
/// one mutex, so two concurrent callers can never receive the same port.
#[derive(Debug)]
pub struct PortAllocator {
    range: NodePortRange,
    in_use: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    /// Create an allocator with every port in `range` free.
    pub fn new(range: NodePortRange) -> Self {
        info!(range = %range, "Creating node port allocator");
        Self {
            range,
            in_use: Mutex::new(BTreeSet::new()),
        }
    }

    /// The range this allocator serves.
    pub fn range(&self) -> NodePortRange {
        self.range
    }

    // A panic while holding the lock cannot leave the set half-updated (every
    // critical section is a single insert/remove), so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, BTreeSet<u16>> {
        self.in_use.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Allocate the lowest free port.
    ///
    /// On exhaustion nothing is mutated.
    pub fn allocate(&self) -> Result<u16, NetworkError> {
        let mut in_use = self.lock();

        // The set is ordered, so the first gap is found by walking it once.
        let mut candidate = self.range.min;
        for &used in in_use.iter() {
            if used != candidate {
                break;
            }
            if candidate == self.range.max {
                warn!(range = %self.range, "Node port range exhausted");
                return Err(NetworkError::NoAvailableNodePort {
                    min: self.range.min,
                    max: self.range.max,
                });
            }
            candidate += 1;
        }

        in_use.insert(candidate);
        debug!(port = candidate, allocated = in_use.len(), "Allocated node port");
        Ok(candidate)
    }

    /// Return a port to the pool.
    ///
    /// Releasing a port that is not allocated is a no-op. Returns whether the
    /// port was actually allocated.
    pub fn release(&self, port: u16) -> bool {
        let mut in_use = self.lock();
        let was_allocated = in_use.remove(&port);

        if was_allocated {
            debug!(port, allocated = in_use.len(), "Released node port");
        } else {
            debug!(port, "Release of unallocated node port ignored");
        }

        was_allocated
    }

    /// Mark a specific port as in use (restart recovery).
    pub fn reserve(&self, port: u16) -> Result<(), NetworkError> {
        if !self.range.contains(port) {
            return Err(NetworkError::OutOfRange {
                port,
                min: self.range.min,
                max: self.range.max,
            });
        }

        if !self.lock().insert(port) {
            return Err(NetworkError::AlreadyAllocated(port));
        }
        Ok(())
    }

    /// Check if a port is currently allocated.
    pub fn is_allocated(&self, port: u16) -> bool {
        self.lock().contains(&port)
    }

    /// Current occupancy.
    pub fn usage(&self) -> PortUsage {
        PortUsage {
            min: self.range.min,
            max: self.range.max,
            capacity: self.range.size(),
            allocated: self.lock().len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    use proptest::prelude::*;

    fn allocator(min: u16, max: u16) -> PortAllocator {
        PortAllocator::new(NodePortRange::new(min, max).unwrap())
    }

    #[test]
    fn test_range_validation() {
        assert!(NodePortRange::new(0, 10).is_err());
        assert!(NodePortRange::new(20, 10).is_err());
        let range = NodePortRange::new(30000, 30000).unwrap();
        assert_eq!(range.size(), 1);
        assert!(range.contains(30000));
        assert!(!range.contains(30001));
    }

    #[test]
    fn test_allocates_lowest_free_port() {
        let ports = allocator(30000, 30002);
        assert_eq!(ports.allocate().unwrap(), 30000);
        assert_eq!(ports.allocate().unwrap(), 30001);
        assert!(ports.release(30000));
        assert_eq!(ports.allocate().unwrap(), 30000);
        assert_eq!(ports.allocate().unwrap(), 30002);
    }

    #[test]
    fn test_exhaustion_does_not_mutate() {
        let ports = allocator(30000, 30001);
        ports.allocate().unwrap();
        ports.allocate().unwrap();

        let err = ports.allocate().unwrap_err();
        assert_eq!(
            err,
            NetworkError::NoAvailableNodePort {
                min: 30000,
                max: 30001
            }
        );
        assert_eq!(ports.usage().allocated, 2);
    }

    #[test]
    fn test_release_is_idempotent() {
        let ports = allocator(30000, 30001);
        let port = ports.allocate().unwrap();
        assert!(ports.release(port));
        assert!(!ports.release(port));
        assert!(!ports.release(12345));
        assert_eq!(ports.usage().allocated, 0);
    }

    #[test]
    fn test_top_of_u16_range() {
        let ports = allocator(65534, 65535);
        assert_eq!(ports.allocate().unwrap(), 65534);
        assert_eq!(ports.allocate().unwrap(), 65535);
        assert!(ports.allocate().is_err());
    }

    #[test]
    fn test_reserve() {
        let ports = allocator(30000, 30005);
        ports.reserve(30000).unwrap();
        ports.reserve(30002).unwrap();
        assert_eq!(ports.reserve(30002), Err(NetworkError::AlreadyAllocated(30002)));
        assert!(matches!(
            ports.reserve(29999),
            Err(NetworkError::OutOfRange { port: 29999, .. })
        ));
        assert_eq!(ports.allocate().unwrap(), 30001);
        assert_eq!(ports.allocate().unwrap(), 30003);
    }

    #[test]
    fn test_usage() {
        let ports = allocator(30000, 30003);
        ports.allocate().unwrap();
        let usage = ports.usage();
        assert_eq!(usage.capacity, 4);
        assert_eq!(usage.allocated, 1);
        assert_eq!(usage.available(), 3);
        assert!((usage.utilization() - 0.25).abs() < f64::EPSILON);
    }

    #[test]
    fn test_concurrent_allocations_are_unique() {
        let ports = Arc::new(allocator(30000, 30199));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let ports = Arc::clone(&ports);
                std::thread::spawn(move || {
                    (0..25).map(|_| ports.allocate().unwrap()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.join().unwrap() {
                assert!((30000..=30199).contains(&port));
                assert!(seen.insert(port), "port {port} handed out twice");
            }
        }
        assert_eq!(seen.len(), 200);
        assert!(ports.allocate().is_err());
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate,
        Release(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![Just(Op::Allocate), (0usize..16).prop_map(Op::Release)]
    }

    proptest! {
        #[test]
        fn prop_active_ports_are_unique_and_in_range(ops in proptest::collection::vec(op(), 0..200)) {
            let ports = allocator(40000, 40009);
            let mut active: Vec<u16> = Vec::new();

            for op in ops {
                match op {
                    Op::Allocate => match ports.allocate() {
                        Ok(port) => {
                            prop_assert!((40000..=40009).contains(&port));
                            prop_assert!(!active.contains(&port));
                            // Lowest free port.
                            let lowest = (40000..=40009).find(|p| !active.contains(p));
                            prop_assert_eq!(Some(port), lowest);
                            active.push(port);
                        }
                        Err(_) => prop_assert_eq!(active.len(), 10),
                    },
                    Op::Release(idx) => {
                        if !active.is_empty() {
                            let port = active.remove(idx % active.len());
                            prop_assert!(ports.release(port));
                        }
                    }
                }
                prop_assert_eq!(ports.usage().allocated, active.len());
            }
        }
    }
}
