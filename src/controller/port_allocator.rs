use std::collections::BTreeSet;

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::shared::error::{LabError, LabResult};

/// Hands out host ports from a fixed inclusive range.
///
/// A port is either free or held by exactly one lab. Allocation of `n`
/// ports is all-or-nothing, and the lowest free ports are always chosen so
/// allocations are reproducible in tests.
pub struct PortAllocator {
    start: u16,
    end: u16,
    free: Mutex<BTreeSet<u16>>,
}

impl PortAllocator {
    pub fn new(start: u16, end: u16) -> Self {
        let free = if start <= end {
            (start..=end).collect()
        } else {
            BTreeSet::new()
        };
        Self {
            start,
            end,
            free: Mutex::new(free),
        }
    }

    pub async fn allocate(&self, n: usize) -> LabResult<Vec<u16>> {
        let mut free = self.free.lock().await;
        if free.len() < n {
            return Err(LabError::PortExhaustion {
                requested: n,
                available: free.len(),
            });
        }
        let ports: Vec<u16> = free.iter().take(n).copied().collect();
        for port in &ports {
            free.remove(port);
        }
        debug!("Allocated ports {:?} ({} left)", ports, free.len());
        Ok(ports)
    }

    /// Return ports to the pool. Releasing a free port is a no-op.
    pub async fn release(&self, ports: &[u16]) {
        let mut free = self.free.lock().await;
        for &port in ports {
            if port < self.start || port > self.end {
                warn!("Ignoring release of port {} outside the pool", port);
                continue;
            }
            free.insert(port);
        }
    }

    pub async fn is_free(&self, port: u16) -> bool {
        self.free.lock().await.contains(&port)
    }

    pub async fn free_count(&self) -> usize {
        self.free.lock().await.len()
    }

    pub fn capacity(&self) -> usize {
        if self.start <= self.end {
            usize::from(self.end - self.start) + 1
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[tokio::test]
    async fn allocates_lowest_free_ports() {
        let pool = PortAllocator::new(21000, 21009);
        assert_eq!(pool.allocate(3).await.unwrap(), vec![21000, 21001, 21002]);
        pool.release(&[21001]).await;
        assert_eq!(pool.allocate(2).await.unwrap(), vec![21001, 21003]);
        assert_eq!(pool.free_count().await, 6);
    }

    #[tokio::test]
    async fn exhaustion_holds_nothing() {
        let pool = PortAllocator::new(21000, 21002);
        pool.allocate(2).await.unwrap();
        let err = pool.allocate(2).await.unwrap_err();
        assert!(matches!(
            err,
            LabError::PortExhaustion {
                requested: 2,
                available: 1
            }
        ));
        assert_eq!(pool.free_count().await, 1);
        assert!(pool.is_free(21002).await);
    }

    #[tokio::test]
    async fn release_is_idempotent_and_ignores_foreign_ports() {
        let pool = PortAllocator::new(21000, 21004);
        let ports = pool.allocate(2).await.unwrap();
        pool.release(&ports).await;
        pool.release(&ports).await;
        pool.release(&[80, 65000]).await;
        assert_eq!(pool.free_count().await, pool.capacity());
    }

    #[tokio::test]
    async fn concurrent_allocations_never_overlap() {
        let pool = Arc::new(PortAllocator::new(21000, 21099));
        let mut handles = Vec::new();
        for _ in 0..20 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move { pool.allocate(5).await.unwrap() }));
        }
        let mut seen = HashSet::new();
        for handle in handles {
            for port in handle.await.unwrap() {
                assert!(seen.insert(port), "port {} handed out twice", port);
            }
        }
        assert_eq!(seen.len(), 100);
        assert!(pool.allocate(1).await.is_err());
    }
}
