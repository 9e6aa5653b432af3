//! Chain locks for prepare-to-commit exclusivity
//!
//! A transaction locks every node and relationship whose record it is about
//! to rewrite, from `prepare` until `commit` or `rollback`. Two transactions
//! touching unrelated nodes never contend. Locks are always taken in sorted
//! order so that concurrent preparers cannot deadlock.

use crate::{Error, Result};
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Resource type for locking
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ResourceType {
    /// Node resource
    Node,
    /// Relationship resource
    Relationship,
}

/// Resource identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceId {
    /// Resource type
    pub resource_type: ResourceType,
    /// Resource ID
    pub id: u64,
}

impl ResourceId {
    /// Create a new node resource ID
    pub fn node(id: u64) -> Self {
        Self {
            resource_type: ResourceType::Node,
            id,
        }
    }

    /// Create a new relationship resource ID
    pub fn relationship(id: u64) -> Self {
        Self {
            resource_type: ResourceType::Relationship,
            id,
        }
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.resource_type {
            ResourceType::Node => write!(f, "node {}", self.id),
            ResourceType::Relationship => write!(f, "relationship {}", self.id),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct LockHolder {
    tx_id: u64,
    depth: usize,
}

#[derive(Debug, Default)]
struct LockTable {
    held: Mutex<HashMap<ResourceId, LockHolder>>,
    released: Condvar,
}

/// Exclusive per-entity lock manager
#[derive(Debug, Clone)]
pub struct ChainLockManager {
    table: Arc<LockTable>,
    default_timeout: Duration,
}

impl Default for ChainLockManager {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

impl ChainLockManager {
    /// Create a lock manager whose acquisitions give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        Self {
            table: Arc::new(LockTable::default()),
            default_timeout: timeout,
        }
    }

    /// Acquire an exclusive lock; re-entrant for the holding transaction
    pub fn acquire(&self, tx_id: u64, resource: ResourceId) -> Result<ChainLockGuard> {
        self.acquire_with_timeout(tx_id, resource, self.default_timeout)
    }

    /// Acquire an exclusive lock with an explicit timeout
    pub fn acquire_with_timeout(
        &self,
        tx_id: u64,
        resource: ResourceId,
        timeout: Duration,
    ) -> Result<ChainLockGuard> {
        let deadline = Instant::now() + timeout;
        let mut held = self.table.held.lock();

        loop {
            match held.get_mut(&resource) {
                Some(holder) if holder.tx_id == tx_id => {
                    holder.depth += 1;
                    break;
                }
                Some(holder) => {
                    let holder_tx = holder.tx_id;
                    if self.table.released.wait_until(&mut held, deadline).timed_out() {
                        let holder_tx = held.get(&resource).map_or(holder_tx, |h| h.tx_id);
                        return Err(Error::LockTimeout(format!(
                            "tx {} gave up waiting for {} held by tx {}",
                            tx_id, resource, holder_tx
                        )));
                    }
                }
                None => {
                    held.insert(resource, LockHolder { tx_id, depth: 1 });
                    break;
                }
            }
        }

        Ok(ChainLockGuard {
            manager: self.clone(),
            tx_id,
            resource,
        })
    }

    /// Acquire locks on all `resources` in sorted order
    ///
    /// On failure every lock taken so far is released.
    pub fn acquire_all(&self, tx_id: u64, resources: &[ResourceId]) -> Result<Vec<ChainLockGuard>> {
        let mut sorted = resources.to_vec();
        sorted.sort_unstable();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for resource in sorted {
            // Dropping `guards` on the error path releases what we hold
            guards.push(self.acquire(tx_id, resource)?);
        }

        tracing::debug!("tx {} holds {} chain locks", tx_id, guards.len());
        Ok(guards)
    }

    fn release(&self, tx_id: u64, resource: ResourceId) {
        let mut held = self.table.held.lock();
        if let Some(holder) = held.get_mut(&resource) {
            if holder.tx_id != tx_id {
                return;
            }
            holder.depth -= 1;
            if holder.depth == 0 {
                held.remove(&resource);
                self.table.released.notify_all();
            }
        }
    }

    /// Transaction currently holding `resource`
    pub fn holder(&self, resource: ResourceId) -> Option<u64> {
        self.table.held.lock().get(&resource).map(|h| h.tx_id)
    }

    /// Get lock statistics
    pub fn stats(&self) -> LockStats {
        let held = self.table.held.lock();
        LockStats {
            total_resources: held.len(),
            node_locks: held
                .keys()
                .filter(|r| r.resource_type == ResourceType::Node)
                .count(),
            relationship_locks: held
                .keys()
                .filter(|r| r.resource_type == ResourceType::Relationship)
                .count(),
        }
    }
}

/// Lock guard that automatically releases the lock when dropped
pub struct ChainLockGuard {
    manager: ChainLockManager,
    tx_id: u64,
    resource: ResourceId,
}

impl ChainLockGuard {
    /// Locked resource
    pub fn resource(&self) -> ResourceId {
        self.resource
    }
}

impl fmt::Debug for ChainLockGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainLockGuard")
            .field("tx_id", &self.tx_id)
            .field("resource", &self.resource)
            .finish()
    }
}

impl Drop for ChainLockGuard {
    fn drop(&mut self) {
        self.manager.release(self.tx_id, self.resource);
    }
}

/// Lock statistics
#[derive(Debug, Clone)]
pub struct LockStats {
    /// Total number of locked resources
    pub total_resources: usize,
    /// Locked nodes
    pub node_locks: usize,
    /// Locked relationships
    pub relationship_locks: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_lock_exclusivity() {
        let manager = ChainLockManager::default();
        let resource = ResourceId::node(1);

        let guard1 = manager.acquire(1, resource).unwrap();

        let result = manager.acquire_with_timeout(2, resource, Duration::from_millis(50));
        assert!(matches!(result, Err(Error::LockTimeout(_))));

        drop(guard1);
        assert!(manager.acquire(2, resource).is_ok());
    }

    #[test]
    fn test_timeout_names_the_holder() {
        let manager = ChainLockManager::default();
        let resource = ResourceId::node(4);
        let _guard = manager.acquire(17, resource).unwrap();

        let err = manager
            .acquire_with_timeout(23, resource, Duration::from_millis(20))
            .unwrap_err();
        let message = err.to_string();
        assert!(message.contains("held by tx 17"), "{}", message);
        assert!(message.contains("tx 23 gave up"), "{}", message);
    }

    #[test]
    fn test_reentrant_for_same_tx() {
        let manager = ChainLockManager::default();
        let resource = ResourceId::relationship(9);

        let outer = manager.acquire(7, resource).unwrap();
        let inner = manager.acquire(7, resource).unwrap();
        drop(inner);
        assert_eq!(manager.holder(resource), Some(7));
        drop(outer);
        assert_eq!(manager.holder(resource), None);
    }

    #[test]
    fn test_multiple_resources() {
        let manager = ChainLockManager::default();

        let guard1 = manager.acquire(1, ResourceId::node(1)).unwrap();
        let guard2 = manager.acquire(2, ResourceId::node(2)).unwrap();
        let guard3 = manager.acquire(3, ResourceId::relationship(1)).unwrap();

        let stats = manager.stats();
        assert_eq!(stats.total_resources, 3);
        assert_eq!(stats.node_locks, 2);
        assert_eq!(stats.relationship_locks, 1);

        drop(guard1);
        drop(guard2);
        drop(guard3);
        assert_eq!(manager.stats().total_resources, 0);
    }

    #[test]
    fn test_acquire_all_sorts_and_dedups() {
        let manager = ChainLockManager::default();
        let resources = vec![
            ResourceId::relationship(4),
            ResourceId::node(3),
            ResourceId::node(1),
            ResourceId::node(3),
        ];

        let guards = manager.acquire_all(1, &resources).unwrap();
        let order: Vec<_> = guards.iter().map(|g| g.resource()).collect();
        assert_eq!(
            order,
            vec![
                ResourceId::node(1),
                ResourceId::node(3),
                ResourceId::relationship(4)
            ]
        );
    }

    #[test]
    fn test_acquire_all_releases_on_failure() {
        let manager = ChainLockManager::new(Duration::from_millis(50));
        let _blocker = manager.acquire(1, ResourceId::node(2)).unwrap();

        let result = manager.acquire_all(2, &[ResourceId::node(1), ResourceId::node(2)]);
        assert!(result.is_err());
        assert_eq!(manager.holder(ResourceId::node(1)), None);
    }

    #[test]
    fn test_waiter_wakes_on_release() {
        let manager = ChainLockManager::default();
        let guard = manager.acquire(1, ResourceId::node(5)).unwrap();

        let waiter = {
            let manager = manager.clone();
            thread::spawn(move || manager.acquire(2, ResourceId::node(5)).map(|_| ()))
        };

        thread::sleep(Duration::from_millis(20));
        drop(guard);
        assert!(waiter.join().unwrap().is_ok());
    }
}
