use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::db::{Lock, LockFactory, LockId, StoreResult};

/// Locks held in a shared map; dropping a lock releases it
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockFactory {
    held: Arc<DashMap<LockId, ()>>,
}

impl InMemoryLockFactory {
    /// Creates a factory with no locks held
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `id` is currently held
    #[must_use]
    pub fn is_held(&self, id: &LockId) -> bool {
        self.held.contains_key(id)
    }

    /// Tries to take `id`
    #[must_use]
    pub fn try_acquire(&self, id: LockId) -> Option<InMemoryLock> {
        match self.held.entry(id.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(());
                Some(InMemoryLock {
                    id,
                    held: Arc::clone(&self.held),
                    released: AtomicBool::new(false),
                })
            }
        }
    }
}

#[async_trait]
impl LockFactory for InMemoryLockFactory {
    async fn acquire(&self, id: LockId) -> StoreResult<Option<Box<dyn Lock>>> {
        Ok(self
            .try_acquire(id)
            .map(|lock| Box::new(lock) as Box<dyn Lock>))
    }
}

/// A lock taken from an [`InMemoryLockFactory`]
#[derive(Debug)]
pub struct InMemoryLock {
    id: LockId,
    held: Arc<DashMap<LockId, ()>>,
    released: AtomicBool,
}

impl InMemoryLock {
    fn unlock(&self) {
        if !self.released.swap(true, Ordering::SeqCst) {
            self.held.remove(&self.id);
        }
    }
}

#[async_trait]
impl Lock for InMemoryLock {
    async fn release(&self) -> StoreResult<()> {
        self.unlock();
        Ok(())
    }
}

impl Drop for InMemoryLock {
    fn drop(&mut self) {
        self.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_acquire_is_refused_until_release() {
        let locks = InMemoryLockFactory::new();
        let id = LockId::ResourceConfigChecking(3);

        let first = locks.acquire(id.clone()).await.expect("store ok");
        assert!(first.is_some());
        assert!(locks.acquire(id.clone()).await.expect("store ok").is_none());

        first.expect("held").release().await.expect("released");
        assert!(!locks.is_held(&id));
        assert!(locks.acquire(id).await.expect("store ok").is_some());
    }

    #[test]
    fn dropping_releases() {
        let locks = InMemoryLockFactory::new();
        let id = LockId::BuildTracking(1);
        {
            let _held = locks.try_acquire(id.clone()).expect("free");
            assert!(locks.is_held(&id));
        }
        assert!(!locks.is_held(&id));
    }

    #[tokio::test]
    async fn double_release_does_not_free_a_new_holder() {
        let locks = InMemoryLockFactory::new();
        let id = LockId::ResourceScanning;

        let first = locks.try_acquire(id.clone()).expect("free");
        first.release().await.expect("released");
        let _second = locks.try_acquire(id.clone()).expect("free again");
        first.release().await.expect("no-op");
        assert!(locks.is_held(&id));
    }
}
