use async_trait::async_trait;
use std::fmt;

use super::StoreResult;

/// Advisory locks shared by every process working on the same store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockId {
    /// Held while one process runs a build
    BuildTracking(u64),
    /// Held while one process checks a resource config scope
    ResourceConfigChecking(u64),
    /// Held while one process scans for checkables
    ResourceScanning,
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BuildTracking(id) => write!(f, "build-tracking:{id}"),
            Self::ResourceConfigChecking(id) => write!(f, "resource-config-checking:{id}"),
            Self::ResourceScanning => f.write_str("resource-scanning"),
        }
    }
}

/// A held advisory lock
#[async_trait]
pub trait Lock: Send + Sync + fmt::Debug {
    /// Releases the lock; releasing twice is a no-op
    async fn release(&self) -> StoreResult<()>;
}

/// Acquires advisory locks without blocking
#[async_trait]
pub trait LockFactory: Send + Sync {
    /// Tries to take `id`, returning `None` when someone else holds it
    async fn acquire(&self, id: LockId) -> StoreResult<Option<Box<dyn Lock>>>;
}
