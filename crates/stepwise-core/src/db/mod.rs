//! Store contracts.
//!
//! Builds, pipelines, resource configs and locks are owned by an external
//! store. The engine and scheduler only see the traits below; `memory`
//! provides process-local implementations used by tests and single-node
//! setups.

mod build;
mod catalog;
mod lock;
pub mod memory;
mod resource_cache;
mod resource_config;

pub use build::{Build, BuildStore};
pub use catalog::{Checkable, CheckableKind, ResourceCatalog};
pub use lock::{Lock, LockFactory, LockId};
pub use resource_cache::{ResourceCache, ResourceCacheFactory, ResourceCacheUser};
pub use resource_config::{
    ResourceConfig, ResourceConfigFactory, ResourceConfigScope, ResourceConfigVersion, ResourceKey,
};

/// Store errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    /// The requested record does not exist
    #[error("{what} not found")]
    NotFound {
        /// Description of the missing record
        what: String,
    },

    /// A write conflicted with concurrent state
    #[error("conflict: {reason}")]
    Conflict {
        /// What conflicted
        reason: String,
    },

    /// The backing store failed
    #[error("store unavailable: {reason}")]
    Unavailable {
        /// Underlying failure
        reason: String,
    },
}

impl StoreError {
    /// Creates a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }
}

/// Result type for store operations
pub type StoreResult<T = ()> = Result<T, StoreError>;
