//! Process-local store implementations.

mod build;
mod catalog;
mod lock;
mod resource_cache;
mod resource_config;

pub use build::{InMemoryBuild, InMemoryBuildStore};
pub use catalog::{InMemoryCatalog, InMemoryCheckable};
pub use lock::{InMemoryLock, InMemoryLockFactory};
pub use resource_cache::InMemoryResourceCacheFactory;
pub use resource_config::{InMemoryResourceConfigFactory, InMemoryScope};
