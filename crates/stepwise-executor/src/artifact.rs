//! The artifact repository.
//!
//! Steps register the artifacts they produce under a logical name, and
//! later steps look them up by that name. Scopes nest: a local scope sees
//! its parent's artifacts, but registering into it never touches the
//! parent.

use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::Arc;

/// An opaque handle to data produced by a step
pub trait Artifact: fmt::Debug + Send + Sync {
    /// Identity of the underlying data, e.g. a volume handle
    fn id(&self) -> &str;
}

/// A shared artifact handle
pub type ArtifactHandle = Arc<dyn Artifact>;

/// An artifact backed by a worker volume
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeArtifact {
    handle: String,
}

impl VolumeArtifact {
    /// Wraps a volume handle
    pub fn new(handle: impl Into<String>) -> Self {
        Self {
            handle: handle.into(),
        }
    }
}

impl Artifact for VolumeArtifact {
    fn id(&self) -> &str {
        &self.handle
    }
}

/// Artifacts visible to a step, by name
#[derive(Debug, Default)]
pub struct ArtifactRepository {
    artifacts: RwLock<HashMap<String, ArtifactHandle>>,
    parent: Option<Arc<ArtifactRepository>>,
}

impl ArtifactRepository {
    /// Creates an empty root scope
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a scope that falls back to `self` on lookups
    #[must_use]
    pub fn new_local_scope(self: &Arc<Self>) -> Arc<Self> {
        Arc::new(Self {
            artifacts: RwLock::default(),
            parent: Some(Arc::clone(self)),
        })
    }

    /// The enclosing scope
    #[must_use]
    pub fn parent(&self) -> Option<&Arc<Self>> {
        self.parent.as_ref()
    }

    /// Registers `artifact` under `name` in this scope
    pub fn register_artifact(&self, name: impl Into<String>, artifact: ArtifactHandle) {
        let name = name.into();
        tracing::debug!(artifact = %name, id = artifact.id(), "registering artifact");
        self.artifacts.write().insert(name, artifact);
    }

    /// Looks up `name` here, then in enclosing scopes
    #[must_use]
    pub fn artifact_for(&self, name: &str) -> Option<ArtifactHandle> {
        if let Some(artifact) = self.artifacts.read().get(name) {
            return Some(Arc::clone(artifact));
        }
        self.parent.as_ref().and_then(|parent| parent.artifact_for(name))
    }

    /// Every visible artifact; local names shadow enclosing ones
    #[must_use]
    pub fn as_map(&self) -> BTreeMap<String, ArtifactHandle> {
        let mut visible = self
            .parent
            .as_ref()
            .map(|parent| parent.as_map())
            .unwrap_or_default();
        for (name, artifact) in self.artifacts.read().iter() {
            visible.insert(name.clone(), Arc::clone(artifact));
        }
        visible
    }
}
