//! Resource catalog model.
//!
//! Resources and resource types as declared in a pipeline, the versions
//! they produce, and the inputs a scheduler hands to a build.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use crate::plan::{CheckPlan, GetPlan, Plan, PlanFactory, PlanId, PlanKind};

/// A resource version: an ordered set of string key/value pairs
pub type Version = BTreeMap<String, String>;

/// Resource source configuration, passed verbatim to resource scripts
pub type Source = serde_json::Map<String, Value>;

/// Step parameters, passed verbatim to resource scripts or tasks
pub type Params = serde_json::Map<String, Value>;

/// Prefix of the artifact name an image-producing plan registers under
pub const IMAGE_ARTIFACT_PREFIX: &str = "type:";

/// Name of the artifact an image-producing plan registers for `type_name`
#[must_use]
pub fn image_artifact_name(type_name: &str) -> String {
    format!("{IMAGE_ARTIFACT_PREFIX}{type_name}")
}

/// One metadata entry reported alongside a version
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataField {
    /// Field name
    pub name: String,
    /// Field value
    pub value: String,
}

/// A version plus the metadata a resource script reported for it
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct VersionResult {
    /// The version
    pub version: Version,
    /// Metadata reported with the version
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub metadata: Vec<MetadataField>,
}

impl VersionResult {
    /// Creates a result with no metadata
    #[must_use]
    pub fn new(version: Version) -> Self {
        Self {
            version,
            metadata: Vec::new(),
        }
    }
}

/// A resource declared in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// Resource name, unique within the pipeline
    pub name: String,
    /// Resource type name (base or custom)
    #[serde(rename = "type")]
    pub type_name: String,
    /// Source configuration
    #[serde(default)]
    pub source: Source,
    /// Worker tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Explicit check interval, overriding the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_every: Option<String>,
    /// Explicit check timeout, overriding the default
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_timeout: Option<String>,
    /// Webhook token; resources with webhooks are checked less often
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_token: Option<String>,
    /// Version pinned in configuration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

impl Resource {
    /// Creates a resource with an empty source
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            source: Source::new(),
            tags: Vec::new(),
            check_every: None,
            check_timeout: None,
            webhook_token: None,
            version: None,
        }
    }

    /// Sets the source configuration
    #[must_use]
    pub fn with_source(mut self, source: Source) -> Self {
        self.source = source;
        self
    }

    /// Sets the check interval
    #[must_use]
    pub fn with_check_every(mut self, interval: impl Into<String>) -> Self {
        self.check_every = Some(interval.into());
        self
    }
}

/// The resources a plan is compiled against, looked up by name
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NamedResources(pub Vec<Resource>);

impl NamedResources {
    /// Finds a resource by name
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&Resource> {
        self.0.iter().find(|resource| resource.name == name)
    }
}

impl FromIterator<Resource> for NamedResources {
    fn from_iter<I: IntoIterator<Item = Resource>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A custom resource type declared in a pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceType {
    /// Type name, referenced by resources' `type`
    pub name: String,
    /// The type this type's image is fetched with
    #[serde(rename = "type")]
    pub type_name: String,
    /// Source configuration for fetching the image
    #[serde(default)]
    pub source: Source,
    /// Whether containers of this type run privileged
    #[serde(default)]
    pub privileged: bool,
    /// Worker tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
    /// Params used when fetching the image
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub params: Params,
    /// Explicit check interval
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub check_every: Option<String>,
}

impl ResourceType {
    /// Creates a resource type with an empty source
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
            source: Source::new(),
            privileged: false,
            tags: Vec::new(),
            params: Params::new(),
            check_every: None,
        }
    }
}

/// A resource type together with its latest known version, if any
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionedResourceType {
    /// The declared type
    #[serde(flatten)]
    pub resource_type: ResourceType,
    /// Latest version of the type's image, when one has been checked
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<Version>,
}

impl VersionedResourceType {
    /// Pairs a type with an optional version
    #[must_use]
    pub fn new(resource_type: ResourceType, version: Option<Version>) -> Self {
        Self {
            resource_type,
            version,
        }
    }

    /// The type's name
    #[must_use]
    pub fn name(&self) -> &str {
        &self.resource_type.name
    }
}

/// The custom types visible to a pipeline
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VersionedResourceTypes(pub Vec<VersionedResourceType>);

impl VersionedResourceTypes {
    /// Finds a type by name
    #[must_use]
    pub fn lookup(&self, name: &str) -> Option<&VersionedResourceType> {
        self.0.iter().find(|t| t.name() == name)
    }

    /// All types except `name`
    ///
    /// A type may shadow a base type of the same name, so its own image is
    /// resolved against the remaining types only.
    #[must_use]
    pub fn without(&self, name: &str) -> Self {
        Self(self.0.iter().filter(|t| t.name() != name).cloned().collect())
    }

    /// True when no custom types are declared
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterates over the declared types
    pub fn iter(&self) -> impl Iterator<Item = &VersionedResourceType> {
        self.0.iter()
    }

    /// Builds the plan producing the image for a custom type.
    ///
    /// Returns `None` when `type_name` is a base type. When the custom type
    /// has no known version, the plan checks it first and fetches the
    /// version the check found.
    #[must_use]
    pub fn image_plan(&self, type_name: &str, factory: &PlanFactory) -> Option<Plan> {
        let parent = self.lookup(type_name)?;
        let declared = &parent.resource_type;
        let ancestors = self.without(type_name);
        let artifact = image_artifact_name(type_name);

        let check = if parent.version.is_none() {
            let (plan, id) = ancestors.with_image(&declared.type_name, factory, |image| {
                PlanKind::Check(CheckPlan {
                    name: artifact.clone(),
                    resource_type: Some(declared.name.clone()),
                    type_name: declared.type_name.clone(),
                    image_artifact_name: image,
                    source: declared.source.clone(),
                    tags: declared.tags.clone(),
                    interval: declared.check_every.clone().unwrap_or_default(),
                    resource_types: ancestors.clone(),
                    ..CheckPlan::default()
                })
            });
            Some((plan, id))
        } else {
            None
        };

        let version_from = check.as_ref().map(|(_, id)| id.clone());
        let (get, _) = ancestors.with_image(&declared.type_name, factory, |image| {
            PlanKind::Get(GetPlan {
                name: artifact.clone(),
                resource: None,
                type_name: declared.type_name.clone(),
                image_artifact_name: image,
                source: declared.source.clone(),
                params: declared.params.clone(),
                tags: declared.tags.clone(),
                version: parent.version.clone(),
                version_from,
                resource_types: ancestors.clone(),
                image: true,
            })
        });

        Some(match check {
            Some((check, _)) => factory.new_plan(PlanKind::Do(vec![check, get])),
            None => get,
        })
    }

    /// Builds a plan node that runs on an image of `type_name`.
    ///
    /// For custom types the node is sequenced after the image plan,
    /// and `kind` is handed the artifact name to read the image from. For
    /// base types `kind` receives `None`. Returns the outer plan and the ID
    /// of the node built from `kind`.
    pub fn with_image(
        &self,
        type_name: &str,
        factory: &PlanFactory,
        kind: impl FnOnce(Option<String>) -> PlanKind,
    ) -> (Plan, PlanId) {
        match self.image_plan(type_name, factory) {
            Some(image) => {
                let inner = factory.new_plan(kind(Some(image_artifact_name(type_name))));
                let id = inner.id.clone();
                (factory.new_plan(PlanKind::Do(vec![image, inner])), id)
            }
            None => {
                let plan = factory.new_plan(kind(None));
                let id = plan.id.clone();
                (plan, id)
            }
        }
    }
}

impl FromIterator<VersionedResourceType> for VersionedResourceTypes {
    fn from_iter<I: IntoIterator<Item = VersionedResourceType>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// A version the scheduler decided a build should fetch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInput {
    /// The get step's name
    pub name: String,
    /// The decided version
    pub version: Version,
}

impl BuildInput {
    /// Creates a build input
    pub fn new(name: impl Into<String>, version: Version) -> Self {
        Self {
            name: name.into(),
            version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn version(v: &str) -> Version {
        Version::from([("ref".to_string(), v.to_string())])
    }

    fn types() -> VersionedResourceTypes {
        VersionedResourceTypes(vec![
            VersionedResourceType::new(ResourceType::new("custom", "registry-image"), Some(version("1"))),
            VersionedResourceType::new(ResourceType::new("nested", "custom"), None),
        ])
    }

    #[test]
    fn base_types_have_no_image_plan() {
        let factory = PlanFactory::new(0);
        assert!(types().image_plan("git", &factory).is_none());
    }

    #[test]
    fn versioned_custom_type_fetches_its_image_directly() {
        let factory = PlanFactory::new(0);
        let plan = types().image_plan("custom", &factory).expect("custom type");
        match &plan.kind {
            PlanKind::Get(get) => {
                assert_eq!(get.name, "type:custom");
                assert_eq!(get.type_name, "registry-image");
                assert_eq!(get.version, Some(version("1")));
                assert!(get.image_artifact_name.is_none());
                assert!(get.image);
            }
            other => panic!("expected get, got {other:?}"),
        }
    }

    #[test]
    fn unversioned_type_is_checked_before_fetching() {
        let factory = PlanFactory::new(0);
        let plan = types().image_plan("nested", &factory).expect("custom type");
        let PlanKind::Do(outer) = &plan.kind else {
            panic!("expected check then get, got {:?}", plan.kind);
        };
        assert_eq!(outer.len(), 2);

        // both the check and the get run on the image of `custom`
        let PlanKind::Do(check_with_image) = &outer[0].kind else {
            panic!("expected image plan before the check");
        };
        let PlanKind::Get(image) = &check_with_image[0].kind else {
            panic!("expected image get");
        };
        assert!(image.image);
        let PlanKind::Check(check) = &check_with_image[1].kind else {
            panic!("expected check");
        };
        assert_eq!(check.resource_type.as_deref(), Some("nested"));
        assert_eq!(check.image_artifact_name.as_deref(), Some("type:custom"));

        let PlanKind::Do(get_with_image) = &outer[1].kind else {
            panic!("expected image plan before the get");
        };
        let PlanKind::Get(get) = &get_with_image[1].kind else {
            panic!("expected get");
        };
        assert!(!get.image);
        assert_eq!(get.version_from.as_ref(), Some(&check_with_image[1].id));
        assert!(get.resource_types.lookup("nested").is_none());
    }

    #[test]
    fn without_drops_only_the_named_type() {
        let remaining = types().without("custom");
        assert!(remaining.lookup("custom").is_none());
        assert!(remaining.lookup("nested").is_some());
    }
}
