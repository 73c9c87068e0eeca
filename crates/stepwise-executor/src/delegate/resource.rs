use async_trait::async_trait;
use std::sync::Arc;

use stepwise_core::db::ResourceCatalog;
use stepwise_core::resource::{Source, VersionResult, VersionedResourceTypes};
use stepwise_events::BuildEvent;

use super::{forward_build_step_delegate, EventDelegate, GetDelegate, PutDelegate};
use crate::ExecResult;

/// Delegate of get and put steps
pub struct ResourceDelegate {
    events: EventDelegate,
    catalog: Arc<dyn ResourceCatalog>,
    pipeline_id: Option<u64>,
}

impl ResourceDelegate {
    /// Creates a delegate saving into `pipeline_id`'s resources
    pub fn new(events: EventDelegate, catalog: Arc<dyn ResourceCatalog>, pipeline_id: Option<u64>) -> Self {
        Self {
            events,
            catalog,
            pipeline_id,
        }
    }
}

forward_build_step_delegate!(ResourceDelegate, events);

#[async_trait]
impl GetDelegate for ResourceDelegate {
    fn finished_get(&self, exit_status: i32, result: &VersionResult) {
        self.events.save(BuildEvent::FinishGet {
            origin: self.events.origin(),
            time: chrono::Utc::now(),
            exit_status,
            version: result.version.clone(),
            metadata: result.metadata.clone(),
        });
    }

    async fn update_resource_version(&self, resource: &str, result: &VersionResult) -> ExecResult<()> {
        let Some(pipeline_id) = self.pipeline_id else {
            return Ok(());
        };
        self.catalog
            .save_resource_version(pipeline_id, resource, result)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl PutDelegate for ResourceDelegate {
    fn finished_put(&self, exit_status: i32, result: &VersionResult) {
        self.events.save(BuildEvent::FinishPut {
            origin: self.events.origin(),
            time: chrono::Utc::now(),
            exit_status,
            version: result.version.clone(),
            metadata: result.metadata.clone(),
        });
    }

    async fn save_output(
        &self,
        resource: &str,
        source: &Source,
        resource_types: &VersionedResourceTypes,
        result: &VersionResult,
    ) -> ExecResult<()> {
        let Some(pipeline_id) = self.pipeline_id else {
            return Ok(());
        };
        tracing::info!(pipeline = pipeline_id, resource, "saving put output");
        self.catalog
            .save_output(pipeline_id, resource, source, resource_types, result)
            .await?;
        Ok(())
    }
}
