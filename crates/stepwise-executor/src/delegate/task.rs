use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;

use stepwise_core::plan::{CheckPlan, GetPlan, Plan, PlanKind};
use stepwise_core::resource::VersionedResourceTypes;
use stepwise_core::task::ImageResource;
use stepwise_events::BuildEvent;

use super::{forward_build_step_delegate, EventDelegate, TaskDelegate};
use crate::context::StepContext;
use crate::run_state::RunState;
use crate::worker::ImageSpec;
use crate::{ExecErrorKind, ExecResult};

const IMAGE_ARTIFACT: &str = "image";

/// Delegate of task steps
pub struct TaskStepDelegate {
    events: EventDelegate,
}

impl TaskStepDelegate {
    /// Creates a delegate reporting through `events`
    pub fn new(events: EventDelegate) -> Self {
        Self { events }
    }

    fn image_check_plan(&self, image: &ImageResource, resource_types: &VersionedResourceTypes, tags: &[String]) -> Plan {
        Plan {
            id: self.events.plan_id().child("image-check"),
            kind: PlanKind::Check(CheckPlan {
                name: IMAGE_ARTIFACT.to_string(),
                type_name: image.type_name.clone(),
                source: image.source.clone(),
                tags: tags.to_vec(),
                resource_types: resource_types.clone(),
                ..CheckPlan::default()
            }),
        }
    }

    fn image_get_plan(
        &self,
        image: &ImageResource,
        resource_types: &VersionedResourceTypes,
        tags: &[String],
        check: Option<&Plan>,
    ) -> Plan {
        Plan {
            id: self.events.plan_id().child("image-get"),
            kind: PlanKind::Get(GetPlan {
                name: IMAGE_ARTIFACT.to_string(),
                type_name: image.type_name.clone(),
                source: image.source.clone(),
                params: image.params.clone().unwrap_or_default(),
                version: image.version.clone(),
                version_from: check.map(|plan| plan.id.clone()),
                tags: tags.to_vec(),
                resource_types: resource_types.clone(),
                ..GetPlan::default()
            }),
        }
    }
}

forward_build_step_delegate!(TaskStepDelegate, events);

#[async_trait]
impl TaskDelegate for TaskStepDelegate {
    fn finished_task(&self, exit_status: i32) {
        tracing::info!(plan = %self.events.plan_id(), exit_status, "task finished");
        self.events.save(BuildEvent::FinishTask {
            origin: self.events.origin(),
            time: Utc::now(),
            exit_status,
        });
    }

    async fn fetch_image(
        &self,
        ctx: &StepContext,
        image: &ImageResource,
        resource_types: &VersionedResourceTypes,
        privileged: bool,
        tags: &[String],
        state: &Arc<RunState>,
    ) -> ExecResult<ImageSpec> {
        let local = state.new_local_scope();

        let check = if image.version.is_none() {
            let check = self.image_check_plan(image, resource_types, tags);
            self.events.save(BuildEvent::ImageCheck {
                origin: self.events.origin(),
                time: Utc::now(),
                plan: check.clone(),
            });
            if !local.run(ctx.clone(), &check).await? {
                return Err(ExecErrorKind::ImageFetch {
                    reason: format!("checking {} image failed", image.type_name),
                }
                .into());
            }
            Some(check)
        } else {
            None
        };

        let get = self.image_get_plan(image, resource_types, tags, check.as_ref());
        self.events.save(BuildEvent::ImageGet {
            origin: self.events.origin(),
            time: Utc::now(),
            plan: get.clone(),
        });
        if !local.run(ctx.clone(), &get).await? {
            return Err(ExecErrorKind::ImageFetch {
                reason: format!("fetching {} image failed", image.type_name),
            }
            .into());
        }

        let artifact = local.artifacts().artifact_for(IMAGE_ARTIFACT).ok_or_else(|| {
            ExecErrorKind::ImageFetch {
                reason: "image artifact was not registered".to_string(),
            }
        })?;
        Ok(ImageSpec {
            privileged,
            ..ImageSpec::from_artifact(artifact)
        })
    }
}
