//! The plan compiler.
//!
//! [`Planner::create`] turns a [`StepConfig`] tree into a [`Plan`] tree,
//! resolving resources against the pipeline's catalog and versions against
//! the scheduler's build inputs. Compilation is all-or-nothing: the first
//! error aborts the whole tree.

use tracing::debug;

use crate::plan::{
    AcrossPlan, AcrossVar, CheckPlan, GetPlan, HookPlan, InParallelPlan, LoadVarPlan, Plan,
    PlanFactory, PlanKind, PutPlan, SetPipelinePlan, TaskPlan, TimeoutPlan, TryPlan,
    VarScopedPlan,
};
use crate::resource::{BuildInput, NamedResources, Resource, VersionedResourceTypes};
use crate::step_config::{
    AcrossConfig, CheckStepConfig, GetStepConfig, HookConfig, InParallelConfig, MaxInFlight,
    PutStepConfig, RetryConfig, StepConfig, TaskStepConfig, TimeoutConfig,
};

/// Compilation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PlannerError {
    /// A step references a resource the pipeline does not declare
    #[error("unknown resource: {name}")]
    UnknownResource {
        /// Referenced name
        name: String,
    },

    /// A check references a resource type the pipeline does not declare
    #[error("unknown resource type: {name}")]
    UnknownResourceType {
        /// Referenced name
        name: String,
    },

    /// A get step has no version decided by the scheduler
    #[error("version for input {input} not provided")]
    VersionNotProvided {
        /// The get step's name
        input: String,
    },

    /// An across variable has no values
    #[error("across variable '{var}' has no values")]
    EmptyAcrossVar {
        /// Variable name
        var: String,
    },
}

/// Result type for compilation
pub type PlannerResult<T = Plan> = Result<T, PlannerError>;

/// Compiles step configuration into plans, allocating IDs from one factory
#[derive(Debug)]
pub struct Planner {
    factory: PlanFactory,
}

struct Visitor<'a> {
    factory: &'a PlanFactory,
    resources: &'a NamedResources,
    resource_types: &'a VersionedResourceTypes,
    inputs: &'a [BuildInput],
}

impl Planner {
    /// Creates a planner whose first plan gets `starting_id + 1`
    #[must_use]
    pub fn new(starting_id: u64) -> Self {
        Self {
            factory: PlanFactory::new(starting_id),
        }
    }

    /// Creates a planner around an existing factory
    #[must_use]
    pub fn with_factory(factory: PlanFactory) -> Self {
        Self { factory }
    }

    /// Compiles a step configuration tree.
    ///
    /// # Errors
    ///
    /// Fails on an unknown resource or type, a get without a decided
    /// version, or an across variable without values.
    pub fn create(
        &self,
        config: &StepConfig,
        resources: &NamedResources,
        resource_types: &VersionedResourceTypes,
        inputs: &[BuildInput],
    ) -> PlannerResult {
        let visitor = Visitor {
            factory: &self.factory,
            resources,
            resource_types,
            inputs,
        };
        visitor.visit(config)
    }
}

impl Visitor<'_> {
    fn visit(&self, config: &StepConfig) -> PlannerResult {
        match config {
            StepConfig::Get(step) => self.visit_get(step),
            StepConfig::Put(step) => self.visit_put(step),
            StepConfig::Task(step) => Ok(self.visit_task(step)),
            StepConfig::Check(step) => self.visit_check(step),
            StepConfig::SetPipeline(step) => Ok(self.factory.new_plan(SetPipelinePlan {
                name: step.name.clone(),
                file: step.file.clone(),
                team: step.team.clone(),
                vars: step.vars.clone(),
                var_files: step.var_files.clone(),
            })),
            StepConfig::LoadVar(step) => Ok(self.factory.new_plan(LoadVarPlan {
                name: step.name.clone(),
                file: step.file.clone(),
                format: step.format.clone(),
                reveal: step.reveal,
            })),
            StepConfig::Do(steps) => {
                let plans = self.visit_all(steps)?;
                Ok(self.factory.new_plan(PlanKind::Do(plans)))
            }
            StepConfig::Aggregate(steps) => {
                let plans = self.visit_all(steps)?;
                Ok(self.factory.new_plan(PlanKind::Aggregate(plans)))
            }
            StepConfig::InParallel(step) => self.visit_in_parallel(step),
            StepConfig::Across(step) => self.visit_across(step),
            StepConfig::Try(step) => {
                let plan = self.visit(step)?;
                Ok(self.factory.new_plan(TryPlan {
                    step: Box::new(plan),
                }))
            }
            StepConfig::Timeout(step) => self.visit_timeout(step),
            StepConfig::Retry(step) => self.visit_retry(step),
            StepConfig::OnSuccess(hook) => self.visit_hook(hook, PlanKind::OnSuccess),
            StepConfig::OnFailure(hook) => self.visit_hook(hook, PlanKind::OnFailure),
            StepConfig::OnAbort(hook) => self.visit_hook(hook, PlanKind::OnAbort),
            StepConfig::OnError(hook) => self.visit_hook(hook, PlanKind::OnError),
            StepConfig::Ensure(hook) => self.visit_hook(hook, PlanKind::Ensure),
        }
    }

    fn visit_all(&self, steps: &[StepConfig]) -> PlannerResult<Vec<Plan>> {
        steps.iter().map(|step| self.visit(step)).collect()
    }

    fn lookup_resource(&self, step_name: &str, resource: Option<&String>) -> PlannerResult<&Resource> {
        let name = resource.map_or(step_name, String::as_str);
        self.resources
            .lookup(name)
            .ok_or_else(|| PlannerError::UnknownResource {
                name: name.to_string(),
            })
    }

    fn visit_get(&self, step: &GetStepConfig) -> PlannerResult {
        let resource = self.lookup_resource(&step.name, step.resource.as_ref())?;
        let input = self
            .inputs
            .iter()
            .find(|input| input.name == step.name)
            .ok_or_else(|| PlannerError::VersionNotProvided {
                input: step.name.clone(),
            })?;

        let tags = if step.tags.is_empty() {
            resource.tags.clone()
        } else {
            step.tags.clone()
        };
        let (plan, _) = self
            .resource_types
            .with_image(&resource.type_name, self.factory, |image| {
                PlanKind::Get(GetPlan {
                    name: step.name.clone(),
                    resource: Some(resource.name.clone()),
                    type_name: resource.type_name.clone(),
                    image_artifact_name: image,
                    source: resource.source.clone(),
                    params: step.params.clone(),
                    version: Some(input.version.clone()),
                    version_from: None,
                    tags,
                    resource_types: self.resource_types.clone(),
                    image: false,
                })
            });
        Ok(plan)
    }

    fn visit_put(&self, step: &PutStepConfig) -> PlannerResult {
        let resource = self.lookup_resource(&step.name, step.resource.as_ref())?;
        let tags = if step.tags.is_empty() {
            resource.tags.clone()
        } else {
            step.tags.clone()
        };

        let (put, put_id) = self
            .resource_types
            .with_image(&resource.type_name, self.factory, |image| {
                PlanKind::Put(PutPlan {
                    name: step.name.clone(),
                    resource: Some(resource.name.clone()),
                    type_name: resource.type_name.clone(),
                    image_artifact_name: image,
                    source: resource.source.clone(),
                    params: step.params.clone(),
                    inputs: step.inputs.clone(),
                    tags: tags.clone(),
                    resource_types: self.resource_types.clone(),
                })
            });

        let (get, _) = self
            .resource_types
            .with_image(&resource.type_name, self.factory, |image| {
                PlanKind::Get(GetPlan {
                    name: step.name.clone(),
                    resource: Some(resource.name.clone()),
                    type_name: resource.type_name.clone(),
                    image_artifact_name: image,
                    source: resource.source.clone(),
                    params: step.get_params.clone(),
                    version: None,
                    version_from: Some(put_id),
                    tags,
                    resource_types: self.resource_types.clone(),
                    image: false,
                })
            });

        Ok(self
            .factory
            .new_plan(PlanKind::OnSuccess(HookPlan::new(put, get))))
    }

    fn visit_task(&self, step: &TaskStepConfig) -> Plan {
        self.factory.new_plan(TaskPlan {
            name: step.name.clone(),
            privileged: step.privileged,
            tags: step.tags.clone(),
            config: step.config.clone(),
            config_path: step.file.clone(),
            vars: step.vars.clone(),
            params: step.params.clone(),
            input_mapping: step.input_mapping.clone(),
            output_mapping: step.output_mapping.clone(),
            image_artifact_name: step.image.clone(),
            resource_types: self.resource_types.clone(),
        })
    }

    fn visit_check(&self, step: &CheckStepConfig) -> PlannerResult {
        let base = CheckPlan {
            name: step.name.clone(),
            timeout: step.timeout.clone().unwrap_or_default(),
            interval: step.interval.clone().unwrap_or_default(),
            from_version: step.from_version.clone(),
            skip_interval: step.skip_interval,
            ..CheckPlan::default()
        };

        if let Some(type_name) = &step.resource_type {
            let declared = self
                .resource_types
                .lookup(type_name)
                .ok_or_else(|| PlannerError::UnknownResourceType {
                    name: type_name.clone(),
                })?;
            let ancestors = self.resource_types.without(type_name);
            let declared = &declared.resource_type;
            let (plan, _) = ancestors.with_image(&declared.type_name, self.factory, |image| {
                PlanKind::Check(CheckPlan {
                    resource_type: Some(declared.name.clone()),
                    type_name: declared.type_name.clone(),
                    image_artifact_name: image,
                    source: declared.source.clone(),
                    tags: pick_tags(&step.tags, &declared.tags),
                    resource_types: ancestors.clone(),
                    ..base
                })
            });
            return Ok(plan);
        }

        let resource = self.lookup_resource(&step.name, step.resource.as_ref())?;
        let (plan, _) = self
            .resource_types
            .with_image(&resource.type_name, self.factory, |image| {
                PlanKind::Check(CheckPlan {
                    resource: Some(resource.name.clone()),
                    type_name: resource.type_name.clone(),
                    image_artifact_name: image,
                    source: resource.source.clone(),
                    tags: pick_tags(&step.tags, &resource.tags),
                    resource_types: self.resource_types.clone(),
                    ..base
                })
            });
        Ok(plan)
    }

    fn visit_in_parallel(&self, step: &InParallelConfig) -> PlannerResult {
        let steps = self.visit_all(&step.steps)?;
        Ok(self.factory.new_plan(InParallelPlan {
            steps,
            limit: step.limit,
            fail_fast: step.fail_fast,
        }))
    }

    fn visit_across(&self, step: &AcrossConfig) -> PlannerResult {
        let mut vars = Vec::with_capacity(step.vars.len());
        for var in &step.vars {
            if var.values.is_empty() {
                return Err(PlannerError::EmptyAcrossVar {
                    var: var.var.clone(),
                });
            }
            vars.push(AcrossVar {
                var: var.var.clone(),
                values: var.values.clone(),
                max_in_flight: var
                    .max_in_flight
                    .unwrap_or(MaxInFlight::Limit(1))
                    .resolve(var.values.len()),
            });
        }

        let mut steps = Vec::new();
        for values in cartesian_product(&vars) {
            let plan = self.visit(&step.step)?;
            steps.push(VarScopedPlan { step: plan, values });
        }
        debug!(
            vars = vars.len(),
            combinations = steps.len(),
            "expanded across step"
        );

        Ok(self.factory.new_plan(AcrossPlan {
            vars,
            steps,
            fail_fast: step.fail_fast,
        }))
    }

    fn visit_timeout(&self, step: &TimeoutConfig) -> PlannerResult {
        let plan = self.visit(&step.step)?;
        Ok(self.factory.new_plan(TimeoutPlan {
            duration: step.duration.clone(),
            step: Box::new(plan),
        }))
    }

    fn visit_retry(&self, step: &RetryConfig) -> PlannerResult {
        let attempts = (0..step.attempts)
            .map(|_| self.visit(&step.step))
            .collect::<PlannerResult<Vec<_>>>()?;
        Ok(self.factory.new_plan(PlanKind::Retry(attempts)))
    }

    fn visit_hook(&self, hook: &HookConfig, trigger: fn(HookPlan) -> PlanKind) -> PlannerResult {
        let step = self.visit(&hook.step)?;
        let next = self.visit(&hook.hook)?;
        Ok(self.factory.new_plan(trigger(HookPlan::new(step, next))))
    }
}

fn pick_tags(step: &[String], declared: &[String]) -> Vec<String> {
    if step.is_empty() {
        declared.to_vec()
    } else {
        step.to_vec()
    }
}

/// Every combination of the variables' values.
///
/// The last variable varies fastest: `[a,b] x [x,y]` yields `(a,x), (a,y),
/// (b,x), (b,y)`.
fn cartesian_product(vars: &[AcrossVar]) -> Vec<Vec<serde_json::Value>> {
    let mut combinations: Vec<Vec<serde_json::Value>> = vec![Vec::new()];
    for var in vars {
        let mut next = Vec::with_capacity(combinations.len() * var.values.len());
        for prefix in &combinations {
            for value in &var.values {
                let mut combination = prefix.clone();
                combination.push(value.clone());
                next.push(combination);
            }
        }
        combinations = next;
    }
    combinations
}
