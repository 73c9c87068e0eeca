//! Decides which checkables need a check.
//!
//! Each scan looks at every resource type and resource of every pipeline
//! and creates a check build for the ones that are due. The authoritative
//! due check happens later, under the scope's checking lock, when the check
//! step runs; the scanner only avoids creating builds that would certainly
//! do nothing.

use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use stepwise_core::db::{Build, BuildStore, Checkable, CheckableKind, ResourceCatalog};
use stepwise_core::duration::{format_duration, parse_duration};
use stepwise_core::step_config::{CheckStepConfig, StepConfig};
use stepwise_core::Planner;
use stepwise_events::{NotificationBus, NEW_CHECKS};

use crate::runner::Component;
use crate::{SchedulerErrorKind, SchedulerResult};

/// Scanner settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannerConfig {
    /// Interval of checkables without an explicit one
    pub default_check_interval: Duration,
    /// Interval of checkables that receive webhooks
    pub default_webhook_check_interval: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            default_check_interval: Duration::from_secs(60),
            default_webhook_check_interval: Duration::from_secs(24 * 60 * 60),
        }
    }
}

/// Creates check builds for due checkables
#[derive(Clone)]
pub struct Scanner {
    catalog: Arc<dyn ResourceCatalog>,
    builds: Arc<dyn BuildStore>,
    bus: Arc<NotificationBus>,
    config: ScannerConfig,
}

impl Scanner {
    /// Creates a scanner
    pub fn new(
        catalog: Arc<dyn ResourceCatalog>,
        builds: Arc<dyn BuildStore>,
        bus: Arc<NotificationBus>,
        config: ScannerConfig,
    ) -> Self {
        Self {
            catalog,
            builds,
            bus,
            config,
        }
    }

    /// Scans every checkable once, then wakes the checker.
    ///
    /// A failure or panic while scanning one checkable is recorded as that
    /// checkable's setup error and does not affect the others.
    ///
    /// # Errors
    ///
    /// Fails when the checkables cannot be listed.
    pub async fn scan(&self) -> SchedulerResult<()> {
        let resource_types = self.catalog.resource_types().await?;
        let resources = self.catalog.resources().await?;
        debug!(
            resource_types = resource_types.len(),
            resources = resources.len(),
            "scanning checkables"
        );

        let mut tasks = JoinSet::new();
        for checkable in resource_types.into_iter().chain(resources) {
            let scanner = self.clone();
            tasks.spawn(async move { scanner.scan_checkable(checkable).await });
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(err) = joined {
                error!(error = %err, "scan task failed");
            }
        }

        self.bus.notify(NEW_CHECKS);
        Ok(())
    }

    /// Creates a manually triggered check build for `checkable`, due or not.
    ///
    /// Returns `None` when a check build for it is already pending.
    ///
    /// # Errors
    ///
    /// Fails when the check plan cannot be compiled or the store fails.
    pub async fn trigger(&self, checkable: Arc<dyn Checkable>) -> SchedulerResult<Option<Arc<dyn Build>>> {
        let build = self.try_create_check(checkable.as_ref(), true).await?;
        self.bus.notify(NEW_CHECKS);
        Ok(build)
    }

    async fn scan_checkable(&self, checkable: Arc<dyn Checkable>) {
        let result = AssertUnwindSafe(self.try_create_check(checkable.as_ref(), false))
            .catch_unwind()
            .await;
        let setup_error = match result {
            Ok(Ok(_)) => None,
            Ok(Err(err)) => {
                error!(
                    pipeline = checkable.pipeline_name(),
                    kind = %checkable.kind(),
                    name = checkable.name(),
                    error = %err,
                    "failed to create check"
                );
                Some(err.to_string())
            }
            Err(payload) => {
                let message = format!(
                    "panic in scanner run {}/{}: {}",
                    checkable.pipeline_name(),
                    checkable.name(),
                    panic_message(payload.as_ref())
                );
                error!(kind = %checkable.kind(), error = %message, "scanner panicked");
                Some(message)
            }
        };
        if let Err(err) = checkable.set_check_setup_error(setup_error).await {
            error!(name = checkable.name(), error = %err, "failed to record check setup error");
        }
    }

    async fn try_create_check(
        &self,
        checkable: &dyn Checkable,
        manually_triggered: bool,
    ) -> SchedulerResult<Option<Arc<dyn Build>>> {
        let interval = self.interval(checkable)?;
        if !manually_triggered && !self.is_due(checkable, interval).await? {
            debug!(name = checkable.name(), kind = %checkable.kind(), "check not due");
            return Ok(None);
        }

        let pipeline_id = checkable.pipeline_id();
        let resource_types = self.catalog.versioned_resource_types(pipeline_id).await?;
        let ancestors = match checkable.kind() {
            CheckableKind::Resource => resource_types.clone(),
            CheckableKind::ResourceType => resource_types.without(checkable.name()),
        };
        if let Some(parent) = ancestors.lookup(checkable.type_name()) {
            if parent.version.is_none() {
                debug!(
                    name = checkable.name(),
                    parent = parent.name(),
                    "parent type has no version yet"
                );
                return Ok(None);
            }
        }

        let resources = self.catalog.named_resources(pipeline_id).await?;
        let name = checkable.name().to_string();
        let (resource, resource_type) = match checkable.kind() {
            CheckableKind::Resource => (Some(name.clone()), None),
            CheckableKind::ResourceType => (None, Some(name.clone())),
        };
        let config = StepConfig::Check(CheckStepConfig {
            name,
            resource,
            resource_type,
            timeout: checkable.check_timeout().map(str::to_string),
            interval: Some(format_duration(interval)),
            from_version: checkable.current_pinned_version().await?,
            skip_interval: manually_triggered,
            tags: Vec::new(),
        });
        let plan = Planner::new(0).create(&config, &resources, &resource_types, &[])?;

        let build = self
            .builds
            .create_check_build(checkable, plan, manually_triggered)
            .await?;
        match &build {
            Some(build) => info!(
                build = build.id(),
                pipeline = checkable.pipeline_name(),
                name = checkable.name(),
                manually_triggered,
                "created check build"
            ),
            None => debug!(name = checkable.name(), "check build already pending"),
        }
        Ok(build)
    }

    fn interval(&self, checkable: &dyn Checkable) -> SchedulerResult<Duration> {
        if let Some(every) = checkable.check_every() {
            return parse_duration(every).map_err(|source| {
                SchedulerErrorKind::InvalidInterval {
                    value: every.to_string(),
                    source,
                }
                .into()
            });
        }
        Ok(if checkable.has_webhook() {
            self.config.default_webhook_check_interval
        } else {
            self.config.default_check_interval
        })
    }

    async fn is_due(&self, checkable: &dyn Checkable, interval: Duration) -> SchedulerResult<bool> {
        let Some(end) = checkable.last_check_end_time().await? else {
            return Ok(true);
        };
        Ok((Utc::now() - end)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= interval))
    }
}

#[async_trait]
impl Component for Scanner {
    async fn tick(&self) -> SchedulerResult<()> {
        self.scan().await
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
