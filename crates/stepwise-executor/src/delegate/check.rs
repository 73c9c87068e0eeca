use async_trait::async_trait;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;

use stepwise_core::db::{Build, CheckableKind, Lock, ResourceCatalog, ResourceConfigScope};
use stepwise_core::duration::parse_duration;
use stepwise_core::plan::CheckPlan;

use super::{forward_build_step_delegate, CheckDelegate, EventDelegate};
use crate::context::StepContext;
use crate::limiter::CheckRateLimiter;
use crate::{ExecErrorKind, ExecResult};

/// Check defaults
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckConfig {
    /// Interval used when a check plan has none
    pub default_check_interval: Duration,
    /// Timeout used when a check plan has none
    pub default_check_timeout: Duration,
    /// How often a periodic check retries a held scope lock
    pub lock_poll_interval: Duration,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            default_check_interval: Duration::from_secs(60),
            default_check_timeout: Duration::from_secs(60 * 60),
            lock_poll_interval: Duration::from_secs(1),
        }
    }
}

impl CheckConfig {
    /// The plan's interval, or the default when it is empty
    ///
    /// # Errors
    ///
    /// Fails when the interval is not a valid duration.
    pub fn interval(&self, plan: &CheckPlan) -> ExecResult<Duration> {
        parse_or(&plan.interval, self.default_check_interval)
    }

    /// The plan's timeout, or the default when it is empty
    ///
    /// # Errors
    ///
    /// Fails when the timeout is not a valid duration.
    pub fn timeout(&self, plan: &CheckPlan) -> ExecResult<Duration> {
        parse_or(&plan.timeout, self.default_check_timeout)
    }
}

fn parse_or(value: &str, default: Duration) -> ExecResult<Duration> {
    if value.is_empty() {
        return Ok(default);
    }
    parse_duration(value).map_err(|source| {
        ExecErrorKind::InvalidDuration {
            value: value.to_string(),
            source,
        }
        .into()
    })
}

/// Delegate of check steps
pub struct CheckStepDelegate {
    events: EventDelegate,
    plan: CheckPlan,
    build: Arc<dyn Build>,
    catalog: Arc<dyn ResourceCatalog>,
    limiter: Arc<CheckRateLimiter>,
    config: CheckConfig,
}

impl CheckStepDelegate {
    /// Creates a delegate for one check plan of `build`
    pub fn new(
        events: EventDelegate,
        plan: CheckPlan,
        build: Arc<dyn Build>,
        catalog: Arc<dyn ResourceCatalog>,
        limiter: Arc<CheckRateLimiter>,
        config: CheckConfig,
    ) -> Self {
        Self {
            events,
            plan,
            build,
            catalog,
            limiter,
            config,
        }
    }

    async fn acquire(&self, ctx: &StepContext, scope: &dyn ResourceConfigScope) -> ExecResult<Option<Box<dyn Lock>>> {
        if !self.plan.is_periodic() {
            return Ok(scope.acquire_checking_lock().await?);
        }
        loop {
            if let Some(lock) = scope.acquire_checking_lock().await? {
                return Ok(Some(lock));
            }
            tracing::debug!(scope = scope.id(), "checking lock held, polling");
            ctx.sleep(self.config.lock_poll_interval).await?;
        }
    }

    async fn is_due(&self, scope: &dyn ResourceConfigScope) -> ExecResult<bool> {
        let interval = self.config.interval(&self.plan)?;
        let Some(end) = scope.last_check_end_time().await? else {
            return Ok(true);
        };
        Ok((Utc::now() - end)
            .to_std()
            .is_ok_and(|elapsed| elapsed >= interval))
    }
}

forward_build_step_delegate!(CheckStepDelegate, events);

pub(crate) async fn release(lock: Box<dyn Lock>) {
    if let Err(err) = lock.release().await {
        tracing::error!(lock = ?lock, error = %err, "failed to release lock");
    }
}

#[async_trait]
impl CheckDelegate for CheckStepDelegate {
    async fn wait_to_run(
        &self,
        ctx: &StepContext,
        scope: &dyn ResourceConfigScope,
    ) -> ExecResult<(Option<Box<dyn Lock>>, bool)> {
        let manual = self.build.is_manually_triggered();
        if !manual && self.plan.resource.is_some() {
            self.limiter.wait(ctx).await?;
        }

        let Some(lock) = self.acquire(ctx, scope).await? else {
            tracing::debug!(scope = scope.id(), "check already in progress");
            return Ok((None, false));
        };

        if manual || self.plan.skip_interval {
            return Ok((Some(lock), true));
        }

        match self.is_due(scope).await {
            Ok(true) => Ok((Some(lock), true)),
            Ok(false) => {
                tracing::debug!(scope = scope.id(), "check not due yet");
                release(lock).await;
                Ok((None, false))
            }
            Err(err) => {
                release(lock).await;
                Err(err)
            }
        }
    }

    async fn point_to_checked_config(&self, scope: &dyn ResourceConfigScope) -> ExecResult<()> {
        let Some(pipeline_id) = self.build.metadata().pipeline_id else {
            return Ok(());
        };
        let (kind, name) = match (&self.plan.resource, &self.plan.resource_type) {
            (Some(resource), _) => (CheckableKind::Resource, resource),
            (None, Some(resource_type)) => (CheckableKind::ResourceType, resource_type),
            (None, None) => return Ok(()),
        };

        let Some(checkable) = self.catalog.find_checkable(pipeline_id, kind, name).await? else {
            tracing::warn!(pipeline = pipeline_id, %kind, name = %name, "checked checkable no longer exists");
            return Ok(());
        };
        checkable.set_resource_config_scope(scope.id()).await?;
        Ok(())
    }
}
