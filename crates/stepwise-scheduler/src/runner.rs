//! Periodic component loop.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::SchedulerResult;

/// Something that does a unit of work on every tick
#[async_trait]
pub trait Component: Send + Sync {
    /// Does one unit of work
    async fn tick(&self) -> SchedulerResult<()>;

    /// Resolves when the component should tick before its next interval.
    ///
    /// Never resolves by default.
    async fn wake(&self) {
        std::future::pending::<()>().await;
    }
}

/// Ticks `component` every `interval` until `shutdown` fires.
///
/// The first tick happens immediately. A failing tick is logged and the
/// loop carries on.
pub async fn run_periodically(
    name: &str,
    interval: Duration,
    shutdown: CancellationToken,
    component: Arc<dyn Component>,
) {
    info!(component = name, interval = ?interval, "component started");
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            _ = ticker.tick() => {}
            () = component.wake() => debug!(component = name, "woken early"),
        }

        if let Err(err) = component.tick().await {
            error!(component = name, error = %err, "tick failed");
        }
    }
    info!(component = name, "component stopped");
}
