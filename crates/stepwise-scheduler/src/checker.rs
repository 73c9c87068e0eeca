//! Runs started check builds.

use async_trait::async_trait;
use dashmap::DashSet;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use stepwise_core::db::BuildStore;
use stepwise_events::{NotificationBus, Notifications, NEW_CHECKS};
use stepwise_executor::Engine;

use crate::runner::Component;
use crate::SchedulerResult;

/// Hands started check builds to the engine
pub struct Checker {
    builds: Arc<dyn BuildStore>,
    engine: Arc<Engine>,
    running: Arc<DashSet<u64>>,
    notifications: Mutex<Notifications>,
}

impl Checker {
    /// Creates a checker woken by the scanner's notifications on `bus`
    pub fn new(builds: Arc<dyn BuildStore>, engine: Arc<Engine>, bus: &NotificationBus) -> Self {
        Self {
            builds,
            engine,
            running: Arc::new(DashSet::new()),
            notifications: Mutex::new(bus.subscribe(NEW_CHECKS)),
        }
    }

    /// Starts every started check build that this checker is not running yet
    ///
    /// # Errors
    ///
    /// Fails when the started builds cannot be listed.
    pub async fn run(&self) -> SchedulerResult<()> {
        let builds = self.builds.started_check_builds().await?;
        for build in builds {
            let id = build.id();
            if !self.running.insert(id) {
                debug!(build = id, "check already running");
                continue;
            }

            let engine_build = self.engine.new_build(build);
            let running = Arc::clone(&self.running);
            tokio::spawn(async move {
                engine_build.run().await;
                running.remove(&id);
            });
        }
        Ok(())
    }

    /// Number of checks this checker is running
    #[must_use]
    pub fn running(&self) -> usize {
        self.running.len()
    }
}

#[async_trait]
impl Component for Checker {
    async fn tick(&self) -> SchedulerResult<()> {
        self.run().await
    }

    async fn wake(&self) {
        if !self.notifications.lock().await.recv().await {
            std::future::pending::<()>().await;
        }
    }
}
