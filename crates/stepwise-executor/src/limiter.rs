//! Global spacing of periodic checks.
//!
//! Without a limit every checkable that becomes due at the same moment
//! would be checked at once. The limiter spreads checks so that, on
//! average, every checkable is checked once per check interval.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

use stepwise_core::db::ResourceConfigFactory;

use crate::context::StepContext;
use crate::ExecResult;

/// Limiter settings
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterConfig {
    /// Interval every checkable should be checked within
    pub check_interval: Duration,
    /// Fixed rate when positive, derived from the checkable count when zero,
    /// unlimited when negative
    pub max_checks_per_second: f64,
    /// How long a checkable count is reused
    pub refresh_interval: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(60),
            max_checks_per_second: 0.0,
            refresh_interval: Duration::from_secs(60),
        }
    }
}

/// Counts checkables, re-querying at most once per refresh interval
pub struct CheckableCounter {
    factory: Arc<dyn ResourceConfigFactory>,
    refresh_interval: Duration,
    cached: tokio::sync::Mutex<Option<(usize, Instant)>>,
}

impl CheckableCounter {
    /// Creates a counter over `factory`'s scopes
    pub fn new(factory: Arc<dyn ResourceConfigFactory>, refresh_interval: Duration) -> Self {
        Self {
            factory,
            refresh_interval,
            cached: tokio::sync::Mutex::new(None),
        }
    }

    /// The number of checkables
    ///
    /// # Errors
    ///
    /// Fails when the count has to be refreshed and the store fails.
    pub async fn checkable_count(&self) -> ExecResult<usize> {
        let mut cached = self.cached.lock().await;
        if let Some((count, at)) = *cached {
            if at.elapsed() < self.refresh_interval {
                return Ok(count);
            }
        }
        let count = self.factory.checkable_count().await?;
        *cached = Some((count, Instant::now()));
        Ok(count)
    }
}

enum Mode {
    Unlimited,
    Fixed(f64),
    Derived,
}

/// Spaces periodic checks
pub struct CheckRateLimiter {
    mode: Mode,
    check_interval: Duration,
    counter: CheckableCounter,
    next_slot: Mutex<Option<Instant>>,
}

impl CheckRateLimiter {
    /// Creates a limiter
    pub fn new(config: &LimiterConfig, factory: Arc<dyn ResourceConfigFactory>) -> Self {
        let mode = if config.max_checks_per_second < 0.0 {
            Mode::Unlimited
        } else if config.max_checks_per_second > 0.0 {
            Mode::Fixed(config.max_checks_per_second)
        } else {
            Mode::Derived
        };
        Self {
            mode,
            check_interval: config.check_interval,
            counter: CheckableCounter::new(factory, config.refresh_interval),
            next_slot: Mutex::new(None),
        }
    }

    /// Waits for the next free slot
    ///
    /// # Errors
    ///
    /// Fails when `ctx` is done first, or when the checkable count cannot
    /// be refreshed.
    pub async fn wait(&self, ctx: &StepContext) -> ExecResult<()> {
        let Some(spacing) = self.spacing().await? else {
            return Ok(());
        };

        let slot = {
            let mut next = self.next_slot.lock();
            let now = Instant::now();
            let slot = next.map_or(now, |next| next.max(now));
            *next = Some(slot + spacing);
            slot
        };

        if slot > Instant::now() {
            tracing::debug!(wait_ms = (slot - Instant::now()).as_millis(), "waiting for check slot");
            ctx.run(tokio::time::sleep_until(slot)).await?;
        }
        Ok(())
    }

    async fn spacing(&self) -> ExecResult<Option<Duration>> {
        let rate = match self.mode {
            Mode::Unlimited => return Ok(None),
            Mode::Fixed(rate) => rate,
            Mode::Derived => {
                let count = self.counter.checkable_count().await?.max(1);
                #[allow(clippy::cast_precision_loss)]
                let count = count as f64;
                count / self.check_interval.as_secs_f64().max(f64::EPSILON)
            }
        };
        Ok(Some(Duration::from_secs_f64(1.0 / rate)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use stepwise_core::db::memory::{InMemoryLockFactory, InMemoryResourceConfigFactory};

    fn factory(count: usize) -> Arc<InMemoryResourceConfigFactory> {
        let factory = Arc::new(InMemoryResourceConfigFactory::new(InMemoryLockFactory::new()));
        factory.set_checkable_count(count);
        factory
    }

    #[tokio::test(start_paused = true)]
    async fn derived_rate_spreads_checks_over_the_interval() {
        let config = LimiterConfig {
            check_interval: Duration::from_secs(10),
            ..LimiterConfig::default()
        };
        let limiter = CheckRateLimiter::new(&config, factory(5));
        let ctx = StepContext::background();
        let start = Instant::now();

        for _ in 0..3 {
            limiter.wait(&ctx).await.unwrap();
        }

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(4));
        assert!(elapsed < Duration::from_millis(4010));
    }

    #[tokio::test(start_paused = true)]
    async fn negative_rate_is_unlimited() {
        let config = LimiterConfig {
            max_checks_per_second: -1.0,
            ..LimiterConfig::default()
        };
        let limiter = CheckRateLimiter::new(&config, factory(1));
        let start = Instant::now();
        for _ in 0..10 {
            limiter.wait(&StepContext::background()).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_stops_when_cancelled() {
        let config = LimiterConfig {
            max_checks_per_second: 0.1,
            ..LimiterConfig::default()
        };
        let limiter = CheckRateLimiter::new(&config, factory(1));
        let ctx = StepContext::background();
        limiter.wait(&ctx).await.unwrap();

        ctx.cancel();
        assert!(limiter.wait(&ctx).await.unwrap_err().is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn checkable_count_is_cached_until_refresh() {
        let factory = factory(3);
        let counter = CheckableCounter::new(factory.clone(), Duration::from_secs(60));
        assert_eq!(counter.checkable_count().await.unwrap(), 3);

        factory.set_checkable_count(7);
        assert_eq!(counter.checkable_count().await.unwrap(), 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        assert_eq!(counter.checkable_count().await.unwrap(), 7);
    }
}
