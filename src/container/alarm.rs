//! Wake-up timer service.
//!
//! One pending wake-up per actor, persisted in the actor's storage so it
//! survives restarts. A driver task sleeps until the stored instant, consumes
//! it and invokes the actor's single alarm entry point. Failing invocations
//! are retried with exponential backoff and flagged through [`AlarmInfo`].

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::storage::StorageHandle;

/// How many times the driver re-invokes a failing handler before dropping
/// that wake-up.
const MAX_DRIVER_RETRIES: u32 = 6;

/// Metadata passed to every alarm invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AlarmInfo {
    pub is_retry: bool,
    pub retry_count: u32,
}

/// The single entry point a wake-up invokes.
#[async_trait]
pub trait AlarmHandler: Send + Sync {
    async fn on_alarm(self: Arc<Self>, info: AlarmInfo) -> Result<()>;
}

/// Exponential retry delay: `first × factor^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct RetryBackoff {
    pub first: Duration,
    pub max: Duration,
    pub factor: f64,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self {
            first: Duration::from_secs(1),
            max: Duration::from_secs(60),
            factor: 2.0,
        }
    }
}

impl RetryBackoff {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        Duration::from_secs_f64(secs.min(self.max.as_secs_f64()))
    }
}

pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Persisted wake-up slot plus a change signal for the driver.
#[derive(Clone)]
pub struct AlarmClock {
    storage: StorageHandle,
    changed: Arc<Notify>,
}

impl AlarmClock {
    pub fn new(storage: StorageHandle) -> Self {
        Self {
            storage,
            changed: Arc::new(Notify::new()),
        }
    }

    /// Pending wake-up in unix milliseconds.
    pub async fn get(&self) -> Result<Option<i64>> {
        self.storage.call(|s| s.get_wake_time()).await
    }

    /// Replace the pending wake-up.
    pub async fn set(&self, at_ms: i64) -> Result<()> {
        self.storage.call(move |s| s.set_wake_time(at_ms)).await?;
        self.changed.notify_one();
        Ok(())
    }

    /// Set the wake-up only if none is pending, the pending one is later,
    /// or the pending one is already overdue. Returns whether it was written.
    pub async fn set_if_earlier(&self, at_ms: i64) -> Result<bool> {
        let now = now_ms();
        let written = self
            .storage
            .call(move |s| {
                let replace = match s.get_wake_time()? {
                    None => true,
                    Some(current) => at_ms < current || current <= now,
                };
                if replace {
                    s.set_wake_time(at_ms)?;
                }
                Ok(replace)
            })
            .await?;
        if written {
            self.changed.notify_one();
        }
        Ok(written)
    }

    pub async fn clear(&self) -> Result<()> {
        self.storage.call(|s| s.clear_wake_time()).await?;
        self.changed.notify_one();
        Ok(())
    }
}

/// Drive `handler` from `clock` until `cancel` fires.
pub async fn run_driver<H>(clock: AlarmClock, handler: Arc<H>, cancel: CancellationToken)
where
    H: AlarmHandler + 'static,
{
    let backoff = RetryBackoff::default();
    let mut retry_count: u32 = 0;

    loop {
        let wake = tokio::select! {
            _ = cancel.cancelled() => break,
            wake = clock.get() => wake,
        };

        let at_ms = match wake {
            Ok(Some(at_ms)) => at_ms,
            Ok(None) => {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = clock.changed.notified() => continue,
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to read wake-up time");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(backoff.first) => continue,
                }
            }
        };

        let delay = at_ms.saturating_sub(now_ms());
        if delay > 0 {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = clock.changed.notified() => continue,
                _ = tokio::time::sleep(Duration::from_millis(delay as u64)) => {}
            }
        }

        // Consume the wake-up before invoking; the handler re-arms as needed.
        if let Err(e) = clock.clear().await {
            tracing::warn!(error = %e, "failed to consume wake-up");
        }

        let info = AlarmInfo {
            is_retry: retry_count > 0,
            retry_count,
        };
        let outcome = tokio::select! {
            _ = cancel.cancelled() => break,
            outcome = Arc::clone(&handler).on_alarm(info) => outcome,
        };
        match outcome {
            Ok(()) => retry_count = 0,
            Err(e) => {
                retry_count += 1;
                if retry_count > MAX_DRIVER_RETRIES {
                    tracing::error!(error = %e, retries = MAX_DRIVER_RETRIES, "alarm handler kept failing, dropping wake-up");
                    retry_count = 0;
                    continue;
                }
                let delay = backoff.delay(retry_count);
                tracing::warn!(error = %e, retry_count, delay_ms = delay.as_millis() as u64, "alarm handler failed, retrying");
                if let Err(e) = clock.set_if_earlier(now_ms() + delay.as_millis() as i64).await {
                    tracing::warn!(error = %e, "failed to re-arm wake-up for retry");
                }
            }
        }
    }
}
