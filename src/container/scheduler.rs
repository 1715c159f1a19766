//! Durable one-shot task scheduling and the alarm handler.
//!
//! Tasks name their callback by string; the name is resolved against the
//! [`TaskHandlers`] map registered when the actor is built. The alarm handler
//! is the only consumer of the task table: every due task is attempted once
//! and then deleted, whether or not its callback succeeded.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tokio::time::Instant;

use super::actor::ContainerActor;
use super::alarm::{AlarmHandler, AlarmInfo, now_ms};
use super::models::*;
use crate::errors::{SupervisorError, SupervisorResult};

/// Alarm invocations retried more often than this skip the task sweep.
const MAX_ALARM_RETRIES: u32 = 3;

/// Defensive re-arm written before any task runs.
const REARM_HORIZON: Duration = Duration::from_secs(30);

/// Sleep horizon when no task is pending.
const IDLE_HORIZON: Duration = Duration::from_secs(3 * 60);

/// Furthest a task may be scheduled ahead of now (about 100 years).
const MAX_SCHEDULE_AHEAD_SECS: i64 = 100 * 365 * 24 * 60 * 60;

/// Default delay used by [`ContainerActor::schedule_next_alarm`].
const NEXT_ALARM_DELAY: Duration = Duration::from_secs(1);

/// A callback a scheduled task can name.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(
        &self,
        actor: Arc<ContainerActor>,
        payload: serde_json::Value,
        task: ScheduledTask,
    ) -> Result<()>;
}

/// Closure-backed [`TaskHandler`].
pub struct TaskFn<F>(pub F);

#[async_trait]
impl<F, Fut> TaskHandler for TaskFn<F>
where
    F: Fn(Arc<ContainerActor>, serde_json::Value, ScheduledTask) -> Fut + Send + Sync,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn run(
        &self,
        actor: Arc<ContainerActor>,
        payload: serde_json::Value,
        task: ScheduledTask,
    ) -> Result<()> {
        (self.0)(actor, payload, task).await
    }
}

/// Callback name → handler, fixed at actor construction.
#[derive(Clone, Default)]
pub struct TaskHandlers {
    handlers: HashMap<String, Arc<dyn TaskHandler>>,
}

impl TaskHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn TaskHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Arc<ContainerActor>, serde_json::Value, ScheduledTask) -> Fut
            + Send
            + Sync
            + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(name, Arc::new(TaskFn(f)))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl ContainerActor {
    /// Persist a one-shot task and make sure the alarm will see it.
    pub async fn schedule<P: Serialize>(
        &self,
        when: ScheduleWhen,
        callback: &str,
        payload: P,
    ) -> SupervisorResult<ScheduledTask> {
        if !self.handlers.contains(callback) {
            return Err(SupervisorError::UnknownCallback {
                name: callback.to_string(),
            });
        }
        let payload = serde_json::to_value(payload)
            .map_err(|e| SupervisorError::Other(anyhow::anyhow!("Failed to encode payload: {}", e)))?;

        let now = Utc::now();
        let (kind, fire_at) = match when {
            ScheduleWhen::At(at) => (TaskKind::Absolute, at.timestamp()),
            ScheduleWhen::Delay(delay) => {
                let delay_secs = i64::try_from(delay.as_secs())
                    .ok()
                    .filter(|secs| *secs <= MAX_SCHEDULE_AHEAD_SECS)
                    .ok_or_else(|| {
                        SupervisorError::ScheduleOutOfRange(format!(
                            "delay of {}s exceeds {}s",
                            delay.as_secs(),
                            MAX_SCHEDULE_AHEAD_SECS
                        ))
                    })?;
                (TaskKind::Delayed { delay_secs }, now.timestamp() + delay_secs)
            }
        };
        if fire_at - now.timestamp() > MAX_SCHEDULE_AHEAD_SECS {
            return Err(SupervisorError::ScheduleOutOfRange(format!(
                "fire time {} is more than {}s ahead",
                fire_at, MAX_SCHEDULE_AHEAD_SECS
            )));
        }
        let task = ScheduledTask {
            id: uuid::Uuid::new_v4().to_string(),
            callback: callback.to_string(),
            payload,
            kind,
            fire_at,
            created_at: now.timestamp(),
        };

        let record = task.clone();
        self.storage
            .call(move |s| s.insert_task(&record))
            .await
            .map_err(SupervisorError::Storage)?;
        tracing::debug!(identity = %self.identity, task_id = %task.id, callback, fire_at, "task scheduled");

        self.schedule_next_alarm(None)
            .await
            .map_err(SupervisorError::Storage)?;
        Ok(task)
    }

    pub async fn get_scheduled_task(&self, id: &str) -> SupervisorResult<Option<ScheduledTask>> {
        let id = id.to_string();
        self.storage
            .call(move |s| s.get_task(&id))
            .await
            .map_err(SupervisorError::Storage)
    }

    pub async fn list_scheduled_tasks(&self) -> SupervisorResult<Vec<ScheduledTask>> {
        self.storage
            .call(|s| s.list_tasks())
            .await
            .map_err(SupervisorError::Storage)
    }

    /// Remove a pending task. Returns whether it existed.
    pub async fn cancel_scheduled_task(&self, id: &str) -> SupervisorResult<bool> {
        let id = id.to_string();
        self.storage
            .call(move |s| s.delete_task(&id))
            .await
            .map_err(SupervisorError::Storage)
    }

    /// Ask for a wake-up `delay` from now (default 1s) and interrupt a
    /// sleeping alarm handler so it re-evaluates.
    pub async fn schedule_next_alarm(&self, delay: Option<Duration>) -> Result<()> {
        let delay = delay.unwrap_or(NEXT_ALARM_DELAY);
        self.alarm_sleeper.notify_waiters();
        self.clock
            .set_if_earlier(now_ms() + delay.as_millis() as i64)
            .await?;
        Ok(())
    }

    /// The wake-up entry point.
    pub async fn alarm(self: Arc<Self>, info: AlarmInfo) -> Result<()> {
        if info.is_retry && info.retry_count > MAX_ALARM_RETRIES {
            let pending = self.storage.call(|s| s.count_tasks()).await?;
            tracing::warn!(identity = %self.identity, retry_count = info.retry_count, pending, "alarm retried too often, skipping task sweep");
            if pending > 0 || self.control.is_running() {
                self.schedule_next_alarm(None).await?;
            }
            return Ok(());
        }

        // Registered before any state is read: `notify_waiters` only reaches
        // waiters that already exist.
        let interrupted = self.alarm_sleeper.notified();
        tokio::pin!(interrupted);
        interrupted.as_mut().enable();

        // Re-arm first so a failure below cannot stop the clock.
        self.clock
            .set_if_earlier(now_ms() + REARM_HORIZON.as_millis() as i64)
            .await?;

        let tasks = self.storage.call(|s| s.list_tasks()).await?;
        let now_secs = Utc::now().timestamp();
        for task in tasks.into_iter().filter(|t| t.is_due(now_secs)) {
            self.run_task(task).await;
        }

        if let Err(e) = self.sync_pending_stopped_events().await {
            tracing::error!(identity = %self.identity, error = %e, "failed to reconcile container status");
        }

        let earliest_ms = self
            .storage
            .call(|s| s.list_tasks())
            .await?
            .iter()
            .map(|t| t.fire_at.saturating_mul(1000))
            .min();

        if !self.control.is_running() {
            self.park_alarm(earliest_ms).await?;
            return Ok(());
        }

        if self.activity.is_expired() {
            if self.stop_due_to_inactivity().await? {
                self.park_alarm(earliest_ms).await?;
            }
            // Vetoed by open streams: the re-arm above brings us back.
            return Ok(());
        }

        let until_task = earliest_ms
            .map(|at| Duration::from_millis(at.saturating_sub(now_ms()).max(0) as u64))
            .unwrap_or(IDLE_HORIZON);
        let until_idle = self
            .activity
            .deadline()
            .saturating_duration_since(Instant::now());
        let sleep_for = until_task.min(until_idle);

        tokio::select! {
            _ = tokio::time::sleep(sleep_for) => {}
            _ = &mut interrupted => {
                tracing::trace!(identity = %self.identity, "alarm sleep interrupted");
            }
        }

        self.clock.set(now_ms()).await?;
        Ok(())
    }

    /// With no process to watch, only pending tasks keep the clock alive.
    async fn park_alarm(&self, earliest_ms: Option<i64>) -> Result<()> {
        match earliest_ms {
            Some(at) => self.clock.set(at).await,
            None => self.clock.clear().await,
        }
    }

    async fn run_task(self: &Arc<Self>, task: ScheduledTask) {
        match self.handlers.get(&task.callback) {
            Some(handler) => {
                tracing::debug!(identity = %self.identity, task_id = %task.id, callback = %task.callback, "running scheduled task");
                if let Err(e) = handler
                    .run(Arc::clone(self), task.payload.clone(), task.clone())
                    .await
                {
                    tracing::error!(identity = %self.identity, task_id = %task.id, callback = %task.callback, error = %e, "scheduled task failed");
                }
            }
            None => {
                tracing::error!(identity = %self.identity, task_id = %task.id, callback = %task.callback, "no handler registered for scheduled task");
            }
        }

        let id = task.id.clone();
        if let Err(e) = self.storage.call(move |s| s.delete_task(&id)).await {
            tracing::error!(identity = %self.identity, task_id = %task.id, error = %e, "failed to delete scheduled task");
        }
    }
}

#[async_trait]
impl AlarmHandler for ContainerActor {
    async fn on_alarm(self: Arc<Self>, info: AlarmInfo) -> Result<()> {
        self.alarm(info).await
    }
}
