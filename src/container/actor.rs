//! # ContainerActor: per-identity worker-process supervisor.
//!
//! Reconciles three views of the worker process:
//! - the persisted [`ContainerStatus`] in the actor's storage,
//! - the live runtime view from [`ProcessControl::is_running`],
//! - the pending wake-up in the [`AlarmClock`].
//!
//! ## Start sequence
//! ```text
//! start_and_wait_for_ports ──► spawn ──► start_lock ──► sync_pending_stopped_events
//!                                                    ├─► ensure_started (start + probe loop)
//!                                                    ├─► per-port readiness loop
//!                                                    └─► status = healthy, on_start
//! ```
//!
//! ## Rules
//! - Only one start sequence runs at a time (`start_lock`).
//! - Transitions caused by background events go through
//!   `compare_and_set_status`, so a stale continuation never overwrites newer state.
//! - One exit monitor per start cycle; re-armed on every start command.
//!   Exits are recorded under `start_lock`, and an exit from a superseded
//!   cycle is dropped.

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::activity::ActivityTracker;
use super::alarm::AlarmClock;
use super::control::{ExitOutcome, ProcessControl, is_no_instance, is_not_listening};
use super::hooks::{DefaultHooks, LifecycleHooks};
use super::models::*;
use super::scheduler::TaskHandlers;
use super::storage::StorageHandle;
use crate::errors::{ControlError, SupervisorError, SupervisorResult};

/// No-instance outcomes tolerated in one start attempt, regardless of the
/// configured retry budget.
const NO_INSTANCE_ATTEMPT_CAP: u32 = 6;

/// Probed by `ensure_started` when neither the caller nor the settings name a port.
pub const FALLBACK_PORT_TO_CHECK: u16 = 33;

/// Actor-level defaults. Built from [`SupervisorConfig`](crate::config::SupervisorConfig).
#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub start_defaults: StartConfig,
    pub default_port: Option<u16>,
    pub required_ports: Vec<u16>,
    pub sleep_after: Duration,
    pub wait_interval: Duration,
    pub instance_timeout: Duration,
    pub ports_timeout: Duration,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            start_defaults: StartConfig {
                enable_internet: true,
                ..StartConfig::default()
            },
            default_port: None,
            required_ports: Vec::new(),
            sleep_after: Duration::from_secs(600),
            wait_interval: Duration::from_millis(300),
            instance_timeout: Duration::from_millis(8_000),
            ports_timeout: Duration::from_millis(20_000),
        }
    }
}

impl ContainerSettings {
    /// Start attempts allowed by `instance_timeout`.
    pub fn start_tries(&self) -> u32 {
        tries_for(self.instance_timeout, self.wait_interval)
    }

    /// Readiness probes allowed by `ports_timeout`.
    pub fn port_tries(&self) -> u32 {
        tries_for(self.ports_timeout, self.wait_interval)
    }
}

fn tries_for(budget: Duration, interval: Duration) -> u32 {
    if interval.is_zero() {
        return 1;
    }
    ((budget.as_millis() / interval.as_millis().max(1)) as u32).max(1)
}

/// Options for [`ContainerActor::ensure_started`].
#[derive(Debug, Clone, Default)]
pub struct EnsureStartedOptions {
    pub port_to_check: Option<u16>,
    pub retry_budget: Option<u32>,
    pub wait_interval: Option<Duration>,
    pub start: StartOptions,
    pub cancel: CancellationToken,
}

/// Options for [`ContainerActor::start_and_wait_for_ports`].
#[derive(Debug, Clone, Default)]
pub struct WaitOptions {
    pub start: StartOptions,
    pub cancel: CancellationToken,
}

#[derive(Default)]
struct MonitorState {
    /// Continuation attached for the current cycle.
    attached: bool,
    /// Bumped on every arm; stale continuations compare against it.
    generation: u64,
    exit_watch: Option<watch::Receiver<Option<ExitOutcome>>>,
}

pub struct ContainerActor {
    pub(super) identity: String,
    pub(super) settings: ContainerSettings,
    pub(super) control: Arc<dyn ProcessControl>,
    pub(super) storage: StorageHandle,
    pub(super) clock: AlarmClock,
    pub(super) activity: Arc<ActivityTracker>,
    pub(super) hooks: Arc<dyn LifecycleHooks>,
    pub(super) handlers: TaskHandlers,
    /// Wakes the interruptible sleep inside the alarm handler.
    pub(super) alarm_sleeper: Notify,
    start_lock: tokio::sync::Mutex<()>,
    monitor: Mutex<MonitorState>,
}

pub struct ContainerActorBuilder {
    identity: String,
    control: Arc<dyn ProcessControl>,
    storage: StorageHandle,
    settings: ContainerSettings,
    hooks: Arc<dyn LifecycleHooks>,
    handlers: TaskHandlers,
}

impl ContainerActorBuilder {
    pub fn with_settings(mut self, settings: ContainerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_handlers(mut self, handlers: TaskHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn build(self) -> Arc<ContainerActor> {
        Arc::new(ContainerActor {
            clock: AlarmClock::new(self.storage.clone()),
            activity: Arc::new(ActivityTracker::new(self.settings.sleep_after)),
            identity: self.identity,
            settings: self.settings,
            control: self.control,
            storage: self.storage,
            hooks: self.hooks,
            handlers: self.handlers,
            alarm_sleeper: Notify::new(),
            start_lock: tokio::sync::Mutex::new(()),
            monitor: Mutex::new(MonitorState::default()),
        })
    }
}

impl ContainerActor {
    pub fn builder(
        identity: impl Into<String>,
        control: Arc<dyn ProcessControl>,
        storage: StorageHandle,
    ) -> ContainerActorBuilder {
        ContainerActorBuilder {
            identity: identity.into(),
            control,
            storage,
            settings: ContainerSettings::default(),
            hooks: Arc::new(DefaultHooks),
            handlers: TaskHandlers::default(),
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn settings(&self) -> &ContainerSettings {
        &self.settings
    }

    pub fn alarm_clock(&self) -> &AlarmClock {
        &self.clock
    }

    pub fn is_running(&self) -> bool {
        self.control.is_running()
    }

    pub async fn status(&self) -> SupervisorResult<ContainerStatus> {
        self.storage.status().await.map_err(SupervisorError::Storage)
    }

    async fn set_status(&self, state: ProcessState) -> SupervisorResult<()> {
        tracing::debug!(identity = %self.identity, status = %state, "status transition");
        self.storage
            .set_status(state)
            .await
            .map_err(SupervisorError::Storage)
    }

    async fn compare_and_set_status(
        &self,
        expected: ProcessState,
        next: ProcessState,
    ) -> SupervisorResult<bool> {
        let written = self
            .storage
            .compare_and_set_status(expected, next)
            .await
            .map_err(SupervisorError::Storage)?;
        if !written {
            tracing::debug!(identity = %self.identity, expected = %expected, next = %next, "stale status write skipped");
        }
        Ok(written)
    }

    /// True when the actor holds nothing worth keeping in memory: no process,
    /// no open streams, no start in flight, no pending tasks and a settled
    /// `stopped` status.
    pub async fn is_dormant(&self) -> SupervisorResult<bool> {
        if self.control.is_running()
            || self.activity.open_streams() > 0
            || self.start_lock.try_lock().is_err()
        {
            return Ok(false);
        }
        if self.status().await?.state != ProcessState::Stopped {
            return Ok(false);
        }
        let pending = self
            .storage
            .call(|s| s.count_tasks())
            .await
            .map_err(SupervisorError::Storage)?;
        Ok(pending == 0)
    }

    // ── Activity ─────────────────────────────────────────────────────

    /// Traffic happened; push the idle deadline out.
    pub fn renew_activity(&self) -> Instant {
        self.activity.renew()
    }

    pub fn idle_deadline(&self) -> Instant {
        self.activity.deadline()
    }

    pub fn open_streams(&self) -> usize {
        self.activity.open_streams()
    }

    /// Apply a new idle timeout. The deadline is renewed against it.
    pub fn set_sleep_after(&self, sleep_after: Duration) -> Instant {
        self.activity.set_sleep_after(sleep_after)
    }

    // ── Start ────────────────────────────────────────────────────────

    /// Start the process if needed and wait until `port_to_check` answers.
    /// Returns the number of tries used.
    pub async fn ensure_started(
        self: &Arc<Self>,
        options: EnsureStartedOptions,
    ) -> SupervisorResult<u32> {
        let _guard = self.start_lock.lock().await;
        self.ensure_started_locked(&options).await
    }

    async fn ensure_started_locked(
        self: &Arc<Self>,
        options: &EnsureStartedOptions,
    ) -> SupervisorResult<u32> {
        if self.control.is_running() {
            self.attach_monitor();
            return Ok(0);
        }

        // Whatever the last cycle's monitor reported belongs to a dead process.
        self.reset_monitor();
        self.set_status(ProcessState::Running).await?;

        let port = options
            .port_to_check
            .or(self.settings.default_port)
            .or_else(|| self.settings.required_ports.first().copied())
            .unwrap_or(FALLBACK_PORT_TO_CHECK);
        let budget = options
            .retry_budget
            .unwrap_or_else(|| self.settings.start_tries());
        let wait_interval = options.wait_interval.unwrap_or(self.settings.wait_interval);
        let start_config = options.start.resolve(&self.settings.start_defaults);

        let mut no_instance_seen: u32 = 0;
        let mut last_was_no_instance = false;

        for tries in 0..budget {
            if options.cancel.is_cancelled() {
                return Err(SupervisorError::Aborted);
            }
            self.activity.renew();

            if tries > 0 {
                match self.peek_exit() {
                    Some(ExitOutcome::NoInstance) => {
                        self.reset_monitor();
                        no_instance_seen += 1;
                        last_was_no_instance = true;
                        if no_instance_seen >= NO_INSTANCE_ATTEMPT_CAP {
                            return Err(SupervisorError::NoInstanceAvailable);
                        }
                    }
                    Some(ExitOutcome::Unclassified(message)) => {
                        return Err(self
                            .surface(SupervisorError::Control(ControlError::Message(message)))
                            .await);
                    }
                    Some(outcome) => {
                        let exit_code = outcome.exit_code().unwrap_or_default();
                        return Err(self
                            .surface(SupervisorError::ExitedEarly { exit_code })
                            .await);
                    }
                    None => {}
                }
            }

            if !self.control.is_running() {
                tracing::info!(identity = %self.identity, tries, "starting container");
                match self.control.start(start_config.clone()).await {
                    Ok(()) => self.arm_monitor(),
                    Err(e) if is_no_instance(&e) => {
                        no_instance_seen += 1;
                        last_was_no_instance = true;
                        if no_instance_seen >= NO_INSTANCE_ATTEMPT_CAP {
                            return Err(SupervisorError::NoInstanceAvailable);
                        }
                        self.sleep_or_abort(wait_interval, &options.cancel).await?;
                        continue;
                    }
                    Err(e) => return Err(self.surface(e.into()).await),
                }
            }

            match self.control.probe_port(port).await {
                Ok(()) => {
                    tracing::info!(identity = %self.identity, port, tries, "container is listening");
                    return Ok(tries);
                }
                Err(e) if is_not_listening(&e) => {
                    if !self.control.is_running() {
                        return Err(self.surface(SupervisorError::ProcessCrashed { port }).await);
                    }
                    last_was_no_instance = false;
                    tracing::debug!(identity = %self.identity, port, tries, "container not listening yet");
                }
                Err(e) if is_no_instance(&e) => {
                    no_instance_seen += 1;
                    last_was_no_instance = true;
                    if no_instance_seen >= NO_INSTANCE_ATTEMPT_CAP {
                        return Err(SupervisorError::NoInstanceAvailable);
                    }
                }
                Err(e) => {
                    last_was_no_instance = false;
                    tracing::warn!(identity = %self.identity, port, tries, error = %e, "port probe failed");
                }
            }

            self.sleep_or_abort(wait_interval, &options.cancel).await?;
        }

        if last_was_no_instance {
            return Err(SupervisorError::NoInstanceAvailable);
        }
        Err(SupervisorError::DidNotStart { tries: budget })
    }

    /// Start the process and wait for every port in `ports` (or the configured
    /// ports) to answer. Concurrent callers are serialized; the sequence keeps
    /// running even if the caller goes away.
    pub async fn start_and_wait_for_ports(
        self: &Arc<Self>,
        ports: Option<Vec<u16>>,
        options: WaitOptions,
    ) -> SupervisorResult<()> {
        if self.is_ready().await? {
            return Ok(());
        }

        let actor = Arc::clone(self);
        let sequence = tokio::spawn(async move {
            let _guard = actor.start_lock.lock().await;
            actor.start_and_wait_locked(ports, options).await
        });

        match sequence.await {
            Ok(result) => result,
            Err(join_err) => Err(SupervisorError::StartSequence(join_err.to_string())),
        }
    }

    async fn is_ready(&self) -> SupervisorResult<bool> {
        let healthy = self.status().await?.state == ProcessState::Healthy;
        Ok(healthy && self.control.is_running() && self.monitor_attached())
    }

    async fn start_and_wait_locked(
        self: &Arc<Self>,
        ports: Option<Vec<u16>>,
        options: WaitOptions,
    ) -> SupervisorResult<()> {
        // Another caller may have finished the sequence while we queued.
        if self.is_ready().await? {
            return Ok(());
        }

        self.sync_pending_stopped_events().await?;

        let ports = ports.unwrap_or_else(|| self.configured_ports());
        let tries_used = self
            .ensure_started_locked(&EnsureStartedOptions {
                port_to_check: ports.first().copied(),
                start: options.start.clone(),
                cancel: options.cancel.clone(),
                ..EnsureStartedOptions::default()
            })
            .await?;

        let port_budget = self.settings.port_tries().saturating_sub(tries_used);
        for port in ports {
            self.wait_for_port(port, port_budget, &options.cancel).await?;
        }

        self.set_status(ProcessState::Healthy).await?;
        self.activity.renew();
        if let Err(e) = self.schedule_next_alarm(None).await {
            tracing::warn!(identity = %self.identity, error = %e, "failed to arm idle watch");
        }
        if let Err(e) = self.hooks.on_start().await {
            self.hooks.on_error(&SupervisorError::Other(e)).await;
        }
        Ok(())
    }

    fn configured_ports(&self) -> Vec<u16> {
        if !self.settings.required_ports.is_empty() {
            return self.settings.required_ports.clone();
        }
        self.settings.default_port.into_iter().collect()
    }

    async fn wait_for_port(
        &self,
        port: u16,
        budget: u32,
        cancel: &CancellationToken,
    ) -> SupervisorResult<()> {
        let mut tries: u32 = 0;
        loop {
            if cancel.is_cancelled() {
                return Err(SupervisorError::Aborted);
            }
            match self.control.probe_port(port).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    if !self.control.is_running() {
                        return Err(self.surface(SupervisorError::ProcessCrashed { port }).await);
                    }
                    tries += 1;
                    if tries >= budget {
                        return Err(self
                            .surface(SupervisorError::PortNotReady { port, tries })
                            .await);
                    }
                    tracing::debug!(identity = %self.identity, port, tries, error = %e, "port not ready");
                }
            }
            self.sleep_or_abort(self.settings.wait_interval, cancel)
                .await?;
        }
    }

    async fn sleep_or_abort(
        &self,
        duration: Duration,
        cancel: &CancellationToken,
    ) -> SupervisorResult<()> {
        tokio::select! {
            _ = cancel.cancelled() => Err(SupervisorError::Aborted),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    /// Route a fatal error through `on_error` and hand it back for re-raising.
    async fn surface(&self, error: SupervisorError) -> SupervisorError {
        self.hooks.on_error(&error).await;
        error
    }

    // ── Exit monitor ────────────────────────────────────────────────

    fn monitor_attached(&self) -> bool {
        self.monitor.lock().unwrap_or_else(|e| e.into_inner()).attached
    }

    fn peek_exit(&self) -> Option<ExitOutcome> {
        let state = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        state
            .exit_watch
            .as_ref()
            .and_then(|rx| rx.borrow().clone())
    }

    fn reset_monitor(&self) {
        let mut state = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
        state.attached = false;
        state.generation += 1;
        state.exit_watch = None;
    }

    /// Attach to the running process unless a continuation is already pending.
    fn attach_monitor(self: &Arc<Self>) {
        if self.monitor_attached() {
            return;
        }
        self.arm_monitor();
    }

    /// Begin watching a new start cycle.
    fn arm_monitor(self: &Arc<Self>) {
        let (tx, rx) = watch::channel(None);
        let generation = {
            let mut state = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            state.generation += 1;
            state.attached = true;
            state.exit_watch = Some(rx);
            state.generation
        };

        let exit = self.control.monitor();
        let actor: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let result = exit.await;
            let outcome = ExitOutcome::from_result(&result);
            let _ = tx.send(Some(outcome.clone()));
            if let Some(actor) = actor.upgrade() {
                actor.handle_exit(outcome, generation).await;
            }
        });
    }

    async fn handle_exit(&self, outcome: ExitOutcome, generation: u64) {
        // No new start cycle can begin while this exit is recorded.
        let _guard = self.start_lock.lock().await;
        {
            let mut state = self.monitor.lock().unwrap_or_else(|e| e.into_inner());
            if state.generation != generation {
                tracing::debug!(identity = %self.identity, generation, current = state.generation, "ignoring exit from a superseded start cycle");
                return;
            }
            state.attached = false;
        }

        let result = match &outcome {
            ExitOutcome::Clean => self.record_stop(0, StopReason::Exit).await,
            ExitOutcome::RuntimeSignalled { exit_code } => {
                self.record_stop(*exit_code, StopReason::RuntimeSignal).await
            }
            ExitOutcome::NonZeroExit { exit_code } => {
                self.record_stop(*exit_code, StopReason::Exit).await
            }
            ExitOutcome::NoInstance => {
                tracing::debug!(identity = %self.identity, "exit monitor found no instance");
                Ok(())
            }
            ExitOutcome::Unclassified(message) => {
                self.hooks
                    .on_error(&SupervisorError::Control(ControlError::Message(
                        message.clone(),
                    )))
                    .await;
                Ok(())
            }
        };
        if let Err(e) = result {
            tracing::error!(identity = %self.identity, error = %e, "failed to record container exit");
        }

        // Let a sleeping alarm handler notice the process is gone.
        self.alarm_sleeper.notify_waiters();
    }

    /// `observed → stopped_with_code(code) → on_stop → stopped`, each write
    /// guarded against concurrent transitions.
    async fn record_stop(&self, exit_code: i32, reason: StopReason) -> SupervisorResult<()> {
        let observed = self.status().await?.state;
        if matches!(
            observed,
            ProcessState::Stopped | ProcessState::StoppedWithCode { .. }
        ) {
            return Ok(());
        }

        let stopped_with_code = ProcessState::StoppedWithCode { exit_code };
        if !self
            .compare_and_set_status(observed, stopped_with_code)
            .await?
        {
            return Ok(());
        }

        tracing::info!(identity = %self.identity, exit_code, reason = reason.as_str(), "container exited");
        if let Err(e) = self.hooks.on_stop(StopParams { exit_code, reason }).await {
            self.hooks.on_error(&SupervisorError::Other(e)).await;
        }

        self.compare_and_set_status(stopped_with_code, ProcessState::Stopped)
            .await?;
        Ok(())
    }

    /// Catch up on exits that happened while nobody was watching.
    pub async fn sync_pending_stopped_events(&self) -> SupervisorResult<()> {
        if self.control.is_running() {
            return Ok(());
        }

        let observed = self.status().await?.state;
        let exit_code = match observed {
            ProcessState::Healthy => 0,
            ProcessState::StoppedWithCode { exit_code } => exit_code,
            _ => return Ok(()),
        };

        if !self
            .compare_and_set_status(observed, ProcessState::Stopped)
            .await?
        {
            return Ok(());
        }

        tracing::info!(identity = %self.identity, exit_code, "reconciled missed container exit");
        if let Err(e) = self
            .hooks
            .on_stop(StopParams {
                exit_code,
                reason: StopReason::Exit,
            })
            .await
        {
            self.hooks.on_error(&SupervisorError::Other(e)).await;
        }
        Ok(())
    }

    // ── Stop ────────────────────────────────────────────────────────

    /// Send `signal` (default SIGTERM) to the process. The exit monitor
    /// completes the status transition.
    pub async fn stop(&self, signal: Option<Signal>) -> SupervisorResult<()> {
        if !self.control.is_running() {
            return Ok(());
        }
        let signal = signal.unwrap_or_default();
        tracing::info!(identity = %self.identity, signal = signal.as_raw(), "stopping container");
        self.set_status(ProcessState::Stopping).await?;
        self.control.signal(signal).await?;
        Ok(())
    }

    /// Forcibly tear the process down.
    pub async fn destroy(&self) -> SupervisorResult<()> {
        if self.control.is_running() {
            self.set_status(ProcessState::Stopping).await?;
        }
        tracing::info!(identity = %self.identity, "destroying container");
        self.control.destroy().await?;
        Ok(())
    }

    /// Gracefully stop an idle process. Returns whether a signal was sent;
    /// open streams or a stopped process veto the shutdown.
    pub async fn stop_due_to_inactivity(&self) -> SupervisorResult<bool> {
        if !self.control.is_running() {
            return Ok(false);
        }
        let open = self.activity.open_streams();
        if open > 0 {
            tracing::debug!(identity = %self.identity, open_streams = open, "idle shutdown deferred");
            return Ok(false);
        }
        tracing::info!(identity = %self.identity, "container idle, shutting down");
        self.stop(Some(Signal::Terminate)).await?;
        Ok(true)
    }
}
