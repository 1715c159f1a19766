//! One [`ContainerActor`] per identity key.
//!
//! The registry opens each actor's storage, builds the actor with the shared
//! settings, handlers and hooks, and owns the alarm driver task that delivers
//! the actor's wake-ups. Actors that go dormant (no process, no pending
//! tasks, nobody holding them) are evicted by a periodic sweep; their
//! on-disk state is reopened the next time the identity is used.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::actor::{ContainerActor, ContainerSettings};
use super::alarm;
use super::control::ProcessControl;
use super::hooks::{DefaultHooks, LifecycleHooks};
use super::scheduler::TaskHandlers;
use super::storage::{ActorStorage, StorageHandle};

/// Builds the process runtime for a newly created actor.
pub type ControlFactory =
    Arc<dyn Fn(&str) -> Result<Arc<dyn ProcessControl>> + Send + Sync>;

/// References held by the registry itself: the map entry and the driver.
const REGISTRY_REFS: usize = 2;

struct ActorEntry {
    actor: Arc<ContainerActor>,
    cancel: CancellationToken,
    driver: JoinHandle<()>,
}

pub struct ActorRegistry {
    settings: ContainerSettings,
    data_dir: Option<PathBuf>,
    control_factory: ControlFactory,
    handlers: TaskHandlers,
    hooks: Arc<dyn LifecycleHooks>,
    actors: tokio::sync::Mutex<HashMap<String, ActorEntry>>,
    reaper: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl ActorRegistry {
    /// `data_dir = None` keeps every actor's storage in memory.
    pub fn new(
        settings: ContainerSettings,
        data_dir: Option<PathBuf>,
        control_factory: ControlFactory,
    ) -> Self {
        Self {
            settings,
            data_dir,
            control_factory,
            handlers: TaskHandlers::default(),
            hooks: Arc::new(DefaultHooks),
            actors: tokio::sync::Mutex::new(HashMap::new()),
            reaper: Mutex::new(None),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_handlers(mut self, handlers: TaskHandlers) -> Self {
        self.handlers = handlers;
        self
    }

    pub fn with_hooks(mut self, hooks: Arc<dyn LifecycleHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub async fn get(&self, identity: &str) -> Option<Arc<ContainerActor>> {
        self.actors
            .lock()
            .await
            .get(identity)
            .map(|entry| Arc::clone(&entry.actor))
    }

    pub async fn identities(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.actors.lock().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Return the actor for `identity`, creating it (and its alarm driver) on
    /// first use.
    pub async fn get_or_create(&self, identity: &str) -> Result<Arc<ContainerActor>> {
        validate_identity(identity)?;
        if self.cancel.is_cancelled() {
            bail!("registry is shutting down");
        }

        let mut actors = self.actors.lock().await;
        if let Some(entry) = actors.get(identity) {
            return Ok(Arc::clone(&entry.actor));
        }

        let storage = self.open_storage(identity).await?;
        let control = (self.control_factory)(identity)
            .with_context(|| format!("Failed to create process runtime for '{}'", identity))?;
        let actor = ContainerActor::builder(identity, control, storage)
            .with_settings(self.settings.clone())
            .with_hooks(Arc::clone(&self.hooks))
            .with_handlers(self.handlers.clone())
            .build();

        let cancel = self.cancel.child_token();
        let driver = tokio::spawn(alarm::run_driver(
            actor.alarm_clock().clone(),
            Arc::clone(&actor),
            cancel.clone(),
        ));

        tracing::info!(identity, "container actor created");
        actors.insert(
            identity.to_string(),
            ActorEntry {
                actor: Arc::clone(&actor),
                cancel,
                driver,
            },
        );
        Ok(actor)
    }

    async fn open_storage(&self, identity: &str) -> Result<StorageHandle> {
        let storage = match &self.data_dir {
            Some(dir) => {
                let dir = dir.clone();
                let path = dir.join(format!("{}.db", identity));
                tokio::task::spawn_blocking(move || {
                    std::fs::create_dir_all(&dir).with_context(|| {
                        format!("Failed to create data directory {}", dir.display())
                    })?;
                    ActorStorage::new(&path)
                })
                .await
                .context("Storage open task panicked")??
            }
            None => ActorStorage::new_in_memory()?,
        };
        Ok(StorageHandle::new(storage))
    }

    /// Drop every dormant actor and stop its alarm driver. Returns how many
    /// were evicted.
    pub async fn evict_dormant(&self) -> usize {
        let evicted: Vec<(String, ActorEntry)> = {
            let mut actors = self.actors.lock().await;
            let mut dormant = Vec::new();
            for (identity, entry) in actors.iter() {
                // Anyone else holding the actor may be about to use it.
                if Arc::strong_count(&entry.actor) > REGISTRY_REFS {
                    continue;
                }
                match entry.actor.is_dormant().await {
                    Ok(true) => dormant.push(identity.clone()),
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!(identity = %identity, error = %e, "failed to check actor for eviction");
                    }
                }
            }
            dormant
                .into_iter()
                .filter_map(|identity| actors.remove_entry(&identity))
                .collect()
        };

        let count = evicted.len();
        for (identity, entry) in evicted {
            entry.cancel.cancel();
            if let Err(e) = entry.driver.await {
                tracing::warn!(identity = %identity, error = %e, "alarm driver ended abnormally");
            }
            tracing::info!(identity = %identity, "dormant container actor evicted");
        }
        count
    }

    /// Run [`evict_dormant`](Self::evict_dormant) every `every` until shutdown.
    pub fn spawn_reaper(self: &Arc<Self>, every: Duration) {
        let registry = Arc::clone(self);
        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = registry.evict_dormant().await;
                        if evicted > 0 {
                            tracing::debug!(evicted, "actor sweep finished");
                        }
                    }
                }
            }
        });
        *self.reaper.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
    }

    /// Stop every alarm driver and wait for them to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let reaper = self.reaper.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reaper) = reaper
            && let Err(e) = reaper.await
        {
            tracing::warn!(error = %e, "actor reaper ended abnormally");
        }

        let entries: Vec<ActorEntry> = self.actors.lock().await.drain().map(|(_, e)| e).collect();
        let count = entries.len();
        for entry in entries {
            if let Err(e) = entry.driver.await {
                tracing::warn!(error = %e, "alarm driver ended abnormally");
            }
        }
        tracing::info!(drivers = count, "container registry shut down");
    }
}

/// Identities become file names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty() || identity.len() > 128 {
        bail!("identity must be 1-128 characters long");
    }
    if !identity
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("invalid identity '{}': only letters, digits, '-' and '_' are allowed", identity);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::container::models::ScheduleWhen;
    use crate::container::testing::FakeControl;

    fn fake_factory() -> ControlFactory {
        Arc::new(|_identity: &str| -> Result<Arc<dyn ProcessControl>> {
            Ok(Arc::new(FakeControl::new()))
        })
    }

    #[test]
    fn identity_validation() {
        assert!(validate_identity("tenant-1_a").is_ok());
        assert!(validate_identity("").is_err());
        assert!(validate_identity("../etc").is_err());
        assert!(validate_identity("a b").is_err());
    }

    #[tokio::test]
    async fn same_identity_returns_same_actor() -> Result<()> {
        let registry = ActorRegistry::new(ContainerSettings::default(), None, fake_factory());
        let a = registry.get_or_create("alpha").await?;
        let b = registry.get_or_create("alpha").await?;
        let c = registry.get_or_create("beta").await?;
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.identities().await, vec!["alpha", "beta"]);
        registry.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn on_disk_storage_is_per_identity() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let data_dir = dir.path().join("actors");
        let registry =
            ActorRegistry::new(ContainerSettings::default(), Some(data_dir.clone()), fake_factory());
        registry.get_or_create("alpha").await?;
        assert!(data_dir.join("alpha.db").exists());
        registry.shutdown().await;
        Ok(())
    }

    fn shared_factory(control: Arc<FakeControl>) -> ControlFactory {
        Arc::new(move |_identity: &str| -> Result<Arc<dyn ProcessControl>> {
            let control: Arc<dyn ProcessControl> = control.clone();
            Ok(control)
        })
    }

    #[tokio::test]
    async fn dormant_actor_is_evicted_and_recreated() -> Result<()> {
        let control = Arc::new(FakeControl::new());
        let registry =
            ActorRegistry::new(ContainerSettings::default(), None, shared_factory(control.clone()));

        control.set_running(true);
        drop(registry.get_or_create("alpha").await?);
        assert_eq!(registry.evict_dormant().await, 0);

        control.set_running(false);
        assert_eq!(registry.evict_dormant().await, 1);
        assert!(registry.identities().await.is_empty());

        registry.get_or_create("alpha").await?;
        assert_eq!(registry.identities().await, vec!["alpha"]);
        registry.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn held_or_scheduled_actors_are_kept() -> Result<()> {
        let handlers = TaskHandlers::new()
            .register_fn("noop", |_actor, _payload, _task| async { anyhow::Ok(()) });
        let registry = ActorRegistry::new(ContainerSettings::default(), None, fake_factory())
            .with_handlers(handlers);

        let held = registry.get_or_create("held").await?;
        let queued = registry.get_or_create("queued").await?;
        queued
            .schedule(ScheduleWhen::Delay(Duration::from_secs(3_600)), "noop", ())
            .await?;
        drop(queued);

        assert_eq!(registry.evict_dormant().await, 0);
        assert_eq!(registry.identities().await, vec!["held", "queued"]);

        drop(held);
        assert_eq!(registry.evict_dormant().await, 1);
        assert_eq!(registry.identities().await, vec!["queued"]);
        registry.shutdown().await;
        Ok(())
    }

    #[tokio::test]
    async fn shutdown_refuses_new_actors() {
        let registry = ActorRegistry::new(ContainerSettings::default(), None, fake_factory());
        registry.shutdown().await;
        assert!(registry.get_or_create("late").await.is_err());
        assert!(registry.get("late").await.is_none());
    }
}
