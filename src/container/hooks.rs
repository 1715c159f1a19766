use async_trait::async_trait;

use super::models::StopParams;
use crate::errors::SupervisorError;

/// Lifecycle callbacks an embedder can override. Every method has a default,
/// so `DefaultHooks` is a complete implementation.
#[async_trait]
pub trait LifecycleHooks: Send + Sync {
    /// Fires inside the exclusive start section once every required port is ready.
    async fn on_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Fires once per observed process exit.
    async fn on_stop(&self, params: StopParams) -> anyhow::Result<()> {
        tracing::info!(
            exit_code = params.exit_code,
            reason = params.reason.as_str(),
            "container stopped"
        );
        Ok(())
    }

    /// Receives unclassified and fatal errors. Callers re-raise the error
    /// after this returns, so the default only logs.
    async fn on_error(&self, error: &SupervisorError) {
        tracing::error!(error = %error, "container error");
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl LifecycleHooks for DefaultHooks {}
