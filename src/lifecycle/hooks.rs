//! Extension points for host applications.
//!
//! A host implements [`ServiceHooks`], overriding only what it needs; every
//! method has a default. [`DefaultHooks`] uses all of them and serves the
//! placeholder page, which makes the toolkit runnable on its own.

use async_trait::async_trait;
use axum::Router;

use crate::config::{ConfigTree, LoadedConfig};
use crate::context::AppContext;
use crate::http::placeholder_router;
use crate::lifecycle::signals::ProcessSignal;
use crate::net::RestartCommand;

/// Hooks called by the lifecycle, in this order on start:
/// `add_command_line_options`, `validate_user_config`, `setup`,
/// `configure_server` (if `needs_serving`), `start`.
#[async_trait]
pub trait ServiceHooks: Send + Sync {
    /// Whether the primary HTTP listener and server are wanted.
    fn needs_serving(&self) -> bool {
        true
    }

    /// Register extra command-line options before parsing.
    fn add_command_line_options(&self, command: clap::Command) -> clap::Command {
        command
    }

    /// Check application-specific settings in the environment section.
    fn validate_user_config(&self, _section: &ConfigTree) -> anyhow::Result<()> {
        Ok(())
    }

    /// Acquire application resources (own sockets, connections).
    async fn setup(&self, _ctx: &AppContext, graceful: bool) -> anyhow::Result<()> {
        tracing::info!(graceful, "Running default system setup");
        Ok(())
    }

    /// Build the router served on the primary listener.
    async fn configure_server(&self, _ctx: &AppContext, _graceful: bool) -> anyhow::Result<Router> {
        tracing::info!("Default http server set up");
        Ok(placeholder_router())
    }

    /// Start remaining custom services; listeners are ready.
    async fn start(&self, _ctx: &AppContext, _graceful: bool) -> anyhow::Result<()> {
        Ok(())
    }

    /// Release application resources. An error here is fatal.
    async fn shutdown(&self, _ctx: &AppContext, _graceful: bool) -> anyhow::Result<()> {
        Ok(())
    }

    /// Observe a termination or restart signal before the lifecycle acts.
    async fn on_signal(&self, _ctx: &AppContext, _signal: ProcessSignal) -> anyhow::Result<()> {
        Ok(())
    }

    /// Queue the application's own listeners for the restarted process,
    /// typically through [`RestartCommand::inherit_listener`].
    fn prepare_extra_files_for_child(
        &self,
        _ctx: &AppContext,
        _command: &mut RestartCommand,
        _new_config: &LoadedConfig,
    ) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Hooks with every default in place.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultHooks;

impl ServiceHooks for DefaultHooks {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn defaults_are_noops() {
        let ctx = AppContext::builder().args(["svc"]).build();
        let hooks = DefaultHooks;
        assert!(hooks.needs_serving());
        assert!(hooks.setup(&ctx, false).await.is_ok());
        assert!(hooks.start(&ctx, true).await.is_ok());
        assert!(hooks.shutdown(&ctx, false).await.is_ok());
        assert!(hooks.on_signal(&ctx, ProcessSignal::Terminate).await.is_ok());
        assert!(hooks.configure_server(&ctx, false).await.is_ok());

        let command = hooks.add_command_line_options(clap::Command::new("svc"));
        assert_eq!(command.get_arguments().count(), 0);

        let section = ConfigTree::parse("a = 1").unwrap();
        assert!(hooks.validate_user_config(&section).is_ok());

        let _: Arc<dyn ServiceHooks> = Arc::new(hooks);
    }
}
