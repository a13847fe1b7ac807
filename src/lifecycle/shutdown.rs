//! Stop sequences: non-graceful teardown and graceful restart.
//!
//! # Ordering
//! ```text
//! StopRequested (under the stop mutex)
//!   → [graceful] reload + validate config from disk
//!   → stop SIGHUP handling
//!   → [non-graceful] server shutdown (bounded), close listener
//!   → hooks.shutdown
//!   → drop log sinks, release lock file, remove pid file
//!   → [graceful] spawn child with inherited listeners, exit(0)
//!   → [non-graceful] NormalExit to the caller
//! ```
//!
//! Once teardown has begun there is nothing to roll back to, so every
//! failure past the state check is fatal: logged, then the terminator runs
//! with [`FATAL_EXIT_CODE`].

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::config::{read_config, ConfigError, LoadedConfig};
use crate::lifecycle::exit::{ExitCode, FATAL_EXIT_CODE};
use crate::lifecycle::state::LifecycleEvent;
use crate::lifecycle::{HookPhase, Lifecycle, LifecycleError};
use crate::net::{HandoffDecision, ListenerConfig};
use crate::observability::{HTTP_SINK, SYSTEM_SINK};
use crate::process::SetuidTarget;

/// Service name of the primary HTTP listener (`GRACEFUL_HTTP_FD`).
pub const HTTP_SERVICE: &str = "http";

/// One-shot stop notification for background loops.
///
/// Loops subscribe and `select!` on the receiver; `trigger` wakes all of them.
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Loops still subscribed.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    /// Stop the service.
    ///
    /// Graceful: re-execute the program, passing the primary listener (and
    /// whatever the hooks add) to the child, then exit the process with 0.
    /// With `setuid` the child runs as that user in a new session.
    ///
    /// Non-graceful: release everything and return [`ExitCode::NormalExit`];
    /// the caller terminates the process.
    pub async fn stop(
        &self,
        graceful: bool,
        setuid: Option<SetuidTarget>,
    ) -> Result<ExitCode, LifecycleError> {
        let ctx = self.context();
        let _guard = ctx.stop_lock.lock().await;
        ctx.state_machine()
            .apply(LifecycleEvent::StopRequested { graceful })?;
        tracing::info!(graceful, "Stopping service");

        match self.stop_sequence(graceful, setuid).await {
            Ok(code) => Ok(code),
            Err(e) => {
                tracing::error!(error = %e, graceful, "Stop failed, terminating");
                let _ = ctx.state_machine().apply(LifecycleEvent::Aborted);
                ctx.exit_actions().terminate(FATAL_EXIT_CODE);
                Err(e)
            }
        }
    }

    async fn stop_sequence(
        &self,
        graceful: bool,
        setuid: Option<SetuidTarget>,
    ) -> Result<ExitCode, LifecycleError> {
        let ctx = self.context();
        let env = ctx
            .environment()
            .current()
            .map_err(|e| LifecycleError::FatalState(e.to_string()))?;
        let current = ctx
            .config()
            .ok_or_else(|| LifecycleError::FatalState("configuration is not loaded".into()))?;

        let next = if graceful {
            // The restart picks up edits made since the last load.
            let tree = read_config(current.path())?;
            let reloaded = LoadedConfig::from_tree(current.path().to_path_buf(), env, tree)?;
            self.validate_user_config(&reloaded)?;
            let reloaded = Arc::new(reloaded);
            ctx.set_config(Arc::clone(&reloaded));
            reloaded
        } else {
            Arc::clone(&current)
        };

        ctx.sighup().cleanup();

        if !graceful {
            if let Some(server) = ctx.take_http_server() {
                server.shutdown().await;
            }
            if let Some(mut listener) = ctx.take_http_listener() {
                listener.close();
            }
        }

        self.hooks()
            .shutdown(ctx, graceful)
            .await
            .map_err(|source| LifecycleError::UserHook {
                phase: HookPhase::Shutdown,
                source,
            })?;

        ctx.logs().drop_sink(HTTP_SINK);
        if !graceful {
            ctx.logs().drop_sink(SYSTEM_SINK);
        }
        ctx.release_process_files();

        if !graceful {
            ctx.state_machine().apply(LifecycleEvent::ResourcesReleased)?;
            tracing::info!("Service stopped");
            return Ok(ExitCode::NormalExit);
        }

        let pid = self.spawn_child(&current, &next, setuid)?;
        println!("Spawned process {pid}, exiting");
        ctx.logs().drop_all();
        ctx.state_machine().apply(LifecycleEvent::ChildSpawned)?;
        ctx.exit_actions().exit(ExitCode::NormalExit.as_i32());
        Ok(ExitCode::NormalExit)
    }

    /// Build the re-exec command and start the child.
    fn spawn_child(
        &self,
        current: &LoadedConfig,
        next: &LoadedConfig,
        setuid: Option<SetuidTarget>,
    ) -> Result<u32, LifecycleError> {
        let ctx = self.context();
        let mut command = ctx.restart_command();

        // Scoped: hooks below may read the listener through the context.
        let reused = match ctx.http_listener().as_ref() {
            Some(listener) => {
                let old = ListenerConfig::from_http(&current.service().http);
                let new = ListenerConfig::from_http(&next.service().http);
                match HandoffDecision::decide(&old, &new) {
                    HandoffDecision::Reuse => {
                        command.inherit_listener(HTTP_SERVICE, listener)?;
                        true
                    }
                    HandoffDecision::Rebind => {
                        tracing::info!(
                            old = %old.address,
                            new = %new.address,
                            "HTTP address changed, restarted process binds a fresh listener"
                        );
                        false
                    }
                }
            }
            None => false,
        };

        if let Some(target) = setuid {
            tracing::info!(uid = target.uid_raw(), gid = target.gid_raw(), "Restarting with new credentials");
            command.set_credentials(target);
        }

        self.hooks()
            .prepare_extra_files_for_child(ctx, &mut command, next)
            .map_err(|source| LifecycleError::UserHook {
                phase: HookPhase::PrepareExtraFiles,
                source,
            })?;

        let pid = command.spawn().map_err(LifecycleError::Spawn)?;
        if reused {
            if let Some(listener) = ctx.http_listener().as_mut() {
                listener.mark_handed_off();
            }
        }
        Ok(pid)
    }

    /// Run the application's check on the active environment section.
    pub(crate) fn validate_user_config(&self, config: &LoadedConfig) -> Result<(), LifecycleError> {
        let section = config.env_section().map_err(ConfigError::from)?;
        self.hooks()
            .validate_user_config(&section)
            .map_err(|e| ConfigError::User(e).into())
    }
}
