//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Startup (startup.rs):
//!     Flags → Environment → Config (validated) → Workdir
//!     → [setuid bootstrap: bind, then graceful stop as the target user]
//!     → Lock/pid files → SIGHUP wiring → hooks.setup
//!     → Listener + server (if serving) → hooks.start
//!
//! Signals (signals.rs):
//!     SIGTERM/SIGINT → hooks.on_signal → non-graceful stop → exit actions → exit
//!     SIGUSR1        → hooks.on_signal → graceful stop (re-exec, handoff)
//!     SIGHUP         → registered handlers (log reopen, certificate reload)
//!
//! Shutdown (shutdown.rs):
//!     Graceful:     reload config → hooks.shutdown → release files
//!                   → spawn child with inherited listeners → exit(0)
//!     Non-graceful: stop server → close listener → hooks.shutdown
//!                   → release logs and files → NormalExit to caller
//! ```
//!
//! # Design Decisions
//! - Every stage failure maps to one exit code ([`LifecycleError::exit_code`])
//! - Stop sequences are totally ordered by a mutex and checked against an
//!   explicit state machine (state.rs)
//! - Failures after teardown has begun are fatal: log, then terminate

pub mod exit;
pub mod hooks;
pub mod shutdown;
pub mod signals;
pub mod startup;
pub mod state;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

use crate::config::ConfigError;
use crate::context::AppContext;
use crate::environment::EnvError;
use crate::http::ServerError;
use crate::net::tls::TlsError;
use crate::net::ListenerError;
use crate::observability::LogError;
use crate::process::{LockError, PidfileError, SetuidError};

pub use exit::{ExitActions, ExitCode, Terminator, FATAL_EXIT_CODE};
pub use hooks::{DefaultHooks, ServiceHooks};
pub use shutdown::Shutdown;
pub use signals::{ProcessSignal, SighupHandlers, SignalRouter};
pub use state::{LifecycleEvent, LifecycleState, StateMachine, TransitionError};

/// Hook phase a user error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Setup,
    ConfigureServer,
    Start,
    Shutdown,
    PrepareExtraFiles,
}

impl std::fmt::Display for HookPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            HookPhase::Setup => "setup",
            HookPhase::ConfigureServer => "configure_server",
            HookPhase::Start => "start",
            HookPhase::Shutdown => "shutdown",
            HookPhase::PrepareExtraFiles => "prepare_extra_files_for_child",
        })
    }
}

/// Error type for lifecycle stages.
#[derive(Debug, Error)]
pub enum LifecycleError {
    #[error("{0}")]
    CommandLine(#[from] clap::Error),

    #[error("{0}")]
    Environment(#[from] EnvError),

    #[error("{0}")]
    Config(#[from] ConfigError),

    #[error("cannot use working directory {}: {source}", path.display())]
    Workdir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{0}")]
    Log(#[from] LogError),

    #[error("{0}")]
    Setuid(#[from] SetuidError),

    #[error("{0}")]
    Lockfile(#[from] LockError),

    #[error("{0}")]
    Pidfile(#[from] PidfileError),

    #[error("cannot install signal handlers: {0}")]
    SignalSetup(#[source] std::io::Error),

    #[error("{0}")]
    Listener(#[from] ListenerError),

    #[error("{0}")]
    Tls(#[from] TlsError),

    #[error("{0}")]
    Server(#[from] ServerError),

    #[error("{phase} hook failed: {source:#}")]
    UserHook {
        phase: HookPhase,
        #[source]
        source: anyhow::Error,
    },

    #[error("application start failed: {0:#}")]
    CustomApp(#[source] anyhow::Error),

    #[error("{0}")]
    InvalidTransition(#[from] TransitionError),

    #[error("inconsistent state: {0}")]
    FatalState(String),

    #[error("cannot spawn restarted process: {0}")]
    Spawn(#[source] std::io::Error),
}

impl LifecycleError {
    /// Process exit code for this failure.
    pub fn exit_code(&self) -> i32 {
        let code = match self {
            LifecycleError::Environment(_) => ExitCode::WrongEnv,
            LifecycleError::CommandLine(_)
            | LifecycleError::Config(_)
            | LifecycleError::Workdir { .. }
            | LifecycleError::Log(_)
            | LifecycleError::SignalSetup(_) => ExitCode::ConfigError,
            LifecycleError::Lockfile(_) | LifecycleError::Pidfile(_) => ExitCode::LockfileError,
            LifecycleError::Setuid(_) => ExitCode::SuidError,
            LifecycleError::Listener(_) | LifecycleError::Tls(_) | LifecycleError::Server(_) => {
                ExitCode::HttpStartError
            }
            LifecycleError::UserHook { .. } => ExitCode::UserHookError,
            LifecycleError::CustomApp(_) => ExitCode::CustomAppError,
            LifecycleError::InvalidTransition(_)
            | LifecycleError::FatalState(_)
            | LifecycleError::Spawn(_) => return FATAL_EXIT_CODE,
        };
        code.as_i32()
    }
}

/// Drives one service through start, signal handling and stop.
#[derive(Clone)]
pub struct Lifecycle {
    ctx: Arc<AppContext>,
    hooks: Arc<dyn ServiceHooks>,
}

impl Lifecycle {
    pub fn new(ctx: Arc<AppContext>, hooks: Arc<dyn ServiceHooks>) -> Self {
        Self { ctx, hooks }
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    /// The shared context, for handing to other tasks.
    pub fn context_arc(&self) -> Arc<AppContext> {
        Arc::clone(&self.ctx)
    }

    pub fn hooks(&self) -> &dyn ServiceHooks {
        self.hooks.as_ref()
    }

    /// Start, then handle signals until the process stops.
    pub async fn run(&self) -> Result<(), LifecycleError> {
        self.start().await?;
        if self.ctx.state() != LifecycleState::Running {
            // The setuid bootstrap already handed over to a child.
            return Ok(());
        }

        let router = SignalRouter::new(self.clone());
        router.listen().map_err(LifecycleError::SignalSetup)?;
        tracing::info!(pid = std::process::id(), "Service running");
        router.run().await;
        Ok(())
    }
}
