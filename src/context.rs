//! Application context.
//!
//! Everything the lifecycle shares between startup, signal handling and
//! shutdown lives here, behind one `Arc<AppContext>`. Independent contexts
//! do not see each other, which lets tests run several lifecycles in one
//! process (the tracing subscriber is the only process-wide piece).

use std::ffi::OsString;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, OnceLock};

use arc_swap::ArcSwapOption;

use crate::config::LoadedConfig;
use crate::environment::{CommandLineFlags, EnvironmentRegistry, ENV_VARIABLE};
use crate::http::ServerHandle;
use crate::lifecycle::exit::{ExitActions, Terminator};
use crate::lifecycle::signals::SighupHandlers;
use crate::lifecycle::state::{LifecycleState, StateMachine};
use crate::net::{ListenerDescriptor, RestartCommand, GRACEFUL_START_VALUE, GRACEFUL_START_VARIABLE};
use crate::observability::LogRegistry;
use crate::process::{LockFile, Pidfile};

/// Shared state of one service instance.
pub struct AppContext {
    args: Vec<OsString>,
    graceful: bool,
    environment: EnvironmentRegistry,
    flags: OnceLock<CommandLineFlags>,
    config: ArcSwapOption<LoadedConfig>,
    logs: LogRegistry,
    sighup: SighupHandlers,
    exit: ExitActions,
    lockfile: Mutex<Option<LockFile>>,
    pidfile: Mutex<Option<Pidfile>>,
    http_listener: Mutex<Option<ListenerDescriptor>>,
    http_server: Mutex<Option<ServerHandle>>,
    state: StateMachine,
    pub(crate) stop_lock: tokio::sync::Mutex<()>,
    restart_program: PathBuf,
    restart_args: Vec<OsString>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl AppContext {
    pub fn builder() -> AppContextBuilder {
        AppContextBuilder::default()
    }

    /// Command-line arguments, program name first.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    /// Whether this launch continues a graceful restart.
    pub fn is_graceful(&self) -> bool {
        self.graceful
    }

    pub fn environment(&self) -> &EnvironmentRegistry {
        &self.environment
    }

    /// Parsed flags; `None` before startup has parsed them.
    pub fn flags(&self) -> Option<&CommandLineFlags> {
        self.flags.get()
    }

    pub(crate) fn set_flags(&self, flags: CommandLineFlags) -> &CommandLineFlags {
        self.flags.get_or_init(|| flags)
    }

    /// Current configuration snapshot.
    pub fn config(&self) -> Option<Arc<LoadedConfig>> {
        self.config.load_full()
    }

    pub(crate) fn set_config(&self, config: Arc<LoadedConfig>) {
        self.config.store(Some(config));
    }

    pub fn logs(&self) -> &LogRegistry {
        &self.logs
    }

    pub fn sighup(&self) -> &SighupHandlers {
        &self.sighup
    }

    pub fn add_sighup_handler(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.sighup.add(handler);
    }

    pub fn exit_actions(&self) -> &ExitActions {
        &self.exit
    }

    /// Register cleanup to run before the process exits.
    pub fn add_exit_action(&self, action: impl FnOnce() + Send + 'static) {
        self.exit.add(action);
    }

    pub fn state(&self) -> LifecycleState {
        self.state.current()
    }

    pub(crate) fn state_machine(&self) -> &StateMachine {
        &self.state
    }

    /// Bound address of the primary HTTP listener (tcp only).
    pub fn http_local_addr(&self) -> Option<SocketAddr> {
        lock(&self.http_listener).as_ref().and_then(|l| l.local_addr())
    }

    pub(crate) fn http_listener(&self) -> MutexGuard<'_, Option<ListenerDescriptor>> {
        lock(&self.http_listener)
    }

    pub(crate) fn set_http_listener(&self, listener: ListenerDescriptor) {
        *lock(&self.http_listener) = Some(listener);
    }

    /// Remove the primary listener from the context. Dropping it closes
    /// this process's copy of the socket.
    pub fn take_http_listener(&self) -> Option<ListenerDescriptor> {
        lock(&self.http_listener).take()
    }

    pub(crate) fn set_http_server(&self, server: ServerHandle) {
        *lock(&self.http_server) = Some(server);
    }

    /// Remove the running server; the caller decides when to shut it down.
    pub fn take_http_server(&self) -> Option<ServerHandle> {
        lock(&self.http_server).take()
    }

    pub(crate) fn set_lockfile(&self, file: LockFile) {
        *lock(&self.lockfile) = Some(file);
    }

    pub(crate) fn set_pidfile(&self, file: Pidfile) {
        *lock(&self.pidfile) = Some(file);
    }

    /// Release the lock file and remove the pid file, if held.
    pub(crate) fn release_process_files(&self) {
        if let Some(file) = lock(&self.lockfile).take() {
            file.release();
        }
        if let Some(file) = lock(&self.pidfile).take() {
            file.remove();
        }
    }

    /// A fresh re-exec command for this process.
    pub fn restart_command(&self) -> RestartCommand {
        RestartCommand::new(self.restart_program.clone(), self.restart_args.iter().cloned())
    }
}

/// Builder for [`AppContext`].
#[derive(Default)]
pub struct AppContextBuilder {
    args: Option<Vec<OsString>>,
    graceful: Option<bool>,
    env_variable: Option<String>,
    restart: Option<(PathBuf, Vec<OsString>)>,
    terminator: Option<Terminator>,
}

impl AppContextBuilder {
    /// Arguments to parse instead of the process's own.
    pub fn args<I, T>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        self.args = Some(args.into_iter().map(Into::into).collect());
        self
    }

    /// Override detection of `GRACEFUL_START=YES`.
    pub fn graceful(mut self, graceful: bool) -> Self {
        self.graceful = Some(graceful);
        self
    }

    /// Variable consulted when `--env` is absent.
    pub fn env_variable(mut self, name: impl Into<String>) -> Self {
        self.env_variable = Some(name.into());
        self
    }

    /// Program and arguments used to re-execute on graceful restart.
    pub fn restart_program<I, T>(mut self, program: impl Into<PathBuf>, args: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString>,
    {
        self.restart = Some((program.into(), args.into_iter().map(Into::into).collect()));
        self
    }

    /// Final process exit; `std::process::exit` unless replaced.
    pub fn terminator(mut self, terminator: Terminator) -> Self {
        self.terminator = Some(terminator);
        self
    }

    pub fn build(self) -> Arc<AppContext> {
        let args = self.args.unwrap_or_else(|| std::env::args_os().collect());
        let graceful = self.graceful.unwrap_or_else(|| {
            std::env::var(GRACEFUL_START_VARIABLE).is_ok_and(|v| v == GRACEFUL_START_VALUE)
        });
        let (restart_program, restart_args) = self.restart.unwrap_or_else(|| {
            let program = std::env::current_exe()
                .ok()
                .or_else(|| args.first().map(PathBuf::from))
                .unwrap_or_default();
            (program, args.iter().skip(1).cloned().collect())
        });
        let exit = self.terminator.map(ExitActions::new).unwrap_or_default();

        Arc::new(AppContext {
            args,
            graceful,
            environment: EnvironmentRegistry::with_variable(
                self.env_variable.unwrap_or_else(|| ENV_VARIABLE.to_string()),
            ),
            flags: OnceLock::new(),
            config: ArcSwapOption::empty(),
            logs: LogRegistry::new(),
            sighup: SighupHandlers::new(),
            exit,
            lockfile: Mutex::new(None),
            pidfile: Mutex::new(None),
            http_listener: Mutex::new(None),
            http_server: Mutex::new(None),
            state: StateMachine::new(),
            stop_lock: tokio::sync::Mutex::new(()),
            restart_program,
            restart_args,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builder_defaults() {
        let ctx = AppContext::builder()
            .args(["svc", "--env", "dev"])
            .graceful(false)
            .build();
        assert_eq!(ctx.args().len(), 3);
        assert!(!ctx.is_graceful());
        assert!(ctx.config().is_none());
        assert!(ctx.flags().is_none());
        assert_eq!(ctx.state(), LifecycleState::Created);
        assert_eq!(ctx.environment().variable(), "ENV");
        assert!(ctx.http_local_addr().is_none());

        let cmd = ctx.restart_command();
        assert_eq!(cmd.args(), &[OsString::from("--env"), OsString::from("dev")]);
    }

    #[test]
    fn restart_template_can_be_replaced() {
        let ctx = AppContext::builder()
            .args(["svc"])
            .env_variable("SVC_ENV")
            .restart_program("/usr/bin/env", ["true"])
            .build();
        let cmd = ctx.restart_command();
        assert_eq!(cmd.program(), std::path::Path::new("/usr/bin/env"));
        assert_eq!(cmd.args(), &[OsString::from("true")]);
        assert_eq!(ctx.environment().variable(), "SVC_ENV");
    }

    #[test]
    fn exit_actions_use_injected_terminator() {
        use std::sync::atomic::{AtomicI32, Ordering};
        let code = Arc::new(AtomicI32::new(-1));
        let seen = code.clone();
        let ctx = AppContext::builder()
            .args(["svc"])
            .terminator(Arc::new(move |c| seen.store(c, Ordering::SeqCst)))
            .build();
        ctx.add_exit_action(|| {});
        ctx.exit_actions().exit(7);
        assert_eq!(code.load(Ordering::SeqCst), 7);
        assert!(ctx.exit_actions().is_empty());
    }
}
