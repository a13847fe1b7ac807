//! Startup sequence.
//!
//! Each stage fails fast with its own [`LifecycleError`] variant, which
//! fixes the exit code. Nothing with side effects (chdir, lock, pid, bind)
//! happens before the configuration has been fully validated.

use std::path::Path;
use std::sync::Arc;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::schema::{ServiceConfig, SslConfig};
use crate::config::{read_config, LoadedConfig};
use crate::environment::{CommandLineFlags, EnvError, Environment};
use crate::http::HttpServer;
use crate::lifecycle::shutdown::HTTP_SERVICE;
use crate::lifecycle::state::{LifecycleEvent, LifecycleState};
use crate::lifecycle::{HookPhase, Lifecycle, LifecycleError};
use crate::net::tls::load_tls_config;
use crate::net::{prepare_listener, ListenerConfig};
use crate::process::{LockFile, Pidfile, SetuidTarget};

/// Environment used when neither `--env` nor the variable is set.
const DEFAULT_ENVIRONMENT: &str = "prod";

impl Lifecycle {
    /// Bring the service up. On success the state is `Running`, or
    /// `Terminated` when the setuid bootstrap handed over to a child.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let ctx = self.context();
        ctx.logs().activate();
        ctx.state_machine().apply(LifecycleEvent::BeginStart)?;

        match self.start_sequence().await {
            Ok(()) => Ok(()),
            Err(e) => {
                tracing::error!(error = %e, code = e.exit_code(), "Start failed");
                if ctx.state() == LifecycleState::Starting {
                    self.abandon_start().await;
                }
                Err(e)
            }
        }
    }

    async fn start_sequence(&self) -> Result<(), LifecycleError> {
        let ctx = self.context();
        let hooks = self.hooks();
        let graceful = ctx.is_graceful();

        let flags = CommandLineFlags::parse(ctx.args().iter().cloned(), |command| {
            hooks.add_command_line_options(command)
        })?;
        let flags = ctx.set_flags(flags);
        let env = self.resolve_environment(flags.env())?;
        tracing::info!(env = %env, graceful, pid = std::process::id(), "Starting service");

        let path = flags.config_path();
        let tree = read_config(&path)?;
        // Absolute, so a later workdir change does not break the reload.
        let path = path.canonicalize().unwrap_or(path);
        let config = LoadedConfig::from_tree(path, env, tree)?;
        self.validate_user_config(&config)?;
        let config = Arc::new(config);
        ctx.set_config(Arc::clone(&config));
        let service = config.service();

        change_workdir(&service.workdir)?;

        if service.wants_setuid() && !graceful {
            return self.setuid_bootstrap(service).await;
        }

        if let Some(lockfile) = service.lockfile.as_ref().filter(|l| l.lockfile) {
            ctx.set_lockfile(LockFile::acquire(Path::new(&lockfile.file))?);
        }
        if service.pidfile.pidfile {
            ctx.set_pidfile(Pidfile::create(Path::new(&service.pidfile.file))?);
        }

        ctx.sighup().setup().map_err(LifecycleError::SignalSetup)?;
        ctx.logs().configure(&service.logs)?;
        let logs = ctx.logs().clone();
        ctx.add_sighup_handler(move || {
            let reopened = logs.reopen_rotated();
            tracing::info!(files = reopened, "Log files reopened");
        });

        hooks
            .setup(ctx, graceful)
            .await
            .map_err(|source| LifecycleError::UserHook {
                phase: HookPhase::Setup,
                source,
            })?;

        if hooks.needs_serving() {
            self.start_http(service).await?;
        }

        hooks
            .start(ctx, graceful)
            .await
            .map_err(LifecycleError::CustomApp)?;

        ctx.state_machine().apply(LifecycleEvent::Started)?;
        tracing::info!(
            env = %env,
            address = ?ctx.http_local_addr(),
            "Service started"
        );
        Ok(())
    }

    /// `--env` wins; otherwise the variable, or prod when it is empty.
    fn resolve_environment(&self, flag: Option<&str>) -> Result<Environment, EnvError> {
        let registry = self.context().environment();
        match flag {
            Some(tag) => registry.resolve(false, Some(tag)),
            None if registry.variable_is_empty() => registry.resolve(false, Some(DEFAULT_ENVIRONMENT)),
            None => registry.resolve(false, None),
        }
    }

    /// Bind as the current (privileged) user, then restart as the target
    /// user keeping the listener.
    async fn setuid_bootstrap(&self, service: &ServiceConfig) -> Result<(), LifecycleError> {
        let ctx = self.context();
        self.hooks()
            .setup(ctx, false)
            .await
            .map_err(|source| LifecycleError::UserHook {
                phase: HookPhase::Setup,
                source,
            })?;

        if self.hooks().needs_serving() {
            let config = ListenerConfig::from_http(&service.http);
            ctx.set_http_listener(prepare_listener(HTTP_SERVICE, false, &config)?);
        }

        let setuid = service
            .setuid
            .as_ref()
            .ok_or_else(|| LifecycleError::FatalState("setuid section vanished".into()))?;
        let target = SetuidTarget::from_config(setuid)?;
        tracing::info!(user = %setuid.user, group = %setuid.group, "Restarting as unprivileged user");

        self.stop(true, Some(target)).await?;
        Ok(())
    }

    async fn start_http(&self, service: &ServiceConfig) -> Result<(), LifecycleError> {
        let ctx = self.context();
        let http = &service.http;
        let mut listener =
            prepare_listener(HTTP_SERVICE, ctx.is_graceful(), &ListenerConfig::from_http(http))?;
        let bound = listener.take_listener()?;
        ctx.set_http_listener(listener);

        let router = self
            .hooks()
            .configure_server(ctx, ctx.is_graceful())
            .await
            .map_err(|source| LifecycleError::UserHook {
                phase: HookPhase::ConfigureServer,
                source,
            })?;

        let mut server = HttpServer::new(router, http.shutdown_timeout());
        if http.ssl.ssl {
            let tls = load_tls_config(&http.ssl).await?;
            self.reload_certificate_on_sighup(tls.clone(), http.ssl.clone());
            server = server.with_tls(tls);
        }

        let handle = server.start(bound)?;
        tracing::info!(address = handle.address(), tls = http.ssl.ssl, "HTTP server started");
        ctx.set_http_server(handle);
        Ok(())
    }

    fn reload_certificate_on_sighup(&self, tls: RustlsConfig, ssl: SslConfig) {
        let runtime = tokio::runtime::Handle::current();
        self.context().add_sighup_handler(move || {
            match runtime.block_on(tls.reload_from_pem_file(&ssl.cert, &ssl.key)) {
                Ok(()) => tracing::info!(cert = %ssl.cert, "TLS certificate reloaded"),
                Err(e) => tracing::error!(cert = %ssl.cert, error = %e, "TLS certificate reload failed"),
            }
        });
    }

    /// Undo whatever a failed start acquired.
    async fn abandon_start(&self) {
        let ctx = self.context();
        if let Some(server) = ctx.take_http_server() {
            server.shutdown().await;
        }
        if let Some(mut listener) = ctx.take_http_listener() {
            listener.close();
        }
        ctx.sighup().cleanup();
        ctx.release_process_files();
        let _ = ctx.state_machine().apply(LifecycleEvent::StartFailed);
    }
}

fn change_workdir(workdir: &str) -> Result<(), LifecycleError> {
    if workdir.is_empty() {
        return Ok(());
    }
    let path = Path::new(workdir);
    std::env::set_current_dir(path).map_err(|source| LifecycleError::Workdir {
        path: path.to_path_buf(),
        source,
    })?;
    tracing::info!(workdir, "Working directory changed");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::AppContext;
    use crate::lifecycle::exit::ExitCode;
    use crate::lifecycle::hooks::{DefaultHooks, ServiceHooks};
    use std::io::Write;

    fn config_file(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    const MINIMAL: &str = r#"
[test.pidfile]
pidfile = false
[test.logs.system]
output = "null"
[test.logs.http]
output = "null"
[test.http]
shutdown_timeout = 1000
ssl = { ssl = false }
http2 = { http2 = false }
socket_type = "tcp"
address = "127.0.0.1:0"
domain = "localhost"
"#;

    fn lifecycle(args: &[&str], hooks: Arc<dyn ServiceHooks>) -> Lifecycle {
        let ctx = AppContext::builder()
            .args(args.iter().copied())
            .graceful(false)
            .terminator(Arc::new(|_| {}))
            .build();
        Lifecycle::new(ctx, hooks)
    }

    #[tokio::test]
    async fn wrong_environment_is_reported() {
        let file = config_file(MINIMAL);
        let path = file.path().to_str().unwrap();
        let lc = lifecycle(&["svc", "--env", "qa", "--config", path], Arc::new(DefaultHooks));
        let err = lc.start().await.unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::WrongEnv.as_i32());
        assert_eq!(lc.context().state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn missing_config_is_config_error() {
        let lc = lifecycle(
            &["svc", "--env", "test", "--config", "/nonexistent/svcboot.toml"],
            Arc::new(DefaultHooks),
        );
        let err = lc.start().await.unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::ConfigError.as_i32());
    }

    #[tokio::test]
    async fn user_config_rejection_is_config_error() {
        struct Picky;
        impl ServiceHooks for Picky {
            fn validate_user_config(&self, section: &crate::config::ConfigTree) -> anyhow::Result<()> {
                section.get_str(&["app", "name"])?;
                Ok(())
            }
        }

        let file = config_file(MINIMAL);
        let path = file.path().to_str().unwrap();
        let lc = lifecycle(&["svc", "--env", "test", "--config", path], Arc::new(Picky));
        let err = lc.start().await.unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::ConfigError.as_i32());
        assert!(lc.context().http_local_addr().is_none());
    }

    #[tokio::test]
    async fn failing_start_hook_releases_listener() {
        struct Broken;
        #[async_trait::async_trait]
        impl ServiceHooks for Broken {
            async fn start(&self, _ctx: &AppContext, _graceful: bool) -> anyhow::Result<()> {
                anyhow::bail!("worker pool refused to start")
            }
        }

        let file = config_file(MINIMAL);
        let path = file.path().to_str().unwrap();
        let lc = lifecycle(&["svc", "--env", "test", "--config", path], Arc::new(Broken));
        let err = lc.start().await.unwrap_err();
        assert_eq!(err.exit_code(), ExitCode::CustomAppError.as_i32());
        assert!(lc.context().take_http_listener().is_none());
        assert_eq!(lc.context().state(), LifecycleState::Terminated);
    }

    #[tokio::test]
    async fn start_then_stop_without_serving() {
        struct Quiet;
        impl ServiceHooks for Quiet {
            fn needs_serving(&self) -> bool {
                false
            }
        }

        let file = config_file(MINIMAL);
        let path = file.path().to_str().unwrap();
        let lc = lifecycle(&["svc", "-env", "test", "-config", path], Arc::new(Quiet));
        lc.start().await.unwrap();
        assert_eq!(lc.context().state(), LifecycleState::Running);
        assert!(lc.context().http_local_addr().is_none());
        assert_eq!(lc.context().flags().unwrap().env(), Some("test"));

        assert_eq!(lc.stop(false, None).await.unwrap(), ExitCode::NormalExit);
        assert_eq!(lc.context().state(), LifecycleState::Terminated);
        assert!(matches!(
            lc.stop(false, None).await,
            Err(LifecycleError::InvalidTransition(_))
        ));
    }
}
