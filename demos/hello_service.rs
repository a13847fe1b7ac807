//! A host application with its own listener next to the primary one.
//!
//! The `hello` listener is bound on `--helloport` (default 8081) and passed
//! to the restarted process as `GRACEFUL_HELLO_FD`, so both ports stay open
//! across `kill -USR1`.
//!
//! ```text
//! cargo run --example hello_service -- --env dev --config ./conf/config.toml
//! curl localhost:8081/world
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{extract::Path, routing::get, Router};

use svcboot::config::{ConfigTree, LoadedConfig, SocketKind};
use svcboot::http::{HttpServer, ServerHandle};
use svcboot::net::{prepare_listener, ListenerConfig, ListenerDescriptor};
use svcboot::{AppContext, Lifecycle, LifecycleError, RestartCommand, ServiceHooks};

const HELLO_SERVICE: &str = "hello";

#[derive(Default)]
struct HelloService {
    listener: Mutex<Option<ListenerDescriptor>>,
    server: Mutex<Option<ServerHandle>>,
}

async fn hello(Path(name): Path<String>) -> String {
    format!("Hello, {name}!\n")
}

#[async_trait]
impl ServiceHooks for HelloService {
    fn add_command_line_options(&self, command: clap::Command) -> clap::Command {
        command.arg(
            clap::Arg::new("helloport")
                .long("helloport")
                .default_value("8081")
                .help("Port of the hello listener"),
        )
    }

    fn validate_user_config(&self, section: &ConfigTree) -> anyhow::Result<()> {
        // Optional greeting section; only its type is checked.
        if section.contains(&["hello"]) {
            section.get_str(&["hello", "greeting"])?;
        }
        Ok(())
    }

    async fn setup(&self, ctx: &AppContext, graceful: bool) -> anyhow::Result<()> {
        let port = ctx
            .flags()
            .and_then(|f| f.get("helloport"))
            .unwrap_or("8081");
        let config = ListenerConfig::new(SocketKind::Tcp, format!("127.0.0.1:{port}"));
        let listener = prepare_listener(HELLO_SERVICE, graceful, &config)?;
        tracing::info!(address = ?listener.local_addr(), inherited = listener.is_inherited(), "Hello listener ready");
        *self.listener.lock().unwrap_or_else(|e| e.into_inner()) = Some(listener);
        Ok(())
    }

    async fn start(&self, _ctx: &AppContext, _graceful: bool) -> anyhow::Result<()> {
        let bound = self
            .listener
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("hello listener was not prepared"))?
            .take_listener()?;
        let router = Router::new().route("/{name}", get(hello));
        let handle = HttpServer::new(router, Duration::from_secs(5)).start(bound)?;
        *self.server.lock().unwrap_or_else(|e| e.into_inner()) = Some(handle);
        Ok(())
    }

    async fn shutdown(&self, _ctx: &AppContext, graceful: bool) -> anyhow::Result<()> {
        if graceful {
            // The listener goes to the child; keep serving until exit.
            return Ok(());
        }
        let server = self.server.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(server) = server {
            server.shutdown().await;
        }
        if let Some(mut listener) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            listener.close();
        }
        Ok(())
    }

    fn prepare_extra_files_for_child(
        &self,
        _ctx: &AppContext,
        command: &mut RestartCommand,
        _new_config: &LoadedConfig,
    ) -> anyhow::Result<()> {
        let mut slot = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(listener) = slot.as_mut() {
            let fd = command.inherit_listener(HELLO_SERVICE, listener)?;
            tracing::info!(fd, "Hello listener queued for the restarted process");
            listener.mark_handed_off();
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() {
    let ctx = AppContext::builder().build();
    let lifecycle = Lifecycle::new(Arc::clone(&ctx), Arc::new(HelloService::default()));

    match lifecycle.run().await {
        Ok(()) => ctx.exit_actions().exit(0),
        Err(LifecycleError::CommandLine(e)) => e.exit(),
        Err(e) => {
            eprintln!("hello_service: {e}");
            ctx.exit_actions().exit(e.exit_code());
        }
    }
}
