//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Wrap the application router with request-id, tracing and access-log layers
//! - Serve it on a prepared tcp or unix listener in a background task
//! - Optionally terminate TLS (tcp only) through axum-server + rustls
//! - Shut down within the configured bound, aborting stragglers

use std::future::IntoFuture;
use std::time::Duration;

use axum::{http::Uri, middleware, Router};
use axum_server::tls_rustls::RustlsConfig;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceBuilder;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::http::access_log::access_log;
use crate::net::listener::BoundListener;
use crate::observability::ACCESS_LOG_TARGET;

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("cannot register listener with the runtime: {0}")]
    Runtime(#[source] std::io::Error),
    #[error("TLS is only supported on tcp listeners")]
    TlsOverUnix,
}

/// Body served by the default hooks.
pub fn placeholder_text(path: &str) -> String {
    format!(
        "This is the default svcboot service. Implement ServiceHooks to serve your own application. URI: {}",
        path
    )
}

/// Router answering every path with the placeholder page.
pub fn placeholder_router() -> Router {
    async fn placeholder(uri: Uri) -> String {
        placeholder_text(uri.path())
    }
    Router::new().fallback(placeholder)
}

/// HTTP server for one prepared listener.
pub struct HttpServer {
    router: Router,
    tls: Option<RustlsConfig>,
    shutdown_timeout: Duration,
}

impl HttpServer {
    /// Create a server for `app`, draining for at most `shutdown_timeout`.
    pub fn new(app: Router, shutdown_timeout: Duration) -> Self {
        Self {
            router: Self::build_router(app),
            tls: None,
            shutdown_timeout,
        }
    }

    pub fn with_tls(mut self, tls: RustlsConfig) -> Self {
        self.tls = Some(tls);
        self
    }

    /// Build the Axum router with all middleware layers.
    fn build_router(app: Router) -> Router {
        // Outermost first: the id exists before tracing and access logging.
        app.layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(TraceLayer::new_for_http())
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(middleware::from_fn(access_log)),
        )
    }

    /// Start serving in a background task. Must run inside a Tokio runtime.
    pub fn start(self, listener: BoundListener) -> Result<ServerHandle, ServerError> {
        let timeout = self.shutdown_timeout;
        match (listener, self.tls) {
            (BoundListener::Tcp(std_listener), Some(tls)) => {
                let address = local_address(&std_listener);
                let handle = axum_server::Handle::new();
                let server = axum_server::from_tcp_rustls(std_listener, tls)
                    .handle(handle.clone())
                    .serve(self.router.into_make_service());
                let task = spawn_serve(address.clone(), server);
                Ok(ServerHandle::new(task, Trigger::Tls(handle), timeout, address))
            }
            (BoundListener::Tcp(std_listener), None) => {
                let address = local_address(&std_listener);
                let listener =
                    tokio::net::TcpListener::from_std(std_listener).map_err(ServerError::Runtime)?;
                let (tx, rx) = oneshot::channel::<()>();
                let server = axum::serve(listener, self.router).with_graceful_shutdown(async {
                    let _ = rx.await;
                });
                let task = spawn_serve(address.clone(), server.into_future());
                Ok(ServerHandle::new(task, Trigger::Signal(tx), timeout, address))
            }
            (BoundListener::Unix(std_listener), None) => {
                let address = std_listener
                    .local_addr()
                    .ok()
                    .and_then(|a| a.as_pathname().map(|p| p.display().to_string()))
                    .unwrap_or_else(|| "unix".to_string());
                let listener =
                    tokio::net::UnixListener::from_std(std_listener).map_err(ServerError::Runtime)?;
                let (tx, rx) = oneshot::channel::<()>();
                let server = axum::serve(listener, self.router).with_graceful_shutdown(async {
                    let _ = rx.await;
                });
                let task = spawn_serve(address.clone(), server.into_future());
                Ok(ServerHandle::new(task, Trigger::Signal(tx), timeout, address))
            }
            (BoundListener::Unix(_), Some(_)) => Err(ServerError::TlsOverUnix),
        }
    }
}

fn local_address(listener: &std::net::TcpListener) -> String {
    listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_else(|_| "tcp".to_string())
}

fn spawn_serve<F>(address: String, serve: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = std::io::Result<()>> + Send + 'static,
{
    tracing::info!(address = %address, "HTTP server starting");
    tokio::spawn(async move {
        match serve.await {
            Ok(()) => tracing::info!(address = %address, "HTTP server stopped"),
            Err(e) => {
                tracing::error!(target: ACCESS_LOG_TARGET, address = %address, error = %e, "HTTP serve error")
            }
        }
    })
}

enum Trigger {
    Signal(oneshot::Sender<()>),
    Tls(axum_server::Handle),
}

/// A running server.
pub struct ServerHandle {
    task: JoinHandle<()>,
    trigger: Trigger,
    timeout: Duration,
    address: String,
}

impl ServerHandle {
    fn new(task: JoinHandle<()>, trigger: Trigger, timeout: Duration, address: String) -> Self {
        Self {
            task,
            trigger,
            timeout,
            address,
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Stop accepting and wait for in-flight requests, at most the configured
    /// timeout. Returns false if the wait was cut short.
    pub async fn shutdown(self) -> bool {
        let ServerHandle {
            mut task,
            trigger,
            timeout,
            address,
        } = self;

        match trigger {
            Trigger::Signal(tx) => {
                let _ = tx.send(());
            }
            Trigger::Tls(handle) => handle.graceful_shutdown(Some(timeout)),
        }

        let drained = !timeout.is_zero()
            && tokio::time::timeout(timeout, &mut task).await.is_ok();
        if !drained {
            if !timeout.is_zero() {
                tracing::warn!(
                    address = %address,
                    timeout_ms = timeout.as_millis() as u64,
                    "HTTP server shutdown exceeded timeout"
                );
            }
            task.abort();
            let _ = task.await;
        }
        tracing::info!(address = %address, drained, "HTTP server shut down");
        drained
    }
}
