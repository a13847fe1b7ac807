//! OS signal handling.
//!
//! # Responsibilities
//! - Forward SIGINT, SIGTERM and SIGUSR1 into a single-consumer router
//! - Map them to lifecycle actions (stop, graceful restart)
//! - Run registered SIGHUP handlers (log reopening, certificate reload)
//!
//! # Design Decisions
//! - Uses Tokio's signal handling (async-safe)
//! - The router queue holds one signal; bursts coalesce
//! - Dispatch is serialized by an outer mutex, on top of the stop mutex
//! - SIGHUP never stops the process; its handlers are fire-and-forget
//! - A failing signal hook still tears the service down, then exits with
//!   the hook error code

use std::sync::{Arc, Mutex};

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::lifecycle::exit::ExitCode;
use crate::lifecycle::shutdown::Shutdown;
use crate::lifecycle::{Lifecycle, LifecycleError};

/// Signals the lifecycle reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
    /// SIGUSR1: graceful restart.
    Restart,
    /// Anything else; ignored by the router.
    Other(i32),
}

impl ProcessSignal {
    pub fn from_raw(signo: i32) -> Self {
        match signo {
            nix::libc::SIGINT => ProcessSignal::Interrupt,
            nix::libc::SIGTERM => ProcessSignal::Terminate,
            nix::libc::SIGUSR1 => ProcessSignal::Restart,
            other => ProcessSignal::Other(other),
        }
    }
}

/// Routes termination and restart signals to the lifecycle.
pub struct SignalRouter {
    lifecycle: Lifecycle,
    tx: Mutex<Option<mpsc::Sender<ProcessSignal>>>,
    rx: tokio::sync::Mutex<mpsc::Receiver<ProcessSignal>>,
    dispatch_lock: tokio::sync::Mutex<()>,
    forwarders: Mutex<Vec<JoinHandle<()>>>,
}

impl SignalRouter {
    pub fn new(lifecycle: Lifecycle) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(1);
        Arc::new(Self {
            lifecycle,
            tx: Mutex::new(Some(tx)),
            rx: tokio::sync::Mutex::new(rx),
            dispatch_lock: tokio::sync::Mutex::new(()),
            forwarders: Mutex::new(Vec::new()),
        })
    }

    /// Subscribe to SIGINT, SIGTERM and SIGUSR1.
    pub fn listen(&self) -> std::io::Result<()> {
        let Some(tx) = self.tx.lock().unwrap_or_else(|e| e.into_inner()).clone() else {
            return Ok(());
        };
        let mut forwarders = self.forwarders.lock().unwrap_or_else(|e| e.into_inner());
        for (kind, mapped) in [
            (SignalKind::interrupt(), ProcessSignal::Interrupt),
            (SignalKind::terminate(), ProcessSignal::Terminate),
            (SignalKind::user_defined1(), ProcessSignal::Restart),
        ] {
            let mut stream = signal(kind)?;
            let tx = tx.clone();
            forwarders.push(tokio::spawn(async move {
                while stream.recv().await.is_some() {
                    // Full queue: a signal is already pending, drop this one.
                    if let Err(mpsc::error::TrySendError::Closed(_)) = tx.try_send(mapped) {
                        break;
                    }
                }
            }));
        }
        Ok(())
    }

    /// Queue a signal as if the OS had delivered it.
    pub fn inject(&self, signal: ProcessSignal) -> bool {
        self.tx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|tx| tx.try_send(signal).is_ok())
    }

    /// Stop listening; `run` returns once the queue is drained.
    pub fn close(&self) {
        for task in self.forwarders.lock().unwrap_or_else(|e| e.into_inner()).drain(..) {
            task.abort();
        }
        self.tx.lock().unwrap_or_else(|e| e.into_inner()).take();
    }

    /// Consume queued signals until the lifecycle terminates or the router
    /// is closed. Also stops the SIGHUP loop on the way out.
    pub async fn run(&self) {
        let mut rx = self.rx.lock().await;
        while let Some(signal) = rx.recv().await {
            self.dispatch(signal).await;
            if self.lifecycle.context().state().is_terminal() {
                break;
            }
        }
        self.lifecycle.context().sighup().cleanup();
    }

    /// Handle one signal now.
    pub async fn dispatch(&self, signal: ProcessSignal) {
        let _guard = self.dispatch_lock.lock().await;
        let graceful = match signal {
            ProcessSignal::Interrupt | ProcessSignal::Terminate => false,
            ProcessSignal::Restart => true,
            ProcessSignal::Other(signo) => {
                tracing::debug!(signo, "Ignoring signal");
                return;
            }
        };
        tracing::info!(?signal, graceful, "Signal received");

        let ctx = self.lifecycle.context();
        if let Err(e) = self.lifecycle.hooks().on_signal(ctx, signal).await {
            tracing::error!(?signal, error = %format!("{e:#}"), "Signal hook failed");
            // Tear down anyway so the next launch finds no stale pid or lock file.
            match self.lifecycle.stop(false, None).await {
                Ok(_) | Err(LifecycleError::InvalidTransition(_)) => {
                    ctx.exit_actions().exit(ExitCode::UserHookError.as_i32());
                }
                Err(e) => eprintln!("Error while app shutdown occurred: {e}"),
            }
            return;
        }

        match self.lifecycle.stop(graceful, None).await {
            // A graceful stop has already handed over and exited.
            Ok(_) if graceful => {}
            Ok(code) => ctx.exit_actions().exit(code.as_i32()),
            Err(LifecycleError::InvalidTransition(e)) => {
                tracing::warn!(?signal, error = %e, "Stop already done, signal ignored");
            }
            // Any other stop failure has already terminated the process.
            Err(e) => eprintln!("Error while app shutdown occurred: {e}"),
        }
    }
}

pub type SighupHandler = Arc<dyn Fn() + Send + Sync>;

/// Handlers run on SIGHUP, plus the loop that waits for it.
#[derive(Default)]
pub struct SighupHandlers {
    handlers: Arc<Mutex<Vec<SighupHandler>>>,
    listener: Mutex<Option<Shutdown>>,
}

impl SighupHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handler: impl Fn() + Send + Sync + 'static) {
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(handler));
    }

    pub fn len(&self) -> usize {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_listening(&self) -> bool {
        self.listener.lock().unwrap_or_else(|e| e.into_inner()).is_some()
    }

    /// Run every handler once, each on its own blocking task.
    pub fn fire(&self) -> usize {
        fire(&self.handlers)
    }

    /// Start waiting for SIGHUP. Idempotent.
    pub fn setup(&self) -> std::io::Result<()> {
        let mut listener = self.listener.lock().unwrap_or_else(|e| e.into_inner());
        if listener.is_some() {
            return Ok(());
        }
        let mut hangup = signal(SignalKind::hangup())?;
        let shutdown = Shutdown::new();
        let mut stop = shutdown.subscribe();
        let handlers = Arc::clone(&self.handlers);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.recv() => break,
                    received = hangup.recv() => {
                        if received.is_none() {
                            break;
                        }
                        let count = fire(&handlers);
                        tracing::info!(handlers = count, "SIGHUP received");
                    }
                }
            }
            tracing::debug!("SIGHUP loop stopped");
        });

        *listener = Some(shutdown);
        Ok(())
    }

    /// Forget all handlers and stop the SIGHUP loop.
    pub fn cleanup(&self) {
        self.handlers.lock().unwrap_or_else(|e| e.into_inner()).clear();
        if let Some(shutdown) = self.listener.lock().unwrap_or_else(|e| e.into_inner()).take() {
            shutdown.trigger();
        }
    }
}

fn fire(handlers: &Mutex<Vec<SighupHandler>>) -> usize {
    let snapshot: Vec<SighupHandler> = handlers.lock().unwrap_or_else(|e| e.into_inner()).clone();
    let runtime = tokio::runtime::Handle::try_current();
    for handler in &snapshot {
        let handler = Arc::clone(handler);
        match &runtime {
            Ok(rt) => {
                rt.spawn_blocking(move || handler());
            }
            Err(_) => handler(),
        }
    }
    snapshot.len()
}
