//! Structured logging.
//!
//! # Responsibilities
//! - Own the named sinks (`system`, `http`) built from `[env.logs.*]`, plus
//!   any the application registers itself
//! - Install one global `tracing` subscriber that routes every event to the
//!   sink its target belongs to, in that sink's format
//! - Reopen file sinks after external rotation (SIGHUP)
//!
//! # Design Decisions
//! - The subscriber is installed once per process; a [`LogRegistry`] only
//!   swaps the sink table it reads from, so sinks can change at runtime
//! - Events with target [`ACCESS_LOG_TARGET`] go to the `http` sink, events
//!   whose target names a registered sink go to that sink, everything else
//!   to `system`
//! - A missing sink falls back to plain text on stderr

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use thiserror::Error;
use tracing::Metadata;
use tracing_subscriber::filter::{dynamic_filter_fn, EnvFilter};
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::layer::{Layer, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;

use crate::config::schema::{LogFormat, LogOutput, LogSinkConfig, LogsConfig};

pub const SYSTEM_SINK: &str = "system";
pub const HTTP_SINK: &str = "http";

/// Target used by the access-log middleware.
pub const ACCESS_LOG_TARGET: &str = "http_access";

type SinkTable = DashMap<String, Sink>;

/// Table the global subscriber currently writes through.
static ACTIVE: ArcSwapOption<SinkTable> = ArcSwapOption::const_empty();

#[derive(Debug, Error)]
pub enum LogError {
    #[error("log {name}: output \"file\" needs a non-empty path")]
    MissingPath { name: String },
    #[error("log {name}: cannot open {}: {source}", path.display())]
    Open {
        name: String,
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// Append-mode file that can be reopened at the same path.
#[derive(Debug)]
pub struct ReopenableFile {
    path: PathBuf,
    file: Mutex<File>,
}

impl ReopenableFile {
    pub fn open(path: &Path) -> io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(open_append(path)?),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Swap the handle for a fresh one; the old file is closed.
    pub fn reopen(&self) -> io::Result<()> {
        let fresh = open_append(&self.path)?;
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        let _ = guard.flush();
        *guard = fresh;
        Ok(())
    }

    fn write_all(&self, buf: &[u8]) -> io::Result<()> {
        let mut guard = self.file.lock().unwrap_or_else(|e| e.into_inner());
        guard.write_all(buf)
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    OpenOptions::new().create(true).append(true).open(path)
}

#[derive(Debug, Clone)]
enum SinkTarget {
    Stdout,
    Stderr,
    File(Arc<ReopenableFile>),
    Null,
}

/// One configured log destination.
#[derive(Debug, Clone)]
pub struct Sink {
    target: SinkTarget,
    format: LogFormat,
    reopen_on_sighup: bool,
}

impl Sink {
    /// Plain text on stderr.
    pub fn fallback() -> Self {
        Self {
            target: SinkTarget::Stderr,
            format: LogFormat::Plain,
            reopen_on_sighup: false,
        }
    }

    pub fn from_config(name: &str, config: &LogSinkConfig) -> Result<Self, LogError> {
        let target = match config.output {
            LogOutput::Stdout => SinkTarget::Stdout,
            LogOutput::Stderr => SinkTarget::Stderr,
            LogOutput::Null => SinkTarget::Null,
            LogOutput::File => {
                if config.path.is_empty() {
                    return Err(LogError::MissingPath {
                        name: name.to_string(),
                    });
                }
                let path = Path::new(&config.path);
                let file = ReopenableFile::open(path).map_err(|source| LogError::Open {
                    name: name.to_string(),
                    path: path.to_path_buf(),
                    source,
                })?;
                SinkTarget::File(Arc::new(file))
            }
        };
        let reopen_on_sighup = matches!(target, SinkTarget::File(_))
            && config.rotate.rotate
            && config.rotate.sighup;

        Ok(Self {
            target,
            format: config.format,
            reopen_on_sighup,
        })
    }

    pub fn format(&self) -> LogFormat {
        self.format
    }

    pub fn is_null(&self) -> bool {
        matches!(self.target, SinkTarget::Null)
    }

    pub fn reopens_on_sighup(&self) -> bool {
        self.reopen_on_sighup
    }

    fn handle(&self) -> SinkHandle {
        match &self.target {
            SinkTarget::Stdout => SinkHandle::Stdout(io::stdout()),
            SinkTarget::Stderr => SinkHandle::Stderr(io::stderr()),
            SinkTarget::File(file) => SinkHandle::File(Arc::clone(file)),
            SinkTarget::Null => SinkHandle::Null,
        }
    }
}

/// Per-context registry of named sinks.
#[derive(Debug, Clone, Default)]
pub struct LogRegistry {
    sinks: Arc<SinkTable>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build (or replace) the sink `name`.
    ///
    /// Events logged with `target: name` are written to it:
    /// `tracing::info!(target: "worker", job = 7, "done")`.
    pub fn setup(&self, name: &str, config: &LogSinkConfig) -> Result<(), LogError> {
        let sink = Sink::from_config(name, config)?;
        self.sinks.insert(name.to_string(), sink);
        Ok(())
    }

    /// Build both standard sinks. Nothing changes if either fails.
    pub fn configure(&self, logs: &LogsConfig) -> Result<(), LogError> {
        let system = Sink::from_config(SYSTEM_SINK, &logs.system)?;
        let http = Sink::from_config(HTTP_SINK, &logs.http)?;
        self.sinks.insert(SYSTEM_SINK.to_string(), system);
        self.sinks.insert(HTTP_SINK.to_string(), http);
        Ok(())
    }

    /// The sink registered as `name`, or the stderr fallback.
    pub fn sink(&self, name: &str) -> Sink {
        lookup(Some(&self.sinks), name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.sinks.contains_key(name)
    }

    /// Remove a sink; its events go to the fallback from now on.
    pub fn drop_sink(&self, name: &str) {
        self.sinks.remove(name);
    }

    /// Remove every sink, closing any open files.
    pub fn drop_all(&self) {
        self.sinks.clear();
    }

    /// Reopen all file sinks configured for SIGHUP rotation.
    ///
    /// Returns how many files were reopened.
    pub fn reopen_rotated(&self) -> usize {
        let files: Vec<(String, Arc<ReopenableFile>)> = self
            .sinks
            .iter()
            .filter(|entry| entry.value().reopen_on_sighup)
            .filter_map(|entry| match &entry.value().target {
                SinkTarget::File(file) => Some((entry.key().clone(), Arc::clone(file))),
                _ => None,
            })
            .collect();

        let mut reopened = 0;
        for (name, file) in files {
            match file.reopen() {
                Ok(()) => {
                    reopened += 1;
                    tracing::info!(sink = %name, path = %file.path().display(), "Log file reopened");
                }
                Err(e) => {
                    tracing::error!(sink = %name, path = %file.path().display(), error = %e, "Log rotation failed");
                }
            }
        }
        reopened
    }

    /// Install the global subscriber (first call only) and route it
    /// through this registry.
    pub fn activate(&self) {
        install_subscriber();
        ACTIVE.store(Some(Arc::clone(&self.sinks)));
    }

    /// Whether the global subscriber currently writes through this registry.
    pub fn is_active(&self) -> bool {
        ACTIVE
            .load()
            .as_ref()
            .is_some_and(|table| Arc::ptr_eq(table, &self.sinks))
    }
}

fn lookup(table: Option<&SinkTable>, name: &str) -> Sink {
    table
        .and_then(|t| t.get(name).map(|entry| entry.value().clone()))
        .unwrap_or_else(Sink::fallback)
}

fn route(table: Option<&SinkTable>, target: &str) -> Sink {
    if target == ACCESS_LOG_TARGET {
        return lookup(table, HTTP_SINK);
    }
    match table.and_then(|t| t.get(target).map(|entry| entry.value().clone())) {
        Some(sink) => sink,
        None => lookup(table, SYSTEM_SINK),
    }
}

fn active_sink(meta: &Metadata<'_>) -> Sink {
    let table = ACTIVE.load();
    route(table.as_deref(), meta.target())
}

fn routes_to(meta: &Metadata<'_>, format: LogFormat) -> bool {
    let sink = active_sink(meta);
    !sink.is_null() && sink.format() == format
}

fn install_subscriber() {
    static INSTALLED: OnceLock<()> = OnceLock::new();
    INSTALLED.get_or_init(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        let plain = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(SinkWriter)
            .with_filter(dynamic_filter_fn(|meta, _| routes_to(meta, LogFormat::Plain)));
        let console = tracing_subscriber::fmt::layer()
            .with_ansi(true)
            .with_writer(SinkWriter)
            .with_filter(dynamic_filter_fn(|meta, _| routes_to(meta, LogFormat::Console)));
        let json = tracing_subscriber::fmt::layer()
            .json()
            .with_writer(SinkWriter)
            .with_filter(dynamic_filter_fn(|meta, _| routes_to(meta, LogFormat::Json)));

        // Another global subscriber (e.g. set by the host) takes precedence.
        let _ = tracing_subscriber::registry()
            .with(filter)
            .with(plain)
            .with(console)
            .with(json)
            .try_init();
    });
}

/// Writer factory handing each event the handle of its sink.
#[derive(Debug, Clone, Copy, Default)]
struct SinkWriter;

impl<'a> MakeWriter<'a> for SinkWriter {
    type Writer = SinkHandle;

    fn make_writer(&'a self) -> Self::Writer {
        let table = ACTIVE.load();
        lookup(table.as_deref(), SYSTEM_SINK).handle()
    }

    fn make_writer_for(&'a self, meta: &Metadata<'_>) -> Self::Writer {
        active_sink(meta).handle()
    }
}

#[derive(Debug)]
enum SinkHandle {
    Stdout(io::Stdout),
    Stderr(io::Stderr),
    File(Arc<ReopenableFile>),
    Null,
}

impl Write for SinkHandle {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            SinkHandle::Stdout(out) => out.write(buf),
            SinkHandle::Stderr(err) => err.write(buf),
            SinkHandle::File(file) => file.write_all(buf).map(|()| buf.len()),
            SinkHandle::Null => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            SinkHandle::Stdout(out) => out.flush(),
            SinkHandle::Stderr(err) => err.flush(),
            SinkHandle::File(_) | SinkHandle::Null => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::RotateConfig;

    fn file_sink(path: &Path, sighup: bool) -> LogSinkConfig {
        LogSinkConfig {
            output: LogOutput::File,
            format: LogFormat::Json,
            path: path.to_string_lossy().into_owned(),
            rotate: RotateConfig {
                rotate: true,
                sighup,
            },
        }
    }

    #[test]
    fn missing_sink_falls_back_to_stderr() {
        let registry = LogRegistry::new();
        let sink = registry.sink(SYSTEM_SINK);
        assert!(matches!(sink.target, SinkTarget::Stderr));
        assert_eq!(sink.format(), LogFormat::Plain);
    }

    #[test]
    fn file_sink_requires_path() {
        let config = LogSinkConfig {
            output: LogOutput::File,
            ..LogSinkConfig::default()
        };
        assert!(matches!(
            Sink::from_config("system", &config),
            Err(LogError::MissingPath { .. })
        ));
    }

    #[test]
    fn reopen_follows_renamed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/system.log");
        let registry = LogRegistry::new();
        registry.setup(SYSTEM_SINK, &file_sink(&path, true)).unwrap();

        let mut handle = registry.sink(SYSTEM_SINK).handle();
        handle.write_all(b"before\n").unwrap();

        let rotated = dir.path().join("logs/system.log.1");
        std::fs::rename(&path, &rotated).unwrap();
        assert_eq!(registry.reopen_rotated(), 1);

        let mut handle = registry.sink(SYSTEM_SINK).handle();
        handle.write_all(b"after\n").unwrap();

        assert_eq!(std::fs::read_to_string(&rotated).unwrap(), "before\n");
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "after\n");
    }

    #[test]
    fn sinks_without_sighup_are_not_reopened() {
        let dir = tempfile::tempdir().unwrap();
        let registry = LogRegistry::new();
        registry
            .setup(HTTP_SINK, &file_sink(&dir.path().join("http.log"), false))
            .unwrap();
        assert!(!registry.sink(HTTP_SINK).reopens_on_sighup());
        assert_eq!(registry.reopen_rotated(), 0);
    }

    #[test]
    fn drop_all_restores_fallback() {
        let registry = LogRegistry::new();
        let null = LogSinkConfig {
            output: LogOutput::Null,
            ..LogSinkConfig::default()
        };
        registry.setup(HTTP_SINK, &null).unwrap();
        assert!(registry.sink(HTTP_SINK).is_null());
        registry.drop_all();
        assert!(!registry.contains(HTTP_SINK));
        assert!(!registry.sink(HTTP_SINK).is_null());
    }

    #[test]
    fn access_log_target_selects_http_sink() {
        let table = SinkTable::new();
        table.insert(
            HTTP_SINK.to_string(),
            Sink {
                target: SinkTarget::Null,
                format: LogFormat::Json,
                reopen_on_sighup: false,
            },
        );
        assert!(lookup(Some(&table), HTTP_SINK).is_null());
        assert!(!lookup(Some(&table), SYSTEM_SINK).is_null());
    }

    #[test]
    fn registered_target_selects_its_own_sink() {
        let table = SinkTable::new();
        let null = Sink {
            target: SinkTarget::Null,
            format: LogFormat::Plain,
            reopen_on_sighup: false,
        };
        table.insert("worker".to_string(), null.clone());
        table.insert(HTTP_SINK.to_string(), null);

        assert!(route(Some(&table), "worker").is_null());
        assert!(route(Some(&table), ACCESS_LOG_TARGET).is_null());
        // Unregistered targets, module paths included, land on `system`.
        assert!(!route(Some(&table), "svcboot::lifecycle").is_null());
        assert!(!route(None, "worker").is_null());
    }
}
