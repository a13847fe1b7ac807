//! Configuration schema definitions.
//!
//! These types describe one environment section of the configuration file
//! (`[prod]`, `[dev]`, ...). They are deserialized only after
//! [`validate_config`](super::validation::validate_config) has accepted the
//! document, so serde errors here indicate an internal mismatch.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Settings for one environment.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServiceConfig {
    /// Directory to chdir into before acquiring any file. Empty = stay.
    #[serde(default)]
    pub workdir: String,

    /// Bind-as-root then restart as an unprivileged user.
    #[serde(default)]
    pub setuid: Option<SetuidConfig>,

    /// Single-instance lock file.
    #[serde(default)]
    pub lockfile: Option<LockfileConfig>,

    /// Pid file.
    pub pidfile: PidfileConfig,

    /// Log sinks.
    pub logs: LogsConfig,

    /// Primary HTTP listener and server.
    pub http: HttpConfig,
}

impl ServiceConfig {
    /// Whether the setuid-then-restart bootstrap is requested.
    pub fn wants_setuid(&self) -> bool {
        self.setuid.as_ref().is_some_and(|s| s.setuid)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SetuidConfig {
    pub setuid: bool,
    #[serde(default)]
    pub user: String,
    /// Empty means the user's primary group.
    #[serde(default)]
    pub group: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LockfileConfig {
    pub lockfile: bool,
    #[serde(default)]
    pub file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PidfileConfig {
    pub pidfile: bool,
    #[serde(default)]
    pub file: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogsConfig {
    pub system: LogSinkConfig,
    pub http: LogSinkConfig,
}

/// Where a log sink writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    Stdout,
    Stderr,
    File,
    Null,
}

/// Line format of a log sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Plain,
    Json,
    /// Plain with ANSI colors.
    Console,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogSinkConfig {
    pub output: LogOutput,
    #[serde(default, deserialize_with = "empty_as_default")]
    pub format: LogFormat,
    /// File path for `output = "file"`.
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub rotate: RotateConfig,
}

impl Default for LogSinkConfig {
    fn default() -> Self {
        Self {
            output: LogOutput::Stderr,
            format: LogFormat::Plain,
            path: String::new(),
            rotate: RotateConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct RotateConfig {
    /// Enable rotation for file sinks.
    pub rotate: bool,
    /// Reopen the file on SIGHUP.
    pub sighup: bool,
}

/// Transport kind of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SocketKind {
    Tcp,
    Unix,
}

impl SocketKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocketKind::Tcp => "tcp",
            SocketKind::Unix => "unix",
        }
    }
}

impl std::fmt::Display for SocketKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary HTTP listener and server configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HttpConfig {
    /// Bounded wait for in-flight requests on shutdown, in milliseconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    pub ssl: SslConfig,

    pub http2: Http2Config,

    pub socket_type: SocketKind,

    /// host:port for tcp, filesystem path for unix.
    pub address: String,

    pub domain: String,
}

impl HttpConfig {
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout)
    }
}

fn default_shutdown_timeout() -> u64 {
    10_000
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SslConfig {
    pub ssl: bool,
    #[serde(default)]
    pub cert: String,
    #[serde(default)]
    pub key: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Http2Config {
    pub http2: bool,
}

fn empty_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de> + Default,
{
    let raw = String::deserialize(deserializer)?;
    if raw.is_empty() {
        return Ok(T::default());
    }
    T::deserialize(serde::de::value::StringDeserializer::<D::Error>::new(raw))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserialize_minimal_section() {
        let config: ServiceConfig = toml::from_str(
            r#"
            [pidfile]
            pidfile = false
            [logs.system]
            output = "stderr"
            [logs.http]
            output = "file"
            format = "json"
            path = "./logs/http.log"
            rotate = { rotate = true, sighup = true }
            [http]
            shutdown_timeout = 5000
            ssl = { ssl = false }
            http2 = { http2 = false }
            socket_type = "tcp"
            address = "localhost:0"
            domain = "localhost"
            "#,
        )
        .unwrap();

        assert!(!config.wants_setuid());
        assert!(config.lockfile.is_none());
        assert_eq!(config.logs.system.format, LogFormat::Plain);
        assert_eq!(config.logs.http.format, LogFormat::Json);
        assert!(config.logs.http.rotate.sighup);
        assert_eq!(config.http.socket_type, SocketKind::Tcp);
        assert_eq!(config.http.shutdown_timeout(), Duration::from_millis(5000));
    }

    #[test]
    fn empty_format_means_plain() {
        let sink: LogSinkConfig = toml::from_str("output = \"stdout\"\nformat = \"\"").unwrap();
        assert_eq!(sink.format, LogFormat::Plain);
    }
}
