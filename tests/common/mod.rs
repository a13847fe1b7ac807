//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};

use svcboot::lifecycle::Terminator;
use svcboot::{AppContext, Lifecycle, ServiceHooks};

/// Options for the `[test]` section written by [`write_config`].
pub struct ConfigOptions<'a> {
    pub address: &'a str,
    pub socket_type: &'a str,
    pub pidfile: Option<&'a Path>,
    pub lockfile: Option<&'a Path>,
    /// Enables the setuid restart as this user.
    pub setuid_user: Option<&'a str>,
    pub shutdown_timeout: u64,
}

impl Default for ConfigOptions<'_> {
    fn default() -> Self {
        Self {
            address: "127.0.0.1:0",
            socket_type: "tcp",
            pidfile: None,
            lockfile: None,
            setuid_user: None,
            shutdown_timeout: 5000,
        }
    }
}

/// Write `dir/config.toml` with a `[test]` environment and return its path.
pub fn write_config(dir: &Path, options: &ConfigOptions<'_>) -> PathBuf {
    let pidfile = match options.pidfile {
        Some(path) => format!("pidfile = true\nfile = {:?}", path.display().to_string()),
        None => "pidfile = false".to_string(),
    };
    let lockfile = match options.lockfile {
        Some(path) => format!("[test.lockfile]\nlockfile = true\nfile = {:?}\n", path.display().to_string()),
        None => String::new(),
    };
    let setuid = match options.setuid_user {
        Some(user) => format!("[test.setuid]\nsetuid = true\nuser = {user:?}\ngroup = \"\"\n"),
        None => String::new(),
    };
    let body = format!(
        r#"[test]
workdir = ""

{lockfile}
{setuid}
[test.pidfile]
{pidfile}

[test.logs.system]
output = "null"

[test.logs.http]
output = "null"

[test.http]
shutdown_timeout = {timeout}
ssl = {{ ssl = false }}
http2 = {{ http2 = false }}
socket_type = "{socket_type}"
address = "{address}"
domain = "localhost"
"#,
        timeout = options.shutdown_timeout,
        socket_type = options.socket_type,
        address = options.address,
    );
    let path = dir.join("config.toml");
    std::fs::write(&path, body).unwrap();
    path
}

/// Terminator that records exit codes instead of exiting.
pub fn recording_terminator() -> (Terminator, Arc<Mutex<Vec<i32>>>) {
    let codes = Arc::new(Mutex::new(Vec::new()));
    let seen = codes.clone();
    let terminator: Terminator = Arc::new(move |code| seen.lock().unwrap().push(code));
    (terminator, codes)
}

/// Lifecycle over `config` in the `test` environment.
pub fn lifecycle(config: &Path, hooks: Arc<dyn ServiceHooks>, terminator: Terminator) -> Lifecycle {
    let ctx = AppContext::builder()
        .args(["svcboot", "--env", "test", "--config", config.to_str().unwrap()])
        .graceful(false)
        .terminator(terminator)
        .build();
    Lifecycle::new(ctx, hooks)
}

/// Minimal HTTP/1.1 GET; returns the status code and body.
pub async fn http_get(addr: SocketAddr, path: &str) -> std::io::Result<(u16, String)> {
    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(request.as_bytes()).await?;

    let mut raw = String::new();
    tokio::time::timeout(Duration::from_secs(5), stream.read_to_string(&mut raw))
        .await
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::TimedOut, "no response"))??;

    let status = raw
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or(0);
    let body = raw.split_once("\r\n\r\n").map(|(_, b)| b.to_string()).unwrap_or_default();
    Ok((status, body))
}

/// Poll `check` every 20ms for up to five seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    false
}
