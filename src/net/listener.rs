//! Listener preparation: fresh bind or inheritance from a parent process.
//!
//! # Responsibilities
//! - Bind the configured tcp or unix address
//! - Rebuild a listener from a descriptor passed through `GRACEFUL_<SERVICE>_FD`
//! - Keep a private duplicate of the socket so it can be handed to a child
//!   even while the server owns the listener
//!
//! # States
//! ```text
//! (unprepared) → Bound → Serving → Closed | HandedOff
//! ```

use std::net::SocketAddr;
use std::os::fd::{AsFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::sync::OnceLock;

use dashmap::DashSet;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::socket::{getsockname, AddressFamily, SockaddrLike, SockaddrStorage};
use thiserror::Error;

use crate::config::schema::{HttpConfig, SocketKind};

/// Error type for listener operations.
#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("invalid listener configuration: {0}")]
    Config(String),
    #[error("cannot listen on {kind} {address}: {source}")]
    Bind {
        kind: SocketKind,
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot inherit listener from {variable}: {reason}")]
    Inherit { variable: String, reason: String },
    #[error("cannot hand listener over: {0}")]
    Handoff(#[source] std::io::Error),
    #[error("listener is {0:?}")]
    InvalidState(ListenerState),
}

/// Transport kind and address of one listener.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerConfig {
    pub socket_type: SocketKind,
    pub address: String,
}

impl ListenerConfig {
    pub fn new(socket_type: SocketKind, address: impl Into<String>) -> Self {
        Self {
            socket_type,
            address: address.into(),
        }
    }

    pub fn from_http(http: &HttpConfig) -> Self {
        Self::new(http.socket_type, http.address.clone())
    }
}

/// Environment variable naming the inherited descriptor of `service`.
pub fn graceful_fd_variable(service: &str) -> String {
    format!("GRACEFUL_{}_FD", service.to_ascii_uppercase())
}

/// Descriptor variables already adopted by this process. The environment
/// itself is never modified once worker threads may be reading it.
fn consumed_variables() -> &'static DashSet<String> {
    static CONSUMED: OnceLock<DashSet<String>> = OnceLock::new();
    CONSUMED.get_or_init(DashSet::new)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    Bound,
    Serving,
    Closed,
    HandedOff,
}

/// Non-blocking std listener ready to be converted for a runtime.
#[derive(Debug)]
pub enum BoundListener {
    Tcp(std::net::TcpListener),
    Unix(UnixListener),
}

impl BoundListener {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            BoundListener::Tcp(l) => l.as_fd(),
            BoundListener::Unix(l) => l.as_fd(),
        }
    }
}

/// A prepared listener plus its addressing metadata.
#[derive(Debug)]
pub struct ListenerDescriptor {
    service: String,
    config: ListenerConfig,
    listener: Option<BoundListener>,
    handoff: Option<OwnedFd>,
    local_addr: Option<SocketAddr>,
    inherited: bool,
    state: ListenerState,
}

impl ListenerDescriptor {
    fn new(
        service: &str,
        config: &ListenerConfig,
        listener: BoundListener,
        inherited: bool,
    ) -> Result<Self, ListenerError> {
        let handoff = listener
            .as_fd()
            .try_clone_to_owned()
            .map_err(ListenerError::Handoff)?;
        let local_addr = match &listener {
            BoundListener::Tcp(l) => l.local_addr().ok(),
            BoundListener::Unix(_) => None,
        };
        Ok(Self {
            service: service.to_string(),
            config: config.clone(),
            listener: Some(listener),
            handoff: Some(handoff),
            local_addr,
            inherited,
            state: ListenerState::Bound,
        })
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn config(&self) -> &ListenerConfig {
        &self.config
    }

    pub fn state(&self) -> ListenerState {
        self.state
    }

    /// Whether the socket came from a parent process.
    pub fn is_inherited(&self) -> bool {
        self.inherited
    }

    /// Bound address for tcp listeners.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Hand the listener to a server. Only valid once, while `Bound`.
    pub fn take_listener(&mut self) -> Result<BoundListener, ListenerError> {
        match (self.state, self.listener.take()) {
            (ListenerState::Bound, Some(listener)) => {
                self.state = ListenerState::Serving;
                Ok(listener)
            }
            _ => Err(ListenerError::InvalidState(self.state)),
        }
    }

    /// The raw socket, for appending to a child's inherited descriptors.
    pub fn handoff_fd(&self) -> Result<BorrowedFd<'_>, ListenerError> {
        match (&self.handoff, self.state) {
            (Some(fd), ListenerState::Bound | ListenerState::Serving) => Ok(fd.as_fd()),
            _ => Err(ListenerError::InvalidState(self.state)),
        }
    }

    /// Record that a child now owns the socket. Our copy stays open until
    /// the process exits so the address is never released.
    pub fn mark_handed_off(&mut self) {
        self.state = ListenerState::HandedOff;
    }

    /// Close the socket for good. A unix socket path is removed.
    pub fn close(&mut self) {
        if matches!(self.state, ListenerState::Closed | ListenerState::HandedOff) {
            return;
        }
        self.listener.take();
        self.handoff.take();
        self.state = ListenerState::Closed;

        if self.config.socket_type == SocketKind::Unix {
            if let Err(e) = std::fs::remove_file(&self.config.address) {
                tracing::warn!(path = %self.config.address, error = %e, "Cannot remove unix socket");
            }
        }
        tracing::info!(service = %self.service, address = %self.config.address, "Listener closed");
    }
}

/// Prepare the listener of `service`.
///
/// With `graceful` set and `GRACEFUL_<SERVICE>_FD` present, the socket is
/// rebuilt from that descriptor without binding. Otherwise the configured
/// address is bound fresh.
pub fn prepare_listener(
    service: &str,
    graceful: bool,
    config: &ListenerConfig,
) -> Result<ListenerDescriptor, ListenerError> {
    if config.address.is_empty() {
        return Err(ListenerError::Config(format!(
            "empty {} address for {}",
            config.socket_type, service
        )));
    }

    let variable = graceful_fd_variable(service);
    if graceful {
        let value = std::env::var(&variable)
            .ok()
            .filter(|_| consumed_variables().insert(variable.clone()));
        if let Some(value) = value {
            let listener = inherit(&variable, &value, config.socket_type)?;
            let descriptor = ListenerDescriptor::new(service, config, listener, true)?;
            tracing::info!(
                service,
                fd = %value,
                kind = %config.socket_type,
                address = %config.address,
                "Listener inherited"
            );
            return Ok(descriptor);
        }
        tracing::info!(
            service,
            variable = %variable,
            "No inherited descriptor, binding fresh listener"
        );
    }

    let listener = bind(config)?;
    let descriptor = ListenerDescriptor::new(service, config, listener, false)?;
    tracing::info!(
        service,
        kind = %config.socket_type,
        address = %config.address,
        local_addr = ?descriptor.local_addr(),
        "Listener bound"
    );
    Ok(descriptor)
}

fn bind(config: &ListenerConfig) -> Result<BoundListener, ListenerError> {
    let bind_err = |source| ListenerError::Bind {
        kind: config.socket_type,
        address: config.address.clone(),
        source,
    };
    let listener = match config.socket_type {
        SocketKind::Tcp => {
            let l = std::net::TcpListener::bind(config.address.as_str()).map_err(bind_err)?;
            l.set_nonblocking(true).map_err(bind_err)?;
            BoundListener::Tcp(l)
        }
        SocketKind::Unix => {
            let l = UnixListener::bind(PathBuf::from(&config.address)).map_err(bind_err)?;
            l.set_nonblocking(true).map_err(bind_err)?;
            BoundListener::Unix(l)
        }
    };
    Ok(listener)
}

fn inherit(variable: &str, value: &str, kind: SocketKind) -> Result<BoundListener, ListenerError> {
    let fail = |reason: String| ListenerError::Inherit {
        variable: variable.to_string(),
        reason,
    };

    let fd: RawFd = value
        .trim()
        .parse()
        .map_err(|_| fail(format!("{value:?} is not a descriptor number")))?;
    if fd < 3 {
        return Err(fail(format!("descriptor {fd} is a standard stream")));
    }

    let addr: SockaddrStorage =
        getsockname(fd).map_err(|e| fail(format!("descriptor {fd} is not a socket: {e}")))?;
    let family = addr.family();
    let matches = match kind {
        SocketKind::Tcp => matches!(family, Some(AddressFamily::Inet | AddressFamily::Inet6)),
        SocketKind::Unix => matches!(family, Some(AddressFamily::Unix)),
    };
    if !matches {
        return Err(fail(format!(
            "descriptor {fd} has address family {family:?}, expected {kind}"
        )));
    }

    fcntl(fd, FcntlArg::F_SETFD(FdFlag::FD_CLOEXEC))
        .map_err(|e| fail(format!("cannot set close-on-exec: {e}")))?;

    // SAFETY: the descriptor was verified to be an open socket of the expected
    // family, and the variable naming it was claimed in the consumed set before
    // this call so the fd is adopted exactly once.
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };
    let listener = match kind {
        SocketKind::Tcp => BoundListener::Tcp(std::net::TcpListener::from(owned)),
        SocketKind::Unix => BoundListener::Unix(UnixListener::from(owned)),
    };
    let nonblocking = match &listener {
        BoundListener::Tcp(l) => l.set_nonblocking(true),
        BoundListener::Unix(l) => l.set_nonblocking(true),
    };
    nonblocking.map_err(|e| fail(e.to_string()))?;
    Ok(listener)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::fd::{AsRawFd, IntoRawFd};

    fn accept_one(listener: &BoundListener) -> String {
        let BoundListener::Tcp(l) = listener else {
            panic!("expected tcp listener");
        };
        l.set_nonblocking(false).unwrap();
        let (mut stream, _) = l.accept().unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn fresh_tcp_bind_on_ephemeral_port() {
        let config = ListenerConfig::new(SocketKind::Tcp, "127.0.0.1:0");
        let descriptor = prepare_listener("fresh", false, &config).unwrap();
        assert_eq!(descriptor.state(), ListenerState::Bound);
        assert!(!descriptor.is_inherited());
        assert_ne!(descriptor.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn bind_to_used_port_fails() {
        let config = ListenerConfig::new(SocketKind::Tcp, "127.0.0.1:0");
        let first = prepare_listener("first", false, &config).unwrap();
        let taken = ListenerConfig::new(SocketKind::Tcp, first.local_addr().unwrap().to_string());
        let err = prepare_listener("second", false, &taken).unwrap_err();
        assert!(matches!(err, ListenerError::Bind { .. }));
    }

    #[test]
    fn graceful_without_variable_binds_fresh() {
        let config = ListenerConfig::new(SocketKind::Tcp, "127.0.0.1:0");
        let descriptor = prepare_listener("nofdvar", true, &config).unwrap();
        assert!(!descriptor.is_inherited());
    }

    #[test]
    fn inherit_round_trip_serves_same_address() {
        let config = ListenerConfig::new(SocketKind::Tcp, "127.0.0.1:0");
        let mut original = prepare_listener("roundtrip", false, &config).unwrap();
        let addr = original.local_addr().unwrap();

        let passed = original
            .handoff_fd()
            .unwrap()
            .try_clone_to_owned()
            .unwrap()
            .into_raw_fd();
        std::env::set_var(graceful_fd_variable("roundtrip"), passed.to_string());
        original.close();

        let mut inherited = prepare_listener("roundtrip", true, &config).unwrap();
        assert!(inherited.is_inherited());
        assert_eq!(inherited.local_addr(), Some(addr));
        // The variable stays in the environment but is never adopted twice.
        assert!(std::env::var(graceful_fd_variable("roundtrip")).is_ok());
        let fresh = ListenerConfig::new(SocketKind::Tcp, "127.0.0.1:0");
        let again = prepare_listener("roundtrip", true, &fresh).unwrap();
        assert!(!again.is_inherited());
        assert_ne!(again.local_addr(), Some(addr));

        let listener = inherited.take_listener().unwrap();
        let client = std::thread::spawn(move || {
            let mut stream = std::net::TcpStream::connect(addr).unwrap();
            stream.write_all(b"hello").unwrap();
        });
        assert_eq!(accept_one(&listener), "hello");
        client.join().unwrap();
    }

    #[test]
    fn inherit_rejects_wrong_family() {
        let dir = tempfile::tempdir().unwrap();
        let unix = UnixListener::bind(dir.path().join("s.sock")).unwrap();
        let fd = unix.as_raw_fd();
        let err = inherit("GRACEFUL_X_FD", &fd.to_string(), SocketKind::Tcp).unwrap_err();
        assert!(matches!(err, ListenerError::Inherit { .. }));
    }

    #[test]
    fn inherit_rejects_garbage() {
        let err = inherit("GRACEFUL_X_FD", "abc", SocketKind::Tcp).unwrap_err();
        assert!(err.to_string().contains("not a descriptor number"));
        let err = inherit("GRACEFUL_X_FD", "1", SocketKind::Tcp).unwrap_err();
        assert!(err.to_string().contains("standard stream"));
    }

    #[test]
    fn unix_close_removes_socket_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("svc.sock");
        let config = ListenerConfig::new(SocketKind::Unix, path.to_string_lossy());
        let mut descriptor = prepare_listener("unixsvc", false, &config).unwrap();
        assert!(path.exists());
        descriptor.close();
        assert!(!path.exists());
        assert_eq!(descriptor.state(), ListenerState::Closed);
    }

    #[test]
    fn take_listener_only_once() {
        let config = ListenerConfig::new(SocketKind::Tcp, "127.0.0.1:0");
        let mut descriptor = prepare_listener("once", false, &config).unwrap();
        descriptor.take_listener().unwrap();
        assert_eq!(descriptor.state(), ListenerState::Serving);
        assert!(descriptor.handoff_fd().is_ok());
        assert!(matches!(
            descriptor.take_listener(),
            Err(ListenerError::InvalidState(ListenerState::Serving))
        ));
    }
}
