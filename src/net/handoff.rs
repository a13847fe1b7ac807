//! Passing listeners to a restarted process.
//!
//! # Protocol
//! ```text
//! parent                                   child
//!   extra file i  ──(dup2 to fd 3+i)──▶      fd 3+i
//!   GRACEFUL_<SERVICE>_FD=3+i        ──▶      prepare_listener(graceful)
//!   GRACEFUL_START=YES               ──▶      graceful flag
//! ```
//!
//! The child environment is a copy of the parent's with stale
//! `GRACEFUL_START` / `GRACEFUL_*_FD` entries removed first.

use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use nix::fcntl::{fcntl, FcntlArg};

use crate::net::listener::{graceful_fd_variable, ListenerConfig, ListenerDescriptor, ListenerError};
use crate::process::SetuidTarget;

/// Marks a process launch as the continuation of a graceful restart.
pub const GRACEFUL_START_VARIABLE: &str = "GRACEFUL_START";
pub const GRACEFUL_START_VALUE: &str = "YES";

/// First descriptor number assigned to extra files in the child.
pub const FIRST_EXTRA_FD: RawFd = 3;

/// Whether an open listener may be passed to the restarted process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandoffDecision {
    Reuse,
    Rebind,
}

impl HandoffDecision {
    /// Reuse only when transport kind and address are byte-identical.
    pub fn decide(old: &ListenerConfig, new: &ListenerConfig) -> Self {
        if old.socket_type == new.socket_type && old.address == new.address {
            HandoffDecision::Reuse
        } else {
            HandoffDecision::Rebind
        }
    }
}

fn is_handoff_variable(key: &OsStr) -> bool {
    let Some(key) = key.to_str() else {
        return false;
    };
    key == GRACEFUL_START_VARIABLE || (key.starts_with("GRACEFUL_") && key.ends_with("_FD"))
}

/// Builder for the re-executed process.
#[derive(Debug)]
pub struct RestartCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: BTreeMap<OsString, OsString>,
    extra_files: Vec<OwnedFd>,
    credentials: Option<SetuidTarget>,
}

impl RestartCommand {
    /// Start from `program` and `args`, inheriting the current environment.
    pub fn new(program: impl Into<PathBuf>, args: impl IntoIterator<Item = OsString>) -> Self {
        let env = std::env::vars_os()
            .filter(|(key, _)| !is_handoff_variable(key))
            .collect();
        Self {
            program: program.into(),
            args: args.into_iter().collect(),
            env,
            extra_files: Vec::new(),
            credentials: None,
        }
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn args(&self) -> &[OsString] {
        &self.args
    }

    pub fn env(&self, key: impl AsRef<OsStr>) -> Option<&OsStr> {
        self.env.get(key.as_ref()).map(OsString::as_os_str)
    }

    pub fn set_env(&mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> &mut Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn remove_env(&mut self, key: impl AsRef<OsStr>) -> &mut Self {
        self.env.remove(key.as_ref());
        self
    }

    pub fn extra_file_count(&self) -> usize {
        self.extra_files.len()
    }

    /// Queue a descriptor for the child; returns the number it will have there.
    pub fn add_extra_file(&mut self, fd: BorrowedFd<'_>) -> std::io::Result<RawFd> {
        let copy = fd.try_clone_to_owned()?;
        self.extra_files.push(copy);
        Ok(FIRST_EXTRA_FD + self.extra_files.len() as RawFd - 1)
    }

    /// Pass `listener` and publish its number as `GRACEFUL_<SERVICE>_FD`.
    pub fn inherit_listener(
        &mut self,
        service: &str,
        listener: &ListenerDescriptor,
    ) -> Result<RawFd, ListenerError> {
        let fd = listener.handoff_fd()?;
        let child_fd = self.add_extra_file(fd).map_err(ListenerError::Handoff)?;
        self.set_env(graceful_fd_variable(service), child_fd.to_string());
        tracing::debug!(service, child_fd, "Listener queued for handoff");
        Ok(child_fd)
    }

    /// Run the child as another user, in a new session.
    pub fn set_credentials(&mut self, target: SetuidTarget) -> &mut Self {
        self.credentials = Some(target);
        self
    }

    pub fn credentials(&self) -> Option<SetuidTarget> {
        self.credentials
    }

    /// Start the child and return its pid without waiting for it.
    pub fn spawn(self) -> std::io::Result<u32> {
        let count = self.extra_files.len() as RawFd;
        let floor = FIRST_EXTRA_FD + count;

        // Sources must sit above every target slot so dup2 never clobbers
        // a source that is still to be moved.
        let mut sources = Vec::with_capacity(self.extra_files.len());
        for file in &self.extra_files {
            let raw = fcntl(file.as_raw_fd(), FcntlArg::F_DUPFD_CLOEXEC(floor))
                .map_err(std::io::Error::from)?;
            // SAFETY: fcntl just returned a fresh descriptor we own.
            sources.push(unsafe { OwnedFd::from_raw_fd(raw) });
        }
        let raw_sources: Vec<RawFd> = sources.iter().map(AsRawFd::as_raw_fd).collect();
        let new_session = self.credentials.is_some();

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env_clear()
            .envs(&self.env)
            .env(GRACEFUL_START_VARIABLE, GRACEFUL_START_VALUE);
        if let Some(target) = self.credentials {
            command.uid(target.uid_raw()).gid(target.gid_raw());
        }

        // SAFETY: only async-signal-safe calls (dup2, setsid) run between
        // fork and exec, on descriptors owned by this function.
        unsafe {
            command.pre_exec(move || {
                for (i, src) in raw_sources.iter().enumerate() {
                    let target = FIRST_EXTRA_FD + i as RawFd;
                    if nix::libc::dup2(*src, target) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                if new_session && nix::libc::setsid() < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = command.spawn()?;
        let pid = child.id();
        // Dropping the handle neither waits for nor kills the child.
        drop(child);
        drop(sources);
        tracing::info!(pid, program = %self.program.display(), files = count, "Restarted process spawned");
        Ok(pid)
    }
}
