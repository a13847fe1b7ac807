//! Per-process bookkeeping: single-instance lock, pid file and the
//! identity used when restarting without privileges.

pub mod lockfile;
pub mod pidfile;
pub mod setuid;

pub use lockfile::{LockError, LockFile};
pub use pidfile::{Pidfile, PidfileError};
pub use setuid::{SetuidError, SetuidTarget};
