//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Startup
//!     → listener.rs (fresh bind, or adopt GRACEFUL_<SERVICE>_FD)
//!     → tls.rs (optional certificate loading for tcp)
//!     → Hand off to HTTP layer
//!
//! Graceful restart
//!     → handoff.rs (compare old/new addresses, queue fds for the child,
//!       spawn the child with GRACEFUL_START=YES)
//!
//! Listener States:
//!     Bound → Serving → Closed | HandedOff
//! ```
//!
//! # Design Decisions
//! - The listener keeps its own duplicate of the socket so the server can
//!   own the accept side while a handoff is still possible
//! - Descriptor numbers in the child are 3, 4, 5... in queue order
//! - Only tcp and unix stream sockets are supported

pub mod handoff;
pub mod listener;
pub mod tls;

pub use handoff::{HandoffDecision, RestartCommand, GRACEFUL_START_VALUE, GRACEFUL_START_VARIABLE};
pub use listener::{
    graceful_fd_variable, prepare_listener, BoundListener, ListenerConfig, ListenerDescriptor,
    ListenerError, ListenerState,
};
