//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → tracing events (structured fields)
//!     → logging.rs routes each event by target:
//!         http_access → "http" sink
//!         target of a registered sink → that sink
//!         everything else → "system" sink
//!
//! Sinks:
//!     → stdout / stderr / file / null, each plain, console or json
//!     → file sinks reopened on SIGHUP for external rotation
//! ```
//!
//! # Design Decisions
//! - One global subscriber, sink table swapped per application context
//! - Request ID flows from tower-http into the access log
//! - Dropped sinks fall back to stderr rather than going silent

pub mod logging;

pub use logging::{LogError, LogRegistry, Sink, ACCESS_LOG_TARGET, HTTP_SINK, SYSTEM_SINK};
