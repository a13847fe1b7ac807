//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! Prepared listener (net::listener)
//!     → server.rs (axum / axum-server, background accept loop)
//!     → SetRequestId → Trace → PropagateRequestId
//!     → access_log.rs (one `http_access` event per request)
//!     → application router (from ServiceHooks::configure_server)
//! ```

pub mod access_log;
pub mod server;

pub use server::{placeholder_router, placeholder_text, HttpServer, ServerError, ServerHandle};
