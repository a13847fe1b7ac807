//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML, one table per environment)
//!     → loader.rs (read & parse into ConfigTree)
//!     → validation.rs (semantic checks, all errors at once)
//!     → schema.rs (typed ServiceConfig for the active environment)
//!     → LoadedConfig (immutable, swapped atomically in the AppContext)
//!
//! On graceful restart:
//!     loader.rs reloads the file from disk
//!     → validation.rs validates
//!     → listener addresses compared with the running config
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - Validation separates syntactic (TOML) from semantic checks
//! - Hooks read their own sections through the path-based ConfigTree

pub mod loader;
pub mod schema;
pub mod tree;
pub mod validation;

pub use loader::{load_config, read_config, ConfigError, LoadedConfig};
pub use schema::{HttpConfig, LogFormat, LogOutput, LogSinkConfig, ServiceConfig, SocketKind};
pub use tree::{ConfigTree, LookupError};
