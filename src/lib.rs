//! Service bootstrap toolkit.
//!
//! Boots a long-running network service from an environment-scoped
//! configuration file and keeps it alive across zero-downtime restarts:
//! SIGUSR1 re-executes the program and hands the open listeners to the new
//! process through inherited descriptors.

// Core subsystems
pub mod config;
pub mod context;
pub mod environment;
pub mod http;
pub mod net;

// Process management
pub mod lifecycle;
pub mod process;

// Cross-cutting concerns
pub mod observability;

pub use context::{AppContext, AppContextBuilder};
pub use environment::{CommandLineFlags, Environment, EnvironmentRegistry};
pub use lifecycle::{
    DefaultHooks, ExitCode, Lifecycle, LifecycleError, LifecycleState, ProcessSignal, ServiceHooks,
};
pub use net::{ListenerDescriptor, RestartCommand};
