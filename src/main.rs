//! svcboot
//!
//! Runs the bootstrap toolkit standalone with the default hooks, which serve
//! a placeholder page on the configured listener.
//!
//! ```text
//! svcboot --env prod --config ./conf/config.toml
//!
//!   SIGTERM / SIGINT   stop
//!   SIGUSR1            graceful restart (listener handed to the new process)
//!   SIGHUP             reopen rotated log files
//! ```

use std::sync::Arc;

use svcboot::{AppContext, DefaultHooks, ExitCode, Lifecycle, LifecycleError};

#[tokio::main]
async fn main() {
    let ctx = AppContext::builder().build();
    let lifecycle = Lifecycle::new(Arc::clone(&ctx), Arc::new(DefaultHooks));

    match lifecycle.run().await {
        Ok(()) => ctx.exit_actions().exit(ExitCode::NormalExit.as_i32()),
        // clap prints help/version/usage itself and picks the code.
        Err(LifecycleError::CommandLine(e)) => e.exit(),
        Err(e) => {
            eprintln!("svcboot: {e}");
            ctx.exit_actions().exit(e.exit_code());
        }
    }
}
