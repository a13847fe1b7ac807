//! Exit codes and the exit-action registry.

use std::fmt;
use std::sync::{Arc, Mutex};

/// Process exit codes, one per failure category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ExitCode {
    NormalExit = 0,
    WrongEnv = 1,
    ConfigError = 2,
    LockfileError = 3,
    HttpStartError = 4,
    UserHookError = 5,
    HttpServeError = 6,
    CustomAppError = 7,
    SuidError = 8,
}

impl ExitCode {
    pub fn as_i32(self) -> i32 {
        self as i32
    }
}

impl fmt::Display for ExitCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}({})", self, self.as_i32())
    }
}

/// Exit code used by the fatal-log-then-exit path.
pub const FATAL_EXIT_CODE: i32 = 1;

/// Cleanup callback run once before process termination.
pub type ExitAction = Box<dyn FnOnce() + Send>;

/// Final process termination. `std::process::exit` outside of tests.
pub type Terminator = Arc<dyn Fn(i32) + Send + Sync>;

/// Ordered list of cleanup callbacks.
///
/// Actions run in reverse registration order, each exactly once, on the
/// terminal exit path.
pub struct ExitActions {
    actions: Mutex<Vec<ExitAction>>,
    terminator: Terminator,
}

impl ExitActions {
    pub fn new(terminator: Terminator) -> Self {
        Self {
            actions: Mutex::new(Vec::new()),
            terminator,
        }
    }

    /// Append an action.
    pub fn add(&self, action: impl FnOnce() + Send + 'static) {
        self.lock().push(Box::new(action));
    }

    /// Number of pending actions.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every pending action, newest first. No-op when empty.
    pub fn drain(&self) {
        // Taken out of the lock so actions may register further actions.
        let actions = std::mem::take(&mut *self.lock());
        for action in actions.into_iter().rev() {
            action();
        }
    }

    /// Drain, then terminate the process with `code`.
    pub fn exit(&self, code: i32) {
        self.drain();
        tracing::debug!(code, "Exiting");
        (self.terminator)(code);
    }

    /// Terminate without draining. Used by the fatal path.
    pub fn terminate(&self, code: i32) {
        (self.terminator)(code);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ExitAction>> {
        self.actions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for ExitActions {
    fn default() -> Self {
        Self::new(Arc::new(|code| std::process::exit(code)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicI32, Ordering};

    fn recording() -> (ExitActions, Arc<AtomicI32>) {
        let code = Arc::new(AtomicI32::new(-1));
        let seen = code.clone();
        let actions = ExitActions::new(Arc::new(move |c| seen.store(c, Ordering::SeqCst)));
        (actions, code)
    }

    #[test]
    fn drain_runs_in_reverse_order_once() {
        let (actions, _) = recording();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            actions.add(move || order.lock().unwrap().push(i));
        }
        assert_eq!(actions.len(), 5);

        actions.drain();
        actions.drain();

        assert_eq!(*order.lock().unwrap(), vec![4, 3, 2, 1, 0]);
        assert!(actions.is_empty());
    }

    #[test]
    fn drain_with_no_actions_is_noop() {
        let (actions, code) = recording();
        actions.drain();
        assert_eq!(code.load(Ordering::SeqCst), -1);
    }

    #[test]
    fn exit_drains_before_terminating() {
        let (actions, code) = recording();
        let observed = Arc::new(AtomicI32::new(0));
        let seen = code.clone();
        let o = observed.clone();
        actions.add(move || o.store(seen.load(Ordering::SeqCst), Ordering::SeqCst));

        actions.exit(3);

        // The action saw the terminator not yet called.
        assert_eq!(observed.load(Ordering::SeqCst), -1);
        assert_eq!(code.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn exit_codes_are_distinct() {
        let codes = [
            ExitCode::NormalExit,
            ExitCode::WrongEnv,
            ExitCode::ConfigError,
            ExitCode::LockfileError,
            ExitCode::HttpStartError,
            ExitCode::UserHookError,
            ExitCode::HttpServeError,
            ExitCode::CustomAppError,
            ExitCode::SuidError,
        ];
        let unique: std::collections::HashSet<i32> = codes.iter().map(|c| c.as_i32()).collect();
        assert_eq!(unique.len(), codes.len());
    }
}
