//! Explicit lifecycle state machine.
//!
//! ```text
//! Created ─BeginStart→ Starting ─Started→ Running
//!                         │                 │
//!                         │ StopRequested{graceful}
//!                         ▼                 ▼
//!   (setuid) ───→ StoppingGraceful   StoppingNonGraceful
//!                         │ChildSpawned      │ResourcesReleased
//!                         └──────→ Terminated ←┘
//! ```
//!
//! `StartFailed` and `Aborted` (fatal errors) lead straight to `Terminated`.

use std::sync::Mutex;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Created,
    Starting,
    Running,
    StoppingGraceful,
    StoppingNonGraceful,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    BeginStart,
    Started,
    StartFailed,
    StopRequested { graceful: bool },
    ChildSpawned,
    ResourcesReleased,
    Aborted,
}

impl LifecycleState {
    /// The state reached from `self` on `event`, if the transition is legal.
    pub fn on(self, event: LifecycleEvent) -> Option<LifecycleState> {
        use LifecycleEvent as E;
        use LifecycleState as S;

        match (self, event) {
            (S::Created, E::BeginStart) => Some(S::Starting),
            (S::Starting, E::Started) => Some(S::Running),
            (S::Starting, E::StartFailed) => Some(S::Terminated),
            // setuid bootstrap restarts before ever running
            (S::Starting, E::StopRequested { graceful: true }) => Some(S::StoppingGraceful),
            (S::Running, E::StopRequested { graceful: true }) => Some(S::StoppingGraceful),
            (S::Running, E::StopRequested { graceful: false }) => Some(S::StoppingNonGraceful),
            (S::StoppingGraceful, E::ChildSpawned) => Some(S::Terminated),
            (S::StoppingNonGraceful, E::ResourcesReleased) => Some(S::Terminated),
            (S::Terminated, E::Aborted) => None,
            (_, E::Aborted) => Some(S::Terminated),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == LifecycleState::Terminated
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid lifecycle transition from {from:?} on {event:?}")]
pub struct TransitionError {
    pub from: LifecycleState,
    pub event: LifecycleEvent,
}

/// Shared holder of the current state.
#[derive(Debug)]
pub struct StateMachine {
    state: Mutex<LifecycleState>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LifecycleState::Created),
        }
    }

    pub fn current(&self) -> LifecycleState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `event`, rejecting illegal transitions.
    pub fn apply(&self, event: LifecycleEvent) -> Result<LifecycleState, TransitionError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let from = *state;
        let to = from.on(event).ok_or(TransitionError { from, event })?;
        *state = to;
        tracing::debug!(?from, ?to, ?event, "Lifecycle transition");
        Ok(to)
    }
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use LifecycleEvent as E;
    use LifecycleState as S;

    #[test]
    fn normal_run_and_stop() {
        let fsm = StateMachine::new();
        assert_eq!(fsm.apply(E::BeginStart), Ok(S::Starting));
        assert_eq!(fsm.apply(E::Started), Ok(S::Running));
        assert_eq!(
            fsm.apply(E::StopRequested { graceful: false }),
            Ok(S::StoppingNonGraceful)
        );
        assert_eq!(fsm.apply(E::ResourcesReleased), Ok(S::Terminated));
        assert!(fsm.current().is_terminal());
    }

    #[test]
    fn second_stop_is_rejected() {
        let fsm = StateMachine::new();
        fsm.apply(E::BeginStart).unwrap();
        fsm.apply(E::Started).unwrap();
        fsm.apply(E::StopRequested { graceful: true }).unwrap();

        let err = fsm.apply(E::StopRequested { graceful: true }).unwrap_err();
        assert_eq!(err.from, S::StoppingGraceful);

        fsm.apply(E::ChildSpawned).unwrap();
        assert!(fsm.apply(E::StopRequested { graceful: false }).is_err());
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let fsm = StateMachine::new();
        assert!(fsm.apply(E::StopRequested { graceful: false }).is_err());
        assert_eq!(fsm.current(), S::Created);
    }

    #[test]
    fn setuid_bootstrap_goes_from_starting_to_graceful() {
        assert_eq!(
            S::Starting.on(E::StopRequested { graceful: true }),
            Some(S::StoppingGraceful)
        );
        assert_eq!(S::Starting.on(E::StopRequested { graceful: false }), None);
    }

    #[test]
    fn abort_terminates_from_anywhere_but_terminated() {
        for state in [S::Created, S::Starting, S::Running, S::StoppingGraceful, S::StoppingNonGraceful] {
            assert_eq!(state.on(E::Aborted), Some(S::Terminated));
        }
        assert_eq!(S::Terminated.on(E::Aborted), None);
    }
}
