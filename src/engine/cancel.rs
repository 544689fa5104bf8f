use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

/// Lifecycle of a run as seen by the cancellation controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Running = 0,
    StopRequested = 1,
    Draining = 2,
    Stopped = 3,
}

impl RunState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => RunState::Running,
            1 => RunState::StopRequested,
            2 => RunState::Draining,
            _ => RunState::Stopped,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: AtomicU8,
    aborted: AtomicBool,
    reason: Mutex<Option<String>>,
}

/// Cooperative cancellation flag shared by the scheduler, workers and
/// executors.
///
/// A graceful stop only prevents new admissions. An abort additionally asks
/// executors to kill the processes they are waiting on.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<Shared>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> RunState {
        RunState::from_u8(self.0.state.load(Ordering::SeqCst))
    }

    /// True once any stop was requested; no task may be admitted afterwards.
    pub fn is_stopping(&self) -> bool {
        self.state() != RunState::Running
    }

    pub fn is_aborted(&self) -> bool {
        self.0.aborted.load(Ordering::SeqCst)
    }

    /// Stop admitting tasks and let running ones finish.
    pub fn request_stop(&self, reason: impl Into<String>) {
        let moved = self
            .0
            .state
            .compare_exchange(
                RunState::Running as u8,
                RunState::StopRequested as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok();

        if moved {
            let reason = reason.into();
            info!(%reason, "stop requested");
            *self.0.reason.lock().unwrap_or_else(|e| e.into_inner()) = Some(reason);
        }
    }

    /// Stop admitting tasks and kill running commands.
    pub fn abort(&self, reason: impl Into<String>) {
        let reason = reason.into();
        warn!(%reason, "aborting run");
        self.0.aborted.store(true, Ordering::SeqCst);
        self.request_stop(reason);
    }

    pub fn reason(&self) -> Option<String> {
        self.0
            .reason
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub(crate) fn begin_drain(&self) {
        let _ = self.0.state.compare_exchange(
            RunState::StopRequested as u8,
            RunState::Draining as u8,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
    }

    pub(crate) fn finish(&self) {
        self.0.state.store(RunState::Stopped as u8, Ordering::SeqCst);
    }
}

/// Applies the continue-on-fail policy to node failures.
#[derive(Debug, Clone)]
pub struct Controller {
    token: CancelToken,
    continue_on_fail: bool,
}

impl Controller {
    pub fn new(token: CancelToken, continue_on_fail: bool) -> Self {
        Self {
            token,
            continue_on_fail,
        }
    }

    pub fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Record a failure; requests a stop when the policy says so.
    pub fn on_failure(&self, uid: &str, fatal: bool) {
        if fatal || !self.continue_on_fail {
            let reason = if fatal {
                format!("fatal failure of '{uid}'")
            } else {
                format!("'{uid}' failed")
            };
            self.token.request_stop(reason);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_machine_moves_forward_only() {
        let token = CancelToken::new();
        assert_eq!(token.state(), RunState::Running);
        token.begin_drain();
        assert_eq!(token.state(), RunState::Running);

        token.request_stop("first");
        token.request_stop("second");
        assert_eq!(token.state(), RunState::StopRequested);
        assert_eq!(token.reason().as_deref(), Some("first"));

        token.begin_drain();
        assert_eq!(token.state(), RunState::Draining);
        token.finish();
        assert_eq!(token.state(), RunState::Stopped);
        assert!(!token.is_aborted());
    }

    #[test]
    fn controller_respects_continue_on_fail() {
        let keep_going = Controller::new(CancelToken::new(), true);
        keep_going.on_failure("a", false);
        assert!(!keep_going.token().is_stopping());
        keep_going.on_failure("b", true);
        assert!(keep_going.token().is_stopping());

        let strict = Controller::new(CancelToken::new(), false);
        strict.on_failure("a", false);
        assert!(strict.token().is_stopping());
    }

    #[test]
    fn abort_marks_token() {
        let token = CancelToken::new();
        token.clone().abort("interrupt");
        assert!(token.is_aborted());
        assert!(token.is_stopping());
    }
}
