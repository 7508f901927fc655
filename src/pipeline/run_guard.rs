//! Single-run-at-a-time token for a pipeline instance.

use super::types::RunState;
use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;
const RUNNING: u8 = 1;

#[derive(Debug)]
pub struct RunGuard {
    state: AtomicU8,
}

impl RunGuard {
    pub fn new() -> Self {
        Self {
            state: AtomicU8::new(IDLE),
        }
    }

    /// Move Idle -> Running. `None` if a run already holds the token.
    pub fn try_acquire(&self) -> Option<RunPermit<'_>> {
        self.state
            .compare_exchange(IDLE, RUNNING, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| RunPermit { guard: self })
    }

    pub fn state(&self) -> RunState {
        match self.state.load(Ordering::Acquire) {
            RUNNING => RunState::Running,
            _ => RunState::Idle,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state() == RunState::Running
    }
}

impl Default for RunGuard {
    fn default() -> Self {
        Self::new()
    }
}

/// Returns the guard to Idle when dropped
#[derive(Debug)]
pub struct RunPermit<'a> {
    guard: &'a RunGuard,
}

impl Drop for RunPermit<'_> {
    fn drop(&mut self) {
        self.guard.state.store(IDLE, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_one_permit_at_a_time() {
        let guard = RunGuard::new();
        assert!(!guard.is_running());

        let permit = guard.try_acquire().unwrap();
        assert!(guard.is_running());
        assert!(guard.try_acquire().is_none());

        drop(permit);
        assert_eq!(guard.state(), RunState::Idle);
        assert!(guard.try_acquire().is_some());
    }
}
