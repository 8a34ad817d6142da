//! Worst status observed across the whole run.

use crate::status::Status;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};

const NO_STATUS: u8 = u8::MAX;

/// Process exit code derived from the run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitCode {
    Passed,
    Failed,
    KnownIssues,
}

impl ExitCode {
    pub fn code(self) -> i32 {
        match self {
            ExitCode::Passed => 0,
            ExitCode::Failed => 1,
            ExitCode::KnownIssues => 2,
        }
    }
}

/// Lock-free register keeping the most severe status proposed so far.
#[derive(Debug)]
pub struct RunStatusTracker {
    priority: AtomicU8,
    recording: AtomicBool,
}

impl Default for RunStatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl RunStatusTracker {
    pub fn new() -> Self {
        Self {
            priority: AtomicU8::new(NO_STATUS),
            recording: AtomicBool::new(true),
        }
    }

    /// Propose `status`; kept only if it is more severe than the current
    /// one. Ignored while recording is suspended.
    pub fn change_status(&self, status: Status) {
        if self.recording.load(Ordering::Acquire) {
            self.priority.fetch_min(status.priority(), Ordering::AcqRel);
        }
    }

    pub fn set_recording(&self, recording: bool) {
        self.recording.store(recording, Ordering::Release);
    }

    pub fn is_recording(&self) -> bool {
        self.recording.load(Ordering::Acquire)
    }

    /// `None` until the first outcome is recorded.
    pub fn status(&self) -> Option<Status> {
        Status::from_priority(self.priority.load(Ordering::Acquire))
    }

    pub fn exit_code(&self) -> ExitCode {
        match self.status() {
            Some(Status::Passed) => ExitCode::Passed,
            Some(Status::KnownIssuesOnly) => ExitCode::KnownIssues,
            _ => ExitCode::Failed,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_never_regresses() {
        let tracker = RunStatusTracker::new();
        tracker.change_status(Status::Passed);
        assert_eq!(tracker.status(), Some(Status::Passed));
        tracker.change_status(Status::Broken);
        tracker.change_status(Status::Passed);
        assert_eq!(tracker.status(), Some(Status::Broken));
    }

    #[test]
    fn test_exit_codes() {
        let tracker = RunStatusTracker::new();
        assert_eq!(tracker.status(), None);
        assert_eq!(tracker.exit_code(), ExitCode::Failed);

        tracker.change_status(Status::Passed);
        assert_eq!(tracker.exit_code(), ExitCode::Passed);
        assert_eq!(tracker.exit_code().code(), 0);

        tracker.change_status(Status::KnownIssuesOnly);
        assert_eq!(tracker.exit_code(), ExitCode::KnownIssues);
        assert_eq!(tracker.exit_code().code(), 2);

        tracker.change_status(Status::Skipped);
        assert_eq!(tracker.exit_code(), ExitCode::KnownIssues);

        tracker.change_status(Status::Pending);
        assert_eq!(tracker.exit_code(), ExitCode::Failed);
        assert_eq!(tracker.exit_code().code(), 1);
    }

    #[test]
    fn test_skipped_only_run_fails() {
        let tracker = RunStatusTracker::new();
        tracker.change_status(Status::Skipped);
        assert_eq!(tracker.exit_code(), ExitCode::Failed);
    }

    #[test]
    fn test_suspended_recording_is_ignored() {
        let tracker = RunStatusTracker::new();
        tracker.set_recording(false);
        tracker.change_status(Status::Broken);
        assert_eq!(tracker.status(), None);

        tracker.set_recording(true);
        tracker.change_status(Status::Passed);
        assert_eq!(tracker.status(), Some(Status::Passed));
    }

    #[test]
    fn test_concurrent_proposals() {
        let tracker = Arc::new(RunStatusTracker::new());
        let handles: Vec<_> = Status::ALL
            .into_iter()
            .map(|status| {
                let tracker = tracker.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        tracker.change_status(status);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(tracker.status(), Some(Status::Broken));
    }
}
