//! Execution status and failure classification.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Outcome of a run unit, ordered by severity through [`Status::priority`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Broken,
    Failed,
    Pending,
    KnownIssuesOnly,
    Skipped,
    Passed,
    NotCovered,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Broken,
        Status::Failed,
        Status::Pending,
        Status::KnownIssuesOnly,
        Status::Skipped,
        Status::Passed,
        Status::NotCovered,
    ];

    /// Lower is more severe.
    pub const fn priority(self) -> u8 {
        match self {
            Status::Broken => 0,
            Status::Failed => 1,
            Status::Pending => 2,
            Status::KnownIssuesOnly => 3,
            Status::Skipped => 4,
            Status::Passed => 5,
            Status::NotCovered => 6,
        }
    }

    pub fn from_priority(priority: u8) -> Option<Status> {
        Self::ALL.into_iter().find(|s| s.priority() == priority)
    }

    pub fn is_more_severe_than(self, other: Status) -> bool {
        self.priority() < other.priority()
    }

    /// The more severe of the two.
    pub fn worst(self, other: Status) -> Status {
        if other.is_more_severe_than(self) {
            other
        } else {
            self
        }
    }

    /// Classify a step failure by walking the error chain.
    pub fn from_failure(error: &anyhow::Error) -> Status {
        for cause in error.chain() {
            if let Some(verification) = cause.downcast_ref::<VerificationError>() {
                return verification.status();
            }
            if cause.downcast_ref::<AssertionError>().is_some() {
                return Status::Failed;
            }
        }
        Status::Broken
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Broken => "BROKEN",
            Status::Failed => "FAILED",
            Status::Pending => "PENDING",
            Status::KnownIssuesOnly => "KNOWN_ISSUES_ONLY",
            Status::Skipped => "SKIPPED",
            Status::Passed => "PASSED",
            Status::NotCovered => "NOT_COVERED",
        };
        f.write_str(s)
    }
}

/// A known issue matched by a failed assertion.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownIssue {
    pub identifier: String,
    /// Matched only on some of its conditions.
    #[serde(default)]
    pub potentially_known: bool,
}

impl KnownIssue {
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            potentially_known: false,
        }
    }

    pub fn potential(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            potentially_known: true,
        }
    }

    pub fn is_fixed_known(&self) -> bool {
        !self.potentially_known
    }
}

/// A failed soft assertion, optionally matched to a known issue.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct SoftAssertionError {
    pub message: String,
    pub known_issue: Option<KnownIssue>,
}

impl SoftAssertionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            known_issue: None,
        }
    }

    pub fn with_known_issue(mut self, known_issue: KnownIssue) -> Self {
        self.known_issue = Some(known_issue);
        self
    }

    pub fn is_known_issue(&self) -> bool {
        self.known_issue.as_ref().is_some_and(KnownIssue::is_fixed_known)
    }

    pub fn status(&self) -> Status {
        if self.is_known_issue() {
            Status::KnownIssuesOnly
        } else {
            Status::Failed
        }
    }
}

/// Raised when the soft assertions of a step are verified.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{} soft assertion(s) failed", .errors.len())]
pub struct VerificationError {
    pub errors: Vec<SoftAssertionError>,
}

impl VerificationError {
    pub fn new(errors: Vec<SoftAssertionError>) -> Self {
        Self { errors }
    }

    pub fn status(&self) -> Status {
        if !self.errors.is_empty()
            && self.errors.iter().all(SoftAssertionError::is_known_issue)
        {
            Status::KnownIssuesOnly
        } else {
            Status::Failed
        }
    }
}

/// A hard assertion failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct AssertionError(pub String);
