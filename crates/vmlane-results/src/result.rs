//! Result records reported for a single test case run.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a case run as observed by the result sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseState {
    /// Accepted for execution, nothing started yet.
    Queued,
    /// Resources acquired, test about to run.
    Started,
    /// Test is executing (or waiting for a retry).
    Running,
    /// Test finished with an outcome.
    Complete,
    /// Run was cancelled before it completed.
    Canceled,
}

impl fmt::Display for CaseState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CaseState::Queued => "queued",
            CaseState::Started => "started",
            CaseState::Running => "running",
            CaseState::Complete => "complete",
            CaseState::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Outcome of a completed case run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Pass,
    Fail,
    /// The run could not be carried out (setup error, missing hypervisor, ...).
    Error,
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Error => "ERROR",
        };
        f.write_str(s)
    }
}

/// A `(state, outcome, final)` record as accepted by result sinks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaseResult {
    /// Current state; `None` means the case has not started.
    pub state: Option<CaseState>,

    /// Outcome, only present once the case completed.
    pub outcome: Option<Outcome>,

    /// Whether this is the last result the case will receive.
    #[serde(rename = "final")]
    pub is_final: bool,
}

impl CaseResult {
    /// Create a result record from its parts.
    pub fn new(state: Option<CaseState>, outcome: Option<Outcome>, is_final: bool) -> Self {
        Self {
            state,
            outcome,
            is_final,
        }
    }

    /// No state recorded yet.
    pub fn not_started() -> Self {
        Self::new(None, None, false)
    }

    /// Non-final progress state without an outcome.
    pub fn progress(state: CaseState) -> Self {
        Self::new(Some(state), None, false)
    }

    /// Final completed result with the given outcome.
    pub fn complete(outcome: Outcome) -> Self {
        Self::new(Some(CaseState::Complete), Some(outcome), true)
    }

    /// Final cancelled result.
    pub fn canceled() -> Self {
        Self::new(Some(CaseState::Canceled), None, true)
    }

    /// Check if the result completed with a passing outcome.
    pub fn is_pass(&self) -> bool {
        self.outcome == Some(Outcome::Pass)
    }
}

impl Default for CaseResult {
    fn default() -> Self {
        Self::not_started()
    }
}

impl fmt::Display for CaseResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.state, &self.outcome) {
            (None, _) => f.write_str("not started"),
            (Some(state), None) => write!(f, "{}", state),
            (Some(state), Some(outcome)) => write!(f, "{} {}", state, outcome),
        }?;
        if self.is_final {
            f.write_str(" (final)")?;
        }
        Ok(())
    }
}
