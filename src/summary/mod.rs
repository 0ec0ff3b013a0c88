//! Run summary and exit codes
//!
//! Counts the final results of all cases of a run and derives the process
//! exit code from them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::io;
use std::path::Path;

use vmlane_results::{CaseState, Outcome};

use crate::report::CaseRecord;
use crate::signal::EXIT_CODE_CANCELLED;

/// File name of the run summary
pub const RUN_SUMMARY_FILE: &str = "run_summary.json";

/// Process exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitCode {
    /// Every case passed
    Success,
    /// Some case failed, errored or did not finish
    TestFailures,
    /// Invalid configuration, plan or arguments
    Usage,
    /// The run was cancelled
    Cancelled,
}

impl ExitCode {
    pub fn as_i32(&self) -> i32 {
        match self {
            ExitCode::Success => 0,
            ExitCode::TestFailures => 1,
            ExitCode::Usage => 2,
            ExitCode::Cancelled => EXIT_CODE_CANCELLED,
        }
    }

    pub fn from_i32(code: i32) -> Option<Self> {
        match code {
            0 => Some(ExitCode::Success),
            1 => Some(ExitCode::TestFailures),
            2 => Some(ExitCode::Usage),
            EXIT_CODE_CANCELLED => Some(ExitCode::Cancelled),
            _ => None,
        }
    }
}

/// Summary of a whole run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub created_at: DateTime<Utc>,

    /// Number of cases in the plan
    pub cases: usize,

    pub passed: usize,
    pub failed: usize,

    /// Cases that could not be carried out
    pub errored: usize,
    pub canceled: usize,

    /// Cases without a final result (skipped batches, interrupted runs)
    pub incomplete: usize,

    /// Wall-clock duration of the run in milliseconds
    pub duration_ms: u64,

    pub exit_code: i32,

    pub human_summary: String,
}

impl RunSummary {
    /// Summarize the records of a finished run.
    pub fn from_records(records: &[CaseRecord], duration_ms: u64) -> Self {
        let mut summary = Self {
            created_at: Utc::now(),
            cases: records.len(),
            passed: 0,
            failed: 0,
            errored: 0,
            canceled: 0,
            incomplete: 0,
            duration_ms,
            exit_code: 0,
            human_summary: String::new(),
        };

        for record in records {
            let result = &record.result;
            match (result.is_final, result.state, result.outcome) {
                (true, _, Some(Outcome::Pass)) => summary.passed += 1,
                (true, _, Some(Outcome::Fail)) => summary.failed += 1,
                (true, _, Some(Outcome::Error)) => summary.errored += 1,
                (true, Some(CaseState::Canceled), _) => summary.canceled += 1,
                _ => summary.incomplete += 1,
            }
        }

        summary.exit_code = summary.exit_code_enum().as_i32();
        summary.human_summary = summary.to_string();
        summary
    }

    /// Exit code derived from the counts
    pub fn exit_code_enum(&self) -> ExitCode {
        if self.canceled > 0 {
            ExitCode::Cancelled
        } else if self.failed + self.errored + self.incomplete > 0 {
            ExitCode::TestFailures
        } else {
            ExitCode::Success
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code_enum() == ExitCode::Success
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Write to file
    pub fn write_to_file(&self, path: &Path) -> io::Result<()> {
        let json = self.to_json().map_err(|e| {
            io::Error::new(io::ErrorKind::InvalidData, format!("JSON error: {}", e))
        })?;
        fs::write(path, json)
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.cases == 0 {
            return f.write_str("No cases executed");
        }
        write!(
            f,
            "{} case(s): {} passed, {} failed, {} error, {} canceled, {} incomplete",
            self.cases, self.passed, self.failed, self.errored, self.canceled, self.incomplete
        )
    }
}
