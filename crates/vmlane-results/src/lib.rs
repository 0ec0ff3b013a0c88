//! Live result aggregation for batch installer test runs.
//!
//! A batch runner executes many kickstart tests in one subprocess and prints a
//! result line for every finished attempt. [`BatchResults`] keeps the attempt
//! history of every expected test and derives the current aggregate result of
//! each test from it, collapsing a failed first attempt into a pending retry
//! when retry-on-flake is enabled.

mod parser;
mod result;
mod summary;

pub use parser::{parse_line, AttemptOutcome, ParseError, ResultRecord, RESULT_PREFIX};
pub use result::{CaseResult, CaseState, Outcome};
pub use summary::BatchSummary;

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A single recorded attempt of a test.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempt {
    pub outcome: AttemptOutcome,
    pub detail: String,
}

impl Attempt {
    /// Check if this attempt failed because the test timed out.
    pub fn is_timeout(&self) -> bool {
        self.outcome == AttemptOutcome::Failed
            && self.detail.to_ascii_lowercase().contains("timed out")
    }
}

/// Current results of the tests run in one batch.
#[derive(Debug, Clone)]
pub struct BatchResults {
    /// Attempt history per expected test.
    results: BTreeMap<String, Vec<Attempt>>,
    /// Whether the runner retries a test after its first failure.
    retry: bool,
}

impl BatchResults {
    /// Create an empty result set for the given tests.
    pub fn new<I, S>(tests: I, retry: bool) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            results: tests.into_iter().map(|t| (t.into(), Vec::new())).collect(),
            retry,
        }
    }

    /// Whether retry-on-flake is enabled.
    pub fn retry(&self) -> bool {
        self.retry
    }

    /// Names of all expected tests.
    pub fn tests(&self) -> impl Iterator<Item = &str> {
        self.results.keys().map(String::as_str)
    }

    /// Recorded attempts of a test, `None` for tests not in the batch.
    pub fn attempts(&self, test: &str) -> Option<&[Attempt]> {
        match self.results.get(test) {
            Some(attempts) => Some(attempts.as_slice()),
            None => {
                tracing::warn!(test, "requested results of unexpected test");
                None
            }
        }
    }

    /// Update the results from one line of runner output.
    ///
    /// Returns the name of the test whose attempt finished together with its
    /// new aggregate result, or `None` if the line did not record a result of
    /// an expected test.
    pub fn process_line(&mut self, line: &str) -> Option<(String, CaseResult)> {
        let record = match parse_line(line)? {
            Ok(record) => record,
            Err(e) => {
                tracing::warn!(error = %e, line, "unable to parse result from runner output");
                return None;
            }
        };
        self.record(record)
    }

    /// Append an already parsed attempt record.
    pub fn record(&mut self, record: ResultRecord) -> Option<(String, CaseResult)> {
        let Some(attempts) = self.results.get_mut(&record.test) else {
            tracing::warn!(test = %record.test, "found result of unexpected test");
            return None;
        };
        attempts.push(Attempt {
            outcome: record.outcome,
            detail: record.detail,
        });
        let result = self.aggregate(&record.test);
        Some((record.test, result))
    }

    /// Aggregate result of a test derived from its attempt history.
    pub fn aggregate(&self, test: &str) -> CaseResult {
        match self.results.get(test) {
            Some(attempts) => aggregate_attempts(attempts, self.retry),
            None => CaseResult::not_started(),
        }
    }

    /// Check if a test is waiting for a retry of its failed first attempt.
    pub fn is_pending_retry(&self, test: &str) -> bool {
        self.results
            .get(test)
            .is_some_and(|attempts| is_pending_retry(attempts, self.retry))
    }

    /// Summarize the current state of the batch.
    pub fn summary(&self) -> BatchSummary {
        let mut summary = BatchSummary::default();

        for attempts in self.results.values() {
            summary.runs += attempts.len();
            summary.timed_out += attempts.iter().filter(|a| a.is_timeout()).count();

            let Some(last) = attempts.last() else {
                continue;
            };
            if is_pending_retry(attempts, self.retry) {
                summary.flakes += 1;
                continue;
            }
            match last.outcome {
                AttemptOutcome::Success => {
                    summary.success += 1;
                    summary.flakes += attempts.len() - 1;
                }
                AttemptOutcome::Failed => summary.failed += 1,
                AttemptOutcome::Other(_) => {}
            }
        }

        summary.not_available = self.results.len() - summary.success - summary.failed;
        summary
    }

    /// Short human readable status of a test (its attempt history).
    pub fn status_line(&self, test: &str) -> String {
        match self.results.get(test) {
            Some(attempts) if !attempts.is_empty() => attempts
                .iter()
                .map(|a| {
                    if a.detail.is_empty() {
                        a.outcome.to_string()
                    } else {
                        format!("{} ({})", a.outcome, a.detail)
                    }
                })
                .collect::<Vec<_>>()
                .join(", "),
            _ => String::new(),
        }
    }
}

/// A single failed attempt with retry enabled is a flake awaiting its rerun.
fn is_pending_retry(attempts: &[Attempt], retry: bool) -> bool {
    retry && attempts.len() == 1 && attempts[0].outcome == AttemptOutcome::Failed
}

fn aggregate_attempts(attempts: &[Attempt], retry: bool) -> CaseResult {
    let Some(last) = attempts.last() else {
        return CaseResult::not_started();
    };
    if is_pending_retry(attempts, retry) {
        return CaseResult::progress(CaseState::Running);
    }
    match last.outcome {
        AttemptOutcome::Success => CaseResult::complete(Outcome::Pass),
        AttemptOutcome::Failed => CaseResult::complete(Outcome::Fail),
        // Final, but neither a pass nor a fail.
        AttemptOutcome::Other(_) => CaseResult::new(Some(CaseState::Complete), None, true),
    }
}
