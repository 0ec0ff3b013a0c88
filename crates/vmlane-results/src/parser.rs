//! Batch runner output line parser.
//!
//! The kickstart tests launcher prints one line per finished test attempt:
//!
//! ```text
//! INFO: RESULT:<test>:<host>:<result>:<detail>
//! ```
//!
//! The detail field is free text and may itself contain colons. All other
//! lines are informational and ignored by the parser.

use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

/// Prefix marking a result record line.
pub const RESULT_PREFIX: &str = "INFO: RESULT:";

/// Number of colon separated fields in a result line (including the prefix).
const RESULT_FIELDS: usize = 6;

/// Outcome of a single test attempt.
///
/// Results other than `SUCCESS` and `FAILED` are kept verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum AttemptOutcome {
    Success,
    Failed,
    Other(String),
}

impl FromStr for AttemptOutcome {
    type Err = Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl From<String> for AttemptOutcome {
    fn from(s: String) -> Self {
        match s.as_str() {
            "SUCCESS" => AttemptOutcome::Success,
            "FAILED" => AttemptOutcome::Failed,
            _ => AttemptOutcome::Other(s),
        }
    }
}

impl From<AttemptOutcome> for String {
    fn from(outcome: AttemptOutcome) -> Self {
        outcome.to_string()
    }
}

impl fmt::Display for AttemptOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttemptOutcome::Success => f.write_str("SUCCESS"),
            AttemptOutcome::Failed => f.write_str("FAILED"),
            AttemptOutcome::Other(other) => f.write_str(other),
        }
    }
}

/// A parsed result record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultRecord {
    /// Name of the test the record belongs to.
    pub test: String,
    /// Outcome of the attempt.
    pub outcome: AttemptOutcome,
    /// Free-form detail message.
    pub detail: String,
}

/// Errors from parsing a line that carries the result prefix.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("result line has {found} fields, expected {RESULT_FIELDS}")]
    FieldCount { found: usize },
}

/// Parse a single output line.
///
/// Returns `None` for informational lines, `Some(Ok(..))` for well-formed
/// result records and `Some(Err(..))` for lines that carry the result prefix
/// but cannot be parsed.
pub fn parse_line(line: &str) -> Option<Result<ResultRecord, ParseError>> {
    let line = line.trim();
    if !line.starts_with(RESULT_PREFIX) {
        return None;
    }

    let fields: Vec<&str> = line.splitn(RESULT_FIELDS, ':').collect();
    if fields.len() != RESULT_FIELDS {
        return Some(Err(ParseError::FieldCount {
            found: fields.len(),
        }));
    }

    Some(Ok(ResultRecord {
        test: fields[2].to_string(),
        outcome: AttemptOutcome::from(fields[4].to_string()),
        detail: fields[5].to_string(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_informational_line() {
        assert_eq!(parse_line("INFO: running test lang on host 1"), None);
        assert_eq!(parse_line(""), None);
    }

    #[test]
    fn test_success_line() {
        let record = parse_line("INFO: RESULT:lang:a3f1e2:SUCCESS:")
            .unwrap()
            .unwrap();
        assert_eq!(record.test, "lang");
        assert_eq!(record.outcome, AttemptOutcome::Success);
        assert_eq!(record.detail, "");
    }

    #[test]
    fn test_detail_keeps_colons() {
        let record = parse_line("INFO: RESULT:services:b0c1:FAILED:Test timed out: after 30m")
            .unwrap()
            .unwrap();
        assert_eq!(record.outcome, AttemptOutcome::Failed);
        assert_eq!(record.detail, "Test timed out: after 30m");
    }

    #[test]
    fn test_too_few_fields() {
        let err = parse_line("INFO: RESULT:lang:SUCCESS").unwrap().unwrap_err();
        assert_eq!(err, ParseError::FieldCount { found: 4 });
    }

    #[test]
    fn test_unknown_outcome_kept() {
        let record = parse_line("INFO: RESULT:lang:host:SKIPPED:whatever")
            .unwrap()
            .unwrap();
        assert_eq!(record.outcome, AttemptOutcome::Other("SKIPPED".to_string()));
        assert_eq!(record.outcome.to_string(), "SKIPPED");
        assert_eq!(record.detail, "whatever");
    }

    #[test]
    fn test_outcome_serializes_as_runner_text() {
        let json = serde_json::to_string(&AttemptOutcome::Other("SKIPPED".to_string())).unwrap();
        assert_eq!(json, "\"SKIPPED\"");
        let parsed: AttemptOutcome = serde_json::from_str("\"FAILED\"").unwrap();
        assert_eq!(parsed, AttemptOutcome::Failed);
    }

    #[test]
    fn test_surrounding_whitespace_is_ignored() {
        let record = parse_line("  INFO: RESULT:lang:h:FAILED:boom\n").unwrap().unwrap();
        assert_eq!(record.detail, "boom");
    }
}
