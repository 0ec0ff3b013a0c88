//! Progress summary over all tests of a batch.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Counts describing the current state of a batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchSummary {
    /// Tests whose final outcome is SUCCESS.
    pub success: usize,
    /// Tests whose final outcome is FAILED.
    pub failed: usize,
    /// Tests without a final outcome yet (not run, or waiting for a retry).
    pub not_available: usize,
    /// Total attempts recorded across all tests.
    pub runs: usize,
    /// Failed attempts superseded (or about to be superseded) by a retry.
    pub flakes: usize,
    /// Failed attempts whose detail reports a timeout.
    pub timed_out: usize,
}

impl BatchSummary {
    /// Check if every test has a final outcome.
    pub fn is_complete(&self) -> bool {
        self.not_available == 0
    }
}

impl fmt::Display for BatchSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SUCCESS: {} FAILED: {} N/A: {} (runs: {} flakes: {} timed out: {})",
            self.success, self.failed, self.not_available, self.runs, self.flakes, self.timed_out
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let summary = BatchSummary {
            success: 6,
            failed: 2,
            not_available: 1,
            runs: 11,
            flakes: 2,
            timed_out: 1,
        };
        assert_eq!(
            summary.to_string(),
            "SUCCESS: 6 FAILED: 2 N/A: 1 (runs: 11 flakes: 2 timed out: 1)"
        );
        assert!(!summary.is_complete());
    }
}
