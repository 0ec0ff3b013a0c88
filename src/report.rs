//! Result reporting and per-case log files
//!
//! Workflows report `(state, outcome, final)` records and write their logs
//! through a [`Reporter`]. [`RunReport`] keeps the latest record of every
//! case and lays out the output directory:
//!
//! ```text
//! <out>/results.json
//! <out>/<case-id>/virt-install
//! <out>/<case-id>/output.txt
//! <out>/<case-id>/...
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use vmlane_results::CaseResult;

use crate::plan::{CaseRunConfiguration, WorkflowKind};

/// File name of the results document
pub const RESULTS_FILE: &str = "results.json";

/// Sink for case results, status messages and log files
pub trait Reporter: Send + Sync {
    /// Record a new result of `case_id`.
    fn report(&self, case_id: &str, result: CaseResult);

    /// Current result of `case_id`.
    fn result(&self, case_id: &str) -> CaseResult;

    /// Replace the status message shown for `case_id`.
    fn show_status(&self, case_id: &str, message: &str);

    /// Log directory of `case_id`, created on demand.
    fn log_dir(&self, case_id: &str) -> io::Result<PathBuf>;

    /// Path of the log file `name` of `case_id`.
    fn log_path(&self, case_id: &str, name: &str) -> io::Result<PathBuf> {
        Ok(self.log_dir(case_id)?.join(name))
    }

    /// Create (truncate) the log file `name` of `case_id`.
    fn open_logfile(&self, case_id: &str, name: &str) -> io::Result<(File, PathBuf)> {
        let path = self.log_path(case_id, name)?;
        Ok((File::create(&path)?, path))
    }

    /// Copy `source` into the logs of `case_id` as `name`.
    fn add_log(&self, case_id: &str, name: &str, source: &Path) -> io::Result<()> {
        let dest = self.log_path(case_id, name)?;
        fs::copy(source, dest)?;
        Ok(())
    }

    fn has_log(&self, case_id: &str, name: &str) -> bool {
        self.log_path(case_id, name).is_ok_and(|p| p.exists())
    }

    fn is_canceled(&self, case_id: &str) -> bool {
        self.result(case_id).state == Some(vmlane_results::CaseState::Canceled)
    }
}

/// Latest known state of one case
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CaseRecord {
    pub case_id: String,
    pub name: String,
    pub workflow: WorkflowKind,
    pub architecture: String,
    pub result: CaseResult,

    /// Last status message shown for the case
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,

    pub updated_at: DateTime<Utc>,
}

/// Results of all cases of a run, backed by an output directory
pub struct RunReport {
    out_dir: PathBuf,
    records: Mutex<BTreeMap<String, CaseRecord>>,
}

impl RunReport {
    /// Create the output directory and register `cases` as not started.
    pub fn create<'a>(
        out_dir: impl Into<PathBuf>,
        cases: impl IntoIterator<Item = &'a CaseRunConfiguration>,
    ) -> io::Result<Self> {
        let out_dir = out_dir.into();
        fs::create_dir_all(&out_dir)?;
        let now = Utc::now();
        let records = cases
            .into_iter()
            .map(|c| {
                let record = CaseRecord {
                    case_id: c.id.clone(),
                    name: c.display_name().to_string(),
                    workflow: c.workflow,
                    architecture: c.architecture().to_string(),
                    result: CaseResult::not_started(),
                    status: None,
                    updated_at: now,
                };
                (c.id.clone(), record)
            })
            .collect();
        Ok(Self {
            out_dir,
            records: Mutex::new(records),
        })
    }

    pub fn out_dir(&self) -> &Path {
        &self.out_dir
    }

    fn records(&self) -> MutexGuard<'_, BTreeMap<String, CaseRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Snapshot of all records, ordered by case id.
    pub fn snapshot(&self) -> Vec<CaseRecord> {
        self.records().values().cloned().collect()
    }

    pub fn status(&self, case_id: &str) -> Option<String> {
        self.records().get(case_id).and_then(|r| r.status.clone())
    }

    /// Write `results.json` atomically (write-then-rename).
    pub fn write_results(&self) -> io::Result<PathBuf> {
        let json = serde_json::to_string_pretty(&self.snapshot())?;
        let path = self.out_dir.join(RESULTS_FILE);
        let temp_path = path.with_extension("tmp");
        fs::write(&temp_path, json)?;
        fs::rename(&temp_path, &path)?;
        Ok(path)
    }
}

impl Reporter for RunReport {
    fn report(&self, case_id: &str, result: CaseResult) {
        let mut records = self.records();
        let Some(record) = records.get_mut(case_id) else {
            tracing::warn!(case = case_id, "result reported for unknown case");
            return;
        };
        if record.result.is_final {
            tracing::debug!(case = case_id, %result, current = %record.result, "case already final, result dropped");
            return;
        }
        tracing::info!(case = case_id, %result, "case result");
        record.result = result;
        record.updated_at = Utc::now();
    }

    fn result(&self, case_id: &str) -> CaseResult {
        self.records()
            .get(case_id)
            .map(|r| r.result.clone())
            .unwrap_or_default()
    }

    fn show_status(&self, case_id: &str, message: &str) {
        if let Some(record) = self.records().get_mut(case_id) {
            record.status = Some(message.to_string());
        }
    }

    fn log_dir(&self, case_id: &str) -> io::Result<PathBuf> {
        let dir = self.out_dir.join(case_id);
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use tempfile::TempDir;
    use vmlane_results::{CaseState, Outcome};

    fn report(dir: &TempDir) -> RunReport {
        let plan = Plan::from_toml(
            r#"
            [[case]]
            id = "ks-lang"
            workflow = "kickstart-test"
            configuration = { architecture = "x86_64" }
            automation = { test = "lang" }
        "#,
        )
        .unwrap();
        RunReport::create(dir.path().join("out"), &plan.cases).unwrap()
    }

    #[test]
    fn test_final_result_sticks() {
        let dir = TempDir::new().unwrap();
        let report = report(&dir);
        assert_eq!(report.result("ks-lang"), CaseResult::not_started());

        report.report("ks-lang", CaseResult::progress(CaseState::Running));
        report.report("ks-lang", CaseResult::complete(Outcome::Pass));
        report.report("ks-lang", CaseResult::canceled());
        assert_eq!(report.result("ks-lang"), CaseResult::complete(Outcome::Pass));
        assert!(!report.is_canceled("ks-lang"));
    }

    #[test]
    fn test_unknown_case_ignored() {
        let dir = TempDir::new().unwrap();
        let report = report(&dir);
        report.report("nope", CaseResult::canceled());
        assert_eq!(report.snapshot().len(), 1);
    }

    #[test]
    fn test_logs() {
        let dir = TempDir::new().unwrap();
        let report = report(&dir);
        let source = dir.path().join("screen.ppm");
        fs::write(&source, b"P6").unwrap();

        assert!(!report.has_log("ks-lang", "screen.ppm"));
        report.add_log("ks-lang", "screen.ppm", &source).unwrap();
        assert!(report.has_log("ks-lang", "screen.ppm"));

        let (_, path) = report.open_logfile("ks-lang", "output.txt").unwrap();
        assert_eq!(path, dir.path().join("out/ks-lang/output.txt"));
    }

    #[test]
    fn test_write_results() {
        let dir = TempDir::new().unwrap();
        let report = report(&dir);
        report.show_status("ks-lang", "Waiting for VM slot");
        report.report("ks-lang", CaseResult::complete(Outcome::Fail));

        let path = report.write_results().unwrap();
        assert!(!path.with_extension("tmp").exists());
        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap();
        assert_eq!(json[0]["case_id"], "ks-lang");
        assert_eq!(json[0]["workflow"], "kickstart-test");
        assert_eq!(json[0]["result"]["outcome"], "FAIL");
        assert_eq!(json[0]["status"], "Waiting for VM slot");
    }
}
