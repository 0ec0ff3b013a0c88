//! Collection of browser snapshots and test logs.

use regex_lite::Regex;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::report::Reporter;

/// Snapshot files written by the browser test framework
const SNAPSHOT_PATTERN: &str = r"^\d+-snapshot-.*\.(png|html)";

/// Copies test artifacts of one case into its logs
pub struct ArtifactCollector {
    workdir: PathBuf,
    test_case: String,
    snapshot: Regex,
}

impl ArtifactCollector {
    pub fn new(workdir: impl Into<PathBuf>, test_case: impl Into<String>) -> Self {
        Self {
            workdir: workdir.into(),
            test_case: test_case.into(),
            snapshot: Regex::new(SNAPSHOT_PATTERN).expect("snapshot pattern is valid"),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Directory the test framework writes its logs to
    pub fn test_logs_dir(&self) -> PathBuf {
        self.workdir.join("test_logs").join(&self.test_case)
    }

    fn sorted_files(dir: &Path) -> io::Result<Vec<(String, PathBuf)>> {
        let mut files = Vec::new();
        for entry in fs::read_dir(dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                files.push((name.to_string(), entry.path()));
            }
        }
        files.sort();
        Ok(files)
    }

    /// Copy snapshots not collected yet. Returns how many were added.
    pub fn collect_snapshots(&self, reporter: &dyn Reporter, case_id: &str) -> io::Result<usize> {
        let mut added = 0;
        for (name, path) in Self::sorted_files(&self.workdir)? {
            if self.snapshot.is_match(&name) && !reporter.has_log(case_id, &name) {
                reporter.add_log(case_id, &name, &path)?;
                added += 1;
            }
        }
        Ok(added)
    }

    /// Copy remaining snapshots and every file of the test log directory.
    pub fn collect_final(&self, reporter: &dyn Reporter, case_id: &str) -> io::Result<usize> {
        let mut added = self.collect_snapshots(reporter, case_id)?;

        let logs = self.test_logs_dir();
        if !logs.is_dir() {
            tracing::info!(case = case_id, "no log files generated");
            return Ok(added);
        }
        for (name, path) in Self::sorted_files(&logs)? {
            tracing::debug!(case = case_id, file = %name, "adding log file");
            reporter.add_log(case_id, &name, &path)?;
            added += 1;
        }
        Ok(added)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::Plan;
    use crate::report::RunReport;
    use tempfile::TempDir;

    fn report(dir: &Path) -> RunReport {
        let plan = Plan::from_toml(
            r#"
            [[case]]
            id = "nav"
            workflow = "anaconda-webui"
            configuration = { architecture = "x86_64", branch = "main" }
            automation = { script_file = "./check-navigation", test_case = "TestNavigation" }
        "#,
        )
        .unwrap();
        RunReport::create(dir.join("out"), &plan.cases).unwrap()
    }

    #[test]
    fn test_snapshots_collected_once() {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().join("work");
        fs::create_dir_all(&workdir).unwrap();
        fs::write(workdir.join("1-snapshot-start.png"), "png").unwrap();
        fs::write(workdir.join("2-snapshot-start.html"), "html").unwrap();
        fs::write(workdir.join("snapshot-3.png"), "no").unwrap();
        fs::write(workdir.join("4-snapshot-x.txt"), "no").unwrap();

        let report = report(dir.path());
        let collector = ArtifactCollector::new(&workdir, "TestNavigation");
        assert_eq!(collector.collect_snapshots(&report, "nav").unwrap(), 2);
        assert_eq!(collector.collect_snapshots(&report, "nav").unwrap(), 0);

        fs::write(workdir.join("5-snapshot-end.png"), "png").unwrap();
        assert_eq!(collector.collect_snapshots(&report, "nav").unwrap(), 1);
        assert!(report.has_log("nav", "5-snapshot-end.png"));
        assert!(!report.has_log("nav", "snapshot-3.png"));
    }

    #[test]
    fn test_final_collection() {
        let dir = TempDir::new().unwrap();
        let workdir = dir.path().join("work");
        let logs = workdir.join("test_logs/TestNavigation");
        fs::create_dir_all(&logs).unwrap();
        fs::write(logs.join("journal.txt"), "journal").unwrap();
        fs::write(logs.join("TestNavigation-FAIL.png"), "png").unwrap();

        let report = report(dir.path());
        let collector = ArtifactCollector::new(&workdir, "TestNavigation");
        assert_eq!(collector.collect_final(&report, "nav").unwrap(), 2);
        assert!(report.has_log("nav", "journal.txt"));
    }

    #[test]
    fn test_final_collection_without_logs() {
        let dir = TempDir::new().unwrap();
        let report = report(dir.path());
        let collector = ArtifactCollector::new(dir.path(), "TestNavigation");
        assert_eq!(collector.collect_final(&report, "nav").unwrap(), 0);
    }
}
