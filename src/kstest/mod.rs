//! Kickstart test batches
//!
//! All kickstart cases of one architecture run as a single batch: one
//! kickstart-tests checkout, one boot image and one runner subprocess whose
//! output is fed line by line into [`BatchResults`]. Every case bound to a
//! finished test receives the test's aggregate result.

mod error;
mod fetch;

pub use error::KickstartError;
pub use fetch::{fetch_boot_image, remove_boot_image, BOOT_IMAGE_PATH};

use std::collections::BTreeMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;
use std::time::Duration;

use tempfile::TempDir;
use vmlane_results::{BatchResults, BatchSummary, CaseResult, CaseState, Outcome};
use vmlane_virt::{wait_timeout, ChildExit, CommandRunner, CommandSpec, ManagedChild};

use crate::config::LaneSettings;
use crate::plan::{CaseRunConfiguration, PlanError};
use crate::report::Reporter;
use crate::signal::CancelToken;
use crate::workflow::Terminator;

/// Architectures the batch runner can test
pub const SUPPORTED_ARCHITECTURES: &[&str] = &["x86_64"];

/// Log file receiving the runner output, added to every case of the batch
const RUNNER_LOG: &str = "kstest-runner.txt";

const RUNNER_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// State shared by all kickstart batches of a run
pub struct KickstartContext {
    pub settings: Arc<LaneSettings>,
    /// Boot image URL per architecture
    pub boot_iso: BTreeMap<String, String>,
    pub reporter: Arc<dyn Reporter>,
    pub runner: Arc<dyn CommandRunner>,
    pub cancel: CancelToken,
    pub dry_run: bool,
}

enum Checkout {
    Local(PathBuf),
    Cloned { dir: TempDir, repo: PathBuf },
}

impl Checkout {
    fn path(&self) -> &Path {
        match self {
            Checkout::Local(path) => path,
            Checkout::Cloned { repo, .. } => repo,
        }
    }

    fn remove(self) {
        if let Checkout::Cloned { dir, .. } = self {
            let path = dir.path().to_path_buf();
            if let Err(e) = dir.close() {
                tracing::warn!(dir = %path.display(), error = %e, "failed to remove checkout");
            }
        }
    }
}

/// One batch of kickstart tests for one architecture
pub struct KickstartBatchWorkflow {
    arch: String,
    /// Case ids per test name
    groups: BTreeMap<String, Vec<String>>,
    ctx: Arc<KickstartContext>,
}

impl KickstartBatchWorkflow {
    pub fn new<'a>(
        arch: impl Into<String>,
        cases: impl IntoIterator<Item = &'a CaseRunConfiguration>,
        ctx: Arc<KickstartContext>,
    ) -> Result<Self, PlanError> {
        let mut groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for case in cases {
            groups
                .entry(case.kickstart_test()?.to_string())
                .or_default()
                .push(case.id.clone());
        }
        Ok(Self {
            arch: arch.into(),
            groups,
            ctx,
        })
    }

    pub fn architecture(&self) -> &str {
        &self.arch
    }

    /// Test names of the batch, sorted
    pub fn tests(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    fn case_ids(&self) -> impl Iterator<Item = &str> {
        self.groups.values().flatten().map(String::as_str)
    }

    /// A running batch cannot be interrupted.
    pub fn terminator(&self) -> Terminator {
        Terminator::Refuse {
            what: format!("kickstart batch {}", self.arch),
        }
    }

    fn report_all(&self, result: CaseResult) {
        for case in self.case_ids() {
            self.ctx.reporter.report(case, result.clone());
        }
    }

    fn fail_all(&self, error: &KickstartError) {
        tracing::error!(arch = %self.arch, error = %error, "kickstart batch failed");
        for case in self.case_ids() {
            self.ctx.reporter.show_status(case, &format!("Error: {}", error));
        }
        self.report_all(CaseResult::complete(Outcome::Error));
    }

    /// Run the batch. Returns its summary, or `None` if it was skipped,
    /// cancelled or failed.
    pub fn run(&mut self) -> Option<BatchSummary> {
        let span = tracing::info_span!("kstest", arch = %self.arch);
        let _guard = span.enter();

        let Some(url) = self.ctx.boot_iso.get(&self.arch).cloned() else {
            tracing::warn!("no boot image for this architecture, skipping batch");
            return None;
        };
        self.report_all(CaseResult::progress(CaseState::Queued));

        if self.ctx.cancel.is_cancelled() {
            self.report_all(CaseResult::canceled());
            return None;
        }
        if !SUPPORTED_ARCHITECTURES.contains(&self.arch.as_str()) {
            tracing::warn!("architecture not supported by the batch runner, skipping batch");
            return None;
        }

        let checkout = match self.checkout() {
            Ok(checkout) => checkout,
            Err(e) => {
                self.fail_all(&e);
                return None;
            }
        };
        let image = checkout.path().join(BOOT_IMAGE_PATH);
        let outcome = fetch_boot_image(&url, &image).and_then(|()| self.execute(checkout.path()));

        remove_boot_image(&image);
        checkout.remove();

        match outcome {
            Ok(summary) => Some(summary),
            Err(e) => {
                self.fail_all(&e);
                None
            }
        }
    }

    fn checkout(&self) -> Result<Checkout, KickstartError> {
        let settings = &self.ctx.settings.kickstart;
        if let Some(ref local) = settings.local_repo {
            tracing::info!(repo = %local.display(), "using local kickstart-tests checkout");
            return Ok(Checkout::Local(local.clone()));
        }

        let dir = tempfile::Builder::new()
            .prefix("vmlane_kstest_")
            .tempdir_in(&self.ctx.settings.webui.temp_base)?;
        let repo = dir.path().join("kickstart-tests");
        let repo_arg = repo.display().to_string();
        let cmd = CommandSpec::new("git").args([
            "clone",
            settings.repo.as_str(),
            repo_arg.as_str(),
            "--branch",
            settings.branch.as_str(),
        ]);
        tracing::info!(repo = %settings.repo, branch = %settings.branch, "cloning kickstart-tests");
        self.ctx
            .runner
            .checked(&cmd)
            .map_err(|source| KickstartError::Clone {
                repo: settings.repo.clone(),
                source,
            })?;
        Ok(Checkout::Cloned { dir, repo })
    }

    fn runner_command(&self, repo: &Path) -> Result<CommandSpec, KickstartError> {
        let mut argv = Vec::new();
        if self.ctx.dry_run {
            argv.push("echo".to_string());
        }
        argv.extend(self.ctx.settings.kickstart.runner_argv());
        argv.extend(self.groups.keys().cloned());
        let cmd = CommandSpec::from_argv(&argv).ok_or(KickstartError::EmptyCommand)?;
        Ok(cmd.cwd(repo).piped())
    }

    fn execute(&self, repo: &Path) -> Result<BatchSummary, KickstartError> {
        let ctx = &self.ctx;
        self.report_all(CaseResult::progress(CaseState::Started));

        let mut results = BatchResults::new(self.groups.keys(), ctx.settings.kickstart.retry);
        self.report_all(CaseResult::progress(CaseState::Running));

        let cmd = self.runner_command(repo)?;
        tracing::info!(command = %cmd.display(), "running kickstart tests");
        let mut child = ctx.runner.spawn(&cmd)?;

        let (mut log, log_path) = match self.case_ids().next() {
            Some(case) => {
                let (file, path) = ctx.reporter.open_logfile(case, RUNNER_LOG)?;
                (Some(file), Some(path))
            }
            None => (None, None),
        };

        let lines = read_lines(child.as_mut());
        for line in lines {
            tracing::info!("{}", line);
            log_line(&mut log, &line);
            if let Some((test, result)) = results.process_line(&line) {
                self.publish(&results, &test, result);
                tracing::info!(summary = %results.summary(), "batch progress");
            }
        }

        let exit = wait_for_exit(child.as_mut())?;
        tracing::info!(?exit, "kickstart runner finished");
        self.finish(&results);

        if let Some(ref path) = log_path {
            for case in self.case_ids().skip(1) {
                if let Err(e) = ctx.reporter.add_log(case, RUNNER_LOG, path) {
                    tracing::warn!(case, error = %e, "failed to add runner log");
                }
            }
        }

        let summary = results.summary();
        tracing::info!(%summary, "kickstart batch finished");
        Ok(summary)
    }

    fn publish(&self, results: &BatchResults, test: &str, result: CaseResult) {
        let Some(cases) = self.groups.get(test) else {
            return;
        };
        let status = results.status_line(test);
        for case in cases {
            self.ctx.reporter.show_status(case, &status);
            self.ctx.reporter.report(case, result.clone());
        }
    }

    /// Settle tests the runner left without a final result.
    fn finish(&self, results: &BatchResults) {
        for (test, cases) in &self.groups {
            let current = results.aggregate(test);
            if current.is_final {
                continue;
            }
            let attempted = results.attempts(test).is_some_and(|a| !a.is_empty());
            let (result, status) = if attempted {
                (CaseResult::complete(Outcome::Fail), results.status_line(test))
            } else if self.ctx.dry_run {
                (CaseResult::complete(Outcome::Pass), "Dry-run".to_string())
            } else {
                tracing::warn!(test = %test, "no result reported for test");
                (CaseResult::complete(Outcome::Error), "No result reported".to_string())
            };
            for case in cases {
                self.ctx.reporter.show_status(case, &status);
                self.ctx.reporter.report(case, result.clone());
            }
        }
    }
}

/// Append `line` to the runner log. A failed write closes the log so the
/// runner output keeps being drained.
fn log_line<W: Write>(log: &mut Option<W>, line: &str) {
    if let Some(file) = log.as_mut() {
        if let Err(e) = writeln!(file, "{}", line) {
            tracing::warn!(error = %e, "failed to write runner log, no longer logging to file");
            *log = None;
        }
    }
}

/// Merge stdout and stderr of `child` into one stream of lines.
fn read_lines(child: &mut dyn ManagedChild) -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel();
    let pipes: Vec<Box<dyn Read + Send>> = [child.take_stdout(), child.take_stderr()]
        .into_iter()
        .flatten()
        .collect();
    for pipe in pipes {
        let tx = tx.clone();
        thread::spawn(move || forward_lines(BufReader::new(pipe), &tx));
    }
    rx
}

/// Send every line of `reader` until EOF. Bytes that are not UTF-8 are
/// replaced, so one bad line never stops the draining.
fn forward_lines(mut reader: impl BufRead, tx: &mpsc::Sender<String>) {
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf) {
            Ok(0) => return,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send(line).is_err() {
                    return;
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
            Err(e) => {
                tracing::warn!(error = %e, "failed to read runner output");
                return;
            }
        }
    }
}

fn wait_for_exit(child: &mut dyn ManagedChild) -> std::io::Result<ChildExit> {
    loop {
        if let Some(exit) = wait_timeout(child, RUNNER_POLL_INTERVAL)? {
            return Ok(exit);
        }
    }
}
