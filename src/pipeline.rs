//! Run orchestration
//!
//! Builds the shared workflow state from settings and a plan, runs every web
//! UI case and every kickstart batch on its own thread, destroys running VMs
//! on cancellation and finally writes `results.json` and the run summary.

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use thiserror::Error;
use vmlane_results::{CaseResult, Outcome};
use vmlane_virt::{CommandRunner, CommandSpec, HypervisorClient, SystemRunner, VirtError};

use crate::config::{ConfigError, LaneSettings};
use crate::kstest::{KickstartBatchWorkflow, KickstartContext};
use crate::plan::{Plan, PlanError, WorkflowKind};
use crate::report::{Reporter, RunReport};
use crate::signal::CancelToken;
use crate::summary::{RunSummary, RUN_SUMMARY_FILE};
use crate::workflow::{
    install_spec, CommandPreparer, ExecutionMode, HttpProbe, HypervisorPool, ServiceProbe,
    SetupError, SetupRegistry, SourcePreparer, Terminator, VmSlots, VmTestWorkflow, WebUiContext,
    WorkflowError,
};

/// How often the cancellation watcher checks the token
const WATCH_INTERVAL: Duration = Duration::from_millis(200);

/// Timeout of a single web UI probe request
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Pipeline errors
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("hypervisor error: {0}")]
    Virt(#[from] VirtError),

    #[error(transparent)]
    Workflow(#[from] WorkflowError),

    #[error("unknown case {0}")]
    UnknownCase(String),

    #[error("case {0} is not a web UI case")]
    NotWebUi(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Options of one run
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub out_dir: PathBuf,
    pub dry_run: bool,
}

/// What a finished run produced
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub summary: RunSummary,
    pub results_path: PathBuf,
    pub summary_path: PathBuf,
}

/// A configured run of one plan
pub struct Pipeline {
    settings: Arc<LaneSettings>,
    plan: Plan,
    options: RunOptions,
    cancel: CancelToken,
    runner: Arc<dyn CommandRunner>,
    preparer: Option<Arc<dyn SourcePreparer>>,
    probe: Option<Arc<dyn ServiceProbe>>,
    hypervisors: Option<HypervisorPool>,
}

impl Pipeline {
    pub fn new(settings: LaneSettings, plan: Plan, options: RunOptions, cancel: CancelToken) -> Self {
        Self {
            settings: Arc::new(settings),
            plan,
            options,
            cancel,
            runner: Arc::new(SystemRunner),
            preparer: None,
            probe: None,
            hypervisors: None,
        }
    }

    /// Run external commands through `runner`.
    pub fn with_runner(mut self, runner: Arc<dyn CommandRunner>) -> Self {
        self.runner = runner;
        self
    }

    pub fn with_preparer(mut self, preparer: Arc<dyn SourcePreparer>) -> Self {
        self.preparer = Some(preparer);
        self
    }

    pub fn with_probe(mut self, probe: Arc<dyn ServiceProbe>) -> Self {
        self.probe = Some(probe);
        self
    }

    /// Use these hypervisor clients instead of connecting to the configured hosts.
    pub fn with_hypervisors(mut self, hypervisors: HypervisorPool) -> Self {
        self.hypervisors = Some(hypervisors);
        self
    }

    /// Run every case of the plan.
    pub fn run(self) -> Result<RunOutcome, PipelineError> {
        let started = Instant::now();
        let report = Arc::new(RunReport::create(&self.options.out_dir, &self.plan.cases)?);
        let reporter: Arc<dyn Reporter> = report.clone();

        let mode = ExecutionMode::from_settings(&self.settings, Arc::clone(&self.runner));
        let hypervisors = match self.hypervisors {
            Some(pool) => Arc::new(pool),
            None => Arc::new(HypervisorPool::from_settings(&self.settings, Arc::clone(&self.runner))?),
        };
        let webui_ctx = Arc::new(WebUiContext {
            settings: Arc::clone(&self.settings),
            source: self.plan.installation_source()?.map(Arc::new),
            registry: Arc::new(SetupRegistry::new(&self.settings.webui.temp_base)),
            slots: VmSlots::new(self.settings.vm.limit),
            hypervisors: Arc::clone(&hypervisors),
            preparer: self.preparer.clone().unwrap_or_else(|| {
                Arc::new(CommandPreparer::new(Arc::clone(&self.runner), mode.clone()))
            }),
            probe: self.probe.clone().unwrap_or_else(|| {
                Arc::new(HttpProbe::new(self.settings.webui.ssl_verify, PROBE_TIMEOUT))
            }),
            mode,
            reporter: Arc::clone(&reporter),
            runner: Arc::clone(&self.runner),
            cancel: self.cancel.clone(),
            dry_run: self.options.dry_run,
        });
        let kstest_ctx = Arc::new(KickstartContext {
            settings: Arc::clone(&self.settings),
            boot_iso: self.plan.boot_iso.clone(),
            reporter: Arc::clone(&reporter),
            runner: Arc::clone(&self.runner),
            cancel: self.cancel.clone(),
            dry_run: self.options.dry_run,
        });

        let mut workflows = Vec::new();
        for case in self.plan.cases_of(WorkflowKind::AnacondaWebUi) {
            match VmTestWorkflow::new(case.clone(), Arc::clone(&webui_ctx)) {
                Ok(workflow) => workflows.push(workflow),
                Err(e) => {
                    tracing::error!(case = %case.id, error = %e, "invalid case");
                    reporter.show_status(&case.id, &format!("Error: {}", e));
                    reporter.report(&case.id, CaseResult::complete(Outcome::Error));
                }
            }
        }

        let mut by_arch: BTreeMap<&str, Vec<_>> = BTreeMap::new();
        for case in self.plan.cases_of(WorkflowKind::KickstartTest) {
            by_arch.entry(case.architecture()).or_default().push(case);
        }
        let mut batches = Vec::new();
        for (arch, cases) in by_arch {
            batches.push(KickstartBatchWorkflow::new(arch, cases, Arc::clone(&kstest_ctx))?);
        }

        let terminators: Vec<Terminator> = workflows
            .iter()
            .map(VmTestWorkflow::terminator)
            .chain(batches.iter().map(KickstartBatchWorkflow::terminator))
            .collect();
        tracing::info!(
            webui = workflows.len(),
            kickstart_batches = batches.len(),
            dry_run = self.options.dry_run,
            "starting run"
        );

        let finished = AtomicBool::new(false);
        thread::scope(|s| {
            s.spawn(|| watch_cancellation(&self.cancel, &finished, &terminators));

            let mut handles = Vec::new();
            for mut workflow in workflows {
                handles.push(s.spawn(move || {
                    workflow.run();
                }));
            }
            for mut batch in batches {
                handles.push(s.spawn(move || {
                    batch.run();
                }));
            }
            for handle in handles {
                if handle.join().is_err() {
                    tracing::error!("workflow thread panicked");
                }
            }
            finished.store(true, Ordering::SeqCst);
        });

        hypervisors.shutdown();

        let results_path = report.write_results()?;
        let elapsed = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let summary = RunSummary::from_records(&report.snapshot(), elapsed);
        let summary_path = self.options.out_dir.join(RUN_SUMMARY_FILE);
        summary.write_to_file(&summary_path)?;
        tracing::info!(summary = %summary, results = %results_path.display(), "run finished");

        Ok(RunOutcome {
            summary,
            results_path,
            summary_path,
        })
    }
}

/// Call every terminator once cancellation is requested.
fn watch_cancellation(cancel: &CancelToken, finished: &AtomicBool, terminators: &[Terminator]) {
    while !finished.load(Ordering::SeqCst) {
        if cancel.is_cancelled() {
            tracing::warn!("cancellation requested, terminating workflows");
            for terminator in terminators {
                terminator.terminate();
            }
            return;
        }
        thread::sleep(WATCH_INTERVAL);
    }
}

/// The `virt-install` command a web UI case would run.
pub fn explain_case(settings: &LaneSettings, plan: &Plan, case_id: &str) -> Result<CommandSpec, PipelineError> {
    let case = plan
        .case(case_id)
        .ok_or_else(|| PipelineError::UnknownCase(case_id.to_string()))?;
    if case.workflow != WorkflowKind::AnacondaWebUi {
        return Err(PipelineError::NotWebUi(case_id.to_string()));
    }
    let arch = case.architecture();
    let host = settings
        .hypervisor(arch)
        .ok_or_else(|| WorkflowError::from(SetupError::NoHypervisor(arch.to_string())))?;
    let client = HypervisorClient::connect(host, Arc::new(SystemRunner))?;

    let source = plan.installation_source()?;
    let spec = install_spec(
        settings,
        source.as_ref(),
        arch,
        &case.webui()?,
        &case.vm_name()?,
    )?;
    Ok(spec.command(client.uri()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use vmlane_virt::mock::MockRunner;

    const PLAN: &str = r#"
        [installation_source]
        base_repo_id = "BaseOS"
        [installation_source.repos.BaseOS.x86_64]
        os = "http://example.com/compose/x86_64/BaseOS/os"
        kernel = "images/pxeboot/vmlinuz"
        initrd = "images/pxeboot/initrd.img"

        [[case]]
        id = "navigation"
        workflow = "anaconda-webui"
        configuration = { architecture = "x86_64", branch = "main" }
        automation = { script_file = "./check-navigation", test_case = "TestNavigation" }

        [[case]]
        id = "lang"
        workflow = "kickstart-test"
        configuration = { architecture = "x86_64" }
        automation = { test = "lang" }
    "#;

    #[test]
    fn test_explain_case() {
        let plan = Plan::from_toml(PLAN).unwrap();
        let cmd = explain_case(&LaneSettings::default(), &plan, "navigation").unwrap();
        let argv = cmd.argv();
        assert_eq!(argv[0], "virt-install");
        assert!(argv.contains(&"qemu:///system".to_string()));
        assert!(argv.contains(
            &"http://example.com/compose/x86_64/BaseOS/os,kernel=images/pxeboot/vmlinuz,initrd=images/pxeboot/initrd.img"
                .to_string()
        ));
    }

    #[test]
    fn test_explain_rejects_kickstart_case() {
        let plan = Plan::from_toml(PLAN).unwrap();
        let err = explain_case(&LaneSettings::default(), &plan, "lang").unwrap_err();
        assert!(matches!(err, PipelineError::NotWebUi(_)));
        let err = explain_case(&LaneSettings::default(), &plan, "nope").unwrap_err();
        assert!(matches!(err, PipelineError::UnknownCase(_)));
    }

    fn vm_terminator(runner: &Arc<MockRunner>) -> Terminator {
        Terminator::Vm {
            hypervisor: Arc::new(HypervisorClient::connect("localhost", runner.clone()).unwrap()),
            vm_name: "vmlane-navigation-1".to_string(),
        }
    }

    #[test]
    fn test_watcher_terminates_on_cancel() {
        let runner = Arc::new(MockRunner::new());
        let terminators = vec![vm_terminator(&runner), Terminator::Noop];
        let cancel = CancelToken::new();
        let finished = AtomicBool::new(false);

        thread::scope(|s| {
            let watcher = s.spawn(|| watch_cancellation(&cancel, &finished, &terminators));
            thread::sleep(WATCH_INTERVAL * 2);
            assert_eq!(runner.count(&["destroy"]), 0);
            cancel.cancel();
            watcher.join().unwrap();
        });

        let destroys = runner.calls_matching(&["destroy"]);
        assert_eq!(destroys.len(), 1);
        assert!(destroys[0].argv().contains(&"vmlane-navigation-1".to_string()));
    }

    #[test]
    fn test_watcher_stops_when_finished() {
        let runner = Arc::new(MockRunner::new());
        let cancel = CancelToken::new();
        let finished = AtomicBool::new(true);

        watch_cancellation(&cancel, &finished, &[vm_terminator(&runner)]);
        assert_eq!(runner.count(&["destroy"]), 0);
    }
}
