//! The VM test workflow state machine.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use vmlane_results::{CaseResult, CaseState, Outcome};
use vmlane_virt::{
    container_path, wait_timeout, CommandRunner, CommandSpec, ContainerRun, ForwardSet,
    HypervisorClient, InstallSpec, ManagedChild,
};

use crate::config::LaneSettings;
use crate::plan::{CaseRunConfiguration, WebUiCase};
use crate::report::Reporter;
use crate::signal::CancelToken;
use crate::source::InstallationSource;
use crate::timeout::{Deadline, WorkflowTimeouts};

use super::artifacts::ArtifactCollector;
use super::cmdline::{install_location, kernel_cmdline, BootOptions, ExtraArgs};
use super::error::{SetupError, WorkflowError};
use super::readiness::{wait_for_service, ServiceProbe};
use super::registry::SetupRegistry;
use super::setup::{ensure_test_repo, prepare_branch, BranchLayout, BranchSources, SourcePreparer};
use super::slots::{SlotPermit, VmSlots};
use super::state::{PhaseTracker, WorkflowPhase};
use super::{ExecutionMode, HypervisorPool, Terminator};

/// How often a running test is checked for completion and new snapshots
const TEST_POLL_INTERVAL: Duration = Duration::from_secs(1);

const CONTAINER_BUILD_LOG: &str = "container-build.txt";
const INSTALLER_LOG: &str = "virt-install";
const TEST_OUTPUT_LOG: &str = "output.txt";
const SERVICE_SCREENSHOT: &str = "screenshot_webui_not_accessible.ppm";

/// State shared by all web UI workflows of a run
pub struct WebUiContext {
    pub settings: Arc<LaneSettings>,
    pub source: Option<Arc<InstallationSource>>,
    pub registry: Arc<SetupRegistry>,
    pub slots: Arc<VmSlots>,
    pub hypervisors: Arc<HypervisorPool>,
    pub mode: ExecutionMode,
    pub preparer: Arc<dyn SourcePreparer>,
    pub probe: Arc<dyn ServiceProbe>,
    pub reporter: Arc<dyn Reporter>,
    /// Runner for test processes in host mode
    pub runner: Arc<dyn CommandRunner>,
    pub cancel: CancelToken,
    pub dry_run: bool,
}

/// Address of the system under test as seen by the test tooling
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTarget {
    pub host: String,
    pub ssh_port: u16,
    pub webui_port: u16,
    /// Web UI URL as reachable from this machine
    pub url: String,
}

/// Resources acquired along the way, released in teardown
#[derive(Default)]
struct Acquired {
    layout: Option<BranchLayout>,
    workdir: Option<PathBuf>,
    permit: Option<SlotPermit>,
    installer: Option<Box<dyn ManagedChild>>,
    forwards: Option<ForwardSet>,
}

/// Runs one installer web UI test case in a fresh VM
pub struct VmTestWorkflow {
    case: CaseRunConfiguration,
    webui: WebUiCase,
    vm_name: String,
    ctx: Arc<WebUiContext>,
    hypervisor: Option<Arc<HypervisorClient>>,
    timeouts: WorkflowTimeouts,
    phases: PhaseTracker,
}

impl VmTestWorkflow {
    pub fn new(case: CaseRunConfiguration, ctx: Arc<WebUiContext>) -> Result<Self, WorkflowError> {
        let webui = case.webui()?;
        let vm_name = case.vm_name()?;
        let hypervisor = ctx.hypervisors.get(case.architecture());
        let timeouts = ctx
            .settings
            .timeouts()
            .with_startup_minutes(webui.startup_timeout);
        Ok(Self {
            case,
            webui,
            vm_name,
            ctx,
            hypervisor,
            timeouts,
            phases: PhaseTracker::new(),
        })
    }

    /// Override the timeouts derived from settings.
    pub fn with_timeouts(mut self, timeouts: WorkflowTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    pub fn vm_name(&self) -> &str {
        &self.vm_name
    }

    pub fn case_id(&self) -> &str {
        &self.case.id
    }

    pub fn phases(&self) -> &PhaseTracker {
        &self.phases
    }

    /// Handle destroying this workflow's VM on cancellation.
    pub fn terminator(&self) -> Terminator {
        match self.hypervisor {
            Some(ref hypervisor) if !self.ctx.dry_run => Terminator::Vm {
                hypervisor: Arc::clone(hypervisor),
                vm_name: self.vm_name.clone(),
            },
            _ => Terminator::Noop,
        }
    }

    fn enter(&mut self, phase: WorkflowPhase) {
        if let Err(e) = self.phases.transition(phase) {
            tracing::debug!(vm = %self.vm_name, error = %e, "phase change skipped");
        }
    }

    /// Status message shown for the case.
    fn show(&self, message: &str) {
        tracing::info!(vm = %self.vm_name, "{}", message);
        self.ctx.reporter.show_status(&self.case.id, message);
    }

    fn check_cancel(&self) -> Result<(), WorkflowError> {
        if self.ctx.cancel.is_cancelled() {
            return Err(WorkflowError::Cancelled);
        }
        Ok(())
    }

    /// Run setup, the test and teardown. Returns the final result, which
    /// has also been reported.
    pub fn run(&mut self) -> CaseResult {
        let span = tracing::info_span!("webui", vm = %self.vm_name, case = %self.case.id);
        let _guard = span.enter();

        let mut acquired = Acquired::default();
        let result = match self.setup(&mut acquired) {
            Ok(target) => self.execute(&mut acquired, &target),
            Err(e) => Err(e),
        };
        let result = match result {
            Ok(result) => result,
            Err(WorkflowError::Cancelled) => {
                self.show("Canceled");
                self.enter(WorkflowPhase::Canceled);
                CaseResult::canceled()
            }
            Err(e) => {
                tracing::error!(vm = %self.vm_name, error = %e, "workflow failed");
                self.show(&format!("Error: {}", e));
                CaseResult::complete(Outcome::Error)
            }
        };
        self.ctx.reporter.report(&self.case.id, result.clone());

        self.teardown(acquired);
        result
    }

    fn setup(&mut self, acquired: &mut Acquired) -> Result<TestTarget, WorkflowError> {
        let hypervisor = self
            .hypervisor
            .clone()
            .ok_or_else(|| SetupError::NoHypervisor(self.case.architecture().to_string()))?;
        let ctx = Arc::clone(&self.ctx);
        let settings = &ctx.settings;

        self.enter(WorkflowPhase::WaitingSetupLock);
        self.show("Waiting for setup lock");
        self.check_cancel()?;
        {
            let mut guard = ctx.registry.lock();
            self.check_cancel()?;
            self.enter(WorkflowPhase::SettingUp);
            self.show("Running setup");

            if let Some(container) = ctx.mode.container() {
                tracing::info!("preparing container image, see {}", CONTAINER_BUILD_LOG);
                let log = ctx.reporter.log_path(&self.case.id, CONTAINER_BUILD_LOG)?;
                container
                    .ensure_image(&log)
                    .map_err(|e| SetupError::Container(e.to_string()))?;
            }

            let membership = guard.join(&self.webui.branch, &self.vm_name)?;
            let layout = BranchLayout::new(&membership.dir);
            acquired.layout = Some(layout.clone());

            if membership.needs_prepare {
                self.show("Cloning common repositories");
                let sources = BranchSources {
                    anaconda_repo: settings.webui.anaconda_repo.clone(),
                    branch: self.webui.branch.clone(),
                    cockpit_repo: settings.webui.cockpit_repo.clone(),
                    cockpit_branch: settings.webui.cockpit_branch.clone(),
                    bots_repo: settings.webui.bots_repo.clone(),
                    bots_branch: settings.webui.bots_branch.clone(),
                };
                prepare_branch(ctx.preparer.as_ref(), &layout, &sources)?;
                guard.mark_prepared(&self.webui.branch);
            }

            let mut workdir = layout.anaconda_dir();
            if let Some(ref name) = self.webui.test_repo {
                let url = settings
                    .test_repo(name)
                    .ok_or_else(|| SetupError::UnknownTestRepo(name.clone()))?;
                workdir = ensure_test_repo(
                    ctx.preparer.as_ref(),
                    &layout,
                    name,
                    url,
                    &self.webui.branch,
                )?;
            }
            acquired.workdir = Some(workdir);

            if !ctx.dry_run {
                hypervisor.setup()?;
            }
        }

        self.enter(WorkflowPhase::WaitingVmSlot);
        self.show("Waiting for VM slot");
        let permit = ctx
            .slots
            .acquire(&ctx.cancel)
            .ok_or(WorkflowError::Cancelled)?;
        acquired.permit = Some(permit);
        ctx.reporter
            .report(&self.case.id, CaseResult::progress(CaseState::Started));

        let webui_port = settings.webui.port_webui;
        let ssh_port = settings.webui.port_ssh;
        if ctx.dry_run {
            return Ok(TestTarget {
                host: "localhost".to_string(),
                ssh_port,
                webui_port,
                url: format!("http://localhost:{}{}", webui_port, settings.webui.location),
            });
        }

        self.enter(WorkflowPhase::ProvisioningVm);
        self.show("Starting VM");
        let spec = install_spec(
            settings,
            ctx.source.as_deref(),
            self.case.architecture(),
            &self.webui,
            &self.vm_name,
        )?;
        let log = ctx.reporter.log_path(&self.case.id, INSTALLER_LOG)?;
        tracing::debug!(command = %spec.command(hypervisor.uri()).display(), "running");
        acquired.installer = Some(hypervisor.install(&spec, &log)?);

        self.enter(WorkflowPhase::WaitingNetwork);
        self.show("Waiting for IP");
        let ip = hypervisor.wait_for_address(&self.vm_name, &self.timeouts.address_policy(), || {
            ctx.cancel.is_cancelled()
        })?;

        let target = if hypervisor.is_remote() && settings.webui.port_forwarding {
            let forwards = hypervisor.configure_forwarding(&ip, &[ssh_port, webui_port])?;
            let local_webui = forwards.local_port(webui_port).unwrap_or(webui_port);
            let local_ssh = forwards.local_port(ssh_port).unwrap_or(ssh_port);
            acquired.forwards = Some(forwards);
            TestTarget {
                host: ctx.mode.local_host().to_string(),
                ssh_port: local_ssh,
                webui_port: local_webui,
                url: format!("http://localhost:{}{}", local_webui, settings.webui.location),
            }
        } else {
            TestTarget {
                url: format!("http://{}:{}{}", ip, webui_port, settings.webui.location),
                host: ip,
                ssh_port,
                webui_port,
            }
        };

        self.enter(WorkflowPhase::WaitingService);
        self.show("Waiting for WebUI");
        tracing::debug!(url = %target.url, "expected web UI URL");
        wait_for_service(
            ctx.probe.as_ref(),
            &target.url,
            &self.timeouts.startup_policy(),
            &ctx.cancel,
            || self.take_screenshot(&hypervisor, SERVICE_SCREENSHOT),
        )?;

        self.enter(WorkflowPhase::Ready);
        Ok(target)
    }

    fn take_screenshot(&self, hypervisor: &HypervisorClient, name: &str) {
        let shot = match tempfile::NamedTempFile::new() {
            Ok(f) => f,
            Err(e) => {
                tracing::warn!(error = %e, "failed to create screenshot file");
                return;
            }
        };
        if let Err(e) = hypervisor.screenshot(&self.vm_name, shot.path()) {
            tracing::warn!(vm = %self.vm_name, error = %e, "failed to take screenshot");
            return;
        }
        if let Err(e) = self.ctx.reporter.add_log(&self.case.id, name, shot.path()) {
            tracing::warn!(error = %e, "failed to store screenshot");
        }
    }

    fn test_argv(&self, target: &TestTarget) -> Vec<String> {
        vec![
            self.webui.script_file.clone(),
            self.webui.test_case.clone(),
            "--browser".to_string(),
            format!("{}:{}", target.host, target.webui_port),
            "--machine".to_string(),
            format!("{}:{}", target.host, target.ssh_port),
        ]
    }

    fn execute(
        &mut self,
        acquired: &mut Acquired,
        target: &TestTarget,
    ) -> Result<CaseResult, WorkflowError> {
        self.check_cancel()?;
        self.enter(WorkflowPhase::Running);

        if self.ctx.dry_run {
            self.show(&format!(
                "Dry-run: {}, {}",
                self.webui.script_file, self.webui.test_case
            ));
            return Ok(CaseResult::complete(Outcome::Pass));
        }

        let ctx = Arc::clone(&self.ctx);
        let (Some(layout), Some(workdir)) = (acquired.layout.clone(), acquired.workdir.clone())
        else {
            return Err(SetupError::Io(std::io::Error::other("branch directory not prepared")).into());
        };

        self.show(&format!("Running test {}", self.webui.test_case));
        ctx.reporter
            .report(&self.case.id, CaseResult::progress(CaseState::Running));

        let argv = self.test_argv(target);
        tracing::info!(command = %argv.join(" "), "running test");
        let output = ctx.reporter.log_path(&self.case.id, TEST_OUTPUT_LOG)?;
        let test_dir = layout.webui_test_dir();

        // The web UI answers before the installer bus is available.
        thread::sleep(self.timeouts.settle_delay);

        let mut child = match ctx.mode {
            ExecutionMode::Container(ref container) => {
                let run = ContainerRun::new(layout.root(), argv)
                    .cwd(container_path(layout.root(), &workdir))
                    .env("WEBUI_TEST_DIR", container_path(layout.root(), &test_dir));
                container.spawn(&run, &output)?
            }
            ExecutionMode::Host => {
                let cmd = CommandSpec::from_argv(&argv)
                    .ok_or_else(|| SetupError::Io(std::io::Error::other("empty test command")))?
                    .cwd(&workdir)
                    .env("WEBUI_TEST_DIR", test_dir.display().to_string())
                    .log_to(&output);
                ctx.runner.spawn(&cmd)?
            }
        };

        let collector = ArtifactCollector::new(&workdir, &self.webui.test_case);
        let deadline = Deadline::start(self.timeouts.test);
        // Cancellation does not interrupt a running test, only the timeout does.
        let exit = loop {
            let wait = TEST_POLL_INTERVAL.min(deadline.remaining());
            if let Some(exit) = wait_timeout(child.as_mut(), wait)? {
                self.show("Test finished");
                break Some(exit);
            }
            if deadline.is_expired() {
                self.show("Test timeout");
                let stopped = self.timeouts.test_escalation().stop(child.as_mut(), "test")?;
                tracing::warn!(vm = %self.vm_name, outcome = ?stopped, "test did not finish in time");
                break None;
            }
            if let Err(e) = collector.collect_snapshots(ctx.reporter.as_ref(), &self.case.id) {
                tracing::warn!(error = %e, "failed to collect snapshots");
            }
        };

        let outcome = match exit {
            Some(exit) if exit.success() => Outcome::Pass,
            _ => Outcome::Fail,
        };
        Ok(CaseResult::complete(outcome))
    }

    fn teardown(&mut self, mut acquired: Acquired) {
        let ctx = Arc::clone(&self.ctx);
        self.enter(WorkflowPhase::Collecting);
        self.show("Teardown");

        if let Some(ref workdir) = acquired.workdir {
            let collector = ArtifactCollector::new(workdir, &self.webui.test_case);
            if let Err(e) = collector.collect_final(ctx.reporter.as_ref(), &self.case.id) {
                tracing::error!(error = %e, "failed to collect test logs");
            }
        }

        self.enter(WorkflowPhase::TearingDown);
        if let Some(ref hypervisor) = self.hypervisor {
            if let Some(mut installer) = acquired.installer.take() {
                if ctx.settings.webui.debug {
                    tracing::info!(vm = %self.vm_name, "debug mode, keeping VM");
                } else {
                    hypervisor.destroy(&self.vm_name);
                    match self
                        .timeouts
                        .installer_escalation()
                        .stop(installer.as_mut(), "virt-install")
                    {
                        Ok(outcome) if !outcome.exited_normally() => {
                            tracing::error!(vm = %self.vm_name, ?outcome, "virt-install did not end after VM destroy")
                        }
                        Ok(_) => {}
                        Err(e) => tracing::error!(error = %e, "failed to stop virt-install"),
                    }
                    if let Err(e) = hypervisor.undefine(&self.vm_name) {
                        tracing::error!(vm = %self.vm_name, error = %e, "failed to remove VM");
                    }
                }
            }
            if let Some(ref forwards) = acquired.forwards {
                hypervisor.release_forwarding(forwards);
            }
        }

        drop(acquired.permit.take());

        if acquired.layout.is_some() {
            // The image goes away under the setup lock so no joining
            // workflow can see it as present.
            let mut guard = ctx.registry.lock();
            let departure = guard.leave(&self.webui.branch, &self.vm_name);
            if departure.registry_empty {
                if let Some(container) = ctx.mode.container() {
                    container.remove_image();
                }
            }
            drop(guard);
        }
        self.enter(WorkflowPhase::Done);
    }
}

/// `virt-install` parameters of a web UI case.
pub fn install_spec(
    settings: &LaneSettings,
    source: Option<&InstallationSource>,
    arch: &str,
    webui: &WebUiCase,
    vm_name: &str,
) -> Result<InstallSpec, WorkflowError> {
    let source = source.ok_or(SetupError::NoInstallationSource)?;
    let location = install_location(source, arch)?;
    let cmdline = kernel_cmdline(
        source,
        arch,
        &webui.additional_repos,
        ExtraArgs {
            case: webui.kernel_cmdline.as_deref(),
            all: settings.cmdline_all(),
            arch: settings.cmdline_arch(arch),
        },
        BootOptions {
            inst_graphical: settings.webui.inst_graphical,
            serial_console: settings.webui.serial_console,
        },
    )?;

    let mut spec = InstallSpec::new(vm_name, location);
    spec.os_variant = settings.vm.os_variant.clone();
    spec.memory_mib = settings.vm.memory_mib;
    spec.vcpus = settings.vm.vcpus;
    spec.disk_gib = settings.vm.disk_gib;
    spec.serial_console = settings.webui.serial_console;
    spec.extra_args = cmdline;
    Ok(spec)
}
