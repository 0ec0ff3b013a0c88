//! Pipeline runs against mocked hypervisors, checkouts and runners.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;
use vmlane::config::LaneSettings;
use vmlane::mock::{MockPreparer, MockProbe};
use vmlane::pipeline::{Pipeline, RunOptions};
use vmlane::plan::Plan;
use vmlane::signal::CancelToken;
use vmlane::summary::ExitCode;
use vmlane::workflow::HypervisorPool;
use vmlane_results::{CaseResult, CaseState, Outcome};
use vmlane_virt::mock::{ChildBehavior, MockResponse, MockRunner};
use vmlane_virt::{CommandRunner, HypervisorClient};

const DOMIFADDR: &str = " vnet0      52:54:00:12:34:56    ipv4         192.168.122.42/24\n";

const KSTEST_OUTPUT: &str = "\
INFO: RESULT:lang:a3f1e2:SUCCESS:
INFO: RESULT:keyboard:b0c1:FAILED:Kickstart failed
INFO: RESULT:keyboard:b0c2:FAILED:Kickstart failed again
";

struct Lane {
    dir: TempDir,
    runner: Arc<MockRunner>,
}

impl Lane {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("tmp")).unwrap();
        fs::create_dir_all(dir.path().join("kickstart-tests")).unwrap();
        fs::write(dir.path().join("boot.iso"), "iso").unwrap();

        let runner = Arc::new(MockRunner::new());
        runner.respond(&["domifaddr"], MockResponse::ok(DOMIFADDR));
        Self { dir, runner }
    }

    fn out_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn plan(&self) -> Plan {
        let plan = format!(
            r#"
            [installation_source]
            base_repo_id = "BaseOS"
            [installation_source.repos.BaseOS.x86_64]
            os = "http://example.com/compose/x86_64/BaseOS/os"

            [boot_iso]
            x86_64 = "file://{iso}"

            [[case]]
            id = "navigation"
            workflow = "anaconda-webui"
            configuration = {{ architecture = "x86_64", branch = "main" }}
            automation = {{ script_file = "./check-navigation", test_case = "TestNavigation" }}

            [[case]]
            id = "lang"
            workflow = "kickstart-test"
            configuration = {{ architecture = "x86_64" }}
            automation = {{ test = "lang" }}

            [[case]]
            id = "keyboard"
            workflow = "kickstart-test"
            configuration = {{ architecture = "x86_64" }}
            automation = {{ test = "keyboard" }}
            "#,
            iso = self.dir.path().join("boot.iso").display()
        );
        Plan::from_toml(&plan).unwrap()
    }

    fn settings(&self) -> LaneSettings {
        let mut settings = LaneSettings::default();
        settings.webui.use_container = false;
        settings.webui.temp_base = self.dir.path().join("tmp");
        settings.webui.settle_delay = 0;
        settings.vm.address_interval = 1;
        settings.vm.installer_exit_grace = 0;
        settings.kickstart.local_repo = Some(self.dir.path().join("kickstart-tests"));
        settings
    }

    fn pipeline(&self, dry_run: bool, cancel: CancelToken) -> Pipeline {
        let runner: Arc<dyn CommandRunner> = self.runner.clone();
        let mut hypervisors = HypervisorPool::default();
        hypervisors.insert(
            "x86_64",
            HypervisorClient::connect("localhost", Arc::clone(&runner)).unwrap(),
        );
        let options = RunOptions {
            out_dir: self.out_dir(),
            dry_run,
        };
        Pipeline::new(self.settings(), self.plan(), options, cancel)
            .with_runner(runner)
            .with_preparer(Arc::new(MockPreparer::new()))
            .with_probe(Arc::new(MockProbe::ready()))
            .with_hypervisors(hypervisors)
    }

    fn results(&self) -> serde_json::Value {
        let text = fs::read_to_string(self.out_dir().join("results.json")).unwrap();
        serde_json::from_str(&text).unwrap()
    }

    fn record(&self, case_id: &str) -> serde_json::Value {
        self.results()
            .as_array()
            .unwrap()
            .iter()
            .find(|r| r["case_id"] == case_id)
            .cloned()
            .unwrap_or_else(|| panic!("no record for {}", case_id))
    }
}

#[test]
fn test_full_run_reports_every_case() {
    let lane = Lane::new();
    lane.runner.on_spawn_with_output(
        &["containers/runner/launch"],
        ChildBehavior::Immediately(1),
        KSTEST_OUTPUT,
    );

    let outcome = lane.pipeline(false, CancelToken::new()).run().unwrap();

    assert_eq!(outcome.summary.cases, 3);
    assert_eq!(outcome.summary.passed, 2);
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(outcome.summary.exit_code_enum(), ExitCode::TestFailures);
    assert!(outcome.summary_path.exists());

    let navigation: CaseResult = serde_json::from_value(lane.record("navigation")["result"].clone()).unwrap();
    assert_eq!(navigation, CaseResult::complete(Outcome::Pass));
    let keyboard: CaseResult = serde_json::from_value(lane.record("keyboard")["result"].clone()).unwrap();
    assert_eq!(keyboard, CaseResult::complete(Outcome::Fail));

    assert_eq!(lane.runner.count(&["virt-install"]), 1);
    assert_eq!(lane.runner.count(&["./check-navigation"]), 1);
    assert_eq!(lane.runner.count(&["destroy"]), 1);
    assert_eq!(lane.runner.count(&["undefine"]), 1);

    let launch = &lane.runner.calls_matching(&["containers/runner/launch"])[0];
    assert_eq!(
        launch.argv(),
        vec!["containers/runner/launch", "--retry", "keyboard", "lang"]
    );
    assert!(!lane
        .dir
        .path()
        .join("kickstart-tests/data/images/boot.iso")
        .exists());

    let summary: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(&outcome.summary_path).unwrap()).unwrap();
    assert_eq!(summary["exit_code"], 1);
    assert_eq!(summary["passed"], 2);
}

#[test]
fn test_dry_run_starts_nothing() {
    let lane = Lane::new();

    let outcome = lane.pipeline(true, CancelToken::new()).run().unwrap();

    assert_eq!(outcome.summary.passed, 3);
    assert_eq!(outcome.summary.exit_code_enum(), ExitCode::Success);
    assert_eq!(lane.runner.count(&["virt-install"]), 0);
    assert_eq!(lane.runner.count(&["./check-navigation"]), 0);

    let echo = &lane.runner.calls_matching(&["echo"])[0];
    assert_eq!(echo.argv()[1], "containers/runner/launch");
}

#[test]
fn test_cancelled_run_exits_cancelled() {
    let lane = Lane::new();
    let cancel = CancelToken::new();
    cancel.cancel();

    let outcome = lane.pipeline(false, cancel).run().unwrap();

    assert_eq!(outcome.summary.canceled, 3);
    assert_eq!(outcome.summary.exit_code_enum(), ExitCode::Cancelled);
    assert_eq!(outcome.summary.exit_code, 80);
    assert_eq!(lane.runner.count(&["virt-install"]), 0);

    let navigation: CaseResult = serde_json::from_value(lane.record("navigation")["result"].clone()).unwrap();
    assert_eq!(navigation.state, Some(CaseState::Canceled));
}
