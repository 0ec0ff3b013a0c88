//! vmlane CLI
//!
//! Entry point for the `vmlane` command-line tool.

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

use vmlane::config::{default_settings_path, LoadedSettings};
use vmlane::logging;
use vmlane::pipeline::{explain_case, Pipeline, RunOptions};
use vmlane::plan::Plan;
use vmlane::signal::{CancelToken, SignalHandler};
use vmlane::summary::ExitCode;
use vmlane_results::BatchResults;

#[derive(Parser)]
#[command(name = "vmlane")]
#[command(about = "VM orchestration lane for installer web UI and kickstart tests", version)]
struct Cli {
    /// Debug logging (overridden by VMLANE_LOG)
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SettingsArgs {
    /// Settings file (default: ~/.config/vmlane/settings.toml)
    #[arg(long, short = 's')]
    settings: Option<PathBuf>,

    /// Override a setting, e.g. --set vm.limit=2
    #[arg(long = "set", value_name = "KEY=VALUE")]
    overrides: Vec<String>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run every case of a plan
    Run {
        /// Plan file
        plan: PathBuf,

        /// Output directory for logs and results
        #[arg(long, short = 'o', default_value = "vmlane-results")]
        out: PathBuf,

        /// Show what would run without starting VMs or tests
        #[arg(long)]
        dry_run: bool,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Print the virt-install command of a web UI case
    Explain {
        /// Plan file
        plan: PathBuf,

        /// Case id
        case: String,

        #[command(flatten)]
        settings: SettingsArgs,
    },

    /// Load and validate the configuration
    Verify {
        #[command(flatten)]
        settings: SettingsArgs,

        /// Print the merged settings as JSON
        #[arg(long)]
        json: bool,
    },

    /// Replay a kickstart runner log through the result aggregator
    ParseResults {
        /// Runner output log
        log: PathBuf,

        /// Expected test names
        #[arg(long = "test", required = true)]
        tests: Vec<String>,

        /// The runner did not retry failed tests
        #[arg(long)]
        no_retry: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    let code = match cli.command {
        Commands::Run {
            plan,
            out,
            dry_run,
            settings,
        } => run_plan(&plan, out, dry_run, &settings),
        Commands::Explain {
            plan,
            case,
            settings,
        } => run_explain(&plan, &case, &settings),
        Commands::Verify { settings, json } => run_verify(&settings, json),
        Commands::ParseResults {
            log,
            tests,
            no_retry,
        } => run_parse_results(&log, tests, !no_retry),
    };
    process::exit(code.as_i32());
}

fn load_settings(args: &SettingsArgs) -> Result<LoadedSettings, ExitCode> {
    let (path, required) = match args.settings {
        Some(ref path) => (Some(path.clone()), true),
        None => (default_settings_path(), false),
    };
    LoadedSettings::load(path.as_deref(), required, &args.overrides).map_err(|e| {
        eprintln!("Configuration error: {}", e);
        ExitCode::Usage
    })
}

fn load_plan(path: &Path) -> Result<Plan, ExitCode> {
    Plan::load(path).map_err(|e| {
        eprintln!("Plan error: {}", e);
        ExitCode::Usage
    })
}

fn run_plan(plan_path: &Path, out: PathBuf, dry_run: bool, args: &SettingsArgs) -> ExitCode {
    let (loaded, plan) = match (load_settings(args), load_plan(plan_path)) {
        (Ok(loaded), Ok(plan)) => (loaded, plan),
        (Err(code), _) | (_, Err(code)) => return code,
    };

    let cancel = CancelToken::new();
    let handler = SignalHandler::new(cancel.clone());
    if let Err(e) = handler.install() {
        tracing::warn!(error = %e, "failed to install signal handler");
    }

    let options = RunOptions {
        out_dir: out,
        dry_run,
    };
    match Pipeline::new(loaded.settings, plan, options, cancel).run() {
        Ok(outcome) => {
            println!("{}", outcome.summary);
            println!("Results: {}", outcome.results_path.display());
            outcome.summary.exit_code_enum()
        }
        Err(e) => {
            eprintln!("Run failed: {}", e);
            ExitCode::Usage
        }
    }
}

fn run_explain(plan_path: &Path, case: &str, args: &SettingsArgs) -> ExitCode {
    let (loaded, plan) = match (load_settings(args), load_plan(plan_path)) {
        (Ok(loaded), Ok(plan)) => (loaded, plan),
        (Err(code), _) | (_, Err(code)) => return code,
    };
    match explain_case(&loaded.settings, &plan, case) {
        Ok(command) => {
            println!("{}", command.display());
            ExitCode::Success
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            ExitCode::Usage
        }
    }
}

fn run_verify(args: &SettingsArgs, json: bool) -> ExitCode {
    let loaded = match load_settings(args) {
        Ok(loaded) => loaded,
        Err(code) => return code,
    };

    if json {
        match serde_json::to_string_pretty(&loaded.merged) {
            Ok(text) => println!("{}", text),
            Err(e) => {
                eprintln!("Error serializing settings: {}", e);
                return ExitCode::Usage;
            }
        }
        return ExitCode::Success;
    }

    println!("Configuration valid");
    println!();
    for source in &loaded.sources {
        match source.path {
            Some(ref path) => println!("  Layer: {:?} {}", source.origin, path.display()),
            None => println!("  Layer: {:?}", source.origin),
        }
    }
    let settings = &loaded.settings;
    println!("  VM limit: {}", settings.vm.limit);
    for (arch, host) in &settings.hypervisors {
        println!("  Hypervisor {}: {}", arch, host);
    }
    println!(
        "  Test execution: {}",
        if settings.webui.use_container {
            "container"
        } else {
            "host"
        }
    );
    ExitCode::Success
}

fn run_parse_results(log: &Path, tests: Vec<String>, retry: bool) -> ExitCode {
    let contents = match fs::read_to_string(log) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error reading {}: {}", log.display(), e);
            return ExitCode::Usage;
        }
    };

    let mut results = BatchResults::new(tests, retry);
    for line in contents.lines() {
        results.process_line(line);
    }

    let tests: Vec<String> = results.tests().map(str::to_string).collect();
    for test in &tests {
        let result = results.aggregate(test);
        let state = result
            .state
            .map_or_else(|| "not started".to_string(), |s| s.to_string());
        let outcome = result.outcome.map(|o| o.to_string()).unwrap_or_default();
        println!("{}: {} {} {}", test, state, outcome, results.status_line(test));
    }
    let summary = results.summary();
    println!("{}", summary);

    if summary.failed > 0 || !summary.is_complete() {
        ExitCode::TestFailures
    } else {
        ExitCode::Success
    }
}
