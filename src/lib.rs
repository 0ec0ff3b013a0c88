//! vmlane - VM orchestration lane for installer tests
//!
//! Runs installer web UI tests, each in a freshly provisioned libvirt VM, and
//! batches of kickstart tests through the kickstart-tests runner. Results of
//! every case go to a [`report::Reporter`]; the [`pipeline`] ties the
//! workflows to a plan file and writes `results.json`.

pub mod config;
pub mod kstest;
pub mod logging;
pub mod mock;
pub mod pipeline;
pub mod plan;
pub mod report;
pub mod signal;
pub mod source;
pub mod summary;
pub mod timeout;
pub mod workflow;

pub use config::{LaneSettings, LoadedSettings};
pub use kstest::KickstartBatchWorkflow;
pub use pipeline::{Pipeline, PipelineError, RunOptions, RunOutcome};
pub use plan::{CaseRunConfiguration, Plan, WorkflowKind};
pub use report::{Reporter, RunReport};
pub use signal::CancelToken;
pub use summary::{ExitCode, RunSummary};
pub use workflow::{VmTestWorkflow, WorkflowError};
