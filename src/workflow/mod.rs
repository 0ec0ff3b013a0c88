//! Installer web UI test workflow
//!
//! One [`VmTestWorkflow`] runs per test case. Workflows share a
//! [`WebUiContext`]: the setup lock with its per-branch registry, the VM slot
//! semaphore, one hypervisor client per architecture and the execution mode.

mod artifacts;
mod cmdline;
mod error;
mod readiness;
mod registry;
mod setup;
mod slots;
mod state;
mod webui;

pub use artifacts::ArtifactCollector;
pub use cmdline::{install_location, kernel_cmdline, BootOptions, ExtraArgs};
pub use error::{SetupError, WorkflowError};
pub use readiness::{wait_for_service, HttpProbe, ProbeError, ServiceProbe};
pub use registry::{BranchMembership, Departure, SetupGuard, SetupRegistry, BRANCH_DIR_PREFIX};
pub use setup::{
    copy_tree, ensure_test_repo, node_package_specs, prepare_branch, BranchLayout, BranchSources,
    CommandPreparer, SourcePreparer, NODE_PACKAGES,
};
pub use slots::{SlotPermit, VmSlots};
pub use state::{PhaseError, PhaseTracker, WorkflowPhase};
pub use webui::{install_spec, TestTarget, VmTestWorkflow, WebUiContext};

use std::collections::BTreeMap;
use std::sync::Arc;

use vmlane_virt::{CommandRunner, ExecutionContainer, HypervisorClient, VirtResult};

use crate::config::LaneSettings;

/// Host name under which a container reaches ports forwarded to its host
pub const CONTAINER_HOST_ALIAS: &str = "host.containers.internal";

/// Where test tooling runs
#[derive(Clone)]
pub enum ExecutionMode {
    /// Directly on this machine
    Host,
    /// Inside the execution container
    Container(Arc<ExecutionContainer>),
}

impl ExecutionMode {
    pub fn from_settings(settings: &LaneSettings, runner: Arc<dyn CommandRunner>) -> Self {
        if settings.webui.use_container {
            ExecutionMode::Container(Arc::new(ExecutionContainer::new(
                &settings.webui.image,
                &settings.webui.containerfile,
                runner,
            )))
        } else {
            ExecutionMode::Host
        }
    }

    pub fn container(&self) -> Option<&Arc<ExecutionContainer>> {
        match self {
            ExecutionMode::Host => None,
            ExecutionMode::Container(c) => Some(c),
        }
    }

    /// Host name of this machine as seen by the test tooling
    pub fn local_host(&self) -> &'static str {
        match self {
            ExecutionMode::Host => "localhost",
            ExecutionMode::Container(_) => CONTAINER_HOST_ALIAS,
        }
    }
}

/// Hypervisor clients by architecture
#[derive(Default)]
pub struct HypervisorPool {
    clients: BTreeMap<String, Arc<HypervisorClient>>,
}

impl HypervisorPool {
    /// One client per configured architecture.
    pub fn from_settings(settings: &LaneSettings, runner: Arc<dyn CommandRunner>) -> VirtResult<Self> {
        let mut clients = BTreeMap::new();
        for (arch, host) in &settings.hypervisors {
            let client = HypervisorClient::connect(host.clone(), Arc::clone(&runner))?;
            tracing::debug!(arch = %arch, host = %host, uri = client.uri(), "hypervisor configured");
            clients.insert(arch.clone(), Arc::new(client));
        }
        Ok(Self { clients })
    }

    pub fn insert(&mut self, arch: impl Into<String>, client: HypervisorClient) {
        self.clients.insert(arch.into(), Arc::new(client));
    }

    pub fn get(&self, arch: &str) -> Option<Arc<HypervisorClient>> {
        self.clients.get(arch).cloned()
    }

    /// Close remote control channels.
    pub fn shutdown(&self) {
        for client in self.clients.values() {
            client.shutdown();
        }
    }
}

/// Stops a running workflow from outside on cancellation
#[derive(Clone)]
pub enum Terminator {
    /// Destroy the workflow's VM
    Vm {
        hypervisor: Arc<HypervisorClient>,
        vm_name: String,
    },
    /// The workflow cannot be interrupted
    Refuse { what: String },
    /// Nothing to stop
    Noop,
}

impl Terminator {
    pub fn terminate(&self) {
        match self {
            Terminator::Vm {
                hypervisor,
                vm_name,
            } => {
                tracing::info!(vm = %vm_name, "terminating workflow");
                hypervisor.destroy(vm_name);
            }
            Terminator::Refuse { what } => {
                tracing::warn!(workflow = %what, "termination not supported, waiting for it to finish");
            }
            Terminator::Noop => {}
        }
    }
}
