use std::io;
use std::time::Duration;

use vmlane_virt::VirtError;

use crate::plan::PlanError;

/// Reasons a VM test could not be set up
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("no hypervisor for {0} in settings")]
    NoHypervisor(String),

    #[error("plan has no installation source")]
    NoInstallationSource,

    #[error("installation source has no {arch} tree for repository {repo}")]
    NoInstallTree { repo: String, arch: String },

    #[error("unknown test repository {0}")]
    UnknownTestRepo(String),

    #[error("failed to clone {repo}: {reason}")]
    Clone { repo: String, reason: String },

    #[error("failed to fetch test dependencies: {0}")]
    Dependencies(String),

    #[error("container image unavailable: {0}")]
    Container(String),

    #[error("VM {vm} got no network address after {attempts} attempts")]
    AddressTimeout { vm: String, attempts: u32 },

    #[error("web UI at {url} not accessible after {waited:?}")]
    ServiceTimeout { url: String, waited: Duration },

    #[error("web UI at {url} failed: {reason}")]
    Service { url: String, reason: String },

    #[error(transparent)]
    Virt(VirtError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Errors ending a workflow early
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error(transparent)]
    Setup(#[from] SetupError),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("cancelled")]
    Cancelled,
}

impl From<VirtError> for WorkflowError {
    fn from(e: VirtError) -> Self {
        match e {
            VirtError::Cancelled => WorkflowError::Cancelled,
            VirtError::NoAddress { vm, attempts } => {
                WorkflowError::Setup(SetupError::AddressTimeout { vm, attempts })
            }
            other => WorkflowError::Setup(SetupError::Virt(other)),
        }
    }
}

impl From<io::Error> for WorkflowError {
    fn from(e: io::Error) -> Self {
        WorkflowError::Setup(SetupError::Io(e))
    }
}

impl WorkflowError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, WorkflowError::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virt_error_mapping() {
        assert!(WorkflowError::from(VirtError::Cancelled).is_cancelled());

        let err = WorkflowError::from(VirtError::NoAddress {
            vm: "vm1".to_string(),
            attempts: 30,
        });
        assert!(matches!(
            err,
            WorkflowError::Setup(SetupError::AddressTimeout { attempts: 30, .. })
        ));
        assert_eq!(err.to_string(), "VM vm1 got no network address after 30 attempts");
    }
}
