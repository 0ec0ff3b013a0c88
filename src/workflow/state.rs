//! VM test workflow phases
//!
//! CREATED → WAITING_SETUP_LOCK → SETTING_UP → WAITING_VM_SLOT →
//! PROVISIONING_VM → WAITING_NETWORK → WAITING_SERVICE → READY → RUNNING →
//! COLLECTING → TEARING_DOWN → DONE, with CANCELED reachable from every
//! phase up to RUNNING. Failures jump straight to COLLECTING or TEARING_DOWN.

use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowPhase {
    Created,
    WaitingSetupLock,
    SettingUp,
    WaitingVmSlot,
    ProvisioningVm,
    WaitingNetwork,
    WaitingService,
    Ready,
    Running,
    Collecting,
    TearingDown,
    Done,
    Canceled,
}

impl WorkflowPhase {
    /// Phase following this one on the success path
    pub fn next(&self) -> Option<WorkflowPhase> {
        use WorkflowPhase::*;
        Some(match self {
            Created => WaitingSetupLock,
            WaitingSetupLock => SettingUp,
            SettingUp => WaitingVmSlot,
            WaitingVmSlot => ProvisioningVm,
            ProvisioningVm => WaitingNetwork,
            WaitingNetwork => WaitingService,
            WaitingService => Ready,
            Ready => Running,
            Running => Collecting,
            Collecting => TearingDown,
            TearingDown => Done,
            Done | Canceled => return None,
        })
    }

    /// Phases in which the workflow may still be cancelled
    pub fn is_cancellable(&self) -> bool {
        *self <= WorkflowPhase::Running
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowPhase::Done | WorkflowPhase::Canceled)
    }

    pub fn can_transition_to(&self, target: WorkflowPhase) -> bool {
        if self.next() == Some(target) {
            return true;
        }
        match target {
            WorkflowPhase::Canceled => self.is_cancellable(),
            // Failure paths
            WorkflowPhase::Collecting => {
                *self >= WorkflowPhase::SettingUp && *self < WorkflowPhase::Collecting
            }
            WorkflowPhase::TearingDown => *self < WorkflowPhase::Collecting,
            _ => false,
        }
    }
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            WorkflowPhase::Created => "created",
            WorkflowPhase::WaitingSetupLock => "waiting for setup lock",
            WorkflowPhase::SettingUp => "running setup",
            WorkflowPhase::WaitingVmSlot => "waiting for VM slot",
            WorkflowPhase::ProvisioningVm => "starting VM",
            WorkflowPhase::WaitingNetwork => "waiting for IP",
            WorkflowPhase::WaitingService => "waiting for web UI",
            WorkflowPhase::Ready => "ready",
            WorkflowPhase::Running => "running test",
            WorkflowPhase::Collecting => "collecting logs",
            WorkflowPhase::TearingDown => "teardown",
            WorkflowPhase::Done => "done",
            WorkflowPhase::Canceled => "canceled",
        };
        f.write_str(s)
    }
}

/// Invalid phase change
#[derive(Debug, thiserror::Error)]
#[error("invalid phase transition from {from:?} to {to:?}")]
pub struct PhaseError {
    pub from: WorkflowPhase,
    pub to: WorkflowPhase,
}

/// Current phase of one workflow
#[derive(Debug, Clone)]
pub struct PhaseTracker {
    phase: WorkflowPhase,
    history: Vec<WorkflowPhase>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self {
            phase: WorkflowPhase::Created,
            history: vec![WorkflowPhase::Created],
        }
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> WorkflowPhase {
        self.phase
    }

    /// Every phase entered so far, in order
    pub fn history(&self) -> &[WorkflowPhase] {
        &self.history
    }

    pub fn transition(&mut self, to: WorkflowPhase) -> Result<(), PhaseError> {
        if !self.phase.can_transition_to(to) {
            return Err(PhaseError {
                from: self.phase,
                to,
            });
        }
        self.phase = to;
        self.history.push(to);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_path() {
        let mut tracker = PhaseTracker::new();
        let mut phase = WorkflowPhase::Created;
        while let Some(next) = phase.next() {
            tracker.transition(next).unwrap();
            phase = next;
        }
        assert_eq!(tracker.phase(), WorkflowPhase::Done);
        assert_eq!(tracker.history().len(), 12);
        assert!(tracker.phase().is_terminal());
    }

    #[test]
    fn test_cancel_until_running() {
        assert!(WorkflowPhase::WaitingVmSlot.can_transition_to(WorkflowPhase::Canceled));
        assert!(WorkflowPhase::Running.can_transition_to(WorkflowPhase::Canceled));
        assert!(!WorkflowPhase::Collecting.can_transition_to(WorkflowPhase::Canceled));
        assert!(!WorkflowPhase::Canceled.can_transition_to(WorkflowPhase::TearingDown));
    }

    #[test]
    fn test_failure_paths() {
        assert!(WorkflowPhase::WaitingNetwork.can_transition_to(WorkflowPhase::Collecting));
        assert!(WorkflowPhase::Created.can_transition_to(WorkflowPhase::TearingDown));
        assert!(!WorkflowPhase::Created.can_transition_to(WorkflowPhase::Collecting));
        assert!(!WorkflowPhase::Done.can_transition_to(WorkflowPhase::TearingDown));
    }

    #[test]
    fn test_invalid_transition() {
        let mut tracker = PhaseTracker::new();
        let err = tracker.transition(WorkflowPhase::Running).unwrap_err();
        assert_eq!(err.from, WorkflowPhase::Created);
        assert_eq!(tracker.phase(), WorkflowPhase::Created);
    }
}
