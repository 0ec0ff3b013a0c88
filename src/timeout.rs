//! Workflow timeouts
//!
//! Every wait in a VM test workflow is bounded:
//! - network address: `address_attempts` queries every `address_interval`
//! - web UI startup: polled every `poll_interval` until `startup_timeout`
//! - test run: `test_timeout`, then the stop escalation
//! - installer exit after the VM was destroyed, then the stop escalation

use std::time::{Duration, Instant};

use vmlane_virt::{Escalation, PollPolicy};

use crate::config::LaneSettings;

const MINUTE: u64 = 60;

/// Resolved timeouts of a VM test workflow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkflowTimeouts {
    /// Maximum test run time
    pub test: Duration,

    /// Maximum time for the web UI to come up
    pub startup: Duration,

    /// Interval between web UI polls
    pub poll_interval: Duration,

    /// Pause between web UI readiness and test start
    pub settle_delay: Duration,

    /// Interval between network address queries
    pub address_interval: Duration,

    /// Number of network address queries
    pub address_attempts: u32,

    /// Time the installer gets to exit after the VM was destroyed
    pub installer_exit_grace: Duration,

    /// Time between SIGTERM and SIGKILL
    pub terminate_grace: Duration,

    /// Time to wait for exit after SIGKILL
    pub kill_grace: Duration,
}

impl Default for WorkflowTimeouts {
    fn default() -> Self {
        Self::from_settings(&LaneSettings::default())
    }
}

impl WorkflowTimeouts {
    pub fn from_settings(settings: &LaneSettings) -> Self {
        let webui = &settings.webui;
        let vm = &settings.vm;
        Self {
            test: Duration::from_secs(webui.test_timeout.saturating_mul(MINUTE)),
            startup: Duration::from_secs(webui.startup_timeout.saturating_mul(MINUTE)),
            poll_interval: Duration::from_secs(webui.poll_interval),
            settle_delay: Duration::from_secs(webui.settle_delay),
            address_interval: Duration::from_secs(vm.address_interval),
            address_attempts: vm.address_attempts,
            installer_exit_grace: Duration::from_secs(vm.installer_exit_grace),
            terminate_grace: Duration::from_secs(vm.terminate_grace),
            kill_grace: Duration::from_secs(vm.kill_grace),
        }
    }

    /// Override the startup timeout (in minutes) for one test case.
    pub fn with_startup_minutes(mut self, minutes: Option<u64>) -> Self {
        if let Some(m) = minutes {
            self.startup = Duration::from_secs(m.saturating_mul(MINUTE));
        }
        self
    }

    /// Check bounds.
    pub fn validate(&self) -> Result<(), TimeoutValidationError> {
        check_range("webui.test_timeout", self.test.as_secs() / MINUTE, 1, 24 * 60)?;
        check_range("webui.startup_timeout", self.startup.as_secs() / MINUTE, 1, 4 * 60)?;
        check_range("webui.poll_interval", self.poll_interval.as_secs(), 1, 300)?;
        check_range("webui.settle_delay", self.settle_delay.as_secs(), 0, 600)?;
        check_range("vm.address_interval", self.address_interval.as_secs(), 1, 300)?;
        check_range("vm.address_attempts", u64::from(self.address_attempts), 1, 10_000)?;
        check_range("vm.installer_exit_grace", self.installer_exit_grace.as_secs(), 0, 300)?;
        check_range("vm.terminate_grace", self.terminate_grace.as_secs(), 0, 300)?;
        check_range("vm.kill_grace", self.kill_grace.as_secs(), 0, 300)?;
        Ok(())
    }

    /// Polling policy for the VM network address.
    pub fn address_policy(&self) -> PollPolicy {
        PollPolicy::attempts(self.address_interval, self.address_attempts)
    }

    /// Polling policy for web UI readiness.
    pub fn startup_policy(&self) -> PollPolicy {
        PollPolicy::deadline(self.poll_interval, self.startup)
    }

    /// Stop sequence of a test process that ran out of time.
    pub fn test_escalation(&self) -> Escalation {
        Escalation::new(Duration::ZERO, self.terminate_grace, self.kill_grace)
    }

    /// Stop sequence of the installer once its VM was destroyed.
    pub fn installer_escalation(&self) -> Escalation {
        Escalation::new(
            self.installer_exit_grace,
            self.terminate_grace,
            self.kill_grace,
        )
    }
}

fn check_range(
    key: &'static str,
    value: u64,
    min: u64,
    max: u64,
) -> Result<(), TimeoutValidationError> {
    if value < min || value > max {
        return Err(TimeoutValidationError::OutOfBounds {
            key,
            value,
            min,
            max,
        });
    }
    Ok(())
}

/// Timeout validation errors
#[derive(Debug, thiserror::Error)]
pub enum TimeoutValidationError {
    #[error("{key} must be in [{min}, {max}], got {value}")]
    OutOfBounds {
        key: &'static str,
        value: u64,
        min: u64,
        max: u64,
    },
}

/// Wall-clock deadline of a running test
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    start: Instant,
    limit: Duration,
}

impl Deadline {
    /// Start counting now.
    pub fn start(limit: Duration) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Time left before the deadline
    pub fn remaining(&self) -> Duration {
        self.limit.saturating_sub(self.elapsed())
    }

    pub fn is_expired(&self) -> bool {
        self.elapsed() >= self.limit
    }
}
