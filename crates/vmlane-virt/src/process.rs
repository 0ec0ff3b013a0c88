//! Background process handles and the escalating stop sequence.
//!
//! Both the installer (`virt-install`) and the test script are long running
//! children that must be stopped within bounded time. [`Escalation`] waits for
//! a child to exit, then sends SIGTERM, then SIGKILL, with a grace period
//! after every step.

use std::io::{self, Read};
use std::process::Child;
use std::thread;
use std::time::{Duration, Instant};

/// How often a waiting loop checks the child.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Exit status of a finished child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildExit {
    /// Exit code, `None` if the child was terminated by a signal
    pub code: Option<i32>,
    /// Terminating signal number, if any
    pub signal: Option<i32>,
}

impl ChildExit {
    pub fn code(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl From<std::process::ExitStatus> for ChildExit {
    fn from(status: std::process::ExitStatus) -> Self {
        #[cfg(unix)]
        let signal = {
            use std::os::unix::process::ExitStatusExt;
            status.signal()
        };
        #[cfg(not(unix))]
        let signal = None;

        Self {
            code: status.code(),
            signal,
        }
    }
}

/// A running background process.
pub trait ManagedChild: Send {
    /// Process id.
    fn id(&self) -> u32;

    /// Check whether the process exited, without blocking.
    fn try_wait(&mut self) -> io::Result<Option<ChildExit>>;

    /// Ask the process to stop (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;

    /// Stop the process forcefully (SIGKILL).
    fn kill(&mut self) -> io::Result<()>;

    /// Take the stdout pipe of a piped child.
    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>>;

    /// Take the stderr pipe of a piped child.
    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>>;
}

/// [`ManagedChild`] backed by a real OS process.
pub struct SystemChild {
    child: Child,
}

impl SystemChild {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

impl ManagedChild for SystemChild {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<Option<ChildExit>> {
        Ok(self.child.try_wait()?.map(ChildExit::from))
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            signal_pid(self.child.id(), nix::sys::signal::Signal::SIGTERM)
        }
        #[cfg(not(unix))]
        {
            self.child.kill()
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn take_stdout(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stdout
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }

    fn take_stderr(&mut self) -> Option<Box<dyn Read + Send>> {
        self.child
            .stderr
            .take()
            .map(|s| Box::new(s) as Box<dyn Read + Send>)
    }
}

/// Send a signal to a process id.
#[cfg(unix)]
pub fn signal_pid(pid: u32, signal: nix::sys::signal::Signal) -> io::Result<()> {
    use nix::unistd::Pid;

    let raw = i32::try_from(pid).map_err(|_| io::Error::other("pid out of range"))?;
    nix::sys::signal::kill(Pid::from_raw(raw), signal).map_err(io::Error::from)
}

/// Wait up to `timeout` for the child to exit.
///
/// Returns `Ok(None)` if it is still running afterwards.
pub fn wait_timeout(child: &mut dyn ManagedChild, timeout: Duration) -> io::Result<Option<ChildExit>> {
    let start = Instant::now();
    loop {
        if let Some(exit) = child.try_wait()? {
            return Ok(Some(exit));
        }
        if start.elapsed() >= timeout {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL.min(timeout.saturating_sub(start.elapsed())));
    }
}

/// How a stop sequence ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Exited on its own within the initial grace period.
    Exited(ChildExit),
    /// Exited after SIGTERM.
    Terminated(ChildExit),
    /// Exited after SIGKILL.
    Killed(ChildExit),
    /// Still running after SIGKILL and its grace period.
    Unresponsive,
}

impl StopOutcome {
    /// Exit status of the child, if it exited.
    pub fn exit(&self) -> Option<ChildExit> {
        match *self {
            StopOutcome::Exited(e) | StopOutcome::Terminated(e) | StopOutcome::Killed(e) => Some(e),
            StopOutcome::Unresponsive => None,
        }
    }

    /// Whether the child exited by itself.
    pub fn exited_normally(&self) -> bool {
        matches!(self, StopOutcome::Exited(_))
    }
}

/// Grace periods of the wait, terminate, kill sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Escalation {
    /// Time the child gets to exit on its own.
    pub initial_grace: Duration,
    /// Time between SIGTERM and SIGKILL.
    pub terminate_grace: Duration,
    /// Time to wait for exit after SIGKILL.
    pub kill_grace: Duration,
}

impl Escalation {
    pub fn new(initial_grace: Duration, terminate_grace: Duration, kill_grace: Duration) -> Self {
        Self {
            initial_grace,
            terminate_grace,
            kill_grace,
        }
    }

    /// Stop `child`, escalating as needed. `what` names it in log messages.
    pub fn stop(&self, child: &mut dyn ManagedChild, what: &str) -> io::Result<StopOutcome> {
        if let Some(exit) = wait_timeout(child, self.initial_grace)? {
            tracing::debug!(process = what, ?exit, "process exited");
            return Ok(StopOutcome::Exited(exit));
        }

        tracing::info!(process = what, pid = child.id(), "terminating process");
        if let Err(e) = child.terminate() {
            tracing::warn!(process = what, error = %e, "failed to send SIGTERM");
        }
        if let Some(exit) = wait_timeout(child, self.terminate_grace)? {
            tracing::info!(process = what, ?exit, "process terminated");
            return Ok(StopOutcome::Terminated(exit));
        }

        tracing::warn!(process = what, pid = child.id(), "process ignored SIGTERM, killing");
        if let Err(e) = child.kill() {
            tracing::warn!(process = what, error = %e, "failed to send SIGKILL");
        }
        if let Some(exit) = wait_timeout(child, self.kill_grace)? {
            tracing::warn!(process = what, ?exit, "process killed");
            return Ok(StopOutcome::Killed(exit));
        }

        tracing::error!(process = what, pid = child.id(), "process did not exit after SIGKILL");
        Ok(StopOutcome::Unresponsive)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{ChildBehavior, MockChild};

    fn quick() -> Escalation {
        Escalation::new(
            Duration::from_millis(50),
            Duration::from_millis(50),
            Duration::from_millis(50),
        )
    }

    #[test]
    fn test_exits_within_initial_grace() {
        let (mut child, handle) = MockChild::new(ChildBehavior::Immediately(0));
        let outcome = quick().stop(&mut child, "test").unwrap();
        assert_eq!(outcome, StopOutcome::Exited(ChildExit::code(0)));
        assert!(outcome.exited_normally());
        assert!(!handle.terminated());
        assert!(!handle.killed());
    }

    #[test]
    fn test_terminated_after_sigterm() {
        let (mut child, handle) = MockChild::new(ChildBehavior::OnTerminate);
        let outcome = quick().stop(&mut child, "test").unwrap();
        assert!(matches!(outcome, StopOutcome::Terminated(_)));
        assert!(handle.terminated());
        assert!(!handle.killed());
    }

    #[test]
    fn test_killed_when_sigterm_ignored() {
        let (mut child, handle) = MockChild::new(ChildBehavior::OnKill);
        let outcome = quick().stop(&mut child, "test").unwrap();
        assert!(matches!(outcome, StopOutcome::Killed(_)));
        assert!(handle.terminated());
        assert!(handle.killed());
        assert_eq!(outcome.exit().unwrap().signal, Some(9));
    }

    #[test]
    fn test_unresponsive() {
        let (mut child, _handle) = MockChild::new(ChildBehavior::Never);
        let outcome = quick().stop(&mut child, "test").unwrap();
        assert_eq!(outcome, StopOutcome::Unresponsive);
        assert!(outcome.exit().is_none());
    }

    #[test]
    fn test_wait_timeout_zero_checks_once() {
        let (mut child, _) = MockChild::new(ChildBehavior::Immediately(4));
        let exit = wait_timeout(&mut child, Duration::ZERO).unwrap();
        assert_eq!(exit, Some(ChildExit::code(4)));
    }

    #[cfg(unix)]
    #[test]
    fn test_real_process_terminated() {
        use crate::command::{CommandRunner, CommandSpec, SystemRunner};

        let mut child = SystemRunner
            .spawn(&CommandSpec::new("sleep").arg("30"))
            .unwrap();
        let escalation = Escalation::new(
            Duration::ZERO,
            Duration::from_secs(10),
            Duration::from_secs(1),
        );
        let outcome = escalation.stop(child.as_mut(), "sleep").unwrap();
        match outcome {
            StopOutcome::Terminated(exit) => assert_eq!(exit.signal, Some(15)),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }
}
