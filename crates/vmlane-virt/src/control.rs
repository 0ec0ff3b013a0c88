//! Persistent SSH control connection to a remote hypervisor host.
//!
//! One control master per host multiplexes every `ssh` invocation and carries
//! dynamic local-to-remote port forwards, so a VM on a remote libvirt host can
//! be reached through a port on this machine.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use rand::Rng;
use regex_lite::Regex;
use tempfile::TempDir;

use crate::command::{CommandRunner, CommandSpec};
use crate::error::{VirtError, VirtResult};

/// First port of the dynamic (ephemeral) range.
pub const PORT_RANGE_START: u16 = 49152;
/// Last port of the dynamic range.
pub const PORT_RANGE_END: u16 = 65535;

/// Default number of local port candidates tried per forward.
pub const DEFAULT_FORWARD_ATTEMPTS: u32 = 100;

/// Supplier of local port candidates.
pub trait PortSource: Send {
    fn next_port(&mut self) -> u16;
}

/// Uniformly random ports from the dynamic range.
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomPorts;

impl PortSource for RandomPorts {
    fn next_port(&mut self) -> u16 {
        rand::thread_rng().gen_range(PORT_RANGE_START..=PORT_RANGE_END)
    }
}

/// An established local port forward.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Forward {
    pub local_port: u16,
    pub target_ip: String,
    pub target_port: u16,
}

impl Forward {
    /// `-L` argument describing this forward.
    pub fn spec(&self) -> String {
        forward_spec(self.local_port, &self.target_ip, self.target_port)
    }
}

fn forward_spec(local: u16, ip: &str, port: u16) -> String {
    format!("*:{}:{}:{}", local, ip, port)
}

#[derive(Debug, Default)]
struct ChannelState {
    open: bool,
    closed: bool,
    master_pid: Option<u32>,
    leased: HashSet<u16>,
}

/// SSH control master connection to one host.
pub struct ControlChannel {
    host: String,
    socket_path: PathBuf,
    _socket_dir: TempDir,
    runner: Arc<dyn CommandRunner>,
    ports: Mutex<Box<dyn PortSource>>,
    max_attempts: u32,
    state: Mutex<ChannelState>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl ControlChannel {
    /// Prepare a channel to `host`. Nothing is started until [`open`](Self::open).
    pub fn new(host: impl Into<String>, runner: Arc<dyn CommandRunner>) -> VirtResult<Self> {
        let socket_dir = tempfile::Builder::new().prefix("vmlane_sshctl.").tempdir()?;
        let socket_path = socket_dir.path().join("control");
        Ok(Self {
            host: host.into(),
            socket_path,
            _socket_dir: socket_dir,
            runner,
            ports: Mutex::new(Box::new(RandomPorts)),
            max_attempts: DEFAULT_FORWARD_ATTEMPTS,
            state: Mutex::new(ChannelState::default()),
        })
    }

    /// Use a different source of local port candidates.
    pub fn with_port_source(mut self, ports: impl PortSource + 'static) -> Self {
        self.ports = Mutex::new(Box::new(ports));
        self
    }

    /// Limit the number of candidates tried per forward.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    /// Process id of the control master, once known.
    pub fn master_pid(&self) -> Option<u32> {
        lock(&self.state).master_pid
    }

    pub fn is_open(&self) -> bool {
        lock(&self.state).open
    }

    fn ssh(&self) -> CommandSpec {
        CommandSpec::new("ssh")
            .arg("-S")
            .arg(self.socket_path.display().to_string())
    }

    fn control(&self, op: &str) -> CommandSpec {
        self.ssh().args(["-O", op])
    }

    fn channel_error(&self, reason: impl Into<String>) -> VirtError {
        VirtError::Channel {
            host: self.host.clone(),
            reason: reason.into(),
        }
    }

    /// Start the control master. Opening an open channel does nothing.
    pub fn open(&self) -> VirtResult<()> {
        let mut state = lock(&self.state);
        if state.open {
            return Ok(());
        }
        if state.closed {
            return Err(self.channel_error("channel already closed"));
        }

        tracing::info!(host = %self.host, "opening SSH control channel");
        let master = self
            .ssh()
            .args(["-o", "ControlPersist=yes", "-M", "-N"])
            .arg(&self.host);
        self.runner.checked(&master)?;

        let check = self.runner.checked(&self.control("check").arg(&self.host))?;
        let pid = parse_master_pid(&check.combined());
        if pid.is_none() {
            tracing::warn!(host = %self.host, "could not determine control master pid");
        }
        state.master_pid = pid;
        state.open = true;
        Ok(())
    }

    /// Forward a random free local port to `ip:port` on the remote side.
    ///
    /// Ports already forwarded through this channel are never handed out
    /// again. Fails after the configured number of candidates were refused.
    pub fn forward_port(&self, ip: &str, port: u16) -> VirtResult<Forward> {
        let target = format!("{}:{}", ip, port);
        let mut attempts = 0;
        while attempts < self.max_attempts {
            attempts += 1;
            let candidate = lock(&self.ports).next_port();
            if !lock(&self.state).leased.insert(candidate) {
                // leased by an earlier forward
                continue;
            }

            let spec = self
                .control("forward")
                .arg("-L")
                .arg(forward_spec(candidate, ip, port))
                .arg(&self.host);
            match self.runner.output(&spec) {
                Ok(out) if out.success() => {
                    tracing::debug!(host = %self.host, local = candidate, %target, "port forwarded");
                    return Ok(Forward {
                        local_port: candidate,
                        target_ip: ip.to_string(),
                        target_port: port,
                    });
                }
                Ok(out) => {
                    tracing::debug!(
                        local = candidate,
                        output = %out.combined().trim(),
                        "port forward refused, retrying"
                    );
                }
                Err(e) => {
                    tracing::debug!(local = candidate, error = %e, "port forward failed, retrying");
                }
            }
            lock(&self.state).leased.remove(&candidate);
        }

        Err(VirtError::NoFreePort { target, attempts })
    }

    /// Forward each of `ports` on `ip`, in order, each to a distinct local port.
    pub fn forward_ports(&self, ip: &str, ports: &[u16]) -> VirtResult<Vec<Forward>> {
        let mut forwards = Vec::with_capacity(ports.len());
        for &port in ports {
            match self.forward_port(ip, port) {
                Ok(f) => forwards.push(f),
                Err(e) => {
                    self.cancel_forwards(&forwards);
                    return Err(e);
                }
            }
        }
        Ok(forwards)
    }

    /// Cancel a forward. Failures are logged.
    pub fn cancel_forward(&self, forward: &Forward) {
        let spec = self
            .control("cancel")
            .arg("-L")
            .arg(forward.spec())
            .arg(&self.host);
        match self.runner.checked(&spec) {
            Ok(_) => tracing::debug!(local = forward.local_port, "port forward cancelled"),
            Err(e) => tracing::warn!(local = forward.local_port, error = %e, "failed to cancel port forward"),
        }
        lock(&self.state).leased.remove(&forward.local_port);
    }

    pub fn cancel_forwards(&self, forwards: &[Forward]) {
        for f in forwards {
            self.cancel_forward(f);
        }
    }

    /// Stop the control master. Only the first call has an effect.
    pub fn close(&self) {
        let mut state = lock(&self.state);
        if state.closed {
            return;
        }
        state.closed = true;
        if !state.open {
            return;
        }
        state.open = false;

        tracing::info!(host = %self.host, "closing SSH control channel");
        if let Err(e) = self.runner.checked(&self.control("exit").arg(&self.host)) {
            tracing::warn!(host = %self.host, error = %e, "control master did not exit cleanly");
            if let Some(pid) = state.master_pid {
                stop_master(pid);
            }
        }
        state.leased.clear();
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        let state = lock(&self.state);
        if state.open && !state.closed {
            if let Some(pid) = state.master_pid {
                tracing::warn!(host = %self.host, pid, "control channel dropped while open");
                stop_master(pid);
            }
        }
    }
}

fn stop_master(pid: u32) {
    #[cfg(unix)]
    {
        if let Err(e) = crate::process::signal_pid(pid, nix::sys::signal::Signal::SIGTERM) {
            tracing::warn!(pid, error = %e, "failed to stop control master");
        }
    }
    #[cfg(not(unix))]
    {
        tracing::warn!(pid, "cannot stop control master on this platform");
    }
}

/// Extract the pid from `ssh -O check` output (`Master running (pid=N)`).
pub fn parse_master_pid(output: &str) -> Option<u32> {
    let re = Regex::new(r"Master running \(pid=(\d+)\)").ok()?;
    re.captures(output)?.get(1)?.as_str().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockResponse, MockRunner, SequencePorts};

    fn channel(runner: &Arc<MockRunner>, ports: Vec<u16>) -> ControlChannel {
        ControlChannel::new("hyper.example.com", runner.clone())
            .unwrap()
            .with_port_source(SequencePorts::new(ports))
    }

    #[test]
    fn test_parse_master_pid() {
        assert_eq!(parse_master_pid("Master running (pid=12345)\r\n"), Some(12345));
        assert_eq!(parse_master_pid("Control socket connect: No such file"), None);
    }

    #[test]
    fn test_open_is_idempotent() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(&["-O", "check"], MockResponse::ok("Master running (pid=777)"));
        let ch = channel(&runner, vec![50000]);

        ch.open().unwrap();
        ch.open().unwrap();

        assert_eq!(runner.count(&["-M", "-N"]), 1);
        assert_eq!(ch.master_pid(), Some(777));
        let master = &runner.calls_matching(&["-M"])[0];
        assert_eq!(
            master.argv(),
            vec![
                "ssh".to_string(),
                "-S".to_string(),
                ch.socket_path().display().to_string(),
                "-o".to_string(),
                "ControlPersist=yes".to_string(),
                "-M".to_string(),
                "-N".to_string(),
                "hyper.example.com".to_string(),
            ]
        );
    }

    #[test]
    fn test_forward_retries_until_success() {
        let runner = Arc::new(MockRunner::new());
        runner
            .respond(&["forward"], MockResponse::fail(255, "bind: Address already in use"))
            .respond(&["forward"], MockResponse::fail(255, "bind: Address already in use"))
            .respond(&["forward"], MockResponse::ok(""));
        let ch = channel(&runner, vec![50001, 50002, 50003]);

        let fwd = ch.forward_port("192.168.122.5", 22).unwrap();
        assert_eq!(fwd.local_port, 50003);
        assert_eq!(fwd.spec(), "*:50003:192.168.122.5:22");
        assert_eq!(runner.count(&["-O", "forward"]), 3);
    }

    #[test]
    fn test_forward_gives_up() {
        let runner = Arc::new(MockRunner::new());
        runner.respond(&["forward"], MockResponse::fail(255, "refused"));
        let ch = channel(&runner, vec![50001, 50002]).with_max_attempts(4);

        let err = ch.forward_port("10.0.0.2", 80).unwrap_err();
        assert!(matches!(err, VirtError::NoFreePort { attempts: 4, .. }));
    }

    #[test]
    fn test_forwarded_ports_are_unique() {
        let runner = Arc::new(MockRunner::new());
        // Second request is offered the same port again first.
        let ch = channel(&runner, vec![50010, 50010, 50011]);

        let forwards = ch.forward_ports("10.0.0.2", &[22, 80]).unwrap();
        assert_eq!(forwards[0].target_port, 22);
        assert_eq!(forwards[1].target_port, 80);
        assert_eq!(forwards[0].local_port, 50010);
        assert_eq!(forwards[1].local_port, 50011);
        // The duplicate candidate never reached ssh.
        assert_eq!(runner.count(&["-O", "forward"]), 2);
    }

    #[test]
    fn test_cancel_releases_port() {
        let runner = Arc::new(MockRunner::new());
        let ch = channel(&runner, vec![50020]);

        let fwd = ch.forward_port("10.0.0.2", 22).unwrap();
        ch.cancel_forward(&fwd);
        let again = ch.forward_port("10.0.0.2", 22).unwrap();
        assert_eq!(again.local_port, 50020);
        let cancel = &runner.calls_matching(&["-O", "cancel"])[0];
        assert!(cancel.argv().contains(&"*:50020:10.0.0.2:22".to_string()));
    }

    #[test]
    fn test_close_once() {
        let runner = Arc::new(MockRunner::new());
        let ch = channel(&runner, vec![50030]);
        ch.open().unwrap();
        ch.close();
        ch.close();
        assert_eq!(runner.count(&["-O", "exit"]), 1);
        assert!(!ch.is_open());
        assert!(ch.open().is_err());
    }

    #[test]
    fn test_close_unopened_runs_nothing() {
        let runner = Arc::new(MockRunner::new());
        let ch = channel(&runner, vec![50030]);
        ch.close();
        assert!(runner.calls().is_empty());
    }
}
