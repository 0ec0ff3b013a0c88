//! External command execution.
//!
//! Every interaction with virsh, virt-install, ssh, podman and git goes
//! through a [`CommandRunner`] so that local, tunneled and containerized
//! backends share one call path and tests can substitute a scripted runner.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::error::{VirtError, VirtResult};
use crate::process::{ManagedChild, SystemChild};

/// Where the output of a spawned command goes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum OutputMode {
    /// Discard stdout and stderr.
    #[default]
    Null,
    /// Write stdout and stderr into the given log file.
    Log(PathBuf),
    /// Keep stdout and stderr as pipes readable from the child handle.
    Piped,
}

/// Description of a command to run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Working directory (inherits the current one if unset)
    pub cwd: Option<PathBuf>,
    /// Extra environment variables added to the inherited environment
    pub env: Vec<(String, String)>,
    /// Output handling for spawned commands
    pub output: OutputMode,
}

impl CommandSpec {
    /// Create a spec for the given program with no arguments.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
        }
    }

    /// Create a spec from a full argv (program first).
    pub fn from_argv(argv: &[String]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        Some(Self::new(program.clone()).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn log_to(mut self, path: impl Into<PathBuf>) -> Self {
        self.output = OutputMode::Log(path.into());
        self
    }

    pub fn piped(mut self) -> Self {
        self.output = OutputMode::Piped;
        self
    }

    /// Full argv, program first.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(self.program.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Check if the argv starts with the given words.
    pub fn starts_with(&self, prefix: &[&str]) -> bool {
        let argv = self.argv();
        argv.len() >= prefix.len() && argv.iter().zip(prefix).all(|(a, p)| a == p)
    }

    /// Command line rendered for log messages.
    pub fn display(&self) -> String {
        self.argv().join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` if terminated by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }

    /// Stdout followed by stderr.
    pub fn combined(&self) -> String {
        let mut out = self.stdout.clone();
        out.push_str(&self.stderr);
        out
    }
}

/// Runs external commands.
pub trait CommandRunner: Send + Sync {
    /// Run a command to completion and capture its output.
    fn output(&self, spec: &CommandSpec) -> VirtResult<CommandOutput>;

    /// Start a command in the background.
    fn spawn(&self, spec: &CommandSpec) -> VirtResult<Box<dyn ManagedChild>>;

    /// Run a command and fail unless it exits successfully.
    fn checked(&self, spec: &CommandSpec) -> VirtResult<CommandOutput> {
        let output = self.output(spec)?;
        if output.success() {
            Ok(output)
        } else {
            Err(VirtError::CommandFailed {
                command: spec.display(),
                code: output.code,
                output: output.combined().trim().to_string(),
            })
        }
    }
}

/// Runner executing real processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

impl SystemRunner {
    fn command(spec: &CommandSpec) -> Command {
        let mut command = Command::new(&spec.program);
        command.args(&spec.args);
        if let Some(ref cwd) = spec.cwd {
            command.current_dir(cwd);
        }
        command.envs(spec.env.iter().map(|(k, v)| (k, v)));
        command
    }

    fn open_log(path: &Path) -> VirtResult<(Stdio, Stdio)> {
        let file = File::create(path)?;
        let err = file.try_clone()?;
        Ok((Stdio::from(file), Stdio::from(err)))
    }
}

impl CommandRunner for SystemRunner {
    fn output(&self, spec: &CommandSpec) -> VirtResult<CommandOutput> {
        tracing::debug!(command = %spec.display(), "running");
        let output = Self::command(spec)
            .stdin(Stdio::null())
            .output()
            .map_err(|source| VirtError::Spawn {
                command: spec.display(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn spawn(&self, spec: &CommandSpec) -> VirtResult<Box<dyn ManagedChild>> {
        tracing::debug!(command = %spec.display(), "spawning");
        let mut command = Self::command(spec);
        command.stdin(Stdio::null());
        match spec.output {
            OutputMode::Null => {
                command.stdout(Stdio::null()).stderr(Stdio::null());
            }
            OutputMode::Log(ref path) => {
                let (out, err) = Self::open_log(path)?;
                command.stdout(out).stderr(err);
            }
            OutputMode::Piped => {
                command.stdout(Stdio::piped()).stderr(Stdio::piped());
            }
        }

        let child = command.spawn().map_err(|source| VirtError::Spawn {
            command: spec.display(),
            source,
        })?;
        Ok(Box::new(SystemChild::new(child)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spec_builder() {
        let spec = CommandSpec::new("virsh")
            .args(["-q", "--connect", "qemu:///system"])
            .arg("domifaddr")
            .arg("vm1")
            .env("LANG", "C")
            .cwd("/tmp");

        assert_eq!(
            spec.argv(),
            vec!["virsh", "-q", "--connect", "qemu:///system", "domifaddr", "vm1"]
        );
        assert!(spec.starts_with(&["virsh", "-q"]));
        assert!(!spec.starts_with(&["virsh", "destroy"]));
        assert_eq!(spec.display(), "virsh -q --connect qemu:///system domifaddr vm1");
        assert_eq!(spec.env, vec![("LANG".to_string(), "C".to_string())]);
    }

    #[test]
    fn test_from_argv() {
        let argv = vec!["echo".to_string(), "hello".to_string()];
        let spec = CommandSpec::from_argv(&argv).unwrap();
        assert_eq!(spec.program, "echo");
        assert_eq!(spec.args, vec!["hello"]);
        assert!(CommandSpec::from_argv(&[]).is_none());
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_checked() {
        let runner = SystemRunner;
        let output = runner
            .checked(&CommandSpec::new("sh").args(["-c", "echo out; echo err >&2"]))
            .unwrap();
        assert_eq!(output.stdout, "out\n");
        assert_eq!(output.stderr, "err\n");
        assert_eq!(output.combined(), "out\nerr\n");

        let err = runner
            .checked(&CommandSpec::new("sh").args(["-c", "echo nope >&2; exit 3"]))
            .unwrap_err();
        match err {
            VirtError::CommandFailed { code, output, .. } => {
                assert_eq!(code, Some(3));
                assert_eq!(output, "nope");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_system_runner_spawn_to_log() {
        let temp = tempfile::TempDir::new().unwrap();
        let log = temp.path().join("out.log");
        let runner = SystemRunner;
        let mut child = runner
            .spawn(&CommandSpec::new("sh").args(["-c", "echo logged"]).log_to(&log))
            .unwrap();
        let exit = crate::process::wait_timeout(child.as_mut(), std::time::Duration::from_secs(10))
            .unwrap()
            .unwrap();
        assert!(exit.success());
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "logged\n");
    }
}
