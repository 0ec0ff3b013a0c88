//! Container engine wrapper for running test tooling in a fixed environment.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::command::{CommandOutput, CommandRunner, CommandSpec};
use crate::error::VirtResult;
use crate::process::ManagedChild;

/// Mount point of the working directory inside the container.
pub const CONTAINER_WORKDIR: &str = "/root/workdir";

/// SELinux relabeling mode of the working directory volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VolumeMode {
    /// Shared between containers (`z`).
    Shared,
    /// Private to this container (`Z`).
    Private,
}

impl VolumeMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            VolumeMode::Shared => "z",
            VolumeMode::Private => "Z",
        }
    }
}

/// A command to run inside the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRun {
    /// Host directory mounted at [`CONTAINER_WORKDIR`]
    pub volume: PathBuf,
    pub mode: VolumeMode,
    /// Working directory inside the container
    pub cwd: String,
    pub env: Vec<(String, String)>,
    pub args: Vec<String>,
}

impl ContainerRun {
    pub fn new(volume: impl Into<PathBuf>, args: Vec<String>) -> Self {
        Self {
            volume: volume.into(),
            mode: VolumeMode::Shared,
            cwd: CONTAINER_WORKDIR.to_string(),
            env: Vec::new(),
            args,
        }
    }

    pub fn mode(mut self, mode: VolumeMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = cwd.into();
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }
}

/// Map `path` under `host_root` to the same location under the container mount.
///
/// Paths outside `host_root` are returned unchanged.
pub fn container_path(host_root: &Path, path: &Path) -> String {
    match path.strip_prefix(host_root) {
        Ok(rel) if rel.as_os_str().is_empty() => CONTAINER_WORKDIR.to_string(),
        Ok(rel) => format!("{}/{}", CONTAINER_WORKDIR, rel.display()),
        Err(_) => path.display().to_string(),
    }
}

/// Container image used to execute tests, built on first use.
pub struct ExecutionContainer {
    engine: String,
    image: String,
    containerfile: PathBuf,
    runner: Arc<dyn CommandRunner>,
    ready: AtomicBool,
}

impl ExecutionContainer {
    pub fn new(
        image: impl Into<String>,
        containerfile: impl Into<PathBuf>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            engine: "podman".to_string(),
            image: image.into(),
            containerfile: containerfile.into(),
            runner,
            ready: AtomicBool::new(false),
        }
    }

    /// Use another container engine binary.
    pub fn with_engine(mut self, engine: impl Into<String>) -> Self {
        self.engine = engine.into();
        self
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    fn engine(&self) -> CommandSpec {
        CommandSpec::new(&self.engine)
    }

    /// Check whether the image exists locally.
    pub fn image_exists(&self) -> VirtResult<bool> {
        let out = self.runner.checked(
            &self
                .engine()
                .args(["images", "-q", "-f"])
                .arg(format!("reference={}", self.image)),
        )?;
        Ok(!out.stdout.trim().is_empty())
    }

    /// Make sure the image exists, building it if needed.
    ///
    /// Build output goes to `build_log`. Returns `true` if a build ran. The
    /// check is skipped once the image is known to exist.
    pub fn ensure_image(&self, build_log: &Path) -> VirtResult<bool> {
        if self.ready.load(Ordering::SeqCst) {
            return Ok(false);
        }
        if self.image_exists()? {
            tracing::debug!(image = %self.image, "container image present");
            self.ready.store(true, Ordering::SeqCst);
            return Ok(false);
        }

        tracing::info!(image = %self.image, containerfile = %self.containerfile.display(), "building container image");
        let build = self
            .engine()
            .arg("build")
            .arg("-f")
            .arg(self.containerfile.display().to_string())
            .arg("-t")
            .arg(&self.image);
        let out = self.runner.checked(&build);
        let text = match out {
            Ok(ref o) => o.combined(),
            Err(ref e) => e.to_string(),
        };
        if let Err(e) = std::fs::write(build_log, text) {
            tracing::warn!(log = %build_log.display(), error = %e, "failed to write container build log");
        }
        out?;
        self.ready.store(true, Ordering::SeqCst);
        Ok(true)
    }

    /// The `podman run` command for `run`.
    pub fn command(&self, run: &ContainerRun) -> CommandSpec {
        let mut cmd = self.engine().args(["run", "--rm", "-it", "-v"]).arg(format!(
            "{}:{}:{}",
            run.volume.display(),
            CONTAINER_WORKDIR,
            run.mode.as_str()
        ));
        cmd = cmd.arg("-w").arg(&run.cwd);
        for (k, v) in &run.env {
            cmd = cmd.arg("-e").arg(format!("{}={}", k, v));
        }
        cmd.arg(&self.image).args(run.args.iter().cloned())
    }

    /// Run to completion. A non-zero exit is logged and returned as output.
    pub fn exec(&self, run: &ContainerRun) -> VirtResult<CommandOutput> {
        let command = self.command(run);
        let out = self.runner.output(&command)?;
        if !out.success() {
            tracing::error!(
                command = %command.display(),
                code = ?out.code,
                output = %out.combined().trim(),
                "command in container failed"
            );
        }
        Ok(out)
    }

    /// Start in the background with output going to `log`.
    pub fn spawn(&self, run: &ContainerRun, log: &Path) -> VirtResult<Box<dyn ManagedChild>> {
        self.runner.spawn(&self.command(run).log_to(log))
    }

    /// Remove the image. Failures are logged.
    pub fn remove_image(&self) {
        self.ready.store(false, Ordering::SeqCst);
        match self.runner.checked(&self.engine().arg("rmi").arg(&self.image)) {
            Ok(_) => tracing::info!(image = %self.image, "container image removed"),
            Err(e) => tracing::warn!(image = %self.image, error = %e, "failed to remove container image"),
        }
    }
}
