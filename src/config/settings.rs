//! Typed lane settings
//!
//! The merged configuration value is deserialized into [`LaneSettings`].
//! Unknown keys are rejected so typos in settings files surface early.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use super::defaults::{self, builtin_layer};
use super::merge::{merge_layers, overrides_layer};
use crate::timeout::{TimeoutValidationError, WorkflowTimeouts};

/// Key of the kernel command line applied to every architecture
pub const CMDLINE_ALL: &str = "ALL";

/// Installer web UI test settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct WebUiSettings {
    /// Run test tooling in the execution container
    pub use_container: bool,

    /// Containerfile used to build the execution image
    pub containerfile: PathBuf,

    /// Name of the execution image
    pub image: String,

    /// Verify TLS certificates when polling the web UI
    pub ssl_verify: bool,

    /// Keep VMs after the test finished
    pub debug: bool,

    /// Test timeout in minutes
    pub test_timeout: u64,

    /// Web UI startup timeout in minutes
    pub startup_timeout: u64,

    /// Seconds between web UI polls
    pub poll_interval: u64,

    /// Seconds to wait between web UI readiness and test start
    pub settle_delay: u64,

    pub anaconda_repo: String,
    pub cockpit_repo: String,
    pub cockpit_branch: String,
    pub bots_repo: String,
    pub bots_branch: String,

    pub port_ssh: u16,
    pub port_webui: u16,

    /// URL path of the web UI
    pub location: String,

    /// Parent directory of the per-branch working directories
    pub temp_base: PathBuf,

    /// Add `inst.graphical` to the installer command line
    pub inst_graphical: bool,

    /// Attach a serial console (`console=ttyS0`, `--serial pty`)
    pub serial_console: bool,

    /// Forward VM ports through the control channel of remote hypervisors
    pub port_forwarding: bool,
}

impl Default for WebUiSettings {
    fn default() -> Self {
        Self {
            use_container: true,
            containerfile: PathBuf::from("Containerfile"),
            image: defaults::CONTAINER_IMAGE.to_string(),
            ssl_verify: false,
            debug: false,
            test_timeout: 60,
            startup_timeout: 10,
            poll_interval: 10,
            settle_delay: 10,
            anaconda_repo: defaults::ANACONDA_REPO.to_string(),
            cockpit_repo: defaults::COCKPIT_REPO.to_string(),
            cockpit_branch: "main".to_string(),
            bots_repo: defaults::BOTS_REPO.to_string(),
            bots_branch: "main".to_string(),
            port_ssh: 22,
            port_webui: 80,
            location: defaults::WEBUI_LOCATION.to_string(),
            temp_base: PathBuf::from("/var/tmp"),
            inst_graphical: true,
            serial_console: true,
            port_forwarding: true,
        }
    }
}

/// Virtual machine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmSettings {
    /// Maximum number of VMs running at once
    pub limit: usize,

    pub memory_mib: u32,
    pub vcpus: u32,
    pub disk_gib: u32,
    pub os_variant: String,

    /// Seconds between network address queries
    pub address_interval: u64,

    /// Number of network address queries before giving up
    pub address_attempts: u32,

    /// Seconds the installer gets to exit after the VM was destroyed
    pub installer_exit_grace: u64,

    /// Seconds between SIGTERM and SIGKILL
    pub terminate_grace: u64,

    /// Seconds to wait for exit after SIGKILL
    pub kill_grace: u64,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            limit: 5,
            memory_mib: 4096,
            vcpus: 2,
            disk_gib: 10,
            os_variant: "rhel-unknown".to_string(),
            address_interval: 10,
            address_attempts: 30,
            installer_exit_grace: 10,
            terminate_grace: 10,
            kill_grace: 1,
        }
    }
}

/// Kickstart batch settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct KickstartSettings {
    /// Existing kickstart-tests checkout to use instead of cloning
    pub local_repo: Option<PathBuf>,
    pub repo: String,
    pub branch: String,
    /// Runner invocation, whitespace separated
    pub runner_command: String,
    /// Whether the runner retries a test after its first failure
    pub retry: bool,
}

impl Default for KickstartSettings {
    fn default() -> Self {
        Self {
            local_repo: None,
            repo: defaults::KSTEST_REPO.to_string(),
            branch: "main".to_string(),
            runner_command: defaults::KSTEST_RUNNER.to_string(),
            retry: true,
        }
    }
}

impl KickstartSettings {
    pub fn runner_argv(&self) -> Vec<String> {
        self.runner_command
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }
}

/// All lane settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LaneSettings {
    pub webui: WebUiSettings,
    pub vm: VmSettings,

    /// Hypervisor host per architecture
    pub hypervisors: BTreeMap<String, String>,

    /// Extra installer arguments, `ALL` and per architecture
    pub kernel_cmdline: BTreeMap<String, String>,

    /// Test repository URL by name
    pub test_repos: BTreeMap<String, String>,

    pub kickstart: KickstartSettings,
}

impl Default for LaneSettings {
    fn default() -> Self {
        Self {
            webui: WebUiSettings::default(),
            vm: VmSettings::default(),
            hypervisors: BTreeMap::from([("x86_64".to_string(), "localhost".to_string())]),
            kernel_cmdline: BTreeMap::new(),
            test_repos: BTreeMap::new(),
            kickstart: KickstartSettings::default(),
        }
    }
}

impl LaneSettings {
    /// Hypervisor host for `arch`.
    pub fn hypervisor(&self, arch: &str) -> Option<&str> {
        self.hypervisors.get(arch).map(String::as_str)
    }

    /// Kernel arguments applied to every architecture.
    pub fn cmdline_all(&self) -> Option<&str> {
        self.kernel_cmdline.get(CMDLINE_ALL).map(String::as_str)
    }

    /// Kernel arguments for `arch`.
    pub fn cmdline_arch(&self, arch: &str) -> Option<&str> {
        self.kernel_cmdline.get(arch).map(String::as_str)
    }

    pub fn test_repo(&self, name: &str) -> Option<&str> {
        self.test_repos.get(name).map(String::as_str)
    }

    pub fn timeouts(&self) -> WorkflowTimeouts {
        WorkflowTimeouts::from_settings(self)
    }

    /// Check value bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.vm.limit == 0 {
            return Err(ConfigError::Validation("vm.limit must be at least 1".to_string()));
        }
        if self.webui.port_ssh == 0 || self.webui.port_webui == 0 {
            return Err(ConfigError::Validation(
                "webui.port_ssh and webui.port_webui must be non-zero".to_string(),
            ));
        }
        self.timeouts().validate()?;
        Ok(())
    }
}

/// Where a configuration layer came from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConfigOrigin {
    Builtin,
    File,
    Cli,
}

/// A contributing configuration layer
#[derive(Debug, Clone, Serialize)]
pub struct ConfigSource {
    pub origin: ConfigOrigin,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,

    /// SHA-256 of the raw file bytes
    #[serde(skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

/// Validated settings together with the layers they were built from
#[derive(Debug, Clone)]
pub struct LoadedSettings {
    pub settings: LaneSettings,
    pub sources: Vec<ConfigSource>,
    /// Merged value before deserialization
    pub merged: Value,
}

impl LoadedSettings {
    /// Build settings from defaults, an optional settings file and `--set` overrides.
    ///
    /// A missing file is skipped unless `required` is set.
    pub fn load(
        file: Option<&Path>,
        required: bool,
        overrides: &[String],
    ) -> Result<Self, ConfigError> {
        let mut layers = vec![builtin_layer()];
        let mut sources = vec![ConfigSource {
            origin: ConfigOrigin::Builtin,
            path: None,
            digest: None,
        }];

        if let Some(path) = file {
            if path.exists() {
                let (value, digest) = load_toml_file(path)?;
                tracing::debug!(path = %path.display(), %digest, "loaded settings file");
                layers.push(value);
                sources.push(ConfigSource {
                    origin: ConfigOrigin::File,
                    path: Some(path.to_path_buf()),
                    digest: Some(digest),
                });
            } else if required {
                return Err(ConfigError::Missing(path.to_path_buf()));
            }
        }

        if !overrides.is_empty() {
            layers.push(overrides_layer(overrides)?);
            sources.push(ConfigSource {
                origin: ConfigOrigin::Cli,
                path: None,
                digest: None,
            });
        }

        let merged = merge_layers(layers);
        let settings: LaneSettings = serde_json::from_value(merged.clone())?;
        settings.validate()?;

        Ok(Self {
            settings,
            sources,
            merged,
        })
    }
}

/// Default settings file location (`~/.config/vmlane/settings.toml`).
pub fn default_settings_path() -> Option<PathBuf> {
    std::env::var_os("HOME").map(|home| PathBuf::from(home).join(defaults::SETTINGS_RELATIVE_PATH))
}

fn load_toml_file(path: &Path) -> Result<(Value, String), ConfigError> {
    let bytes = fs::read(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    let digest = hex::encode(Sha256::digest(&bytes));

    let contents = String::from_utf8(bytes)
        .map_err(|e| ConfigError::Validation(format!("{}: invalid UTF-8: {}", path.display(), e)))?;
    let value: Value = toml::from_str(&contents)?;
    Ok((value, digest))
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("settings file {0} does not exist")]
    Missing(PathBuf),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid settings: {0}")]
    Schema(#[from] serde_json::Error),

    #[error("invalid override '{0}', expected section.key=value")]
    InvalidOverride(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Timeout(#[from] TimeoutValidationError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_only() {
        let loaded = LoadedSettings::load(None, false, &[]).unwrap();
        assert_eq!(loaded.settings, LaneSettings::default());
        assert_eq!(loaded.sources.len(), 1);
        assert_eq!(loaded.sources[0].origin, ConfigOrigin::Builtin);
        assert_eq!(loaded.settings.hypervisor("x86_64"), Some("localhost"));
        assert_eq!(loaded.settings.hypervisor("s390x"), None);
    }

    #[test]
    fn test_file_and_overrides() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "[vm]\nlimit = 2\n").unwrap();
        writeln!(file, "[hypervisors]\naarch64 = \"arm.example.com\"\n").unwrap();
        writeln!(file, "[kernel_cmdline]\nALL = \"inst.debug\"\naarch64 = \"nosmt\"\n").unwrap();

        let loaded = LoadedSettings::load(
            Some(file.path()),
            true,
            &["vm.limit=3".to_string(), "webui.debug=true".to_string()],
        )
        .unwrap();
        let s = &loaded.settings;
        assert_eq!(s.vm.limit, 3);
        assert!(s.webui.debug);
        assert_eq!(s.vm.vcpus, 2);
        // Maps merge key by key with the defaults.
        assert_eq!(s.hypervisor("x86_64"), Some("localhost"));
        assert_eq!(s.hypervisor("aarch64"), Some("arm.example.com"));
        assert_eq!(s.cmdline_all(), Some("inst.debug"));
        assert_eq!(s.cmdline_arch("aarch64"), Some("nosmt"));
        assert_eq!(s.cmdline_arch("x86_64"), None);
        assert_eq!(loaded.sources.len(), 3);
        assert_eq!(loaded.sources[1].digest.as_ref().unwrap().len(), 64);
    }

    #[test]
    fn test_missing_file() {
        let path = Path::new("/nonexistent/vmlane/settings.toml");
        assert!(LoadedSettings::load(Some(path), false, &[]).is_ok());
        assert!(matches!(
            LoadedSettings::load(Some(path), true, &[]),
            Err(ConfigError::Missing(_))
        ));
    }

    #[test]
    fn test_unknown_key_rejected() {
        let err = LoadedSettings::load(None, false, &["webui.prot_ssh=2222".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::Schema(_)));
    }

    #[test]
    fn test_validation() {
        let err = LoadedSettings::load(None, false, &["vm.limit=0".to_string()]).unwrap_err();
        assert!(err.to_string().contains("vm.limit"));

        let err =
            LoadedSettings::load(None, false, &["webui.test_timeout=0".to_string()]).unwrap_err();
        assert!(matches!(err, ConfigError::Timeout(_)));
    }

    #[test]
    fn test_runner_argv() {
        let s = KickstartSettings::default();
        assert_eq!(s.runner_argv(), vec!["containers/runner/launch", "--retry"]);
    }
}
