//! Test plan: the installation source and the test cases to run.
//!
//! ```toml
//! [installation_source]
//! base_repo_id = "BaseOS"
//! [installation_source.repos.BaseOS.x86_64]
//! os = "http://example.com/compose/x86_64/BaseOS/os"
//!
//! [boot_iso]
//! x86_64 = "http://example.com/compose/x86_64/boot.iso"
//!
//! [[case]]
//! id = "navigation-x86_64"
//! workflow = "anaconda-webui"
//! configuration = { architecture = "x86_64", branch = "main" }
//! automation = { script_file = "./check-navigation", test_case = "TestNavigation" }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use crate::source::{ComposeInfo, InstallationSource, SourceError};

/// Prefix of generated VM names
pub const VM_NAME_PREFIX: &str = "vmlane-webui";

/// Hex digits of the configuration hash used in VM names
const VM_NAME_HASH_LEN: usize = 12;

/// Workflow driving a test case
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkflowKind {
    /// Browser test against the installer web UI in a VM
    #[serde(rename = "anaconda-webui")]
    AnacondaWebUi,
    /// Kickstart test run by the batch runner
    #[serde(rename = "kickstart-test")]
    KickstartTest,
}

/// Configuration a test case runs in
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseConfiguration {
    pub architecture: String,

    /// Installer source branch (web UI tests)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Automation data of a test case
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Automation {
    /// Test script, relative to the test repository root
    pub script_file: Option<String>,

    /// Test case name passed to the script
    pub test_case: Option<String>,

    /// Name of the test repository (see `test_repos` settings)
    pub test_repo: Option<String>,

    /// Additional repositories enabled in the installer
    pub additional_repos: Vec<String>,

    /// Additional kernel command line arguments
    pub kernel_cmdline: Option<String>,

    /// Web UI startup timeout in minutes
    pub webui_startup_timeout: Option<u64>,

    /// Kickstart test name
    pub test: Option<String>,
}

/// One test case bound to one configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CaseRunConfiguration {
    pub id: String,

    #[serde(default)]
    pub name: Option<String>,

    pub workflow: WorkflowKind,

    pub configuration: CaseConfiguration,

    #[serde(default)]
    pub automation: Automation,
}

/// Validated automation data of a web UI test
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebUiCase {
    pub script_file: String,
    pub test_case: String,
    pub branch: String,
    pub test_repo: Option<String>,
    pub additional_repos: Vec<String>,
    pub kernel_cmdline: Option<String>,
    pub startup_timeout: Option<u64>,
}

impl CaseRunConfiguration {
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.id)
    }

    pub fn architecture(&self) -> &str {
        &self.configuration.architecture
    }

    /// Deterministic VM name derived from the case id and configuration.
    pub fn vm_name(&self) -> Result<String, PlanError> {
        #[derive(Serialize)]
        struct Identity<'a> {
            id: &'a str,
            configuration: &'a CaseConfiguration,
        }

        let bytes = serde_json_canonicalizer::to_vec(&Identity {
            id: &self.id,
            configuration: &self.configuration,
        })
        .map_err(|e| PlanError::Identity(e.to_string()))?;
        let digest = hex::encode(Sha256::digest(&bytes));
        Ok(format!("{}-{}", VM_NAME_PREFIX, &digest[..VM_NAME_HASH_LEN]))
    }

    /// Automation data of a web UI test.
    pub fn webui(&self) -> Result<WebUiCase, PlanError> {
        let missing = |field: &'static str| PlanError::MissingField {
            case: self.id.clone(),
            field,
        };
        let a = &self.automation;
        Ok(WebUiCase {
            script_file: a.script_file.clone().ok_or_else(|| missing("automation.script_file"))?,
            test_case: a.test_case.clone().ok_or_else(|| missing("automation.test_case"))?,
            branch: self
                .configuration
                .branch
                .clone()
                .ok_or_else(|| missing("configuration.branch"))?,
            test_repo: a.test_repo.clone(),
            additional_repos: a.additional_repos.clone(),
            kernel_cmdline: a.kernel_cmdline.clone(),
            startup_timeout: a.webui_startup_timeout,
        })
    }

    /// Kickstart test name.
    pub fn kickstart_test(&self) -> Result<&str, PlanError> {
        self.automation
            .test
            .as_deref()
            .ok_or_else(|| PlanError::MissingField {
                case: self.id.clone(),
                field: "automation.test",
            })
    }
}

/// A test plan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub installation_source: Option<InstallationSource>,

    /// Compose metadata, converted when no installation source is given
    #[serde(default)]
    pub compose: Option<ComposeInfo>,

    /// Installer boot image URL per architecture
    #[serde(default)]
    pub boot_iso: BTreeMap<String, String>,

    #[serde(default, rename = "case")]
    pub cases: Vec<CaseRunConfiguration>,
}

impl Plan {
    pub fn load(path: &Path) -> Result<Self, PlanError> {
        let contents = fs::read_to_string(path).map_err(|source| PlanError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self, PlanError> {
        let plan: Plan = toml::from_str(contents)?;
        plan.validate()?;
        Ok(plan)
    }

    fn validate(&self) -> Result<(), PlanError> {
        let mut seen = HashSet::new();
        for case in &self.cases {
            if !seen.insert(case.id.as_str()) {
                return Err(PlanError::DuplicateCase(case.id.clone()));
            }
            match case.workflow {
                WorkflowKind::AnacondaWebUi => {
                    case.webui()?;
                }
                WorkflowKind::KickstartTest => {
                    case.kickstart_test()?;
                }
            }
        }
        Ok(())
    }

    /// Installation source, given directly or converted from the compose.
    pub fn installation_source(&self) -> Result<Option<InstallationSource>, PlanError> {
        if let Some(ref source) = self.installation_source {
            return Ok(Some(source.clone()));
        }
        match self.compose {
            Some(ref compose) => Ok(Some(InstallationSource::from_compose(compose)?)),
            None => Ok(None),
        }
    }

    pub fn case(&self, id: &str) -> Option<&CaseRunConfiguration> {
        self.cases.iter().find(|c| c.id == id)
    }

    pub fn cases_of(&self, kind: WorkflowKind) -> impl Iterator<Item = &CaseRunConfiguration> {
        self.cases.iter().filter(move |c| c.workflow == kind)
    }
}

/// Plan errors
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("failed to read plan {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("plan parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("duplicate case id {0}")]
    DuplicateCase(String),

    #[error("case {case} is missing {field}")]
    MissingField { case: String, field: &'static str },

    #[error(transparent)]
    Source(#[from] SourceError),

    #[error("failed to derive case identity: {0}")]
    Identity(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    const PLAN: &str = r#"
        [installation_source]
        base_repo_id = "BaseOS"
        [installation_source.repos.BaseOS.x86_64]
        os = "http://example.com/compose/x86_64/BaseOS/os"

        [boot_iso]
        x86_64 = "http://example.com/compose/x86_64/boot.iso"

        [[case]]
        id = "navigation-x86_64"
        name = "Navigation"
        workflow = "anaconda-webui"
        configuration = { architecture = "x86_64", branch = "main" }
        automation = { script_file = "./check-navigation", test_case = "TestNavigation", additional_repos = ["AppStream"] }

        [[case]]
        id = "ks-lang"
        workflow = "kickstart-test"
        configuration = { architecture = "x86_64" }
        automation = { test = "lang" }
    "#;

    #[test]
    fn test_parse_plan() {
        let plan = Plan::from_toml(PLAN).unwrap();
        assert_eq!(plan.cases.len(), 2);
        assert_eq!(plan.boot_iso["x86_64"], "http://example.com/compose/x86_64/boot.iso");

        let webui = plan.case("navigation-x86_64").unwrap();
        assert_eq!(webui.display_name(), "Navigation");
        let data = webui.webui().unwrap();
        assert_eq!(data.branch, "main");
        assert_eq!(data.additional_repos, vec!["AppStream"]);

        let ks = plan.case("ks-lang").unwrap();
        assert_eq!(ks.display_name(), "ks-lang");
        assert_eq!(ks.kickstart_test().unwrap(), "lang");
        assert_eq!(plan.cases_of(WorkflowKind::KickstartTest).count(), 1);
        assert!(plan.installation_source().unwrap().is_some());
    }

    #[test]
    fn test_missing_webui_fields() {
        let plan = r#"
            [[case]]
            id = "broken"
            workflow = "anaconda-webui"
            configuration = { architecture = "x86_64" }
            automation = { script_file = "./check-x", test_case = "TestX" }
        "#;
        let err = Plan::from_toml(plan).unwrap_err();
        assert!(err.to_string().contains("configuration.branch"));
    }

    #[test]
    fn test_duplicate_case() {
        let plan = r#"
            [[case]]
            id = "a"
            workflow = "kickstart-test"
            configuration = { architecture = "x86_64" }
            automation = { test = "lang" }
            [[case]]
            id = "a"
            workflow = "kickstart-test"
            configuration = { architecture = "x86_64" }
            automation = { test = "lang" }
        "#;
        assert!(matches!(
            Plan::from_toml(plan),
            Err(PlanError::DuplicateCase(_))
        ));
    }

    #[test]
    fn test_compose_conversion() {
        let plan = r#"
            [compose]
            product = "Fedora"
            [[compose.variants]]
            id = "Everything"
            os_trees = { x86_64 = "http://example.com/Everything/x86_64/os" }
        "#;
        let plan = Plan::from_toml(plan).unwrap();
        let source = plan.installation_source().unwrap().unwrap();
        assert_eq!(source.base_repo_id(), "Everything");
    }

    #[test]
    fn test_vm_name_deterministic() {
        let plan = Plan::from_toml(PLAN).unwrap();
        let case = plan.case("navigation-x86_64").unwrap();
        let name = case.vm_name().unwrap();
        assert!(name.starts_with("vmlane-webui-"));
        assert_eq!(name.len(), "vmlane-webui-".len() + 12);
        assert_eq!(name, case.clone().vm_name().unwrap());

        let mut other = case.clone();
        other.configuration.architecture = "aarch64".to_string();
        assert_ne!(other.vm_name().unwrap(), name);
    }
}
