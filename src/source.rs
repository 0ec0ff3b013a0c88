//! Installation source: repository trees per variant and architecture.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Kernel path relative to an installation tree
pub const PXEBOOT_KERNEL: &str = "images/pxeboot/vmlinuz";
/// Initrd path relative to an installation tree
pub const PXEBOOT_INITRD: &str = "images/pxeboot/initrd.img";

/// Paths of one repository for one architecture
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchPaths {
    /// Installation tree URL
    pub os: String,

    /// Kernel path (relative to `os` or absolute URL)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kernel: Option<String>,

    /// Initrd path (relative to `os` or absolute URL)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initrd: Option<String>,
}

impl ArchPaths {
    pub fn os(os: impl Into<String>) -> Self {
        Self {
            os: os.into(),
            kernel: None,
            initrd: None,
        }
    }
}

/// `variant id -> architecture -> paths`
pub type RepoMap = BTreeMap<String, BTreeMap<String, ArchPaths>>;

/// Repositories available for installation, one of them the base repository.
///
/// Construction fails unless the base repository is among the repositories.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawSource")]
pub struct InstallationSource {
    base_repo_id: String,
    repos: RepoMap,
}

#[derive(Deserialize)]
struct RawSource {
    base_repo_id: String,
    repos: RepoMap,
}

impl TryFrom<RawSource> for InstallationSource {
    type Error = SourceError;

    fn try_from(raw: RawSource) -> Result<Self, Self::Error> {
        Self::new(raw.base_repo_id, raw.repos)
    }
}

impl InstallationSource {
    pub fn new(base_repo_id: impl Into<String>, repos: RepoMap) -> Result<Self, SourceError> {
        let base_repo_id = base_repo_id.into();
        if !repos.contains_key(&base_repo_id) {
            return Err(SourceError::MissingBaseRepo(base_repo_id));
        }
        Ok(Self {
            base_repo_id,
            repos,
        })
    }

    pub fn base_repo_id(&self) -> &str {
        &self.base_repo_id
    }

    pub fn repos(&self) -> &RepoMap {
        &self.repos
    }

    /// Architectures of the base repository
    pub fn base_repo(&self) -> &BTreeMap<String, ArchPaths> {
        // Presence checked on construction.
        &self.repos[&self.base_repo_id]
    }

    /// Base repository paths for `arch`.
    pub fn base_paths(&self, arch: &str) -> Option<&ArchPaths> {
        self.base_repo().get(arch)
    }

    /// Tree URL of `repo` for `arch`.
    pub fn os_url(&self, repo: &str, arch: &str) -> Option<&str> {
        self.repos.get(repo)?.get(arch).map(|p| p.os.as_str())
    }

    pub fn kernel_path(&self, arch: &str) -> Option<&str> {
        self.base_paths(arch)?.kernel.as_deref()
    }

    pub fn initrd_path(&self, arch: &str) -> Option<&str> {
        self.base_paths(arch)?.initrd.as_deref()
    }

    /// Convert compose metadata.
    ///
    /// RHEL composes install from `BaseOS`, Fedora composes from
    /// `Everything`; other products are not supported. Only the base variant
    /// carries kernel and initrd paths.
    pub fn from_compose(compose: &ComposeInfo) -> Result<Self, SourceError> {
        let base_repo_id = match compose.product.as_str() {
            "RHEL" => "BaseOS",
            "Fedora" => "Everything",
            other => return Err(SourceError::UnsupportedProduct(other.to_string())),
        };

        let mut repos = RepoMap::new();
        for variant in &compose.variants {
            let is_base = variant.id == base_repo_id;
            let arches = variant
                .os_trees
                .iter()
                .map(|(arch, os)| {
                    let mut paths = ArchPaths::os(os.clone());
                    if is_base {
                        let images = variant.boot_images.get(arch);
                        paths.kernel = Some(
                            images
                                .map(|i| i.kernel.clone())
                                .unwrap_or_else(|| PXEBOOT_KERNEL.to_string()),
                        );
                        paths.initrd = Some(
                            images
                                .map(|i| i.initrd.clone())
                                .unwrap_or_else(|| PXEBOOT_INITRD.to_string()),
                        );
                    }
                    (arch.clone(), paths)
                })
                .collect();
            repos.insert(variant.id.clone(), arches);
        }

        Self::new(base_repo_id, repos)
    }
}

/// Boot kernel and initrd of a compose variant
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BootImages {
    pub kernel: String,
    pub initrd: String,
}

/// A variant of a compose
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeVariant {
    pub id: String,

    /// Installation tree per architecture
    pub os_trees: BTreeMap<String, String>,

    /// Boot images per architecture (pxeboot paths if absent)
    #[serde(default)]
    pub boot_images: BTreeMap<String, BootImages>,
}

/// Compose metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComposeInfo {
    pub product: String,
    #[serde(default)]
    pub variants: Vec<ComposeVariant>,
}

/// Installation source errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SourceError {
    #[error("base repository {0} is not among the repositories")]
    MissingBaseRepo(String),

    #[error("product \"{0}\" not supported")]
    UnsupportedProduct(String),
}
