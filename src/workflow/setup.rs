//! Branch sources: installer tree, test framework and node packages
//!
//! Layout of a branch directory:
//!
//! ```text
//! <branch dir>/anaconda/                     installer sources
//! <branch dir>/anaconda/ui/webui/test/common cockpit test framework
//! <branch dir>/anaconda/ui/webui/bots        cockpit bots
//! <branch dir>/anaconda/ui/webui/node_modules
//! <branch dir>/<test repo name>/             optional test repository
//! ```

use serde_json::Value;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use walkdir::WalkDir;

use vmlane_virt::{CommandRunner, CommandSpec, ContainerRun, VolumeMode};

use super::error::SetupError;
use super::ExecutionMode;

/// Node packages needed to drive the browser, pinned from `package.json`
pub const NODE_PACKAGES: &[&str] = &["chrome-remote-interface", "sizzle"];

/// Paths inside a branch directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchLayout {
    root: PathBuf,
}

impl BranchLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn anaconda_dir(&self) -> PathBuf {
        self.root.join("anaconda")
    }

    pub fn webui_dir(&self) -> PathBuf {
        self.anaconda_dir().join("ui").join("webui")
    }

    /// Value of `WEBUI_TEST_DIR` for test scripts
    pub fn webui_test_dir(&self) -> PathBuf {
        self.webui_dir().join("test")
    }

    pub fn cockpit_common_dir(&self) -> PathBuf {
        self.webui_test_dir().join("common")
    }

    pub fn bots_dir(&self) -> PathBuf {
        self.webui_dir().join("bots")
    }

    pub fn test_repo_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }
}

/// Repositories a branch directory is assembled from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchSources {
    pub anaconda_repo: String,
    pub branch: String,
    pub cockpit_repo: String,
    pub cockpit_branch: String,
    pub bots_repo: String,
    pub bots_branch: String,
}

/// Fetches sources and packages into a branch directory
pub trait SourcePreparer: Send + Sync {
    /// Shallow clone of `branch` of `repo` into `dest`.
    fn clone_repo(&self, repo: &str, branch: &str, dest: &Path) -> Result<(), SetupError>;

    /// Install `packages` (`name@version`) into `dest/node_modules`.
    fn install_node_packages(&self, packages: &[String], dest: &Path) -> Result<(), SetupError>;
}

/// [`SourcePreparer`] running `git` and `npm`
pub struct CommandPreparer {
    runner: Arc<dyn CommandRunner>,
    mode: ExecutionMode,
}

impl CommandPreparer {
    pub fn new(runner: Arc<dyn CommandRunner>, mode: ExecutionMode) -> Self {
        Self { runner, mode }
    }
}

impl SourcePreparer for CommandPreparer {
    fn clone_repo(&self, repo: &str, branch: &str, dest: &Path) -> Result<(), SetupError> {
        let cmd = CommandSpec::new("git")
            .args(["clone", "--depth", "1", "-b", branch, repo])
            .arg(dest.display().to_string());
        tracing::info!(repo, branch, dest = %dest.display(), "cloning");
        self.runner
            .checked(&cmd)
            .map_err(|e| SetupError::Clone {
                repo: repo.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }

    fn install_node_packages(&self, packages: &[String], dest: &Path) -> Result<(), SetupError> {
        // Same filesystem as dest so node_modules can be renamed into place.
        let scratch = tempfile::Builder::new().prefix("npm.").tempdir_in(dest)?;
        let mut argv = vec!["npm".to_string(), "install".to_string(), "--no-save".to_string()];
        argv.extend(packages.iter().cloned());
        tracing::info!(packages = %packages.join(" "), "installing node packages");

        match self.mode {
            ExecutionMode::Host => {
                let cmd = CommandSpec::new("npm")
                    .args(argv.iter().skip(1).cloned())
                    .cwd(scratch.path());
                self.runner
                    .checked(&cmd)
                    .map_err(|e| SetupError::Dependencies(e.to_string()))?;
            }
            ExecutionMode::Container(ref container) => {
                let run = ContainerRun::new(scratch.path(), argv).mode(VolumeMode::Private);
                let out = container
                    .exec(&run)
                    .map_err(|e| SetupError::Dependencies(e.to_string()))?;
                if !out.success() {
                    return Err(SetupError::Dependencies(format!(
                        "npm install exited with {:?}",
                        out.code
                    )));
                }
            }
        }

        let installed = scratch.path().join("node_modules");
        if !installed.is_dir() {
            return Err(SetupError::Dependencies(
                "npm install produced no node_modules".to_string(),
            ));
        }
        let target = dest.join("node_modules");
        if target.exists() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(&installed, &target)?;
        Ok(())
    }
}

/// Pinned `name@version` specs of [`NODE_PACKAGES`] from `package.json`.
pub fn node_package_specs(package_json: &Path) -> Result<Vec<String>, SetupError> {
    let contents = fs::read_to_string(package_json).map_err(|e| {
        SetupError::Dependencies(format!("{}: {}", package_json.display(), e))
    })?;
    let package: Value = serde_json::from_str(&contents)
        .map_err(|e| SetupError::Dependencies(format!("{}: {}", package_json.display(), e)))?;

    NODE_PACKAGES
        .iter()
        .map(|name| {
            package["devDependencies"][*name]
                .as_str()
                .map(|version| format!("{}@{}", name, version))
                .ok_or_else(|| {
                    SetupError::Dependencies(format!("{} missing from devDependencies", name))
                })
        })
        .collect()
}

/// Copy a directory tree, keeping symlinks as symlinks.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<()> {
    for entry in WalkDir::new(src).follow_links(false) {
        let entry = entry.map_err(io::Error::other)?;
        let rel = entry.path().strip_prefix(src).map_err(io::Error::other)?;
        let target = dest.join(rel);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            let link = fs::read_link(entry.path())?;
            #[cfg(unix)]
            std::os::unix::fs::symlink(&link, &target)?;
            #[cfg(not(unix))]
            tracing::warn!(path = %entry.path().display(), link = %link.display(), "skipping symlink");
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Remove everything inside `dir`, keeping `dir` itself.
fn clear_dir(dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

/// Assemble a fresh branch directory.
///
/// Leftovers of an earlier failed attempt are removed first. The installer
/// tree is cloned (or copied for `file://` URLs); the test framework and
/// bots are fetched only if the tree does not carry them.
pub fn prepare_branch(
    preparer: &dyn SourcePreparer,
    layout: &BranchLayout,
    sources: &BranchSources,
) -> Result<(), SetupError> {
    if layout.root().is_dir() {
        clear_dir(layout.root())?;
    }
    let anaconda_dir = layout.anaconda_dir();
    match sources.anaconda_repo.strip_prefix("file://") {
        Some(path) => {
            tracing::info!(src = path, "copying installer sources");
            copy_tree(Path::new(path), &anaconda_dir).map_err(|e| SetupError::Clone {
                repo: sources.anaconda_repo.clone(),
                reason: e.to_string(),
            })?;
        }
        None => preparer.clone_repo(&sources.anaconda_repo, &sources.branch, &anaconda_dir)?,
    }

    let common = layout.cockpit_common_dir();
    if !common.exists() {
        let scratch = tempfile::Builder::new()
            .prefix("cockpit.")
            .tempdir_in(layout.root())?;
        let checkout = scratch.path().join("cockpit");
        preparer.clone_repo(&sources.cockpit_repo, &sources.cockpit_branch, &checkout)?;
        if let Some(parent) = common.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(checkout.join("test").join("common"), &common)?;
    }

    let bots = layout.bots_dir();
    if !bots.exists() {
        preparer.clone_repo(&sources.bots_repo, &sources.bots_branch, &bots)?;
    }

    let webui_dir = layout.webui_dir();
    let packages = node_package_specs(&webui_dir.join("package.json"))?;
    preparer.install_node_packages(&packages, &webui_dir)
}

/// Clone the test repository `name` into the branch directory unless present.
pub fn ensure_test_repo(
    preparer: &dyn SourcePreparer,
    layout: &BranchLayout,
    name: &str,
    url: &str,
    branch: &str,
) -> Result<PathBuf, SetupError> {
    let dir = layout.test_repo_dir(name);
    if !dir.is_dir() {
        preparer.clone_repo(url, branch, &dir)?;
    }
    Ok(dir)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockPreparer;
    use tempfile::TempDir;
    use vmlane_virt::mock::{MockResponse, MockRunner};

    fn sources(anaconda_repo: &str) -> BranchSources {
        BranchSources {
            anaconda_repo: anaconda_repo.to_string(),
            branch: "main".to_string(),
            cockpit_repo: "https://example.com/cockpit".to_string(),
            cockpit_branch: "main".to_string(),
            bots_repo: "https://example.com/bots".to_string(),
            bots_branch: "main".to_string(),
        }
    }

    #[test]
    fn test_prepare_branch_fetches_everything() {
        let root = TempDir::new().unwrap();
        let layout = BranchLayout::new(root.path());
        let preparer = MockPreparer::new();

        prepare_branch(&preparer, &layout, &sources("https://example.com/anaconda")).unwrap();

        let clones = preparer.clones();
        assert_eq!(clones.len(), 3);
        assert_eq!(clones[0].0, "https://example.com/anaconda");
        assert_eq!(clones[0].2, layout.anaconda_dir());
        assert_eq!(clones[1].0, "https://example.com/cockpit");
        assert_eq!(clones[2].2, layout.bots_dir());
        assert!(layout.cockpit_common_dir().is_dir());
        assert_eq!(
            preparer.installs(),
            vec![vec![
                "chrome-remote-interface@0.33.0".to_string(),
                "sizzle@2.3.10".to_string()
            ]]
        );
        assert!(layout.webui_dir().join("node_modules").is_dir());
    }

    #[test]
    fn test_file_source_copied_and_bundled_dirs_kept() {
        let src = TempDir::new().unwrap();
        let webui = src.path().join("ui/webui");
        fs::create_dir_all(webui.join("test/common")).unwrap();
        fs::create_dir_all(webui.join("bots")).unwrap();
        fs::write(webui.join("test/common/testlib.py"), "# lib").unwrap();
        fs::write(
            webui.join("package.json"),
            MockPreparer::PACKAGE_JSON,
        )
        .unwrap();
        #[cfg(unix)]
        std::os::unix::fs::symlink("missing-target", src.path().join("dangling")).unwrap();

        let root = TempDir::new().unwrap();
        let layout = BranchLayout::new(root.path());
        let preparer = MockPreparer::new();
        let url = format!("file://{}", src.path().display());

        prepare_branch(&preparer, &layout, &sources(&url)).unwrap();

        assert!(preparer.clones().is_empty());
        assert_eq!(
            fs::read_to_string(layout.cockpit_common_dir().join("testlib.py")).unwrap(),
            "# lib"
        );
        #[cfg(unix)]
        assert!(fs::symlink_metadata(layout.anaconda_dir().join("dangling"))
            .unwrap()
            .file_type()
            .is_symlink());
        assert_eq!(preparer.installs().len(), 1);
    }

    #[test]
    fn test_prepare_branch_retry_after_failed_install() {
        let root = TempDir::new().unwrap();
        let layout = BranchLayout::new(root.path());
        let preparer = MockPreparer::failing_install_once();
        let sources = sources("https://example.com/anaconda");

        let err = prepare_branch(&preparer, &layout, &sources).unwrap_err();
        assert!(matches!(err, SetupError::Dependencies(_)));
        assert!(layout.anaconda_dir().is_dir());

        prepare_branch(&preparer, &layout, &sources).unwrap();
        assert_eq!(preparer.clones().len(), 6);
        assert_eq!(preparer.installs().len(), 2);
        assert!(layout.webui_dir().join("node_modules").is_dir());
    }

    #[test]
    fn test_missing_dev_dependency() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("package.json");
        fs::write(&path, r#"{"devDependencies": {"sizzle": "2.3.10"}}"#).unwrap();
        let err = node_package_specs(&path).unwrap_err();
        assert!(err.to_string().contains("chrome-remote-interface"));
    }

    #[test]
    fn test_test_repo_cloned_once() {
        let root = TempDir::new().unwrap();
        let layout = BranchLayout::new(root.path());
        let preparer = MockPreparer::new();

        let dir = ensure_test_repo(&preparer, &layout, "my-tests", "https://example.com/t", "main")
            .unwrap();
        assert_eq!(dir, root.path().join("my-tests"));
        ensure_test_repo(&preparer, &layout, "my-tests", "https://example.com/t", "main").unwrap();
        assert_eq!(preparer.clones().len(), 1);
    }

    #[test]
    fn test_command_preparer_clone() {
        let runner = Arc::new(MockRunner::new());
        let preparer = CommandPreparer::new(runner.clone(), ExecutionMode::Host);
        preparer
            .clone_repo("https://example.com/bots", "main", Path::new("/tmp/b/bots"))
            .unwrap();
        assert_eq!(
            runner.argvs()[0],
            vec!["git", "clone", "--depth", "1", "-b", "main", "https://example.com/bots", "/tmp/b/bots"]
        );

        runner.respond(&["git", "clone"], MockResponse::fail(128, "fatal: repository not found"));
        let err = preparer
            .clone_repo("https://example.com/nope", "main", Path::new("/tmp/b/x"))
            .unwrap_err();
        assert!(matches!(err, SetupError::Clone { .. }));
    }

    #[test]
    fn test_command_preparer_npm_without_output() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(MockRunner::new());
        let preparer = CommandPreparer::new(runner.clone(), ExecutionMode::Host);
        let err = preparer
            .install_node_packages(&["sizzle@2.3.10".to_string()], dir.path())
            .unwrap_err();
        assert!(matches!(err, SetupError::Dependencies(_)));

        let calls = runner.calls_matching(&["npm", "install", "--no-save"]);
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].args.last().unwrap(), "sizzle@2.3.10");
        assert!(calls[0].cwd.as_ref().unwrap().starts_with(dir.path()));
    }
}
