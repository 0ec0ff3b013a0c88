use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use crate::workflow::{SetupError, SourcePreparer};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Recording [`SourcePreparer`] that touches only the local filesystem
#[derive(Debug, Default)]
pub struct MockPreparer {
    clones: Mutex<Vec<(String, String, PathBuf)>>,
    installs: Mutex<Vec<Vec<String>>>,
    failing_repo: Option<String>,
    failing_installs: AtomicUsize,
}

impl MockPreparer {
    /// `package.json` written into every clone
    pub const PACKAGE_JSON: &'static str = r#"{
  "name": "anaconda-webui",
  "devDependencies": {
    "chrome-remote-interface": "0.33.0",
    "sizzle": "2.3.10"
  }
}"#;

    pub fn new() -> Self {
        Self::default()
    }

    /// Fail clones of `repo`.
    pub fn failing_clone(repo: impl Into<String>) -> Self {
        Self {
            failing_repo: Some(repo.into()),
            ..Self::default()
        }
    }

    /// Fail the first node package install.
    pub fn failing_install_once() -> Self {
        Self {
            failing_installs: AtomicUsize::new(1),
            ..Self::default()
        }
    }

    /// `(repo, branch, dest)` of every clone so far
    pub fn clones(&self) -> Vec<(String, String, PathBuf)> {
        lock(&self.clones).clone()
    }

    /// Package lists of every install so far
    pub fn installs(&self) -> Vec<Vec<String>> {
        lock(&self.installs).clone()
    }
}

impl SourcePreparer for MockPreparer {
    fn clone_repo(&self, repo: &str, branch: &str, dest: &Path) -> Result<(), SetupError> {
        lock(&self.clones).push((repo.to_string(), branch.to_string(), dest.to_path_buf()));
        if self.failing_repo.as_deref() == Some(repo) {
            return Err(SetupError::Clone {
                repo: repo.to_string(),
                reason: "scripted failure".to_string(),
            });
        }
        let occupied = fs::read_dir(dest).map_or(false, |mut d| d.next().is_some());
        if occupied {
            return Err(SetupError::Clone {
                repo: repo.to_string(),
                reason: format!("destination path '{}' already exists and is not an empty directory", dest.display()),
            });
        }
        fs::create_dir_all(dest.join("test").join("common"))?;
        let webui = dest.join("ui").join("webui");
        fs::create_dir_all(&webui)?;
        fs::write(webui.join("package.json"), Self::PACKAGE_JSON)?;
        Ok(())
    }

    fn install_node_packages(&self, packages: &[String], dest: &Path) -> Result<(), SetupError> {
        lock(&self.installs).push(packages.to_vec());
        let failing = self
            .failing_installs
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(SetupError::Dependencies("scripted npm failure".to_string()));
        }
        fs::create_dir_all(dest.join("node_modules"))?;
        Ok(())
    }
}
