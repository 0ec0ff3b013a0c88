//! Shared per-branch setup
//!
//! Web UI tests of the same installer branch share one working directory
//! holding the source tree, test framework and node packages. The registry
//! counts the participants of every branch; the directory is created by the
//! first participant and removed when the last one leaves.
//!
//! All access goes through [`SetupRegistry::lock`], which is also the setup
//! lock serializing workflow setup.

use std::collections::btree_map::Entry;
use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tempfile::TempDir;

/// Prefix of per-branch working directories
pub const BRANCH_DIR_PREFIX: &str = "vmlane_webui_";

struct BranchSetup {
    participants: BTreeSet<String>,
    dir: TempDir,
    prepared: bool,
}

#[derive(Default)]
struct RegistryState {
    branches: BTreeMap<String, BranchSetup>,
}

/// Reference-counted per-branch setup state behind the setup lock
pub struct SetupRegistry {
    temp_base: PathBuf,
    state: Mutex<RegistryState>,
}

/// Result of joining a branch
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BranchMembership {
    /// Shared working directory of the branch
    pub dir: PathBuf,
    /// Whether the branch sources still have to be prepared
    pub needs_prepare: bool,
}

/// Result of leaving a branch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Departure {
    /// The branch directory was removed
    pub removed_dir: bool,
    /// No participants remain in any branch
    pub registry_empty: bool,
}

impl SetupRegistry {
    /// Registry creating branch directories under `temp_base`.
    pub fn new(temp_base: impl Into<PathBuf>) -> Self {
        Self {
            temp_base: temp_base.into(),
            state: Mutex::new(RegistryState::default()),
        }
    }

    pub fn temp_base(&self) -> &Path {
        &self.temp_base
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        matches!(self.state.try_lock(), Err(std::sync::TryLockError::WouldBlock))
    }

    /// Take the setup lock.
    pub fn lock(&self) -> SetupGuard<'_> {
        SetupGuard {
            temp_base: &self.temp_base,
            state: self.state.lock().unwrap_or_else(|e| e.into_inner()),
        }
    }
}

/// Held setup lock
pub struct SetupGuard<'a> {
    temp_base: &'a Path,
    state: MutexGuard<'a, RegistryState>,
}

impl SetupGuard<'_> {
    /// Add `participant` to `branch`, creating the branch directory if needed.
    pub fn join(&mut self, branch: &str, participant: &str) -> io::Result<BranchMembership> {
        let temp_base = self.temp_base;
        let setup = match self.state.branches.entry(branch.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let dir = tempfile::Builder::new()
                    .prefix(BRANCH_DIR_PREFIX)
                    .tempdir_in(temp_base)?;
                tracing::debug!(branch, dir = %dir.path().display(), "created branch directory");
                entry.insert(BranchSetup {
                    participants: BTreeSet::new(),
                    dir,
                    prepared: false,
                })
            }
        };
        setup.participants.insert(participant.to_string());
        Ok(BranchMembership {
            dir: setup.dir.path().to_path_buf(),
            needs_prepare: !setup.prepared,
        })
    }

    /// Record that the sources of `branch` are in place.
    pub fn mark_prepared(&mut self, branch: &str) {
        if let Some(setup) = self.state.branches.get_mut(branch) {
            setup.prepared = true;
        }
    }

    /// Remove `participant` from `branch`.
    ///
    /// The last participant of a branch removes its directory; removal
    /// failures are logged.
    pub fn leave(&mut self, branch: &str, participant: &str) -> Departure {
        let Some(setup) = self.state.branches.get_mut(branch) else {
            tracing::warn!(branch, participant, "leaving unknown branch");
            return Departure {
                removed_dir: false,
                registry_empty: self.is_empty(),
            };
        };
        setup.participants.remove(participant);

        let mut removed_dir = false;
        if setup.participants.is_empty() {
            if let Some(setup) = self.state.branches.remove(branch) {
                let path = setup.dir.path().display().to_string();
                match setup.dir.close() {
                    Ok(()) => {
                        tracing::info!(branch, dir = %path, "removed branch directory");
                        removed_dir = true;
                    }
                    Err(e) => {
                        tracing::error!(branch, dir = %path, error = %e, "failed to remove branch directory")
                    }
                }
            }
        }

        Departure {
            removed_dir,
            registry_empty: self.is_empty(),
        }
    }

    pub fn participants(&self, branch: &str) -> usize {
        self.state
            .branches
            .get(branch)
            .map_or(0, |s| s.participants.len())
    }

    pub fn is_empty(&self) -> bool {
        self.state.branches.is_empty()
    }
}
