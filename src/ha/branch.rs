//! Branched Data
//!
//! A store whose history diverged from the master's is cleared out of the
//! way before a fresh copy is taken. The policy decides what happens to
//! the old files. Planning only lists the store directory, so each policy
//! can be checked without a running node.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::store::MESSAGES_LOG;

/// Prefix of archived store directories
pub const BRANCH_PREFIX: &str = "branched-";

/// What to do with a branched store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BranchedDataPolicy {
    /// Move the store into a new `branched-<millis>` directory
    #[default]
    KeepAll,
    /// Like `KeepAll`, then delete older archives
    KeepLast,
    /// Delete the store files
    KeepNone,
    /// Stop the node
    Shutdown,
}

/// One step of clearing a branched store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BranchAction {
    CreateDir(PathBuf),
    Move { from: PathBuf, to: PathBuf },
    Delete(PathBuf),
    Shutdown,
}

/// Result of running a plan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchOutcome {
    /// The store directory is ready for a fresh copy
    Cleared,
    /// The node must stop
    Shutdown,
}

impl BranchedDataPolicy {
    /// Steps that clear `store_dir`, archiving under `branched-<now_millis>`
    pub fn plan(self, store_dir: &Path, now_millis: i64) -> Result<Vec<BranchAction>> {
        if self == BranchedDataPolicy::Shutdown {
            return Ok(vec![BranchAction::Shutdown]);
        }

        let files = store_files(store_dir)?;
        let mut actions = Vec::new();

        match self {
            BranchedDataPolicy::KeepAll | BranchedDataPolicy::KeepLast => {
                let archive = store_dir.join(format!("{}{}", BRANCH_PREFIX, now_millis));
                actions.push(BranchAction::CreateDir(archive.clone()));
                for file in files {
                    if let Some(name) = file.file_name() {
                        let to = archive.join(name);
                        actions.push(BranchAction::Move { from: file, to });
                    }
                }
                if self == BranchedDataPolicy::KeepLast {
                    for old in archives(store_dir)? {
                        if old != archive {
                            actions.push(BranchAction::Delete(old));
                        }
                    }
                }
            }
            BranchedDataPolicy::KeepNone => {
                actions.extend(files.into_iter().map(BranchAction::Delete));
            }
            BranchedDataPolicy::Shutdown => {}
        }

        Ok(actions)
    }

    /// Plan and run in one go
    pub fn handle(self, store_dir: &Path, now_millis: i64) -> Result<BranchOutcome> {
        let actions = self.plan(store_dir, now_millis)?;
        tracing::info!(
            "Clearing {} with branched data policy {:?} ({} steps)",
            store_dir.display(),
            self,
            actions.len()
        );
        Ok(execute(&actions))
    }
}

/// Run a plan. Failed steps are logged and skipped.
pub fn execute(actions: &[BranchAction]) -> BranchOutcome {
    for action in actions {
        let result = match action {
            BranchAction::CreateDir(dir) => std::fs::create_dir_all(dir),
            BranchAction::Move { from, to } => std::fs::rename(from, to),
            BranchAction::Delete(path) if path.is_dir() => std::fs::remove_dir_all(path),
            BranchAction::Delete(path) => std::fs::remove_file(path),
            BranchAction::Shutdown => return BranchOutcome::Shutdown,
        };
        if let Err(e) = result {
            tracing::warn!("Branched data step {:?} failed: {}", action, e);
        }
    }
    BranchOutcome::Cleared
}

fn is_archive(path: &Path) -> bool {
    path.is_dir()
        && path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with(BRANCH_PREFIX))
}

/// Entries that make up the store: everything but the diagnostics log and
/// earlier archives
fn store_files(store_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !store_dir.exists() {
        return Ok(files);
    }
    for entry in std::fs::read_dir(store_dir)? {
        let path = entry?.path();
        let is_messages = path.file_name().is_some_and(|n| n == MESSAGES_LOG);
        if !is_messages && !is_archive(&path) {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

fn archives(store_dir: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    if !store_dir.exists() {
        return Ok(dirs);
    }
    for entry in std::fs::read_dir(store_dir)? {
        let path = entry?.path();
        if is_archive(&path) {
            dirs.push(path);
        }
    }
    dirs.sort();
    Ok(dirs)
}
