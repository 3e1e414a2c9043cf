use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;
use tracing::info;

pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl ExecResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn combined_output(&self) -> String {
        if self.stderr.is_empty() {
            self.stdout.clone()
        } else {
            format!("{}\n{}", self.stdout, self.stderr)
        }
    }
}

/// Outcome of a single cherry-pick attempt. A conflict leaves the tree at
/// the pre-conflict head (the failed pick is aborted, prior picks remain).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CherryPickOutcome {
    Picked,
    Conflict { sha: String, details: String },
}

/// Single on-disk working tree shared by all actors. At most one git
/// operation is in flight at a time; the lock is held only around the git
/// subprocess, never across network calls.
pub struct GitWorkspace {
    repo_path: PathBuf,
    lock: Mutex<()>,
}

impl GitWorkspace {
    pub fn new(repo_path: impl Into<PathBuf>) -> Self {
        Self { repo_path: repo_path.into(), lock: Mutex::new(()) }
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    fn exec(&self, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(&self.repo_path)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn git {}", args.join(" ")))?;
        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn exec_ok(&self, args: &[&str]) -> Result<ExecResult> {
        let result = self.exec(args)?;
        if !result.success() {
            return Err(anyhow!("git {} failed: {}", args.join(" "), result.combined_output()));
        }
        Ok(result)
    }

    pub async fn fetch(&self) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.exec_ok(&["fetch", "origin", "--prune"])?;
        Ok(())
    }

    /// Check out `branch` tracking its origin state, discarding any local
    /// divergence (the forge is the source of truth).
    pub async fn checkout_branch(&self, branch: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let remote = format!("origin/{branch}");
        self.exec_ok(&["checkout", "-B", branch, &remote])?;
        Ok(())
    }

    /// Create (or reset) a local branch at `start` and check it out.
    pub async fn create_branch_at(&self, branch: &str, start: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.exec_ok(&["checkout", "-B", branch, start])?;
        Ok(())
    }

    /// Rebase the current branch onto the latest fetched target head.
    /// Conflicts abort the rebase and surface as an error.
    pub async fn rebase_onto(&self, target_branch: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let onto = format!("origin/{target_branch}");
        let result = self.exec(&["rebase", &onto])?;
        if !result.success() {
            let _ = self.exec(&["rebase", "--abort"]);
            return Err(anyhow!(
                "rebase onto {onto} failed: {}",
                result.combined_output()
            ));
        }
        Ok(())
    }

    /// Cherry-pick one commit onto the current branch. On conflict the pick
    /// is aborted so the tree stays at the pre-conflict head.
    pub async fn cherry_pick(&self, sha: &str) -> Result<CherryPickOutcome> {
        let _guard = self.lock.lock().await;
        let result = self.exec(&["cherry-pick", "-x", sha])?;
        if result.success() {
            return Ok(CherryPickOutcome::Picked);
        }
        let _ = self.exec(&["cherry-pick", "--abort"]);
        info!("cherry-pick of {sha} conflicted, aborted");
        Ok(CherryPickOutcome::Conflict {
            sha: sha.to_string(),
            details: result.combined_output(),
        })
    }

    pub async fn push(&self, branch: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.exec_ok(&["push", "origin", branch])?;
        Ok(())
    }

    /// Force-push, used after a rebase rewrote the source branch.
    pub async fn push_force(&self, branch: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        self.exec_ok(&["push", "--force", "origin", branch])?;
        Ok(())
    }

    pub async fn head_sha(&self) -> Result<String> {
        let _guard = self.lock.lock().await;
        let result = self.exec_ok(&["rev-parse", "HEAD"])?;
        Ok(result.stdout.trim().to_string())
    }

    /// Remote head of a branch via `git ls-remote`, without fetching.
    pub async fn ls_remote_head(&self, branch: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        let refspec = format!("refs/heads/{branch}");
        let result = self.exec_ok(&["ls-remote", "origin", &refspec])?;
        Ok(result
            .stdout
            .split_whitespace()
            .next()
            .filter(|s| !s.is_empty())
            .map(str::to_string))
    }

    /// Would rebasing `source` onto the current `target` head change the
    /// source tree? True only when the merge base would move and that
    /// movement carries a non-empty tree diff. Read-only plumbing; feeds
    /// the projector's "rebase affects the changes" signal.
    pub async fn rebase_would_change(&self, source: &str, target: &str) -> Result<bool> {
        let _guard = self.lock.lock().await;
        let source_ref = format!("origin/{source}");
        let target_ref = format!("origin/{target}");
        let base = self
            .exec_ok(&["merge-base", &source_ref, &target_ref])?
            .stdout
            .trim()
            .to_string();
        let target_head = self
            .exec_ok(&["rev-parse", &target_ref])?
            .stdout
            .trim()
            .to_string();
        if base == target_head {
            return Ok(false);
        }
        // Exit 0: identical trees (e.g. empty commits on the target), so a
        // rebase cannot alter the pre-rebase tree.
        let diff = self.exec(&["diff", "--quiet", &base, &target_head])?;
        match diff.exit_code {
            0 => Ok(false),
            1 => Ok(true),
            _ => Err(anyhow!(
                "git diff --quiet {base} {target_head} failed: {}",
                diff.combined_output()
            )),
        }
    }
}
