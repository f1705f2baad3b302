//! Per-ticket working copies and the milestone integration branch.
//!
//! Creation, branching, and removal of working copies all mutate the main
//! repo's index, which git does not make safe to overlap; every such
//! operation holds the process-wide repo mutex. Work *inside* a working
//! copy runs in parallel across tickets without the lock.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::git::Git;

#[derive(Debug, Clone)]
pub struct Worktree {
    pub ticket_id: String,
    pub path: PathBuf,
    pub branch: String,
}

pub struct WorktreeManager {
    git: Arc<Git>,
    repo_root: PathBuf,
    base_branch: String,
    milestone_branch: String,
    /// Serializes main-repo index mutations (worktree add/remove, fetch,
    /// branch creation, milestone merges).
    repo_mutex: Mutex<()>,
}

impl WorktreeManager {
    pub fn new(git: Arc<Git>, repo_root: impl Into<PathBuf>, base_branch: &str, milestone_branch: &str) -> Self {
        Self {
            git,
            repo_root: repo_root.into(),
            base_branch: base_branch.to_string(),
            milestone_branch: milestone_branch.to_string(),
            repo_mutex: Mutex::new(()),
        }
    }

    fn worktrees_dir(&self) -> PathBuf {
        self.repo_root.join(".promptwheel").join("worktrees")
    }

    fn milestone_dir(&self) -> PathBuf {
        self.repo_root.join(".promptwheel").join("milestone")
    }

    pub fn branch_for(&self, ticket_id: &str) -> String {
        format!("ticket/{ticket_id}")
    }

    /// Acquire a fresh working copy for a ticket from a clean checkout of
    /// the base branch. Any stale worktree or branch from a prior attempt
    /// is removed first.
    pub async fn acquire(&self, ticket_id: &str) -> Result<Worktree> {
        let branch = self.branch_for(ticket_id);
        let wt_path = self.worktrees_dir().join(ticket_id);
        let wt_str = wt_path.to_string_lossy().to_string();

        let _guard = self.repo_mutex.lock().await;

        std::fs::create_dir_all(self.worktrees_dir()).ok();
        if self.git.fetch_origin().is_err() {
            warn!(ticket_id, "fetch before worktree creation failed; using local base");
        }

        let _ = self.git.remove_worktree(&wt_str);
        std::fs::remove_dir_all(&wt_path).ok();
        self.git.prune_worktrees();
        self.git.delete_branch(&branch);

        let base = if self.git.branch_exists(&format!("origin/{}", self.base_branch)) {
            format!("origin/{}", self.base_branch)
        } else {
            self.base_branch.clone()
        };
        self.git
            .create_worktree(&wt_str, &branch, &base)
            .with_context(|| format!("create worktree for ticket {ticket_id}"))?;

        info!(ticket_id, branch, path = %wt_str, "acquired working copy");
        Ok(Worktree { ticket_id: ticket_id.to_string(), path: wt_path, branch })
    }

    /// Remove a ticket's working copy; best-effort, never fails the run.
    pub async fn release(&self, worktree: &Worktree) {
        let _guard = self.repo_mutex.lock().await;
        let wt_str = worktree.path.to_string_lossy().to_string();
        if let Err(e) = self.git.remove_worktree(&wt_str) {
            warn!(ticket_id = %worktree.ticket_id, "remove_worktree: {e}");
        }
        std::fs::remove_dir_all(&worktree.path).ok();
        self.git.prune_worktrees();
        info!(ticket_id = %worktree.ticket_id, "released working copy");
    }

    /// Ensure the milestone working copy exists on the milestone branch.
    /// Idempotent: an existing directory is force-removed first.
    pub async fn ensure_milestone(&self) -> Result<PathBuf> {
        let dir = self.milestone_dir();
        let dir_str = dir.to_string_lossy().to_string();

        let _guard = self.repo_mutex.lock().await;

        if dir.exists() {
            let _ = self.git.remove_worktree(&dir_str);
            std::fs::remove_dir_all(&dir).ok();
            self.git.prune_worktrees();
        }
        self.git.delete_branch(&self.milestone_branch);

        let base = if self.git.branch_exists(&format!("origin/{}", self.base_branch)) {
            format!("origin/{}", self.base_branch)
        } else {
            self.base_branch.clone()
        };
        self.git
            .create_worktree(&dir_str, &self.milestone_branch, &base)
            .context("create milestone worktree")?;
        info!(branch = %self.milestone_branch, "milestone branch ready");
        Ok(dir)
    }

    /// Merge a completed ticket branch onto the milestone. First try a
    /// non-fast-forward merge; on failure abort it and retry by rebasing
    /// the ticket branch onto the current milestone tip, then merging
    /// again. Both failure paths leave the milestone clean.
    pub async fn integrate(&self, worktree: &Worktree) -> Result<()> {
        let milestone_dir = self.milestone_dir();
        if !milestone_dir.exists() {
            return Err(anyhow!("milestone worktree missing; call ensure_milestone first"));
        }
        let milestone_str = milestone_dir.to_string_lossy().to_string();
        let ticket_dir = worktree.path.to_string_lossy().to_string();

        let _guard = self.repo_mutex.lock().await;

        let first = self.git.merge_no_ff(&milestone_str, &worktree.branch)?;
        if first.success() {
            info!(branch = %worktree.branch, "merged onto milestone");
            return Ok(());
        }
        self.git.abort_merge(&milestone_str);

        let rebase = self.git.rebase_onto(&ticket_dir, &self.milestone_branch)?;
        if !rebase.success() {
            self.git.abort_rebase(&ticket_dir);
            return Err(anyhow!(
                "milestone integration failed for {}: merge and rebase both conflicted: {}",
                worktree.branch,
                rebase.combined_output()
            ));
        }

        let second = self.git.merge_no_ff(&milestone_str, &worktree.branch)?;
        if !second.success() {
            self.git.abort_merge(&milestone_str);
            return Err(anyhow!(
                "milestone integration failed for {} after rebase: {}",
                worktree.branch,
                second.combined_output()
            ));
        }
        info!(branch = %worktree.branch, "merged onto milestone after rebase");
        Ok(())
    }

    pub fn milestone_branch(&self) -> &str {
        &self.milestone_branch
    }

    pub fn base_branch(&self) -> &str {
        &self.base_branch
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init_repo(dir: &std::path::Path) -> Arc<Git> {
        let git = Git::new(dir.to_string_lossy().to_string());
        let run = |args: &[&str]| {
            let out = git.exec(&git.repo_path, args).expect("git");
            assert!(out.success(), "git {args:?}: {}", out.combined_output());
        };
        run(&["init", "-b", "main"]);
        run(&["config", "user.email", "test@example.com"]);
        run(&["config", "user.name", "Test"]);
        std::fs::write(dir.join("base.txt"), "base\n").expect("write");
        run(&["add", "-A"]);
        run(&["commit", "-m", "init"]);
        Arc::new(git)
    }

    #[tokio::test]
    async fn acquire_creates_isolated_branch_and_release_cleans_up() {
        let dir = tempfile::tempdir().expect("tempdir");
        let git = init_repo(dir.path());
        let manager = WorktreeManager::new(Arc::clone(&git), dir.path(), "main", "promptwheel/milestone");

        let wt = manager.acquire("tck_1").await.expect("acquire");
        assert!(wt.path.join("base.txt").exists());
        assert_eq!(git.current_branch(&wt.path.to_string_lossy()).expect("branch"), "ticket/tck_1");

        // Acquire is idempotent for the same ticket.
        let wt2 = manager.acquire("tck_1").await.expect("re-acquire");
        assert!(wt2.path.join("base.txt").exists());

        manager.release(&wt2).await;
        assert!(!wt2.path.exists());
    }

    #[tokio::test]
    async fn disjoint_edits_integrate_cleanly() {
        let dir = tempfile::tempdir().expect("tempdir");
        let git = init_repo(dir.path());
        let manager = WorktreeManager::new(Arc::clone(&git), dir.path(), "main", "promptwheel/milestone");
        manager.ensure_milestone().await.expect("milestone");

        let wt_a = manager.acquire("tck_a").await.expect("acquire a");
        std::fs::write(wt_a.path.join("a.txt"), "a\n").expect("write");
        git.commit_all(&wt_a.path.to_string_lossy(), "ticket a").expect("commit");

        let wt_b = manager.acquire("tck_b").await.expect("acquire b");
        std::fs::write(wt_b.path.join("b.txt"), "b\n").expect("write");
        git.commit_all(&wt_b.path.to_string_lossy(), "ticket b").expect("commit");

        manager.integrate(&wt_a).await.expect("integrate a");
        manager.integrate(&wt_b).await.expect("integrate b");

        let milestone = dir.path().join(".promptwheel/milestone");
        assert!(milestone.join("a.txt").exists());
        assert!(milestone.join("b.txt").exists());
    }

    #[tokio::test]
    async fn conflicting_edits_leave_milestone_clean() {
        let dir = tempfile::tempdir().expect("tempdir");
        let git = init_repo(dir.path());
        let manager = WorktreeManager::new(Arc::clone(&git), dir.path(), "main", "promptwheel/milestone");
        manager.ensure_milestone().await.expect("milestone");

        let wt_a = manager.acquire("tck_a").await.expect("acquire a");
        std::fs::write(wt_a.path.join("base.txt"), "version a\n").expect("write");
        git.commit_all(&wt_a.path.to_string_lossy(), "ticket a").expect("commit");

        let wt_b = manager.acquire("tck_b").await.expect("acquire b");
        std::fs::write(wt_b.path.join("base.txt"), "version b\n").expect("write");
        git.commit_all(&wt_b.path.to_string_lossy(), "ticket b").expect("commit");

        manager.integrate(&wt_a).await.expect("integrate a");
        let err = manager.integrate(&wt_b).await.expect_err("b must conflict");
        assert!(err.to_string().contains("milestone integration failed"));

        let milestone_dir = dir.path().join(".promptwheel/milestone");
        assert!(git.status_clean(&milestone_dir.to_string_lossy()).expect("status"));
    }
}
