//! Git and code-hosting operations used by the isolation manager and the
//! orchestrator. Everything shells out; callers own serialization of the
//! main-repo index operations (see `worktree.rs`).

use std::process::Command;

use anyhow::{anyhow, Context, Result};

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

pub struct Git {
    pub repo_path: String,
    /// When set, pushes are refused unless origin matches this URL.
    pub allowed_remote: Option<String>,
}

impl Git {
    pub fn new(repo_path: impl Into<String>) -> Self {
        Self { repo_path: repo_path.into(), allowed_remote: None }
    }

    pub fn with_allowed_remote(mut self, remote: impl Into<String>) -> Self {
        self.allowed_remote = Some(remote.into());
        self
    }

    pub fn exec(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        let output = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn git -C {dir} {}", args.join(" ")))?;

        Ok(ExecResult {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().unwrap_or(1),
        })
    }

    fn expect_success(&self, dir: &str, args: &[&str]) -> Result<ExecResult> {
        let result = self.exec(dir, args)?;
        if !result.success() {
            return Err(anyhow!("git {} failed in {dir}: {}", args.join(" "), result.combined_output()));
        }
        Ok(result)
    }

    // ── Worktrees ─────────────────────────────────────────────────────────

    pub fn create_worktree(&self, wt_path: &str, branch: &str, base: &str) -> Result<()> {
        self.expect_success(&self.repo_path, &["worktree", "add", wt_path, "-b", branch, base])?;
        Ok(())
    }

    pub fn remove_worktree(&self, wt_path: &str) -> Result<()> {
        self.expect_success(&self.repo_path, &["worktree", "remove", "--force", wt_path])?;
        Ok(())
    }

    pub fn prune_worktrees(&self) {
        let _ = self.exec(&self.repo_path, &["worktree", "prune"]);
    }

    // ── Refs ──────────────────────────────────────────────────────────────

    pub fn fetch_origin(&self) -> Result<()> {
        self.expect_success(&self.repo_path, &["fetch", "origin"])?;
        Ok(())
    }

    pub fn rev_parse(&self, refname: &str) -> Result<String> {
        let result = self.expect_success(&self.repo_path, &["rev-parse", refname])?;
        Ok(result.stdout.trim().to_string())
    }

    pub fn branch_exists(&self, branch: &str) -> bool {
        self.exec(&self.repo_path, &["rev-parse", "--verify", branch])
            .map(|r| r.success())
            .unwrap_or(false)
    }

    pub fn delete_branch(&self, branch: &str) {
        let _ = self.exec(&self.repo_path, &["branch", "-D", branch]);
    }

    pub fn current_branch(&self, dir: &str) -> Result<String> {
        let result = self.expect_success(dir, &["rev-parse", "--abbrev-ref", "HEAD"])?;
        Ok(result.stdout.trim().to_string())
    }

    // ── Working-copy state ────────────────────────────────────────────────

    pub fn status_clean(&self, dir: &str) -> Result<bool> {
        let result = self.exec(dir, &["status", "--porcelain"])?;
        Ok(result.stdout.trim().is_empty() && result.exit_code == 0)
    }

    pub fn diff_name_only(&self, dir: &str, base: &str) -> Result<Vec<String>> {
        let result = self.expect_success(dir, &["diff", "--name-only", base])?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// New files not yet known to git; `diff` alone would miss them.
    pub fn untracked_files(&self, dir: &str) -> Result<Vec<String>> {
        let result = self.expect_success(dir, &["ls-files", "--others", "--exclude-standard"])?;
        Ok(result
            .stdout
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect())
    }

    pub fn commit_all(&self, dir: &str, message: &str) -> Result<bool> {
        self.expect_success(dir, &["add", "-A"])?;
        let status = self.exec(dir, &["status", "--porcelain"])?;
        if status.stdout.trim().is_empty() {
            return Ok(false);
        }
        self.expect_success(dir, &["commit", "-m", message])?;
        Ok(true)
    }

    pub fn reset_hard(&self, dir: &str, refname: &str) -> Result<()> {
        self.expect_success(dir, &["reset", "--hard", refname])?;
        Ok(())
    }

    // ── Merge / rebase (milestone integration) ────────────────────────────

    pub fn merge_no_ff(&self, dir: &str, branch: &str) -> Result<ExecResult> {
        self.exec(dir, &["merge", "--no-ff", branch])
    }

    pub fn abort_merge(&self, dir: &str) {
        let _ = self.exec(dir, &["merge", "--abort"]);
    }

    pub fn rebase_onto(&self, dir: &str, base: &str) -> Result<ExecResult> {
        self.exec(dir, &["rebase", base])
    }

    pub fn abort_rebase(&self, dir: &str) {
        let _ = self.exec(dir, &["rebase", "--abort"]);
    }

    pub fn checkout(&self, dir: &str, branch: &str) -> Result<()> {
        self.expect_success(dir, &["checkout", branch])?;
        Ok(())
    }

    // ── Push safety ───────────────────────────────────────────────────────

    pub fn origin_url(&self, dir: &str) -> Result<String> {
        let result = self.expect_success(dir, &["remote", "get-url", "origin"])?;
        Ok(result.stdout.trim().to_string())
    }

    /// Mandatory check before any push: the working copy's origin must be
    /// the configured remote. Mismatch aborts the operation.
    pub fn verify_allowed_remote(&self, dir: &str) -> Result<()> {
        let Some(allowed) = &self.allowed_remote else {
            return Ok(());
        };
        let origin = self.origin_url(dir)?;
        if &origin != allowed {
            return Err(anyhow!(
                "push refused: origin {origin} does not match allowed remote {allowed}"
            ));
        }
        Ok(())
    }

    pub fn push_with_upstream(&self, dir: &str, branch: &str) -> Result<()> {
        self.verify_allowed_remote(dir)?;
        self.expect_success(dir, &["push", "--set-upstream", "origin", branch])?;
        Ok(())
    }

    // ── Code hosting (gh CLI) ─────────────────────────────────────────────

    pub fn create_pr(
        &self,
        dir: &str,
        title: &str,
        body: &str,
        head: &str,
        base: &str,
        draft: bool,
    ) -> Result<String> {
        let mut args: Vec<&str> =
            vec!["pr", "create", "--title", title, "--body", body, "--head", head, "--base", base];
        if draft {
            args.push("--draft");
        }
        let output = Command::new("gh")
            .current_dir(dir)
            .args(&args)
            .output()
            .context("failed to spawn gh pr create")?;
        if !output.status.success() {
            return Err(anyhow!(
                "gh pr create failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn pr_url_for_branch(&self, dir: &str, branch: &str) -> Option<String> {
        let output = Command::new("gh")
            .current_dir(dir)
            .args(["pr", "view", branch, "--json", "url", "--jq", ".url"])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        let url = String::from_utf8_lossy(&output.stdout).trim().to_string();
        (!url.is_empty()).then_some(url)
    }
}

/// Sanitize a ticket title for use in a PR title: strip shell-hostile
/// characters and cap length, mirroring what hosting UIs tolerate.
pub fn sanitize_pr_title(title: &str) -> String {
    title
        .chars()
        .take(100)
        .map(|c| if "\"\\$`".contains(c) { ' ' } else { c })
        .collect()
}
