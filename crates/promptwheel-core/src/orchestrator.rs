//! Drives a single ticket through scout-assigned work:
//! plan → execute → verify → integrate. One attempt per call; the session
//! owns the retry ladder and the ticket's store transitions.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentBackend, AgentInvocation, AgentOutput, AgentStreamEvent};
use crate::config::Config;
use crate::git::{sanitize_pr_title, Git};
use crate::ledger::{ArtifactStore, ArtifactType};
use crate::recovery::{analyze, FailureContext, RecoveryAction};
use crate::scope::{
    content_has_credentials, derive_scope_policy, is_file_allowed, validate_plan_scope,
    ScopePolicy, ScopePolicyInput,
};
use crate::spindle::{Spindle, SpindleReport, SpindleThresholds, SpindleTrigger};
use crate::store::Store;
use crate::types::{
    EngineEvent, FailureKind, Learning, RunEventType, RunFailure, RunStatus, StepKind, StepStatus,
    Ticket,
};
use crate::worktree::{Worktree, WorktreeManager};

const STDOUT_TAIL_BYTES: usize = 4_000;

/// What one attempt produced. The session maps this onto ticket status.
#[derive(Debug)]
pub enum TicketOutcome {
    Completed { pr_url: Option<String> },
    Failed { failure: RunFailure, spindle_trigger: Option<SpindleTrigger>, recovery: RecoveryAction },
}

pub struct Orchestrator {
    pub store: Arc<Store>,
    pub config: Arc<Config>,
    pub worktrees: Arc<WorktreeManager>,
    pub git: Arc<Git>,
    pub artifacts: Arc<ArtifactStore>,
    pub events: broadcast::Sender<EngineEvent>,
}

/// A structured plan the agent must produce before editing.
#[derive(Debug, Clone, Deserialize)]
struct AgentPlan {
    files: Vec<String>,
    estimated_lines: usize,
    #[serde(default = "default_risk")]
    risk: String,
}

fn default_risk() -> String {
    "medium".to_string()
}

impl Orchestrator {
    /// Run one attempt of a ticket. The ticket is already `in_progress`
    /// and the run row already `running`; this call owns run events, run
    /// steps, artifacts, and the working copy lifecycle.
    pub async fn run_ticket(
        &self,
        ticket: &Ticket,
        run_id: &str,
        attempt: i64,
        backend: Arc<dyn AgentBackend>,
        learnings: &[Learning],
        index_block: &str,
        cancel: CancellationToken,
    ) -> Result<TicketOutcome> {
        let worktree = match self.worktrees.acquire(&ticket.id).await {
            Ok(wt) => wt,
            Err(e) => {
                return Ok(self.fail(
                    ticket,
                    FailureKind::GitError,
                    format!("working copy acquisition failed: {e:#}"),
                    None,
                ));
            }
        };

        let policy = derive_scope_policy(&ScopePolicyInput {
            allowed_paths: &ticket.allowed_paths,
            category: &ticket.category,
            max_lines_per_ticket: self.config.max_lines_per_ticket,
            worktree_root: Some(&worktree.path.to_string_lossy()),
            learnings: Some(learnings),
        });

        let outcome = self
            .drive(ticket, run_id, attempt, &worktree, &policy, backend, learnings, index_block, cancel)
            .await;

        if !matches!(outcome, Ok(TicketOutcome::Completed { .. })) {
            self.worktrees.release(&worktree).await;
        }
        outcome
    }

    #[allow(clippy::too_many_arguments)]
    async fn drive(
        &self,
        ticket: &Ticket,
        run_id: &str,
        attempt: i64,
        worktree: &Worktree,
        policy: &ScopePolicy,
        backend: Arc<dyn AgentBackend>,
        learnings: &[Learning],
        index_block: &str,
        cancel: CancellationToken,
    ) -> Result<TicketOutcome> {
        // ── PlanPending ──────────────────────────────────────────────────
        let mut effective_policy = policy.clone();
        if effective_policy.plan_required {
            match self
                .plan_phase(ticket, run_id, attempt, worktree, &effective_policy, Arc::clone(&backend), &cancel)
                .await?
            {
                PlanVerdict::Accepted => {}
                PlanVerdict::Narrowed(files) => {
                    // One retry with the concrete sub-scope recovery gave us.
                    effective_policy.allowed_paths = files;
                }
                PlanVerdict::Rejected(failure) => {
                    let trigger = None;
                    let recovery = self.recovery_for(&failure, trigger, ticket);
                    return Ok(TicketOutcome::Failed { failure, spindle_trigger: trigger, recovery });
                }
                PlanVerdict::Canceled => {
                    return Ok(self.fail(ticket, FailureKind::Canceled, "canceled during planning", None));
                }
            }
        }

        // ── Executing ────────────────────────────────────────────────────
        let exec = self
            .execute_phase(ticket, run_id, attempt, worktree, &effective_policy, backend, learnings, index_block, &cancel)
            .await?;
        match exec {
            ExecOutcome::Finished => {}
            ExecOutcome::SpindleAbort(report) => {
                let path = self.artifacts.write(ArtifactType::Spindle, run_id, &report)?;
                self.store.insert_artifact_row(run_id, "spindle", &report.trigger.as_str().to_string(), &path.to_string_lossy())?;
                self.store.append_run_event(
                    run_id,
                    RunEventType::SpindleAbort,
                    &serde_json::json!({ "trigger": report.trigger.as_str(), "reason": report.reason }),
                )?;
                let failure = RunFailure::new(FailureKind::SpindleAbort, report.reason.clone());
                let recovery = self.recovery_for(&failure, Some(report.trigger), ticket);
                return Ok(TicketOutcome::Failed {
                    failure,
                    spindle_trigger: Some(report.trigger),
                    recovery,
                });
            }
            ExecOutcome::Canceled => {
                self.store.cancel_open_run_steps(run_id)?;
                return Ok(self.fail(ticket, FailureKind::Canceled, "canceled during execution", None));
            }
            ExecOutcome::AgentFailed(message) => {
                let failure = RunFailure::new(FailureKind::AgentError, message);
                let recovery = self.recovery_for(&failure, None, ticket);
                return Ok(TicketOutcome::Failed { failure, spindle_trigger: None, recovery });
            }
        }

        // Runtime scope enforcement over what actually changed.
        if let Some(violation) = self.scope_check(worktree, &effective_policy)? {
            self.store.append_run_event(
                run_id,
                RunEventType::ScopeViolation,
                &serde_json::json!({ "file": violation }),
            )?;
            let failure =
                RunFailure::new(FailureKind::ScopeViolation, format!("write outside scope: {violation}"));
            let recovery = self.recovery_for(&failure, None, ticket);
            return Ok(TicketOutcome::Failed { failure, spindle_trigger: None, recovery });
        }

        // ── Verifying ────────────────────────────────────────────────────
        if !self.config.skip_qa {
            if let Some(failure) = self.verify_phase(ticket, run_id, attempt, worktree, &cancel).await? {
                let recovery = self.recovery_for(&failure, None, ticket);
                return Ok(TicketOutcome::Failed { failure, spindle_trigger: None, recovery });
            }
        }

        // ── Completed: integrate and open the PR ─────────────────────────
        let wt_str = worktree.path.to_string_lossy().to_string();
        let commit_message = format!("{} ({})", ticket.title, ticket.category);
        match self.git.commit_all(&wt_str, &commit_message) {
            Ok(changed) => {
                if !changed && self.changed_files_vs_base(worktree).is_empty() {
                    let failure = RunFailure::new(FailureKind::AgentError, "agent made no changes");
                    let recovery = self.recovery_for(&failure, None, ticket);
                    return Ok(TicketOutcome::Failed { failure, spindle_trigger: None, recovery });
                }
            }
            Err(e) => {
                return Ok(self.fail(ticket, FailureKind::GitError, format!("commit failed: {e:#}"), None));
            }
        }

        if let Err(e) = self.worktrees.integrate(worktree).await {
            return Ok(self.fail(ticket, FailureKind::GitError, format!("{e:#}"), None));
        }
        self.store.append_run_event(run_id, RunEventType::MergeResolved, &serde_json::json!({ "branch": worktree.branch }))?;

        let mut pr_url = None;
        if self.config.create_pr {
            match self.open_pr(ticket, worktree) {
                Ok(url) => {
                    self.store.set_run_pr(run_id, &url, None)?;
                    self.store.append_run_event(run_id, RunEventType::PrCreated, &serde_json::json!({ "url": url }))?;
                    let _ = self.events.send(EngineEvent::PrOpened { ticket_id: ticket.id.clone(), url: url.clone() });
                    pr_url = Some(url);
                }
                Err(e) => {
                    // PR failure is environmental; the merge already landed.
                    warn!(ticket_id = %ticket.id, "PR creation failed: {e:#}");
                    return Ok(self.fail(ticket, FailureKind::PrError, format!("{e:#}"), None));
                }
            }
        }

        self.worktrees.release(worktree).await;
        info!(ticket_id = %ticket.id, run_id, "ticket completed");
        Ok(TicketOutcome::Completed { pr_url })
    }

    fn fail(
        &self,
        ticket: &Ticket,
        kind: FailureKind,
        message: impl Into<String>,
        trigger: Option<SpindleTrigger>,
    ) -> TicketOutcome {
        let failure = RunFailure::new(kind, message);
        let recovery = self.recovery_for(&failure, trigger, ticket);
        TicketOutcome::Failed { failure, spindle_trigger: trigger, recovery }
    }

    fn recovery_for(
        &self,
        failure: &RunFailure,
        trigger: Option<SpindleTrigger>,
        _ticket: &Ticket,
    ) -> RecoveryAction {
        analyze(&FailureContext {
            kind: failure.kind,
            spindle_trigger: trigger,
            error: &failure.message,
            proposal: None,
        })
    }

    // ── Plan phase ────────────────────────────────────────────────────────

    async fn plan_phase(
        &self,
        ticket: &Ticket,
        run_id: &str,
        attempt: i64,
        worktree: &Worktree,
        policy: &ScopePolicy,
        backend: Arc<dyn AgentBackend>,
        cancel: &CancellationToken,
    ) -> Result<PlanVerdict> {
        let step_id = self.store.insert_run_step(
            run_id,
            attempt,
            "plan",
            StepKind::Internal,
            None,
            Some(&worktree.path.to_string_lossy()),
            None,
        )?;
        self.store.start_run_step(step_id)?;

        let invocation = AgentInvocation {
            run_id: run_id.to_string(),
            instruction: plan_instruction(ticket, policy),
            system_prompt: PLANNER_SYSTEM.to_string(),
            worktree_path: worktree.path.to_string_lossy().to_string(),
            session_dir: self.session_dir(&ticket.id),
            model: self.config.model.clone(),
            resume_session: None,
            allowed_tools: "Read,Glob,Grep".to_string(),
            timeout_ms: self.config.agent_timeout_ms,
            event_tx: None,
            cancel: cancel.clone(),
        };

        let output = backend.run(invocation).await.unwrap_or_else(|e| {
            warn!(ticket_id = %ticket.id, "plan backend error: {e:#}");
            AgentOutput::failed(String::new())
        });
        if cancel.is_cancelled() {
            self.store.finish_run_step(step_id, StepStatus::Canceled, None, None, None, 0, 0, None)?;
            return Ok(PlanVerdict::Canceled);
        }

        let plan = extract_last_json::<AgentPlan>(&output.output);
        let verdict = match &plan {
            Some(plan) => validate_plan_scope(&plan.files, plan.estimated_lines, &plan.risk, policy),
            None => crate::scope::PlanVerdict {
                valid: false,
                reason: Some("agent produced no structured plan".to_string()),
            },
        };

        if verdict.valid {
            self.store.finish_run_step(
                step_id,
                StepStatus::Success,
                Some(0),
                Some(&tail(&output.output, STDOUT_TAIL_BYTES)),
                None,
                output.output.len() as i64,
                0,
                None,
            )?;
            return Ok(PlanVerdict::Accepted);
        }

        let reason = verdict.reason.unwrap_or_else(|| "invalid plan".to_string());
        self.store.append_run_event(
            run_id,
            RunEventType::PlanRejected,
            &serde_json::json!({ "reason": reason }),
        )?;
        self.store.finish_run_step(
            step_id,
            StepStatus::Failed,
            Some(1),
            Some(&tail(&output.output, STDOUT_TAIL_BYTES)),
            None,
            output.output.len() as i64,
            0,
            Some(&reason),
        )?;

        // A plan outside scope can sometimes be saved by narrowing to the
        // plan's concrete files when they fit the ticket's allowed set.
        if let Some(plan) = plan {
            let concrete: Vec<String> = plan
                .files
                .iter()
                .filter(|f| !f.contains('*'))
                .filter(|f| is_file_allowed(f, policy).is_allowed())
                .cloned()
                .collect();
            if !concrete.is_empty() && concrete.len() < plan.files.len() {
                info!(ticket_id = %ticket.id, "retrying plan with narrowed scope");
                return Ok(PlanVerdict::Narrowed(concrete));
            }
        }

        Ok(PlanVerdict::Rejected(RunFailure::new(FailureKind::SchemaInvalid, reason)))
    }

    // ── Execute phase ─────────────────────────────────────────────────────

    #[allow(clippy::too_many_arguments)]
    async fn execute_phase(
        &self,
        ticket: &Ticket,
        run_id: &str,
        attempt: i64,
        worktree: &Worktree,
        policy: &ScopePolicy,
        backend: Arc<dyn AgentBackend>,
        learnings: &[Learning],
        index_block: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecOutcome> {
        let step_id = self.store.insert_run_step(
            run_id,
            attempt,
            "execute",
            StepKind::Internal,
            None,
            Some(&worktree.path.to_string_lossy()),
            Some(self.config.agent_timeout_ms as i64),
        )?;
        self.store.start_run_step(step_id)?;

        let (tx, mut rx) = mpsc::unbounded_channel::<AgentStreamEvent>();
        let invocation = AgentInvocation {
            run_id: run_id.to_string(),
            instruction: execute_instruction(ticket, policy, learnings, index_block),
            system_prompt: WORKER_SYSTEM.to_string(),
            worktree_path: worktree.path.to_string_lossy().to_string(),
            session_dir: self.session_dir(&ticket.id),
            model: self.config.model.clone(),
            resume_session: None,
            allowed_tools: "Read,Glob,Grep,Write,Edit,Bash".to_string(),
            timeout_ms: self.config.agent_timeout_ms,
            event_tx: Some(tx),
            cancel: cancel.clone(),
        };

        let exec_cancel = cancel.clone();
        let handle = tokio::spawn(async move { backend.run(invocation).await });

        let mut spindle = Spindle::new(SpindleThresholds {
            token_budget_abort: self.config.token_budget_abort,
            max_stall_iterations: self.config.max_stall_iterations,
            ..Default::default()
        });
        let mut steps_used = 0usize;
        let mut abort: Option<ExecAbort> = None;

        while let Some(event) = rx.recv().await {
            let report = match &event {
                AgentStreamEvent::ToolUse { name, target, content } => {
                    steps_used += 1;
                    self.store.bump_run_iteration(run_id)?;
                    if steps_used >= self.config.ticket_step_budget {
                        abort = Some(ExecAbort::StepBudget);
                        break;
                    }
                    if let Some(rejection) = self.check_write(name, target, content.as_deref(), policy) {
                        self.store.append_run_event(
                            run_id,
                            RunEventType::ScopeViolation,
                            &serde_json::json!({ "file": target, "reason": rejection }),
                        )?;
                        warn!(ticket_id = %ticket.id, %target, "rejected write: {rejection}");
                    }
                    spindle.observe_action(name, target)
                }
                AgentStreamEvent::Text { text } => spindle.observe_output(text),
                AgentStreamEvent::Raw { .. } => spindle.observe_idle_step(),
                AgentStreamEvent::Stderr { .. } | AgentStreamEvent::SessionStarted { .. } => None,
            };
            if let Some(report) = report {
                abort = Some(ExecAbort::Spindle(Box::new(report)));
                break;
            }
        }

        if abort.is_some() {
            exec_cancel.cancel();
        }
        // Drain whatever the reader still holds so the child can exit.
        while rx.recv().await.is_some() {}

        let output = match handle.await.context("join agent task")? {
            Ok(out) => out,
            Err(e) => {
                self.store.finish_run_step(step_id, StepStatus::Failed, Some(1), None, None, 0, 0, Some(&format!("{e:#}")))?;
                return Ok(ExecOutcome::AgentFailed(format!("{e:#}")));
            }
        };

        match abort {
            Some(ExecAbort::Spindle(report)) => {
                self.store.finish_run_step(step_id, StepStatus::Failed, Some(1), Some(&tail(&output.raw_stream, STDOUT_TAIL_BYTES)), None, output.raw_stream.len() as i64, 0, Some(&report.reason))?;
                Ok(ExecOutcome::SpindleAbort(*report))
            }
            Some(ExecAbort::StepBudget) => {
                let report = SpindleReport {
                    reason: format!("step budget of {} exhausted", self.config.ticket_step_budget),
                    trigger: SpindleTrigger::Stall,
                    confidence: 1.0,
                    estimated_tokens: spindle.estimated_tokens(),
                    iteration: steps_used,
                    thresholds: SpindleThresholds::default(),
                    metrics: Default::default(),
                    recommendations: vec!["split the ticket; it does not fit the step budget".into()],
                    artifact_path: None,
                };
                self.store.finish_run_step(step_id, StepStatus::Failed, Some(1), None, None, output.raw_stream.len() as i64, 0, Some(&report.reason))?;
                Ok(ExecOutcome::SpindleAbort(report))
            }
            None if cancel.is_cancelled() => {
                self.store.finish_run_step(step_id, StepStatus::Canceled, None, None, None, 0, 0, None)?;
                Ok(ExecOutcome::Canceled)
            }
            None if !output.success => {
                self.store.finish_run_step(step_id, StepStatus::Failed, Some(1), Some(&tail(&output.output, STDOUT_TAIL_BYTES)), None, output.output.len() as i64, 0, None)?;
                Ok(ExecOutcome::AgentFailed(output.output))
            }
            None => {
                self.store.finish_run_step(step_id, StepStatus::Success, Some(0), Some(&tail(&output.output, STDOUT_TAIL_BYTES)), None, output.output.len() as i64, 0, None)?;
                Ok(ExecOutcome::Finished)
            }
        }
    }

    /// Write-shaped tool calls are checked against the policy as they
    /// stream; the verdict is recorded (and surfaced to the agent on the
    /// next round) while the post-run diff check stays authoritative.
    fn check_write(
        &self,
        tool: &str,
        target: &str,
        content: Option<&str>,
        policy: &ScopePolicy,
    ) -> Option<String> {
        if !matches!(tool, "Write" | "Edit" | "MultiEdit" | "NotebookEdit") {
            return None;
        }
        if let Some(content) = content {
            if content_has_credentials(content) {
                return Some("content matches a credential pattern".to_string());
            }
        }
        match is_file_allowed(target, policy) {
            crate::scope::WriteDecision::Allowed => None,
            crate::scope::WriteDecision::Denied { reason } => Some(reason),
        }
    }

    /// Post-run authoritative scope check: every file the attempt touched
    /// (committed by the agent or not) must satisfy the policy.
    fn scope_check(&self, worktree: &Worktree, policy: &ScopePolicy) -> Result<Option<String>> {
        for file in self.changed_files_vs_base(worktree) {
            if !is_file_allowed(&file, policy).is_allowed() {
                return Ok(Some(file));
            }
        }
        Ok(None)
    }

    /// All files changed since the branch point: uncommitted work, brand
    /// new files, and any commits the agent made itself. Prefers the
    /// remote base when present.
    fn changed_files_vs_base(&self, worktree: &Worktree) -> Vec<String> {
        let wt_str = worktree.path.to_string_lossy().to_string();
        let base = self.worktrees.base_branch();
        let mut files = self.git.diff_name_only(&wt_str, "HEAD").unwrap_or_default();
        let vs_base = self
            .git
            .diff_name_only(&wt_str, &format!("origin/{base}"))
            .or_else(|_| self.git.diff_name_only(&wt_str, base))
            .unwrap_or_default();
        let untracked = self.git.untracked_files(&wt_str).unwrap_or_default();
        for f in vs_base.into_iter().chain(untracked) {
            if !files.contains(&f) {
                files.push(f);
            }
        }
        files
    }

    // ── Verify phase ──────────────────────────────────────────────────────

    async fn verify_phase(
        &self,
        ticket: &Ticket,
        run_id: &str,
        attempt: i64,
        worktree: &Worktree,
        cancel: &CancellationToken,
    ) -> Result<Option<RunFailure>> {
        for (i, cmd) in ticket.verification_commands.iter().enumerate() {
            if cancel.is_cancelled() {
                self.store.cancel_open_run_steps(run_id)?;
                return Ok(Some(RunFailure::new(FailureKind::Canceled, "canceled during verification")));
            }

            let step_id = self.store.insert_run_step(
                run_id,
                attempt,
                &format!("verify:{i}"),
                StepKind::Command,
                Some(cmd),
                Some(&worktree.path.to_string_lossy()),
                None,
            )?;
            self.store.start_run_step(step_id)?;

            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(cmd)
                .current_dir(&worktree.path)
                .output()
                .await
                .with_context(|| format!("run verification command: {cmd}"))?;

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let exit_code = output.status.code().unwrap_or(1) as i64;

            let status = if exit_code == 0 { StepStatus::Success } else { StepStatus::Failed };
            self.store.finish_run_step(
                step_id,
                status,
                Some(exit_code),
                Some(&tail(&stdout, STDOUT_TAIL_BYTES)),
                Some(&tail(&stderr, STDOUT_TAIL_BYTES)),
                stdout.len() as i64,
                stderr.len() as i64,
                None,
            )?;

            if exit_code != 0 {
                self.store.append_run_event(
                    run_id,
                    RunEventType::QaFail,
                    &serde_json::json!({ "command": cmd, "exit_code": exit_code }),
                )?;
                let message = format!(
                    "verification `{cmd}` exited {exit_code}\n{}\n{}",
                    tail(&stdout, STDOUT_TAIL_BYTES),
                    tail(&stderr, STDOUT_TAIL_BYTES)
                );
                return Ok(Some(RunFailure::new(FailureKind::QaFailed, message)));
            }
        }
        self.store.append_run_event(run_id, RunEventType::QaPass, &serde_json::json!({}))?;
        info!(ticket_id = %ticket.id, "verification passed");
        Ok(None)
    }

    // ── PR ────────────────────────────────────────────────────────────────

    fn open_pr(&self, ticket: &Ticket, worktree: &Worktree) -> Result<String> {
        let wt_str = worktree.path.to_string_lossy().to_string();
        self.git.push_with_upstream(&wt_str, &worktree.branch)?;

        if let Some(existing) = self.git.pr_url_for_branch(&wt_str, &worktree.branch) {
            return Ok(existing);
        }
        let title = sanitize_pr_title(&ticket.title);
        let body = format!(
            "Automated improvement ({category}).\n\n{description}",
            category = ticket.category,
            description = ticket.description
        );
        self.git.create_pr(
            &wt_str,
            &title,
            &body,
            &worktree.branch,
            self.worktrees.base_branch(),
            self.config.draft_pr,
        )
    }

    fn session_dir(&self, ticket_id: &str) -> String {
        let dir = self.config.data_dir().join("sessions").join(ticket_id);
        std::fs::create_dir_all(&dir).ok();
        dir.to_string_lossy().to_string()
    }

    /// Mark the run terminal based on the outcome; called by the session
    /// after store-side ticket transitions.
    pub fn finish_run(&self, run_id: &str, outcome: &TicketOutcome) -> Result<()> {
        match outcome {
            TicketOutcome::Completed { pr_url } => {
                let meta = serde_json::json!({ "completion_outcome": "success", "pr_url": pr_url });
                self.store.complete_run(run_id, RunStatus::Success, None, Some(&meta))
            }
            TicketOutcome::Failed { failure, spindle_trigger, .. } => {
                let meta = serde_json::json!({
                    "completion_outcome": failure.kind.as_str(),
                    "spindle_trigger": spindle_trigger.map(|t| t.as_str()),
                });
                self.store.complete_run(run_id, RunStatus::Failure, Some(&failure.message), Some(&meta))
            }
        }
    }
}

enum PlanVerdict {
    Accepted,
    Narrowed(Vec<String>),
    Rejected(RunFailure),
    Canceled,
}

enum ExecOutcome {
    Finished,
    SpindleAbort(SpindleReport),
    Canceled,
    AgentFailed(String),
}

enum ExecAbort {
    Spindle(Box<SpindleReport>),
    StepBudget,
}

const PLANNER_SYSTEM: &str = "You are a planning agent. Read the code, then output a single JSON \
object: {\"files\": [..], \"estimated_lines\": N, \"risk\": \"low|medium|high\"}. Do not edit \
anything.";

const WORKER_SYSTEM: &str = "You are a focused code-improvement agent. Stay strictly inside the \
allowed paths, make the smallest change that satisfies the ticket, and run nothing destructive. \
Commit is handled for you.";

fn plan_instruction(ticket: &Ticket, policy: &ScopePolicy) -> String {
    format!(
        "Ticket: {title}\n\n{description}\n\nAllowed paths:\n{allowed}\n\nLimits: at most \
         {max_files} files and {max_lines} changed lines.\n\nExplore the code, then output ONLY \
         the plan JSON.",
        title = ticket.title,
        description = ticket.description,
        allowed = bullet_list(&policy.allowed_paths),
        max_files = policy.max_files,
        max_lines = policy.max_lines,
    )
}

fn execute_instruction(
    ticket: &Ticket,
    policy: &ScopePolicy,
    learnings: &[Learning],
    index_block: &str,
) -> String {
    let mut s = format!(
        "Ticket: {title}\n\n{description}\n\nAllowed paths (writes anywhere else will be \
         rejected):\n{allowed}\n\nVerification commands that must pass:\n{commands}\n",
        title = ticket.title,
        description = ticket.description,
        allowed = bullet_list(&policy.allowed_paths),
        commands = bullet_list(&ticket.verification_commands),
    );
    if !learnings.is_empty() {
        s.push_str("\nProject learnings from earlier runs:\n");
        for l in learnings {
            s.push_str(&format!("- {}\n", l.text));
        }
    }
    if !index_block.is_empty() {
        s.push('\n');
        s.push_str(index_block);
        s.push('\n');
    }
    s
}

fn bullet_list(items: &[String]) -> String {
    if items.is_empty() {
        return "- (none)".to_string();
    }
    items.iter().map(|i| format!("- {i}")).collect::<Vec<_>>().join("\n")
}

/// The last top-level JSON object in a text blob, parsed as T.
fn extract_last_json<T: for<'de> Deserialize<'de>>(text: &str) -> Option<T> {
    let mut depth = 0i32;
    let mut start = None;
    let mut candidates: Vec<&str> = Vec::new();
    for (i, c) in text.char_indices() {
        match c {
            '{' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            '}' => {
                depth -= 1;
                if depth == 0 {
                    if let Some(s) = start {
                        candidates.push(&text[s..=i]);
                    }
                }
                if depth < 0 {
                    depth = 0;
                }
            }
            _ => {}
        }
    }
    candidates.into_iter().rev().find_map(|c| serde_json::from_str(c).ok())
}

fn tail(text: &str, bytes: usize) -> String {
    if text.len() <= bytes {
        return text.to_string();
    }
    let start = text.len() - bytes;
    let start = (start..text.len()).find(|i| text.is_char_boundary(*i)).unwrap_or(start);
    text[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn last_json_object_wins() {
        let text = "thinking... {\"files\": [\"a.rs\"], \"estimated_lines\": 10}\nrevised: \
                    {\"files\": [\"b.rs\"], \"estimated_lines\": 20, \"risk\": \"low\"}";
        let plan: AgentPlan = extract_last_json(text).expect("plan");
        assert_eq!(plan.files, vec!["b.rs".to_string()]);
        assert_eq!(plan.estimated_lines, 20);
        assert_eq!(plan.risk, "low");
    }

    #[test]
    fn malformed_json_is_skipped() {
        let text = "{\"files\": broken} {\"files\": [\"ok.rs\"], \"estimated_lines\": 5}";
        let plan: AgentPlan = extract_last_json(text).expect("plan");
        assert_eq!(plan.files, vec!["ok.rs".to_string()]);
        assert_eq!(plan.risk, "medium");
    }

    #[test]
    fn tail_respects_char_boundaries() {
        let text = format!("{}€€€", "x".repeat(10));
        let t = tail(&text, 4);
        assert!(t.ends_with('€'));
        assert!(t.len() <= 6);
    }
}
