//! Maps a ticket failure to what the scheduler should do next.

use serde::{Deserialize, Serialize};

use crate::spindle::SpindleTrigger;
use crate::types::{FailureKind, Proposal};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RecoveryAction {
    RetryWithHint { hint: String },
    NarrowScope { files: Vec<String> },
    Skip { reason: String },
}

pub struct FailureContext<'a> {
    pub kind: FailureKind,
    pub spindle_trigger: Option<SpindleTrigger>,
    pub error: &'a str,
    pub proposal: Option<&'a Proposal>,
}

/// Decide the recovery action for one failure. The caller applies the
/// ticket's retry budget; this function only classifies.
pub fn analyze(ctx: &FailureContext<'_>) -> RecoveryAction {
    match ctx.kind {
        FailureKind::SpindleAbort => spindle_recovery(ctx),
        FailureKind::QaFailed => RecoveryAction::RetryWithHint { hint: qa_hint(ctx.error) },
        FailureKind::ScopeViolation => scope_recovery(ctx),
        FailureKind::Timeout => RecoveryAction::Skip { reason: "run exceeded its wall-clock timeout".into() },
        FailureKind::Canceled => RecoveryAction::Skip { reason: "run was canceled".into() },
        FailureKind::GitError => RecoveryAction::Skip { reason: "git operation failed (environmental)".into() },
        FailureKind::PrError => RecoveryAction::Skip { reason: "PR creation failed (environmental)".into() },
        FailureKind::AgentError => agent_recovery(ctx.error),
        _ => RecoveryAction::Skip { reason: format!("unrecoverable failure: {}", ctx.kind.as_str()) },
    }
}

fn spindle_recovery(ctx: &FailureContext<'_>) -> RecoveryAction {
    match ctx.spindle_trigger {
        Some(SpindleTrigger::Oscillation) => RecoveryAction::RetryWithHint {
            hint: "The previous attempt cycled between the same two edits. Re-read the \
                   failing output fully before changing anything, and make one combined fix."
                .into(),
        },
        Some(SpindleTrigger::Spinning) => RecoveryAction::RetryWithHint {
            hint: "The previous attempt kept restating the same reasoning without acting. \
                   Start from the concrete file list and make the smallest working change."
                .into(),
        },
        Some(SpindleTrigger::QaPingPong) => RecoveryAction::RetryWithHint {
            hint: "The previous attempt fixed one test while breaking another, repeatedly. \
                   Run the full verification suite and fix all failures in one pass."
                .into(),
        },
        _ => RecoveryAction::Skip {
            reason: format!(
                "spindle abort ({})",
                ctx.spindle_trigger.map(|t| t.as_str()).unwrap_or("unknown")
            ),
        },
    }
}

fn scope_recovery(ctx: &FailureContext<'_>) -> RecoveryAction {
    if let Some(proposal) = ctx.proposal {
        let (concrete, globs): (Vec<&String>, Vec<&String>) =
            proposal.files.iter().partition(|f| !f.contains('*'));
        if !concrete.is_empty() && !globs.is_empty() && concrete.len() < proposal.files.len() {
            return RecoveryAction::NarrowScope {
                files: concrete.into_iter().cloned().collect(),
            };
        }
    }
    RecoveryAction::Skip { reason: "scope violation with no concrete sub-scope to narrow to".into() }
}

fn agent_recovery(error: &str) -> RecoveryAction {
    let trimmed = error.trim();
    if trimmed.is_empty() {
        return RecoveryAction::Skip { reason: "agent failed with no error output".into() };
    }
    let lower = trimmed.to_lowercase();
    if lower.contains("permission denied") || lower.contains("not permitted") || lower.contains("eacces") {
        return RecoveryAction::RetryWithHint {
            hint: "A command hit a permission error. Work only inside the working copy and \
                   avoid commands that need elevated access."
                .into(),
        };
    }
    if lower.contains("no such file") || lower.contains("not found") || lower.contains("enoent") {
        return RecoveryAction::RetryWithHint {
            hint: "A referenced file did not exist. List the directory first and operate on \
                   paths that are actually present."
                .into(),
        };
    }
    if trimmed.len() > 200 {
        return RecoveryAction::RetryWithHint {
            hint: "The previous attempt failed. Take a different approach to the ticket.".into(),
        };
    }
    RecoveryAction::Skip { reason: format!("agent error: {trimmed}") }
}

/// Extract the failing-test tail from QA output into a targeted hint.
fn qa_hint(error: &str) -> String {
    let fails: Vec<&str> = error
        .lines()
        .filter(|l| {
            let t = l.trim_start();
            t.starts_with("FAIL") || t.starts_with("FAILED") || t.contains("... FAILED")
        })
        .rev()
        .take(5)
        .collect();
    if fails.is_empty() {
        "Verification failed. Run the verification commands locally and fix every failure \
         before finishing."
            .to_string()
    } else {
        let mut listed: Vec<&str> = fails.into_iter().rev().collect();
        listed.dedup();
        format!(
            "Verification failed on:\n{}\nFix these specific failures first.",
            listed.join("\n")
        )
    }
}
