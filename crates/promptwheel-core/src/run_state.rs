//! Session-persistent run state: cycle counters, per-formula stats,
//! quality signals, deferred proposals, and the recent-diff ring.
//!
//! The whole file is read-modified-written under a per-store lock so
//! concurrent helpers never lose updates; writes go through a temp file
//! and an atomic rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Proposal;

const RECENT_DIFFS_CAP: usize = 10;
const DEFERRED_PROPOSALS_CAP: usize = 50;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FormulaStats {
    pub tickets_total: i64,
    pub tickets_succeeded: i64,
    pub recent_cycles: i64,
    pub recent_tickets_total: i64,
    pub recent_tickets_succeeded: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct QualitySignals {
    pub total_tickets: i64,
    pub first_pass_success: i64,
    pub retried_success: i64,
    pub qa_passed: i64,
    pub qa_failed: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeferredProposal {
    pub proposal: Proposal,
    pub original_scope: String,
    pub deferred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RunState {
    pub total_cycles: i64,
    pub last_docs_audit_cycle: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub formulas: HashMap<String, FormulaStats>,
    pub quality_signals: QualitySignals,
    pub deferred_proposals: Vec<DeferredProposal>,
    pub recent_diffs: Vec<String>,
    pub effective_min_confidence: Option<f64>,
}

/// A completed ticket's quality outcome.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QualitySignal {
    /// Passed verification on the first attempt.
    FirstPass,
    /// Passed verification after at least one retry.
    Retried,
    /// A verification round failed.
    QaFail,
}

pub struct RunStateStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl RunStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into(), lock: Mutex::new(()) }
    }

    pub fn load(&self) -> RunState {
        read_state(&self.path)
    }

    /// Read-modify-write under the store lock.
    fn update<T>(&self, f: impl FnOnce(&mut RunState) -> T) -> Result<T> {
        let _guard = self.lock.lock().map_err(|_| anyhow::anyhow!("run-state lock poisoned"))?;
        let mut state = read_state(&self.path);
        let out = f(&mut state);
        write_state(&self.path, &state)?;
        Ok(out)
    }

    pub fn record_cycle(&self, formula: &str) -> Result<i64> {
        self.update(|s| {
            s.total_cycles += 1;
            s.last_run_at = Some(Utc::now());
            let stats = s.formulas.entry(formula.to_string()).or_default();
            stats.recent_cycles += 1;
            s.total_cycles
        })
    }

    pub fn record_quality_signal(&self, signal: QualitySignal) -> Result<()> {
        self.update(|s| {
            let q = &mut s.quality_signals;
            match signal {
                QualitySignal::FirstPass => {
                    q.total_tickets += 1;
                    q.first_pass_success += 1;
                    q.qa_passed += 1;
                }
                QualitySignal::Retried => {
                    q.total_tickets += 1;
                    q.retried_success += 1;
                    q.qa_passed += 1;
                }
                QualitySignal::QaFail => {
                    q.qa_failed += 1;
                }
            }
        })
    }

    pub fn record_formula_ticket_outcome(&self, formula: &str, succeeded: bool) -> Result<()> {
        self.update(|s| {
            let stats = s.formulas.entry(formula.to_string()).or_default();
            stats.tickets_total += 1;
            stats.recent_tickets_total += 1;
            if succeeded {
                stats.tickets_succeeded += 1;
                stats.recent_tickets_succeeded += 1;
            }
        })
    }

    pub fn defer_proposal(&self, proposal: Proposal, original_scope: &str) -> Result<()> {
        self.update(|s| {
            s.deferred_proposals.push(DeferredProposal {
                proposal,
                original_scope: original_scope.to_string(),
                deferred_at: Utc::now(),
            });
            if s.deferred_proposals.len() > DEFERRED_PROPOSALS_CAP {
                let excess = s.deferred_proposals.len() - DEFERRED_PROPOSALS_CAP;
                s.deferred_proposals.drain(..excess);
            }
        })
    }

    /// Remove and return every deferred proposal whose original scope
    /// matches `scope`. Non-matching entries stay untouched.
    pub fn pop_deferred_for_scope(&self, scope: &str) -> Result<Vec<Proposal>> {
        self.update(|s| {
            let (matching, rest): (Vec<_>, Vec<_>) = s
                .deferred_proposals
                .drain(..)
                .partition(|d| d.original_scope == scope);
            s.deferred_proposals = rest;
            matching.into_iter().map(|d| d.proposal).collect()
        })
    }

    pub fn push_recent_diff(&self, diff_summary: &str) -> Result<()> {
        self.update(|s| {
            s.recent_diffs.push(diff_summary.to_string());
            if s.recent_diffs.len() > RECENT_DIFFS_CAP {
                let excess = s.recent_diffs.len() - RECENT_DIFFS_CAP;
                s.recent_diffs.drain(..excess);
            }
        })
    }

    pub fn set_effective_min_confidence(&self, value: f64) -> Result<()> {
        self.update(|s| s.effective_min_confidence = Some(value))
    }

    /// firstPassSuccess / totalTickets; 0 when nothing has completed yet.
    pub fn quality_rate(&self) -> f64 {
        let q = self.load().quality_signals;
        if q.total_tickets == 0 {
            0.0
        } else {
            q.first_pass_success as f64 / q.total_tickets as f64
        }
    }
}

fn read_state(path: &Path) -> RunState {
    match std::fs::read_to_string(path) {
        Ok(contents) => serde_json::from_str(&contents).unwrap_or_default(),
        Err(_) => RunState::default(),
    }
}

fn write_state(path: &Path, state: &RunState) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let tmp = path.with_extension("json.tmp");
    let json = serde_json::to_string_pretty(state).context("serialize run-state")?;
    std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
    std::fs::rename(&tmp, path).with_context(|| format!("rename into {}", path.display()))?;
    Ok(())
}
