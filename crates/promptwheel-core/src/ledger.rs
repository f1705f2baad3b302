//! On-disk session records: append-only NDJSON ledgers and per-run JSON
//! artifacts under `<repo>/.promptwheel/artifacts/<type>/<run-id>.json`.
//! Artifact writes are atomic (temp + rename); ledger readers tolerate
//! malformed lines and return newest-first.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

// ── NDJSON ───────────────────────────────────────────────────────────────

pub fn append_ndjson<T: Serialize>(path: &Path, record: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).ok();
    }
    let mut line = serde_json::to_string(record).context("serialize ndjson record")?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open {}", path.display()))?;
    file.write_all(line.as_bytes()).with_context(|| format!("append {}", path.display()))?;
    Ok(())
}

/// Read a ledger newest-first. Malformed lines are skipped, not fatal.
pub fn read_ndjson<T: DeserializeOwned>(path: &Path, limit: Option<usize>) -> Vec<T> {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    let mut out: Vec<T> = contents
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect();
    out.reverse();
    if let Some(limit) = limit {
        out.truncate(limit);
    }
    out
}

// ── Ledger record shapes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryTicket {
    pub id: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// completed | failed | spindle_abort | skipped
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pr_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
}

/// One line of `history.ndjson`: a whole session cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    /// auto | manual | ci
    pub mode: String,
    pub scope: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    pub tickets_proposed: i64,
    pub tickets_approved: i64,
    pub tickets_completed: i64,
    pub tickets_failed: i64,
    pub prs_created: i64,
    pub prs_merged: i64,
    pub duration_ms: i64,
    pub parallel: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stopped_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub errors: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tickets: Option<Vec<HistoryTicket>>,
}

/// One line of `error-ledger.ndjson`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLedgerEntry {
    pub ts: DateTime<Utc>,
    pub ticket_id: String,
    pub ticket_title: String,
    pub failure_type: String,
    #[serde(default)]
    pub failed_command: String,
    #[serde(default)]
    pub error_pattern: String,
    pub error_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    /// scout | execute | qa | git | pr
    pub phase: String,
    pub session_cycle: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrOutcome {
    pub ts: DateTime<Utc>,
    pub ticket_id: String,
    pub pr_url: String,
    /// opened | merged | closed
    pub status: String,
}

/// Grouped view over the error ledger: (failureType, failedCommand) with
/// occurrence count and last-seen time, most frequent first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorGroup {
    pub failure_type: String,
    pub failed_command: String,
    pub count: usize,
    pub last_seen: DateTime<Utc>,
}

pub fn analyze_error_ledger(path: &Path, top_n: usize) -> Vec<ErrorGroup> {
    let entries: Vec<ErrorLedgerEntry> = read_ndjson(path, None);
    let mut groups: HashMap<(String, String), (usize, DateTime<Utc>)> = HashMap::new();
    for e in entries {
        let key = (e.failure_type.clone(), e.failed_command.clone());
        let slot = groups.entry(key).or_insert((0, e.ts));
        slot.0 += 1;
        if e.ts > slot.1 {
            slot.1 = e.ts;
        }
    }
    let mut out: Vec<ErrorGroup> = groups
        .into_iter()
        .map(|((failure_type, failed_command), (count, last_seen))| ErrorGroup {
            failure_type,
            failed_command,
            count,
            last_seen,
        })
        .collect();
    out.sort_by(|a, b| b.count.cmp(&a.count).then(b.last_seen.cmp(&a.last_seen)));
    out.truncate(top_n);
    out
}

// ── Artifacts ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactType {
    Proposals,
    Executions,
    Diffs,
    Violations,
    Runs,
    Spindle,
}

impl ArtifactType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Proposals => "proposals",
            Self::Executions => "executions",
            Self::Diffs => "diffs",
            Self::Violations => "violations",
            Self::Runs => "runs",
            Self::Spindle => "spindle",
        }
    }
}

pub struct ArtifactStore {
    base: PathBuf,
}

impl ArtifactStore {
    /// `base` is the repo's `.promptwheel` directory.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    fn path_for(&self, artifact_type: ArtifactType, run_id: &str) -> PathBuf {
        self.base
            .join("artifacts")
            .join(artifact_type.as_str())
            .join(format!("{run_id}.json"))
    }

    /// Atomic write: temp file then rename, so readers never see a
    /// partially written artifact.
    pub fn write<T: Serialize>(
        &self,
        artifact_type: ArtifactType,
        run_id: &str,
        payload: &T,
    ) -> Result<PathBuf> {
        let path = self.path_for(artifact_type, run_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(payload).context("serialize artifact")?;
        std::fs::write(&tmp, json).with_context(|| format!("write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("rename into {}", path.display()))?;
        Ok(path)
    }

    pub fn get_by_run_id<T: DeserializeOwned>(
        &self,
        run_id: &str,
        artifact_type: ArtifactType,
    ) -> Option<T> {
        let path = self.path_for(artifact_type, run_id);
        let contents = std::fs::read_to_string(path).ok()?;
        serde_json::from_str(&contents).ok()
    }

    /// Scan one artifact type's directory; returns (run_id, path) pairs.
    pub fn list(&self, artifact_type: ArtifactType) -> Vec<(String, PathBuf)> {
        let dir = self.base.join("artifacts").join(artifact_type.as_str());
        let Ok(entries) = std::fs::read_dir(&dir) else {
            return Vec::new();
        };
        let mut out: Vec<(String, PathBuf)> = entries
            .flatten()
            .filter_map(|e| {
                let path = e.path();
                let stem = path.file_stem()?.to_string_lossy().to_string();
                (path.extension()? == "json").then_some((stem, path))
            })
            .collect();
        out.sort();
        out
    }
}

/// The envelope written as `proposals.json` for a scout run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalsArtifact {
    pub run_id: String,
    pub project_id: String,
    pub project_name: String,
    pub created_at: DateTime<Utc>,
    pub proposals: Vec<crate::types::Proposal>,
}

/// The generic typed envelope used by diffs/executions/violations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactEnvelope<T> {
    pub run_id: String,
    pub artifact_type: String,
    pub created_at: DateTime<Utc>,
    pub data: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    struct Rec {
        n: i64,
    }

    #[test]
    fn ndjson_reads_newest_first_and_skips_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("history.ndjson");
        append_ndjson(&path, &Rec { n: 1 }).expect("append");
        append_ndjson(&path, &Rec { n: 2 }).expect("append");
        // Simulate a torn write.
        std::fs::write(&path, format!("{}{{bad line\n", std::fs::read_to_string(&path).expect("read")))
            .expect("write");
        append_ndjson(&path, &Rec { n: 3 }).expect("append");

        let all: Vec<Rec> = read_ndjson(&path, None);
        assert_eq!(all, vec![Rec { n: 3 }, Rec { n: 2 }, Rec { n: 1 }]);

        let limited: Vec<Rec> = read_ndjson(&path, Some(2));
        assert_eq!(limited, vec![Rec { n: 3 }, Rec { n: 2 }]);
    }

    #[test]
    fn artifact_round_trip_and_listing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = ArtifactStore::new(dir.path().join(".promptwheel"));

        let payload = ArtifactEnvelope {
            run_id: "run-1".to_string(),
            artifact_type: "diffs".to_string(),
            created_at: Utc::now(),
            data: vec!["src/a.rs".to_string()],
        };
        let path = store.write(ArtifactType::Diffs, "run-1", &payload).expect("write");
        assert!(path.ends_with("artifacts/diffs/run-1.json"));

        let loaded: ArtifactEnvelope<Vec<String>> = store
            .get_by_run_id("run-1", ArtifactType::Diffs)
            .expect("lookup");
        assert_eq!(loaded.data, vec!["src/a.rs".to_string()]);

        assert!(store.get_by_run_id::<serde_json::Value>("run-1", ArtifactType::Spindle).is_none());
        assert_eq!(store.list(ArtifactType::Diffs).len(), 1);
        assert!(store.list(ArtifactType::Proposals).is_empty());
    }

    #[test]
    fn error_ledger_groups_by_type_and_command() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("error-ledger.ndjson");
        let entry = |failure_type: &str, cmd: &str| ErrorLedgerEntry {
            ts: Utc::now(),
            ticket_id: "t1".into(),
            ticket_title: "title".into(),
            failure_type: failure_type.into(),
            failed_command: cmd.into(),
            error_pattern: String::new(),
            error_message: "boom".into(),
            category: None,
            phase: "qa".into(),
            session_cycle: 1,
            formula: None,
        };
        for _ in 0..3 {
            append_ndjson(&path, &entry("qa_failed", "cargo test")).expect("append");
        }
        append_ndjson(&path, &entry("git_error", "git push")).expect("append");

        let groups = analyze_error_ledger(&path, 10);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].failure_type, "qa_failed");
        assert_eq!(groups[0].count, 3);
    }
}
