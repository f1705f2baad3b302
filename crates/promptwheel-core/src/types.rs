use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Ticket lifecycle ─────────────────────────────────────────────────────

/// Ticket status. Transitions form the DAG enforced by the store:
///
/// ```text
/// backlog → ready → leased → in_progress → {done, blocked, aborted}
/// in_progress → ready (retryable failure, retries remain)
/// leased → ready (lease expired), blocked → ready (operator heal)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketStatus {
    Backlog,
    Ready,
    Leased,
    InProgress,
    Blocked,
    Aborted,
    Done,
}

impl TicketStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Backlog => "backlog",
            Self::Ready => "ready",
            Self::Leased => "leased",
            Self::InProgress => "in_progress",
            Self::Blocked => "blocked",
            Self::Aborted => "aborted",
            Self::Done => "done",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "backlog" => Some(Self::Backlog),
            "ready" => Some(Self::Ready),
            "leased" => Some(Self::Leased),
            "in_progress" => Some(Self::InProgress),
            "blocked" => Some(Self::Blocked),
            "aborted" => Some(Self::Aborted),
            "done" => Some(Self::Done),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Scout,
    Worker,
    Qa,
}

impl RunType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Scout => "scout",
            Self::Worker => "worker",
            Self::Qa => "qa",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Success,
    Failure,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LeaseStatus {
    Issued,
    Expired,
    Released,
}

impl LeaseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Issued => "issued",
            Self::Expired => "expired",
            Self::Released => "released",
        }
    }
}

// ── Entities ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub repo_url: String,
    pub root_path: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// An improvement ticket as stored in the database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticket {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub status: TicketStatus,
    pub priority: i64,
    /// Sector path the originating scan covered (used for deferred-proposal scoping).
    pub shard: String,
    /// Free-form category: fix/refactor/test/docs/perf/security/cleanup/types.
    pub category: String,
    pub allowed_paths: Vec<String>,
    pub forbidden_paths: Vec<String>,
    pub verification_commands: Vec<String>,
    pub max_retries: i64,
    pub retry_count: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: String,
    /// None for scout runs.
    pub ticket_id: Option<String>,
    pub project_id: String,
    pub run_type: RunType,
    pub status: RunStatus,
    pub iteration: i64,
    pub max_iterations: i64,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Free key-value map: completion outcome, spindle reason, PR info.
    pub metadata: serde_json::Map<String, serde_json::Value>,
    pub pr_url: Option<String>,
    pub pr_number: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,
    pub ticket_id: String,
    pub run_id: String,
    pub agent_id: String,
    pub status: LeaseStatus,
    pub expires_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

// ── Run steps ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    Command,
    LlmFix,
    Git,
    Internal,
}

impl StepKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Command => "command",
            Self::LlmFix => "llm_fix",
            Self::Git => "git",
            Self::Internal => "internal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Success,
    Failed,
    Skipped,
    Canceled,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
            Self::Canceled => "canceled",
        }
    }
}

/// One sub-unit of a run: a verification command, an LLM fix round,
/// a git operation, or an internal phase. (name) and (ordinal) are unique
/// within (run, attempt); ordinals are gap-free from 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunStep {
    pub id: i64,
    pub run_id: String,
    pub attempt: i64,
    pub ordinal: i64,
    pub name: String,
    pub kind: StepKind,
    pub status: StepStatus,
    pub cmd: Option<String>,
    pub cwd: Option<String>,
    pub timeout_ms: Option<i64>,
    pub exit_code: Option<i64>,
    pub signal: Option<String>,
    pub started_at_ms: Option<i64>,
    pub ended_at_ms: Option<i64>,
    pub duration_ms: Option<i64>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub stdout_bytes: i64,
    pub stderr_bytes: i64,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub stdout_tail: Option<String>,
    pub stderr_tail: Option<String>,
    pub error_message: Option<String>,
    pub meta_json: Option<String>,
}

// ── Run events ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunEventType {
    TicketsCreated,
    ProposalsFiltered,
    ScopeViolation,
    SpindleAbort,
    QaPass,
    QaFail,
    PlanRejected,
    LeaseExpired,
    MergeResolved,
    PrCreated,
}

impl RunEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TicketsCreated => "TICKETS_CREATED",
            Self::ProposalsFiltered => "PROPOSALS_FILTERED",
            Self::ScopeViolation => "SCOPE_VIOLATION",
            Self::SpindleAbort => "SPINDLE_ABORT",
            Self::QaPass => "QA_PASS",
            Self::QaFail => "QA_FAIL",
            Self::PlanRejected => "PLAN_REJECTED",
            Self::LeaseExpired => "LEASE_EXPIRED",
            Self::MergeResolved => "MERGE_RESOLVED",
            Self::PrCreated => "PR_CREATED",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    pub id: i64,
    pub run_id: String,
    pub event_type: RunEventType,
    pub data: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ── Failure taxonomy ─────────────────────────────────────────────────────

/// Why a run or ticket failed. Kinds cross component boundaries unchanged;
/// only the orchestrator and the recovery analyzer map them to actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    SchemaInvalid,
    ScopeViolation,
    QaFailed,
    SpindleAbort,
    Timeout,
    Canceled,
    GitError,
    PrError,
    AgentError,
    StoreConflict,
    MigrationMismatch,
    Unknown,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SchemaInvalid => "schema_invalid",
            Self::ScopeViolation => "scope_violation",
            Self::QaFailed => "qa_failed",
            Self::SpindleAbort => "spindle_abort",
            Self::Timeout => "timeout",
            Self::Canceled => "canceled",
            Self::GitError => "git_error",
            Self::PrError => "pr_error",
            Self::AgentError => "agent_error",
            Self::StoreConflict => "store_conflict",
            Self::MigrationMismatch => "migration_mismatch",
            Self::Unknown => "unknown",
        }
    }

    /// Transient/environmental kinds do not consume ticket retries.
    pub fn consumes_retry(&self) -> bool {
        !matches!(self, Self::GitError | Self::PrError | Self::Canceled)
    }
}

/// A run failure as a value (never an exception): the kind plus whatever
/// the component could say about it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunFailure {
    pub kind: FailureKind,
    pub message: String,
}

impl RunFailure {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self { kind, message: message.into() }
    }
}

// ── Proposals ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    Low,
    Medium,
    High,
}

impl Risk {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "low" => Some(Self::Low),
            "medium" => Some(Self::Medium),
            "high" => Some(Self::High),
            _ => None,
        }
    }
}

/// A validated improvement proposal emitted by a scout run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Proposal {
    pub category: String,
    pub title: String,
    pub description: String,
    #[serde(default)]
    pub acceptance_criteria: Vec<String>,
    pub verification_commands: Vec<String>,
    pub allowed_paths: Vec<String>,
    pub files: Vec<String>,
    /// 0–100 after normalization.
    pub confidence: f64,
    /// 1–10 after normalization.
    #[serde(default)]
    pub impact_score: f64,
    #[serde(default)]
    pub rationale: String,
    #[serde(default)]
    pub estimated_complexity: String,
    pub risk: Risk,
    pub touched_files_estimate: i64,
    pub rollback_note: String,
    /// Top-level symbols the change intends to modify; the AST-aware
    /// escape hatch for conflict detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_symbols: Option<Vec<String>>,
}

// ── Learnings ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LearningCategory {
    Pattern,
    Warning,
    Gotcha,
    Context,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LearningSource {
    #[serde(rename = "type")]
    pub source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// A persisted learning. Tags include `path:<dir>` and `cmd:<name>` forms
/// used for relevance selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Learning {
    pub id: String,
    pub text: String,
    pub category: LearningCategory,
    pub source: LearningSource,
    #[serde(default)]
    pub tags: Vec<String>,
    /// 0–100; decays over time, capped at 100.
    pub weight: f64,
    pub created_at: DateTime<Utc>,
    pub last_confirmed_at: DateTime<Utc>,
    #[serde(default)]
    pub access_count: i64,
}

// ── Sectors ──────────────────────────────────────────────────────────────

/// A directory subtree used as the unit of scanning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sector {
    pub path: String,
    pub scan_count: i64,
    pub last_scan_time: Option<DateTime<Utc>>,
    pub proposal_yield: i64,
}

// ── Engine events ────────────────────────────────────────────────────────

/// Session-level events mirrored onto a broadcast channel for observers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EngineEvent {
    CycleStarted { cycle: i64, lens: String, sector: String },
    ScoutCompleted { run_id: String, proposals: usize },
    WaveStarted { wave: usize, tickets: usize },
    TicketStarted { ticket_id: String, run_id: String },
    TicketFinished { ticket_id: String, status: String, failure: Option<String> },
    PrOpened { ticket_id: String, url: String },
    CycleFinished { cycle: i64 },
}

// ── Symbol ranges ────────────────────────────────────────────────────────

/// A top-level symbol in a source file with a 1-based inclusive line range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolRange {
    pub name: String,
    pub start_line: usize,
    pub end_line: usize,
}
