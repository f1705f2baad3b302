//! Durable tickets/runs/leases in a single-writer sqlite store.
//!
//! Every status transition is a conditional single-row update inside a
//! transaction; a transition whose expected "from" status no longer holds
//! reports `store_conflict` and the scheduler picks another ticket.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{info, warn};

use crate::types::{
    Lease, LeaseStatus, Project, Run, RunEvent, RunEventType, RunStatus, RunStep, RunType,
    StepKind, StepStatus, Ticket, TicketStatus,
};

const SCHEMA_SQL: &str = include_str!("../../../schema.sql");

/// Ordered, append-only migration list. Changing the text of a committed
/// migration changes its checksum and the store refuses to open.
fn migrations() -> Vec<(&'static str, &'static str)> {
    vec![("0001_initial", SCHEMA_SQL)]
}

pub struct Store {
    conn: Mutex<Connection>,
}

/// Failed conditional transition: the row was not in the expected state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConflict {
    pub ticket_id: String,
    pub expected: TicketStatus,
}

impl std::fmt::Display for StoreConflict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ticket {} was not in status {}", self.ticket_id, self.expected.as_str())
    }
}

impl std::error::Error for StoreConflict {}

// ── Timestamp helpers ────────────────────────────────────────────────────

fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn ts_str(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

fn parse_opt_ts(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|v| parse_ts(&v))
}

fn new_id(prefix: &str) -> String {
    format!("{prefix}_{}", uuid::Uuid::new_v4().simple())
}

fn json_list(items: &[String]) -> String {
    serde_json::to_string(items).unwrap_or_else(|_| "[]".to_string())
}

fn parse_json_list(raw: &str) -> Vec<String> {
    serde_json::from_str(raw).unwrap_or_default()
}

// ── Row mappers ──────────────────────────────────────────────────────────

fn row_to_ticket(row: &rusqlite::Row<'_>) -> rusqlite::Result<Ticket> {
    let status_str: String = row.get(4)?;
    let allowed: String = row.get(8)?;
    let forbidden: String = row.get(9)?;
    let verification: String = row.get(10)?;
    let created_at: String = row.get(13)?;
    let updated_at: String = row.get(14)?;
    Ok(Ticket {
        id: row.get(0)?,
        project_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        status: TicketStatus::parse(&status_str).unwrap_or(TicketStatus::Backlog),
        priority: row.get(5)?,
        shard: row.get(6)?,
        category: row.get(7)?,
        allowed_paths: parse_json_list(&allowed),
        forbidden_paths: parse_json_list(&forbidden),
        verification_commands: parse_json_list(&verification),
        max_retries: row.get(11)?,
        retry_count: row.get(12)?,
        created_at: parse_ts(&created_at),
        updated_at: parse_ts(&updated_at),
    })
}

const TICKET_COLUMNS: &str = "id, project_id, title, description, status, priority, shard, \
     category, allowed_paths, forbidden_paths, verification_commands, max_retries, retry_count, \
     created_at, updated_at";

fn row_to_run(row: &rusqlite::Row<'_>) -> rusqlite::Result<Run> {
    let run_type: String = row.get(3)?;
    let status: String = row.get(4)?;
    let metadata: String = row.get(10)?;
    let created_at: String = row.get(13)?;
    Ok(Run {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        project_id: row.get(2)?,
        run_type: match run_type.as_str() {
            "scout" => RunType::Scout,
            "qa" => RunType::Qa,
            _ => RunType::Worker,
        },
        status: match status.as_str() {
            "running" => RunStatus::Running,
            "success" => RunStatus::Success,
            "failure" => RunStatus::Failure,
            _ => RunStatus::Pending,
        },
        iteration: row.get(5)?,
        max_iterations: row.get(6)?,
        started_at: parse_opt_ts(row.get(7)?),
        completed_at: parse_opt_ts(row.get(8)?),
        error: row.get(9)?,
        metadata: serde_json::from_str(&metadata).unwrap_or_default(),
        pr_url: row.get(11)?,
        pr_number: row.get(12)?,
        created_at: parse_ts(&created_at),
    })
}

const RUN_COLUMNS: &str = "id, ticket_id, project_id, type, status, iteration, max_iterations, \
     started_at, completed_at, error, metadata, pr_url, pr_number, created_at";

fn row_to_lease(row: &rusqlite::Row<'_>) -> rusqlite::Result<Lease> {
    let status: String = row.get(4)?;
    let expires_at: String = row.get(5)?;
    let heartbeat_at: String = row.get(6)?;
    let created_at: String = row.get(7)?;
    Ok(Lease {
        id: row.get(0)?,
        ticket_id: row.get(1)?,
        run_id: row.get(2)?,
        agent_id: row.get(3)?,
        status: match status.as_str() {
            "expired" => LeaseStatus::Expired,
            "released" => LeaseStatus::Released,
            _ => LeaseStatus::Issued,
        },
        expires_at: parse_ts(&expires_at),
        heartbeat_at: parse_ts(&heartbeat_at),
        created_at: parse_ts(&created_at),
    })
}

const LEASE_COLUMNS: &str =
    "id, ticket_id, run_id, agent_id, status, expires_at, heartbeat_at, created_at";

impl Store {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path).with_context(|| format!("open {}", path.display()))?;
        conn.pragma_update(None, "journal_mode", "WAL").context("enable WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON").context("enable foreign keys")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("open in-memory store")?;
        conn.pragma_update(None, "foreign_keys", "ON").context("enable foreign keys")?;
        let store = Self { conn: Mutex::new(conn) };
        store.migrate()?;
        Ok(store)
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| anyhow!("store mutex poisoned"))
    }

    // ── Migrations ────────────────────────────────────────────────────────

    fn migrate(&self) -> Result<()> {
        let mut conn = self.lock()?;
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                 id TEXT PRIMARY KEY, checksum TEXT NOT NULL, applied_at TEXT NOT NULL)",
            [],
        )?;

        for (id, sql) in migrations() {
            let checksum = hex_sha256(sql);
            let existing: Option<String> = conn
                .query_row("SELECT checksum FROM schema_migrations WHERE id = ?1", params![id], |r| {
                    r.get(0)
                })
                .optional()?;
            match existing {
                Some(stored) if stored == checksum => {}
                Some(stored) => {
                    return Err(anyhow!(
                        "migration {id} checksum mismatch (stored {stored}, computed {checksum}); \
                         refusing to continue"
                    ));
                }
                None => {
                    let tx = conn.transaction()?;
                    tx.execute_batch(sql).with_context(|| format!("apply migration {id}"))?;
                    tx.execute(
                        "INSERT INTO schema_migrations (id, checksum, applied_at) VALUES (?1, ?2, ?3)",
                        params![id, checksum, now_str()],
                    )?;
                    tx.commit()?;
                    info!(migration = id, "applied store migration");
                }
            }
        }
        Ok(())
    }

    // ── Projects ──────────────────────────────────────────────────────────

    pub fn upsert_project(&self, name: &str, repo_url: &str, root_path: &str) -> Result<Project> {
        let conn = self.lock()?;
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM projects WHERE root_path = ?1",
                params![root_path],
                |r| r.get(0),
            )
            .optional()?;
        let id = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE projects SET name = ?2, repo_url = ?3, updated_at = ?4 WHERE id = ?1",
                    params![id, name, repo_url, now_str()],
                )?;
                id
            }
            None => {
                let id = new_id("prj");
                conn.execute(
                    "INSERT INTO projects (id, name, repo_url, root_path, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                    params![id, name, repo_url, root_path, now_str()],
                )?;
                id
            }
        };
        conn.query_row(
            "SELECT id, name, repo_url, root_path, created_at, updated_at FROM projects WHERE id = ?1",
            params![id],
            |row| {
                let created: String = row.get(4)?;
                let updated: String = row.get(5)?;
                Ok(Project {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    repo_url: row.get(2)?,
                    root_path: row.get(3)?,
                    created_at: parse_ts(&created),
                    updated_at: parse_ts(&updated),
                })
            },
        )
        .context("read back project")
    }

    // ── Tickets ───────────────────────────────────────────────────────────

    pub fn insert_ticket(&self, ticket: &Ticket) -> Result<()> {
        let conn = self.lock()?;
        insert_ticket_with(&conn, ticket)
    }

    /// One multi-insert transaction: either every ticket lands or none.
    pub fn insert_tickets(&self, tickets: &[Ticket]) -> Result<()> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        for ticket in tickets {
            insert_ticket_with(&tx, ticket)?;
        }
        tx.commit()?;
        Ok(())
    }

    pub fn get_ticket(&self, id: &str) -> Result<Option<Ticket>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {TICKET_COLUMNS} FROM tickets WHERE id = ?1"),
            params![id],
            row_to_ticket,
        )
        .optional()
        .context("get_ticket")
    }

    pub fn list_tickets(&self, project_id: &str, status: Option<TicketStatus>) -> Result<Vec<Ticket>> {
        let conn = self.lock()?;
        let mut out = Vec::new();
        match status {
            Some(status) => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets
                     WHERE project_id = ?1 AND status = ?2
                     ORDER BY priority DESC, created_at ASC"
                ))?;
                let rows = stmt.query_map(params![project_id, status.as_str()], row_to_ticket)?;
                for row in rows {
                    out.push(row?);
                }
            }
            None => {
                let mut stmt = conn.prepare(&format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets WHERE project_id = ?1
                     ORDER BY priority DESC, created_at ASC"
                ))?;
                let rows = stmt.query_map(params![project_id], row_to_ticket)?;
                for row in rows {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    /// Conditional transition. `Err(StoreConflict)` (wrapped) when the
    /// ticket was not in `from` — the caller treats that as store_conflict.
    pub fn transition_ticket(&self, id: &str, from: TicketStatus, to: TicketStatus) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tickets SET status = ?3, updated_at = ?4 WHERE id = ?1 AND status = ?2",
            params![id, from.as_str(), to.as_str(), now_str()],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreConflict { ticket_id: id.to_string(), expected: from }.into())
        }
    }

    /// A retryable failure: bump retry_count; under the limit the ticket
    /// goes back to ready, at the limit it blocks. One transaction.
    pub fn record_retryable_failure(&self, id: &str) -> Result<TicketStatus> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let (retry_count, max_retries): (i64, i64) = tx
            .query_row(
                "SELECT retry_count, max_retries FROM tickets WHERE id = ?1 AND status = 'in_progress'",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?)),
            )
            .optional()?
            .ok_or_else(|| anyhow::Error::from(StoreConflict {
                ticket_id: id.to_string(),
                expected: TicketStatus::InProgress,
            }))?;

        let next_count = retry_count + 1;
        let target = if next_count >= max_retries { TicketStatus::Blocked } else { TicketStatus::Ready };
        tx.execute(
            "UPDATE tickets SET status = ?2, retry_count = ?3, updated_at = ?4
             WHERE id = ?1 AND status = 'in_progress'",
            params![id, target.as_str(), next_count, now_str()],
        )?;
        tx.commit()?;
        Ok(target)
    }

    /// Operator heal: blocked → ready, retry budget restored.
    pub fn heal_ticket(&self, id: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE tickets SET status = 'ready', retry_count = 0, updated_at = ?2
             WHERE id = ?1 AND status = 'blocked'",
            params![id, now_str()],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(StoreConflict { ticket_id: id.to_string(), expected: TicketStatus::Blocked }.into())
        }
    }

    /// Append a recovery hint to the ticket description so the next
    /// attempt's instruction carries it.
    pub fn append_ticket_note(&self, id: &str, note: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tickets SET description = description || ?2, updated_at = ?3 WHERE id = ?1",
            params![id, format!("\n\nNote from previous attempt: {note}"), now_str()],
        )?;
        Ok(())
    }

    /// Narrow a ticket's allowed paths (recovery's narrow-scope action).
    pub fn update_ticket_allowed_paths(&self, id: &str, allowed: &[String]) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE tickets SET allowed_paths = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, json_list(allowed), now_str()],
        )?;
        Ok(())
    }

    // ── Leases ────────────────────────────────────────────────────────────

    /// Lease the highest-priority ready ticket: status flip, lease row,
    /// and read-back happen in one transaction.
    pub fn lease_next_ready(
        &self,
        project_id: &str,
        agent_id: &str,
        run_id: &str,
        ttl: Duration,
    ) -> Result<Option<(Ticket, Lease)>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let ticket = tx
            .query_row(
                &format!(
                    "SELECT {TICKET_COLUMNS} FROM tickets
                     WHERE project_id = ?1 AND status = 'ready'
                     ORDER BY priority DESC, created_at ASC LIMIT 1"
                ),
                params![project_id],
                row_to_ticket,
            )
            .optional()?;
        let Some(mut ticket) = ticket else {
            return Ok(None);
        };

        let changed = tx.execute(
            "UPDATE tickets SET status = 'leased', updated_at = ?2 WHERE id = ?1 AND status = 'ready'",
            params![ticket.id, now_str()],
        )?;
        if changed != 1 {
            return Err(StoreConflict { ticket_id: ticket.id, expected: TicketStatus::Ready }.into());
        }
        ticket.status = TicketStatus::Leased;

        let lease_id = new_id("lease");
        let now = Utc::now();
        let expires = now + ttl;
        tx.execute(
            "INSERT INTO leases (id, ticket_id, run_id, agent_id, status, expires_at, heartbeat_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 'issued', ?5, ?6, ?6)",
            params![lease_id, ticket.id, run_id, agent_id, ts_str(expires), ts_str(now)],
        )?;
        tx.commit()?;

        Ok(Some((
            ticket.clone(),
            Lease {
                id: lease_id,
                ticket_id: ticket.id,
                run_id: run_id.to_string(),
                agent_id: agent_id.to_string(),
                status: LeaseStatus::Issued,
                expires_at: expires,
                heartbeat_at: now,
                created_at: now,
            },
        )))
    }

    /// Lease one specific ticket (wave scheduling picks its members
    /// explicitly). Same transaction shape as `lease_next_ready`.
    pub fn lease_ticket(
        &self,
        ticket_id: &str,
        agent_id: &str,
        run_id: &str,
        ttl: Duration,
    ) -> Result<Lease> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE tickets SET status = 'leased', updated_at = ?2 WHERE id = ?1 AND status = 'ready'",
            params![ticket_id, now_str()],
        )?;
        if changed != 1 {
            return Err(StoreConflict {
                ticket_id: ticket_id.to_string(),
                expected: TicketStatus::Ready,
            }
            .into());
        }
        let lease_id = new_id("lease");
        let now = Utc::now();
        let expires = now + ttl;
        tx.execute(
            "INSERT INTO leases (id, ticket_id, run_id, agent_id, status, expires_at, heartbeat_at, created_at)
             VALUES (?1, ?2, ?3, ?4, 'issued', ?5, ?6, ?6)",
            params![lease_id, ticket_id, run_id, agent_id, ts_str(expires), ts_str(now)],
        )?;
        tx.commit()?;
        Ok(Lease {
            id: lease_id,
            ticket_id: ticket_id.to_string(),
            run_id: run_id.to_string(),
            agent_id: agent_id.to_string(),
            status: LeaseStatus::Issued,
            expires_at: expires,
            heartbeat_at: now,
            created_at: now,
        })
    }

    pub fn heartbeat_lease(&self, lease_id: &str, extend_by: Duration) -> Result<()> {
        let conn = self.lock()?;
        let now = Utc::now();
        let changed = conn.execute(
            "UPDATE leases SET heartbeat_at = ?2, expires_at = ?3 WHERE id = ?1 AND status = 'issued'",
            params![lease_id, ts_str(now), ts_str(now + extend_by)],
        )?;
        if changed != 1 {
            warn!(lease_id, "heartbeat on a lease that is no longer issued");
        }
        Ok(())
    }

    pub fn release_lease(&self, lease_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE leases SET status = 'released' WHERE id = ?1 AND status = 'issued'",
            params![lease_id],
        )?;
        Ok(())
    }

    /// Expire every overdue issued lease and return its ticket to ready,
    /// atomically per lease. Returns the affected (lease, ticket) ids.
    pub fn reclaim_expired(&self) -> Result<Vec<(String, String)>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let now = now_str();

        let overdue: Vec<(String, String)> = {
            let mut stmt = tx.prepare(
                "SELECT id, ticket_id FROM leases WHERE status = 'issued' AND expires_at < ?1",
            )?;
            let rows = stmt.query_map(params![now], |r| Ok((r.get(0)?, r.get(1)?)))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        for (lease_id, ticket_id) in &overdue {
            tx.execute("UPDATE leases SET status = 'expired' WHERE id = ?1", params![lease_id])?;
            // Reclaim never touches retry_count.
            tx.execute(
                "UPDATE tickets SET status = 'ready', updated_at = ?2
                 WHERE id = ?1 AND status IN ('leased', 'in_progress')",
                params![ticket_id, now],
            )?;
        }
        tx.commit()?;
        Ok(overdue)
    }

    pub fn issued_lease_count(&self, ticket_id: &str) -> Result<i64> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT COUNT(*) FROM leases WHERE ticket_id = ?1 AND status = 'issued'",
            params![ticket_id],
            |r| r.get(0),
        )
        .context("issued_lease_count")
    }

    pub fn get_lease(&self, lease_id: &str) -> Result<Option<Lease>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {LEASE_COLUMNS} FROM leases WHERE id = ?1"),
            params![lease_id],
            row_to_lease,
        )
        .optional()
        .context("get_lease")
    }

    // ── Runs ──────────────────────────────────────────────────────────────

    pub fn create_run(
        &self,
        project_id: &str,
        ticket_id: Option<&str>,
        run_type: RunType,
        max_iterations: i64,
    ) -> Result<Run> {
        let conn = self.lock()?;
        let id = new_id("run");
        conn.execute(
            "INSERT INTO runs (id, ticket_id, project_id, type, status, iteration, max_iterations, metadata, created_at)
             VALUES (?1, ?2, ?3, ?4, 'pending', 0, ?5, '{}', ?6)",
            params![id, ticket_id, project_id, run_type.as_str(), max_iterations, now_str()],
        )?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![id],
            row_to_run,
        )
        .context("read back run")
    }

    /// pending → running; at most one such transition per run.
    pub fn start_run(&self, run_id: &str) -> Result<()> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE runs SET status = 'running', started_at = ?2 WHERE id = ?1 AND status = 'pending'",
            params![run_id, now_str()],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(anyhow!("run {run_id} already started"))
        }
    }

    /// running → success|failure; exactly one terminal transition.
    pub fn complete_run(
        &self,
        run_id: &str,
        status: RunStatus,
        error: Option<&str>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<()> {
        if !matches!(status, RunStatus::Success | RunStatus::Failure) {
            return Err(anyhow!("complete_run requires a terminal status"));
        }
        let conn = self.lock()?;
        let meta_json = metadata
            .map(|m| m.to_string())
            .unwrap_or_else(|| "{}".to_string());
        let changed = conn.execute(
            "UPDATE runs SET status = ?2, completed_at = ?3, error = ?4,
                 metadata = json_patch(metadata, ?5)
             WHERE id = ?1 AND status = 'running'",
            params![run_id, status.as_str(), now_str(), error, meta_json],
        )?;
        if changed == 1 {
            Ok(())
        } else {
            Err(anyhow!("run {run_id} was not running"))
        }
    }

    pub fn set_run_pr(&self, run_id: &str, pr_url: &str, pr_number: Option<i64>) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE runs SET pr_url = ?2, pr_number = ?3 WHERE id = ?1",
            params![run_id, pr_url, pr_number],
        )?;
        Ok(())
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {RUN_COLUMNS} FROM runs WHERE id = ?1"),
            params![run_id],
            row_to_run,
        )
        .optional()
        .context("get_run")
    }

    pub fn bump_run_iteration(&self, run_id: &str) -> Result<()> {
        let conn = self.lock()?;
        conn.execute("UPDATE runs SET iteration = iteration + 1 WHERE id = ?1", params![run_id])?;
        Ok(())
    }

    // ── Run events ────────────────────────────────────────────────────────

    pub fn append_run_event(
        &self,
        run_id: &str,
        event_type: RunEventType,
        data: &serde_json::Value,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO run_events (run_id, type, data, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![run_id, event_type.as_str(), data.to_string(), now_str()],
        )?;
        Ok(())
    }

    pub fn list_run_events(&self, run_id: &str) -> Result<Vec<RunEvent>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, type, data, created_at FROM run_events WHERE run_id = ?1 ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            let type_str: String = row.get(2)?;
            let data: String = row.get(3)?;
            let created: String = row.get(4)?;
            Ok(RunEvent {
                id: row.get(0)?,
                run_id: row.get(1)?,
                event_type: parse_event_type(&type_str),
                data: serde_json::from_str(&data).unwrap_or(serde_json::Value::Null),
                created_at: parse_ts(&created),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // ── Run steps ─────────────────────────────────────────────────────────

    /// Insert the next step for (run, attempt): ordinal is assigned
    /// gap-free from 1 inside the same transaction that inserts the row.
    pub fn insert_run_step(
        &self,
        run_id: &str,
        attempt: i64,
        name: &str,
        kind: StepKind,
        cmd: Option<&str>,
        cwd: Option<&str>,
        timeout_ms: Option<i64>,
    ) -> Result<i64> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let next_ordinal: i64 = tx.query_row(
            "SELECT COALESCE(MAX(ordinal), 0) + 1 FROM run_steps WHERE run_id = ?1 AND attempt = ?2",
            params![run_id, attempt],
            |r| r.get(0),
        )?;
        let now_ms = Utc::now().timestamp_millis();
        tx.execute(
            "INSERT INTO run_steps (run_id, attempt, ordinal, name, kind, status, cmd, cwd,
                 timeout_ms, created_at_ms, updated_at_ms)
             VALUES (?1, ?2, ?3, ?4, ?5, 'queued', ?6, ?7, ?8, ?9, ?9)",
            params![run_id, attempt, next_ordinal, name, kind.as_str(), cmd, cwd, timeout_ms, now_ms],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    pub fn start_run_step(&self, step_id: i64) -> Result<()> {
        let conn = self.lock()?;
        let now_ms = Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE run_steps SET status = 'running', started_at_ms = ?2, updated_at_ms = ?2 WHERE id = ?1",
            params![step_id, now_ms],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finish_run_step(
        &self,
        step_id: i64,
        status: StepStatus,
        exit_code: Option<i64>,
        stdout_tail: Option<&str>,
        stderr_tail: Option<&str>,
        stdout_bytes: i64,
        stderr_bytes: i64,
        error_message: Option<&str>,
    ) -> Result<()> {
        let conn = self.lock()?;
        let now_ms = Utc::now().timestamp_millis();
        conn.execute(
            "UPDATE run_steps SET status = ?2, exit_code = ?3, stdout_tail = ?4, stderr_tail = ?5,
                 stdout_bytes = ?6, stderr_bytes = ?7,
                 stdout_truncated = (CASE WHEN ?6 > LENGTH(COALESCE(?4, '')) THEN 1 ELSE 0 END),
                 stderr_truncated = (CASE WHEN ?7 > LENGTH(COALESCE(?5, '')) THEN 1 ELSE 0 END),
                 error_message = ?8, ended_at_ms = ?9,
                 duration_ms = CASE WHEN started_at_ms IS NULL THEN NULL ELSE ?9 - started_at_ms END,
                 updated_at_ms = ?9
             WHERE id = ?1",
            params![
                step_id,
                status.as_str(),
                exit_code,
                stdout_tail,
                stderr_tail,
                stdout_bytes,
                stderr_bytes,
                error_message,
                now_ms
            ],
        )?;
        Ok(())
    }

    pub fn list_run_steps(&self, run_id: &str, attempt: i64) -> Result<Vec<RunStep>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT id, run_id, attempt, ordinal, name, kind, status, cmd, cwd, timeout_ms,
                    exit_code, signal, started_at_ms, ended_at_ms, duration_ms, stdout_path,
                    stderr_path, stdout_bytes, stderr_bytes, stdout_truncated, stderr_truncated,
                    stdout_tail, stderr_tail, error_message, meta_json
             FROM run_steps WHERE run_id = ?1 AND attempt = ?2 ORDER BY ordinal ASC",
        )?;
        let rows = stmt.query_map(params![run_id, attempt], |row| {
            let kind: String = row.get(5)?;
            let status: String = row.get(6)?;
            Ok(RunStep {
                id: row.get(0)?,
                run_id: row.get(1)?,
                attempt: row.get(2)?,
                ordinal: row.get(3)?,
                name: row.get(4)?,
                kind: match kind.as_str() {
                    "llm_fix" => StepKind::LlmFix,
                    "git" => StepKind::Git,
                    "internal" => StepKind::Internal,
                    _ => StepKind::Command,
                },
                status: match status.as_str() {
                    "running" => StepStatus::Running,
                    "success" => StepStatus::Success,
                    "failed" => StepStatus::Failed,
                    "skipped" => StepStatus::Skipped,
                    "canceled" => StepStatus::Canceled,
                    _ => StepStatus::Queued,
                },
                cmd: row.get(7)?,
                cwd: row.get(8)?,
                timeout_ms: row.get(9)?,
                exit_code: row.get(10)?,
                signal: row.get(11)?,
                started_at_ms: row.get(12)?,
                ended_at_ms: row.get(13)?,
                duration_ms: row.get(14)?,
                stdout_path: row.get(15)?,
                stderr_path: row.get(16)?,
                stdout_bytes: row.get(17)?,
                stderr_bytes: row.get(18)?,
                stdout_truncated: row.get::<_, i64>(19)? != 0,
                stderr_truncated: row.get::<_, i64>(20)? != 0,
                stdout_tail: row.get(21)?,
                stderr_tail: row.get(22)?,
                error_message: row.get(23)?,
                meta_json: row.get(24)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Mark any still-running step of a run as canceled (clean shutdown).
    pub fn cancel_open_run_steps(&self, run_id: &str) -> Result<usize> {
        let conn = self.lock()?;
        let now_ms = Utc::now().timestamp_millis();
        let changed = conn.execute(
            "UPDATE run_steps SET status = 'canceled', ended_at_ms = ?2, updated_at_ms = ?2
             WHERE run_id = ?1 AND status IN ('queued', 'running')",
            params![run_id, now_ms],
        )?;
        Ok(changed)
    }

    // ── Artifacts (row index over the on-disk blobs) ─────────────────────

    pub fn insert_artifact_row(
        &self,
        run_id: &str,
        artifact_type: &str,
        name: &str,
        path: &str,
    ) -> Result<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO artifacts (run_id, type, name, content, path, created_at)
             VALUES (?1, ?2, ?3, '', ?4, ?5)",
            params![run_id, artifact_type, name, path, now_str()],
        )?;
        Ok(())
    }

    // ── Learnings rows ────────────────────────────────────────────────────

    pub fn insert_learning_row(
        &self,
        project_id: &str,
        ticket_id: Option<&str>,
        run_id: Option<&str>,
        content: &str,
        source: &str,
    ) -> Result<String> {
        let conn = self.lock()?;
        let id = new_id("lrn");
        conn.execute(
            "INSERT INTO learnings (id, project_id, ticket_id, run_id, content, source, promoted, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, ?7)",
            params![id, project_id, ticket_id, run_id, content, source, now_str()],
        )?;
        Ok(id)
    }
}

fn insert_ticket_with(conn: &Connection, ticket: &Ticket) -> Result<()> {
    conn.execute(
        "INSERT INTO tickets (id, project_id, title, description, status, priority, shard,
             category, allowed_paths, forbidden_paths, verification_commands, max_retries,
             retry_count, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?14)",
        params![
            ticket.id,
            ticket.project_id,
            ticket.title,
            ticket.description,
            ticket.status.as_str(),
            ticket.priority,
            ticket.shard,
            ticket.category,
            json_list(&ticket.allowed_paths),
            json_list(&ticket.forbidden_paths),
            json_list(&ticket.verification_commands),
            ticket.max_retries,
            ticket.retry_count,
            now_str(),
        ],
    )
    .with_context(|| format!("insert ticket {}", ticket.id))?;
    Ok(())
}

fn parse_event_type(s: &str) -> RunEventType {
    match s {
        "TICKETS_CREATED" => RunEventType::TicketsCreated,
        "PROPOSALS_FILTERED" => RunEventType::ProposalsFiltered,
        "SCOPE_VIOLATION" => RunEventType::ScopeViolation,
        "SPINDLE_ABORT" => RunEventType::SpindleAbort,
        "QA_PASS" => RunEventType::QaPass,
        "QA_FAIL" => RunEventType::QaFail,
        "PLAN_REJECTED" => RunEventType::PlanRejected,
        "LEASE_EXPIRED" => RunEventType::LeaseExpired,
        "MERGE_RESOLVED" => RunEventType::MergeResolved,
        _ => RunEventType::PrCreated,
    }
}

fn hex_sha256(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}
