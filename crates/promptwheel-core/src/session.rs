//! The improvement loop: one `Session` per invocation of the engine.
//! Each cycle scouts a (lens, sector), filters proposals into tickets,
//! partitions them into waves, and executes waves strictly sequentially
//! with per-wave concurrency bounded by `config.parallel`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use tokio::sync::{broadcast, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::agent::{AgentBackend, AgentInvocation, AgentOutput};
use crate::config::Config;
use crate::conflict::{CallEdge, ConflictContext, ConflictOptions};
use crate::git::Git;
use crate::index::cache::AstCache;
use crate::index::format::format_index_for_prompt;
use crate::index::{build_index, has_structural_changes, BuildOptions, CodebaseIndex};
use crate::ledger::{
    append_ndjson, ArtifactStore, ArtifactType, ErrorLedgerEntry, HistoryEntry, HistoryTicket,
    ProposalsArtifact,
};
use crate::learnings::{select_relevant, SelectionContext};
use crate::orchestrator::{Orchestrator, TicketOutcome};
use crate::proposals::{
    create_tickets, enrich_with_symbols, expand_test_targets, filter_proposals, PipelineConfig,
};
use crate::recovery::RecoveryAction;
use crate::rotation::{carve_sectors, Rotation, DEFAULT_LENS};
use crate::run_state::{QualitySignal, RunStateStore};
use crate::store::{Store, StoreConflict};
use crate::types::{
    EngineEvent, FailureKind, Learning, Project, Proposal, RunEventType, RunType, Ticket,
    TicketStatus,
};
use crate::worktree::WorktreeManager;

pub struct Session {
    pub config: Arc<Config>,
    pub store: Arc<Store>,
    pub orchestrator: Arc<Orchestrator>,
    pub artifacts: Arc<ArtifactStore>,
    pub run_state: Arc<RunStateStore>,
    pub backends: HashMap<String, Arc<dyn AgentBackend>>,
    pub events: broadcast::Sender<EngineEvent>,
    pub cancel: CancellationToken,

    project: Project,
    rotation: std::sync::Mutex<Rotation>,
    learnings: std::sync::Mutex<Vec<Learning>>,
    index: tokio::sync::Mutex<Option<CodebaseIndex>>,
    ast_cache: std::sync::Mutex<AstCache>,
    pipeline_config: PipelineConfig,
}

pub struct CycleSummary {
    pub cycle: i64,
    pub lens: String,
    pub sector: String,
    pub proposed: usize,
    pub approved: usize,
    pub completed: usize,
    pub failed: usize,
    pub prs_created: usize,
}

impl Session {
    pub fn new(
        config: Arc<Config>,
        store: Arc<Store>,
        backends: HashMap<String, Arc<dyn AgentBackend>>,
        lenses: Vec<String>,
        cancel: CancellationToken,
    ) -> Result<(Arc<Self>, broadcast::Receiver<EngineEvent>)> {
        let (events, rx) = broadcast::channel(256);

        let repo_root = std::path::Path::new(&config.repo_path);
        let project_name = repo_root
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "repo".to_string());
        let project = store.upsert_project(&project_name, "", &config.repo_path)?;

        let mut git = Git::new(config.repo_path.clone());
        if !config.allowed_remote.is_empty() {
            git = git.with_allowed_remote(config.allowed_remote.clone());
        }
        let git = Arc::new(git);
        let worktrees = Arc::new(WorktreeManager::new(
            Arc::clone(&git),
            repo_root,
            &config.base_branch,
            &config.milestone_branch,
        ));
        let artifacts = Arc::new(ArtifactStore::new(config.data_dir()));
        let run_state = Arc::new(RunStateStore::new(config.data_dir().join("run-state.json")));

        let orchestrator = Arc::new(Orchestrator {
            store: Arc::clone(&store),
            config: Arc::clone(&config),
            worktrees,
            git,
            artifacts: Arc::clone(&artifacts),
            events: events.clone(),
        });

        let sectors = carve_sectors(repo_root);
        let mut lens_set = lenses;
        if !lens_set.iter().any(|l| l == DEFAULT_LENS) {
            lens_set.insert(0, DEFAULT_LENS.to_string());
        }

        let learnings = load_learnings(&config.data_dir().join("learnings.json"));
        let ast_cache = AstCache::load(config.data_dir().join("ast-cache.json"));

        let pipeline_config = PipelineConfig {
            min_confidence: config.min_confidence,
            max_proposals_per_scout: config.max_proposals_per_scout,
            default_max_retries: config.default_max_retries,
            ..Default::default()
        };

        let session = Arc::new(Self {
            config,
            store,
            orchestrator,
            artifacts,
            run_state,
            backends,
            events,
            cancel,
            project,
            rotation: std::sync::Mutex::new(Rotation::new(lens_set, sectors)),
            learnings: std::sync::Mutex::new(learnings),
            index: tokio::sync::Mutex::new(None),
            ast_cache: std::sync::Mutex::new(ast_cache),
            pipeline_config,
        });
        Ok((session, rx))
    }

    fn resolve_backend(&self, name: &str) -> Option<Arc<dyn AgentBackend>> {
        self.backends
            .get(name)
            .or_else(|| self.backends.get(&self.config.backend))
            .or_else(|| self.backends.values().next())
            .map(Arc::clone)
    }

    // ── One cycle ─────────────────────────────────────────────────────────

    pub async fn run_cycle(self: &Arc<Self>) -> Result<Option<CycleSummary>> {
        let started = Instant::now();

        // Heal the board before scheduling anything new.
        for (lease_id, ticket_id) in self.store.reclaim_expired()? {
            warn!(%lease_id, %ticket_id, "reclaimed expired lease");
        }

        let state = self.run_state.load();
        let (lens, sector) = {
            let rotation = self.rotation.lock().map_err(|_| anyhow::anyhow!("rotation lock poisoned"))?;
            let stats: BTreeMap<_, _> = state.formulas.clone().into_iter().collect();
            let Some(lens) = rotation.advance_lens(&stats, state.total_cycles) else {
                info!("every (lens, sector) pair is exhausted; nothing to scan");
                return Ok(None);
            };
            let Some(sector) = rotation.select_sector(&lens) else {
                return Ok(None);
            };
            (lens, sector.path.clone())
        };
        let cycle = self.run_state.record_cycle(&lens)?;
        let _ = self.events.send(EngineEvent::CycleStarted {
            cycle,
            lens: lens.clone(),
            sector: sector.clone(),
        });

        // ── Index (cached) ───────────────────────────────────────────────
        let index_block = {
            let mut slot = self.index.lock().await;
            let rebuild = match slot.as_ref() {
                Some(index) => has_structural_changes(index, std::path::Path::new(&self.config.repo_path)),
                None => true,
            };
            if rebuild {
                let mut cache = self
                    .ast_cache
                    .lock()
                    .map_err(|_| anyhow::anyhow!("ast cache lock poisoned"))?;
                let options = BuildOptions { include: Some(sector.clone()), ..Default::default() };
                let built = build_index(std::path::Path::new(&self.config.repo_path), &options, &mut cache)?;
                let live: Vec<String> = built.sampled_file_mtimes.keys().cloned().collect();
                if let Err(e) = cache.save(&live) {
                    warn!("ast cache save: {e:#}");
                }
                *slot = Some(built);
            }
            slot.as_ref().map(|i| format_index_for_prompt(i, cycle)).unwrap_or_default()
        };

        // ── Scout ────────────────────────────────────────────────────────
        let proposals = self.scout(&lens, &sector, &index_block).await?;
        let proposed = proposals.len();
        {
            let mut rotation = self.rotation.lock().map_err(|_| anyhow::anyhow!("rotation lock poisoned"))?;
            rotation.record_lens_scan(&lens, &sector, proposed);
        }
        if self.cancel.is_cancelled() {
            return Ok(None);
        }

        // ── Filter, enrich, ticket ───────────────────────────────────────
        let scout_run = self.store.create_run(&self.project.id, None, RunType::Scout, 1)?;
        self.store.start_run(&scout_run.id)?;

        let existing_titles: Vec<String> = self
            .store
            .list_tickets(&self.project.id, None)?
            .into_iter()
            .map(|t| t.title)
            .collect();
        let raw: Vec<serde_json::Value> = proposals;
        let mut outcome = filter_proposals(&raw, &existing_titles, &self.pipeline_config);

        // Deferred proposals for this sector ride along, capacity allowing.
        for deferred in self.run_state.pop_deferred_for_scope(&sector)? {
            if outcome.accepted.len() < self.pipeline_config.max_proposals_per_scout {
                outcome.accepted.push(deferred);
            } else {
                outcome.overflow.push(deferred);
            }
        }
        for proposal in outcome.overflow.drain(..) {
            self.run_state.defer_proposal(proposal, &sector)?;
        }

        self.store.append_run_event(
            &scout_run.id,
            RunEventType::ProposalsFiltered,
            &serde_json::json!({
                "accepted": outcome.accepted.len(),
                "rejected": outcome.rejected.len(),
            }),
        )?;

        let (symbol_map, conflict_context) = {
            let slot = self.index.lock().await;
            match slot.as_ref() {
                Some(index) => {
                    let ctx = ConflictContext {
                        dependency_edges: index
                            .dependency_edges
                            .iter()
                            .map(|(k, v)| (k.clone(), v.clone()))
                            .collect(),
                        call_edges: index
                            .fused_call_edges()
                            .into_iter()
                            .map(|e| CallEdge { caller: e.caller, callee: e.callee })
                            .collect(),
                    };
                    (index.symbol_map(), ctx)
                }
                None => (HashMap::new(), ConflictContext::default()),
            }
        };

        enrich_with_symbols(&mut outcome.accepted, &symbol_map);
        for proposal in outcome.accepted.iter_mut() {
            expand_test_targets(proposal);
        }

        let _ = self.artifacts.write(
            ArtifactType::Proposals,
            &scout_run.id,
            &ProposalsArtifact {
                run_id: scout_run.id.clone(),
                project_id: self.project.id.clone(),
                project_name: self.project.name.clone(),
                created_at: Utc::now(),
                proposals: outcome.accepted.clone(),
            },
        );

        if outcome.accepted.is_empty() {
            self.store.complete_run(&scout_run.id, crate::types::RunStatus::Success, None, None)?;
            let _ = self.events.send(EngineEvent::CycleFinished { cycle });
            return Ok(Some(CycleSummary {
                cycle,
                lens,
                sector,
                proposed,
                approved: 0,
                completed: 0,
                failed: 0,
                prs_created: 0,
            }));
        }

        let ticket_ids = create_tickets(
            &self.store,
            &self.project.id,
            &scout_run.id,
            &sector,
            &outcome.accepted,
            &self.pipeline_config,
        )?;
        self.store.complete_run(&scout_run.id, crate::types::RunStatus::Success, None, None)?;
        let _ = self.events.send(EngineEvent::ScoutCompleted {
            run_id: scout_run.id.clone(),
            proposals: ticket_ids.len(),
        });

        // ── Waves ────────────────────────────────────────────────────────
        let conflict_options =
            ConflictOptions { sensitivity: self.config.sensitivity, context: conflict_context };
        let waves = crate::waves::partition_into_waves(outcome.accepted.clone(), &conflict_options);
        let ticket_by_title: HashMap<String, String> = outcome
            .accepted
            .iter()
            .zip(ticket_ids.iter())
            .map(|(p, id)| (p.title.clone(), id.clone()))
            .collect();

        self.orchestrator.worktrees.ensure_milestone().await?;

        let mut completed = 0usize;
        let mut failed = 0usize;
        let mut prs_created = 0usize;
        let mut ticket_records: Vec<HistoryTicket> = Vec::new();

        for (wave_no, wave) in waves.iter().enumerate() {
            if self.cancel.is_cancelled() {
                break;
            }
            let _ = self.events.send(EngineEvent::WaveStarted { wave: wave_no, tickets: wave.len() });

            let semaphore = Arc::new(Semaphore::new(self.config.parallel));
            let mut handles = Vec::new();
            for proposal in wave.iter() {
                let Some(ticket_id) = ticket_by_title.get(&proposal.title).cloned() else {
                    continue;
                };
                let session = Arc::clone(self);
                let semaphore = Arc::clone(&semaphore);
                let lens_name = lens.clone();
                let proposal = proposal.clone();
                handles.push(tokio::spawn(async move {
                    let _permit = semaphore.acquire().await.ok()?;
                    Some(session.execute_ticket(&ticket_id, &proposal, &lens_name).await)
                }));
            }

            for handle in handles {
                match handle.await {
                    Ok(Some(Ok(record))) => {
                        match record.status.as_str() {
                            "completed" => {
                                completed += 1;
                                if record.pr_url.is_some() {
                                    prs_created += 1;
                                }
                            }
                            "skipped" => {}
                            _ => failed += 1,
                        }
                        ticket_records.push(record);
                    }
                    Ok(Some(Err(e))) => {
                        warn!("ticket execution error: {e:#}");
                        failed += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("ticket task join error: {e}"),
                }
            }
        }

        // ── Close the loop ───────────────────────────────────────────────
        append_ndjson(
            &self.config.data_dir().join("history.ndjson"),
            &HistoryEntry {
                timestamp: Utc::now(),
                mode: "auto".to_string(),
                scope: sector.clone(),
                formula: Some(lens.clone()),
                tickets_proposed: proposed as i64,
                tickets_approved: ticket_ids.len() as i64,
                tickets_completed: completed as i64,
                tickets_failed: failed as i64,
                prs_created: prs_created as i64,
                prs_merged: 0,
                duration_ms: started.elapsed().as_millis() as i64,
                parallel: self.config.parallel as i64,
                stopped_reason: self.cancel.is_cancelled().then(|| "canceled".to_string()),
                errors: None,
                tickets: Some(ticket_records),
            },
        )?;
        self.save_learnings();

        let _ = self.events.send(EngineEvent::CycleFinished { cycle });
        Ok(Some(CycleSummary {
            cycle,
            lens,
            sector,
            proposed,
            approved: ticket_ids.len(),
            completed,
            failed,
            prs_created,
        }))
    }

    // ── Scout run ─────────────────────────────────────────────────────────

    async fn scout(&self, lens: &str, sector: &str, index_block: &str) -> Result<Vec<serde_json::Value>> {
        let Some(backend) = self.resolve_backend(&self.config.backend) else {
            return Err(anyhow::anyhow!("no agent backends configured"));
        };
        let session_dir = self.config.data_dir().join("sessions").join("scout");
        std::fs::create_dir_all(&session_dir).ok();

        let invocation = AgentInvocation {
            run_id: format!("scout-{lens}-{}", Utc::now().timestamp()),
            instruction: scout_instruction(lens, sector, index_block, self.pipeline_config.max_proposals_per_scout),
            system_prompt: SCOUT_SYSTEM.to_string(),
            worktree_path: self.config.repo_path.clone(),
            session_dir: session_dir.to_string_lossy().to_string(),
            model: self.config.model.clone(),
            resume_session: None,
            allowed_tools: "Read,Glob,Grep,Bash".to_string(),
            timeout_ms: self.config.agent_timeout_ms,
            event_tx: None,
            cancel: self.cancel.clone(),
        };

        let output = backend.run(invocation).await.unwrap_or_else(|e| {
            warn!("scout backend error: {e:#}");
            AgentOutput::failed(String::new())
        });
        Ok(extract_proposal_array(&output.output))
    }

    // ── One ticket end-to-end ─────────────────────────────────────────────

    async fn execute_ticket(
        self: &Arc<Self>,
        ticket_id: &str,
        proposal: &Proposal,
        lens: &str,
    ) -> Result<HistoryTicket> {
        let started = Instant::now();
        let run = self
            .store
            .create_run(&self.project.id, Some(ticket_id), RunType::Worker, 1)?;
        self.store.start_run(&run.id)?;

        // Lease; a conflict means another scheduler path grabbed it.
        let lease = match self.store.lease_ticket(
            ticket_id,
            &format!("promptwheel/{}", std::process::id()),
            &run.id,
            Duration::seconds(self.config.lease_ttl_s),
        ) {
            Ok(lease) => lease,
            Err(e) if e.downcast_ref::<StoreConflict>().is_some() => {
                self.store.complete_run(&run.id, crate::types::RunStatus::Failure, Some("lease conflict"), None)?;
                return Ok(HistoryTicket {
                    id: ticket_id.to_string(),
                    title: proposal.title.clone(),
                    category: Some(proposal.category.clone()),
                    status: "skipped".to_string(),
                    pr_url: None,
                    duration_ms: Some(0),
                    error: Some("store conflict on lease".to_string()),
                    failure_reason: Some(FailureKind::StoreConflict.as_str().to_string()),
                });
            }
            Err(e) => return Err(e),
        };
        self.store.transition_ticket(ticket_id, TicketStatus::Leased, TicketStatus::InProgress)?;
        let _ = self.events.send(EngineEvent::TicketStarted {
            ticket_id: ticket_id.to_string(),
            run_id: run.id.clone(),
        });

        // Background heartbeat for the duration of the attempt.
        let heartbeat = {
            let store = Arc::clone(&self.store);
            let lease_id = lease.id.clone();
            let interval = self.config.heartbeat_interval_s.max(1) as u64;
            let ttl = Duration::seconds(self.config.lease_ttl_s);
            let cancel = self.cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(std::time::Duration::from_secs(interval)) => {
                            if let Err(e) = store.heartbeat_lease(&lease_id, ttl) {
                                warn!(%lease_id, "heartbeat failed: {e:#}");
                            }
                        }
                    }
                }
            })
        };

        let ticket = self
            .store
            .get_ticket(ticket_id)?
            .context("leased ticket vanished")?;
        let relevant = self.relevant_learnings(&ticket);
        let index_block = {
            let slot = self.index.lock().await;
            slot.as_ref().map(|i| format_index_for_prompt(i, 0)).unwrap_or_default()
        };

        let backend = self
            .resolve_backend(&self.config.backend)
            .context("no agent backends configured")?;
        let outcome = self
            .orchestrator
            .run_ticket(&ticket, &run.id, ticket.retry_count + 1, backend, &relevant, &index_block, self.cancel.clone())
            .await;

        heartbeat.abort();
        self.store.release_lease(&lease.id)?;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                // The run row must still terminate even on internal errors.
                let _ = self.store.complete_run(
                    &run.id,
                    crate::types::RunStatus::Failure,
                    Some(&format!("{e:#}")),
                    None,
                );
                return Err(e);
            }
        };
        self.orchestrator.finish_run(&run.id, &outcome)?;

        let record = match &outcome {
            TicketOutcome::Completed { pr_url } => {
                self.store.transition_ticket(ticket_id, TicketStatus::InProgress, TicketStatus::Done)?;
                let signal = if ticket.retry_count == 0 {
                    QualitySignal::FirstPass
                } else {
                    QualitySignal::Retried
                };
                self.run_state.record_quality_signal(signal)?;
                self.run_state.record_formula_ticket_outcome(lens, true)?;
                self.run_state.push_recent_diff(&format!("{}: {}", ticket.id, ticket.title))?;
                self.remember_success(&ticket);
                HistoryTicket {
                    id: ticket_id.to_string(),
                    title: ticket.title.clone(),
                    category: Some(ticket.category.clone()),
                    status: "completed".to_string(),
                    pr_url: pr_url.clone(),
                    duration_ms: Some(started.elapsed().as_millis() as i64),
                    error: None,
                    failure_reason: None,
                }
            }
            TicketOutcome::Failed { failure, spindle_trigger, recovery } => {
                if failure.kind == FailureKind::QaFailed {
                    self.run_state.record_quality_signal(QualitySignal::QaFail)?;
                }
                self.run_state.record_formula_ticket_outcome(lens, false)?;
                self.apply_recovery(&ticket, failure.kind, recovery)?;
                self.record_failure(&ticket, failure.kind, &failure.message, lens);
                let status = if spindle_trigger.is_some() { "spindle_abort" } else { "failed" };
                HistoryTicket {
                    id: ticket_id.to_string(),
                    title: ticket.title.clone(),
                    category: Some(ticket.category.clone()),
                    status: status.to_string(),
                    pr_url: None,
                    duration_ms: Some(started.elapsed().as_millis() as i64),
                    error: Some(failure.message.clone()),
                    failure_reason: Some(failure.kind.as_str().to_string()),
                }
            }
        };

        let _ = self.events.send(EngineEvent::TicketFinished {
            ticket_id: ticket_id.to_string(),
            status: record.status.clone(),
            failure: record.failure_reason.clone(),
        });
        Ok(record)
    }

    /// Map the recovery action onto the ticket's store transition.
    fn apply_recovery(&self, ticket: &Ticket, kind: FailureKind, recovery: &RecoveryAction) -> Result<()> {
        match recovery {
            RecoveryAction::RetryWithHint { hint } if kind.consumes_retry() => {
                self.store.append_ticket_note(&ticket.id, hint)?;
                let target = self.store.record_retryable_failure(&ticket.id)?;
                info!(ticket_id = %ticket.id, status = target.as_str(), "retryable failure recorded");
            }
            RecoveryAction::NarrowScope { files } => {
                self.store.update_ticket_allowed_paths(&ticket.id, files)?;
                let target = self.store.record_retryable_failure(&ticket.id)?;
                info!(ticket_id = %ticket.id, status = target.as_str(), "scope narrowed for retry");
            }
            RecoveryAction::RetryWithHint { hint } => {
                // Retry suggested for a kind that must not consume budget.
                self.store.append_ticket_note(&ticket.id, hint)?;
                self.store.transition_ticket(&ticket.id, TicketStatus::InProgress, TicketStatus::Ready)?;
            }
            RecoveryAction::Skip { .. } if !kind.consumes_retry() => {
                // Environmental: back to ready without spending a retry.
                self.store.transition_ticket(&ticket.id, TicketStatus::InProgress, TicketStatus::Ready)?;
            }
            RecoveryAction::Skip { .. } => {
                self.store.transition_ticket(&ticket.id, TicketStatus::InProgress, TicketStatus::Aborted)?;
            }
        }
        Ok(())
    }

    // ── Learnings ─────────────────────────────────────────────────────────

    fn relevant_learnings(&self, ticket: &Ticket) -> Vec<Learning> {
        let Ok(all) = self.learnings.lock() else {
            return Vec::new();
        };
        let paths: Vec<String> = ticket.allowed_paths.clone();
        let commands = ticket.verification_commands.clone();
        let keywords: Vec<String> = ticket
            .title
            .split_whitespace()
            .filter(|w| w.len() > 3)
            .map(str::to_string)
            .collect();
        select_relevant(
            &all,
            &SelectionContext { paths: &paths, commands: &commands, keywords: &keywords },
            5,
        )
    }

    fn remember_success(&self, ticket: &Ticket) {
        let Ok(mut all) = self.learnings.lock() else { return };
        for l in all.iter_mut() {
            if ticket.allowed_paths.iter().any(|p| l.tags.iter().any(|t| t == &format!("path:{p}"))) {
                l.access_count += 1;
                l.last_confirmed_at = Utc::now();
            }
        }
    }

    fn record_failure(&self, ticket: &Ticket, kind: FailureKind, message: &str, lens: &str) {
        let entry = ErrorLedgerEntry {
            ts: Utc::now(),
            ticket_id: ticket.id.clone(),
            ticket_title: ticket.title.clone(),
            failure_type: kind.as_str().to_string(),
            failed_command: ticket.verification_commands.first().cloned().unwrap_or_default(),
            error_pattern: String::new(),
            error_message: message.chars().take(500).collect(),
            category: Some(ticket.category.clone()),
            phase: match kind {
                FailureKind::QaFailed => "qa",
                FailureKind::GitError => "git",
                FailureKind::PrError => "pr",
                _ => "execute",
            }
            .to_string(),
            session_cycle: self.run_state.load().total_cycles,
            formula: Some(lens.to_string()),
        };
        if let Err(e) = append_ndjson(&self.config.data_dir().join("error-ledger.ndjson"), &entry) {
            warn!("error ledger append: {e:#}");
        }

        let Ok(mut all) = self.learnings.lock() else { return };
        all.push(Learning {
            id: uuid::Uuid::new_v4().to_string(),
            text: format!("{} failed with {}: {}", ticket.category, kind.as_str(), first_line(message)),
            category: crate::types::LearningCategory::Warning,
            source: crate::types::LearningSource {
                source_type: "ticket".to_string(),
                detail: Some(ticket.id.clone()),
            },
            tags: ticket.allowed_paths.iter().map(|p| format!("path:{p}")).collect(),
            weight: 40.0,
            created_at: Utc::now(),
            last_confirmed_at: Utc::now(),
            access_count: 0,
        });
    }

    fn save_learnings(&self) {
        let Ok(mut all) = self.learnings.lock() else { return };
        crate::learnings::apply_learnings_decay(&mut all, 1.0, Utc::now());
        if let Some(consolidated) = crate::learnings::consolidate_learnings(&all) {
            *all = consolidated;
        }
        let path = self.config.data_dir().join("learnings.json");
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let tmp = path.with_extension("json.tmp");
        if let Ok(json) = serde_json::to_string_pretty(&*all) {
            if std::fs::write(&tmp, json).is_ok() {
                let _ = std::fs::rename(&tmp, &path);
            }
        }
    }
}

fn load_learnings(path: &std::path::Path) -> Vec<Learning> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|c| serde_json::from_str(&c).ok())
        .unwrap_or_default()
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

const SCOUT_SYSTEM: &str = "You are a code-quality scout. You propose small, safe, isolated \
improvements. You never edit files. Output ONLY a JSON array of proposal objects.";

fn scout_instruction(lens: &str, sector: &str, index_block: &str, max: usize) -> String {
    let mut s = format!(
        "Scan the `{sector}` subtree with the `{lens}` focus. Propose at most {max} scoped \
         improvements.\n\nEach proposal is a JSON object with: category, title, description, \
         acceptance_criteria, verification_commands, allowed_paths, files, confidence (0-100), \
         impact_score (1-10), rationale, estimated_complexity, risk (low|medium|high), \
         touched_files_estimate, rollback_note, and optional target_symbols (the top-level \
         symbols you intend to modify).\n"
    );
    if !index_block.is_empty() {
        s.push('\n');
        s.push_str(index_block);
        s.push('\n');
    }
    s.push_str("\nOutput ONLY the JSON array.");
    s
}

/// The last JSON array in the scout output, as raw values. Tolerates prose
/// around it; a stream that is not JSON yields no proposals.
fn extract_proposal_array(text: &str) -> Vec<serde_json::Value> {
    let mut depth = 0i32;
    let mut start = None;
    let mut candidates: Vec<&str> = Vec::new();
    let mut in_string = false;
    let mut escaped = false;
    for (i, c) in text.char_indices() {
        if in_string {
            match c {
                '\\' if !escaped => escaped = true,
                '"' if !escaped => in_string = false,
                _ => escaped = false,
            }
            continue;
        }
        match c {
            '"' => in_string = true,
            '[' => {
                if depth == 0 {
                    start = Some(i);
                }
                depth += 1;
            }
            ']' => {
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
    candidates
        .into_iter()
        .rev()
        .find_map(|c| serde_json::from_str::<Vec<serde_json::Value>>(c).ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proposal_array_extraction_tolerates_prose() {
        let text = "I looked around.\n```json\n[{\"title\": \"a\"}, {\"title\": \"b\"}]\n```\nDone.";
        let arr = extract_proposal_array(text);
        assert_eq!(arr.len(), 2);
        assert_eq!(arr[0]["title"], "a");
    }

    #[test]
    fn proposal_array_extraction_handles_nested_brackets_in_strings() {
        let text = "[{\"title\": \"fix [weird] name\", \"files\": [\"a.rs\"]}]";
        let arr = extract_proposal_array(text);
        assert_eq!(arr.len(), 1);
        assert_eq!(arr[0]["files"][0], "a.rs");
    }

    #[test]
    fn non_json_output_yields_no_proposals() {
        assert!(extract_proposal_array("no proposals today").is_empty());
    }
}
