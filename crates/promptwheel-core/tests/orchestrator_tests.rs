//! End-to-end run-machine tests with a scripted agent backend: plan →
//! execute → verify → integrate, plus the qa-failure and scope-violation
//! exits, against a real temporary git repository.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use promptwheel_core::agent::{AgentBackend, AgentInvocation, AgentOutput, AgentStreamEvent};
use promptwheel_core::config::Config;
use promptwheel_core::conflict::Sensitivity;
use promptwheel_core::git::Git;
use promptwheel_core::ledger::ArtifactStore;
use promptwheel_core::orchestrator::{Orchestrator, TicketOutcome};
use promptwheel_core::store::Store;
use promptwheel_core::types::{FailureKind, RunType, Ticket, TicketStatus};
use promptwheel_core::worktree::WorktreeManager;
use tokio_util::sync::CancellationToken;

/// Writes a fixed file into the worktree during "execute" and answers the
/// plan phase with a fixed JSON plan.
struct ScriptedBackend {
    plan_json: String,
    write_rel_path: String,
    file_content: String,
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    fn name(&self) -> &'static str {
        "scripted"
    }

    async fn run(&self, invocation: AgentInvocation) -> Result<AgentOutput> {
        if invocation.allowed_tools == "Read,Glob,Grep" {
            // Plan phase.
            return Ok(AgentOutput {
                output: self.plan_json.clone(),
                raw_stream: String::new(),
                session_id: None,
                success: true,
            });
        }
        // Execute phase: one write, reported through the event feed.
        let target = std::path::Path::new(&invocation.worktree_path).join(&self.write_rel_path);
        if let Some(parent) = target.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        std::fs::write(&target, &self.file_content)?;
        if let Some(tx) = &invocation.event_tx {
            let _ = tx.send(AgentStreamEvent::ToolUse {
                name: "Write".to_string(),
                target: self.write_rel_path.clone(),
                content: Some(self.file_content.clone()),
            });
            let _ = tx.send(AgentStreamEvent::Text { text: "wrote the change".to_string() });
        }
        Ok(AgentOutput {
            output: "change applied".to_string(),
            raw_stream: String::new(),
            session_id: None,
            success: true,
        })
    }
}

fn test_config(repo: &std::path::Path) -> Config {
    Config {
        repo_path: repo.to_string_lossy().to_string(),
        base_branch: "main".to_string(),
        milestone_branch: "promptwheel/milestone".to_string(),
        allowed_remote: String::new(),
        backend: "scripted".to_string(),
        model: "test-model".to_string(),
        agent_timeout_ms: 60_000,
        kill_grace_ms: 1_000,
        parallel: 1,
        lease_ttl_s: 60,
        heartbeat_interval_s: 10,
        ticket_step_budget: 50,
        max_lines_per_ticket: 400,
        min_confidence: 40.0,
        max_proposals_per_scout: 6,
        default_max_retries: 2,
        sensitivity: Sensitivity::Normal,
        token_budget_abort: 400_000,
        max_stall_iterations: 8,
        integration_timeout_ms: 60_000,
        enable_custom_tools: false,
        create_pr: false,
        draft_pr: false,
        skip_qa: false,
    }
}

fn init_repo(dir: &std::path::Path) -> Arc<Git> {
    let git = Git::new(dir.to_string_lossy().to_string());
    let run = |args: &[&str]| {
        let out = git.exec(&git.repo_path, args).expect("git");
        assert!(out.success(), "git {args:?}: {}", out.combined_output());
    };
    run(&["init", "-b", "main"]);
    run(&["config", "user.email", "test@example.com"]);
    run(&["config", "user.name", "Test"]);
    std::fs::create_dir_all(dir.join("src")).expect("mkdir");
    std::fs::write(dir.join("src/lib.rs"), "pub fn v() -> u32 { 1 }\n").expect("write");
    run(&["add", "-A"]);
    run(&["commit", "-m", "init"]);
    Arc::new(git)
}

struct Harness {
    _dir: tempfile::TempDir,
    store: Arc<Store>,
    orchestrator: Orchestrator,
    project_id: String,
}

async fn harness(verification: &str) -> (Harness, Ticket) {
    let dir = tempfile::tempdir().expect("tempdir");
    let git = init_repo(dir.path());
    let config = Arc::new(test_config(dir.path()));
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let project = store.upsert_project("demo", "", &config.repo_path).expect("project");

    let worktrees = Arc::new(WorktreeManager::new(
        Arc::clone(&git),
        dir.path(),
        "main",
        "promptwheel/milestone",
    ));
    worktrees.ensure_milestone().await.expect("milestone");

    let (events, _rx) = tokio::sync::broadcast::channel(64);
    let orchestrator = Orchestrator {
        store: Arc::clone(&store),
        config: Arc::clone(&config),
        worktrees,
        git,
        artifacts: Arc::new(ArtifactStore::new(config.data_dir())),
        events,
    };

    let now = chrono::Utc::now();
    let ticket = Ticket {
        id: "tck_e2e".to_string(),
        project_id: project.id.clone(),
        title: "Bump the version constant".to_string(),
        description: "Change v() to return 2".to_string(),
        status: TicketStatus::InProgress,
        priority: 1,
        shard: "src".to_string(),
        category: "fix".to_string(),
        allowed_paths: vec!["src/**".to_string()],
        forbidden_paths: vec![],
        verification_commands: vec![verification.to_string()],
        max_retries: 2,
        retry_count: 0,
        created_at: now,
        updated_at: now,
    };
    store.insert_ticket(&ticket).expect("insert ticket");

    (
        Harness { _dir: dir, store, orchestrator, project_id: project.id },
        ticket,
    )
}

#[tokio::test]
async fn happy_path_plans_executes_verifies_and_integrates() {
    let (h, ticket) = harness("grep -q 'pub fn v() -> u32 { 2 }' src/lib.rs").await;
    let run = h
        .store
        .create_run(&h.project_id, Some(&ticket.id), RunType::Worker, 1)
        .expect("run");
    h.store.start_run(&run.id).expect("start");

    let backend = Arc::new(ScriptedBackend {
        plan_json: r#"{"files": ["src/lib.rs"], "estimated_lines": 1, "risk": "low"}"#.to_string(),
        write_rel_path: "src/lib.rs".to_string(),
        file_content: "pub fn v() -> u32 { 2 }\n".to_string(),
    });

    let outcome = h
        .orchestrator
        .run_ticket(&ticket, &run.id, 1, backend, &[], "", CancellationToken::new())
        .await
        .expect("outcome");
    assert!(matches!(outcome, TicketOutcome::Completed { .. }), "got {outcome:?}");
    h.orchestrator.finish_run(&run.id, &outcome).expect("finish");

    // The milestone branch carries the change.
    let milestone = h.orchestrator.config.data_dir().join("milestone");
    let merged = std::fs::read_to_string(milestone.join("src/lib.rs")).expect("milestone file");
    assert!(merged.contains("{ 2 }"));

    // Run steps: plan, execute, verify, each successful.
    let steps = h.store.list_run_steps(&run.id, 1).expect("steps");
    let names: Vec<&str> = steps.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["plan", "execute", "verify:0"]);
    assert!(steps.iter().all(|s| s.status == promptwheel_core::types::StepStatus::Success));
}

#[tokio::test]
async fn failing_verification_is_a_qa_failure() {
    let (h, ticket) = harness("false").await;
    let run = h
        .store
        .create_run(&h.project_id, Some(&ticket.id), RunType::Worker, 1)
        .expect("run");
    h.store.start_run(&run.id).expect("start");

    let backend = Arc::new(ScriptedBackend {
        plan_json: r#"{"files": ["src/lib.rs"], "estimated_lines": 1, "risk": "low"}"#.to_string(),
        write_rel_path: "src/lib.rs".to_string(),
        file_content: "pub fn v() -> u32 { 3 }\n".to_string(),
    });

    let outcome = h
        .orchestrator
        .run_ticket(&ticket, &run.id, 1, backend, &[], "", CancellationToken::new())
        .await
        .expect("outcome");
    match outcome {
        TicketOutcome::Failed { failure, .. } => assert_eq!(failure.kind, FailureKind::QaFailed),
        other => panic!("expected qa failure, got {other:?}"),
    }

    let events = h.store.list_run_events(&run.id).expect("events");
    assert!(events
        .iter()
        .any(|e| e.event_type == promptwheel_core::types::RunEventType::QaFail));
}

#[tokio::test]
async fn out_of_scope_write_is_a_scope_violation() {
    let (h, ticket) = harness("true").await;
    let run = h
        .store
        .create_run(&h.project_id, Some(&ticket.id), RunType::Worker, 1)
        .expect("run");
    h.store.start_run(&run.id).expect("start");

    // The ticket only allows src/**, but the backend writes docs/notes.md.
    let backend = Arc::new(ScriptedBackend {
        plan_json: r#"{"files": ["src/lib.rs"], "estimated_lines": 1, "risk": "low"}"#.to_string(),
        write_rel_path: "docs/notes.md".to_string(),
        file_content: "out of scope\n".to_string(),
    });

    let outcome = h
        .orchestrator
        .run_ticket(&ticket, &run.id, 1, backend, &[], "", CancellationToken::new())
        .await
        .expect("outcome");
    match outcome {
        TicketOutcome::Failed { failure, .. } => {
            assert_eq!(failure.kind, FailureKind::ScopeViolation);
            assert!(failure.message.contains("docs/notes.md"));
        }
        other => panic!("expected scope violation, got {other:?}"),
    }

    let events = h.store.list_run_events(&run.id).expect("events");
    assert!(events
        .iter()
        .any(|e| e.event_type == promptwheel_core::types::RunEventType::ScopeViolation));
}

#[tokio::test]
async fn rejected_plan_fails_with_schema_invalid() {
    let (h, ticket) = harness("true").await;
    let run = h
        .store
        .create_run(&h.project_id, Some(&ticket.id), RunType::Worker, 1)
        .expect("run");
    h.store.start_run(&run.id).expect("start");

    // No structured plan in the output at all.
    let backend = Arc::new(ScriptedBackend {
        plan_json: "I would rather describe my intentions in prose.".to_string(),
        write_rel_path: "src/lib.rs".to_string(),
        file_content: "pub fn v() -> u32 { 4 }\n".to_string(),
    });

    let outcome = h
        .orchestrator
        .run_ticket(&ticket, &run.id, 1, backend, &[], "", CancellationToken::new())
        .await
        .expect("outcome");
    match outcome {
        TicketOutcome::Failed { failure, .. } => assert_eq!(failure.kind, FailureKind::SchemaInvalid),
        other => panic!("expected schema failure, got {other:?}"),
    }

    let events = h.store.list_run_events(&run.id).expect("events");
    assert!(events
        .iter()
        .any(|e| e.event_type == promptwheel_core::types::RunEventType::PlanRejected));
}
