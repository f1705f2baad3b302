//! promptwheel — run the autonomous improvement loop inside a repository.
//!
//! The CLI is a thin shell: config, store, backend wiring, SIGINT
//! propagation, and progress printing. All behavior lives in the core.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use promptwheel_agent::{claude::ClaudeBackend, codex::CodexBackend};
use promptwheel_core::{
    agent::AgentBackend,
    config::Config,
    integrations::{load_integrations, run_providers, ProviderPhase},
    session::Session,
    store::Store,
    tools::ToolRegistry,
    EngineEvent,
};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(Config::from_env().context("load configuration")?);
    info!(repo = %config.repo_path, parallel = config.parallel, "promptwheel starting");

    let store = Arc::new(Store::open(&config.data_dir().join("promptwheel.db")).context("open store")?);

    let mut backends: HashMap<String, Arc<dyn AgentBackend>> = HashMap::new();
    backends.insert(
        "claude".to_string(),
        Arc::new(ClaudeBackend::new("claude").with_kill_grace(config.kill_grace_ms)),
    );
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        if !key.is_empty() {
            backends.insert("codex".to_string(), Arc::new(CodexBackend::new(key)));
        }
    }

    let tool_registry = if config.enable_custom_tools {
        ToolRegistry::load(&config.data_dir().join("tools.json"))
    } else {
        ToolRegistry::disabled()
    };
    if !tool_registry.tools.is_empty() {
        info!(count = tool_registry.tools.len(), "custom tool specs loaded");
    }

    let integrations = load_integrations(&config.data_dir().join("integrations.yaml"))
        .unwrap_or_else(|e| {
            warn!("integrations.yaml: {e:#}");
            Default::default()
        });

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("interrupt received; finishing in-flight work");
                cancel.cancel();
            }
        });
    }

    let lenses = vec![
        "default".to_string(),
        "security-audit".to_string(),
        "test-coverage".to_string(),
        "dead-code".to_string(),
        "perf".to_string(),
    ];
    let (session, mut events) =
        Session::new(Arc::clone(&config), store, backends, lenses, cancel.clone())?;

    // Progress printing is pure presentation over the event stream.
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                EngineEvent::CycleStarted { cycle, lens, sector } => {
                    info!(cycle, %lens, %sector, "cycle started")
                }
                EngineEvent::TicketStarted { ticket_id, run_id } => {
                    info!(%ticket_id, %run_id, "ticket started")
                }
                EngineEvent::TicketFinished { ticket_id, status, failure } => {
                    info!(%ticket_id, %status, ?failure, "ticket finished")
                }
                EngineEvent::PrOpened { ticket_id, url } => info!(%ticket_id, %url, "PR opened"),
                _ => {}
            }
        }
    });

    let mut cycle_count = 0i64;
    while !cancel.is_cancelled() {
        let pre = run_providers(&integrations, ProviderPhase::PreScout, cycle_count).await;
        for output in pre {
            info!(provider = %output.provider, "pre-scout integration output captured");
        }

        match session.run_cycle().await {
            Ok(Some(summary)) => {
                cycle_count = summary.cycle;
                info!(
                    cycle = summary.cycle,
                    lens = %summary.lens,
                    sector = %summary.sector,
                    proposed = summary.proposed,
                    approved = summary.approved,
                    completed = summary.completed,
                    failed = summary.failed,
                    prs = summary.prs_created,
                    "cycle finished"
                );
            }
            Ok(None) => {
                info!("no scannable (lens, sector) pairs remain; stopping");
                break;
            }
            Err(e) => {
                warn!("cycle failed: {e:#}");
                if e.to_string().contains("checksum mismatch") {
                    return Err(e);
                }
            }
        }

        let post = run_providers(&integrations, ProviderPhase::PostCycle, cycle_count).await;
        for output in post {
            info!(provider = %output.provider, "post-cycle integration output captured");
        }
    }

    info!("promptwheel exiting");
    Ok(())
}
