//! Optional external providers declared in `integrations.yaml`. Each
//! provider is a child process invoked at a fixed phase of the cycle; its
//! JSON output feeds proposals, learnings, or nudges. Every call races a
//! per-provider timeout and a failure never stops the loop.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

pub const DEFAULT_PROVIDER_TIMEOUT_MS: u64 = 60_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderPhase {
    PreScout,
    PostCycle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderFeed {
    Proposals,
    Learnings,
    Nudges,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Provider {
    pub name: String,
    pub command: String,
    pub tool: String,
    #[serde(default)]
    pub args: Vec<String>,
    /// Run every N cycles.
    #[serde(default = "default_every")]
    pub every: i64,
    pub phase: ProviderPhase,
    pub feed: ProviderFeed,
    /// Milliseconds; defaults to `DEFAULT_PROVIDER_TIMEOUT_MS`.
    #[serde(default)]
    pub timeout: Option<u64>,
}

fn default_every() -> i64 {
    1
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrationsFile {
    #[serde(default)]
    pub providers: Vec<Provider>,
}

/// Load `integrations.yaml`; a missing file is an empty provider set, a
/// malformed one is an error the caller reports once at startup.
pub fn load_integrations(path: &Path) -> Result<IntegrationsFile> {
    if !path.exists() {
        return Ok(IntegrationsFile::default());
    }
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_yaml::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

#[derive(Debug, Clone)]
pub struct ProviderOutput {
    pub provider: String,
    pub feed: ProviderFeed,
    pub payload: serde_json::Value,
}

/// Run every provider due at `phase` for this cycle. Timeouts and
/// failures are logged and skipped; outputs are parsed JSON.
pub async fn run_providers(
    file: &IntegrationsFile,
    phase: ProviderPhase,
    cycle: i64,
) -> Vec<ProviderOutput> {
    let mut out = Vec::new();
    for provider in file.providers.iter().filter(|p| p.phase == phase) {
        if provider.every > 1 && cycle % provider.every != 0 {
            continue;
        }
        match run_one(provider).await {
            Ok(Some(payload)) => out.push(ProviderOutput {
                provider: provider.name.clone(),
                feed: provider.feed,
                payload,
            }),
            Ok(None) => {}
            Err(e) => warn!(provider = %provider.name, "integration provider failed: {e:#}"),
        }
    }
    out
}

async fn run_one(provider: &Provider) -> Result<Option<serde_json::Value>> {
    let timeout = Duration::from_millis(provider.timeout.unwrap_or(DEFAULT_PROVIDER_TIMEOUT_MS));

    let mut cmd = tokio::process::Command::new(&provider.command);
    cmd.arg(&provider.tool).args(&provider.args).kill_on_drop(true);

    let future = async {
        let output = cmd.output().await.with_context(|| format!("spawn {}", provider.command))?;
        if !output.status.success() {
            return Err(anyhow::anyhow!(
                "{} exited {}: {}",
                provider.command,
                output.status.code().unwrap_or(1),
                String::from_utf8_lossy(&output.stderr)
            ));
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        Ok(serde_json::from_str(stdout.trim()).ok())
    };

    match tokio::time::timeout(timeout, future).await {
        Ok(result) => result,
        Err(_) => {
            // Best-effort close happened via kill_on_drop; the cycle goes on.
            warn!(provider = %provider.name, "integration provider timed out");
            Ok(None)
        }
    }
}
