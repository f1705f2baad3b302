//! Codex CLI backend. Codex has no stream-json mode we rely on; stdout is
//! treated as plain text and only coarse events reach the spindle.

use std::process::Stdio;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use promptwheel_core::agent::{AgentBackend, AgentInvocation, AgentOutput, AgentStreamEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

use crate::claude::terminate;

pub struct CodexBackend {
    pub api_key: String,
    pub codex_bin: String,
    pub kill_grace_ms: u64,
}

impl CodexBackend {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self { api_key: api_key.into(), codex_bin: "codex".into(), kill_grace_ms: 5_000 }
    }

    pub fn with_bin(mut self, bin: impl Into<String>) -> Self {
        self.codex_bin = bin.into();
        self
    }

    pub async fn is_available(&self) -> bool {
        tokio::process::Command::new(&self.codex_bin)
            .arg("--version")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map(|s| s.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl AgentBackend for CodexBackend {
    fn name(&self) -> &'static str {
        "codex"
    }

    async fn run(&self, invocation: AgentInvocation) -> Result<AgentOutput> {
        if !self.is_available().await {
            bail!("codex binary not found: {}", self.codex_bin);
        }

        let mut instruction = invocation.instruction.clone();
        if !invocation.system_prompt.is_empty() {
            instruction = format!("{}\n\n{}", invocation.system_prompt, instruction);
        }

        info!(run_id = %invocation.run_id, model = %invocation.model, "spawning codex subprocess");

        let mut child = tokio::process::Command::new(&self.codex_bin)
            .arg("--model")
            .arg(&invocation.model)
            .arg("--approval-mode")
            .arg("full-auto")
            .arg(&instruction)
            .kill_on_drop(true)
            .current_dir(&invocation.worktree_path)
            .env("OPENAI_API_KEY", &self.api_key)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn codex binary: {}", self.codex_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut output_lines: Vec<String> = Vec::new();
        let mut canceled = false;
        let deadline = (invocation.timeout_ms > 0).then(|| {
            tokio::time::Instant::now() + std::time::Duration::from_millis(invocation.timeout_ms)
        });

        loop {
            let timeout_sleep = async {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                line = stdout_reader.next_line() => {
                    match line.context("error reading stdout")? {
                        Some(l) => {
                            if let Some(tx) = &invocation.event_tx {
                                let _ = tx.send(AgentStreamEvent::Text { text: l.clone() });
                            }
                            output_lines.push(l);
                        }
                        None => break,
                    }
                }
                line = stderr_reader.next_line() => {
                    if let Ok(Some(l)) = line {
                        if !l.is_empty() {
                            warn!(run_id = %invocation.run_id, "codex stderr: {}", l);
                        }
                    }
                }
                _ = invocation.cancel.cancelled() => {
                    terminate(&mut child, self.kill_grace_ms).await;
                    canceled = true;
                    break;
                }
                _ = timeout_sleep => {
                    warn!(run_id = %invocation.run_id, "codex subprocess hit wall-clock timeout");
                    terminate(&mut child, self.kill_grace_ms).await;
                    canceled = true;
                    break;
                }
            }
        }

        let success = if canceled {
            let _ = child.wait().await;
            false
        } else {
            child.wait().await.context("failed to wait for codex process")?.success()
        };

        let output = output_lines.join("\n");
        info!(run_id = %invocation.run_id, success, output_len = output.len(), "codex subprocess finished");
        Ok(AgentOutput { raw_stream: output.clone(), output, session_id: None, success })
    }
}
