//! Claude Code child-process backend: stream-json over stdout, cancel via
//! SIGTERM with a grace window before SIGKILL.

use std::process::Stdio;

use anyhow::{Context, Result};
use async_trait::async_trait;
use promptwheel_core::agent::{AgentBackend, AgentInvocation, AgentOutput, AgentStreamEvent};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::event::{line_to_stream_events, parse_stream};

pub struct ClaudeBackend {
    /// Path to the `claude` CLI binary.
    pub claude_bin: String,
    pub max_turns: u32,
    /// Milliseconds between SIGTERM and SIGKILL on cancellation.
    pub kill_grace_ms: u64,
}

impl ClaudeBackend {
    pub fn new(claude_bin: impl Into<String>) -> Self {
        Self { claude_bin: claude_bin.into(), max_turns: 200, kill_grace_ms: 5_000 }
    }

    pub fn with_kill_grace(mut self, kill_grace_ms: u64) -> Self {
        self.kill_grace_ms = kill_grace_ms;
        self
    }

    fn build_args(&self, invocation: &AgentInvocation) -> Vec<String> {
        let mut args = vec![
            "--model".to_string(),
            invocation.model.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--allowedTools".to_string(),
            invocation.allowed_tools.clone(),
            "--max-turns".to_string(),
            self.max_turns.to_string(),
        ];
        if !invocation.system_prompt.is_empty() {
            args.push("--append-system-prompt".to_string());
            args.push(invocation.system_prompt.clone());
        }
        if let Some(session) = &invocation.resume_session {
            args.push("--resume".to_string());
            args.push(session.clone());
        }
        args.push("--print".to_string());
        args.push(invocation.instruction.clone());
        args
    }
}

/// SIGTERM, wait out the grace period, SIGKILL whatever is left.
pub(crate) async fn terminate(child: &mut Child, grace_ms: u64) {
    if let Some(pid) = child.id() {
        unsafe {
            libc::kill(pid as i32, libc::SIGTERM);
        }
        let grace = std::time::Duration::from_millis(grace_ms);
        if tokio::time::timeout(grace, child.wait()).await.is_ok() {
            return;
        }
    }
    let _ = child.kill().await;
}

#[async_trait]
impl AgentBackend for ClaudeBackend {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn run(&self, invocation: AgentInvocation) -> Result<AgentOutput> {
        info!(
            run_id = %invocation.run_id,
            model = %invocation.model,
            "spawning claude subprocess"
        );

        let args = self.build_args(&invocation);
        let mut child = Command::new(&self.claude_bin)
            .args(&args)
            .kill_on_drop(true)
            .current_dir(&invocation.worktree_path)
            .env("HOME", &invocation.session_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn claude: {}", self.claude_bin))?;

        let stdout = child.stdout.take().context("failed to take stdout")?;
        let stderr = child.stderr.take().context("failed to take stderr")?;
        let mut stdout_reader = BufReader::new(stdout).lines();
        let mut stderr_reader = BufReader::new(stderr).lines();

        let mut raw_stream = String::new();
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
                                for event in line_to_stream_events(&l) {
                                    let _ = tx.send(event);
                                }
                            }
                            raw_stream.push_str(&l);
                            raw_stream.push('\n');
                        }
                        None => break,
                    }
                }
                line = stderr_reader.next_line() => {
                    if let Ok(Some(l)) = line {
                        if !l.is_empty() {
                            warn!(run_id = %invocation.run_id, "claude stderr: {}", l);
                            if let Some(tx) = &invocation.event_tx {
                                let _ = tx.send(AgentStreamEvent::Stderr { line: l });
                            }
                        }
                    }
                }
                _ = invocation.cancel.cancelled() => {
                    info!(run_id = %invocation.run_id, "cancellation observed, terminating claude");
                    terminate(&mut child, self.kill_grace_ms).await;
                    canceled = true;
                    break;
                }
                _ = timeout_sleep => {
                    warn!(run_id = %invocation.run_id, "claude subprocess hit wall-clock timeout");
                    terminate(&mut child, self.kill_grace_ms).await;
                    canceled = true;
                    break;
                }
            }
        }

        while let Ok(Some(l)) = stderr_reader.next_line().await {
            if !l.is_empty() {
                warn!(run_id = %invocation.run_id, "claude stderr: {}", l);
            }
        }

        let success = if canceled {
            let _ = child.wait().await;
            false
        } else {
            child.wait().await.context("failed to wait for claude")?.success()
        };

        let (output, session_id) = parse_stream(&raw_stream);
        info!(
            run_id = %invocation.run_id,
            success,
            output_len = output.len(),
            "claude subprocess finished"
        );
        Ok(AgentOutput { output, raw_stream, session_id, success })
    }
}
