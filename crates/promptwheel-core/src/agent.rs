//! The agent-backend seam: the one open polymorphic boundary in the core.
//! Backends spawn an external coding agent as a child process and feed a
//! normalized event stream back to the orchestrator.

use anyhow::Result;
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Normalized events a backend emits while its child process runs. The
/// orchestrator classifies these for the spindle and the write guard.
#[derive(Debug, Clone)]
pub enum AgentStreamEvent {
    SessionStarted {
        session_id: String,
    },
    /// A tool invocation by the agent. `target` is the primary argument
    /// (file path for edits, command line for shell).
    ToolUse {
        name: String,
        target: String,
        /// Set for write-shaped tools so scope and credential checks can
        /// inspect the content before it matters.
        content: Option<String>,
    },
    /// Assistant text (reasoning or summary).
    Text {
        text: String,
    },
    /// A raw stream line that did not parse as a known event.
    Raw {
        line: String,
    },
    /// Stderr output, forwarded verbatim.
    Stderr {
        line: String,
    },
}

/// One backend invocation. The instruction is fully assembled by the
/// caller; backends only add transport flags.
#[derive(Debug)]
pub struct AgentInvocation {
    pub run_id: String,
    pub instruction: String,
    pub system_prompt: String,
    pub worktree_path: String,
    pub session_dir: String,
    pub model: String,
    pub resume_session: Option<String>,
    pub allowed_tools: String,
    /// 0 = no limit.
    pub timeout_ms: u64,
    /// Live event feed; None when the caller only wants the final output.
    pub event_tx: Option<mpsc::UnboundedSender<AgentStreamEvent>>,
    /// Observed at every suspension point; triggers SIGTERM → SIGKILL.
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub output: String,
    pub raw_stream: String,
    pub session_id: Option<String>,
    pub success: bool,
}

impl AgentOutput {
    pub fn failed(output: impl Into<String>) -> Self {
        Self { output: output.into(), raw_stream: String::new(), session_id: None, success: false }
    }
}

#[async_trait]
pub trait AgentBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn run(&self, invocation: AgentInvocation) -> Result<AgentOutput>;
}
