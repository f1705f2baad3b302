use promptwheel_core::agent::AgentStreamEvent;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single NDJSON message emitted by Claude Code (`--output-format stream-json`).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First message on stream: session initialisation.
    System(SystemEvent),

    /// An assistant turn (text or tool calls).
    Assistant(AssistantEvent),

    /// A user turn (tool results injected back into the conversation).
    User(UserEvent),

    /// Final result message — emitted once at the very end.
    Result(ResultEvent),

    /// Any message type not explicitly handled above.
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SystemEvent {
    pub subtype: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantEvent {
    pub message: Option<AssistantMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AssistantMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
    pub model: Option<String>,
    pub stop_reason: Option<String>,
    pub usage: Option<Usage>,
}

/// A single content block inside an assistant or user message.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text output.
    Text { text: String },

    /// A tool invocation by the agent.
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },

    /// Result returned by a tool (appears in user turn).
    ToolResult {
        tool_use_id: String,
        content: Option<Value>,
        is_error: Option<bool>,
    },

    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserEvent {
    pub message: Option<UserMessage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UserMessage {
    pub role: Option<String>,
    pub content: Option<Vec<ContentBlock>>,
}

/// Final result event, emitted once when the agent finishes.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ResultEvent {
    pub subtype: Option<String>,
    /// Textual output (may be empty if last turn was a tool call).
    pub result: Option<String>,
    pub session_id: Option<String>,
    pub is_error: Option<bool>,
    pub cost_usd: Option<f64>,
    pub duration_ms: Option<u64>,
    pub num_turns: Option<u64>,
    pub usage: Option<Usage>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Usage {
    pub input_tokens: Option<u64>,
    pub output_tokens: Option<u64>,
    pub cache_read_input_tokens: Option<u64>,
    pub cache_creation_input_tokens: Option<u64>,
}

/// The primary argument of a tool call, for display and scope checks:
/// the file path for edit-shaped tools, the command line for shell.
pub fn tool_target(input: &Value) -> String {
    for key in ["file_path", "path", "command", "pattern", "url"] {
        if let Some(v) = input.get(key).and_then(Value::as_str) {
            return v.to_string();
        }
    }
    String::new()
}

/// The content a write-shaped tool intends to put on disk, when present.
pub fn tool_content(input: &Value) -> Option<String> {
    for key in ["content", "new_string", "new_source"] {
        if let Some(v) = input.get(key).and_then(Value::as_str) {
            return Some(v.to_string());
        }
    }
    None
}

/// Translate one stream line into zero or more normalized core events.
/// Lines that are not JSON become `Raw` (plain-text fallback).
pub fn line_to_stream_events(line: &str) -> Vec<AgentStreamEvent> {
    if line.trim().is_empty() {
        return Vec::new();
    }
    let event: AgentEvent = match serde_json::from_str(line) {
        Ok(e) => e,
        Err(_) => return vec![AgentStreamEvent::Raw { line: line.to_string() }],
    };

    let mut out = Vec::new();
    match event {
        AgentEvent::System(e) => {
            if let Some(session_id) = e.session_id {
                out.push(AgentStreamEvent::SessionStarted { session_id });
            }
        }
        AgentEvent::Assistant(e) => {
            for block in e.message.and_then(|m| m.content).unwrap_or_default() {
                match block {
                    ContentBlock::Text { text } => out.push(AgentStreamEvent::Text { text }),
                    ContentBlock::ToolUse { name, input, .. } => out.push(AgentStreamEvent::ToolUse {
                        target: tool_target(&input),
                        content: tool_content(&input),
                        name,
                    }),
                    _ => {}
                }
            }
        }
        _ => {}
    }
    out
}

/// Parse a full NDJSON stream and extract the final output text and
/// session ID, falling back to collected assistant text when the result
/// event was empty.
pub fn parse_stream(data: &str) -> (String, Option<String>) {
    let mut output = String::new();
    let mut assistant_text = String::new();
    let mut session_id: Option<String> = None;

    for line in data.lines() {
        if line.is_empty() {
            continue;
        }
        let event: AgentEvent = match serde_json::from_str(line) {
            Ok(e) => e,
            Err(_) => continue,
        };
        match event {
            AgentEvent::System(e) => {
                if let Some(sid) = e.session_id {
                    session_id = Some(sid);
                }
            }
            AgentEvent::Assistant(e) => {
                if let Some(blocks) = e.message.and_then(|m| m.content) {
                    for block in blocks {
                        if let ContentBlock::Text { text } = block {
                            if !assistant_text.is_empty() {
                                assistant_text.push('\n');
                            }
                            assistant_text.push_str(&text);
                        }
                    }
                }
            }
            AgentEvent::Result(e) => {
                if let Some(sid) = e.session_id {
                    session_id = Some(sid);
                }
                if let Some(text) = e.result {
                    output = text;
                }
            }
            _ => {}
        }
    }

    if output.is_empty() && !assistant_text.is_empty() {
        output = assistant_text;
    }

    // Plain-text fallback: a stream with no JSON at all is its own output.
    if output.is_empty() && session_id.is_none() {
        let plain: String = data
            .lines()
            .filter(|l| serde_json::from_str::<Value>(l).is_err())
            .collect::<Vec<_>>()
            .join("\n");
        output = plain;
    }

    (output, session_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_parse_extracts_result_and_session() {
        let stream = concat!(
            r#"{"type":"system","subtype":"init","session_id":"sess-1"}"#,
            "\n",
            r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"working"}]}}"#,
            "\n",
            r#"{"type":"result","subtype":"success","result":"done","session_id":"sess-1"}"#,
            "\n",
        );
        let (output, session) = parse_stream(stream);
        assert_eq!(output, "done");
        assert_eq!(session.as_deref(), Some("sess-1"));
    }

    #[test]
    fn stream_parse_falls_back_to_assistant_text() {
        let stream = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"text","text":"only text"}]}}"#;
        let (output, session) = parse_stream(stream);
        assert_eq!(output, "only text");
        assert!(session.is_none());
    }

    #[test]
    fn non_json_stream_is_plain_text_output() {
        let (output, session) = parse_stream("plain line one\nplain line two");
        assert_eq!(output, "plain line one\nplain line two");
        assert!(session.is_none());
    }

    #[test]
    fn tool_use_lines_become_tool_events() {
        let line = r#"{"type":"assistant","message":{"role":"assistant","content":[{"type":"tool_use","id":"t1","name":"Edit","input":{"file_path":"src/a.rs","new_string":"fn a() {}"}}]}}"#;
        let events = line_to_stream_events(line);
        assert_eq!(events.len(), 1);
        match &events[0] {
            AgentStreamEvent::ToolUse { name, target, content } => {
                assert_eq!(name, "Edit");
                assert_eq!(target, "src/a.rs");
                assert_eq!(content.as_deref(), Some("fn a() {}"));
            }
            other => panic!("expected tool use, got {other:?}"),
        }
    }

    #[test]
    fn unknown_event_types_are_tolerated() {
        let events = line_to_stream_events(r#"{"type":"telemetry","data":1}"#);
        assert!(events.is_empty());
        let raw = line_to_stream_events("not json at all");
        assert!(matches!(raw[0], AgentStreamEvent::Raw { .. }));
    }
}
