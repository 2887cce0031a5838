//! Pure fold over runtime events.
//!
//! The parser owns no state: the caller threads the accumulated
//! response/thinking text through each call, which makes batched and
//! one-at-a-time delivery equivalent.

use ag_domain::stream::{ContentBlock, RuntimeEvent, StreamDelta, Usage};

/// Result of folding one runtime event into the running accumulation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedEvent {
    /// Accumulated response text (prior + this event's delta).
    pub response_text: String,
    /// Accumulated thinking text (prior + this event's delta).
    pub thinking_text: String,
    /// Session id, surfaced at most once per generation.
    pub session_id: Option<String>,
    /// The agent invoked its reserved skip tool.
    pub skip_used: bool,
    /// Memory entries recorded via the `__memorize` tool.
    pub memory_entries: Vec<String>,
    /// Situations reported via the `__anthropic` tool.
    pub anthropic_calls: Vec<String>,
    pub structured_output: Option<serde_json::Value>,
    pub usage: Option<Usage>,
}

impl ParsedEvent {
    pub fn has_tool_usage(&self) -> bool {
        self.skip_used || !self.memory_entries.is_empty() || !self.anthropic_calls.is_empty()
    }
}

/// Fold one event into `(current_response, current_thinking)`.
pub fn parse_event(
    event: &RuntimeEvent,
    current_response: &str,
    current_thinking: &str,
) -> ParsedEvent {
    match event {
        RuntimeEvent::Stream { delta, session_id } => {
            let mut parsed = ParsedEvent {
                response_text: current_response.to_owned(),
                thinking_text: current_thinking.to_owned(),
                ..Default::default()
            };
            match delta {
                StreamDelta::TextDelta { text } => parsed.response_text.push_str(text),
                StreamDelta::ThinkingDelta { thinking } => parsed.thinking_text.push_str(thinking),
                StreamDelta::Other => {}
            }
            // A stream-carried session id is only trustworthy before any
            // response text has arrived (resumed sessions re-announce it
            // mid-stream with a different value).
            if current_response.is_empty() {
                parsed.session_id = session_id.clone();
            }
            parsed
        }

        RuntimeEvent::Assistant { blocks } => {
            let mut parsed = ParsedEvent {
                response_text: current_response.to_owned(),
                thinking_text: current_thinking.to_owned(),
                ..Default::default()
            };
            for block in blocks {
                match block {
                    ContentBlock::Text { text } => parsed.response_text.push_str(text),
                    ContentBlock::Thinking { thinking } => parsed.thinking_text.push_str(thinking),
                    ContentBlock::ToolUse { name, input } => {
                        if name.ends_with("__skip") {
                            parsed.skip_used = true;
                            tracing::info!("agent chose to skip");
                        } else if name.ends_with("__memorize") {
                            if let Some(entry) =
                                input.get("memory_entry").and_then(|v| v.as_str())
                            {
                                if !entry.is_empty() {
                                    parsed.memory_entries.push(entry.to_owned());
                                    tracing::info!(entry = %entry, "agent recorded memory");
                                }
                            }
                        } else if name.ends_with("__anthropic") {
                            if let Some(situation) =
                                input.get("situation").and_then(|v| v.as_str())
                            {
                                if !situation.is_empty() {
                                    parsed.anthropic_calls.push(situation.to_owned());
                                }
                            }
                        }
                    }
                }
            }
            parsed
        }

        RuntimeEvent::System { session_id } => ParsedEvent {
            response_text: current_response.to_owned(),
            thinking_text: current_thinking.to_owned(),
            session_id: session_id.clone(),
            ..Default::default()
        },

        RuntimeEvent::Result {
            usage,
            structured_output,
        } => ParsedEvent {
            response_text: current_response.to_owned(),
            thinking_text: current_thinking.to_owned(),
            usage: usage.clone(),
            structured_output: structured_output.clone(),
            ..Default::default()
        },
    }
}
