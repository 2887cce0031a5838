use serde::{Deserialize, Serialize};
use std::pin::Pin;

/// A boxed async stream, used for LLM runtime event iteration.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Events produced by the LLM runtime during one generation.
///
/// This is a sealed union: the stream parser dispatches on variant, not
/// on field presence. `Stream` events carry raw token deltas while a
/// partial message is in flight; `Assistant` carries the completed
/// content blocks of one assistant message; `System` and `Result` carry
/// session and usage metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuntimeEvent {
    /// A raw streaming delta (partial-message mode).
    Stream {
        delta: StreamDelta,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// A completed assistant message made of typed content blocks.
    Assistant { blocks: Vec<ContentBlock> },

    /// Runtime bookkeeping; carries the session id on init.
    System {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_id: Option<String>,
    },

    /// Terminal message with usage and optional structured output.
    Result {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        usage: Option<Usage>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        structured_output: Option<serde_json::Value>,
    },
}

/// The delta payload of a [`RuntimeEvent::Stream`] event.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StreamDelta {
    TextDelta { text: String },
    ThinkingDelta { thinking: String },
    /// Any other raw event subtype; carried for completeness, ignored
    /// by the parser.
    Other,
}

/// One block of a completed assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContentBlock {
    Text { text: String },
    Thinking { thinking: String },
    ToolUse { name: String, input: serde_json::Value },
}

/// Token usage reported by the runtime's result message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}
