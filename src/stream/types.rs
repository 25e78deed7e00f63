//! Shared types for the stream layer.
//!
//! `StreamEvent` is the logical event shape every transport decodes into.
//! `ToolCall` and `ToolResult` are the units the agent core executes and
//! splices back into the conversation.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─── Stream Events ───────────────────────────────────────────────────────────

/// The kind of content a segment carries.
///
/// Unrecognised kind strings map to `Unknown` rather than failing, so a service
/// that introduces a new segment type does not break older clients.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum SegmentKind {
    Text,
    Reasoning,
    ToolCall,
    Unknown(String),
}

impl SegmentKind {
    pub fn as_str(&self) -> &str {
        match self {
            SegmentKind::Text => "text",
            SegmentKind::Reasoning => "reasoning",
            SegmentKind::ToolCall => "tool_call",
            SegmentKind::Unknown(kind) => kind,
        }
    }
}

impl From<&str> for SegmentKind {
    fn from(kind: &str) -> Self {
        match kind {
            "text" => SegmentKind::Text,
            "reasoning" | "thinking" => SegmentKind::Reasoning,
            "tool_call" | "tool_use" => SegmentKind::ToolCall,
            other => SegmentKind::Unknown(other.to_string()),
        }
    }
}

impl From<String> for SegmentKind {
    fn from(kind: String) -> Self {
        SegmentKind::from(kind.as_str())
    }
}

impl From<SegmentKind> for String {
    fn from(kind: SegmentKind) -> Self {
        kind.as_str().to_string()
    }
}

impl fmt::Display for SegmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why the service ended a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum StopReason {
    EndTurn,
    ToolUse,
    MaxTokens,
    StopSequence,
    Other(String),
}

impl From<&str> for StopReason {
    fn from(reason: &str) -> Self {
        match reason {
            "end_turn" | "stop" => StopReason::EndTurn,
            "tool_use" | "tool_calls" => StopReason::ToolUse,
            "max_tokens" | "length" => StopReason::MaxTokens,
            "stop_sequence" => StopReason::StopSequence,
            other => StopReason::Other(other.to_string()),
        }
    }
}

impl From<String> for StopReason {
    fn from(reason: String) -> Self {
        StopReason::from(reason.as_str())
    }
}

impl From<StopReason> for String {
    fn from(reason: StopReason) -> Self {
        match reason {
            StopReason::EndTurn => "end_turn".into(),
            StopReason::ToolUse => "tool_use".into(),
            StopReason::MaxTokens => "max_tokens".into(),
            StopReason::StopSequence => "stop_sequence".into(),
            StopReason::Other(other) => other,
        }
    }
}

/// Token consumption reported by the service for one response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

impl std::ops::AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        self.input_tokens += rhs.input_tokens;
        self.output_tokens += rhs.output_tokens;
    }
}

/// One logical event of a streamed response.
///
/// Indices are unique within a turn and events for one index arrive in order;
/// events for different indices may interleave.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamEvent {
    TurnStart {
        #[serde(default)]
        message_id: Option<String>,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
    SegmentStart {
        index: usize,
        kind: SegmentKind,
        /// Call id, for tool-call segments.
        #[serde(default)]
        id: Option<String>,
        /// Tool name, when the service attaches it to the start event.
        #[serde(default)]
        name: Option<String>,
        /// Initial payload text, possibly empty.
        #[serde(default)]
        text: String,
    },
    SegmentDelta {
        index: usize,
        fragment: String,
    },
    SegmentEnd {
        index: usize,
    },
    TurnEnd {
        reason: StopReason,
        #[serde(default)]
        usage: Option<TokenUsage>,
    },
}

impl StreamEvent {
    pub fn segment_start(index: usize, kind: SegmentKind) -> Self {
        StreamEvent::SegmentStart {
            index,
            kind,
            id: None,
            name: None,
            text: String::new(),
        }
    }

    pub fn tool_start(index: usize, id: &str, name: &str) -> Self {
        StreamEvent::SegmentStart {
            index,
            kind: SegmentKind::ToolCall,
            id: Some(id.to_string()),
            name: Some(name.to_string()),
            text: String::new(),
        }
    }

    pub fn delta(index: usize, fragment: &str) -> Self {
        StreamEvent::SegmentDelta {
            index,
            fragment: fragment.to_string(),
        }
    }

    pub fn end(index: usize) -> Self {
        StreamEvent::SegmentEnd { index }
    }

    /// Segment index, if the event belongs to one.
    pub fn index(&self) -> Option<usize> {
        match self {
            StreamEvent::SegmentStart { index, .. }
            | StreamEvent::SegmentDelta { index, .. }
            | StreamEvent::SegmentEnd { index } => Some(*index),
            _ => None,
        }
    }
}

// ─── Tool Calls & Results ────────────────────────────────────────────────────

/// A reconstructed tool invocation.
///
/// `arguments` is populated only by the tool-call buffer after the segment
/// closed and the payload parsed. A call whose payload failed to parse keeps
/// `arguments = None` and is never executed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// The exact concatenation of every fragment received for the segment.
    pub raw_arguments: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub arguments: Option<serde_json::Map<String, serde_json::Value>>,
}

impl ToolCall {
    /// Record a call whose payload could not be used.
    pub fn unparsed(id: String, name: String, raw_arguments: String) -> Self {
        Self {
            id,
            name,
            raw_arguments,
            arguments: None,
        }
    }

    pub fn is_parsed(&self) -> bool {
        self.arguments.is_some()
    }
}

/// Binary attachment on a tool result (e.g. a screenshot).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BinaryPayload {
    pub media_type: String,
    pub data: Vec<u8>,
}

/// The outcome of executing one tool call.
///
/// Exactly one of `output` / `error` is set; the constructors are the only way
/// to build one outside this module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolResult {
    pub call_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    output: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub binary: Option<BinaryPayload>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl ToolResult {
    pub fn success(call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: Some(output.into()),
            error: None,
            binary: None,
            cancelled: false,
        }
    }

    pub fn failure(call_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            call_id: call_id.into(),
            output: None,
            error: Some(error.into()),
            binary: None,
            cancelled: false,
        }
    }

    /// Terminal result for a call interrupted by cancellation.
    pub fn cancelled(call_id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            cancelled: true,
            ..Self::failure(call_id, reason)
        }
    }

    pub fn with_binary(mut self, binary: BinaryPayload) -> Self {
        self.binary = Some(binary);
        self
    }

    pub fn output(&self) -> Option<&str> {
        self.output.as_deref()
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The text sent back to the model: the output, or the error message.
    pub fn content(&self) -> &str {
        self.output
            .as_deref()
            .or(self.error.as_deref())
            .unwrap_or_default()
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
