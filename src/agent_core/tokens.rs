//! Token estimation for admission control.
//!
//! Uses character-based heuristics calibrated for LLM tokenizers:
//! - English prose: ~3.2 chars/token (rounded toward overestimating)
//! - JSON/structured content: ~2.8 chars/token (denser due to punctuation, short keys)
//!
//! The rate governor only needs an upper-ish bound before a request is sent;
//! the service's reported usage replaces the estimate afterwards.

use super::conversation::{ContentSegment, ConversationTurn};

// ─── Constants ──────────────────────────────────────────────────────────────

/// Average characters per token for English prose.
///
/// Most tokenizers produce ~3.5-4.0 chars/token for English text; 3.2 errs
/// toward overestimation.
const CHARS_PER_TOKEN: f64 = 3.2;

/// Average characters per token for JSON/structured content.
///
/// Tool call arguments, tool results, and schema definitions all fall into
/// this category.
const JSON_CHARS_PER_TOKEN: f64 = 2.8;

/// Per-turn overhead (role label, formatting tokens).
const TURN_OVERHEAD_TOKENS: u64 = 4;

/// Overhead for tool call / tool result structure (per block).
const TOOL_BLOCK_OVERHEAD_TOKENS: u64 = 10;

// ─── UTF-8 Safe Truncation ──────────────────────────────────────────────────

/// Truncate a string to at most `max_bytes` bytes on a valid UTF-8 char boundary.
///
/// If the byte at `max_bytes` is inside a multi-byte character, the slice is
/// shortened to the preceding character boundary.
pub(crate) fn truncate_utf8(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

// ─── Public API ─────────────────────────────────────────────────────────────

/// Estimate the token count for a string of natural language text.
pub fn estimate_tokens(text: &str) -> u64 {
    let chars = text.len() as f64;
    (chars / CHARS_PER_TOKEN).ceil() as u64
}

/// Estimate the token count for JSON/structured content.
pub fn estimate_json_tokens(json_text: &str) -> u64 {
    let chars = json_text.len() as f64;
    (chars / JSON_CHARS_PER_TOKEN).ceil() as u64
}

/// Estimate the token count for one conversation turn.
pub fn estimate_turn_tokens(turn: &ConversationTurn) -> u64 {
    TURN_OVERHEAD_TOKENS
        + turn
            .content
            .iter()
            .map(|segment| match segment {
                ContentSegment::Text { text } => estimate_tokens(text),
                // Not replayed to the service
                ContentSegment::Reasoning { .. } => 0,
                ContentSegment::ToolCall { call } => {
                    TOOL_BLOCK_OVERHEAD_TOKENS
                        + estimate_tokens(&call.name)
                        + estimate_json_tokens(&call.raw_arguments)
                }
                ContentSegment::ToolResult { result } => {
                    TOOL_BLOCK_OVERHEAD_TOKENS + estimate_json_tokens(result.content())
                }
                ContentSegment::Opaque { payload, .. } => estimate_json_tokens(payload),
            })
            .sum::<u64>()
}

/// Estimate the input tokens of a full request.
pub fn estimate_request_tokens(
    system: Option<&str>,
    turns: &[ConversationTurn],
    tools: &[serde_json::Value],
) -> u64 {
    let system_tokens = system
        .map(|s| TURN_OVERHEAD_TOKENS + estimate_tokens(s))
        .unwrap_or(0);
    let tool_tokens = if tools.is_empty() {
        0
    } else {
        estimate_json_tokens(&serde_json::to_string(tools).unwrap_or_default())
    };
    system_tokens + tool_tokens + turns.iter().map(estimate_turn_tokens).sum::<u64>()
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::conversation::Role;
    use crate::stream::types::{ToolCall, ToolResult};

    #[test]
    fn test_estimate_tokens_empty() {
        assert_eq!(estimate_tokens(""), 0);
    }

    #[test]
    fn test_estimate_tokens_short() {
        // "hello" = 5 chars → ceil(5/3.2) = 2
        assert_eq!(estimate_tokens("hello"), 2);
    }

    #[test]
    fn test_estimate_tokens_longer() {
        // 100 chars → ceil(100/3.2) = 32
        assert_eq!(estimate_tokens(&"a".repeat(100)), 32);
    }

    #[test]
    fn test_estimate_json_tokens() {
        // 16 chars → ceil(16/2.8) = 6
        assert_eq!(estimate_json_tokens(r#"{"path": "/tmp"}"#), 6);
    }

    #[test]
    fn test_estimate_user_turn() {
        // 4 overhead + ceil(13/3.2) = 5
        assert_eq!(estimate_turn_tokens(&ConversationTurn::user("Hello, world!")), 9);
    }

    #[test]
    fn test_estimate_tool_turns() {
        let call = ToolCall {
            id: "toolu_1".into(),
            name: "bash".into(),
            raw_arguments: r#"{"path": "/tmp"}"#.into(),
            arguments: None,
        };
        let assistant = ConversationTurn {
            role: Role::Assistant,
            content: vec![
                ContentSegment::Reasoning {
                    text: "a".repeat(1000),
                },
                ContentSegment::ToolCall { call },
            ],
        };
        // 4 + 10 + ceil(4/3.2)=2 + 6
        assert_eq!(estimate_turn_tokens(&assistant), 22);

        let results = ConversationTurn {
            role: Role::Tool,
            content: vec![ContentSegment::ToolResult {
                result: ToolResult::success("toolu_1", "ok"),
            }],
        };
        // 4 + 10 + ceil(2/2.8)=1
        assert_eq!(estimate_turn_tokens(&results), 15);
    }

    #[test]
    fn test_estimate_request_includes_system_and_tools() {
        let turns = vec![ConversationTurn::user("hi")];
        let bare = estimate_request_tokens(None, &turns, &[]);
        let full = estimate_request_tokens(
            Some("You are terse."),
            &turns,
            &[serde_json::json!({"name": "bash"})],
        );
        assert!(full > bare);
    }

    #[test]
    fn test_truncate_utf8_ascii() {
        assert_eq!(truncate_utf8("hello world", 5), "hello");
    }

    #[test]
    fn test_truncate_utf8_within_multibyte() {
        // '═' is U+2550, encoded as 3 bytes
        let text = "═══";
        assert_eq!(truncate_utf8(text, 4), "═");
        assert_eq!(truncate_utf8(text, 6), "══");
    }

    #[test]
    fn test_truncate_utf8_no_truncation_needed() {
        assert_eq!(truncate_utf8("short", 100), "short");
    }
}
