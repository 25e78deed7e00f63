//! Per-segment accumulator for tool-call argument payloads.
//!
//! Fragments are appended verbatim in arrival order. The payload is parsed
//! exactly once, when the segment-end signal closes the buffer; nothing is
//! parsed (not even speculatively) while the buffer is open, because a
//! syntactically complete prefix is not a complete payload.

use uuid::Uuid;

use super::config::ArgumentDialect;
use super::errors::StreamError;
use super::tool_call_parser::{invoke_name, parse_json_arguments, parse_tagged_call};
use super::types::ToolCall;
use crate::agent_core::tokens::truncate_utf8;

/// Bytes of raw payload included in log lines.
const LOG_PREVIEW_BYTES: usize = 200;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BufferState {
    Open,
    Closed,
    Dispatched,
}

/// Accumulates one tool-call segment until segment-end.
#[derive(Debug)]
pub struct ToolCallBuffer {
    index: usize,
    id: String,
    name: Option<String>,
    dialect: ArgumentDialect,
    raw: String,
    fragments: usize,
    state: BufferState,
    /// Set once by `close()`; moved out by `take_for_dispatch()`.
    outcome: Option<Result<ToolCall, StreamError>>,
}

impl ToolCallBuffer {
    /// Start a buffer for segment `index`.
    ///
    /// A missing call id is generated up front so every later reference
    /// (including error results) agrees on it.
    pub fn new(
        index: usize,
        id: Option<String>,
        name: Option<String>,
        dialect: ArgumentDialect,
    ) -> Self {
        Self {
            index,
            id: id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| format!("call_{}", Uuid::new_v4())),
            name: name.filter(|n| !n.trim().is_empty()),
            dialect,
            raw: String::new(),
            fragments: 0,
            state: BufferState::Open,
            outcome: None,
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn raw_text(&self) -> &str {
        &self.raw
    }

    pub fn fragment_count(&self) -> usize {
        self.fragments
    }

    pub fn is_closed(&self) -> bool {
        self.state != BufferState::Open
    }

    /// Append one fragment.
    pub fn push(&mut self, fragment: &str) -> Result<(), StreamError> {
        if self.state != BufferState::Open {
            return Err(StreamError::MalformedStream {
                reason: format!("fragment for segment {} after segment-end", self.index),
            });
        }
        self.raw.push_str(fragment);
        self.fragments += 1;
        Ok(())
    }

    /// The tool name, if it is fully known yet.
    ///
    /// For the tagged dialect the name may be embedded in the payload; until
    /// its closing quote has arrived this returns `None`.
    pub fn pending_name(&self) -> Option<&str> {
        match (&self.name, self.dialect) {
            (Some(name), _) => Some(name),
            (None, ArgumentDialect::Tagged) => invoke_name(&self.raw),
            (None, ArgumentDialect::Json) => None,
        }
    }

    /// Handle the segment-end signal: freeze the payload and parse it once.
    ///
    /// A second call is rejected with `DuplicateSegmentEnd` and does not
    /// re-parse.
    pub fn close(&mut self) -> Result<(), StreamError> {
        if self.state != BufferState::Open {
            return Err(StreamError::DuplicateSegmentEnd { index: self.index });
        }
        self.state = BufferState::Closed;

        let outcome = self.parse();
        match &outcome {
            Ok(call) => tracing::debug!(
                index = self.index,
                call_id = %call.id,
                tool = %call.name,
                fragments = self.fragments,
                bytes = self.raw.len(),
                "tool call segment complete"
            ),
            Err(e) => tracing::warn!(
                index = self.index,
                call_id = %self.id,
                error = %e,
                raw_preview = %truncate_utf8(&self.raw, LOG_PREVIEW_BYTES),
                "tool call segment failed to parse"
            ),
        }
        self.outcome = Some(outcome);
        Ok(())
    }

    /// Hand the completed call out for execution, at most once.
    ///
    /// Before `close()` this fails with `ToolCallIncomplete` without looking
    /// at the payload.
    pub fn take_for_dispatch(&mut self) -> Result<ToolCall, StreamError> {
        match self.state {
            BufferState::Open => Err(StreamError::ToolCallIncomplete {
                index: self.index,
                buffered_bytes: self.raw.len(),
            }),
            BufferState::Dispatched => Err(StreamError::AlreadyDispatched { index: self.index }),
            BufferState::Closed => {
                self.state = BufferState::Dispatched;
                self.outcome
                    .take()
                    .unwrap_or(Err(StreamError::AlreadyDispatched { index: self.index }))
            }
        }
    }

    fn parse(&self) -> Result<ToolCall, StreamError> {
        let parsed = match self.dialect {
            ArgumentDialect::Json => parse_json_arguments(&self.raw).map(|args| (None, args)),
            ArgumentDialect::Tagged => parse_tagged_call(&self.raw),
        };

        let (embedded_name, arguments) = parsed.map_err(|reason| self.malformed(reason))?;

        let name = match (&self.name, embedded_name) {
            (Some(name), Some(embedded)) if *name != embedded => {
                tracing::warn!(
                    index = self.index,
                    start_name = %name,
                    embedded_name = %embedded,
                    "tool name in payload differs from segment-start name, using segment-start name"
                );
                name.clone()
            }
            (Some(name), _) => name.clone(),
            (None, Some(embedded)) => embedded,
            (None, None) => return Err(self.malformed("tool name never arrived".into())),
        };

        Ok(ToolCall {
            id: self.id.clone(),
            name,
            raw_arguments: self.raw.clone(),
            arguments: Some(arguments),
        })
    }

    fn malformed(&self, reason: String) -> StreamError {
        StreamError::MalformedToolCall {
            index: self.index,
            id: Some(self.id.clone()),
            name: self.pending_name().map(String::from),
            raw: self.raw.clone(),
            reason,
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const PAYLOAD: &str = r#"{"command": "ls -la", "cwd": "/tmp/ünïcode", "n": [1, 2]}"#;

    fn buffer() -> ToolCallBuffer {
        ToolCallBuffer::new(1, Some("toolu_1".into()), Some("bash".into()), ArgumentDialect::Json)
    }

    fn char_boundaries(s: &str) -> Vec<usize> {
        s.char_indices().map(|(i, _)| i).chain([s.len()]).collect()
    }

    fn run(chunks: &[&str]) -> ToolCall {
        let mut buf = buffer();
        for chunk in chunks {
            buf.push(chunk).unwrap();
        }
        buf.close().unwrap();
        buf.take_for_dispatch().unwrap()
    }

    #[test]
    fn test_fragmentation_invariance_single_split() {
        let whole = run(&[PAYLOAD]);
        for split in char_boundaries(PAYLOAD) {
            let (a, b) = PAYLOAD.split_at(split);
            assert_eq!(run(&[a, b]), whole, "split at {split}");
        }
    }

    #[test]
    fn test_fragmentation_invariance_two_splits() {
        let whole = run(&[PAYLOAD]);
        let bounds = char_boundaries(PAYLOAD);
        for (i, &x) in bounds.iter().enumerate() {
            for &y in &bounds[i..] {
                let chunks = [&PAYLOAD[..x], &PAYLOAD[x..y], &PAYLOAD[y..]];
                assert_eq!(run(&chunks), whole, "splits at {x},{y}");
            }
        }
    }

    #[test]
    fn test_fragmentation_invariance_char_by_char() {
        let chars: Vec<String> = PAYLOAD.chars().map(String::from).collect();
        let chunks: Vec<&str> = chars.iter().map(String::as_str).collect();
        let call = run(&chunks);
        assert_eq!(call, run(&[PAYLOAD]));
        assert_eq!(call.raw_arguments, PAYLOAD);
        assert_eq!(call.arguments.unwrap()["cwd"], "/tmp/ünïcode");
    }

    #[test]
    fn test_early_dispatch_is_rejected_without_parsing() {
        let mut buf = buffer();
        // A syntactically complete prefix of a longer payload.
        buf.push(r#"{"command": "ls"}"#).unwrap();

        let err = buf.take_for_dispatch().unwrap_err();
        assert!(matches!(
            err,
            StreamError::ToolCallIncomplete {
                index: 1,
                buffered_bytes: 17
            }
        ));
        assert!(buf.outcome.is_none(), "no parse may happen before close");
        assert!(!buf.is_closed());
    }

    #[test]
    fn test_dispatch_at_most_once() {
        let mut buf = buffer();
        buf.push(r#"{"command": "ls -la"}"#).unwrap();
        buf.close().unwrap();

        let err = buf.close().unwrap_err();
        assert!(matches!(err, StreamError::DuplicateSegmentEnd { index: 1 }));

        let call = buf.take_for_dispatch().unwrap();
        assert_eq!(call.id, "toolu_1");
        assert_eq!(call.arguments.unwrap()["command"], "ls -la");

        let err = buf.take_for_dispatch().unwrap_err();
        assert!(matches!(err, StreamError::AlreadyDispatched { index: 1 }));
    }

    #[test]
    fn test_push_after_close_is_a_stream_error() {
        let mut buf = buffer();
        buf.push("{}").unwrap();
        buf.close().unwrap();
        assert!(matches!(
            buf.push("x"),
            Err(StreamError::MalformedStream { .. })
        ));
        assert_eq!(buf.raw_text(), "{}");
    }

    #[test]
    fn test_malformed_payload_keeps_raw_text() {
        let mut buf = buffer();
        buf.push(r#"{"command": "#).unwrap();
        buf.push("ls -la}").unwrap();
        buf.close().unwrap();

        match buf.take_for_dispatch().unwrap_err() {
            StreamError::MalformedToolCall {
                index,
                id,
                name,
                raw,
                reason,
            } => {
                assert_eq!(index, 1);
                assert_eq!(id.as_deref(), Some("toolu_1"));
                assert_eq!(name.as_deref(), Some("bash"));
                assert_eq!(raw, r#"{"command": ls -la}"#);
                assert!(reason.contains("invalid JSON"));
            }
            other => panic!("expected MalformedToolCall, got {other:?}"),
        }
    }

    #[test]
    fn test_missing_id_is_generated() {
        let buf = ToolCallBuffer::new(0, None, Some("bash".into()), ArgumentDialect::Json);
        assert!(buf.id().starts_with("call_"));
    }

    #[test]
    fn test_tagged_name_accumulates_across_fragments() {
        let mut buf = ToolCallBuffer::new(2, None, None, ArgumentDialect::Tagged);
        buf.push("<invoke na").unwrap();
        assert_eq!(buf.pending_name(), None);
        buf.push("me=\"ba").unwrap();
        assert_eq!(buf.pending_name(), None);
        buf.push("sh\">\n<parameter name=\"command\">ls -la</parameter>\n").unwrap();
        assert_eq!(buf.pending_name(), Some("bash"));
        assert!(buf.take_for_dispatch().is_err(), "name alone is not readiness");

        buf.push("</invoke>").unwrap();
        buf.close().unwrap();
        let call = buf.take_for_dispatch().unwrap();
        assert_eq!(call.name, "bash");
        assert_eq!(call.arguments.unwrap()["command"], json!("ls -la"));
    }

    #[test]
    fn test_tagged_name_incomplete_at_end_is_malformed() {
        let mut buf = ToolCallBuffer::new(2, None, None, ArgumentDialect::Tagged);
        buf.push("<invoke name=\"ba").unwrap();
        buf.close().unwrap();
        let err = buf.take_for_dispatch().unwrap_err();
        assert!(matches!(err, StreamError::MalformedToolCall { .. }));
    }

    #[test]
    fn test_json_without_name_is_malformed() {
        let mut buf = ToolCallBuffer::new(0, Some("c".into()), None, ArgumentDialect::Json);
        buf.push("{}").unwrap();
        buf.close().unwrap();
        match buf.take_for_dispatch().unwrap_err() {
            StreamError::MalformedToolCall { reason, .. } => {
                assert!(reason.contains("tool name"))
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_empty_payload_is_no_arguments() {
        let mut buf = buffer();
        buf.close().unwrap();
        let call = buf.take_for_dispatch().unwrap();
        assert!(call.arguments.unwrap().is_empty());
        assert_eq!(buf.fragment_count(), 0);
    }
}
