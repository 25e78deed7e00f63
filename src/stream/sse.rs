//! SSE decoder for Messages-API style streaming responses.
//!
//! Reads a byte stream, splits it on SSE event boundaries (blank lines),
//! and maps each `data:` payload to a logical `StreamEvent`. Bytes are
//! buffered undecoded until an event is complete, so a multi-byte character
//! split across network chunks is never mangled.
//!
//! Wire → logical mapping:
//! - `message_start` → `TurnStart`
//! - `content_block_start` → `SegmentStart`
//! - `content_block_delta` → `SegmentDelta`
//! - `content_block_stop` → `SegmentEnd`
//! - `message_delta` → (stop reason and usage remembered)
//! - `message_stop` → `TurnEnd`
//! - `ping`, `[DONE]`, comments → nothing
//! - `error` → `StreamError::Transport`

use std::fmt::Display;

use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use serde_json::Value;

use super::errors::StreamError;
use super::types::{SegmentKind, StopReason, StreamEvent, TokenUsage};

// ─── Byte-stream parser ──────────────────────────────────────────────────────

/// Decode an SSE byte stream into `StreamEvent`s.
///
/// Each item of `byte_stream` is one network chunk; chunk boundaries carry no
/// meaning.
pub fn parse_sse_stream<S, B, E>(byte_stream: S) -> impl Stream<Item = Result<StreamEvent, StreamError>>
where
    S: Stream<Item = Result<B, E>> + Unpin,
    B: AsRef<[u8]>,
    E: Display,
{
    let state = SseState::default();

    stream::unfold(
        (byte_stream, state, Vec::<u8>::new()),
        |(mut byte_stream, mut state, mut buffer)| async move {
            loop {
                // Drain complete events already in the buffer
                if let Some((end, sep_len)) = find_event_boundary(&buffer) {
                    let raw: Vec<u8> = buffer.drain(..end + sep_len).take(end).collect();
                    let event = String::from_utf8_lossy(&raw);

                    match state.process_event(&event) {
                        Ok(Some(ev)) => return Some((Ok(ev), (byte_stream, state, buffer))),
                        Ok(None) => continue,
                        Err(e) => return Some((Err(e), (byte_stream, state, buffer))),
                    }
                }

                match byte_stream.next().await {
                    Some(Ok(bytes)) => buffer.extend_from_slice(bytes.as_ref()),
                    Some(Err(e)) => {
                        return Some((
                            Err(StreamError::Transport {
                                reason: format!("stream read error: {e}"),
                            }),
                            (byte_stream, state, buffer),
                        ));
                    }
                    None => {
                        // Trailing event without a final blank line
                        let rest = String::from_utf8_lossy(&buffer).trim().to_string();
                        buffer.clear();
                        if rest.is_empty() {
                            return None;
                        }
                        return match state.process_event(&rest) {
                            Ok(Some(ev)) => Some((Ok(ev), (byte_stream, state, buffer))),
                            Ok(None) => None,
                            Err(e) => Some((Err(e), (byte_stream, state, buffer))),
                        };
                    }
                }
            }
        },
    )
}

/// Position of the first blank line, and the separator length.
fn find_event_boundary(buffer: &[u8]) -> Option<(usize, usize)> {
    let lf = find_subslice(buffer, b"\n\n").map(|i| (i, 2));
    let crlf = find_subslice(buffer, b"\r\n\r\n").map(|i| (i, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

// ─── Wire Types ──────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireEvent {
    MessageStart {
        message: WireMessage,
    },
    ContentBlockStart {
        index: usize,
        content_block: Value,
    },
    ContentBlockDelta {
        index: usize,
        delta: Value,
    },
    ContentBlockStop {
        index: usize,
    },
    MessageDelta {
        #[serde(default)]
        delta: WireMessageDelta,
        #[serde(default)]
        usage: Option<WireUsage>,
    },
    MessageStop,
    Ping,
    Error {
        error: WireError,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Default, Deserialize)]
struct WireMessageDelta {
    #[serde(default)]
    stop_reason: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireError {
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
}

// ─── Decoder State ───────────────────────────────────────────────────────────

/// What must be remembered between SSE events of one response.
#[derive(Debug, Default)]
struct SseState {
    stop_reason: Option<StopReason>,
    usage: TokenUsage,
}

impl SseState {
    /// Process a single SSE event block (may contain multiple `data:` lines).
    fn process_event(&mut self, event: &str) -> Result<Option<StreamEvent>, StreamError> {
        let mut data = String::new();
        for line in event.lines() {
            let line = line.trim_end_matches('\r');
            if let Some(payload) = line.strip_prefix("data:") {
                let payload = payload.strip_prefix(' ').unwrap_or(payload);
                if payload.trim() == "[DONE]" {
                    return Ok(None);
                }
                if !data.is_empty() {
                    data.push('\n');
                }
                data.push_str(payload);
            }
            // `event:` names duplicate the payload's `type`; comments are keep-alives
        }

        if data.trim().is_empty() {
            return Ok(None);
        }

        let wire: WireEvent = serde_json::from_str(&data).map_err(|e| StreamError::Transport {
            reason: format!("failed to parse SSE event: {e} (data: {data})"),
        })?;

        self.map_event(wire)
    }

    fn map_event(&mut self, wire: WireEvent) -> Result<Option<StreamEvent>, StreamError> {
        let event = match wire {
            WireEvent::MessageStart { message } => {
                let usage = message.usage.map(|u| TokenUsage {
                    input_tokens: u.input_tokens.unwrap_or(0),
                    output_tokens: u.output_tokens.unwrap_or(0),
                });
                if let Some(u) = usage {
                    self.usage = u;
                }
                Some(StreamEvent::TurnStart {
                    message_id: message.id,
                    usage,
                })
            }
            WireEvent::ContentBlockStart {
                index,
                content_block,
            } => Some(map_block_start(index, &content_block)),
            WireEvent::ContentBlockDelta { index, delta } => {
                map_delta(&delta).map(|fragment| StreamEvent::SegmentDelta { index, fragment })
            }
            WireEvent::ContentBlockStop { index } => Some(StreamEvent::SegmentEnd { index }),
            WireEvent::MessageDelta { delta, usage } => {
                if let Some(reason) = delta.stop_reason {
                    self.stop_reason = Some(StopReason::from(reason));
                }
                if let Some(u) = usage {
                    if let Some(input) = u.input_tokens {
                        self.usage.input_tokens = input;
                    }
                    if let Some(output) = u.output_tokens {
                        self.usage.output_tokens = output;
                    }
                }
                None
            }
            WireEvent::MessageStop => Some(StreamEvent::TurnEnd {
                reason: self.stop_reason.take().unwrap_or(StopReason::EndTurn),
                usage: Some(self.usage),
            }),
            WireEvent::Ping => None,
            WireEvent::Error { error } => {
                tracing::warn!(kind = %error.kind, message = %error.message, "service error event");
                return Err(StreamError::Transport {
                    reason: format!("service error {}: {}", error.kind, error.message),
                });
            }
            WireEvent::Unknown => {
                tracing::debug!("ignoring unknown SSE event type");
                None
            }
        };
        Ok(event)
    }
}

fn map_block_start(index: usize, block: &Value) -> StreamEvent {
    let kind = block.get("type").and_then(Value::as_str).unwrap_or_default();
    let str_field = |field: &str| block.get(field).and_then(Value::as_str).map(String::from);

    match SegmentKind::from(kind) {
        SegmentKind::Text => StreamEvent::SegmentStart {
            index,
            kind: SegmentKind::Text,
            id: None,
            name: None,
            text: str_field("text").unwrap_or_default(),
        },
        SegmentKind::Reasoning => StreamEvent::SegmentStart {
            index,
            kind: SegmentKind::Reasoning,
            id: None,
            name: None,
            text: str_field("thinking").unwrap_or_default(),
        },
        SegmentKind::ToolCall => {
            // The start event carries a placeholder `{}`; the real payload
            // arrives as deltas. A non-empty input is a complete payload.
            let text = match block.get("input") {
                Some(Value::Object(map)) if !map.is_empty() => Value::Object(map.clone()).to_string(),
                _ => String::new(),
            };
            StreamEvent::SegmentStart {
                index,
                kind: SegmentKind::ToolCall,
                id: str_field("id"),
                name: str_field("name"),
                text,
            }
        }
        unknown => StreamEvent::SegmentStart {
            index,
            kind: unknown,
            id: str_field("id"),
            name: None,
            text: block.to_string(),
        },
    }
}

/// The fragment carried by a content-block delta, if any.
fn map_delta(delta: &Value) -> Option<String> {
    let kind = delta.get("type").and_then(Value::as_str).unwrap_or_default();
    let field = match kind {
        "text_delta" => "text",
        "thinking_delta" => "thinking",
        "input_json_delta" => "partial_json",
        "signature_delta" => return None,
        _ => return Some(delta.to_string()),
    };
    delta.get(field).and_then(Value::as_str).map(String::from)
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const TRANSCRIPT: &str = concat!(
        "event: message_start\n",
        "data: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_1\",\"usage\":{\"input_tokens\":25,\"output_tokens\":1}}}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
        "event: ping\n",
        "data: {\"type\":\"ping\"}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Hello wörld\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":0}\n\n",
        "event: content_block_start\n",
        "data: {\"type\":\"content_block_start\",\"index\":1,\"content_block\":{\"type\":\"tool_use\",\"id\":\"toolu_1\",\"name\":\"bash\",\"input\":{}}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"{\\\"command\\\": \"}}\n\n",
        "event: content_block_delta\n",
        "data: {\"type\":\"content_block_delta\",\"index\":1,\"delta\":{\"type\":\"input_json_delta\",\"partial_json\":\"\\\"ls -la\\\"}\"}}\n\n",
        "event: content_block_stop\n",
        "data: {\"type\":\"content_block_stop\",\"index\":1}\n\n",
        "event: message_delta\n",
        "data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"tool_use\"},\"usage\":{\"output_tokens\":42}}\n\n",
        "event: message_stop\n",
        "data: {\"type\":\"message_stop\"}\n\n",
    );

    fn chunked(text: &str, size: usize) -> Vec<Result<Vec<u8>, String>> {
        text.as_bytes()
            .chunks(size)
            .map(|c| Ok(c.to_vec()))
            .collect()
    }

    async fn decode(chunks: Vec<Result<Vec<u8>, String>>) -> Vec<Result<StreamEvent, StreamError>> {
        parse_sse_stream(stream::iter(chunks)).collect().await
    }

    fn expected() -> Vec<StreamEvent> {
        vec![
            StreamEvent::TurnStart {
                message_id: Some("msg_1".into()),
                usage: Some(TokenUsage {
                    input_tokens: 25,
                    output_tokens: 1,
                }),
            },
            StreamEvent::segment_start(0, SegmentKind::Text),
            StreamEvent::delta(0, "Hello wörld"),
            StreamEvent::end(0),
            StreamEvent::tool_start(1, "toolu_1", "bash"),
            StreamEvent::delta(1, r#"{"command": "#),
            StreamEvent::delta(1, r#""ls -la"}"#),
            StreamEvent::end(1),
            StreamEvent::TurnEnd {
                reason: StopReason::ToolUse,
                usage: Some(TokenUsage {
                    input_tokens: 25,
                    output_tokens: 42,
                }),
            },
        ]
    }

    #[tokio::test]
    async fn test_decodes_full_transcript() {
        let events: Vec<StreamEvent> = decode(chunked(TRANSCRIPT, TRANSCRIPT.len()))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(events, expected());
    }

    #[tokio::test]
    async fn test_network_chunking_does_not_matter() {
        // Small chunks split both SSE lines and the multi-byte 'ö'
        for size in [1, 2, 3, 7, 64] {
            let events: Vec<StreamEvent> = decode(chunked(TRANSCRIPT, size))
                .await
                .into_iter()
                .map(Result::unwrap)
                .collect();
            assert_eq!(events, expected(), "chunk size {size}");
        }
    }

    #[tokio::test]
    async fn test_crlf_boundaries() {
        let text = TRANSCRIPT.replace('\n', "\r\n");
        let events: Vec<StreamEvent> = decode(chunked(&text, 5))
            .await
            .into_iter()
            .map(Result::unwrap)
            .collect();
        assert_eq!(events, expected());
    }

    #[tokio::test]
    async fn test_read_error_is_transport_error() {
        let chunks = vec![
            Ok(b"data: {\"type\":\"ping\"}\n\n".to_vec()),
            Err("connection reset".to_string()),
        ];
        let events = decode(chunks).await;
        assert_eq!(events.len(), 1);
        match &events[0] {
            Err(StreamError::Transport { reason }) => assert!(reason.contains("connection reset")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_invalid_json_is_transport_error() {
        let events = decode(vec![Ok(b"data: {not json}\n\n".to_vec())]).await;
        assert!(matches!(events[0], Err(StreamError::Transport { .. })));
    }

    #[tokio::test]
    async fn test_trailing_event_without_blank_line() {
        let events = decode(vec![Ok(b"data: {\"type\":\"content_block_stop\",\"index\":3}".to_vec())]).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].as_ref().unwrap(), &StreamEvent::end(3));
    }

    #[tokio::test]
    async fn test_error_event_is_transport_error() {
        let body = b"event: error\ndata: {\"type\":\"error\",\"error\":{\"type\":\"overloaded_error\",\"message\":\"Overloaded\"}}\n\n";
        let events = decode(vec![Ok(body.to_vec())]).await;
        match &events[0] {
            Err(err @ StreamError::Transport { reason }) => {
                assert!(reason.contains("overloaded_error"));
                assert!(err.is_retriable());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_thinking_and_signature_deltas() {
        let thinking = serde_json::json!({"type": "thinking_delta", "thinking": "hmm"});
        assert_eq!(map_delta(&thinking).as_deref(), Some("hmm"));
        let signature = serde_json::json!({"type": "signature_delta", "signature": "abc"});
        assert!(map_delta(&signature).is_none());
    }

    #[test]
    fn test_unknown_block_is_passed_through() {
        let block = serde_json::json!({"type": "server_tool_use", "id": "srv_1"});
        match map_block_start(4, &block) {
            StreamEvent::SegmentStart { kind, text, .. } => {
                assert_eq!(kind, SegmentKind::Unknown("server_tool_use".into()));
                assert!(text.contains("srv_1"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_done_and_comments_are_ignored() {
        let mut state = SseState::default();
        assert!(state.process_event("data: [DONE]").unwrap().is_none());
        assert!(state.process_event(": keep-alive").unwrap().is_none());
    }
}
