//! Segment demultiplexer — routes stream events into per-segment buffers.
//!
//! Events for different segment indices may interleave; events for one index
//! must arrive start → deltas → end. The demultiplexer enforces that ordering,
//! surfaces text fragments as they arrive, and emits a `FinishedSegment` for
//! each index exactly once, on its first segment-end.

use std::collections::{BTreeMap, HashSet};

use super::config::ArgumentDialect;
use super::errors::StreamError;
use super::tool_buffer::ToolCallBuffer;
use super::types::{SegmentKind, StopReason, StreamEvent, TokenUsage, ToolCall};

// ─── Public Types ────────────────────────────────────────────────────────────

/// A segment whose end signal has been received.
#[derive(Debug)]
pub enum FinishedSegment {
    Text {
        index: usize,
        text: String,
    },
    Reasoning {
        index: usize,
        text: String,
    },
    /// A parsed call, or `MalformedToolCall` when the payload was unusable.
    ToolCall {
        index: usize,
        call: Result<ToolCall, StreamError>,
    },
    /// Content of a kind this client does not understand, passed through intact.
    Opaque {
        index: usize,
        kind: String,
        payload: String,
    },
}

impl FinishedSegment {
    pub fn index(&self) -> usize {
        match self {
            FinishedSegment::Text { index, .. }
            | FinishedSegment::Reasoning { index, .. }
            | FinishedSegment::ToolCall { index, .. }
            | FinishedSegment::Opaque { index, .. } => *index,
        }
    }
}

/// What the demultiplexer produced for one input event.
#[derive(Debug)]
pub enum DemuxOutput {
    TurnStarted {
        message_id: Option<String>,
        usage: Option<TokenUsage>,
    },
    /// A text or reasoning fragment, for incremental display.
    Delta {
        index: usize,
        kind: SegmentKind,
        fragment: String,
    },
    Finished(FinishedSegment),
    /// Something recoverable the caller should know about.
    Warning {
        index: Option<usize>,
        message: String,
    },
    TurnEnded {
        reason: StopReason,
        usage: Option<TokenUsage>,
    },
}

// ─── Segments ────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum Segment {
    Text { kind: SegmentKind, buffer: String },
    Tool(ToolCallBuffer),
    Opaque { kind: String, buffer: String },
}

impl Segment {
    fn finish(self, index: usize) -> FinishedSegment {
        match self {
            Segment::Text {
                kind: SegmentKind::Reasoning,
                buffer,
            } => FinishedSegment::Reasoning {
                index,
                text: buffer,
            },
            Segment::Text { buffer, .. } => FinishedSegment::Text {
                index,
                text: buffer,
            },
            Segment::Tool(mut buffer) => {
                let call = buffer.close().and_then(|_| buffer.take_for_dispatch());
                FinishedSegment::ToolCall { index, call }
            }
            Segment::Opaque { kind, buffer } => FinishedSegment::Opaque {
                index,
                kind,
                payload: buffer,
            },
        }
    }
}

// ─── Demultiplexer ───────────────────────────────────────────────────────────

/// Demultiplexes the events of one response.
#[derive(Debug)]
pub struct SegmentDemultiplexer {
    dialect: ArgumentDialect,
    /// Ordered so turn-end flushes leftovers deterministically.
    open: BTreeMap<usize, Segment>,
    closed: HashSet<usize>,
    started: bool,
    ended: bool,
}

impl SegmentDemultiplexer {
    pub fn new(dialect: ArgumentDialect) -> Self {
        Self {
            dialect,
            open: BTreeMap::new(),
            closed: HashSet::new(),
            started: false,
            ended: false,
        }
    }

    /// Whether the turn-end event has been consumed.
    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Number of segments started but not yet closed.
    pub fn open_segments(&self) -> usize {
        self.open.len()
    }

    /// Consume one event.
    ///
    /// Ordering violations return `MalformedStream`; the turn cannot continue
    /// after one.
    pub fn push(&mut self, event: StreamEvent) -> Result<Vec<DemuxOutput>, StreamError> {
        if self.ended {
            return Err(malformed("event received after turn-end".into()));
        }

        match event {
            StreamEvent::TurnStart { message_id, usage } => {
                if self.started {
                    return Err(malformed("second turn-start within one turn".into()));
                }
                self.started = true;
                Ok(vec![DemuxOutput::TurnStarted { message_id, usage }])
            }
            StreamEvent::SegmentStart {
                index,
                kind,
                id,
                name,
                text,
            } => {
                self.started = true;
                self.start_segment(index, kind, id, name, text)
            }
            StreamEvent::SegmentDelta { index, fragment } => self.append(index, fragment),
            StreamEvent::SegmentEnd { index } => self.end_segment(index),
            StreamEvent::TurnEnd { reason, usage } => {
                self.ended = true;
                let mut outputs = self.flush_open_segments();
                outputs.push(DemuxOutput::TurnEnded { reason, usage });
                Ok(outputs)
            }
        }
    }

    fn start_segment(
        &mut self,
        index: usize,
        kind: SegmentKind,
        id: Option<String>,
        name: Option<String>,
        text: String,
    ) -> Result<Vec<DemuxOutput>, StreamError> {
        if self.open.contains_key(&index) || self.closed.contains(&index) {
            return Err(malformed(format!("segment {index} started twice")));
        }

        let mut outputs = Vec::new();
        let segment = match kind {
            SegmentKind::Text | SegmentKind::Reasoning => {
                if !text.is_empty() {
                    outputs.push(DemuxOutput::Delta {
                        index,
                        kind: kind.clone(),
                        fragment: text.clone(),
                    });
                }
                Segment::Text { kind, buffer: text }
            }
            SegmentKind::ToolCall => {
                let mut buffer = ToolCallBuffer::new(index, id, name, self.dialect);
                if !text.is_empty() {
                    buffer.push(&text)?;
                }
                Segment::Tool(buffer)
            }
            SegmentKind::Unknown(kind) => {
                tracing::warn!(index, kind = %kind, "unknown segment kind, passing through");
                outputs.push(DemuxOutput::Warning {
                    index: Some(index),
                    message: format!("unknown segment kind '{kind}' passed through as opaque content"),
                });
                Segment::Opaque { kind, buffer: text }
            }
        };

        self.open.insert(index, segment);
        Ok(outputs)
    }

    fn append(&mut self, index: usize, fragment: String) -> Result<Vec<DemuxOutput>, StreamError> {
        let Some(segment) = self.open.get_mut(&index) else {
            return Err(missing_segment(&self.closed, index, "delta"));
        };

        match segment {
            Segment::Text { kind, buffer } => {
                buffer.push_str(&fragment);
                Ok(vec![DemuxOutput::Delta {
                    index,
                    kind: kind.clone(),
                    fragment,
                }])
            }
            Segment::Tool(buffer) => {
                buffer.push(&fragment)?;
                Ok(Vec::new())
            }
            Segment::Opaque { buffer, .. } => {
                buffer.push_str(&fragment);
                Ok(Vec::new())
            }
        }
    }

    fn end_segment(&mut self, index: usize) -> Result<Vec<DemuxOutput>, StreamError> {
        if self.closed.contains(&index) {
            tracing::warn!(index, "duplicate segment-end ignored");
            return Ok(vec![DemuxOutput::Warning {
                index: Some(index),
                message: format!("duplicate segment-end for segment {index} ignored"),
            }]);
        }

        let Some(segment) = self.open.remove(&index) else {
            return Err(missing_segment(&self.closed, index, "segment-end"));
        };
        self.closed.insert(index);
        Ok(vec![DemuxOutput::Finished(segment.finish(index))])
    }

    /// Close out segments the service never ended.
    ///
    /// Text is kept. A tool call without its end signal is never parsed: its
    /// payload may be truncated even when it happens to look complete.
    fn flush_open_segments(&mut self) -> Vec<DemuxOutput> {
        let mut outputs = Vec::new();
        let open = std::mem::take(&mut self.open);

        for (index, segment) in open {
            self.closed.insert(index);
            tracing::warn!(index, "segment still open at turn-end");
            outputs.push(DemuxOutput::Warning {
                index: Some(index),
                message: format!("segment {index} was never closed"),
            });

            let finished = match segment {
                Segment::Tool(buffer) => FinishedSegment::ToolCall {
                    index,
                    call: Err(StreamError::MalformedToolCall {
                        index,
                        id: Some(buffer.id().to_string()),
                        name: buffer.pending_name().map(String::from),
                        raw: buffer.raw_text().to_string(),
                        reason: "segment never closed before turn-end".into(),
                    }),
                },
                other => other.finish(index),
            };
            outputs.push(DemuxOutput::Finished(finished));
        }

        outputs
    }
}

fn missing_segment(closed: &HashSet<usize>, index: usize, what: &str) -> StreamError {
    if closed.contains(&index) {
        malformed(format!("{what} for segment {index} after its segment-end"))
    } else {
        malformed(format!("{what} for segment {index} before its segment-start"))
    }
}

fn malformed(reason: String) -> StreamError {
    StreamError::MalformedStream { reason }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
