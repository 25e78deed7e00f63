//! Stream layer — from wire bytes to completed segments.
//!
//! Submodules:
//! - `types`: Stream events, tool calls, tool results
//! - `errors`: Stream-level error types
//! - `config`: Transport settings and argument dialects
//! - `sse`: SSE byte-stream decoder
//! - `transport`: `Transport` trait and the reqwest-based implementation
//! - `demux`: Routes events into per-segment buffers, enforces ordering
//! - `tool_buffer`: Accumulates tool-call payloads, parses once on segment-end
//! - `tool_call_parser`: JSON and tagged argument dialects

pub mod config;
pub mod demux;
pub mod errors;
pub mod sse;
pub mod tool_buffer;
pub mod tool_call_parser;
pub mod transport;
pub mod types;

// Re-exports for convenience
pub use config::{ArgumentDialect, TransportConfig};
pub use demux::{DemuxOutput, FinishedSegment, SegmentDemultiplexer};
pub use errors::StreamError;
pub use tool_buffer::ToolCallBuffer;
pub use transport::{
    EventStream, HttpTransport, OpenedStream, RateLimitSnapshot, Transport, TurnRequest,
};
pub use types::{
    BinaryPayload, SegmentKind, StopReason, StreamEvent, TokenUsage, ToolCall, ToolResult,
};
