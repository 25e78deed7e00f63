//! Progress sinks — where incremental output and tool status go.
//!
//! The turn loop and dispatcher report through `ProgressSink`; nothing here
//! renders anything. Front ends subscribe with a `ChannelSink`.

use serde::Serialize;
use tokio::sync::mpsc;

use crate::stream::types::SegmentKind;

/// Lifecycle of one tool execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ToolStatus {
    Started,
    Progress { message: String },
    Succeeded,
    Failed { error: String },
    Cancelled,
}

/// Something worth showing while a turn is in flight.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A text or reasoning fragment as it streams in.
    SegmentText {
        kind: SegmentKind,
        index: usize,
        text: String,
    },
    Tool {
        call_id: String,
        tool: String,
        #[serde(flatten)]
        status: ToolStatus,
    },
    Warning {
        message: String,
    },
}

/// Receiver of progress events. Must not block.
pub trait ProgressSink: Send + Sync {
    fn emit(&self, event: ProgressEvent);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl ProgressSink for NoopSink {
    fn emit(&self, _event: ProgressEvent) {}
}

/// Logs events at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn emit(&self, event: ProgressEvent) {
        match &event {
            ProgressEvent::SegmentText { kind, index, text } => {
                tracing::debug!(kind = %kind, index, len = text.len(), "segment text")
            }
            ProgressEvent::Tool {
                call_id,
                tool,
                status,
            } => tracing::debug!(call_id = %call_id, tool = %tool, status = ?status, "tool status"),
            ProgressEvent::Warning { message } => tracing::warn!(message = %message, "turn warning"),
        }
    }
}

/// Forwards events into an unbounded channel; a closed receiver is ignored.
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<ProgressEvent>,
}

impl ChannelSink {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProgressEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ProgressSink for ChannelSink {
    fn emit(&self, event: ProgressEvent) {
        let _ = self.tx.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_sink_forwards() {
        let (sink, mut rx) = ChannelSink::new();
        sink.emit(ProgressEvent::Warning {
            message: "careful".into(),
        });
        assert_eq!(
            rx.try_recv().unwrap(),
            ProgressEvent::Warning {
                message: "careful".into()
            }
        );
    }

    #[test]
    fn test_channel_sink_survives_dropped_receiver() {
        let (sink, rx) = ChannelSink::new();
        drop(rx);
        sink.emit(ProgressEvent::Warning {
            message: "nobody listening".into(),
        });
    }

    #[test]
    fn test_tool_event_serialization() {
        let event = ProgressEvent::Tool {
            call_id: "toolu_1".into(),
            tool: "bash".into(),
            status: ToolStatus::Failed {
                error: "exit 1".into(),
            },
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "tool");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"], "exit 1");
    }
}
