//! Agent Core — turn orchestration on top of the stream layer.
//!
//! Submodules:
//! - `turn_loop`: Drives a user turn through round trips and tool calls
//! - `dispatcher`: Executes reconstructed tool calls (timeout, cancel, truncation)
//! - `tool_registry`: `Tool` trait and the registry handed to the dispatcher
//! - `validator`: Parameter schemas and argument validation
//! - `governor`: Client-side rate admission over rolling token windows
//! - `conversation`: Append-only turn history and the persistence seam
//! - `progress`: Progress sinks for streamed text and tool status
//! - `tokens`: Token estimation for admission control
//! - `config`: `toolstream.yaml` loading and env-var interpolation
//! - `errors`: Agent-level error types

pub mod config;
pub mod conversation;
pub mod dispatcher;
pub mod errors;
pub mod governor;
pub mod progress;
pub mod tokens;
pub mod tool_registry;
pub mod turn_loop;
pub mod validator;

// Re-exports for convenience
pub use config::{AgentConfig, LoggingConfig, ToolsConfig, TurnLoopConfig};
pub use conversation::{
    ContentSegment, Conversation, ConversationStore, ConversationTurn, InMemoryConversationStore,
    Role,
};
pub use dispatcher::ToolDispatcher;
pub use errors::AgentError;
pub use governor::{Admission, GovernorConfig, RateDimension, RateGovernor, WindowLimit};
pub use progress::{ChannelSink, NoopSink, ProgressEvent, ProgressSink, ToolStatus, TracingSink};
pub use tool_registry::{
    FnTool, ProgressReporter, Tool, ToolContext, ToolFailure, ToolOutput, ToolRegistry,
};
pub use turn_loop::{TurnLoop, TurnOutcome, TurnState};
pub use validator::{FieldSpec, FieldType, ToolSchema};
