//! Tool registry — the capability interface between the model and local code.
//!
//! A tool declares its name, parameter schema and executor. The registry is
//! constructed explicitly and handed to the dispatcher; there is no global
//! tool table.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio_util::sync::CancellationToken;

use super::progress::{ProgressEvent, ProgressSink, ToolStatus};
use super::validator::ToolSchema;
use crate::stream::types::BinaryPayload;

// ─── Execution Types ────────────────────────────────────────────────────────

/// What a tool produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolOutput {
    pub text: String,
    pub binary: Option<BinaryPayload>,
}

impl ToolOutput {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            binary: None,
        }
    }

    pub fn with_binary(mut self, media_type: &str, data: Vec<u8>) -> Self {
        self.binary = Some(BinaryPayload {
            media_type: media_type.to_string(),
            data,
        });
        self
    }
}

/// Why a tool failed, with whatever it produced before failing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolFailure {
    pub reason: String,
    pub partial_output: Option<String>,
}

impl ToolFailure {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            partial_output: None,
        }
    }

    pub fn with_partial_output(mut self, output: impl Into<String>) -> Self {
        self.partial_output = Some(output.into()).filter(|o: &String| !o.is_empty());
        self
    }
}

/// Lets a running tool report intermediate progress.
#[derive(Clone)]
pub struct ProgressReporter {
    sink: Arc<dyn ProgressSink>,
    call_id: String,
    tool: String,
}

impl ProgressReporter {
    pub fn new(sink: Arc<dyn ProgressSink>, call_id: &str, tool: &str) -> Self {
        Self {
            sink,
            call_id: call_id.to_string(),
            tool: tool.to_string(),
        }
    }

    pub fn report(&self, message: impl Into<String>) {
        self.status(ToolStatus::Progress {
            message: message.into(),
        });
    }

    pub(crate) fn status(&self, status: ToolStatus) {
        self.sink.emit(ProgressEvent::Tool {
            call_id: self.call_id.clone(),
            tool: self.tool.clone(),
            status,
        });
    }
}

/// Per-call context passed to `Tool::execute`.
#[derive(Clone)]
pub struct ToolContext {
    pub call_id: String,
    pub progress: ProgressReporter,
    /// Cancelled when the turn is torn down. Long-running tools should watch it
    /// and return early; the dispatcher waits a short grace period for them.
    pub cancel: CancellationToken,
}

// ─── Tool Trait ─────────────────────────────────────────────────────────────

/// A locally executable tool.
#[async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;

    fn description(&self) -> &str {
        ""
    }

    fn schema(&self) -> &ToolSchema;

    /// Run with arguments that already passed `schema()` validation.
    async fn execute(
        &self,
        arguments: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolFailure>;
}

/// A tool backed by an async closure.
pub struct FnTool<F> {
    name: String,
    description: String,
    schema: ToolSchema,
    handler: F,
}

impl<F, Fut> FnTool<F>
where
    F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolOutput, ToolFailure>> + Send,
{
    pub fn new(name: &str, description: &str, schema: ToolSchema, handler: F) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            schema,
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> Tool for FnTool<F>
where
    F: Fn(Map<String, Value>, ToolContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<ToolOutput, ToolFailure>> + Send,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn schema(&self) -> &ToolSchema {
        &self.schema
    }

    async fn execute(
        &self,
        arguments: Map<String, Value>,
        ctx: ToolContext,
    ) -> Result<ToolOutput, ToolFailure> {
        (self.handler)(arguments, ctx).await
    }
}

// ─── Registry ───────────────────────────────────────────────────────────────

/// Tools available to the model, keyed by name.
#[derive(Default, Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. A tool with the same name is replaced.
    pub fn register<T: Tool + 'static>(&mut self, tool: T) {
        self.register_arc(Arc::new(tool));
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        if self.tools.insert(name.clone(), tool).is_some() {
            tracing::warn!(tool = %name, "replaced previously registered tool");
        } else {
            tracing::debug!(tool = %name, "registered tool");
        }
    }

    pub fn lookup(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Keep only tools whose names are in `allowed`.
    pub fn retain_tools(&mut self, allowed: &HashSet<String>) {
        let before = self.tools.len();
        self.tools.retain(|name, _| allowed.contains(name));
        let after = self.tools.len();
        tracing::info!(before, after, "filtered tool registry by enabled_tools allowlist");
    }

    /// Tool definitions for the request body, sorted by name.
    pub fn tool_definitions(&self) -> Vec<Value> {
        self.names()
            .into_iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| {
                json!({
                    "name": tool.name(),
                    "description": tool.description(),
                    "input_schema": tool.schema().to_json_schema(),
                })
            })
            .collect()
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
