//! ToolDispatcher — executes reconstructed tool calls against the registry.
//!
//! Lifecycle per call: lookup → argument check → validate → execute (bounded
//! by a timeout and the turn's cancellation token) → truncate → result.
//! Every failure mode becomes a `ToolResult` with `error` set; nothing here
//! returns `Err` to the turn loop. Tools are never retried, so a call executes
//! at most once.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::agent_core::tokens::truncate_utf8;
use crate::stream::types::{ToolCall, ToolResult};

use super::config::ToolsConfig;
use super::errors::AgentError;
use super::progress::{ProgressSink, ToolStatus};
use super::tool_registry::{ProgressReporter, ToolContext, ToolFailure, ToolOutput, ToolRegistry};
use super::validator;

/// How much of a malformed payload is quoted back to the model.
const MAX_RAW_ECHO_BYTES: usize = 2_000;

// ─── ToolDispatcher ─────────────────────────────────────────────────────────

pub struct ToolDispatcher {
    registry: Arc<ToolRegistry>,
    progress: Arc<dyn ProgressSink>,
    call_timeout: Duration,
    cancel_grace: Duration,
    max_result_chars: usize,
}

/// How a running tool stopped.
enum Completion {
    Finished(Result<ToolOutput, ToolFailure>),
    TimedOut(Option<Result<ToolOutput, ToolFailure>>),
    Cancelled(Option<Result<ToolOutput, ToolFailure>>),
}

impl ToolDispatcher {
    pub fn new(
        registry: Arc<ToolRegistry>,
        config: &ToolsConfig,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            registry,
            progress,
            call_timeout: Duration::from_secs(config.call_timeout_secs),
            cancel_grace: Duration::from_millis(config.cancel_grace_ms),
            max_result_chars: config.max_result_chars,
        }
    }

    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_cancel_grace(mut self, grace: Duration) -> Self {
        self.cancel_grace = grace;
        self
    }

    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    // ─── Dispatch ───────────────────────────────────────────────────────

    /// Execute one call and return its terminal result.
    pub async fn execute(&self, call: ToolCall, cancel: CancellationToken) -> ToolResult {
        let start = Instant::now();
        let reporter = ProgressReporter::new(Arc::clone(&self.progress), &call.id, &call.name);

        let Some(tool) = self.registry.lookup(&call.name) else {
            let err = AgentError::UnknownTool {
                name: call.name.clone(),
            };
            tracing::warn!(call_id = %call.id, tool = %call.name, "model requested unknown tool");
            return self.reject(&reporter, &call.id, err.to_string());
        };

        let Some(arguments) = call.arguments.as_ref() else {
            let result = malformed_call_result(
                &call.id,
                &call.name,
                &call.raw_arguments,
                "arguments were never parsed",
            );
            reporter.status(ToolStatus::Failed {
                error: result.content().to_string(),
            });
            return result;
        };

        let normalized = match validator::validate(&call.name, tool.schema(), arguments) {
            Ok(normalized) => normalized,
            Err(e) => {
                tracing::info!(call_id = %call.id, tool = %call.name, error = %e, "tool arguments rejected");
                return self.reject(&reporter, &call.id, e.to_string());
            }
        };

        if cancel.is_cancelled() {
            reporter.status(ToolStatus::Cancelled);
            return ToolResult::cancelled(&call.id, "cancelled before execution");
        }

        tracing::info!(call_id = %call.id, tool = %call.name, "dispatching tool call");
        reporter.status(ToolStatus::Started);

        let tool_cancel = cancel.child_token();
        let ctx = ToolContext {
            call_id: call.id.clone(),
            progress: reporter.clone(),
            cancel: tool_cancel.clone(),
        };
        let running = tool.execute(normalized, ctx);
        tokio::pin!(running);

        let completion = tokio::select! {
            biased;
            outcome = &mut running => Completion::Finished(outcome),
            _ = cancel.cancelled() => {
                // The child token is already cancelled; give the tool a chance to wind down.
                match tokio::time::timeout(self.cancel_grace, &mut running).await {
                    Ok(outcome) => Completion::Cancelled(Some(outcome)),
                    Err(_) => Completion::Cancelled(None),
                }
            }
            _ = tokio::time::sleep(self.call_timeout) => {
                tool_cancel.cancel();
                match tokio::time::timeout(self.cancel_grace, &mut running).await {
                    Ok(outcome) => Completion::TimedOut(Some(outcome)),
                    Err(_) => Completion::TimedOut(None),
                }
            }
        };

        // A tool that returned because it saw the token still counts as cancelled.
        let completion = match completion {
            Completion::Finished(outcome) if cancel.is_cancelled() => {
                Completion::Cancelled(Some(outcome))
            }
            other => other,
        };

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let result = match completion {
            Completion::Finished(Ok(output)) => {
                reporter.status(ToolStatus::Succeeded);
                let mut result = ToolResult::success(&call.id, self.cap_output(output.text));
                if let Some(binary) = output.binary {
                    result = result.with_binary(binary);
                }
                result
            }
            Completion::Finished(Err(failure)) => {
                let err = AgentError::ToolExecution {
                    tool: call.name.clone(),
                    reason: failure.reason,
                    partial_output: failure.partial_output,
                };
                let message = self.failure_message(&err);
                reporter.status(ToolStatus::Failed {
                    error: message.clone(),
                });
                ToolResult::failure(&call.id, message)
            }
            Completion::TimedOut(outcome) => {
                let mut message = format!(
                    "tool '{}' timed out after {}s",
                    call.name,
                    self.call_timeout.as_secs_f64()
                );
                if let Some(partial) = partial_text(outcome) {
                    message.push_str("\n\npartial output:\n");
                    message.push_str(&self.cap_output(partial));
                }
                reporter.status(ToolStatus::Failed {
                    error: message.clone(),
                });
                ToolResult::failure(&call.id, message)
            }
            Completion::Cancelled(outcome) => {
                reporter.status(ToolStatus::Cancelled);
                match partial_text(outcome) {
                    Some(p) => ToolResult::cancelled(
                        &call.id,
                        format!("cancelled; partial output:\n{}", self.cap_output(p)),
                    ),
                    None => ToolResult::cancelled(&call.id, "cancelled"),
                }
            }
        };

        tracing::info!(
            call_id = %call.id,
            tool = %call.name,
            is_error = result.is_error(),
            cancelled = result.cancelled,
            elapsed_ms,
            "tool call finished"
        );
        result
    }

    /// Execute calls concurrently; results come back in call order.
    pub async fn execute_batch(
        &self,
        calls: Vec<ToolCall>,
        cancel: CancellationToken,
    ) -> Vec<ToolResult> {
        join_all(
            calls
                .into_iter()
                .map(|call| self.execute(call, cancel.clone())),
        )
        .await
    }

    // ─── Helpers ────────────────────────────────────────────────────────

    fn reject(&self, reporter: &ProgressReporter, call_id: &str, message: String) -> ToolResult {
        reporter.status(ToolStatus::Failed {
            error: message.clone(),
        });
        ToolResult::failure(call_id, message)
    }

    fn failure_message(&self, err: &AgentError) -> String {
        match err {
            AgentError::ToolExecution {
                partial_output: Some(partial),
                ..
            } => format!("{err}\n\npartial output:\n{}", self.cap_output(partial.clone())),
            other => other.to_string(),
        }
    }

    fn cap_output(&self, text: String) -> String {
        if text.len() <= self.max_result_chars {
            return text;
        }
        let kept = truncate_utf8(&text, self.max_result_chars);
        format!(
            "{kept}\n\n[output truncated: showing {} of {} bytes]",
            kept.len(),
            text.len()
        )
    }
}

// ─── Free Functions ─────────────────────────────────────────────────────────

/// Whatever output a stopped tool managed to produce.
fn partial_text(outcome: Option<Result<ToolOutput, ToolFailure>>) -> Option<String> {
    let text = match outcome? {
        Ok(output) => Some(output.text),
        Err(failure) => failure.partial_output,
    };
    text.filter(|text| !text.is_empty())
}

/// Error result for a call whose payload could not be used.
///
/// Quotes the raw text so the model can see what it sent and correct it.
pub fn malformed_call_result(call_id: &str, tool: &str, raw: &str, reason: &str) -> ToolResult {
    let shown = truncate_utf8(raw, MAX_RAW_ECHO_BYTES);
    let ellipsis = if shown.len() < raw.len() { "..." } else { "" };
    let tool = if tool.is_empty() { "<unnamed>" } else { tool };
    tracing::warn!(call_id, tool, reason, raw_preview = %truncate_utf8(raw, 200), "malformed tool call");
    ToolResult::failure(
        call_id,
        format!("malformed tool call '{tool}': {reason}. Raw arguments: {shown}{ellipsis}"),
    )
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_core::progress::{ChannelSink, NoopSink, ProgressEvent};
    use crate::agent_core::tool_registry::FnTool;
    use crate::agent_core::validator::{FieldType, ToolSchema};
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn bash_schema() -> ToolSchema {
        ToolSchema::new()
            .required("command", FieldType::String)
            .optional("timeout_secs", FieldType::Integer, Some(json!(30)))
    }

    /// Registry with a `bash` tool that counts invocations and echoes its command.
    fn counting_registry() -> (Arc<ToolRegistry>, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&hits);
        let mut registry = ToolRegistry::new();
        registry.register(FnTool::new(
            "bash",
            "Run a shell command",
            bash_schema(),
            move |args: Map<String, Value>, ctx: ToolContext| {
                let counter = Arc::clone(&counter);
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    ctx.progress.report("running");
                    let command = args["command"].as_str().unwrap_or_default().to_string();
                    if command == "false" {
                        return Err(ToolFailure::new("exit status 1").with_partial_output("stderr line"));
                    }
                    Ok(ToolOutput::text(format!("ran: {command}")))
                }
            },
        ));
        registry.register(FnTool::new(
            "sleep",
            "Sleep, honouring cancellation",
            ToolSchema::new().required("ms", FieldType::Integer),
            |args: Map<String, Value>, ctx: ToolContext| async move {
                let ms = args["ms"].as_u64().unwrap_or(0);
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => Ok(ToolOutput::text(format!("slept {ms}"))),
                    _ = ctx.cancel.cancelled() => Err(ToolFailure::new("interrupted").with_partial_output("woke early")),
                }
            },
        ));
        registry.register(FnTool::new(
            "stubborn",
            "Ignores cancellation",
            ToolSchema::new(),
            |_args: Map<String, Value>, _ctx: ToolContext| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ToolOutput::text("finally"))
            },
        ));
        (Arc::new(registry), hits)
    }

    fn dispatcher(registry: Arc<ToolRegistry>) -> ToolDispatcher {
        ToolDispatcher::new(registry, &ToolsConfig::default(), Arc::new(NoopSink))
    }

    fn call(id: &str, name: &str, args: Value) -> ToolCall {
        let raw = args.to_string();
        ToolCall {
            id: id.into(),
            name: name.into(),
            raw_arguments: raw,
            arguments: args.as_object().cloned(),
        }
    }

    #[tokio::test]
    async fn test_successful_call() {
        let (registry, hits) = counting_registry();
        let result = dispatcher(registry)
            .execute(call("c1", "bash", json!({"command": "ls -la"})), CancellationToken::new())
            .await;
        assert_eq!(result.output(), Some("ran: ls -la"));
        assert_eq!(result.call_id, "c1");
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_tool() {
        let (registry, _) = counting_registry();
        let result = dispatcher(registry)
            .execute(call("c1", "python", json!({})), CancellationToken::new())
            .await;
        assert_eq!(result.error(), Some("unknown tool: python"));
    }

    #[tokio::test]
    async fn test_missing_required_field_never_reaches_tool() {
        let (registry, hits) = counting_registry();
        let result = dispatcher(registry)
            .execute(call("c1", "bash", json!({"cwd": "/"})), CancellationToken::new())
            .await;
        let error = result.error().unwrap();
        assert!(error.contains("bash"), "got: {error}");
        assert!(error.contains("command"), "got: {error}");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unparsed_call_is_not_executed() {
        let (registry, hits) = counting_registry();
        let malformed = ToolCall::unparsed("c1".into(), "bash".into(), r#"{"command": ls -la}"#.into());
        let result = dispatcher(registry)
            .execute(malformed, CancellationToken::new())
            .await;
        let error = result.error().unwrap();
        assert!(error.contains(r#"{"command": ls -la}"#), "got: {error}");
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_tool_failure_includes_partial_output() {
        let (registry, _) = counting_registry();
        let result = dispatcher(registry)
            .execute(call("c1", "bash", json!({"command": "false"})), CancellationToken::new())
            .await;
        let error = result.error().unwrap();
        assert!(error.contains("exit status 1"));
        assert!(error.contains("stderr line"));
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn test_output_is_truncated() {
        let mut registry = ToolRegistry::new();
        registry.register(FnTool::new(
            "big",
            "",
            ToolSchema::new(),
            |_args: Map<String, Value>, _ctx: ToolContext| async move {
                Ok(ToolOutput::text("é".repeat(100)))
            },
        ));
        let config = ToolsConfig {
            max_result_chars: 11,
            ..ToolsConfig::default()
        };
        let dispatcher = ToolDispatcher::new(Arc::new(registry), &config, Arc::new(NoopSink));
        let result = dispatcher
            .execute(call("c1", "big", json!({})), CancellationToken::new())
            .await;
        let output = result.output().unwrap();
        assert!(output.starts_with(&"é".repeat(5)));
        assert!(output.contains("[output truncated: showing 10 of 200 bytes]"));
    }

    #[tokio::test]
    async fn test_timeout() {
        let (registry, _) = counting_registry();
        let result = dispatcher(registry)
            .with_call_timeout(Duration::from_millis(20))
            .execute(call("c1", "sleep", json!({"ms": 10_000})), CancellationToken::new())
            .await;
        let error = result.error().unwrap();
        assert!(error.contains("timed out"), "got: {error}");
        assert!(error.contains("partial output:\nwoke early"), "got: {error}");
        assert!(!result.cancelled);
    }

    #[tokio::test]
    async fn test_timeout_grace_expires_without_partial_output() {
        let (registry, _) = counting_registry();
        let started = Instant::now();
        let result = dispatcher(registry)
            .with_call_timeout(Duration::from_millis(20))
            .with_cancel_grace(Duration::from_millis(10))
            .execute(call("c1", "stubborn", json!({})), CancellationToken::new())
            .await;
        let error = result.error().unwrap();
        assert!(error.contains("timed out"), "got: {error}");
        assert!(!error.contains("partial output"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_cancellation_lets_tool_wind_down() {
        let (registry, _) = counting_registry();
        let dispatcher = dispatcher(registry).with_cancel_grace(Duration::from_millis(500));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = dispatcher
            .execute(call("c1", "sleep", json!({"ms": 10_000})), cancel)
            .await;
        assert!(result.cancelled);
        assert!(result.error().unwrap().contains("woke early"));
    }

    #[tokio::test]
    async fn test_cancellation_grace_expires() {
        let (registry, _) = counting_registry();
        let dispatcher = dispatcher(registry).with_cancel_grace(Duration::from_millis(10));
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let started = Instant::now();
        let result = dispatcher.execute(call("c1", "stubborn", json!({})), cancel).await;
        assert!(result.cancelled);
        assert_eq!(result.error(), Some("cancelled"));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_already_cancelled_does_not_run() {
        let (registry, hits) = counting_registry();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = dispatcher(registry)
            .execute(call("c1", "bash", json!({"command": "ls"})), cancel)
            .await;
        assert!(result.cancelled);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_batch_preserves_call_order() {
        let (registry, _) = counting_registry();
        let results = dispatcher(registry)
            .execute_batch(
                vec![
                    call("slow", "sleep", json!({"ms": 60})),
                    call("fast", "sleep", json!({"ms": 1})),
                    call("bad", "missing", json!({})),
                ],
                CancellationToken::new(),
            )
            .await;
        let ids: Vec<&str> = results.iter().map(|r| r.call_id.as_str()).collect();
        assert_eq!(ids, vec!["slow", "fast", "bad"]);
        assert_eq!(results[0].output(), Some("slept 60"));
        assert!(results[2].is_error());
    }

    #[tokio::test]
    async fn test_progress_lifecycle_events() {
        let (registry, _) = counting_registry();
        let (sink, mut rx) = ChannelSink::new();
        let dispatcher = ToolDispatcher::new(registry, &ToolsConfig::default(), Arc::new(sink));
        dispatcher
            .execute(call("c1", "bash", json!({"command": "ls"})), CancellationToken::new())
            .await;

        let mut statuses = Vec::new();
        while let Ok(ProgressEvent::Tool { status, .. }) = rx.try_recv() {
            statuses.push(status);
        }
        assert_eq!(
            statuses,
            vec![
                ToolStatus::Started,
                ToolStatus::Progress {
                    message: "running".into()
                },
                ToolStatus::Succeeded,
            ]
        );
    }

    #[test]
    fn test_malformed_call_result_quotes_raw_text() {
        let result = malformed_call_result("c9", "", "{\"command\": ls", "invalid JSON");
        let error = result.error().unwrap();
        assert!(error.contains("<unnamed>"));
        assert!(error.contains("{\"command\": ls"));
    }
}
