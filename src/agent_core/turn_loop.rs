//! Turn loop — drives one user turn through model round trips and tool calls.
//!
//! ```text
//! Idle → AwaitingResponse → StreamingSegments ─┬─→ ToolsPending → AwaitingResponse …
//!                                              └─→ TurnComplete
//! (any state) → Failed
//! ```
//!
//! Each finished tool-call segment is dispatched as soon as its end signal
//! arrives, while the rest of the response is still streaming. Executions are
//! polled on the same task as the event stream and joined at turn-end. The
//! assistant turn and then the tool turn (results in call order) are appended
//! before the next request goes out.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::stream::config::ArgumentDialect;
use crate::stream::demux::{DemuxOutput, FinishedSegment, SegmentDemultiplexer};
use crate::stream::errors::StreamError;
use crate::stream::transport::{EventStream, Transport, TurnRequest};
use crate::stream::types::{StopReason, StreamEvent, TokenUsage, ToolCall, ToolResult};

use super::config::{AgentConfig, TurnLoopConfig};
use super::conversation::{ContentSegment, Conversation, ConversationStore, ConversationTurn, Role};
use super::dispatcher::{malformed_call_result, ToolDispatcher};
use super::errors::AgentError;
use super::governor::RateGovernor;
use super::progress::{ProgressEvent, ProgressSink};
use super::tokens::estimate_request_tokens;
use super::tool_registry::ToolRegistry;

// ─── Public Types ────────────────────────────────────────────────────────────

/// Where the loop is within the current user turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnState {
    Idle,
    AwaitingResponse,
    StreamingSegments,
    ToolsPending,
    TurnComplete,
    Failed,
}

/// Result of a completed user turn.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnOutcome {
    /// Visible text of the last assistant response.
    pub final_text: String,
    /// Requests sent to the model, retries excluded.
    pub round_trips: usize,
    /// Every tool result produced during the turn, in order.
    pub tool_results: Vec<ToolResult>,
    pub stop_reason: StopReason,
    /// Service-reported usage summed over round trips.
    pub usage: TokenUsage,
}

type InFlight = FuturesUnordered<BoxFuture<'static, (usize, ToolResult)>>;

/// What one round trip produced.
struct RoundOutcome {
    text: String,
    results: Vec<ToolResult>,
    stop_reason: StopReason,
    usage: TokenUsage,
}

/// Accumulated while a response streams.
#[derive(Default)]
struct RoundState {
    segments: BTreeMap<usize, ContentSegment>,
    results: BTreeMap<usize, ToolResult>,
    /// Tool-call ids claimed by this response.
    call_ids: HashSet<String>,
    start_usage: Option<TokenUsage>,
    end: Option<(StopReason, Option<TokenUsage>)>,
}

// ─── TurnLoop ────────────────────────────────────────────────────────────────

pub struct TurnLoop {
    transport: Arc<dyn Transport>,
    governor: Arc<RateGovernor>,
    dispatcher: Arc<ToolDispatcher>,
    progress: Arc<dyn ProgressSink>,
    store: Option<Arc<dyn ConversationStore>>,
    conversation: Conversation,
    config: TurnLoopConfig,
    dialect: ArgumentDialect,
    system: Option<String>,
    max_tokens: u32,
    tool_defs: Vec<Value>,
    state: TurnState,
}

impl TurnLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        governor: Arc<RateGovernor>,
        dispatcher: Arc<ToolDispatcher>,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        let tool_defs = dispatcher.registry().tool_definitions();
        Self {
            transport,
            governor,
            dispatcher,
            progress,
            store: None,
            conversation: Conversation::new(),
            config: TurnLoopConfig::default(),
            dialect: ArgumentDialect::default(),
            system: None,
            max_tokens: 4096,
            tool_defs,
            state: TurnState::Idle,
        }
    }

    /// Wire a loop from loaded configuration.
    ///
    /// Applies the `enabled_tools` allowlist to `registry` before handing it
    /// to the dispatcher.
    pub fn from_config(
        config: &AgentConfig,
        transport: Arc<dyn Transport>,
        governor: Arc<RateGovernor>,
        mut registry: ToolRegistry,
        progress: Arc<dyn ProgressSink>,
    ) -> Self {
        if let Some(allowed) = config.tools.enabled_set() {
            registry.retain_tools(&allowed);
        }
        let dispatcher = ToolDispatcher::new(Arc::new(registry), &config.tools, Arc::clone(&progress));
        let mut turn_loop = Self::new(transport, governor, Arc::new(dispatcher), progress)
            .with_config(config.turn.clone())
            .with_dialect(config.transport.dialect)
            .with_max_tokens(config.transport.max_tokens);
        turn_loop.system = config.transport.system_prompt.clone();
        turn_loop
    }

    pub fn with_config(mut self, config: TurnLoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_dialect(mut self, dialect: ArgumentDialect) -> Self {
        self.dialect = dialect;
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system = Some(system.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    pub fn with_store(mut self, store: Arc<dyn ConversationStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Continue an existing conversation.
    pub fn with_conversation(mut self, conversation: Conversation) -> Self {
        self.conversation = conversation;
        self
    }

    pub fn state(&self) -> TurnState {
        self.state
    }

    pub fn conversation(&self) -> &Conversation {
        &self.conversation
    }

    // ─── Turn ───────────────────────────────────────────────────────────

    /// Run one user turn to completion.
    ///
    /// Tool failures, validation errors and malformed calls are reported to
    /// the model as tool results; only stream violations, exhausted retries,
    /// the round-trip limit and cancellation end the turn with an error.
    pub async fn run_turn(
        &mut self,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let result = self.drive(user_text, cancel).await;
        self.state = match &result {
            Ok(_) => TurnState::TurnComplete,
            Err(e) => {
                tracing::warn!(conversation_id = %self.conversation.id(), error = %e, "turn failed");
                TurnState::Failed
            }
        };
        result
    }

    async fn drive(
        &mut self,
        user_text: &str,
        cancel: &CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        self.append_turn(ConversationTurn::user(user_text))?;

        let mut tool_results = Vec::new();
        let mut usage = TokenUsage::default();
        let mut round_trips = 0;

        loop {
            if round_trips >= self.config.max_round_trips {
                return Err(AgentError::RoundTripLimit {
                    limit: self.config.max_round_trips,
                });
            }
            round_trips += 1;

            let round = self.round_trip(round_trips, cancel).await?;
            usage += round.usage;
            let has_results = !round.results.is_empty();
            tool_results.extend(round.results);

            if round.stop_reason == StopReason::ToolUse && has_results {
                self.state = TurnState::ToolsPending;
                continue;
            }

            tracing::info!(
                conversation_id = %self.conversation.id(),
                round_trips,
                tool_results = tool_results.len(),
                input_tokens = usage.input_tokens,
                output_tokens = usage.output_tokens,
                "turn complete"
            );
            return Ok(TurnOutcome {
                final_text: round.text,
                round_trips,
                tool_results,
                stop_reason: round.stop_reason,
                usage,
            });
        }
    }

    /// One request/response exchange, including tool execution.
    async fn round_trip(
        &mut self,
        round: usize,
        cancel: &CancellationToken,
    ) -> Result<RoundOutcome, AgentError> {
        self.state = TurnState::AwaitingResponse;
        let estimated = estimate_request_tokens(
            self.system.as_deref(),
            self.conversation.turns(),
            &self.tool_defs,
        );
        tracing::info!(
            conversation_id = %self.conversation.id(),
            round,
            turns = self.conversation.len(),
            estimated_tokens = estimated,
            "round trip start"
        );

        let (first_event, mut events) = self.open_with_retries(estimated, cancel).await?;

        self.state = TurnState::StreamingSegments;
        let mut demux = SegmentDemultiplexer::new(self.dialect);
        let mut state = RoundState::default();
        let mut in_flight: InFlight = FuturesUnordered::new();
        let mut pending = Some(first_event);

        let failure = loop {
            let next = match pending.take() {
                Some(event) => Some(Ok(event)),
                None => tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break Some(AgentError::Cancelled),
                    Some((index, result)) = in_flight.next(), if !in_flight.is_empty() => {
                        state.results.insert(index, result);
                        continue;
                    }
                    next = events.next() => next,
                },
            };

            let event = match next {
                Some(Ok(event)) => event,
                Some(Err(e)) => break Some(mid_stream_error(e)),
                None => {
                    break Some(AgentError::MalformedStream {
                        reason: "stream ended without turn-end".into(),
                    })
                }
            };

            let outputs = match demux.push(event) {
                Ok(outputs) => outputs,
                Err(e) => break Some(e.into()),
            };
            for output in outputs {
                self.handle_output(output, &mut state, &mut in_flight, cancel);
            }
            if state.end.is_some() {
                break None;
            }
        };

        // Join executions still running. On cancellation the dispatcher turns
        // each into a terminal cancelled result.
        while let Some((index, result)) = in_flight.next().await {
            state.results.insert(index, result);
        }

        let RoundState {
            segments,
            results,
            start_usage,
            end,
            ..
        } = state;

        // Tokens are spent once the first event arrived, even if the round fails.
        let usage = merge_usage(start_usage, end.as_ref().and_then(|(_, usage)| *usage))
            .unwrap_or(TokenUsage {
                input_tokens: estimated,
                output_tokens: 0,
            });
        self.governor.record(usage, &HashMap::new());

        let assistant = ConversationTurn {
            role: Role::Assistant,
            content: segments.into_values().collect(),
        };
        let text = assistant.text();
        let results: Vec<ToolResult> = results.into_values().collect();

        if !assistant.content.is_empty() {
            self.append_turn(assistant)?;
        }
        if !results.is_empty() {
            self.append_turn(ConversationTurn::tool_results(results.clone()))?;
        }

        if let Some(err) = failure {
            return Err(err);
        }

        let Some((stop_reason, _)) = end else {
            return Err(AgentError::MalformedStream {
                reason: "response finished without turn-end".into(),
            });
        };

        tracing::info!(
            round,
            stop_reason = ?stop_reason,
            text_len = text.len(),
            tool_results = results.len(),
            "round trip finished"
        );
        Ok(RoundOutcome {
            text,
            results,
            stop_reason,
            usage,
        })
    }

    // ─── Transport ──────────────────────────────────────────────────────

    /// Open the stream and read its first event, retrying transport failures.
    async fn open_with_retries(
        &self,
        estimated: u64,
        cancel: &CancellationToken,
    ) -> Result<(StreamEvent, EventStream), AgentError> {
        let mut attempt: u32 = 0;
        loop {
            if self.config.honor_admission {
                self.governor.wait_for_admission(estimated, cancel).await?;
            }

            let request = TurnRequest {
                system: self.system.as_deref(),
                turns: self.conversation.turns(),
                tools: &self.tool_defs,
                max_tokens: self.max_tokens,
            };
            let error = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                opened = self.open_first_event(&request) => match opened {
                    Ok(opened) => return Ok(opened),
                    Err(e) => e,
                },
            };

            if let StreamError::MalformedStream { .. } = error {
                return Err(error.into());
            }
            if !error.is_retriable() || attempt >= self.config.max_transport_retries {
                return Err(AgentError::TransportExhausted {
                    attempts: attempt + 1,
                    reason: error.to_string(),
                });
            }

            let delay = self
                .governor
                .backoff_delay(attempt)
                .max(error.retry_after().unwrap_or_default());
            tracing::warn!(
                attempt = attempt + 1,
                max_retries = self.config.max_transport_retries,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "transport error, retrying"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Err(AgentError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
            attempt += 1;
        }
    }

    async fn open_first_event(
        &self,
        request: &TurnRequest<'_>,
    ) -> Result<(StreamEvent, EventStream), StreamError> {
        let opened = self.transport.open(request).await?;
        self.governor.observe(&opened.rate_limits);
        let mut events = opened.events;
        match events.next().await {
            Some(Ok(event)) => Ok((event, events)),
            Some(Err(e)) => Err(e),
            None => Err(StreamError::Transport {
                reason: "stream ended before the first event".into(),
            }),
        }
    }

    // ─── Segments ───────────────────────────────────────────────────────

    fn handle_output(
        &self,
        output: DemuxOutput,
        state: &mut RoundState,
        in_flight: &mut InFlight,
        cancel: &CancellationToken,
    ) {
        match output {
            DemuxOutput::TurnStarted { message_id, usage } => {
                tracing::debug!(message_id = ?message_id, "response started");
                state.start_usage = usage;
            }
            DemuxOutput::Delta {
                index,
                kind,
                fragment,
            } => self.progress.emit(ProgressEvent::SegmentText {
                kind,
                index,
                text: fragment,
            }),
            DemuxOutput::Warning { index, message } => {
                tracing::warn!(index = ?index, message = %message, "stream warning");
                self.progress.emit(ProgressEvent::Warning { message });
            }
            DemuxOutput::Finished(segment) => self.finish_segment(segment, state, in_flight, cancel),
            DemuxOutput::TurnEnded { reason, usage } => state.end = Some((reason, usage)),
        }
    }

    fn finish_segment(
        &self,
        segment: FinishedSegment,
        state: &mut RoundState,
        in_flight: &mut InFlight,
        cancel: &CancellationToken,
    ) {
        match segment {
            FinishedSegment::Text { index, text } => {
                if !text.is_empty() {
                    state.segments.insert(index, ContentSegment::Text { text });
                }
            }
            FinishedSegment::Reasoning { index, text } => {
                if !text.is_empty() {
                    state.segments.insert(index, ContentSegment::Reasoning { text });
                }
            }
            FinishedSegment::Opaque {
                index,
                kind,
                payload,
            } => {
                state
                    .segments
                    .insert(index, ContentSegment::Opaque { kind, payload });
            }
            FinishedSegment::ToolCall {
                index,
                call: Ok(mut call),
            } => {
                if !self.claim_call_id(&call.id, state) {
                    let repeated = std::mem::replace(&mut call.id, new_call_id());
                    state.call_ids.insert(call.id.clone());
                    tracing::warn!(
                        index,
                        call_id = %repeated,
                        tool = %call.name,
                        "repeated tool call id, not executing"
                    );
                    state.results.insert(
                        index,
                        ToolResult::failure(
                            &call.id,
                            format!("duplicate tool call id '{repeated}'; the call was not executed"),
                        ),
                    );
                    state.segments.insert(index, ContentSegment::ToolCall { call });
                    return;
                }
                state
                    .segments
                    .insert(index, ContentSegment::ToolCall { call: call.clone() });
                let dispatcher = Arc::clone(&self.dispatcher);
                let cancel = cancel.clone();
                in_flight.push(async move { (index, dispatcher.execute(call, cancel).await) }.boxed());
            }
            FinishedSegment::ToolCall {
                index,
                call: Err(err),
            } => {
                let (id, name, raw, reason) = match err {
                    StreamError::MalformedToolCall {
                        id,
                        name,
                        raw,
                        reason,
                        ..
                    } => (id, name, raw, reason),
                    other => (None, None, String::new(), other.to_string()),
                };
                let id = match id {
                    Some(id) if self.claim_call_id(&id, state) => id,
                    _ => {
                        let id = new_call_id();
                        state.call_ids.insert(id.clone());
                        id
                    }
                };
                let name = name.unwrap_or_default();
                state
                    .results
                    .insert(index, malformed_call_result(&id, &name, &raw, &reason));
                state.segments.insert(
                    index,
                    ContentSegment::ToolCall {
                        call: ToolCall::unparsed(id, name, raw),
                    },
                );
            }
        }
    }

    /// Reserve `id` for this response; false when it is already taken.
    fn claim_call_id(&self, id: &str, state: &mut RoundState) -> bool {
        !self.conversation.contains_call(id) && state.call_ids.insert(id.to_string())
    }

    fn append_turn(&mut self, turn: ConversationTurn) -> Result<(), AgentError> {
        self.conversation.append(turn)?;
        if let (Some(store), Some(turn)) = (&self.store, self.conversation.last()) {
            store.append_turn(self.conversation.id(), turn)?;
        }
        Ok(())
    }
}

// ─── Helpers ─────────────────────────────────────────────────────────────────

fn new_call_id() -> String {
    format!("call_{}", Uuid::new_v4())
}

fn mid_stream_error(e: StreamError) -> AgentError {
    match e {
        StreamError::MalformedStream { reason } => AgentError::MalformedStream { reason },
        other => AgentError::TransportExhausted {
            attempts: 1,
            reason: format!("stream failed mid-response: {other}"),
        },
    }
}

/// Combine usage from turn-start (input) and turn-end (output), keeping the larger figure.
fn merge_usage(start: Option<TokenUsage>, end: Option<TokenUsage>) -> Option<TokenUsage> {
    if start.is_none() && end.is_none() {
        return None;
    }
    let start = start.unwrap_or_default();
    let end = end.unwrap_or_default();
    Some(TokenUsage {
        input_tokens: start.input_tokens.max(end.input_tokens),
        output_tokens: start.output_tokens.max(end.output_tokens),
    })
}

// ─── Tests ───────────────────────────────────────────────────────────────────
