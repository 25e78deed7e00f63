//! Transports — where stream events come from.
//!
//! The turn loop only sees the `Transport` trait. `HttpTransport` is the
//! production implementation: a streaming Messages-API request over reqwest,
//! decoded by `sse::parse_sse_stream`. Tests script their own transports.

use std::collections::HashMap;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use reqwest::header::HeaderMap;
use reqwest::Client as HttpClient;
use serde_json::{json, Value};

use super::config::TransportConfig;
use super::errors::StreamError;
use super::sse::parse_sse_stream;
use super::types::{StreamEvent, ToolResult};
use crate::agent_core::conversation::{ContentSegment, ConversationTurn, Role};
use crate::agent_core::governor::RateDimension;

// ─── Public Types ────────────────────────────────────────────────────────────

/// A boxed stream of decoded events.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, StreamError>> + Send>>;

/// Everything needed to request one model response.
#[derive(Debug, Clone, Copy)]
pub struct TurnRequest<'a> {
    pub system: Option<&'a str>,
    pub turns: &'a [ConversationTurn],
    /// Tool definitions (`name`, `description`, `input_schema`).
    pub tools: &'a [Value],
    pub max_tokens: u32,
}

/// Budget figures the service reported alongside a response.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RateLimitSnapshot {
    pub remaining: HashMap<RateDimension, u64>,
    pub resets: HashMap<RateDimension, DateTime<Utc>>,
}

impl RateLimitSnapshot {
    pub fn is_empty(&self) -> bool {
        self.remaining.is_empty() && self.resets.is_empty()
    }
}

/// An accepted request: its event stream plus any rate-limit figures.
pub struct OpenedStream {
    pub events: EventStream,
    pub rate_limits: RateLimitSnapshot,
}

impl OpenedStream {
    pub fn new(events: EventStream) -> Self {
        Self {
            events,
            rate_limits: RateLimitSnapshot::default(),
        }
    }
}

/// Source of stream events for one model response.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue the request and return the response's event stream.
    ///
    /// Errors here (and errors before the first event) are transport errors
    /// the turn loop may retry.
    async fn open(&self, request: &TurnRequest<'_>) -> Result<OpenedStream, StreamError>;
}

// ─── HTTP Transport ──────────────────────────────────────────────────────────

/// Rate-limit header prefixes, most specific first.
const RATE_LIMIT_HEADER_PREFIXES: [&str; 2] = ["anthropic-ratelimit-", "x-ratelimit-"];

/// Streaming Messages-API client.
pub struct HttpTransport {
    http: HttpClient,
    config: TransportConfig,
}

impl HttpTransport {
    pub fn new(config: TransportConfig) -> Result<Self, StreamError> {
        config.validate()?;
        let http = HttpClient::builder()
            .connect_timeout(Duration::from_secs(config.connect_timeout_secs))
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| StreamError::ConnectionFailed {
                endpoint: config.base_url.clone(),
                reason: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self { http, config })
    }

    pub fn config(&self) -> &TransportConfig {
        &self.config
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn open(&self, request: &TurnRequest<'_>) -> Result<OpenedStream, StreamError> {
        let url = self.config.messages_url();
        let body = build_request_body(&self.config, request);

        tracing::info!(
            url = %url,
            model = %self.config.model,
            turn_count = request.turns.len(),
            tool_count = request.tools.len(),
            max_tokens = request.max_tokens,
            "sending streaming request"
        );

        let mut builder = self
            .http
            .post(&url)
            .header("anthropic-version", &self.config.api_version)
            .header("Accept", "text/event-stream")
            .json(&body);
        if let Some(key) = self.config.api_key.as_deref().filter(|k| !k.is_empty()) {
            builder = builder.header("x-api-key", key);
        }

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                StreamError::Timeout {
                    duration_secs: self.config.request_timeout_secs,
                }
            } else {
                StreamError::ConnectionFailed {
                    endpoint: url.clone(),
                    reason: e.to_string(),
                }
            }
        })?;

        let status = response.status();
        let rate_limits = parse_rate_limit_headers(response.headers());

        if status.as_u16() == 429 {
            let retry_after_secs = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            tracing::warn!(retry_after_secs = ?retry_after_secs, "request rate limited by service");
            return Err(StreamError::RateLimited { retry_after_secs });
        }

        if !status.is_success() {
            let body_text = response.text().await.unwrap_or_default();
            return Err(StreamError::HttpError {
                status: status.as_u16(),
                body: body_text,
            });
        }

        let events = parse_sse_stream(Box::pin(response.bytes_stream()));
        Ok(OpenedStream {
            events: Box::pin(events),
            rate_limits,
        })
    }
}

// ─── Request Building ────────────────────────────────────────────────────────

/// Build the JSON body for a streaming request.
pub fn build_request_body(config: &TransportConfig, request: &TurnRequest<'_>) -> Value {
    let mut body = json!({
        "model": config.model,
        "max_tokens": request.max_tokens,
        "stream": true,
        "messages": wire_messages(request.turns),
    });

    if let Some(system) = request.system.filter(|s| !s.is_empty()) {
        body["system"] = json!(system);
    }
    if !request.tools.is_empty() {
        body["tools"] = Value::Array(request.tools.to_vec());
    }
    body
}

/// Convert conversation turns to wire messages.
///
/// Tool-result turns travel with the `user` role; consecutive messages with
/// the same wire role are merged because the service requires alternation.
fn wire_messages(turns: &[ConversationTurn]) -> Vec<Value> {
    let mut messages: Vec<(&'static str, Vec<Value>)> = Vec::new();

    for turn in turns {
        let role = match turn.role {
            Role::Assistant => "assistant",
            Role::User | Role::Tool => "user",
        };
        let blocks: Vec<Value> = turn.content.iter().filter_map(wire_block).collect();
        if blocks.is_empty() {
            continue;
        }
        match messages.last_mut() {
            Some((last_role, content)) if *last_role == role => content.extend(blocks),
            _ => messages.push((role, blocks)),
        }
    }

    messages
        .into_iter()
        .map(|(role, content)| json!({"role": role, "content": content}))
        .collect()
}

fn wire_block(segment: &ContentSegment) -> Option<Value> {
    match segment {
        ContentSegment::Text { text } if !text.is_empty() => {
            Some(json!({"type": "text", "text": text}))
        }
        ContentSegment::Text { .. } => None,
        // Reasoning is not replayed; the service re-derives it.
        ContentSegment::Reasoning { .. } => None,
        ContentSegment::ToolCall { call } => Some(json!({
            "type": "tool_use",
            "id": call.id,
            "name": call.name,
            "input": call.arguments.clone().map(Value::Object).unwrap_or_else(|| json!({})),
        })),
        ContentSegment::ToolResult { result } => Some(wire_tool_result(result)),
        ContentSegment::Opaque { payload, .. } => match serde_json::from_str::<Value>(payload) {
            Ok(block @ Value::Object(_)) if block.get("type").is_some() => Some(block),
            _ => None,
        },
    }
}

fn wire_tool_result(result: &ToolResult) -> Value {
    let mut text = result.content().to_string();
    if let Some(binary) = &result.binary {
        text.push_str(&format!(
            "\n[binary attachment: {}, {} bytes]",
            binary.media_type,
            binary.data.len()
        ));
    }
    json!({
        "type": "tool_result",
        "tool_use_id": result.call_id,
        "content": text,
        "is_error": result.is_error(),
    })
}

// ─── Rate-limit headers ──────────────────────────────────────────────────────

/// Extract remaining budgets and reset instants from response headers.
///
/// Recognises `<prefix>{input-tokens,output-tokens,tokens}-{remaining,reset}`
/// with RFC 3339 reset timestamps. Unparseable values are skipped.
pub fn parse_rate_limit_headers(headers: &HeaderMap) -> RateLimitSnapshot {
    let mut snapshot = RateLimitSnapshot::default();
    let dimensions = [
        (RateDimension::InputTokens, "input-tokens"),
        (RateDimension::OutputTokens, "output-tokens"),
        (RateDimension::TotalTokens, "tokens"),
    ];

    for (dimension, name) in dimensions {
        for prefix in RATE_LIMIT_HEADER_PREFIXES {
            let remaining = header_str(headers, &format!("{prefix}{name}-remaining"))
                .and_then(|v| v.parse::<u64>().ok());
            let reset = header_str(headers, &format!("{prefix}{name}-reset"))
                .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
                .map(|t| t.with_timezone(&Utc));

            if remaining.is_none() && reset.is_none() {
                continue;
            }
            if let Some(remaining) = remaining {
                snapshot.remaining.insert(dimension, remaining);
            }
            if let Some(reset) = reset {
                snapshot.resets.insert(dimension, reset);
            }
            break;
        }
    }

    snapshot
}

fn header_str<'h>(headers: &'h HeaderMap, name: &str) -> Option<&'h str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
