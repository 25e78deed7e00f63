//! Conversation history — ordered, append-only turns.
//!
//! A turn is closed once appended and never mutated afterwards. Every tool
//! result must answer a tool call that appears in the same or an earlier
//! turn, and each call is answered at most once.
//!
//! `ConversationStore` is the persistence seam; the in-memory store is the
//! default and the reference implementation for tests.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::errors::AgentError;
use crate::stream::types::{ToolCall, ToolResult};

// ─── Types ──────────────────────────────────────────────────────────────────

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    /// Tool results returned to the model.
    Tool,
}

/// One piece of a turn's content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentSegment {
    Text { text: String },
    Reasoning { text: String },
    ToolCall { call: ToolCall },
    ToolResult { result: ToolResult },
    Opaque { kind: String, payload: String },
}

/// A closed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationTurn {
    pub role: Role,
    pub content: Vec<ContentSegment>,
}

impl ConversationTurn {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: vec![ContentSegment::Text { text: text.into() }],
        }
    }

    /// A tool turn carrying `results` in order.
    pub fn tool_results(results: Vec<ToolResult>) -> Self {
        Self {
            role: Role::Tool,
            content: results
                .into_iter()
                .map(|result| ContentSegment::ToolResult { result })
                .collect(),
        }
    }

    /// Concatenated visible text of the turn.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|segment| match segment {
                ContentSegment::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }

    pub fn tool_calls(&self) -> impl Iterator<Item = &ToolCall> {
        self.content.iter().filter_map(|segment| match segment {
            ContentSegment::ToolCall { call } => Some(call),
            _ => None,
        })
    }

    pub fn results(&self) -> impl Iterator<Item = &ToolResult> {
        self.content.iter().filter_map(|segment| match segment {
            ContentSegment::ToolResult { result } => Some(result),
            _ => None,
        })
    }
}

// ─── Conversation ───────────────────────────────────────────────────────────

/// The history of one conversation, validated on every append.
#[derive(Debug, Clone)]
pub struct Conversation {
    id: String,
    turns: Vec<ConversationTurn>,
    call_ids: HashSet<String>,
    answered: HashSet<String>,
}

impl Default for Conversation {
    fn default() -> Self {
        Self::with_id(Uuid::new_v4().to_string())
    }
}

impl Conversation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            turns: Vec::new(),
            call_ids: HashSet::new(),
            answered: HashSet::new(),
        }
    }

    /// Rebuild a conversation from stored turns, re-checking every invariant.
    pub fn restore(
        id: impl Into<String>,
        turns: Vec<ConversationTurn>,
    ) -> Result<Self, AgentError> {
        let mut conversation = Self::with_id(id);
        for turn in turns {
            conversation.append(turn)?;
        }
        Ok(conversation)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn turns(&self) -> &[ConversationTurn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    pub fn last(&self) -> Option<&ConversationTurn> {
        self.turns.last()
    }

    /// Append a closed turn.
    ///
    /// Rejects empty turns, duplicate call ids, results for calls that do not
    /// exist yet, and second results for the same call. On error the
    /// conversation is unchanged.
    pub fn append(&mut self, turn: ConversationTurn) -> Result<(), AgentError> {
        if turn.content.is_empty() {
            return Err(AgentError::Conversation {
                reason: format!("refusing to append an empty {:?} turn", turn.role),
            });
        }

        let mut new_calls = HashSet::new();
        for call in turn.tool_calls() {
            if self.call_ids.contains(&call.id) || !new_calls.insert(call.id.clone()) {
                return Err(AgentError::Conversation {
                    reason: format!("duplicate tool call id '{}'", call.id),
                });
            }
        }

        let mut new_answers = HashSet::new();
        for result in turn.results() {
            let id = &result.call_id;
            if !self.call_ids.contains(id) && !new_calls.contains(id) {
                return Err(AgentError::Conversation {
                    reason: format!("tool result references unknown call id '{id}'"),
                });
            }
            if self.answered.contains(id) || !new_answers.insert(id.clone()) {
                return Err(AgentError::Conversation {
                    reason: format!("tool call '{id}' already has a result"),
                });
            }
        }

        self.call_ids.extend(new_calls);
        self.answered.extend(new_answers);
        self.turns.push(turn);
        Ok(())
    }

    /// Whether a tool call with this id has already been recorded.
    pub fn contains_call(&self, id: &str) -> bool {
        self.call_ids.contains(id)
    }

    /// Ids of tool calls that have no result yet, in conversation order.
    pub fn unanswered_calls(&self) -> Vec<&str> {
        self.turns
            .iter()
            .flat_map(ConversationTurn::tool_calls)
            .map(|call| call.id.as_str())
            .filter(|id| !self.answered.contains(*id))
            .collect()
    }
}

// ─── Store ──────────────────────────────────────────────────────────────────

/// Persistence for closed turns.
pub trait ConversationStore: Send + Sync {
    fn append_turn(&self, conversation_id: &str, turn: &ConversationTurn) -> Result<(), AgentError>;

    fn load(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>, AgentError>;
}

/// Process-local store.
#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<String, Vec<ConversationTurn>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConversationStore for InMemoryConversationStore {
    fn append_turn(&self, conversation_id: &str, turn: &ConversationTurn) -> Result<(), AgentError> {
        let mut conversations = self.conversations.lock().map_err(|e| AgentError::Conversation {
            reason: format!("store lock poisoned: {e}"),
        })?;
        conversations
            .entry(conversation_id.to_string())
            .or_default()
            .push(turn.clone());
        Ok(())
    }

    fn load(&self, conversation_id: &str) -> Result<Vec<ConversationTurn>, AgentError> {
        let conversations = self.conversations.lock().map_err(|e| AgentError::Conversation {
            reason: format!("store lock poisoned: {e}"),
        })?;
        Ok(conversations
            .get(conversation_id)
            .cloned()
            .unwrap_or_default())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn call(id: &str) -> ToolCall {
        ToolCall {
            id: id.into(),
            name: "bash".into(),
            raw_arguments: "{}".into(),
            arguments: Some(serde_json::Map::new()),
        }
    }

    fn assistant_with_calls(ids: &[&str]) -> ConversationTurn {
        let mut content = vec![ContentSegment::Text {
            text: "Hello world".into(),
        }];
        content.extend(ids.iter().map(|id| ContentSegment::ToolCall { call: call(id) }));
        ConversationTurn {
            role: Role::Assistant,
            content,
        }
    }

    #[test]
    fn test_append_links_results_to_calls() {
        let mut conv = Conversation::new();
        conv.append(ConversationTurn::user("list files")).unwrap();
        conv.append(assistant_with_calls(&["a", "b"])).unwrap();
        assert_eq!(conv.unanswered_calls(), vec!["a", "b"]);

        conv.append(ConversationTurn::tool_results(vec![
            ToolResult::success("a", "ok"),
            ToolResult::failure("b", "boom"),
        ]))
        .unwrap();
        assert!(conv.unanswered_calls().is_empty());
        assert_eq!(conv.len(), 3);
        assert_eq!(conv.turns()[1].text(), "Hello world");
    }

    #[test]
    fn test_result_for_unknown_call_is_rejected() {
        let mut conv = Conversation::new();
        conv.append(ConversationTurn::user("hi")).unwrap();
        let err = conv
            .append(ConversationTurn::tool_results(vec![ToolResult::success("ghost", "x")]))
            .unwrap_err();
        assert!(err.to_string().contains("ghost"));
        assert_eq!(conv.len(), 1, "failed append leaves history unchanged");
    }

    #[test]
    fn test_second_result_for_same_call_is_rejected() {
        let mut conv = Conversation::new();
        conv.append(assistant_with_calls(&["a"])).unwrap();
        conv.append(ConversationTurn::tool_results(vec![ToolResult::success("a", "1")]))
            .unwrap();
        assert!(conv
            .append(ConversationTurn::tool_results(vec![ToolResult::success("a", "2")]))
            .is_err());
    }

    #[test]
    fn test_duplicate_call_id_is_rejected() {
        let mut conv = Conversation::new();
        conv.append(assistant_with_calls(&["a"])).unwrap();
        assert!(conv.append(assistant_with_calls(&["a"])).is_err());
        assert!(Conversation::new()
            .append(assistant_with_calls(&["x", "x"]))
            .is_err());
    }

    #[test]
    fn test_empty_turn_is_rejected() {
        let mut conv = Conversation::new();
        let empty = ConversationTurn {
            role: Role::Assistant,
            content: vec![],
        };
        assert!(conv.append(empty).is_err());
    }

    #[test]
    fn test_store_round_trip_and_restore() {
        let store = InMemoryConversationStore::new();
        let turns = vec![
            ConversationTurn::user("hi"),
            assistant_with_calls(&["a"]),
            ConversationTurn::tool_results(vec![ToolResult::success("a", "done")]),
        ];
        for turn in &turns {
            store.append_turn("c1", turn).unwrap();
        }

        let loaded = store.load("c1").unwrap();
        assert_eq!(loaded, turns);
        assert!(store.load("missing").unwrap().is_empty());

        let conv = Conversation::restore("c1", loaded).unwrap();
        assert_eq!(conv.id(), "c1");
        assert!(conv.unanswered_calls().is_empty());
    }

    #[test]
    fn test_turn_serialization_is_tagged() {
        let json = serde_json::to_value(ConversationTurn::user("hi")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"role": "user", "content": [{"type": "text", "text": "hi"}]})
        );
    }
}
