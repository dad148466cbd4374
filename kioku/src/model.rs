//! Core data model: sessions, messages, and tool-call metadata.
//!
//! Invariants enforced by the engine (not by these plain types):
//!
//! - `total_count == user_count + agent_count` after every append
//! - `order` is strictly increasing and gapless within a session
//! - messages are append-only; never mutated after creation

use crate::error::{EngineError, Result};
use crate::util::{self, timestamp_ms};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Who produced a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SenderRole {
    /// The human user.
    User,
    /// The conversational agent (including tool invocations it records).
    Agent,
}

impl SenderRole {
    /// Stable string form used in the durable store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "agent" => Ok(Self::Agent),
            other => Err(EngineError::validation(format!("unknown role: {other}"))),
        }
    }
}

/// Lifecycle status of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    /// Accepting appends; recent data lives in the cache tier.
    Active,
    /// Fully migrated to the durable store; cache copy discarded.
    Archived,
    /// Marked deleted (kept for schema parity; the engine only hard-deletes).
    Deleted,
}

impl SessionStatus {
    /// Stable string form used in the durable store.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::Deleted => "deleted",
        }
    }

    /// Parse the stored string form.
    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "active" => Ok(Self::Active),
            "archived" => Ok(Self::Archived),
            "deleted" => Ok(Self::Deleted),
            other => Err(EngineError::validation(format!("unknown status: {other}"))),
        }
    }
}

/// A tool invocation recorded alongside a message.
///
/// Parameters and results are opaque structured documents; the engine
/// never inspects their schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    /// Name of the invoked tool.
    pub name: String,
    /// Arguments passed to the tool.
    pub parameters: Value,
    /// Raw tool output, if any.
    pub result: Option<String>,
}

impl ToolCall {
    /// Create a new tool-call record.
    #[must_use]
    pub fn new(name: impl Into<String>, parameters: Value, result: Option<String>) -> Self {
        Self {
            name: name.into(),
            parameters,
            result,
        }
    }
}

/// Input for an append: everything except the engine-assigned fields.
#[derive(Debug, Clone)]
pub struct NewMessage {
    /// Sender role.
    pub role: SenderRole,
    /// Message content.
    pub content: String,
    /// Optional tool invocation metadata.
    pub tool: Option<ToolCall>,
    /// Opaque metadata document.
    pub extra: Value,
}

impl NewMessage {
    /// A plain user message.
    #[must_use]
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: SenderRole::User,
            content: content.into(),
            tool: None,
            extra: Value::Null,
        }
    }

    /// A plain agent message.
    #[must_use]
    pub fn agent(content: impl Into<String>) -> Self {
        Self {
            role: SenderRole::Agent,
            content: content.into(),
            tool: None,
            extra: Value::Null,
        }
    }

    /// An agent message recording a tool invocation.
    #[must_use]
    pub fn tool_call(name: impl Into<String>, parameters: Value, result: Option<String>) -> Self {
        let name = name.into();
        Self {
            role: SenderRole::Agent,
            content: format!("tool call: {name}"),
            tool: Some(ToolCall::new(name, parameters, result)),
            extra: Value::Null,
        }
    }

    /// Attach an opaque metadata document.
    #[must_use]
    pub fn with_extra(mut self, extra: Value) -> Self {
        self.extra = extra;
        self
    }
}

/// A single stored message. Append-only once created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageRecord {
    /// Unique message id (immutable).
    pub id: String,
    /// Owning session id.
    pub session_id: String,
    /// Sender role.
    pub role: SenderRole,
    /// Message content.
    pub content: String,
    /// Per-session sequence number, strictly increasing and gapless.
    pub order: u64,
    /// Whether this message records a tool invocation.
    pub is_tool_query: bool,
    /// Invoked tool name.
    pub tool_name: Option<String>,
    /// Tool arguments, opaque.
    pub tool_parameters: Option<Value>,
    /// Raw tool output.
    pub tool_result: Option<String>,
    /// Creation timestamp (Unix milliseconds).
    pub created_at: u64,
    /// Opaque metadata document.
    pub extra: Value,
}

impl MessageRecord {
    /// Materialize an input message at the given sequence number.
    #[must_use]
    pub fn from_new(session_id: &str, order: u64, new: NewMessage) -> Self {
        let (is_tool_query, tool_name, tool_parameters, tool_result) = match new.tool {
            Some(t) => (true, Some(t.name), Some(t.parameters), t.result),
            None => (false, None, None, None),
        };
        Self {
            id: util::generate_id(),
            session_id: session_id.to_string(),
            role: new.role,
            content: new.content,
            order,
            is_tool_query,
            tool_name,
            tool_parameters,
            tool_result,
            created_at: timestamp_ms(),
            extra: new.extra,
        }
    }
}

/// A session row: identity, counters, and lifecycle status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    /// Unique session id (immutable).
    pub id: String,
    /// Owner identifier.
    pub owner: String,
    /// Display title.
    pub title: String,
    /// Creation timestamp (Unix milliseconds).
    pub created_at: u64,
    /// Last-activity timestamp (Unix milliseconds).
    pub last_activity: u64,
    /// Total message count (denormalized).
    pub total_count: u64,
    /// Messages sent by the user.
    pub user_count: u64,
    /// Messages sent by the agent.
    pub agent_count: u64,
    /// Lifecycle status.
    pub status: SessionStatus,
}

impl SessionRecord {
    /// Create a fresh active session with zero counters.
    #[must_use]
    pub fn new(owner: impl Into<String>, title: Option<String>) -> Self {
        let now = timestamp_ms();
        Self {
            id: util::generate_id(),
            owner: owner.into(),
            title: title.unwrap_or_else(|| util::default_title(now)),
            created_at: now,
            last_activity: now,
            total_count: 0,
            user_count: 0,
            agent_count: 0,
            status: SessionStatus::Active,
        }
    }

    /// Bump counters and the activity timestamp for one appended message.
    pub fn record_append(&mut self, role: SenderRole, now_ms: u64) {
        self.total_count += 1;
        match role {
            SenderRole::User => self.user_count += 1,
            SenderRole::Agent => self.agent_count += 1,
        }
        self.last_activity = self.last_activity.max(now_ms);
    }

    /// Whether `total == user + agent` holds.
    #[must_use]
    pub const fn counters_consistent(&self) -> bool {
        self.total_count == self.user_count + self.agent_count
    }
}

/// Message counts recomputed from durable rows.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoleCounts {
    /// All rows for the session.
    pub total: u64,
    /// Rows with role `user`.
    pub user: u64,
    /// Rows with role `agent`.
    pub agent: u64,
    /// Rows flagged as tool queries.
    pub tool_queries: u64,
}

/// Stored session row plus counts recomputed from message rows.
#[derive(Debug, Clone, Serialize)]
pub struct SessionStats {
    /// The session as stored.
    pub session: SessionRecord,
    /// Counts recomputed by scanning durable rows.
    pub recomputed: RoleCounts,
}

/// Outcome of a counter reconciliation pass.
#[derive(Debug, Clone, Serialize)]
pub struct ReconcileReport {
    /// Session that was checked.
    pub session_id: String,
    /// Counters as stored on the session row.
    pub stored: (u64, u64, u64),
    /// Counts recomputed from message rows.
    pub actual: RoleCounts,
    /// Whether stored and recomputed counts agree.
    pub consistent: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_round_trip() {
        assert_eq!(SenderRole::parse("user").unwrap(), SenderRole::User);
        assert_eq!(SenderRole::parse("agent").unwrap(), SenderRole::Agent);
        assert!(SenderRole::parse("system").is_err());
    }

    #[test]
    fn test_record_append_counters() {
        let mut session = SessionRecord::new("alice", None);
        assert!(session.counters_consistent());

        session.record_append(SenderRole::User, timestamp_ms());
        session.record_append(SenderRole::Agent, timestamp_ms());
        assert_eq!(session.total_count, 2);
        assert_eq!(session.user_count, 1);
        assert_eq!(session.agent_count, 1);
        assert!(session.counters_consistent());
        assert!(session.last_activity >= session.created_at);
    }

    #[test]
    fn test_tool_message_fields() {
        let new = NewMessage::tool_call("weather", serde_json::json!({"city": "Tokyo"}), None);
        let msg = MessageRecord::from_new("s1", 1, new);
        assert!(msg.is_tool_query);
        assert_eq!(msg.tool_name.as_deref(), Some("weather"));
        assert_eq!(msg.role, SenderRole::Agent);
        assert_eq!(msg.order, 1);
    }

    #[test]
    fn test_default_title() {
        let session = SessionRecord::new("bob", None);
        assert!(session.title.starts_with("Session "));
        let titled = SessionRecord::new("bob", Some("greeting".into()));
        assert_eq!(titled.title, "greeting");
    }
}
