//! Persistent entity shapes: sessions, follow-ups, sub-agent links,
//! tool-call records, and usage counters.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use hb_domain::Message;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Session
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Active,
    Paused,
    Completed,
    Failed,
    Stale,
}

impl SessionStatus {
    /// Terminal states never transition back to active except via an
    /// explicit resume.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Stale)
    }
}

/// A unit of agent execution: one long-lived conversation.
///
/// `messages` is populated by `get_session` and `find_active_sessions`
/// resume paths; listings carry metadata only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub agent_id: String,
    pub org_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub status: SessionStatus,
    pub turn_count: u32,
    pub token_count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_stop_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_heartbeat_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
}

/// Field-wise session update; `None` leaves the field untouched.
#[derive(Debug, Clone, Default)]
pub struct SessionPatch {
    pub status: Option<SessionStatus>,
    pub token_count: Option<u64>,
    pub turn_count: Option<u32>,
    pub last_stop_reason: Option<String>,
}

/// Counters carried along with a heartbeat touch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TouchCounters {
    pub token_count: Option<u64>,
    pub turn_count: Option<u32>,
}

/// Listing filter.
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionFilter {
    pub status: Option<SessionStatus>,
    pub limit: Option<usize>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Follow-up
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FollowUpStatus {
    Pending,
    Fired,
    Cancelled,
}

/// A message scheduled for future delivery into a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FollowUp {
    pub id: String,
    pub agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub message: String,
    pub execute_at: DateTime<Utc>,
    pub status: FollowUpStatus,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Sub-agent link
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubAgentStatus {
    Active,
    Completed,
    Cancelled,
}

/// Parent→child session relationship.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubAgentLink {
    pub id: String,
    pub parent_session_id: String,
    pub child_session_id: String,
    pub task: String,
    pub status: SubAgentStatus,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool-call record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Audit record of one executed tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallRecord {
    pub id: String,
    pub tool_name: String,
    pub input: serde_json::Value,
    /// Truncated on a char boundary for display.
    pub output_preview: String,
    pub success: bool,
    pub duration_ms: u64,
    pub agent_id: String,
    pub session_id: String,
    pub turn: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Usage counter
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Per-(org, UTC day) token and cost aggregate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UsageCounter {
    pub org_id: String,
    pub day: NaiveDate,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_statuses() {
        assert!(SessionStatus::Completed.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(SessionStatus::Stale.is_terminal());
        assert!(!SessionStatus::Active.is_terminal());
        assert!(!SessionStatus::Paused.is_terminal());
    }

    #[test]
    fn session_listing_omits_empty_messages() {
        let s = Session {
            id: "s1".into(),
            agent_id: "a".into(),
            org_id: "o".into(),
            parent_id: None,
            status: SessionStatus::Active,
            turn_count: 0,
            token_count: 0,
            last_stop_reason: None,
            created_at: Utc::now(),
            last_heartbeat_at: Utc::now(),
            messages: Vec::new(),
        };
        let json = serde_json::to_value(&s).unwrap();
        assert!(json.get("messages").is_none());
    }
}
