//! Durable persistence facade for the Harbor runtime.
//!
//! The [`Store`] trait is the only persistence surface the runtime consumes.
//! Each operation is individually atomic; between operations the runtime
//! assumes at-least-once semantics (a checkpoint that fails is retried by
//! resume, never rolled back).

pub mod entities;
pub mod json;
pub mod memory;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use hb_domain::{Message, Result};

pub use entities::{
    FollowUp, FollowUpStatus, Session, SessionFilter, SessionPatch, SessionStatus, SubAgentLink,
    SubAgentStatus, ToolCallRecord, TouchCounters, UsageCounter,
};
pub use json::JsonStore;
pub use memory::MemStore;

/// Durable, crash-safe persistence of sessions, messages, follow-ups,
/// sub-agent links, tool-call records, usage counters, and email bindings.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Sessions ─────────────────────────────────────────────────────

    /// Create a session with status=active, turn=0, heartbeat=now.
    async fn create_session(
        &self,
        agent_id: &str,
        org_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Session>;

    /// Fetch a session including its full message list.
    async fn get_session(&self, id: &str) -> Result<Session>;

    /// List sessions for an agent — metadata only, no messages.
    async fn list_sessions(&self, agent_id: &str, filter: SessionFilter) -> Result<Vec<Session>>;

    /// Apply a field-wise update. Status transition validity is the
    /// caller's responsibility.
    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()>;

    /// Atomically replace the whole message list (the checkpoint write).
    async fn replace_messages(&self, id: &str, messages: &[Message]) -> Result<()>;

    /// Append a single message.
    async fn append_message(&self, id: &str, message: Message) -> Result<()>;

    /// Update heartbeat to now, optionally carrying fresh counters.
    async fn touch_session(&self, id: &str, counters: TouchCounters) -> Result<()>;

    /// Sessions with status=active — metadata only (resume fetches each).
    async fn find_active_sessions(&self) -> Result<Vec<Session>>;

    /// Mark active sessions whose heartbeat is older than `timeout_ms` as
    /// stale; returns the ids that changed.
    async fn mark_stale_sessions(&self, timeout_ms: u64) -> Result<Vec<String>>;

    // ── Follow-ups ───────────────────────────────────────────────────

    async fn create_follow_up(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        message: &str,
        execute_at: DateTime<Utc>,
    ) -> Result<FollowUp>;

    /// Pending follow-ups whose execute_at has passed, oldest first.
    async fn due_follow_ups(&self) -> Result<Vec<FollowUp>>;

    /// Earliest pending execute_at, for the scheduler's timer.
    async fn next_follow_up_at(&self) -> Result<Option<DateTime<Utc>>>;

    /// Pending→Fired transition. Returns `false` if the follow-up was not
    /// pending — the at-most-once guarantee hinges on this.
    async fn mark_follow_up_fired(&self, id: &str) -> Result<bool>;

    /// Pending→Cancelled. Returns `false` if not pending.
    async fn cancel_follow_up(&self, id: &str) -> Result<bool>;

    // ── Tool-call records ────────────────────────────────────────────

    async fn record_tool_call(&self, record: ToolCallRecord) -> Result<()>;

    async fn list_tool_calls(&self, session_id: &str) -> Result<Vec<ToolCallRecord>>;

    // ── Usage counters ───────────────────────────────────────────────

    /// Accumulate usage onto the (org, today) counter.
    async fn add_usage(
        &self,
        org_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Result<()>;

    async fn get_usage(&self, org_id: &str, day: NaiveDate) -> Result<Option<UsageCounter>>;

    // ── Sub-agent links ──────────────────────────────────────────────

    async fn create_sub_agent_link(&self, link: SubAgentLink) -> Result<()>;

    async fn list_child_links(&self, parent_session_id: &str) -> Result<Vec<SubAgentLink>>;

    async fn update_link_status(&self, id: &str, status: SubAgentStatus) -> Result<()>;

    // ── Email bindings ───────────────────────────────────────────────

    async fn bind_email(&self, address: &str, agent_id: &str) -> Result<()>;

    async fn agent_for_email(&self, address: &str) -> Result<Option<String>>;
}
