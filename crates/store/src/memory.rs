//! In-memory [`Store`] for tests and ephemeral embedders.
//!
//! Semantics mirror [`crate::JsonStore`] exactly; only durability differs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;

use hb_domain::{Clock, Error, Message, Result, SystemClock};

use crate::entities::*;
use crate::Store;

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    messages: HashMap<String, Vec<Message>>,
    follow_ups: HashMap<String, FollowUp>,
    tool_calls: Vec<ToolCallRecord>,
    usage: HashMap<(String, NaiveDate), UsageCounter>,
    links: HashMap<String, SubAgentLink>,
    email_bindings: HashMap<String, String>,
}

pub struct MemStore {
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
}

impl MemStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(State::default()),
            clock,
        }
    }
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for MemStore {
    async fn create_session(
        &self,
        agent_id: &str,
        org_id: &str,
        parent_id: Option<&str>,
    ) -> Result<Session> {
        let now = self.clock.now();
        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            org_id: org_id.to_owned(),
            parent_id: parent_id.map(str::to_owned),
            status: SessionStatus::Active,
            turn_count: 0,
            token_count: 0,
            last_stop_reason: None,
            created_at: now,
            last_heartbeat_at: now,
            messages: Vec::new(),
        };
        let mut state = self.state.write();
        state.messages.insert(session.id.clone(), Vec::new());
        state.sessions.insert(session.id.clone(), session.clone());
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Session> {
        let state = self.state.read();
        let mut session = state
            .sessions
            .get(id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
        session.messages = state.messages.get(id).cloned().unwrap_or_default();
        Ok(session)
    }

    async fn list_sessions(&self, agent_id: &str, filter: SessionFilter) -> Result<Vec<Session>> {
        let state = self.state.read();
        let mut sessions: Vec<Session> = state
            .sessions
            .values()
            .filter(|s| s.agent_id == agent_id)
            .filter(|s| filter.status.map_or(true, |st| s.status == st))
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            sessions.truncate(limit);
        }
        Ok(sessions)
    }

    async fn update_session(&self, id: &str, patch: SessionPatch) -> Result<()> {
        let mut state = self.state.write();
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
        apply_patch(session, patch);
        Ok(())
    }

    async fn replace_messages(&self, id: &str, messages: &[Message]) -> Result<()> {
        let mut state = self.state.write();
        if !state.sessions.contains_key(id) {
            return Err(Error::NotFound(format!("session {id}")));
        }
        state.messages.insert(id.to_owned(), messages.to_vec());
        Ok(())
    }

    async fn append_message(&self, id: &str, message: Message) -> Result<()> {
        let mut state = self.state.write();
        if !state.sessions.contains_key(id) {
            return Err(Error::NotFound(format!("session {id}")));
        }
        state.messages.entry(id.to_owned()).or_default().push(message);
        Ok(())
    }

    async fn touch_session(&self, id: &str, counters: TouchCounters) -> Result<()> {
        let now = self.clock.now();
        let mut state = self.state.write();
        let session = state
            .sessions
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("session {id}")))?;
        session.last_heartbeat_at = now;
        if let Some(tokens) = counters.token_count {
            session.token_count = tokens;
        }
        if let Some(turns) = counters.turn_count {
            session.turn_count = turns;
        }
        Ok(())
    }

    async fn find_active_sessions(&self) -> Result<Vec<Session>> {
        let state = self.state.read();
        Ok(state
            .sessions
            .values()
            .filter(|s| s.status == SessionStatus::Active)
            .cloned()
            .collect())
    }

    async fn mark_stale_sessions(&self, timeout_ms: u64) -> Result<Vec<String>> {
        let cutoff = self.clock.now() - Duration::milliseconds(timeout_ms as i64);
        let mut state = self.state.write();
        let mut changed = Vec::new();
        for session in state.sessions.values_mut() {
            if session.status == SessionStatus::Active && session.last_heartbeat_at < cutoff {
                session.status = SessionStatus::Stale;
                changed.push(session.id.clone());
            }
        }
        Ok(changed)
    }

    async fn create_follow_up(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        message: &str,
        execute_at: DateTime<Utc>,
    ) -> Result<FollowUp> {
        let follow_up = FollowUp {
            id: uuid::Uuid::new_v4().to_string(),
            agent_id: agent_id.to_owned(),
            session_id: session_id.map(str::to_owned),
            message: message.to_owned(),
            execute_at,
            status: FollowUpStatus::Pending,
            created_at: self.clock.now(),
        };
        self.state
            .write()
            .follow_ups
            .insert(follow_up.id.clone(), follow_up.clone());
        Ok(follow_up)
    }

    async fn due_follow_ups(&self) -> Result<Vec<FollowUp>> {
        let now = self.clock.now();
        let state = self.state.read();
        let mut due: Vec<FollowUp> = state
            .follow_ups
            .values()
            .filter(|f| f.status == FollowUpStatus::Pending && f.execute_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|f| f.execute_at);
        Ok(due)
    }

    async fn next_follow_up_at(&self) -> Result<Option<DateTime<Utc>>> {
        let state = self.state.read();
        Ok(state
            .follow_ups
            .values()
            .filter(|f| f.status == FollowUpStatus::Pending)
            .map(|f| f.execute_at)
            .min())
    }

    async fn mark_follow_up_fired(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write();
        match state.follow_ups.get_mut(id) {
            Some(f) if f.status == FollowUpStatus::Pending => {
                f.status = FollowUpStatus::Fired;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(Error::NotFound(format!("follow-up {id}"))),
        }
    }

    async fn cancel_follow_up(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write();
        match state.follow_ups.get_mut(id) {
            Some(f) if f.status == FollowUpStatus::Pending => {
                f.status = FollowUpStatus::Cancelled;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_tool_call(&self, record: ToolCallRecord) -> Result<()> {
        self.state.write().tool_calls.push(record);
        Ok(())
    }

    async fn list_tool_calls(&self, session_id: &str) -> Result<Vec<ToolCallRecord>> {
        let state = self.state.read();
        Ok(state
            .tool_calls
            .iter()
            .filter(|r| r.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn add_usage(
        &self,
        org_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Result<()> {
        let day = self.clock.now().date_naive();
        let mut state = self.state.write();
        let counter = state
            .usage
            .entry((org_id.to_owned(), day))
            .or_insert_with(|| UsageCounter {
                org_id: org_id.to_owned(),
                day,
                input_tokens: 0,
                output_tokens: 0,
                cost_usd: 0.0,
            });
        counter.input_tokens += input_tokens;
        counter.output_tokens += output_tokens;
        counter.cost_usd += cost_usd;
        Ok(())
    }

    async fn get_usage(&self, org_id: &str, day: NaiveDate) -> Result<Option<UsageCounter>> {
        let state = self.state.read();
        Ok(state.usage.get(&(org_id.to_owned(), day)).cloned())
    }

    async fn create_sub_agent_link(&self, link: SubAgentLink) -> Result<()> {
        self.state.write().links.insert(link.id.clone(), link);
        Ok(())
    }

    async fn list_child_links(&self, parent_session_id: &str) -> Result<Vec<SubAgentLink>> {
        let state = self.state.read();
        Ok(state
            .links
            .values()
            .filter(|l| l.parent_session_id == parent_session_id)
            .cloned()
            .collect())
    }

    async fn update_link_status(&self, id: &str, status: SubAgentStatus) -> Result<()> {
        let mut state = self.state.write();
        let link = state
            .links
            .get_mut(id)
            .ok_or_else(|| Error::NotFound(format!("sub-agent link {id}")))?;
        link.status = status;
        Ok(())
    }

    async fn bind_email(&self, address: &str, agent_id: &str) -> Result<()> {
        self.state
            .write()
            .email_bindings
            .insert(address.to_lowercase(), agent_id.to_owned());
        Ok(())
    }

    async fn agent_for_email(&self, address: &str) -> Result<Option<String>> {
        let state = self.state.read();
        Ok(state.email_bindings.get(&address.to_lowercase()).cloned())
    }
}

pub(crate) fn apply_patch(session: &mut Session, patch: SessionPatch) {
    if let Some(status) = patch.status {
        session.status = status;
    }
    if let Some(tokens) = patch.token_count {
        session.token_count = tokens;
    }
    if let Some(turns) = patch.turn_count {
        session.turn_count = turns;
    }
    if let Some(reason) = patch.last_stop_reason {
        session.last_stop_reason = Some(reason);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use hb_domain::ManualClock;

    fn manual_clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap(),
        ))
    }

    #[tokio::test]
    async fn create_and_get_roundtrip() {
        let store = MemStore::new();
        let s = store.create_session("helper", "acme", None).await.unwrap();
        assert_eq!(s.status, SessionStatus::Active);
        assert_eq!(s.turn_count, 0);

        store
            .append_message(&s.id, Message::user("hello"))
            .await
            .unwrap();
        let loaded = store.get_session(&s.id).await.unwrap();
        assert_eq!(loaded.messages.len(), 1);
    }

    #[tokio::test]
    async fn get_missing_session_is_not_found() {
        let store = MemStore::new();
        let err = store.get_session("nope").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn replace_messages_swaps_whole_list() {
        let store = MemStore::new();
        let s = store.create_session("helper", "acme", None).await.unwrap();
        store
            .append_message(&s.id, Message::user("one"))
            .await
            .unwrap();
        store
            .replace_messages(&s.id, &[Message::system("sys"), Message::user("two")])
            .await
            .unwrap();
        let loaded = store.get_session(&s.id).await.unwrap();
        assert_eq!(loaded.messages.len(), 2);
    }

    #[tokio::test]
    async fn stale_marking_respects_heartbeat_age() {
        let clock = manual_clock();
        let store = MemStore::with_clock(clock.clone());
        let s = store.create_session("helper", "acme", None).await.unwrap();

        // Fresh heartbeat: not stale.
        assert!(store.mark_stale_sessions(300_000).await.unwrap().is_empty());

        clock.advance(Duration::minutes(10));
        let changed = store.mark_stale_sessions(300_000).await.unwrap();
        assert_eq!(changed, vec![s.id.clone()]);
        let loaded = store.get_session(&s.id).await.unwrap();
        assert_eq!(loaded.status, SessionStatus::Stale);

        // Already stale — not returned twice.
        assert!(store.mark_stale_sessions(300_000).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn touch_refreshes_heartbeat() {
        let clock = manual_clock();
        let store = MemStore::with_clock(clock.clone());
        let s = store.create_session("helper", "acme", None).await.unwrap();
        clock.advance(Duration::minutes(4));
        store
            .touch_session(&s.id, TouchCounters { token_count: Some(42), turn_count: Some(2) })
            .await
            .unwrap();
        // Heartbeat is now 4 minutes fresher than creation.
        clock.advance(Duration::minutes(2));
        assert!(store.mark_stale_sessions(300_000).await.unwrap().is_empty());
        let loaded = store.get_session(&s.id).await.unwrap();
        assert_eq!(loaded.token_count, 42);
        assert_eq!(loaded.turn_count, 2);
    }

    #[tokio::test]
    async fn follow_up_fires_at_most_once() {
        let clock = manual_clock();
        let store = MemStore::with_clock(clock.clone());
        let at = clock.now() + Duration::minutes(1);
        let f = store
            .create_follow_up("helper", None, "ping", at)
            .await
            .unwrap();

        assert!(store.due_follow_ups().await.unwrap().is_empty());
        clock.advance(Duration::minutes(2));
        assert_eq!(store.due_follow_ups().await.unwrap().len(), 1);

        assert!(store.mark_follow_up_fired(&f.id).await.unwrap());
        assert!(!store.mark_follow_up_fired(&f.id).await.unwrap());
        assert!(store.due_follow_ups().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancel_follow_up_only_when_pending() {
        let store = MemStore::new();
        let f = store
            .create_follow_up("helper", None, "ping", Utc::now())
            .await
            .unwrap();
        assert!(store.cancel_follow_up(&f.id).await.unwrap());
        assert!(!store.cancel_follow_up(&f.id).await.unwrap());
        assert!(!store.cancel_follow_up("missing").await.unwrap());
    }

    #[tokio::test]
    async fn usage_accumulates_per_day() {
        let clock = manual_clock();
        let store = MemStore::with_clock(clock.clone());
        store.add_usage("acme", 100, 50, 0.01).await.unwrap();
        store.add_usage("acme", 10, 5, 0.001).await.unwrap();
        let day = clock.now().date_naive();
        let counter = store.get_usage("acme", day).await.unwrap().unwrap();
        assert_eq!(counter.input_tokens, 110);
        assert_eq!(counter.output_tokens, 55);

        // Day rollover starts a fresh counter.
        clock.advance(Duration::days(1));
        store.add_usage("acme", 1, 1, 0.0).await.unwrap();
        let next = store
            .get_usage("acme", clock.now().date_naive())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(next.input_tokens, 1);
    }

    #[tokio::test]
    async fn email_binding_is_case_insensitive() {
        let store = MemStore::new();
        store.bind_email("Boss@Example.com", "helper").await.unwrap();
        assert_eq!(
            store.agent_for_email("boss@example.com").await.unwrap(),
            Some("helper".into())
        );
        assert_eq!(store.agent_for_email("other@example.com").await.unwrap(), None);
    }
}
