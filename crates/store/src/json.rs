//! JSON-file backed [`Store`].
//!
//! Layout under the state directory:
//!
//! ```text
//! state/
//!   sessions.json         session metadata map
//!   follow_ups.json
//!   usage.json            keyed "org|YYYY-MM-DD"
//!   links.json
//!   email_bindings.json
//!   tool_calls.jsonl      append-only audit log
//!   messages/<sid>.json   whole-list replaced at each checkpoint
//! ```
//!
//! Every whole-file write goes through a temp file followed by a rename, so
//! each operation is atomic on its own: a crash leaves either the old or the
//! new content, never a torn file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};

use hb_domain::{Clock, Error, Message, Result, SystemClock};

use crate::entities::*;
use crate::memory::apply_patch;
use crate::Store;

#[derive(Default)]
struct State {
    sessions: HashMap<String, Session>,
    follow_ups: HashMap<String, FollowUp>,
    usage: HashMap<String, UsageCounter>,
    links: HashMap<String, SubAgentLink>,
    email_bindings: HashMap<String, String>,
}

pub struct JsonStore {
    dir: PathBuf,
    state: RwLock<State>,
    clock: Arc<dyn Clock>,
}

impl JsonStore {
    /// Open (or initialise) a store rooted at `dir`.
    pub fn open(dir: &Path) -> Result<Self> {
        Self::open_with_clock(dir, Arc::new(SystemClock))
    }

    pub fn open_with_clock(dir: &Path, clock: Arc<dyn Clock>) -> Result<Self> {
        std::fs::create_dir_all(dir.join("messages"))?;

        let state = State {
            sessions: load_map(&dir.join("sessions.json"))?,
            follow_ups: load_map(&dir.join("follow_ups.json"))?,
            usage: load_map(&dir.join("usage.json"))?,
            links: load_map(&dir.join("links.json"))?,
            email_bindings: load_map(&dir.join("email_bindings.json"))?,
        };

        tracing::info!(
            sessions = state.sessions.len(),
            path = %dir.display(),
            "session store loaded"
        );

        Ok(Self {
            dir: dir.to_path_buf(),
            state: RwLock::new(state),
            clock,
        })
    }

    fn messages_path(&self, session_id: &str) -> PathBuf {
        self.dir.join("messages").join(format!("{session_id}.json"))
    }

    fn flush_sessions(&self, state: &State) -> Result<()> {
        write_atomic(&self.dir.join("sessions.json"), &state.sessions)
    }

    fn flush_follow_ups(&self, state: &State) -> Result<()> {
        write_atomic(&self.dir.join("follow_ups.json"), &state.follow_ups)
    }

    fn read_messages(&self, session_id: &str) -> Result<Vec<Message>> {
        let path = self.messages_path(session_id);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        let messages: Vec<Message> = serde_json::from_str(&raw)?;
        Ok(messages.into_iter().map(Message::sanitize).collect())
    }
}

/// Serialize `value` and atomically replace `path` with it.
fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value)?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, json)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn load_map<T: DeserializeOwned>(path: &Path) -> Result<HashMap<String, T>> {
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let raw = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&raw).unwrap_or_default())
}

fn usage_key(org_id: &str, day: NaiveDate) -> String {
    format!("{org_id}|{day}")
}

#[async_trait]
impl Store for JsonStore {
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
        state.sessions.insert(session.id.clone(), session.clone());
        self.flush_sessions(&state)?;
        write_atomic(&self.messages_path(&session.id), &Vec::<Message>::new())?;
        Ok(session)
    }

    async fn get_session(&self, id: &str) -> Result<Session> {
        let mut session = {
            let state = self.state.read();
            state
                .sessions
                .get(id)
                .cloned()
                .ok_or_else(|| Error::NotFound(format!("session {id}")))?
        };
        session.messages = self.read_messages(id)?;
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
        self.flush_sessions(&state)
    }

    async fn replace_messages(&self, id: &str, messages: &[Message]) -> Result<()> {
        {
            let state = self.state.read();
            if !state.sessions.contains_key(id) {
                return Err(Error::NotFound(format!("session {id}")));
            }
        }
        write_atomic(&self.messages_path(id), &messages)
    }

    async fn append_message(&self, id: &str, message: Message) -> Result<()> {
        {
            let state = self.state.read();
            if !state.sessions.contains_key(id) {
                return Err(Error::NotFound(format!("session {id}")));
            }
        }
        let mut messages = self.read_messages(id)?;
        messages.push(message);
        write_atomic(&self.messages_path(id), &messages)
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
        self.flush_sessions(&state)
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
        if !changed.is_empty() {
            self.flush_sessions(&state)?;
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
        let mut state = self.state.write();
        state
            .follow_ups
            .insert(follow_up.id.clone(), follow_up.clone());
        self.flush_follow_ups(&state)?;
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
        let fired = match state.follow_ups.get_mut(id) {
            Some(f) if f.status == FollowUpStatus::Pending => {
                f.status = FollowUpStatus::Fired;
                true
            }
            Some(_) => false,
            None => return Err(Error::NotFound(format!("follow-up {id}"))),
        };
        if fired {
            self.flush_follow_ups(&state)?;
        }
        Ok(fired)
    }

    async fn cancel_follow_up(&self, id: &str) -> Result<bool> {
        let mut state = self.state.write();
        let cancelled = match state.follow_ups.get_mut(id) {
            Some(f) if f.status == FollowUpStatus::Pending => {
                f.status = FollowUpStatus::Cancelled;
                true
            }
            _ => false,
        };
        if cancelled {
            self.flush_follow_ups(&state)?;
        }
        Ok(cancelled)
    }

    async fn record_tool_call(&self, record: ToolCallRecord) -> Result<()> {
        use std::io::Write;
        let line = serde_json::to_string(&record)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.dir.join("tool_calls.jsonl"))?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }

    async fn list_tool_calls(&self, session_id: &str) -> Result<Vec<ToolCallRecord>> {
        let path = self.dir.join("tool_calls.jsonl");
        if !path.exists() {
            return Ok(Vec::new());
        }
        let raw = std::fs::read_to_string(&path)?;
        let mut records = Vec::new();
        for line in raw.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<ToolCallRecord>(line) {
                Ok(r) if r.session_id == session_id => records.push(r),
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "skipping malformed tool-call record");
                }
            }
        }
        Ok(records)
    }

    async fn add_usage(
        &self,
        org_id: &str,
        input_tokens: u64,
        output_tokens: u64,
        cost_usd: f64,
    ) -> Result<()> {
        let day = self.clock.now().date_naive();
        let key = usage_key(org_id, day);
        let mut state = self.state.write();
        let counter = state.usage.entry(key).or_insert_with(|| UsageCounter {
            org_id: org_id.to_owned(),
            day,
            input_tokens: 0,
            output_tokens: 0,
            cost_usd: 0.0,
        });
        counter.input_tokens += input_tokens;
        counter.output_tokens += output_tokens;
        counter.cost_usd += cost_usd;
        write_atomic(&self.dir.join("usage.json"), &state.usage)
    }

    async fn get_usage(&self, org_id: &str, day: NaiveDate) -> Result<Option<UsageCounter>> {
        let state = self.state.read();
        Ok(state.usage.get(&usage_key(org_id, day)).cloned())
    }

    async fn create_sub_agent_link(&self, link: SubAgentLink) -> Result<()> {
        let mut state = self.state.write();
        state.links.insert(link.id.clone(), link);
        write_atomic(&self.dir.join("links.json"), &state.links)
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
        write_atomic(&self.dir.join("links.json"), &state.links)
    }

    async fn bind_email(&self, address: &str, agent_id: &str) -> Result<()> {
        let mut state = self.state.write();
        state
            .email_bindings
            .insert(address.to_lowercase(), agent_id.to_owned());
        write_atomic(&self.dir.join("email_bindings.json"), &state.email_bindings)
    }

    async fn agent_for_email(&self, address: &str) -> Result<Option<String>> {
        let state = self.state.read();
        Ok(state.email_bindings.get(&address.to_lowercase()).cloned())
    }
}
