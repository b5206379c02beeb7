//! The process-wide supervisor.
//!
//! Owns every cross-session resource: the store, the model client, the hook
//! chain, the event bus, the cancel map, the follow-up scheduler, and the
//! heartbeat/stale/keepalive ticks. Sessions run as independent tokio
//! tasks; the supervisor only ever touches them through the cancel map and
//! the store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use hb_domain::config::{AgentConfig, ModelRef, RuntimeConfig};
use hb_domain::{Clock, Error, Message, Result, SystemClock};
use hb_model::{ModelClient, ModelPricing, PricingTable, RetryPolicy};
use hb_store::{
    Session, SessionFilter, SessionPatch, SessionStatus, Store, SubAgentLink, SubAgentStatus,
    TouchCounters,
};
use hb_tools::{Tool, ToolRegistry};

use crate::audit::StoreAuditHook;
use crate::cancel::CancelMap;
use crate::email::{render_email, DedupeStore, EmailDelivery, InboundEmail};
use crate::events::{EventBus, SessionEvent};
use crate::followups;
use crate::hooks::{Hook, HookChain};
use crate::keys::resolve_api_key;
use crate::turn::AgentLoop;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Admin snapshot
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Custom-provider entry from the admin store.
#[derive(Debug, Clone)]
pub struct CustomProviderSpec {
    pub provider: String,
    pub api_key: Option<String>,
    /// (model_id, pricing) pairs.
    pub pricing: Vec<(String, ModelPricing)>,
}

/// Optional admin-side configuration source, consulted exactly once at
/// [`Runtime::start`]. The result is an immutable snapshot: later admin
/// mutations do not affect live sessions until restart.
#[async_trait]
pub trait AdminStore: Send + Sync {
    async fn custom_providers(&self) -> Result<Vec<CustomProviderSpec>>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Public request/response types
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Input to [`Runtime::spawn_session`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    pub agent: AgentConfig,
    pub initial_message: Option<String>,
    /// Set by the sub-agent path; embedders leave it `None`.
    pub parent_session_id: Option<String>,
}

impl SpawnOptions {
    pub fn new(agent: AgentConfig) -> Self {
        Self {
            agent,
            initial_message: None,
            parent_session_id: None,
        }
    }

    pub fn with_message(mut self, text: impl Into<String>) -> Self {
        self.initial_message = Some(text.into());
        self
    }
}

/// Input to [`Runtime::spawn_sub_agent`].
#[derive(Debug, Clone)]
pub struct SubAgentRequest {
    pub parent_session_id: String,
    pub task: String,
    /// Defaults to the parent's agent.
    pub agent_id: Option<String>,
    /// Defaults to the agent's (or runtime's) model.
    pub model: Option<ModelRef>,
}

#[derive(Debug, Clone)]
pub struct SubAgentResult {
    pub link_id: String,
    pub child_session_id: String,
    pub status: SubAgentStatus,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Runtime
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub(crate) struct RuntimeInner {
    pub(crate) config: RuntimeConfig,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) model: Arc<dyn ModelClient>,
    pub(crate) hooks: Arc<HookChain>,
    pub(crate) events: Arc<EventBus>,
    pub(crate) cancel_map: CancelMap,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) agents: RwLock<HashMap<String, AgentConfig>>,
    pub(crate) tools: RwLock<HashMap<String, Arc<dyn Tool>>>,
    pub(crate) pricing: RwLock<Arc<PricingTable>>,
    pub(crate) custom_keys: RwLock<HashMap<String, String>>,
    pub(crate) followup_notify: Notify,
    pub(crate) dedupe: DedupeStore,
    admin: Option<Arc<dyn AdminStore>>,
    active: Mutex<HashMap<String, JoinHandle<()>>>,
    tick_tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// The agent runtime. Cheap to clone; all clones share one supervisor.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

pub struct RuntimeBuilder {
    config: RuntimeConfig,
    store: Arc<dyn Store>,
    model: Arc<dyn ModelClient>,
    hooks: Vec<Arc<dyn Hook>>,
    clock: Arc<dyn Clock>,
    admin: Option<Arc<dyn AdminStore>>,
}

impl RuntimeBuilder {
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    pub fn hook(mut self, hook: Arc<dyn Hook>) -> Self {
        self.hooks.push(hook);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn admin_store(mut self, admin: Arc<dyn AdminStore>) -> Self {
        self.admin = Some(admin);
        self
    }

    pub fn build(self) -> Runtime {
        let mut chain = HookChain::new();
        // The audit hook runs first so records exist before any
        // embedder-supplied observer sees the outcome.
        chain.push(Arc::new(StoreAuditHook::new(self.store.clone())));
        for hook in self.hooks {
            chain.push(hook);
        }

        Runtime {
            inner: Arc::new(RuntimeInner {
                config: self.config,
                store: self.store,
                model: self.model,
                hooks: Arc::new(chain),
                events: Arc::new(EventBus::new()),
                cancel_map: CancelMap::new(),
                clock: self.clock,
                agents: RwLock::new(HashMap::new()),
                tools: RwLock::new(HashMap::new()),
                pricing: RwLock::new(Arc::new(PricingTable::new())),
                custom_keys: RwLock::new(HashMap::new()),
                followup_notify: Notify::new(),
                dedupe: DedupeStore::default(),
                admin: self.admin,
                active: Mutex::new(HashMap::new()),
                tick_tasks: Mutex::new(Vec::new()),
            }),
        }
    }
}

impl Runtime {
    pub fn builder(store: Arc<dyn Store>, model: Arc<dyn ModelClient>) -> RuntimeBuilder {
        RuntimeBuilder {
            config: RuntimeConfig::default(),
            store,
            model,
            hooks: Vec::new(),
            clock: Arc::new(SystemClock),
            admin: None,
        }
    }

    // ── Registration ─────────────────────────────────────────────────

    /// Make an agent configuration known to the runtime. Required for
    /// resume-on-startup and follow-up delivery into fresh sessions.
    pub fn register_agent(&self, agent: AgentConfig) {
        self.inner
            .agents
            .write()
            .insert(agent.agent_id.clone(), agent);
    }

    /// Add a tool to the process-wide catalog. Sessions select from it via
    /// `AgentConfig::tools` (an empty list selects everything).
    pub fn register_tool(&self, tool: Arc<dyn Tool>) {
        self.inner.tools.write().insert(tool.name().to_owned(), tool);
    }

    // ── Lifecycle ────────────────────────────────────────────────────

    /// Load the admin snapshot, resume active sessions, start timers.
    pub async fn start(&self) -> Result<()> {
        self.load_admin_snapshot().await;

        if self.inner.config.resume_on_startup {
            self.resume_active_sessions().await;
        }

        self.spawn_ticks();
        tracing::info!(
            active = self.get_active_session_count(),
            "runtime started"
        );
        Ok(())
    }

    /// Cancel every session, stop timers, and wait for loops to unwind.
    pub async fn stop(&self) {
        self.inner.cancel_map.cancel_all();
        for task in self.inner.tick_tasks.lock().drain(..) {
            task.abort();
        }
        let handles: Vec<JoinHandle<()>> = {
            let mut active = self.inner.active.lock();
            active.drain().map(|(_, h)| h).collect()
        };
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!("runtime stopped");
    }

    async fn load_admin_snapshot(&self) {
        let Some(admin) = &self.inner.admin else {
            return;
        };
        match admin.custom_providers().await {
            Ok(specs) => {
                let mut pricing = PricingTable::new();
                let mut keys = HashMap::new();
                for spec in specs {
                    if let Some(key) = spec.api_key {
                        keys.insert(spec.provider.clone(), key);
                    }
                    for (model_id, price) in spec.pricing {
                        pricing.insert(&spec.provider, &model_id, price);
                    }
                }
                *self.inner.pricing.write() = Arc::new(pricing);
                *self.inner.custom_keys.write() = keys;
            }
            Err(e) => {
                tracing::warn!(error = %e, "admin snapshot load failed; using built-in pricing");
            }
        }
    }

    // ── Session API ──────────────────────────────────────────────────

    pub async fn spawn_session(&self, opts: SpawnOptions) -> Result<Session> {
        let agent = opts.agent;
        self.register_agent(agent.clone());

        let model_ref = agent
            .model
            .clone()
            .unwrap_or_else(|| self.inner.config.default_model.clone());
        // Fail fast before anything is persisted.
        let api_key = resolve_api_key(
            &model_ref.provider,
            &self.inner.config.api_keys,
            &self.inner.custom_keys.read(),
        )?;

        let session = self
            .inner
            .store
            .create_session(
                &agent.agent_id,
                &agent.org_id,
                opts.parent_session_id.as_deref(),
            )
            .await?;

        let mut messages = Vec::new();
        if let Some(prompt) = &agent.system_prompt {
            messages.push(Message::system(prompt.clone()));
        }
        if let Some(text) = &opts.initial_message {
            messages.push(Message::user(text.clone()));
        }
        if !messages.is_empty() {
            self.inner.store.replace_messages(&session.id, &messages).await?;
        }

        self.inner.events.emit(
            &session.id,
            SessionEvent::SessionStart {
                session_id: session.id.clone(),
                agent_id: agent.agent_id.clone(),
            },
        );
        self.inner
            .hooks
            .on_session_start(&session.id, &agent.agent_id, &agent.org_id)
            .await;

        self.start_loop(&session, agent, model_ref, api_key, messages, 0);
        Ok(session)
    }

    /// Append a user message; if the loop has exited, start a new one with
    /// the augmented history.
    pub async fn send_message(&self, session_id: &str, text: &str) -> Result<()> {
        let session = self.inner.store.get_session(session_id).await?;
        if session.status.is_terminal() {
            return Err(Error::PreconditionFailed(format!(
                "session {session_id} is {}",
                status_label(session.status)
            )));
        }

        self.inner
            .store
            .append_message(session_id, Message::user(text))
            .await?;

        if self.inner.cancel_map.is_running(session_id) {
            // The active loop folds the message in at its next restart;
            // within a session work stays strictly sequential.
            return Ok(());
        }

        let agent = self.agent_config(&session.agent_id)?;
        let model_ref = agent
            .model
            .clone()
            .unwrap_or_else(|| self.inner.config.default_model.clone());
        let api_key = resolve_api_key(
            &model_ref.provider,
            &self.inner.config.api_keys,
            &self.inner.custom_keys.read(),
        )?;

        // A paused session explicitly resumes here.
        self.inner
            .store
            .update_session(
                session_id,
                SessionPatch {
                    status: Some(SessionStatus::Active),
                    ..Default::default()
                },
            )
            .await?;
        self.inner
            .store
            .touch_session(session_id, TouchCounters::default())
            .await?;

        let refreshed = self.inner.store.get_session(session_id).await?;
        let messages = refreshed.messages.clone();
        let start_turn = refreshed.turn_count;
        self.start_loop(&refreshed, agent, model_ref, api_key, messages, start_turn);
        Ok(())
    }

    /// Cancel the session's loop, mark it completed, and cancel active
    /// children transitively.
    pub async fn terminate_session(&self, session_id: &str) -> Result<()> {
        // Existence check up front so callers get not_found.
        self.inner.store.get_session(session_id).await?;

        let mut queue = vec![session_id.to_owned()];
        while let Some(sid) = queue.pop() {
            self.inner.cancel_map.cancel(&sid);

            match self.inner.store.get_session(&sid).await {
                Ok(session) if !session.status.is_terminal() => {
                    if let Err(e) = self
                        .inner
                        .store
                        .update_session(
                            &sid,
                            SessionPatch {
                                status: Some(SessionStatus::Completed),
                                last_stop_reason: Some("terminated".to_owned()),
                                ..Default::default()
                            },
                        )
                        .await
                    {
                        tracing::warn!(session_id = %sid, error = %e, "terminate status write failed");
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(session_id = %sid, error = %e, "terminate lookup failed");
                    continue;
                }
            }

            for link in self
                .inner
                .store
                .list_child_links(&sid)
                .await
                .unwrap_or_default()
            {
                if link.status == SubAgentStatus::Active {
                    let _ = self
                        .inner
                        .store
                        .update_link_status(&link.id, SubAgentStatus::Cancelled)
                        .await;
                    queue.push(link.child_session_id);
                }
            }
        }
        Ok(())
    }

    pub async fn get_session(&self, session_id: &str) -> Result<Session> {
        self.inner.store.get_session(session_id).await
    }

    pub async fn list_sessions(
        &self,
        agent_id: &str,
        filter: SessionFilter,
    ) -> Result<Vec<Session>> {
        self.inner.store.list_sessions(agent_id, filter).await
    }

    pub fn get_active_session_count(&self) -> usize {
        self.inner.cancel_map.running_sessions().len()
    }

    /// Subscribe to a session's event stream.
    pub fn subscribe(&self, session_id: &str) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        self.inner.events.subscribe(session_id)
    }

    // ── Sub-agents ───────────────────────────────────────────────────

    pub async fn spawn_sub_agent(&self, req: SubAgentRequest) -> Result<SubAgentResult> {
        let parent = self.inner.store.get_session(&req.parent_session_id).await?;
        if parent.status.is_terminal() {
            return Err(Error::PreconditionFailed(
                "sub_agent_cap: parent session is terminal".to_owned(),
            ));
        }

        let policy = &self.inner.config.sub_agents;

        // Depth of the child = ancestors of the parent + 2 (parent, child).
        let mut depth = 1u32;
        let mut cursor = parent.parent_id.clone();
        while let Some(pid) = cursor {
            depth += 1;
            if depth > policy.max_depth {
                break;
            }
            cursor = self
                .inner
                .store
                .get_session(&pid)
                .await
                .ok()
                .and_then(|s| s.parent_id);
        }
        if depth + 1 > policy.max_depth {
            return Err(Error::PreconditionFailed(format!(
                "sub_agent_cap: depth limit {} reached",
                policy.max_depth
            )));
        }

        let active_children = self
            .inner
            .store
            .list_child_links(&parent.id)
            .await?
            .into_iter()
            .filter(|l| l.status == SubAgentStatus::Active)
            .count();
        if active_children >= policy.max_active_children_per_session {
            return Err(Error::PreconditionFailed(format!(
                "sub_agent_cap: fan-out limit {} reached",
                policy.max_active_children_per_session
            )));
        }

        let mut agent = match &req.agent_id {
            Some(agent_id) => self.agent_config(agent_id)?,
            None => self.agent_config(&parent.agent_id)?,
        };
        if let Some(model) = &req.model {
            agent.model = Some(model.clone());
        }

        let child = self
            .spawn_session(SpawnOptions {
                agent,
                initial_message: Some(format!("[Sub-Agent Task] {}", req.task)),
                parent_session_id: Some(parent.id.clone()),
            })
            .await?;

        let link = SubAgentLink {
            id: uuid::Uuid::new_v4().to_string(),
            parent_session_id: parent.id.clone(),
            child_session_id: child.id.clone(),
            task: req.task,
            status: SubAgentStatus::Active,
            created_at: self.inner.clock.now(),
        };
        self.inner.store.create_sub_agent_link(link.clone()).await?;

        Ok(SubAgentResult {
            link_id: link.id,
            child_session_id: child.id,
            status: SubAgentStatus::Active,
        })
    }

    // ── Follow-ups ───────────────────────────────────────────────────

    pub async fn schedule_follow_up(
        &self,
        agent_id: &str,
        session_id: Option<&str>,
        message: &str,
        execute_at: chrono::DateTime<chrono::Utc>,
    ) -> Result<String> {
        let follow_up = self
            .inner
            .store
            .create_follow_up(agent_id, session_id, message, execute_at)
            .await?;
        self.inner.followup_notify.notify_one();
        Ok(follow_up.id)
    }

    pub async fn cancel_follow_up(&self, id: &str) -> Result<bool> {
        let cancelled = self.inner.store.cancel_follow_up(id).await?;
        if cancelled {
            self.inner.followup_notify.notify_one();
        }
        Ok(cancelled)
    }

    // ── Email channel ────────────────────────────────────────────────

    pub async fn handle_inbound_email(&self, email: InboundEmail) -> Result<EmailDelivery> {
        if self.inner.dedupe.check_and_insert(&email.message_id) {
            tracing::debug!(message_id = %email.message_id, "duplicate inbound email ignored");
            return Ok(EmailDelivery {
                session_id: String::new(),
                spawned: false,
                duplicate: true,
            });
        }

        let agent_id = self
            .inner
            .store
            .agent_for_email(&email.from)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no agent bound to {}", email.from)))?;
        let body = render_email(&email);

        let active = self
            .inner
            .store
            .list_sessions(
                &agent_id,
                SessionFilter {
                    status: Some(SessionStatus::Active),
                    limit: Some(1),
                },
            )
            .await?;

        if let Some(session) = active.first() {
            self.send_message(&session.id, &body).await?;
            return Ok(EmailDelivery {
                session_id: session.id.clone(),
                spawned: false,
                duplicate: false,
            });
        }

        let agent = self.agent_config(&agent_id)?;
        let session = self
            .spawn_session(SpawnOptions::new(agent).with_message(body))
            .await?;
        Ok(EmailDelivery {
            session_id: session.id,
            spawned: true,
            duplicate: false,
        })
    }

    // ── Internals ────────────────────────────────────────────────────

    fn agent_config(&self, agent_id: &str) -> Result<AgentConfig> {
        self.inner
            .agents
            .read()
            .get(agent_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("agent config for '{agent_id}'")))
    }

    fn build_registry(&self, agent: &AgentConfig) -> ToolRegistry {
        let catalog = self.inner.tools.read();
        let mut registry = ToolRegistry::new();
        if agent.tools.is_empty() {
            for tool in catalog.values() {
                registry.register(tool.clone());
            }
        } else {
            for name in &agent.tools {
                match catalog.get(name) {
                    Some(tool) => registry.register(tool.clone()),
                    None => tracing::warn!(tool = %name, "tool not in catalog; skipping"),
                }
            }
        }
        registry
    }

    fn start_loop(
        &self,
        session: &Session,
        agent: AgentConfig,
        model_ref: ModelRef,
        api_key: String,
        messages: Vec<Message>,
        start_turn: u32,
    ) {
        let inner = self.inner.clone();
        let sid = session.id.clone();
        let parent_id = session.parent_id.clone();

        let cancel = inner.cancel_map.register(&sid);
        if let Some(parent) = &parent_id {
            inner.cancel_map.add_to_group(parent, &sid);
        }

        let agent_loop = AgentLoop {
            store: inner.store.clone(),
            model: inner.model.clone(),
            hooks: inner.hooks.clone(),
            events: inner.events.clone(),
            registry: Arc::new(self.build_registry(&agent)),
            pricing: inner.pricing.read().clone(),
            retry: RetryPolicy::from(&inner.config.retry),
            config: agent,
            model_ref,
            api_key: Some(api_key),
            session_id: sid.clone(),
            cancel,
            clock: inner.clock.clone(),
        };

        let task_sid = sid.clone();
        let handle = tokio::spawn(async move {
            let outcome = agent_loop.run(messages, start_turn).await;
            tracing::info!(
                session_id = %task_sid,
                status = ?outcome.status,
                stop_reason = %outcome.last_stop_reason,
                turns = outcome.turn_count,
                "session loop exited"
            );

            // Natural completion closes the sub-agent link, if any.
            if let Some(parent) = &parent_id {
                if let Ok(links) = inner.store.list_child_links(parent).await {
                    for link in links {
                        if link.child_session_id == task_sid
                            && link.status == SubAgentStatus::Active
                        {
                            let _ = inner
                                .store
                                .update_link_status(&link.id, SubAgentStatus::Completed)
                                .await;
                        }
                    }
                }
            }

            inner.cancel_map.remove(&task_sid);
            inner.active.lock().remove(&task_sid);
            inner.events.cleanup(&task_sid);
        });
        self.inner.active.lock().insert(sid, handle);
    }

    async fn resume_active_sessions(&self) {
        let metas = match self.inner.store.find_active_sessions().await {
            Ok(metas) => metas,
            Err(e) => {
                tracing::warn!(error = %e, "resume scan failed");
                return;
            }
        };

        for meta in metas {
            // At most one loop per session.
            if self.inner.cancel_map.is_running(&meta.id) {
                continue;
            }
            let session = match self.inner.store.get_session(&meta.id).await {
                Ok(session) => session,
                Err(e) => {
                    tracing::warn!(session_id = %meta.id, error = %e, "resume load failed");
                    continue;
                }
            };

            if session.messages.is_empty() {
                tracing::warn!(session_id = %session.id, "active session has no messages; marking failed");
                let _ = self
                    .inner
                    .store
                    .update_session(
                        &session.id,
                        SessionPatch {
                            status: Some(SessionStatus::Failed),
                            last_stop_reason: Some("empty_on_resume".to_owned()),
                            ..Default::default()
                        },
                    )
                    .await;
                continue;
            }

            let agent = match self.agent_config(&session.agent_id) {
                Ok(agent) => agent,
                Err(_) => {
                    tracing::warn!(
                        session_id = %session.id,
                        agent_id = %session.agent_id,
                        "no registered agent config; leaving session for stale detection"
                    );
                    continue;
                }
            };

            let model_ref = agent
                .model
                .clone()
                .unwrap_or_else(|| self.inner.config.default_model.clone());
            let api_key = match resolve_api_key(
                &model_ref.provider,
                &self.inner.config.api_keys,
                &self.inner.custom_keys.read(),
            ) {
                Ok(key) => key,
                Err(e) => {
                    tracing::warn!(session_id = %session.id, error = %e, "resume key resolution failed");
                    continue;
                }
            };

            let note = format!(
                "Session resumed after process restart. Continue where you left off. Current time: {}",
                self.inner.clock.now().to_rfc3339()
            );
            let mut messages = session.messages.clone();
            messages.push(Message::system(note.clone()));
            if let Err(e) = self
                .inner
                .store
                .append_message(&session.id, Message::system(note))
                .await
            {
                tracing::warn!(session_id = %session.id, error = %e, "resume note write failed");
            }
            let _ = self
                .inner
                .store
                .touch_session(&session.id, TouchCounters::default())
                .await;

            self.inner.events.emit(
                &session.id,
                SessionEvent::SessionResumed {
                    session_id: session.id.clone(),
                },
            );
            tracing::info!(session_id = %session.id, turn = session.turn_count, "resuming session");
            let start_turn = session.turn_count;
            self.start_loop(&session, agent, model_ref, api_key, messages, start_turn);
        }
    }

    fn spawn_ticks(&self) {
        let mut tasks = self.inner.tick_tasks.lock();

        // Heartbeat: prove local loops alive.
        let rt = self.clone();
        tasks.push(tokio::spawn(async move {
            let period = Duration::from_millis(rt.inner.config.heartbeat_interval_ms);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for sid in rt.inner.cancel_map.running_sessions() {
                    if let Err(e) = rt
                        .inner
                        .store
                        .touch_session(&sid, TouchCounters::default())
                        .await
                    {
                        tracing::debug!(session_id = %sid, error = %e, "heartbeat tick touch failed");
                    }
                }
            }
        }));

        // Stale detection: reap sessions whose heartbeat aged out.
        let rt = self.clone();
        tasks.push(tokio::spawn(async move {
            let timeout_ms = rt.inner.config.stale_session_timeout_ms;
            let mut interval = tokio::time::interval(Duration::from_millis(timeout_ms));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                match rt.inner.store.mark_stale_sessions(timeout_ms).await {
                    Ok(ids) => {
                        for sid in ids {
                            tracing::warn!(session_id = %sid, "session went stale; cancelling");
                            rt.inner.cancel_map.cancel(&sid);
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "stale tick failed"),
                }
            }
        }));

        // Keepalive: padding events so streaming subscribers survive
        // load balancers.
        let rt = self.clone();
        tasks.push(tokio::spawn(async move {
            let period = Duration::from_millis(rt.inner.config.keepalive_ms);
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                for sid in rt.inner.cancel_map.running_sessions() {
                    rt.inner.events.emit(
                        &sid,
                        SessionEvent::Heartbeat {
                            session_id: sid.clone(),
                        },
                    );
                }
            }
        }));

        // Follow-up scheduler.
        let rt = self.clone();
        tasks.push(tokio::spawn(async move {
            followups::scheduler_loop(rt).await;
        }));
    }
}

fn status_label(status: SessionStatus) -> &'static str {
    match status {
        SessionStatus::Active => "active",
        SessionStatus::Paused => "paused",
        SessionStatus::Completed => "completed",
        SessionStatus::Failed => "failed",
        SessionStatus::Stale => "stale",
    }
}
