//! The per-session think-act loop.
//!
//! One [`AgentLoop`] drives one session: hook gates, a streaming model
//! call, sequential tool execution, and a checkpoint after every turn.
//! Work within a session is strictly sequential — at most one in-flight
//! model call or tool execution at a time. Every suspension point observes
//! the session's cancel token.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::StreamExt;

use hb_domain::config::{AgentConfig, ModelRef};
use hb_domain::{
    approx_tokens, CancelToken, Clock, ContentBlock, Error, Message, ModelDelta, StopReason,
    ToolCall,
};
use hb_model::{
    stream_with_retry, CallOptions, DeltaStream, ModelClient, ModelRequest, PricingTable,
    RetryPolicy,
};
use hb_store::{SessionPatch, SessionStatus, Store, TouchCounters};
use hb_tools::{ExecutedTool, ToolContext, ToolExecutor, ToolRegistry, ToolResult};

use crate::compact;
use crate::events::{EventBus, SessionEvent};
use crate::hooks::{HookChain, LlmUsage, ToolHookContext, ToolOutcome};

/// Final state of a finished loop.
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub status: SessionStatus,
    pub last_stop_reason: String,
    pub turn_count: u32,
    pub token_count: u64,
}

/// Everything one session loop needs, assembled by the supervisor.
pub struct AgentLoop {
    pub store: Arc<dyn Store>,
    pub model: Arc<dyn ModelClient>,
    pub hooks: Arc<HookChain>,
    pub events: Arc<EventBus>,
    pub registry: Arc<ToolRegistry>,
    pub pricing: Arc<PricingTable>,
    pub retry: RetryPolicy,
    pub config: AgentConfig,
    pub model_ref: ModelRef,
    pub api_key: Option<String>,
    pub session_id: String,
    pub cancel: CancelToken,
    pub clock: Arc<dyn Clock>,
}

enum Interrupt {
    Cancelled,
    Stream(Error),
}

/// Accumulated output of one model call.
struct TurnAccum {
    blocks: Vec<ContentBlock>,
    tool_calls: Vec<ToolCall>,
    usage: Option<(u64, u64)>,
    stop: StopReason,
}

impl AgentLoop {
    /// Run until the session reaches a terminal state, is paused by
    /// cancellation, or fails. `start_turn` is the persisted turn count
    /// (non-zero when resuming).
    pub async fn run(self, mut messages: Vec<Message>, start_turn: u32) -> LoopOutcome {
        let sid = self.session_id.clone();
        let mut turn_count = start_turn;

        loop {
            // Cancellation gate.
            if self.cancel.is_cancelled() {
                return self.finish_cancelled(&messages, turn_count).await;
            }

            // Heartbeat and turn_start with the prospective turn number.
            // The count itself is only persisted once the model call lands,
            // so a blocked turn is never counted as executed.
            let next_turn = turn_count + 1;
            if let Err(e) = self
                .store
                .touch_session(&sid, TouchCounters::default())
                .await
            {
                tracing::warn!(session_id = %sid, error = %e, "heartbeat touch failed");
            }
            self.emit(SessionEvent::TurnStart {
                session_id: sid.clone(),
                turn: next_turn,
            });

            // Hook rewrite, then compact while over the threshold.
            loop {
                messages = self
                    .hooks
                    .before_llm_call(messages, &self.config.agent_id, &sid)
                    .await;
                if !compact::needs_compaction(
                    &messages,
                    &self.config.compaction,
                    self.config.context_window_tokens,
                ) {
                    break;
                }
                match compact::compact(&messages, &self.config.compaction) {
                    Some((compacted, outcome)) => {
                        tracing::info!(
                            session_id = %sid,
                            folded = outcome.compacted,
                            tokens_before = outcome.tokens_before,
                            tokens_after = outcome.tokens_after,
                            "compacted context"
                        );
                        messages = compacted;
                        self.hooks
                            .on_context_compaction(&sid, &self.config.agent_id, &outcome.summary)
                            .await;
                    }
                    // The kept tail alone exceeds the window; nothing left
                    // to fold, so proceed and let the provider arbitrate.
                    None => break,
                }
            }

            // Budget gate. A budget stop is a normal completion.
            let estimated = approx_tokens(&messages);
            let decision = self
                .hooks
                .check_budget(&self.config.agent_id, &self.config.org_id, estimated)
                .await;
            if !decision.allowed {
                let reason = decision
                    .reason
                    .unwrap_or_else(|| "budget exceeded".to_owned());
                self.emit(SessionEvent::BudgetExceeded {
                    session_id: sid.clone(),
                    reason,
                });
                return self
                    .finish(&messages, turn_count, SessionStatus::Completed, "budget_exceeded")
                    .await;
            }
            if let Some(remaining) = decision.remaining_usd {
                if remaining < self.config.budget_warning_usd {
                    self.emit(SessionEvent::BudgetWarning {
                        session_id: sid.clone(),
                        remaining_usd: remaining,
                    });
                }
            }

            // Model call with retry; deltas forwarded to the bus as-is.
            let request = ModelRequest {
                model: self.model_ref.clone(),
                messages: messages.clone(),
                tools: self.registry.defs(),
                options: CallOptions {
                    max_tokens: None,
                    temperature: None,
                    api_key: self.api_key.clone(),
                },
            };
            let stream =
                match stream_with_retry(self.model.as_ref(), &request, &self.retry, &self.cancel)
                    .await
                {
                    Ok(stream) => stream,
                    Err(Error::Cancelled) => {
                        return self.finish_cancelled(&messages, turn_count).await
                    }
                    Err(e) => {
                        self.emit(SessionEvent::Error {
                            session_id: sid.clone(),
                            kind: e.kind().to_owned(),
                            message: e.to_string(),
                        });
                        return self
                            .finish(&messages, turn_count, SessionStatus::Failed, "error")
                            .await;
                    }
                };

            let turn = match self.consume_stream(stream).await {
                Ok(turn) => turn,
                Err(Interrupt::Cancelled) => {
                    return self.finish_cancelled(&messages, turn_count).await
                }
                Err(Interrupt::Stream(e)) => {
                    self.emit(SessionEvent::Error {
                        session_id: sid.clone(),
                        kind: e.kind().to_owned(),
                        message: e.to_string(),
                    });
                    return self
                        .finish(&messages, turn_count, SessionStatus::Failed, "error")
                        .await;
                }
            };

            // Append the assistant message and account usage.
            let mut assistant_tokens = 0;
            if !turn.blocks.is_empty() {
                let assistant = Message::assistant_blocks(turn.blocks.clone());
                assistant_tokens = assistant.approx_tokens();
                messages.push(assistant);
            }
            let (input_tokens, output_tokens) =
                turn.usage.unwrap_or((estimated, assistant_tokens));
            let pricing = match self
                .hooks
                .model_pricing(&self.model_ref.provider, &self.model_ref.model_id)
                .await
            {
                Some(pricing) => pricing,
                None => self
                    .pricing
                    .lookup_or_zero(&self.model_ref.provider, &self.model_ref.model_id),
            };
            self.hooks
                .record_llm_usage(
                    &self.config.agent_id,
                    &self.config.org_id,
                    LlmUsage {
                        input_tokens,
                        output_tokens,
                        cost_usd: pricing.estimate_cost(input_tokens, output_tokens),
                    },
                )
                .await;

            turn_count = next_turn;

            // Branch on the stop reason.
            match turn.stop {
                StopReason::EndTurn => {
                    self.emit(SessionEvent::TurnEnd {
                        session_id: sid.clone(),
                        turn: turn_count,
                    });
                    return self
                        .finish(&messages, turn_count, SessionStatus::Completed, "end_turn")
                        .await;
                }
                StopReason::ToolUse => {
                    if turn.tool_calls.is_empty() {
                        // A tool_use stop with no tool_use blocks would spin
                        // the loop; treat it as the model finishing.
                        tracing::warn!(session_id = %sid, "tool_use stop carried no tool calls");
                        return self
                            .finish(&messages, turn_count, SessionStatus::Completed, "end_turn")
                            .await;
                    }
                    match self.execute_tools(&turn.tool_calls, turn_count).await {
                        Ok(results) => messages.push(Message::tool_results(results)),
                        Err(Interrupt::Cancelled) => {
                            return self.finish_cancelled(&messages, turn_count).await
                        }
                        Err(Interrupt::Stream(_)) => unreachable!("tools never stream-fail"),
                    }
                    self.checkpoint(&messages, turn_count).await;
                }
                StopReason::MaxTokens => {
                    if let Some((compacted, outcome)) =
                        compact::compact(&messages, &self.config.compaction)
                    {
                        messages = compacted;
                        self.hooks
                            .on_context_compaction(&sid, &self.config.agent_id, &outcome.summary)
                            .await;
                    }
                    self.checkpoint(&messages, turn_count).await;
                }
                StopReason::ContentFilter => {
                    return self
                        .finish(&messages, turn_count, SessionStatus::Completed, "content_filter")
                        .await;
                }
                StopReason::Error => {
                    self.emit(SessionEvent::Error {
                        session_id: sid.clone(),
                        kind: "permanent_upstream".to_owned(),
                        message: "model reported an error stop".to_owned(),
                    });
                    return self
                        .finish(&messages, turn_count, SessionStatus::Failed, "error")
                        .await;
                }
            }

            // Max-turns cap.
            if self.config.max_turns > 0 && turn_count >= self.config.max_turns {
                return self
                    .finish(&messages, turn_count, SessionStatus::Completed, "max_turns")
                    .await;
            }
        }
    }

    // ── Streaming ────────────────────────────────────────────────────

    async fn consume_stream(&self, mut stream: DeltaStream) -> Result<TurnAccum, Interrupt> {
        let mut blocks: Vec<ContentBlock> = Vec::new();
        let mut input_bufs: HashMap<String, String> = HashMap::new();
        let mut usage: Option<(u64, u64)> = None;
        let mut stop: Option<StopReason> = None;

        loop {
            let delta = tokio::select! {
                biased;
                _ = watch_cancel(&self.cancel) => return Err(Interrupt::Cancelled),
                next = stream.next() => next,
            };
            match delta {
                None => break,
                Some(Err(Error::Cancelled)) => return Err(Interrupt::Cancelled),
                Some(Err(e)) => return Err(Interrupt::Stream(e)),
                Some(Ok(delta)) => {
                    let finished = matches!(delta, ModelDelta::Stop { .. });
                    self.apply_delta(delta, &mut blocks, &mut input_bufs, &mut usage, &mut stop);
                    if finished {
                        break;
                    }
                }
            }
        }

        // Finalise tool_use inputs that only arrived as partial JSON.
        for block in &mut blocks {
            if let ContentBlock::ToolUse { id, input, .. } = block {
                if input.is_null() {
                    let buffered = input_bufs.remove(id).unwrap_or_default();
                    *input = parse_tool_input(id, &buffered);
                }
            }
        }

        let tool_calls: Vec<ToolCall> = blocks
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => Some(ToolCall {
                    id: id.clone(),
                    name: name.clone(),
                    input: input.clone(),
                }),
                _ => None,
            })
            .collect();

        let stop = stop.unwrap_or_else(|| {
            tracing::warn!(session_id = %self.session_id, "stream ended without a stop delta");
            if tool_calls.is_empty() {
                StopReason::EndTurn
            } else {
                StopReason::ToolUse
            }
        });

        Ok(TurnAccum {
            blocks,
            tool_calls,
            usage,
            stop,
        })
    }

    fn apply_delta(
        &self,
        delta: ModelDelta,
        blocks: &mut Vec<ContentBlock>,
        input_bufs: &mut HashMap<String, String>,
        usage: &mut Option<(u64, u64)>,
        stop: &mut Option<StopReason>,
    ) {
        let sid = &self.session_id;
        match delta {
            ModelDelta::TextDelta { text } => {
                self.emit(SessionEvent::TextDelta {
                    session_id: sid.clone(),
                    text: text.clone(),
                });
                match blocks.last_mut() {
                    Some(ContentBlock::Text { text: buf }) => buf.push_str(&text),
                    _ => blocks.push(ContentBlock::Text { text }),
                }
            }
            ModelDelta::ThinkingDelta { text } => {
                self.emit(SessionEvent::ThinkingDelta {
                    session_id: sid.clone(),
                    text: text.clone(),
                });
                match blocks.last_mut() {
                    Some(ContentBlock::Thinking { text: buf }) => buf.push_str(&text),
                    _ => blocks.push(ContentBlock::Thinking { text }),
                }
            }
            ModelDelta::ToolUseStart { id, name } => {
                input_bufs.insert(id.clone(), String::new());
                blocks.push(ContentBlock::ToolUse {
                    id,
                    name,
                    input: serde_json::Value::Null,
                });
            }
            ModelDelta::ToolUseInputDelta { id, partial } => {
                input_bufs.entry(id).or_default().push_str(&partial);
            }
            ModelDelta::ToolUseEnd { id, input } => {
                input_bufs.remove(&id);
                for block in blocks.iter_mut() {
                    if matches!(block, ContentBlock::ToolUse { id: bid, .. } if *bid == id) {
                        if let ContentBlock::ToolUse { input: slot, .. } = block {
                            *slot = input;
                        }
                        break;
                    }
                }
            }
            ModelDelta::Usage {
                input_tokens,
                output_tokens,
            } => {
                let (i, o) = usage.unwrap_or((0, 0));
                *usage = Some((i + input_tokens, o + output_tokens));
            }
            ModelDelta::Stop { reason } => *stop = Some(reason),
        }
    }

    // ── Tool execution ───────────────────────────────────────────────

    /// Execute each tool_use block in order, strictly sequentially, and
    /// return one tool_result block per call in the same order.
    async fn execute_tools(
        &self,
        calls: &[ToolCall],
        turn: u32,
    ) -> Result<Vec<ContentBlock>, Interrupt> {
        let executor = ToolExecutor::new(self.config.tool_timeout_ms);
        let tool_ctx = ToolContext {
            session_id: self.session_id.clone(),
            agent_id: self.config.agent_id.clone(),
            turn,
            cancel: self.cancel.clone(),
        };

        let mut results = Vec::with_capacity(calls.len());
        for call in calls {
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }

            self.emit(SessionEvent::ToolCallStart {
                session_id: self.session_id.clone(),
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                input: call.input.clone(),
            });

            let mut call = call.clone();
            let mut hook_ctx = ToolHookContext {
                session_id: self.session_id.clone(),
                agent_id: self.config.agent_id.clone(),
                org_id: self.config.org_id.clone(),
                turn,
                call: call.clone(),
            };

            let started_at = self.clock.now();
            let gate = self.hooks.before_tool_call(&hook_ctx).await;
            let executed = if !gate.allowed {
                let reason = gate
                    .reason
                    .unwrap_or_else(|| "denied by policy".to_owned());
                ExecutedTool {
                    content: reason.clone(),
                    result: ToolResult::err(reason),
                }
            } else {
                if let Some(input) = gate.modified_input {
                    call.input = input.clone();
                    hook_ctx.call.input = input;
                }
                executor.execute(&self.registry, &call, &tool_ctx).await
            };
            let ended_at = self.clock.now();

            let preview = preview(&executed.content, 200);
            self.emit(SessionEvent::ToolCallEnd {
                session_id: self.session_id.clone(),
                call_id: call.id.clone(),
                tool_name: call.name.clone(),
                output_preview: preview.clone(),
                is_error: !executed.result.success,
            });

            let outcome = ToolOutcome {
                success: executed.result.success,
                output_preview: preview,
                error: executed.result.error.clone(),
                started_at,
                ended_at,
                duration_ms: (ended_at - started_at).num_milliseconds().max(0) as u64,
            };
            self.hooks.after_tool_call(&hook_ctx, &outcome).await;

            results.push(ContentBlock::ToolResult {
                tool_use_id: call.id.clone(),
                content: executed.content,
                is_error: !executed.result.success,
            });
        }
        Ok(results)
    }

    // ── Checkpoint & exit paths ──────────────────────────────────────

    /// Persist the full message list plus counters. The pair is a logical
    /// unit; failures are logged and survived — resume replays from the
    /// last successful checkpoint (at-least-once).
    async fn checkpoint(&self, messages: &[Message], turn_count: u32) {
        let sid = &self.session_id;
        let token_count = approx_tokens(messages);
        if let Err(e) = self.store.replace_messages(sid, messages).await {
            tracing::warn!(session_id = %sid, error = %e, "checkpoint write failed");
            return;
        }
        if let Err(e) = self
            .store
            .touch_session(
                sid,
                TouchCounters {
                    token_count: Some(token_count),
                    turn_count: Some(turn_count),
                },
            )
            .await
        {
            tracing::warn!(session_id = %sid, error = %e, "checkpoint touch failed");
        }
        self.emit(SessionEvent::Checkpoint {
            session_id: sid.clone(),
            turn: turn_count,
            message_count: messages.len(),
        });
    }

    async fn finish(
        &self,
        messages: &[Message],
        turn_count: u32,
        status: SessionStatus,
        reason: &str,
    ) -> LoopOutcome {
        let sid = &self.session_id;
        self.checkpoint(messages, turn_count).await;
        if let Err(e) = self
            .store
            .update_session(
                sid,
                SessionPatch {
                    status: Some(status),
                    last_stop_reason: Some(reason.to_owned()),
                    ..Default::default()
                },
            )
            .await
        {
            tracing::warn!(session_id = %sid, error = %e, "final status write failed");
        }
        self.hooks
            .on_session_end(sid, &self.config.agent_id, &self.config.org_id)
            .await;
        self.emit(SessionEvent::SessionEnd {
            session_id: sid.clone(),
            status,
        });
        LoopOutcome {
            status,
            last_stop_reason: reason.to_owned(),
            turn_count,
            token_count: approx_tokens(messages),
        }
    }

    /// Cancellation exit: pause the session unless a terminal transition
    /// (terminate, stale) was already applied by the supervisor.
    async fn finish_cancelled(&self, messages: &[Message], turn_count: u32) -> LoopOutcome {
        let sid = &self.session_id;
        self.checkpoint(messages, turn_count).await;

        let status = match self.store.get_session(sid).await {
            Ok(session) if session.status == SessionStatus::Active => {
                if let Err(e) = self
                    .store
                    .update_session(
                        sid,
                        SessionPatch {
                            status: Some(SessionStatus::Paused),
                            last_stop_reason: Some("cancelled".to_owned()),
                            ..Default::default()
                        },
                    )
                    .await
                {
                    tracing::warn!(session_id = %sid, error = %e, "pause write failed");
                }
                SessionStatus::Paused
            }
            Ok(session) => session.status,
            Err(_) => SessionStatus::Paused,
        };

        self.hooks
            .on_session_end(sid, &self.config.agent_id, &self.config.org_id)
            .await;
        self.emit(SessionEvent::SessionEnd {
            session_id: sid.clone(),
            status,
        });
        LoopOutcome {
            status,
            last_stop_reason: "cancelled".to_owned(),
            turn_count,
            token_count: approx_tokens(messages),
        }
    }

    fn emit(&self, event: SessionEvent) {
        self.events.emit(&self.session_id, event);
    }
}

async fn watch_cancel(token: &CancelToken) {
    while !token.is_cancelled() {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}

fn parse_tool_input(id: &str, buffered: &str) -> serde_json::Value {
    if buffered.trim().is_empty() {
        return serde_json::Value::Object(Default::default());
    }
    match serde_json::from_str(buffered) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(
                tool_use_id = %id,
                error = %e,
                "tool input was not valid JSON; substituting {{}}"
            );
            serde_json::Value::Object(Default::default())
        }
    }
}

/// Truncate at a char boundary, appending an ellipsis marker when cut.
pub(crate) fn preview(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preview_is_utf8_safe() {
        assert_eq!(preview("héllo", 1), "h...");
        assert_eq!(preview("short", 100), "short");
    }

    #[test]
    fn tool_input_fallbacks() {
        assert_eq!(parse_tool_input("t1", ""), serde_json::json!({}));
        assert_eq!(parse_tool_input("t1", "{bad"), serde_json::json!({}));
        assert_eq!(
            parse_tool_input("t1", r#"{"a":1}"#),
            serde_json::json!({"a": 1})
        );
    }
}
