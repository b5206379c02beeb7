//! Per-session event fan-out.
//!
//! One broadcast channel per session: single producer (the loop or a
//! runtime tick), many subscribers. Delivery is best-effort — a lagging
//! subscriber skips ahead and the store stays authoritative.

use std::collections::HashMap;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::broadcast;

use hb_store::SessionStatus;

const CHANNEL_CAPACITY: usize = 128;

/// Events observable on a session's channel, in loop order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SessionEvent {
    SessionStart {
        session_id: String,
        agent_id: String,
    },
    SessionResumed {
        session_id: String,
    },
    TurnStart {
        session_id: String,
        turn: u32,
    },
    TextDelta {
        session_id: String,
        text: String,
    },
    ThinkingDelta {
        session_id: String,
        text: String,
    },
    ToolCallStart {
        session_id: String,
        call_id: String,
        tool_name: String,
        input: serde_json::Value,
    },
    ToolCallEnd {
        session_id: String,
        call_id: String,
        tool_name: String,
        output_preview: String,
        is_error: bool,
    },
    TurnEnd {
        session_id: String,
        turn: u32,
    },
    Checkpoint {
        session_id: String,
        turn: u32,
        message_count: usize,
    },
    Heartbeat {
        session_id: String,
    },
    BudgetWarning {
        session_id: String,
        remaining_usd: f64,
    },
    BudgetExceeded {
        session_id: String,
        reason: String,
    },
    Error {
        session_id: String,
        kind: String,
        message: String,
    },
    SessionEnd {
        session_id: String,
        status: SessionStatus,
    },
}

/// Per-session broadcast channels.
#[derive(Default)]
pub struct EventBus {
    channels: RwLock<HashMap<String, broadcast::Sender<SessionEvent>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create a session's channel and subscribe to it.
    pub fn subscribe(&self, session_id: &str) -> broadcast::Receiver<SessionEvent> {
        let mut channels = self.channels.write();
        let tx = channels
            .entry(session_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        tx.subscribe()
    }

    /// Emit an event; a send with no subscribers is not an error.
    pub fn emit(&self, session_id: &str, event: SessionEvent) {
        let mut channels = self.channels.write();
        let tx = channels
            .entry(session_id.to_owned())
            .or_insert_with(|| broadcast::channel(CHANNEL_CAPACITY).0);
        let _ = tx.send(event);
    }

    /// Drop the channel for an ended session.
    pub fn cleanup(&self, session_id: &str) {
        self.channels.write().remove(session_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscribe_then_emit_delivers_in_order() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("s1");
        bus.emit(
            "s1",
            SessionEvent::TurnStart {
                session_id: "s1".into(),
                turn: 1,
            },
        );
        bus.emit(
            "s1",
            SessionEvent::TextDelta {
                session_id: "s1".into(),
                text: "Hi".into(),
            },
        );

        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::TurnStart { turn: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), SessionEvent::TextDelta { .. }));
    }

    #[tokio::test]
    async fn emit_without_subscribers_is_fine() {
        let bus = EventBus::new();
        bus.emit(
            "ghost",
            SessionEvent::Heartbeat {
                session_id: "ghost".into(),
            },
        );
    }

    #[tokio::test]
    async fn sessions_are_isolated() {
        let bus = EventBus::new();
        let mut rx1 = bus.subscribe("s1");
        let _rx2 = bus.subscribe("s2");
        bus.emit(
            "s2",
            SessionEvent::Heartbeat {
                session_id: "s2".into(),
            },
        );
        // s1 sees nothing.
        assert!(matches!(
            rx1.try_recv(),
            Err(broadcast::error::TryRecvError::Empty)
        ));
    }

    #[tokio::test]
    async fn event_serializes_with_type_tag() {
        let json = serde_json::to_value(SessionEvent::BudgetExceeded {
            session_id: "s1".into(),
            reason: "cap".into(),
        })
        .unwrap();
        assert_eq!(json["type"], "budget_exceeded");
    }
}
