//! Inbound email adapter types.
//!
//! Email is an inbound channel, not part of the loop: the runtime maps the
//! sender to an agent, finds or spawns a session, and delivers the body as
//! a user message. The dedupe store absorbs webhook retries and replays.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Normalized inbound email envelope.
#[derive(Debug, Clone)]
pub struct InboundEmail {
    pub from: String,
    pub subject: String,
    pub body: String,
    /// Provider message id, used for idempotent delivery.
    pub message_id: String,
}

/// What `handle_inbound_email` did.
#[derive(Debug, Clone)]
pub struct EmailDelivery {
    /// Empty when the message was a duplicate.
    pub session_id: String,
    /// Whether a fresh session was spawned for the delivery.
    pub spawned: bool,
    pub duplicate: bool,
}

/// In-memory idempotency store. Tracks seen message ids with a TTL to
/// prevent duplicate turn execution from webhook retries and replays.
pub struct DedupeStore {
    seen: Mutex<HashMap<String, Instant>>,
    ttl: Duration,
}

impl DedupeStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Returns `true` if this id was already seen within the TTL.
    pub fn check_and_insert(&self, id: &str) -> bool {
        let mut map = self.seen.lock();
        let now = Instant::now();

        // Lazy cleanup when the map grows large.
        if map.len() > 10_000 {
            let ttl = self.ttl;
            map.retain(|_, ts| now.duration_since(*ts) < ttl);
        }

        if let Some(ts) = map.get(id) {
            if now.duration_since(*ts) < self.ttl {
                return true;
            }
        }

        map.insert(id.to_owned(), now);
        false
    }
}

impl Default for DedupeStore {
    fn default() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60))
    }
}

/// Render the email for delivery into the session dialogue.
pub(crate) fn render_email(email: &InboundEmail) -> String {
    format!(
        "[Email from {}] Subject: {}\n\n{}",
        email.from, email.subject, email.body
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_detection() {
        let dedupe = DedupeStore::new(Duration::from_secs(60));
        assert!(!dedupe.check_and_insert("m1"));
        assert!(dedupe.check_and_insert("m1"));
        assert!(!dedupe.check_and_insert("m2"));
    }

    #[test]
    fn rendering_carries_sender_and_subject() {
        let text = render_email(&InboundEmail {
            from: "boss@example.com".into(),
            subject: "Q3 numbers".into(),
            body: "Please summarise.".into(),
            message_id: "m1".into(),
        });
        assert!(text.starts_with("[Email from boss@example.com] Subject: Q3 numbers"));
        assert!(text.ends_with("Please summarise."));
    }
}
