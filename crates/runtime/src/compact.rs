//! Deterministic context-window compaction.
//!
//! When the estimated token count crosses the configured fraction of the
//! context window, everything but the system messages and the most recent
//! tail is collapsed into one bounded synthetic system message. No model
//! call is involved, so compaction always succeeds and is reproducible
//! from the message list alone.

use hb_domain::config::CompactionConfig;
use hb_domain::{approx_tokens, Message, Role};

/// What a compaction pass did.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    /// Body of the synthetic digest message.
    pub summary: String,
    /// How many messages were folded into the digest.
    pub compacted: usize,
    pub tokens_before: u64,
    pub tokens_after: u64,
}

/// Whether the working messages exceed the compaction threshold.
pub fn needs_compaction(messages: &[Message], cfg: &CompactionConfig, window_tokens: u64) -> bool {
    approx_tokens(messages) as f64 > cfg.threshold as f64 * window_tokens as f64
}

/// Compact the list: preserve system messages, keep the last
/// `cfg.keep_recent` of the rest, digest everything older.
///
/// Returns `None` (leaving the input unchanged) when there is nothing old
/// enough to fold — the caller uses that to avoid re-compacting forever.
pub fn compact(messages: &[Message], cfg: &CompactionConfig) -> Option<(Vec<Message>, CompactionOutcome)> {
    let tokens_before = approx_tokens(messages);

    let system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role == Role::System)
        .cloned()
        .collect();
    let non_system: Vec<Message> = messages
        .iter()
        .filter(|m| m.role != Role::System)
        .cloned()
        .collect();

    if non_system.len() <= cfg.keep_recent {
        return None;
    }

    let split = non_system.len() - cfg.keep_recent;
    let (older, tail) = non_system.split_at(split);
    let summary = digest(older, cfg);

    let mut compacted = system;
    compacted.push(Message::system(summary.clone()));
    compacted.extend_from_slice(tail);

    let tokens_after = approx_tokens(&compacted);
    let outcome = CompactionOutcome {
        summary,
        compacted: older.len(),
        tokens_before,
        tokens_after,
    };
    Some((compacted, outcome))
}

/// Build the bounded digest: one line per source message, `[role]: <first N
/// chars of its text>`, the whole string truncated with an ellipsis marker.
fn digest(older: &[Message], cfg: &CompactionConfig) -> String {
    let mut body = String::new();
    for msg in older {
        let text = msg.content.extract_all_text();
        let line = format!(
            "[{}]: {}",
            role_label(msg.role),
            head(&text, cfg.per_message_chars)
        );
        if !body.is_empty() {
            body.push('\n');
        }
        body.push_str(&line);
        if body.len() >= cfg.digest_max_bytes {
            break;
        }
    }
    if body.len() > cfg.digest_max_bytes {
        let mut end = cfg.digest_max_bytes;
        while !body.is_char_boundary(end) && end > 0 {
            end -= 1;
        }
        body.truncate(end);
        body.push('…');
    }
    body
}

fn head(s: &str, max_chars: usize) -> &str {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

fn role_label(role: Role) -> &'static str {
    match role {
        Role::System => "system",
        Role::User => "user",
        Role::Assistant => "assistant",
        Role::Tool => "tool",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> CompactionConfig {
        CompactionConfig::default()
    }

    fn long_conversation(turns: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("You are terse.")];
        for i in 0..turns {
            messages.push(Message::user(format!("question {i}: {}", "x".repeat(400))));
            messages.push(Message::assistant(format!("answer {i}: {}", "y".repeat(400))));
        }
        messages
    }

    #[test]
    fn below_threshold_is_noop() {
        let messages = long_conversation(3);
        assert!(!needs_compaction(&messages, &cfg(), 1_000_000));
    }

    #[test]
    fn above_threshold_triggers() {
        let messages = long_conversation(30);
        // ~24k chars ≈ 6k tokens against a 1k window.
        assert!(needs_compaction(&messages, &cfg(), 1_000));
    }

    #[test]
    fn compaction_preserves_system_and_tail() {
        let messages = long_conversation(30);
        let (compacted, outcome) = compact(&messages, &cfg()).unwrap();

        // system prompt + digest + keep_recent tail.
        assert_eq!(compacted.len(), 1 + 1 + 10);
        assert_eq!(compacted[0].role, Role::System);
        assert_eq!(compacted[1].role, Role::System);
        assert_eq!(outcome.compacted, 60 - 10);

        // The tail is the latest messages, unchanged.
        let last = compacted.last().unwrap().content.extract_all_text();
        assert!(last.starts_with("answer 29"));
    }

    #[test]
    fn compaction_strictly_reduces_tokens() {
        let messages = long_conversation(30);
        let (_, outcome) = compact(&messages, &cfg()).unwrap();
        assert!(outcome.tokens_after < outcome.tokens_before);
    }

    #[test]
    fn digest_is_bounded() {
        let messages = long_conversation(200);
        let (_, outcome) = compact(&messages, &cfg()).unwrap();
        assert!(outcome.summary.len() <= cfg().digest_max_bytes + '…'.len_utf8());
        assert!(outcome.summary.starts_with("[user]: question 0"));
    }

    #[test]
    fn nothing_old_enough_returns_none() {
        let messages = long_conversation(4); // 8 non-system < keep_recent
        assert!(compact(&messages, &cfg()).is_none());
    }

    #[test]
    fn deterministic_given_messages() {
        let messages = long_conversation(30);
        let (a, _) = compact(&messages, &cfg()).unwrap();
        let (b, _) = compact(&messages, &cfg()).unwrap();
        assert_eq!(
            serde_json::to_string(&a).unwrap(),
            serde_json::to_string(&b).unwrap()
        );
    }
}
