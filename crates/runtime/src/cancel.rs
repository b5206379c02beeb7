//! Active-session cancellation registry with group fan-out.
//!
//! Each running session registers its [`CancelToken`] here. Cancelling a
//! parent cancels every child registered in its group — used for
//! transitive sub-agent termination.

use std::collections::{HashMap, HashSet};

use parking_lot::Mutex;

use hb_domain::CancelToken;

/// Tracks cancellation tokens per session id, with parent→child groups.
#[derive(Default)]
pub struct CancelMap {
    tokens: Mutex<HashMap<String, CancelToken>>,
    /// parent session id → set of child session ids.
    groups: Mutex<HashMap<String, HashSet<String>>>,
}

impl CancelMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create and register a new cancel token for a session.
    pub fn register(&self, session_id: &str) -> CancelToken {
        let token = CancelToken::new();
        self.tokens
            .lock()
            .insert(session_id.to_owned(), token.clone());
        token
    }

    /// Cancel a session and everything in its group.
    /// Returns true if a token was found for the session itself.
    pub fn cancel(&self, session_id: &str) -> bool {
        let found = if let Some(token) = self.tokens.lock().get(session_id) {
            token.cancel();
            true
        } else {
            false
        };

        // Cascade to children.
        if let Some(children) = self.groups.lock().get(session_id) {
            let tokens = self.tokens.lock();
            for child in children {
                if let Some(token) = tokens.get(child) {
                    token.cancel();
                }
            }
        }

        found
    }

    /// Remove the token (called when a loop exits).
    pub fn remove(&self, session_id: &str) {
        self.tokens.lock().remove(session_id);
        self.groups.lock().remove(session_id);
    }

    pub fn is_running(&self, session_id: &str) -> bool {
        self.tokens.lock().contains_key(session_id)
    }

    pub fn add_to_group(&self, parent_id: &str, child_id: &str) {
        self.groups
            .lock()
            .entry(parent_id.to_owned())
            .or_default()
            .insert(child_id.to_owned());
    }

    /// Session ids with a registered token.
    pub fn running_sessions(&self) -> Vec<String> {
        self.tokens.lock().keys().cloned().collect()
    }

    /// Cancel everything (process shutdown).
    pub fn cancel_all(&self) {
        for token in self.tokens.lock().values() {
            token.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_and_cancel() {
        let map = CancelMap::new();
        let token = map.register("s1");
        assert!(map.is_running("s1"));
        assert!(map.cancel("s1"));
        assert!(token.is_cancelled());

        map.remove("s1");
        assert!(!map.is_running("s1"));
        assert!(!map.cancel("s1"));
    }

    #[test]
    fn cancel_cascades_to_children() {
        let map = CancelMap::new();
        let parent = map.register("parent");
        let child1 = map.register("child1");
        let child2 = map.register("child2");
        map.add_to_group("parent", "child1");
        map.add_to_group("parent", "child2");

        map.cancel("parent");
        assert!(parent.is_cancelled());
        assert!(child1.is_cancelled());
        assert!(child2.is_cancelled());
    }

    #[test]
    fn cancel_all_fires_every_token() {
        let map = CancelMap::new();
        let a = map.register("a");
        let b = map.register("b");
        map.cancel_all();
        assert!(a.is_cancelled() && b.is_cancelled());
    }

    #[test]
    fn remove_is_idempotent() {
        let map = CancelMap::new();
        map.register("s1");
        map.remove("s1");
        map.remove("s1");
        assert!(!map.is_running("s1"));
    }
}
