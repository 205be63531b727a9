//! Subscription Index
//!
//! Many-to-many relation between sessions and device targets, kept as two
//! mirror maps. A session is in `by_target[t]` iff `t` is in
//! `by_session[s]`, and neither map ever holds an empty set.

use std::collections::{HashMap, HashSet};

/// Bidirectional session ⇄ target subscription relation
#[derive(Debug, Default, Clone)]
pub struct SubscriptionIndex {
    /// Target → sessions watching it
    by_target: HashMap<String, HashSet<String>>,
    /// Session → targets it watches
    by_session: HashMap<String, HashSet<String>>,
}

impl SubscriptionIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe a session to a target
    ///
    /// Returns false if the subscription already existed.
    pub fn add(&mut self, session: &str, target: &str) -> bool {
        let added = self
            .by_target
            .entry(target.to_string())
            .or_default()
            .insert(session.to_string());
        self.by_session
            .entry(session.to_string())
            .or_default()
            .insert(target.to_string());
        added
    }

    /// Unsubscribe a session from a target
    ///
    /// Returns false if there was nothing to remove.
    pub fn remove(&mut self, session: &str, target: &str) -> bool {
        let removed = detach(&mut self.by_target, target, session);
        detach(&mut self.by_session, session, target);
        removed
    }

    /// Drop every subscription of a session, returning the targets it held
    pub fn remove_session(&mut self, session: &str) -> Vec<String> {
        let targets: Vec<String> = self
            .by_session
            .remove(session)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for target in &targets {
            detach(&mut self.by_target, target, session);
        }

        targets
    }

    /// Drop every subscription to a target, returning the sessions that held one
    pub fn remove_target(&mut self, target: &str) -> Vec<String> {
        let sessions: Vec<String> = self
            .by_target
            .remove(target)
            .map(|set| set.into_iter().collect())
            .unwrap_or_default();

        for session in &sessions {
            detach(&mut self.by_session, session, target);
        }

        sessions
    }

    pub fn is_subscribed(&self, session: &str, target: &str) -> bool {
        self.by_session
            .get(session)
            .map(|targets| targets.contains(target))
            .unwrap_or(false)
    }

    /// Sessions currently subscribed to a target
    pub fn subscribers(&self, target: &str) -> Vec<String> {
        self.by_target
            .get(target)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Targets a session is currently subscribed to
    pub fn targets(&self, session: &str) -> Vec<String> {
        self.by_session
            .get(session)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn subscriber_count(&self, target: &str) -> usize {
        self.by_target.get(target).map(|s| s.len()).unwrap_or(0)
    }

    /// Number of targets with at least one subscriber
    pub fn target_count(&self) -> usize {
        self.by_target.len()
    }

    /// Number of sessions with at least one subscription
    pub fn session_count(&self) -> usize {
        self.by_session.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_target.is_empty() && self.by_session.is_empty()
    }

    /// Check that both maps mirror each other and hold no empty sets
    pub fn is_consistent(&self) -> bool {
        let forward = self.by_target.iter().all(|(target, sessions)| {
            !sessions.is_empty()
                && sessions.iter().all(|s| {
                    self.by_session
                        .get(s)
                        .map(|targets| targets.contains(target))
                        .unwrap_or(false)
                })
        });
        let backward = self.by_session.iter().all(|(session, targets)| {
            !targets.is_empty()
                && targets.iter().all(|t| {
                    self.by_target
                        .get(t)
                        .map(|sessions| sessions.contains(session))
                        .unwrap_or(false)
                })
        });
        forward && backward
    }
}

/// Remove `value` from `map[key]`, pruning the entry once it is empty
fn detach(map: &mut HashMap<String, HashSet<String>>, key: &str, value: &str) -> bool {
    let Some(set) = map.get_mut(key) else {
        return false;
    };
    let removed = set.remove(value);
    if set.is_empty() {
        map.remove(key);
    }
    removed
}
