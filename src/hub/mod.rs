//! Connection Hub
//!
//! Manages all client sessions, their position subscriptions, and the
//! fan-out of device updates to subscribers.
//!
//! Each session is represented by the sending half of an unbounded channel;
//! the session's writer task owns the socket. A failed send therefore means
//! the writer is gone, and the hub drops that session's subscriptions on the
//! spot without disturbing delivery to anyone else.

mod subscriptions;

pub use subscriptions::SubscriptionIndex;

use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::{mpsc, RwLock};
use uuid::Uuid;

use crate::protocol::{PositionSnapshot, QueryResponse, ServerMessage};

/// Unique identifier for a client session
pub type SessionId = String;

/// Sending half of a session's outbound queue
pub type SessionSender = mpsc::UnboundedSender<ServerMessage>;

/// Manages all sessions and subscriptions
pub struct ConnectionHub {
    /// Active sessions: SessionId → outbound queue
    connections: RwLock<HashMap<SessionId, SessionSender>>,
    /// Position subscriptions between sessions and targets
    subscriptions: RwLock<SubscriptionIndex>,
    /// Configuration
    config: HubConfig,
}

/// Configuration for the connection hub
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Maximum number of concurrent sessions
    pub max_connections: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            max_connections: 1000,
        }
    }
}

impl ConnectionHub {
    /// Create a new connection hub
    pub fn new(config: HubConfig) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            subscriptions: RwLock::new(SubscriptionIndex::new()),
            config,
        }
    }

    /// Register a new session
    ///
    /// Returns the session ID on success, or an error if the session
    /// limit has been reached.
    pub async fn register(&self, sender: SessionSender) -> Result<SessionId, HubError> {
        let mut connections = self.connections.write().await;
        if connections.len() >= self.config.max_connections {
            return Err(HubError::TooManyConnections(self.config.max_connections));
        }

        let id = Uuid::new_v4().to_string();
        connections.insert(id.clone(), sender);

        tracing::info!(session_id = %id, "Session opened");
        Ok(id)
    }

    /// Unregister a session and release all of its subscriptions
    ///
    /// Returns the targets the session was subscribed to.
    pub async fn unregister(&self, id: &str) -> Vec<String> {
        // Lock order: connections, then subscriptions
        let mut connections = self.connections.write().await;
        connections.remove(id);
        let released = self.subscriptions.write().await.remove_session(id);
        drop(connections);

        tracing::info!(
            session_id = %id,
            released = released.len(),
            "Session closed"
        );
        released
    }

    /// Subscribe a session to position updates of a target
    pub async fn subscribe(&self, id: &str, target: &str) -> Result<(), HubError> {
        // Holding the connection map keeps a concurrent unregister from
        // slipping in between the check and the insert
        let connections = self.connections.read().await;
        if !connections.contains_key(id) {
            return Err(HubError::ConnectionNotFound);
        }

        if self.subscriptions.write().await.add(id, target) {
            tracing::debug!(session_id = %id, device = %target, "Subscribed to position");
        }
        drop(connections);
        Ok(())
    }

    /// Unsubscribe a session from a target
    ///
    /// Returns false if the session was not subscribed.
    pub async fn unsubscribe(&self, id: &str, target: &str) -> bool {
        let removed = self.subscriptions.write().await.remove(id, target);
        if removed {
            tracing::debug!(session_id = %id, device = %target, "Unsubscribed from position");
        }
        removed
    }

    /// Whether a session is subscribed to a target
    pub async fn is_subscribed(&self, id: &str, target: &str) -> bool {
        self.subscriptions.read().await.is_subscribed(id, target)
    }

    /// Send a message directly to a specific session
    pub async fn send_to(&self, id: &str, message: ServerMessage) -> Result<(), HubError> {
        let connections = self.connections.read().await;
        let sender = connections.get(id).ok_or(HubError::ConnectionNotFound)?;

        sender.send(message).map_err(|_| HubError::SendFailed)
    }

    /// Push a position update to every subscriber of a target
    ///
    /// Sessions that can no longer be reached lose all their subscriptions;
    /// the remaining subscribers still receive the update. Returns the number
    /// of sessions the update was delivered to.
    pub async fn broadcast_position(&self, target: &str, snapshot: PositionSnapshot) -> usize {
        let message = ServerMessage::Response(QueryResponse::position(target, true, snapshot));
        let mut delivered = 0;
        let mut failed = Vec::new();
        {
            // Lock order: connections, then subscriptions. Holding both across
            // the sends keeps a termination notice from overtaking this update.
            let connections = self.connections.read().await;
            let subscriptions = self.subscriptions.read().await;
            let subscribers = subscriptions.subscribers(target);
            if subscribers.is_empty() {
                return 0;
            }
            for id in subscribers {
                let sent = connections
                    .get(&id)
                    .map(|sender| sender.send(message.clone()).is_ok())
                    .unwrap_or(false);
                if sent {
                    delivered += 1;
                } else {
                    failed.push(id);
                }
            }
        }

        if !failed.is_empty() {
            let mut subs = self.subscriptions.write().await;
            for id in &failed {
                subs.remove_session(id);
                tracing::debug!(
                    session_id = %id,
                    device = %target,
                    "Dropped subscriptions of unreachable session"
                );
            }
        }

        tracing::trace!(device = %target, delivered, "Broadcast position");
        delivered
    }

    /// Tell every subscriber of a target that its subscription has ended,
    /// then drop those subscriptions
    ///
    /// Returns the number of notices delivered.
    pub async fn notify_termination(&self, target: &str, reason: &str) -> usize {
        let subscribers = self.subscriptions.write().await.remove_target(target);
        if subscribers.is_empty() {
            return 0;
        }

        let message = ServerMessage::Response(QueryResponse::termination(target, reason));
        let connections = self.connections.read().await;
        let delivered = subscribers
            .iter()
            .filter(|id| {
                connections
                    .get(id.as_str())
                    .map(|sender| sender.send(message.clone()).is_ok())
                    .unwrap_or(false)
            })
            .count();

        tracing::debug!(
            device = %target,
            reason = %reason,
            subscribers = subscribers.len(),
            delivered,
            "Ended position subscriptions"
        );
        delivered
    }

    /// Get the current session count
    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Get subscriber count for a target
    pub async fn subscriber_count(&self, target: &str) -> usize {
        self.subscriptions.read().await.subscriber_count(target)
    }

    /// Targets a session is subscribed to
    pub async fn subscriptions_of(&self, id: &str) -> Vec<String> {
        self.subscriptions.read().await.targets(id)
    }

    /// Copy of the subscription index, for inspection
    pub async fn subscription_snapshot(&self) -> SubscriptionIndex {
        self.subscriptions.read().await.clone()
    }

    /// Hold the session map as a concurrent register/unregister would
    #[cfg(test)]
    pub(crate) async fn lock_sessions(
        &self,
    ) -> tokio::sync::RwLockWriteGuard<'_, HashMap<SessionId, SessionSender>> {
        self.connections.write().await
    }
}

impl Default for ConnectionHub {
    fn default() -> Self {
        Self::new(HubConfig::default())
    }
}

/// Errors that can occur in the connection hub
#[derive(Debug, Error)]
pub enum HubError {
    #[error("Too many connections (limit: {0})")]
    TooManyConnections(usize),

    #[error("Connection not found")]
    ConnectionNotFound,

    #[error("Failed to send message")]
    SendFailed,
}
