//! Relay Core
//!
//! Routes parsed client envelopes to the command dispatcher or the query
//! handler, and runs the device event loop that turns transport
//! notifications into position broadcasts.
//!
//! ## Event flow
//!
//! ```text
//! transport thread ──callback──▶ mpsc ──▶ device event loop ──▶ registry update
//!                                                          └──▶ hub broadcast
//! ```
//!
//! The event loop is the only consumer of device notifications, so updates
//! for a device are applied and broadcast in the order they were reported.

mod command;
mod query;

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::device::{DeviceEvent, DeviceRegistry, DeviceTransport, Notification, RegistryError};
use crate::hub::{ConnectionHub, HubConfig};
use crate::protocol::{ClientMessage, ServerMessage};

/// Relay tuning knobs
#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Upper bound on a battery read
    pub battery_timeout: Duration,
    /// Upper bound on a device scan
    pub scan_timeout: Duration,
    /// Session hub settings
    pub hub: HubConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            battery_timeout: Duration::from_secs(5),
            scan_timeout: Duration::from_secs(10),
            hub: HubConfig::default(),
        }
    }
}

/// The relay: device registry, session hub and message routing
pub struct Relay {
    transport: Arc<dyn DeviceTransport>,
    registry: Arc<DeviceRegistry>,
    hub: Arc<ConnectionHub>,
    config: RelayConfig,
    event_loop: JoinHandle<()>,
}

impl Relay {
    /// Create a relay and start its device event loop
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(transport: Arc<dyn DeviceTransport>, config: RelayConfig) -> Arc<Self> {
        let hub = Arc::new(ConnectionHub::new(config.hub.clone()));
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(DeviceRegistry::new(
            Arc::clone(&transport),
            Arc::clone(&hub),
            events_tx,
            config.scan_timeout,
        ));

        let event_loop = tokio::spawn(run_device_events(
            Arc::clone(&registry),
            Arc::clone(&hub),
            events_rx,
        ));

        tracing::info!(transport = transport.name(), "Relay started");
        Arc::new(Self {
            transport,
            registry,
            hub,
            config,
            event_loop,
        })
    }

    pub fn hub(&self) -> &Arc<ConnectionHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<DeviceRegistry> {
        &self.registry
    }

    pub fn transport_name(&self) -> &str {
        self.transport.name()
    }

    /// Handle a raw text frame from a session
    ///
    /// Returns the direct reply, if any. Frames that fail to parse produce
    /// an error envelope; the session stays open either way.
    pub async fn handle_text(&self, session_id: &str, text: &str) -> Option<ServerMessage> {
        match ClientMessage::parse(text) {
            Ok(message) => self.handle_message(session_id, message).await,
            Err(e) => {
                tracing::debug!(session_id = %session_id, error = %e, "Invalid client message");
                Some(ServerMessage::error(e.to_string()))
            }
        }
    }

    /// Handle a parsed client message
    pub async fn handle_message(
        &self,
        session_id: &str,
        message: ClientMessage,
    ) -> Option<ServerMessage> {
        match message {
            ClientMessage::Command(request) => self.handle_command(request).await,
            ClientMessage::Query(request) => Some(self.handle_query(session_id, request).await),
            ClientMessage::System(payload) => {
                tracing::debug!(
                    session_id = %session_id,
                    status = ?payload.status,
                    "System message"
                );
                Some(ServerMessage::System(payload))
            }
            ClientMessage::Unknown(kind) => {
                tracing::debug!(session_id = %session_id, kind = ?kind, "Unknown message type");
                Some(ServerMessage::error("Unknown message type"))
            }
        }
    }

    /// Disconnect every device and stop the event loop
    pub async fn shutdown(&self) {
        tracing::info!("Disconnecting devices");
        self.registry.disconnect_all().await;
        self.event_loop.abort();
    }
}

/// Drain device notifications in order and fan them out
async fn run_device_events(
    registry: Arc<DeviceRegistry>,
    hub: Arc<ConnectionHub>,
    mut events: mpsc::UnboundedReceiver<DeviceEvent>,
) {
    while let Some(event) = events.recv().await {
        match event.notification {
            Notification::LinkLost => {
                registry.drop_lost(&event.target).await;
            }
            notification => {
                if let Some(snapshot) = registry
                    .apply_notification(&event.target, notification)
                    .await
                {
                    hub.broadcast_position(&event.target, snapshot).await;
                }
            }
        }
    }
    tracing::debug!("Device event loop stopped");
}

/// Reasons a command fails, reported as the result message
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Unknown command")]
    UnknownCommand,

    #[error("Missing target")]
    MissingTarget,

    #[error("Invalid parameters: {0}")]
    InvalidParams(#[from] serde_json::Error),

    #[error("{0}")]
    Registry(#[from] RegistryError),

    #[error("Failed to set motor")]
    Motor,

    #[error("Failed to set LED")]
    Led,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MockTransport, Position, REASON_LINK_LOST};
    use crate::protocol::{PositionSnapshot, QueryResponse};
    use serde_json::{json, Value};

    pub(super) struct Harness {
        pub transport: Arc<MockTransport>,
        pub relay: Arc<Relay>,
    }

    impl Harness {
        pub fn new(ids: &[&str]) -> Self {
            Self::with_config(ids, RelayConfig::default())
        }

        pub fn with_config(ids: &[&str], config: RelayConfig) -> Self {
            let transport = Arc::new(MockTransport::new(ids));
            let relay = Relay::new(Arc::clone(&transport) as Arc<dyn DeviceTransport>, config);
            Self { transport, relay }
        }

        pub async fn session(&self) -> (String, mpsc::UnboundedReceiver<ServerMessage>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let id = self.relay.hub().register(tx).await.unwrap();
            (id, rx)
        }

        /// Send a JSON envelope and return the reply as JSON
        pub async fn send(&self, session: &str, envelope: Value) -> Option<Value> {
            self.relay
                .handle_text(session, &envelope.to_string())
                .await
                .map(|reply| serde_json::from_str(&reply.to_json().unwrap()).unwrap())
        }
    }

    pub(super) async fn recv_json(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Value {
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out waiting for message")
            .expect("channel closed");
        serde_json::from_str(&msg.to_json().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_unknown_message_type() {
        let h = Harness::new(&[]);
        let (id, _rx) = h.session().await;

        let reply = h.send(&id, json!({"type":"bogus","payload":{}})).await;
        assert_eq!(
            reply,
            Some(json!({"type":"error","payload":{"message":"Unknown message type"}}))
        );
    }

    #[tokio::test]
    async fn test_invalid_json_keeps_session() {
        let h = Harness::new(&[]);
        let (id, _rx) = h.session().await;

        let reply = h.relay.handle_text(&id, "{not json").await.unwrap();
        match reply {
            ServerMessage::Error(payload) => {
                assert!(payload.message.starts_with("Invalid message format"))
            }
            other => panic!("Expected Error, got {:?}", other),
        }
        assert_eq!(h.relay.hub().connection_count().await, 1);
    }

    #[tokio::test]
    async fn test_system_message_is_echoed() {
        let h = Harness::new(&[]);
        let (id, _rx) = h.session().await;

        let reply = h
            .send(
                &id,
                json!({"type":"system","payload":{"status":"ping","message":"hello"}}),
            )
            .await;
        assert_eq!(
            reply,
            Some(json!({"type":"system","payload":{"status":"ping","message":"hello"}}))
        );
    }

    #[tokio::test]
    async fn test_notification_reaches_subscribers() {
        let h = Harness::new(&["X1"]);
        let (s1, mut rx1) = h.session().await;
        let (s2, mut rx2) = h.session().await;

        h.send(&s1, json!({"type":"command","payload":{"cmd":"connect","target":"X1"}}))
            .await;
        for id in [&s1, &s2] {
            h.send(
                id,
                json!({"type":"query","payload":{"info":"position","target":"X1","notify":true}}),
            )
            .await;
        }

        // Fire from a foreign thread, as a radio stack would
        let transport = Arc::clone(&h.transport);
        std::thread::spawn(move || {
            transport.notify(
                "X1",
                Notification::Position(Position {
                    x: 10,
                    y: 20,
                    angle: 90,
                }),
            )
        })
        .join()
        .unwrap();

        let expected = json!({"type":"response","payload":{
            "info":"position","target":"X1","notify":true,
            "position":{"x":10,"y":20,"angle":90,"on_mat":true}
        }});
        assert_eq!(recv_json(&mut rx1).await, expected);
        assert_eq!(recv_json(&mut rx2).await, expected);

        let record = h.relay.registry().get("X1").await.unwrap();
        assert_eq!(
            record.snapshot(),
            PositionSnapshot {
                x: Some(10),
                y: Some(20),
                angle: Some(90),
                on_mat: true
            }
        );
    }

    #[tokio::test]
    async fn test_link_lost_ends_subscriptions() {
        let h = Harness::new(&["X1"]);
        let (s1, mut rx1) = h.session().await;

        h.send(&s1, json!({"type":"command","payload":{"cmd":"connect","target":"X1"}}))
            .await;
        h.send(
            &s1,
            json!({"type":"query","payload":{"info":"position","target":"X1","notify":true}}),
        )
        .await;

        h.transport.notify("X1", Notification::LinkLost);

        let expected =
            ServerMessage::Response(QueryResponse::termination("X1", REASON_LINK_LOST));
        let expected: Value = serde_json::from_str(&expected.to_json().unwrap()).unwrap();
        assert_eq!(recv_json(&mut rx1).await, expected);
        assert!(!h.relay.registry().contains("X1").await);
        assert_eq!(h.relay.hub().subscriber_count("X1").await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_devices() {
        let h = Harness::new(&["X1", "X2"]);
        let (s1, _rx) = h.session().await;
        for target in ["X1", "X2"] {
            h.send(&s1, json!({"type":"command","payload":{"cmd":"connect","target":target}}))
                .await;
        }

        h.relay.shutdown().await;
        assert!(h.relay.registry().is_empty().await);
        assert_eq!(h.transport.disconnect_calls(), 2);
    }
}
