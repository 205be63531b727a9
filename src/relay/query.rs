//! Query Handler
//!
//! Answers `battery` and `position` queries. A `position` query also toggles
//! the sender's subscription to pushed updates for that device.

use super::Relay;
use crate::protocol::{Query, QueryRequest, QueryResponse, ServerMessage, SubscriptionChange};

impl Relay {
    pub(crate) async fn handle_query(&self, session_id: &str, request: QueryRequest) -> ServerMessage {
        let Some(target) = request.target.as_deref() else {
            return unavailable(&request, "Missing target");
        };

        let Some(record) = self.registry.get(target).await else {
            // The device is gone; a leftover subscription must not outlive it
            self.hub.unsubscribe(session_id, target).await;
            return unavailable(&request, "Device not connected");
        };

        let response = match request.query() {
            Query::Battery => {
                let read = self.transport.read_battery(&record.handle);
                match tokio::time::timeout(self.config.battery_timeout, read).await {
                    Ok(Ok(level)) => QueryResponse::battery(target, Some(level), None),
                    Ok(Err(e)) => {
                        tracing::warn!(device = %target, error = %e, "Battery read failed");
                        QueryResponse::battery(
                            target,
                            None,
                            Some("Failed to read battery level".to_string()),
                        )
                    }
                    Err(_) => {
                        tracing::warn!(
                            device = %target,
                            timeout_ms = self.config.battery_timeout.as_millis() as u64,
                            "Battery read timed out"
                        );
                        QueryResponse::battery(
                            target,
                            None,
                            Some("Timed out while reading battery level".to_string()),
                        )
                    }
                }
            }
            Query::Position => {
                match request.subscription_change() {
                    SubscriptionChange::Subscribe => {
                        if let Err(e) = self.hub.subscribe(session_id, target).await {
                            tracing::debug!(session_id = %session_id, error = %e, "Subscribe failed");
                        }
                    }
                    SubscriptionChange::Unsubscribe => {
                        self.hub.unsubscribe(session_id, target).await;
                    }
                    SubscriptionChange::Keep => {}
                }
                // A disconnect may have ended the device's subscriptions
                // while we were subscribing
                let Some(record) = self.registry.get(target).await else {
                    self.hub.unsubscribe(session_id, target).await;
                    return unavailable(&request, "Device not connected");
                };
                let notify = self.hub.is_subscribed(session_id, target).await;
                QueryResponse::position(target, notify, record.snapshot())
            }
            Query::Unknown => return unavailable(&request, "Unknown query"),
        };

        ServerMessage::Response(response)
    }
}

fn unavailable(request: &QueryRequest, message: &str) -> ServerMessage {
    ServerMessage::Response(QueryResponse::unavailable(
        request.info.clone(),
        request.target.clone(),
        message,
    ))
}

#[cfg(test)]
mod tests {
    use crate::device::{Notification, Position};
    use crate::relay::tests::{recv_json, Harness};
    use crate::relay::RelayConfig;
    use serde_json::{json, Value};
    use std::sync::Arc;
    use std::time::Duration;

    async fn connected(ids: &[&str]) -> Harness {
        let h = Harness::new(ids);
        let (id, _rx) = h.session().await;
        for target in ids {
            h.send(&id, json!({"type":"command","payload":{"cmd":"connect","target":target}}))
                .await;
        }
        h
    }

    #[tokio::test]
    async fn test_battery_level() {
        let h = connected(&["X1"]).await;
        h.transport.set_battery_level(64);
        let (id, _rx) = h.session().await;

        let reply = h
            .send(&id, json!({"type":"query","payload":{"info":"battery","target":"X1"}}))
            .await;
        assert_eq!(
            reply,
            Some(json!({"type":"response","payload":{
                "info":"battery","target":"X1","battery_level":64
            }}))
        );
    }

    #[tokio::test]
    async fn test_battery_not_connected() {
        let h = Harness::new(&["X2"]);
        let (id, _rx) = h.session().await;

        let reply = h
            .send(&id, json!({"type":"query","payload":{"info":"battery","target":"X2"}}))
            .await;
        assert_eq!(
            reply,
            Some(json!({"type":"response","payload":{
                "info":"battery","target":"X2","message":"Device not connected"
            }}))
        );
    }

    #[tokio::test]
    async fn test_battery_timeout() {
        let config = RelayConfig {
            battery_timeout: Duration::from_millis(20),
            ..RelayConfig::default()
        };
        let h = Harness::with_config(&["X1"], config);
        let (id, _rx) = h.session().await;
        h.send(&id, json!({"type":"command","payload":{"cmd":"connect","target":"X1"}}))
            .await;
        h.transport.set_battery_delay(Duration::from_millis(500));

        let reply = h
            .send(&id, json!({"type":"query","payload":{"info":"battery","target":"X1"}}))
            .await;
        assert_eq!(
            reply,
            Some(json!({"type":"response","payload":{
                "info":"battery","target":"X1","battery_level":null,
                "message":"Timed out while reading battery level"
            }}))
        );
    }

    #[tokio::test]
    async fn test_battery_read_failure() {
        let h = connected(&["X1"]).await;
        h.transport.fail_battery(true);
        let (id, _rx) = h.session().await;

        let reply = h
            .send(&id, json!({"type":"query","payload":{"info":"battery","target":"X1"}}))
            .await
            .unwrap();
        assert_eq!(reply["payload"]["battery_level"], serde_json::Value::Null);
        assert_eq!(reply["payload"]["message"], "Failed to read battery level");
    }

    #[tokio::test]
    async fn test_position_before_first_report() {
        let h = connected(&["X1"]).await;
        let (id, _rx) = h.session().await;

        let reply = h
            .send(&id, json!({"type":"query","payload":{"info":"position","target":"X1"}}))
            .await;
        assert_eq!(
            reply,
            Some(json!({"type":"response","payload":{
                "info":"position","target":"X1","notify":false,
                "position":{"x":null,"y":null,"angle":null,"on_mat":false}
            }}))
        );
    }

    #[tokio::test]
    async fn test_position_subscription_toggle() {
        let h = connected(&["X1"]).await;
        let (id, _rx) = h.session().await;
        let query = |notify: serde_json::Value| {
            let mut payload = json!({"info":"position","target":"X1"});
            if !notify.is_null() {
                payload["notify"] = notify;
            }
            json!({"type":"query","payload":payload})
        };

        // Subscribing twice leaves a single subscription
        for _ in 0..2 {
            let reply = h.send(&id, query(json!(true))).await.unwrap();
            assert_eq!(reply["payload"]["notify"], true);
        }
        assert_eq!(h.relay.hub().subscriber_count("X1").await, 1);

        // Absent notify keeps it
        let reply = h.send(&id, query(serde_json::Value::Null)).await.unwrap();
        assert_eq!(reply["payload"]["notify"], true);
        assert_eq!(h.relay.hub().subscriber_count("X1").await, 1);

        // Anything but true removes it, repeatedly
        for value in [json!(false), json!("yes")] {
            let reply = h.send(&id, query(value)).await.unwrap();
            assert_eq!(reply["payload"]["notify"], false);
        }
        assert_eq!(h.relay.hub().subscriber_count("X1").await, 0);
    }

    #[tokio::test]
    async fn test_position_reflects_latest_notification() {
        let h = connected(&["X1"]).await;
        let (id, mut rx) = h.session().await;
        h.send(
            &id,
            json!({"type":"query","payload":{"info":"position","target":"X1","notify":true}}),
        )
        .await;

        h.transport.notify(
            "X1",
            Notification::Position(Position {
                x: 120,
                y: 45,
                angle: 270,
            }),
        );
        // Wait for the pushed update so the registry is known to be current
        recv_json(&mut rx).await;
        h.transport.notify("X1", Notification::Missed);
        let pushed = recv_json(&mut rx).await;
        assert_eq!(pushed["payload"]["position"]["on_mat"], false);

        let reply = h
            .send(&id, json!({"type":"query","payload":{"info":"position","target":"X1"}}))
            .await
            .unwrap();
        assert_eq!(
            reply["payload"]["position"],
            json!({"x":120,"y":45,"angle":270,"on_mat":false})
        );
    }

    #[tokio::test]
    async fn test_query_for_missing_device_drops_stale_subscription() {
        let h = connected(&["X1"]).await;
        let (id, _rx) = h.session().await;
        h.relay.hub().subscribe(&id, "X2").await.unwrap();
        assert!(h.relay.hub().is_subscribed(&id, "X2").await);

        let reply = h
            .send(
                &id,
                json!({"type":"query","payload":{"info":"position","target":"X2","notify":true}}),
            )
            .await;
        assert_eq!(
            reply,
            Some(json!({"type":"response","payload":{
                "info":"position","target":"X2","message":"Device not connected"
            }}))
        );
        assert!(!h.relay.hub().is_subscribed(&id, "X2").await);
    }

    #[tokio::test]
    async fn test_unknown_query_and_missing_target() {
        let h = connected(&["X1"]).await;
        let (id, _rx) = h.session().await;

        let reply = h
            .send(&id, json!({"type":"query","payload":{"info":"temperature","target":"X1"}}))
            .await;
        assert_eq!(
            reply,
            Some(json!({"type":"response","payload":{
                "info":"temperature","target":"X1","message":"Unknown query"
            }}))
        );

        let reply = h
            .send(&id, json!({"type":"query","payload":{"info":"battery"}}))
            .await;
        assert_eq!(
            reply,
            Some(json!({"type":"response","payload":{
                "info":"battery","target":null,"message":"Missing target"
            }}))
        );
    }

    #[tokio::test]
    async fn test_unknown_query_for_missing_device_drops_stale_subscription() {
        let h = connected(&["X1"]).await;
        let (id, _rx) = h.session().await;
        h.relay.hub().subscribe(&id, "X2").await.unwrap();

        let reply = h
            .send(&id, json!({"type":"query","payload":{"info":"temperature","target":"X2"}}))
            .await;
        assert_eq!(
            reply,
            Some(json!({"type":"response","payload":{
                "info":"temperature","target":"X2","message":"Device not connected"
            }}))
        );
        assert!(!h.relay.hub().is_subscribed(&id, "X2").await);
    }

    #[tokio::test]
    async fn test_disconnect_while_subscribing_leaves_no_subscription() {
        let h = connected(&["X1"]).await;
        let (id, mut rx) = h.session().await;
        let hub = Arc::clone(h.relay.hub());

        // Stall the subscribe step behind a session change in progress
        let sessions = hub.lock_sessions().await;
        let query = tokio::spawn({
            let relay = Arc::clone(&h.relay);
            let id = id.clone();
            async move {
                let envelope =
                    json!({"type":"query","payload":{"info":"position","target":"X1","notify":true}});
                relay.handle_text(&id, &envelope.to_string()).await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // The device goes away before the subscription lands
        h.relay.registry().disconnect("X1").await.unwrap();
        drop(sessions);

        let reply = query.await.unwrap().unwrap();
        let reply: Value = serde_json::from_str(&reply.to_json().unwrap()).unwrap();
        assert_eq!(
            reply,
            json!({"type":"response","payload":{
                "info":"position","target":"X1","message":"Device not connected"
            }})
        );
        assert!(!hub.is_subscribed(&id, "X1").await);
        assert!(hub.subscription_snapshot().await.is_empty());
        assert!(rx.try_recv().is_err());
    }
}
