//! Device Registry
//!
//! Maps target ids to live device connections. This is the single authority
//! for "does this relay currently own device X".
//!
//! Connect, disconnect and link-loss handling for the same target are
//! serialized through a per-target gate, so concurrent duplicate connects
//! result in one transport connect and one notification handler. The
//! transport sequence itself runs in a spawned task: if the requesting
//! session goes away mid-operation the device still ends up either fully
//! registered or not registered at all.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};

use super::{
    DeviceEvent, DeviceHandle, DeviceTransport, Notification, NotificationHandler, Position,
};
use crate::hub::ConnectionHub;
use crate::protocol::PositionSnapshot;

/// Reason given to subscribers when a client disconnects a device
pub const REASON_DISCONNECTED: &str = "Device disconnected";

/// Reason given to subscribers when the transport reports a dropped link
pub const REASON_LINK_LOST: &str = "Device connection lost";

/// One registered device and its last-known state
#[derive(Debug, Clone)]
pub struct DeviceRecord {
    pub target_id: String,
    pub name: String,
    pub handle: DeviceHandle,
    /// Last reported position, `None` until the first notification
    pub position: Option<Position>,
    pub on_mat: bool,
    pub connected_at: DateTime<Utc>,
}

impl DeviceRecord {
    fn new(target_id: &str, handle: DeviceHandle) -> Self {
        Self {
            target_id: target_id.to_string(),
            name: handle.name.clone(),
            handle,
            position: None,
            on_mat: false,
            connected_at: Utc::now(),
        }
    }

    /// Position as reported to clients
    pub fn snapshot(&self) -> PositionSnapshot {
        PositionSnapshot {
            x: self.position.map(|p| p.x),
            y: self.position.map(|p| p.y),
            angle: self.position.map(|p| p.angle),
            on_mat: self.on_mat,
        }
    }

    fn apply(&mut self, notification: Notification) {
        match notification {
            Notification::Position(position) => {
                self.position = Some(position);
                self.on_mat = true;
            }
            Notification::Missed => self.on_mat = false,
            Notification::LinkLost => {}
        }
    }
}

/// Successful outcome of a connect request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The device was scanned, connected and registered
    Connected,
    /// The device was already registered; nothing was done
    AlreadyConnected,
}

/// Registry of connected devices
pub struct DeviceRegistry {
    transport: Arc<dyn DeviceTransport>,
    hub: Arc<ConnectionHub>,
    /// Registered devices: target → record
    devices: RwLock<HashMap<String, DeviceRecord>>,
    /// Per-target gates for connect/disconnect/link-loss
    gates: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    /// Hand-off from notification callbacks into the relay
    events: mpsc::UnboundedSender<DeviceEvent>,
    scan_timeout: Duration,
}

impl DeviceRegistry {
    pub fn new(
        transport: Arc<dyn DeviceTransport>,
        hub: Arc<ConnectionHub>,
        events: mpsc::UnboundedSender<DeviceEvent>,
        scan_timeout: Duration,
    ) -> Self {
        Self {
            transport,
            hub,
            devices: RwLock::new(HashMap::new()),
            gates: Mutex::new(HashMap::new()),
            events,
            scan_timeout,
        }
    }

    /// Connect a device, or succeed immediately if it is already registered
    pub async fn connect(self: &Arc<Self>, target_id: &str) -> Result<ConnectOutcome, RegistryError> {
        let registry = Arc::clone(self);
        let target = target_id.to_string();

        tokio::spawn(async move {
            let gate = registry.gate(&target).await;
            let outcome = {
                let _guard = gate.lock().await;
                registry.connect_locked(&target).await
            };
            registry.release_gate(&target, gate).await;
            outcome
        })
        .await
        .map_err(|e| {
            tracing::error!(device = %target_id, error = %e, "Connect task failed");
            RegistryError::ConnectFailed
        })?
    }

    /// Disconnect a registered device and end its subscriptions
    pub async fn disconnect(self: &Arc<Self>, target_id: &str) -> Result<(), RegistryError> {
        let registry = Arc::clone(self);
        let target = target_id.to_string();

        tokio::spawn(async move {
            let gate = registry.gate(&target).await;
            let outcome = {
                let _guard = gate.lock().await;
                registry.disconnect_locked(&target).await
            };
            registry.release_gate(&target, gate).await;
            outcome
        })
        .await
        .map_err(|e| {
            tracing::error!(device = %target_id, error = %e, "Disconnect task failed");
            RegistryError::DisconnectFailed
        })?
    }

    /// Forget a device whose link dropped and end its subscriptions
    ///
    /// Returns false if the device was not registered.
    pub async fn drop_lost(&self, target_id: &str) -> bool {
        let gate = self.gate(target_id).await;
        let removed = {
            let _guard = gate.lock().await;
            let removed = self.devices.write().await.remove(target_id).is_some();
            if removed {
                tracing::warn!(device = %target_id, "Device link lost");
                self.hub.notify_termination(target_id, REASON_LINK_LOST).await;
            }
            removed
        };
        self.release_gate(target_id, gate).await;
        removed
    }

    /// Apply a notification to a device's state
    ///
    /// Returns the updated snapshot, or `None` if the device is not registered.
    pub async fn apply_notification(
        &self,
        target_id: &str,
        notification: Notification,
    ) -> Option<PositionSnapshot> {
        let mut devices = self.devices.write().await;
        let record = devices.get_mut(target_id)?;
        record.apply(notification);
        Some(record.snapshot())
    }

    /// Get a copy of a device record
    pub async fn get(&self, target_id: &str) -> Option<DeviceRecord> {
        self.devices.read().await.get(target_id).cloned()
    }

    /// Get the transport handle of a registered device
    pub async fn handle(&self, target_id: &str) -> Option<DeviceHandle> {
        self.devices
            .read()
            .await
            .get(target_id)
            .map(|record| record.handle.clone())
    }

    pub async fn contains(&self, target_id: &str) -> bool {
        self.devices.read().await.contains_key(target_id)
    }

    /// All registered devices, ordered by target id
    pub async fn list(&self) -> Vec<DeviceRecord> {
        let mut records: Vec<DeviceRecord> = self.devices.read().await.values().cloned().collect();
        records.sort_by(|a, b| a.target_id.cmp(&b.target_id));
        records
    }

    pub async fn len(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.devices.read().await.is_empty()
    }

    /// Disconnect every registered device, best effort
    pub async fn disconnect_all(self: &Arc<Self>) {
        let targets: Vec<String> = self.devices.read().await.keys().cloned().collect();
        for target in targets {
            if let Err(e) = self.disconnect(&target).await {
                tracing::warn!(device = %target, error = %e, "Failed to disconnect on shutdown");
            }
        }
    }

    async fn connect_locked(&self, target_id: &str) -> Result<ConnectOutcome, RegistryError> {
        if self.devices.read().await.contains_key(target_id) {
            tracing::debug!(device = %target_id, "Device already connected");
            return Ok(ConnectOutcome::AlreadyConnected);
        }

        let ids = [target_id.to_string()];
        let found = match tokio::time::timeout(self.scan_timeout, self.transport.scan(&ids)).await
        {
            Ok(Ok(found)) => found,
            Ok(Err(e)) => {
                tracing::warn!(device = %target_id, error = %e, "Scan failed");
                return Err(RegistryError::NotFound);
            }
            Err(_) => {
                tracing::warn!(device = %target_id, "Scan timed out");
                return Err(RegistryError::NotFound);
            }
        };
        let descriptor = found.into_iter().next().ok_or(RegistryError::NotFound)?;

        let handle = self.transport.connect(&descriptor).await.map_err(|e| {
            tracing::warn!(device = %target_id, error = %e, "Connect failed");
            RegistryError::ConnectFailed
        })?;

        let handler = self.notification_handler(target_id);
        if let Err(e) = self
            .transport
            .register_notification_handler(&handle, handler)
            .await
        {
            tracing::warn!(device = %target_id, error = %e, "Notification setup failed");
            if let Err(e) = self.transport.disconnect(&handle).await {
                tracing::warn!(device = %target_id, error = %e, "Cleanup disconnect failed");
            }
            return Err(RegistryError::NotificationSetup);
        }

        self.devices
            .write()
            .await
            .insert(target_id.to_string(), DeviceRecord::new(target_id, handle.clone()));

        tracing::info!(
            device = %target_id,
            name = %handle.name,
            transport = self.transport.name(),
            "Device connected"
        );
        Ok(ConnectOutcome::Connected)
    }

    async fn disconnect_locked(&self, target_id: &str) -> Result<(), RegistryError> {
        let handle = self
            .handle(target_id)
            .await
            .ok_or(RegistryError::NotConnected)?;

        match self.transport.disconnect(&handle).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(device = %target_id, "Transport refused disconnect");
                return Err(RegistryError::DisconnectFailed);
            }
            Err(e) => {
                tracing::warn!(device = %target_id, error = %e, "Disconnect failed");
                return Err(RegistryError::DisconnectFailed);
            }
        }

        self.devices.write().await.remove(target_id);
        self.hub
            .notify_termination(target_id, REASON_DISCONNECTED)
            .await;

        tracing::info!(device = %target_id, "Device disconnected");
        Ok(())
    }

    /// Build the callback handed to the transport
    ///
    /// The callback may run on any thread; it only enqueues an event.
    fn notification_handler(&self, target_id: &str) -> NotificationHandler {
        let events = self.events.clone();
        let target = target_id.to_string();
        Arc::new(move |notification| {
            let event = DeviceEvent {
                target: target.clone(),
                notification,
            };
            if events.send(event).is_err() {
                tracing::trace!(device = %target, "Relay event loop gone, notification dropped");
            }
        })
    }

    async fn gate(&self, target_id: &str) -> Arc<Mutex<()>> {
        let mut gates = self.gates.lock().await;
        Arc::clone(
            gates
                .entry(target_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    /// Drop the gate entry once nobody else is waiting on it
    async fn release_gate(&self, target_id: &str, gate: Arc<Mutex<()>>) {
        let mut gates = self.gates.lock().await;
        // One reference in the map, one held here
        if Arc::strong_count(&gate) <= 2 {
            gates.remove(target_id);
        }
    }

    #[cfg(test)]
    async fn gate_count(&self) -> usize {
        self.gates.lock().await.len()
    }
}

/// Errors from registry operations
///
/// The display strings are reported to clients verbatim.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Device not found")]
    NotFound,

    #[error("Failed to connect")]
    ConnectFailed,

    #[error("Failed to register notifications")]
    NotificationSetup,

    #[error("Device not connected")]
    NotConnected,

    #[error("Failed to disconnect")]
    DisconnectFailed,
}
