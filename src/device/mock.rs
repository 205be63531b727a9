//! Mock Transport
//!
//! Scripted [`DeviceTransport`] for tests: counts every call, records motor
//! and LED commands, and lets a test fire notifications or inject failures.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use super::{
    DeviceDescriptor, DeviceHandle, DeviceTransport, LedColor, Notification, NotificationHandler,
    TransportError,
};

const ADDRESS_PREFIX: &str = "mock:";

/// In-memory transport with call counters and failure switches
#[derive(Default)]
pub struct MockTransport {
    /// Ids a scan can find
    available: Mutex<HashSet<String>>,
    /// Currently connected addresses
    connected: Mutex<HashSet<String>>,
    /// Notification handlers by target id
    handlers: Mutex<HashMap<String, NotificationHandler>>,
    battery_level: Mutex<u8>,
    battery_delay: Mutex<Option<Duration>>,
    connect_delay: Mutex<Option<Duration>>,
    motor_log: Mutex<Vec<(String, i64, i64)>>,
    led_log: Mutex<Vec<(String, LedColor)>>,

    fail_connect: AtomicBool,
    fail_disconnect: AtomicBool,
    fail_battery: AtomicBool,
    fail_motor: AtomicBool,
    fail_notifications: AtomicBool,

    scan_calls: AtomicUsize,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    handler_registrations: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn target_of(handle: &DeviceHandle) -> &str {
    handle
        .address
        .strip_prefix(ADDRESS_PREFIX)
        .unwrap_or(&handle.address)
}

impl MockTransport {
    /// Create a transport that can find the given ids
    pub fn new(ids: &[&str]) -> Self {
        let transport = Self::default();
        *lock(&transport.battery_level) = 80;
        lock(&transport.available).extend(ids.iter().map(|id| id.to_string()));
        transport
    }

    /// Fire a notification for a target as the radio would
    ///
    /// Returns false if no handler is registered for the target.
    pub fn notify(&self, target_id: &str, notification: Notification) -> bool {
        let handler = lock(&self.handlers).get(target_id).cloned();
        match handler {
            Some(handler) => {
                handler(notification);
                true
            }
            None => false,
        }
    }

    pub fn has_handler(&self, target_id: &str) -> bool {
        lock(&self.handlers).contains_key(target_id)
    }

    pub fn set_battery_level(&self, level: u8) {
        *lock(&self.battery_level) = level;
    }

    pub fn set_battery_delay(&self, delay: Duration) {
        *lock(&self.battery_delay) = Some(delay);
    }

    pub fn set_connect_delay(&self, delay: Duration) {
        *lock(&self.connect_delay) = Some(delay);
    }

    pub fn fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    pub fn fail_battery(&self, fail: bool) {
        self.fail_battery.store(fail, Ordering::SeqCst);
    }

    pub fn fail_motor(&self, fail: bool) {
        self.fail_motor.store(fail, Ordering::SeqCst);
    }

    pub fn fail_notifications(&self, fail: bool) {
        self.fail_notifications.store(fail, Ordering::SeqCst);
    }

    pub fn scan_calls(&self) -> usize {
        self.scan_calls.load(Ordering::SeqCst)
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn handler_registrations(&self) -> usize {
        self.handler_registrations.load(Ordering::SeqCst)
    }

    /// Motor commands received so far as `(target, left, right)`
    pub fn motor_log(&self) -> Vec<(String, i64, i64)> {
        lock(&self.motor_log).clone()
    }

    /// LED commands received so far
    pub fn led_log(&self) -> Vec<(String, LedColor)> {
        lock(&self.led_log).clone()
    }

    fn ensure_connected(&self, handle: &DeviceHandle) -> Result<(), TransportError> {
        if lock(&self.connected).contains(&handle.address) {
            Ok(())
        } else {
            Err(TransportError::Closed)
        }
    }
}

#[async_trait]
impl DeviceTransport for MockTransport {
    fn name(&self) -> &str {
        "mock"
    }

    async fn scan(&self, target_ids: &[String]) -> Result<Vec<DeviceDescriptor>, TransportError> {
        self.scan_calls.fetch_add(1, Ordering::SeqCst);
        let available = lock(&self.available);
        Ok(target_ids
            .iter()
            .filter(|id| available.contains(id.as_str()))
            .map(|id| DeviceDescriptor {
                target_id: id.clone(),
                name: format!("Mock Cube {}", id),
                address: format!("{}{}", ADDRESS_PREFIX, id),
            })
            .collect())
    }

    async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle, TransportError> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.connect_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectFailed(descriptor.address.clone()));
        }

        lock(&self.connected).insert(descriptor.address.clone());
        Ok(DeviceHandle {
            address: descriptor.address.clone(),
            name: descriptor.name.clone(),
        })
    }

    async fn disconnect(&self, handle: &DeviceHandle) -> Result<bool, TransportError> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Ok(false);
        }

        lock(&self.connected).remove(&handle.address);
        lock(&self.handlers).remove(target_of(handle));
        Ok(true)
    }

    async fn read_battery(&self, handle: &DeviceHandle) -> Result<u8, TransportError> {
        self.ensure_connected(handle)?;
        let delay = *lock(&self.battery_delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_battery.load(Ordering::SeqCst) {
            return Err(TransportError::Io("battery characteristic unreadable".to_string()));
        }
        Ok(*lock(&self.battery_level))
    }

    async fn set_motor(
        &self,
        handle: &DeviceHandle,
        left: i64,
        right: i64,
    ) -> Result<(), TransportError> {
        self.ensure_connected(handle)?;
        if self.fail_motor.load(Ordering::SeqCst) {
            return Err(TransportError::Io("motor write rejected".to_string()));
        }
        lock(&self.motor_log).push((target_of(handle).to_string(), left, right));
        Ok(())
    }

    async fn set_led(&self, handle: &DeviceHandle, color: LedColor) -> Result<(), TransportError> {
        self.ensure_connected(handle)?;
        lock(&self.led_log).push((target_of(handle).to_string(), color));
        Ok(())
    }

    async fn register_notification_handler(
        &self,
        handle: &DeviceHandle,
        handler: NotificationHandler,
    ) -> Result<(), TransportError> {
        self.ensure_connected(handle)?;
        if self.fail_notifications.load(Ordering::SeqCst) {
            return Err(TransportError::Io("notify subscription rejected".to_string()));
        }
        self.handler_registrations.fetch_add(1, Ordering::SeqCst);
        lock(&self.handlers).insert(target_of(handle).to_string(), handler);
        Ok(())
    }
}
