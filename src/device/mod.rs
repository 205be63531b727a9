//! Devices
//!
//! The relay never speaks BLE itself. Everything it needs from the radio
//! side goes through [`DeviceTransport`]: scanning, connecting, motors,
//! LEDs, battery reads and position notifications.
//!
//! ## Components
//!
//! - **DeviceTransport**: capability trait implemented by a radio backend
//! - **DeviceRegistry**: the single owner of "which devices does this relay hold"
//! - **SimulatedTransport**: virtual cubes for running without hardware
//! - **MockTransport**: scripted transport for tests
//!
//! Notification callbacks run on whatever thread the transport chooses. They
//! only forward a [`DeviceEvent`] into the relay's event channel; all state
//! changes happen on the relay side of that channel.

mod mock;
mod registry;
mod simulated;

pub use mock::MockTransport;
pub use registry::{
    ConnectOutcome, DeviceRecord, DeviceRegistry, RegistryError, REASON_DISCONNECTED,
    REASON_LINK_LOST,
};
pub use simulated::{SimulatedCube, SimulatedTransport};

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;

/// A device found by a scan, ready to be connected
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    /// External identifier the device was scanned for
    pub target_id: String,
    /// Advertised device name
    pub name: String,
    /// Transport-level address
    pub address: String,
}

/// Live connection to one device
///
/// Opaque to the relay: only the transport that issued it interprets it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceHandle {
    pub address: String,
    pub name: String,
}

/// Absolute position on the play mat
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Position {
    pub x: i32,
    pub y: i32,
    pub angle: i32,
}

/// Notification pushed by a device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Notification {
    /// Device read its position from the mat
    Position(Position),
    /// Device lost sight of the mat
    Missed,
    /// Link to the device dropped
    LinkLost,
}

/// Event forwarded from a notification callback into the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub target: String,
    pub notification: Notification,
}

/// Callback a transport invokes for every device notification
pub type NotificationHandler = Arc<dyn Fn(Notification) + Send + Sync>;

/// RGB color for the indicator LED
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LedColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

/// Capabilities the relay consumes from a device backend
#[async_trait]
pub trait DeviceTransport: Send + Sync + 'static {
    /// Human-readable backend name
    fn name(&self) -> &str;

    /// Scan for the given device ids
    async fn scan(&self, target_ids: &[String]) -> Result<Vec<DeviceDescriptor>, TransportError>;

    /// Connect to a scanned device
    async fn connect(&self, descriptor: &DeviceDescriptor) -> Result<DeviceHandle, TransportError>;

    /// Disconnect a device; `Ok(false)` means the backend refused
    async fn disconnect(&self, handle: &DeviceHandle) -> Result<bool, TransportError>;

    /// Read the battery level in percent
    async fn read_battery(&self, handle: &DeviceHandle) -> Result<u8, TransportError>;

    /// Drive the motors with raw speeds
    async fn set_motor(&self, handle: &DeviceHandle, left: i64, right: i64)
        -> Result<(), TransportError>;

    /// Turn the LED on with the given color (no duration limit)
    async fn set_led(&self, handle: &DeviceHandle, color: LedColor) -> Result<(), TransportError>;

    /// Register the callback for position notifications
    async fn register_notification_handler(
        &self,
        handle: &DeviceHandle,
        handler: NotificationHandler,
    ) -> Result<(), TransportError>;
}

/// Errors raised by a device transport
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("Device not found: {0}")]
    NotFound(String),

    #[error("Connection failed: {0}")]
    ConnectFailed(String),

    #[error("Device I/O error: {0}")]
    Io(String),

    #[error("Operation timed out")]
    Timeout,

    #[error("Device link closed")]
    Closed,
}
