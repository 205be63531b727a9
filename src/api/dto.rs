//! Data Transfer Objects
//!
//! Response types for the HTTP endpoints, serialized to JSON.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::device::DeviceRecord;
use crate::protocol::PositionSnapshot;

// ============================================
// DEVICE DTOs
// ============================================

/// One registered device
#[derive(Debug, Serialize)]
pub struct DeviceSummary {
    /// External device identifier
    pub target: String,
    /// Advertised device name
    pub name: String,
    /// Last-known position
    pub position: PositionSnapshot,
    /// Sessions subscribed to position updates
    pub subscribers: usize,
    /// When the relay connected the device
    pub connected_at: DateTime<Utc>,
}

impl DeviceSummary {
    pub fn new(record: &DeviceRecord, subscribers: usize) -> Self {
        Self {
            target: record.target_id.clone(),
            name: record.name.clone(),
            position: record.snapshot(),
            subscribers,
            connected_at: record.connected_at,
        }
    }
}

/// Device list response
#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<DeviceSummary>,
    pub total: usize,
}

// ============================================
// HEALTH DTOs
// ============================================

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status
    pub status: String,
    /// Registered devices
    pub devices: usize,
    /// Open WebSocket sessions
    pub sessions: usize,
    /// Server uptime in seconds
    pub uptime_seconds: u64,
    /// Application version
    pub version: String,
}
