//! Device Routes
//!
//! Read-only view of the device registry.
//!
//! - GET /api/v1/devices - List registered devices
//! - GET /api/v1/devices/:target - Get one registered device

use axum::{
    extract::{Path, State},
    Json,
};
use std::sync::Arc;

use crate::api::dto::{DeviceListResponse, DeviceSummary};
use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;

/// GET /api/v1/devices
pub async fn list_devices(
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<DeviceListResponse>> {
    let hub = state.relay.hub();
    let records = state.relay.registry().list().await;

    let mut devices = Vec::with_capacity(records.len());
    for record in &records {
        let subscribers = hub.subscriber_count(&record.target_id).await;
        devices.push(DeviceSummary::new(record, subscribers));
    }

    Ok(Json(DeviceListResponse {
        total: devices.len(),
        devices,
    }))
}

/// GET /api/v1/devices/:target
pub async fn get_device(
    State(state): State<Arc<AppState>>,
    Path(target): Path<String>,
) -> ApiResult<Json<DeviceSummary>> {
    let record = state
        .relay
        .registry()
        .get(&target)
        .await
        .ok_or_else(|| ApiError::NotFound(format!("Device '{}' is not connected", target)))?;
    let subscribers = state.relay.hub().subscriber_count(&target).await;

    Ok(Json(DeviceSummary::new(&record, subscribers)))
}
