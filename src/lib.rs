//! # Swarm Relay
//!
//! WebSocket relay between client applications and a swarm of small robotic
//! cubes. Clients send JSON commands and queries over a WebSocket; the relay
//! drives the cubes through a [`device::DeviceTransport`] and pushes position
//! updates to every session that subscribed to a cube.
//!
//! ## Modules
//!
//! - [`protocol`]: JSON envelopes on the wire
//! - [`device`]: transport trait, device registry, simulated and mock transports
//! - [`hub`]: sessions, subscription index and broadcast
//! - [`relay`]: command dispatch, query handling, device event loop
//! - [`session`]: WebSocket session lifecycle
//! - [`api`]: axum router, health and device routes
//! - [`config`]: TOML config with environment overrides
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use swarm_relay::api::{serve, ApiConfig, AppState};
//! use swarm_relay::device::{SimulatedCube, SimulatedTransport};
//! use swarm_relay::relay::{Relay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(SimulatedTransport::new(
//!         vec![SimulatedCube::new("A1", 90)],
//!         Duration::from_millis(100),
//!     ));
//!     let relay = Relay::new(transport, RelayConfig::default());
//!
//!     let config = ApiConfig::default();
//!     serve(AppState::new(Arc::clone(&relay), config.clone()), &config).await?;
//!
//!     relay.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod device;
pub mod hub;
pub mod protocol;
pub mod relay;
pub mod session;

pub use api::{build_router, serve, ApiConfig, ApiError, AppState};

pub use config::{Config, ConfigError, DeviceConfig, LoggingConfig, ServerConfig};

pub use device::{
    DeviceRegistry, DeviceTransport, MockTransport, Notification, SimulatedCube,
    SimulatedTransport, TransportError,
};

pub use hub::{ConnectionHub, HubConfig, HubError, SubscriptionIndex};

pub use protocol::{ClientMessage, ServerMessage};

pub use relay::{Relay, RelayConfig};

pub use session::websocket_handler;
