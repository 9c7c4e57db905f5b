//! Aeropendulum gateway: real-time telemetry and control relay.
//!
//! This service:
//! - Subscribes to the device state subject on NATS
//! - Decodes fixed-layout little-endian `f32` frames into named records
//! - Broadcasts each record to every connected WebSocket client
//! - Publishes client control events (PID gains, setpoints) back to the device
//!
//! ## Architecture
//!
//! ```text
//! NATS: aeropendulo.esp32.state ──► Relay ──► ClientRegistry ──► WebSocket clients
//!                                    ▲
//! NATS: aeropendulo.esp32.<event> ◄──┘◄── control events ◄───── WebSocket clients
//! ```

pub mod bus;
pub mod client;
pub mod codec;
pub mod config;
pub mod control;
pub mod error;
pub mod protocol;
pub mod relay;
pub mod telemetry;
pub mod ws_server;

pub use bus::{Bus, BusSubscription};
pub use client::{ClientId, ClientRegistry, ClientState};
pub use config::{GatewayConfig, ReconnectPolicy, RelayConfig};
pub use control::{ControlOutcome, ControlPublisher};
pub use error::{GatewayError, Result};
pub use protocol::{ClientEvent, ServerEvent};
pub use relay::{Relay, RelayState, RelayStats};
pub use telemetry::{Layout, TelemetryDecoder, TelemetryRecord};
pub use ws_server::{create_router, AppState};
