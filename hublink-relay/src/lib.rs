//! # hublink-relay: room relay for browser UIs and IoT peers
//!
//! Clients open a WebSocket with `?instanceId=<room>` (or `?deviceId=`),
//! land in the room of that name and exchange JSON messages with every other
//! member. Inbound traffic is classified and recorded in the shared
//! [`DeviceStore`](hublink_store::DeviceStore).
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   WebSocket   ┌─────────────┐        ┌──────────────┐
//! │ Device / │ ◄───────────► │ RelayServer │ ─────► │    Relay     │
//! │ Browser  │   JSON text   │ (per-conn   │        │ rooms + fan- │
//! └──────────┘               │  task)      │        │ out + record │
//!                            └─────────────┘        └──────┬───────┘
//!                                                          │
//! ┌──────────┐     HTTP      ┌─────────────┐        ┌──────▼───────┐
//! │ Browser  │ ◄───────────► │  api::router│ ─────► │ DeviceStore  │
//! └──────────┘               └─────────────┘        └──────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`]: inbound classification, envelope enrichment, notices
//! - [`room`]: room table and non-blocking fan-out
//! - [`relay`]: join / inbound / leave, atomic with store writes
//! - [`server`]: WebSocket transport and keepalive
//! - [`api`]: HTTP read/append surface over the store
//! - [`config`]: server configuration

pub mod api;
pub mod config;
pub mod protocol;
pub mod relay;
pub mod room;
pub mod server;

// Re-exports for convenience
pub use api::{router, ApiError, ApiState};
pub use config::ServerConfig;
pub use protocol::{
    enrich, ErrorNotice, Frame, Inbound, InboundMessage, Notice, ProtocolError,
};
pub use relay::{ControlAction, ControlDispatch, Relay, RelayStats, Session};
pub use room::{ConnectionId, Departure, FanOut, Room, RoomTable};
pub use server::{RelayError, RelayServer};
