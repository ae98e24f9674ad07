//! # hublink-store: device registry and history ledger
//!
//! Process-wide, in-memory record of every device that has talked to the
//! relay, plus three append-only histories per device:
//!
//! - [`Operation`]s: requested or observed actions (`pending` → `success`/`failed`)
//! - [`DeviceLog`]s: diagnostic entries
//! - [`Interaction`]s: raw inbound/outbound traffic
//!
//! Nothing is persisted; all state is lost when the process exits.

pub mod id;
pub mod store;
pub mod types;

pub use id::IdGenerator;
pub use store::{DeviceStore, StoreConfig};
pub use types::{
    Device, DeviceHistory, DeviceLog, DeviceStatus, Direction, Interaction, LogLevel, Operation,
    OperationStatus,
};
