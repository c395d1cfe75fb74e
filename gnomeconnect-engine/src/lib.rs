//! Typed session-bus client for the GNOMEConnect sync engine.
//!
//! The engine runs as a separate user service and owns device discovery,
//! pairing, encrypted transport and plugin message routing. This crate is the
//! shell's view of it: a `zbus` proxy plus per-capability event channels.
//! Nothing protocol-level lives here; the engine relays decoded plugin bodies
//! over the bus and this crate only gives them Rust types.

mod client;
mod device;
mod error;
mod events;

pub use client::{EngineClient, EngineConfig, EngineEvents, ENGINE_BUS_NAME, ENGINE_OBJECT_PATH};
pub use device::{Device, DeviceType, KnownDevice};
pub use error::EngineError;
pub use events::{
    BatteryEvent, CallEvent, DeviceEvent, MediaAction, MediaEvent, MirrorEvent, NowPlayingReply,
    PingEvent, SftpEvent, TelephonyEvent, BATTERY_THRESHOLD_LOW,
};

pub type Result<T> = std::result::Result<T, EngineError>;
