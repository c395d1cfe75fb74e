//! GNOMEConnect desktop integration shell.
//!
//! Bridges the device sync engine to the desktop: mirrors remote events as
//! freedesktop notifications, answers remote media-control requests against
//! local MPRIS players, and mounts sftp shares on request. The binary in
//! `main.rs` wires these pieces to the session bus and OS signals.

pub mod config;
pub mod dispatch;
pub mod media;
pub mod notify;
pub mod registry;
pub mod sftp;
pub mod store;
#[cfg(feature = "gui")]
pub mod ui;
