//! Host-side driver for AT-command Wi-Fi radio modules.
//!
//! The crate talks to an ESP8266-class module over a serial link. It splits
//! the incoming byte stream into command replies, connection notifications
//! and binary socket payloads, exposes synchronous command/response
//! primitives on top of that, and builds a device controller with a channel
//! table, bring-up and the Wi-Fi management commands of the firmware.
//!
//! The public API lives in [`api`]: build a controller with
//! [`DeviceBuilder`](api::DeviceBuilder), then open sockets and manage the
//! radio through it. The protocol layer and the boot/CLI helpers used by the
//! `atlink` binary are kept in separate, hidden modules.

pub mod api;
#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
#[doc(hidden)]
pub mod core;
pub mod error;
pub mod protocol;

pub use api::*;
pub use error::{AtError, AtResult};
