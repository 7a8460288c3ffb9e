use bytes::Bytes;

use crate::{core::task_manager::Affinity, protocol::ChannelId};

/// Messages posted by the protocol engine's read path for background delivery.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// A complete binary segment received on a channel.
    Payload { channel: ChannelId, data: Bytes },
    /// The module reported `<channel>,CLOSED`.
    ChannelClosed(ChannelId),
    /// A server connection was accepted on the channel.
    Accepted(ChannelId),
    /// The module printed its boot banner, optionally with a reset cause.
    HardwareFault { cause: Option<i32> },
}

impl Affinity for EngineEvent {
    fn affinity(&self) -> Option<usize> {
        match self {
            // A close must never overtake data already received on the channel.
            EngineEvent::Payload { channel, .. }
            | EngineEvent::ChannelClosed(channel)
            | EngineEvent::Accepted(channel) => Some(*channel),
            EngineEvent::HardwareFault { .. } => None,
        }
    }
}

/// Notifications the device controller publishes to the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceEvent {
    /// Bring-up finished; the module accepts commands.
    Booted,
    /// The module rebooted on its own.
    HardwareFault { cause: Option<i32> },
    /// Status chatter seen while waiting for a reply (`WIFI GOT IP` etc.).
    /// `index` is the message's position in the known-message table.
    Info { message: String, index: usize },
}
