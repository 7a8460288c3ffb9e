pub mod demux;
pub mod engine;
pub mod link;
pub mod ring_buffer;
pub mod simulator;

/// Index of a multiplexed socket channel on the module (`0..channel_count`).
pub type ChannelId = usize;

pub use engine::{ConnectHook, EngineOptions, ProtocolEngine};
pub use link::{spawn_reader, LinkReader, LinkWriter, PowerLine, ReaderHandle, ResetLine};
pub use ring_buffer::{RingBuffer, RingBufferError};
pub use simulator::SimulatedModule;
