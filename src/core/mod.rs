/// Plumbing shared by the protocol engine and the device controller
///
/// - Event types passed from the read path to the application
/// - Worker pool that delivers those events off the read path
/// - Formatting helpers for traffic logs
pub mod bus;
pub mod helpers;
pub mod task_manager;

pub use bus::{DeviceEvent, EngineEvent};
pub use task_manager::{Affinity, Dispatcher, WorkerPool};
