pub mod config;
pub mod device;
pub mod socket;
pub mod types;
pub mod utils;
pub mod vocabulary;

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};

pub use config::{DriverConfig, Timings};
pub use device::{DeviceController, ServerHandler, INFO_REPLIES};
pub use socket::{ChannelSocket, CloseCallback, DataCallback, Transport};
pub use types::{
    AccessPoint, AccessPointClient, AccessPointConfig, AddressInfo, Ecn, FirmwareVersion,
    OperatingMode,
};
pub use utils::{open_serial_link, open_serial_port, SerialLink};
pub use vocabulary::{Command, Dialect, Vocabulary};

pub use crate::core::bus::DeviceEvent;

use crate::protocol::{LinkReader, LinkWriter, PowerLine, ResetLine};

/// Builder for a [`DeviceController`].
///
/// # Example
///
/// ```no_run
/// use atlink::api::{DeviceBuilder, Transport};
///
/// let device = DeviceBuilder::new()
///     .with_port("/dev/ttyUSB0")
///     .with_baud_rate(115200)
///     .with_join_timeout(45_000)
///     .build()?;
/// device.join_access_point("home-net", "secret", false)?;
/// let socket = device.open_socket("example.com", 80, Transport::Tcp)?;
/// socket.send_str("GET / HTTP/1.0\r\n\r\n")?;
/// # Ok::<(), anyhow::Error>(())
/// ```
pub struct DeviceBuilder {
    config: DriverConfig,
    power: Option<Arc<dyn PowerLine>>,
    reset_line: Option<Arc<dyn ResetLine>>,
    serial_control_lines: bool,
}

impl Default for DeviceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceBuilder {
    pub fn new() -> Self {
        Self::from_config(DriverConfig::default())
    }

    /// Start from a loaded configuration; setters still override it.
    pub fn from_config(config: DriverConfig) -> Self {
        Self {
            config,
            power: None,
            reset_line: None,
            serial_control_lines: false,
        }
    }

    /// Set the serial port name.
    pub fn with_port(mut self, port_name: &str) -> Self {
        self.config.port_name = Some(port_name.to_string());
        self
    }

    /// Set the baud rate.
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.config.baud_rate = baud_rate;
        self
    }

    /// Poll interval of the reader thread in milliseconds.
    pub fn with_read_timeout(mut self, timeout_ms: u64) -> Self {
        self.config.read_timeout_ms = timeout_ms;
        self
    }

    pub fn with_channel_count(mut self, count: usize) -> Self {
        self.config.channel_count = count;
        self
    }

    pub fn with_dispatch_workers(mut self, workers: usize) -> Self {
        self.config.dispatch_workers = workers;
        self
    }

    /// Hex-dump link traffic at trace level.
    pub fn with_trace_bytes(mut self, enabled: bool) -> Self {
        self.config.trace_bytes = enabled;
        self
    }

    /// Set the per-reply timeout of ordinary commands in milliseconds.
    pub fn with_command_timeout(mut self, timeout_ms: u64) -> Self {
        self.config.timings.command_timeout_ms = timeout_ms;
        self
    }

    /// Set how long joining an access point may take, in milliseconds.
    pub fn with_join_timeout(mut self, timeout_ms: u64) -> Self {
        self.config.timings.join_timeout_ms = timeout_ms;
        self
    }

    /// Replace every timing at once.
    pub fn with_timings(mut self, timings: Timings) -> Self {
        self.config.timings = timings;
        self
    }

    pub fn with_power_line(mut self, power: Arc<dyn PowerLine>) -> Self {
        self.power = Some(power);
        self
    }

    pub fn with_reset_line(mut self, reset_line: Arc<dyn ResetLine>) -> Self {
        self.reset_line = Some(reset_line);
        self
    }

    /// Drive module power through DTR and reset through RTS of the serial
    /// port itself. Only used by [`build`](Self::build).
    pub fn with_serial_control_lines(mut self) -> Self {
        self.serial_control_lines = true;
        self
    }

    /// Open the configured serial port and start the controller.
    pub fn build(mut self) -> Result<Arc<DeviceController>> {
        let port = self
            .config
            .port_name
            .clone()
            .ok_or_else(|| anyhow!("no serial port configured"))?;
        let link = open_serial_link(&port, self.config.baud_rate, self.config.read_timeout())?;

        if self.serial_control_lines {
            let lines = Arc::new(link.control_lines()?);
            if self.power.is_none() {
                self.power = Some(lines.clone());
            }
            if self.reset_line.is_none() {
                self.reset_line = Some(lines);
            }
        }

        let SerialLink { reader, writer, .. } = link;
        self.build_with_link(Box::new(reader), Box::new(writer))
            .with_context(|| format!("failed to start driver on {port}"))
    }

    /// Start the controller on an already opened link.
    pub fn build_with_link(
        self,
        reader: Box<dyn LinkReader>,
        writer: Box<dyn LinkWriter>,
    ) -> Result<Arc<DeviceController>> {
        self.config.validate()?;
        let device =
            DeviceController::start(self.config, reader, writer, self.power, self.reset_line)?;
        Ok(device)
    }
}
