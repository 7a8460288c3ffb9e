use std::time::Duration;

use anyhow::{anyhow, Result};
use serialport::SerialPort;

use crate::protocol::link::{SerialControlLines, SerialReader, SerialWriter};

/// Open a serial port with the requested timeout, enabling exclusive access on Unix systems.
pub fn open_serial_port(
    port: &str,
    baud_rate: u32,
    timeout: Duration,
) -> Result<Box<dyn SerialPort>> {
    let builder = serialport::new(port, baud_rate).timeout(timeout);

    #[cfg(unix)]
    {
        let mut handle = builder
            .open_native()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))?;
        handle
            .set_exclusive(true)
            .map_err(|err| anyhow!("Failed to acquire exclusive access to {port}: {err}"))?;
        Ok(Box::new(handle))
    }

    #[cfg(not(unix))]
    {
        builder
            .open()
            .map_err(|err| anyhow!("Failed to open port {port}: {err}"))
    }
}

/// An opened serial port split into link halves.
pub struct SerialLink {
    pub reader: SerialReader,
    pub writer: SerialWriter,
    port_name: String,
    control: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Power and reset lines driven through the port's DTR and RTS.
    pub fn control_lines(&self) -> Result<SerialControlLines> {
        let port = self
            .control
            .try_clone()
            .map_err(|err| anyhow!("Failed to clone {} for control lines: {err}", self.port_name))?;
        // DTR is asserted when the port opens, so the module starts powered.
        Ok(SerialControlLines::new(port, true))
    }
}

/// Open `port` and split it into a reader and a writer sharing the device.
pub fn open_serial_link(port: &str, baud_rate: u32, read_timeout: Duration) -> Result<SerialLink> {
    let handle = open_serial_port(port, baud_rate, read_timeout)?;
    let clone = |handle: &dyn SerialPort| {
        handle
            .try_clone()
            .map_err(|err| anyhow!("Failed to clone handle for {port}: {err}"))
    };
    let writer = clone(handle.as_ref())?;
    let control = clone(handle.as_ref())?;
    log::debug!("opened {port} at {baud_rate} baud");

    Ok(SerialLink {
        reader: SerialReader::new(handle),
        writer: SerialWriter::new(writer),
        port_name: port.to_string(),
        control,
    })
}
