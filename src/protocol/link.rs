use std::{
    io::{self, Read, Write},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use parking_lot::Mutex;
use serialport::{ClearBuffer, SerialPort};

use crate::protocol::engine::ProtocolEngine;

/// Receiving half of a byte link to the module.
///
/// `read` should block for at most a short poll interval; a timeout is
/// reported as `Ok(0)` so the reader thread can observe shutdown requests.
pub trait LinkReader: Send {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// Transmitting half of a byte link to the module.
pub trait LinkWriter: Send {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()>;

    /// Drop whatever the OS has buffered on the receive side.
    fn clear_input(&mut self) -> io::Result<()>;

    /// Kick a link that stopped answering. Serial ports flush both directions.
    fn nudge(&mut self) -> io::Result<()> {
        self.clear_input()
    }
}

/// Switchable supply for the module (typically a GPIO or a modem control line).
pub trait PowerLine: Send + Sync {
    fn is_on(&self) -> bool;
    fn set(&self, on: bool) -> io::Result<()>;
}

/// Hardware reset input of the module.
pub trait ResetLine: Send + Sync {
    fn pulse(&self, low_for: Duration) -> io::Result<()>;
}

pub struct SerialReader {
    port: Box<dyn SerialPort>,
}

impl SerialReader {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl LinkReader for SerialReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => Ok(0),
            Err(err) => Err(err),
        }
    }
}

pub struct SerialWriter {
    port: Box<dyn SerialPort>,
}

impl SerialWriter {
    pub fn new(port: Box<dyn SerialPort>) -> Self {
        Self { port }
    }
}

impl LinkWriter for SerialWriter {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.port.write_all(bytes)?;
        self.port.flush()
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::Input).map_err(io::Error::from)
    }

    fn nudge(&mut self) -> io::Result<()> {
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }
}

/// Module power and reset driven through the DTR and RTS modem lines.
///
/// Both lines are active-high from the host's point of view: DTR asserted
/// means powered, RTS asserted holds the module in reset.
pub struct SerialControlLines {
    port: Mutex<Box<dyn SerialPort>>,
    powered: AtomicBool,
}

impl SerialControlLines {
    pub fn new(port: Box<dyn SerialPort>, powered: bool) -> Self {
        Self {
            port: Mutex::new(port),
            powered: AtomicBool::new(powered),
        }
    }
}

impl PowerLine for SerialControlLines {
    fn is_on(&self) -> bool {
        self.powered.load(Ordering::Acquire)
    }

    fn set(&self, on: bool) -> io::Result<()> {
        self.port
            .lock()
            .write_data_terminal_ready(on)
            .map_err(io::Error::from)?;
        self.powered.store(on, Ordering::Release);
        Ok(())
    }
}

impl ResetLine for SerialControlLines {
    fn pulse(&self, low_for: Duration) -> io::Result<()> {
        let mut port = self.port.lock();
        port.write_request_to_send(true).map_err(io::Error::from)?;
        thread::sleep(low_for);
        port.write_request_to_send(false).map_err(io::Error::from)
    }
}

/// Owns the reader thread; dropping the handle stops it.
pub struct ReaderHandle {
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl ReaderHandle {
    pub fn is_running(&self) -> bool {
        self.thread
            .as_ref()
            .map(|handle| !handle.is_finished())
            .unwrap_or(false)
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.thread.take() {
            // Never join from the reader thread itself.
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::warn!("link reader thread panicked");
            }
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Start the thread that pumps bytes from `reader` into `engine`.
pub fn spawn_reader(
    engine: Arc<ProtocolEngine>,
    mut reader: Box<dyn LinkReader>,
) -> io::Result<ReaderHandle> {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let thread = thread::Builder::new()
        .name("atlink-reader".to_string())
        .spawn(move || {
            let mut buf = [0u8; 256];
            while !stop_flag.load(Ordering::Acquire) {
                match reader.read(&mut buf) {
                    Ok(0) => {}
                    Ok(n) => engine.feed(&buf[..n]),
                    Err(err)
                        if matches!(
                            err.kind(),
                            io::ErrorKind::BrokenPipe
                                | io::ErrorKind::NotConnected
                                | io::ErrorKind::UnexpectedEof
                        ) =>
                    {
                        log::warn!("link closed, reader exiting: {err}");
                        break;
                    }
                    Err(err) => {
                        log::warn!("link read error: {err}");
                        thread::sleep(Duration::from_millis(10));
                    }
                }
            }
            log::debug!("link reader stopped");
        })?;

    Ok(ReaderHandle {
        stop,
        thread: Some(thread),
    })
}
