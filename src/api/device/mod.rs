mod bring_up;
mod channels;
mod wifi;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, OnceLock, Weak,
    },
    time::{Duration, Instant},
};

use flume::{Receiver, Sender, TrySendError};
use parking_lot::{Condvar, Mutex, MutexGuard, RwLock};

use self::channels::ChannelTable;
use crate::{
    api::{
        config::{DriverConfig, Timings},
        socket::ChannelSocket,
        types::{AddressInfo, FirmwareVersion},
        vocabulary::{Command, Dialect, Vocabulary},
    },
    core::{
        bus::{DeviceEvent, EngineEvent},
        task_manager::{Dispatcher, WorkerPool},
    },
    error::{AtError, AtResult},
    protocol::{
        spawn_reader, EngineOptions, LinkReader, LinkWriter, PowerLine, ProtocolEngine,
        ReaderHandle, ResetLine,
    },
};

/// Status chatter the module prints between replies, in event-index order.
pub const INFO_REPLIES: [&str; 7] = [
    "WIFI CONNECTED",
    "WIFI DISCONNECT",
    "WIFI GOT IP",
    "no ip",
    "busy s...",
    "busy p...",
    "DNS Fail",
];

const EVENT_QUEUE_DEPTH: usize = 256;

/// Receives every connection accepted by [`DeviceController::create_server`].
pub type ServerHandler = Arc<dyn Fn(ChannelSocket) + Send + Sync>;

struct Server {
    port: u16,
    handler: ServerHandler,
}

/// Drives one radio module: bring-up, the channel table and every
/// management command.
///
/// Obtained from [`DeviceBuilder`](crate::api::DeviceBuilder) as an
/// `Arc<DeviceController>`. Every public operation first waits until
/// bring-up has finished, then holds the operation lock for its whole
/// exchange with the module.
pub struct DeviceController {
    engine: Arc<ProtocolEngine>,
    config: DriverConfig,
    vocabulary: RwLock<Vocabulary>,
    firmware: RwLock<Option<FirmwareVersion>>,
    addresses: Mutex<AddressInfo>,
    channels: Mutex<ChannelTable>,
    server: Mutex<Option<Server>>,
    operation: Mutex<()>,
    ready: Mutex<bool>,
    ready_changed: Condvar,
    shutdown: AtomicBool,
    events_tx: Sender<DeviceEvent>,
    events_rx: Receiver<DeviceEvent>,
    dispatcher: Dispatcher<EngineEvent>,
    workers: WorkerPool,
    reader: Mutex<Option<ReaderHandle>>,
    power: Option<Arc<dyn PowerLine>>,
    reset_line: Option<Arc<dyn ResetLine>>,
}

impl DeviceController {
    /// Wire a controller to an already opened link and start bring-up in the
    /// background.
    pub fn start(
        config: DriverConfig,
        reader: Box<dyn LinkReader>,
        writer: Box<dyn LinkWriter>,
        power: Option<Arc<dyn PowerLine>>,
        reset_line: Option<Arc<dyn ResetLine>>,
    ) -> AtResult<Arc<Self>> {
        let target: Arc<OnceLock<Weak<DeviceController>>> = Arc::new(OnceLock::new());
        let handler_target = target.clone();
        let (workers, dispatcher) = WorkerPool::spawn(
            "atlink-dispatch",
            config.dispatch_workers,
            move |event: EngineEvent| {
                match handler_target.get().and_then(Weak::upgrade) {
                    Some(device) => device.handle_engine_event(event),
                    None => log::debug!("dropping {event:?}: controller is gone"),
                }
            },
        )?;

        let engine = Arc::new(ProtocolEngine::new(
            writer,
            dispatcher.clone(),
            EngineOptions {
                discard_wait: config.timings.discard_wait(),
                trace_bytes: config.trace_bytes,
            },
        )?);

        let (events_tx, events_rx) = flume::bounded(EVENT_QUEUE_DEPTH);
        let device = Arc::new(Self {
            engine: engine.clone(),
            channels: Mutex::new(ChannelTable::new(config.channel_count)),
            config,
            vocabulary: RwLock::new(Vocabulary::default()),
            firmware: RwLock::new(None),
            addresses: Mutex::new(AddressInfo::default()),
            server: Mutex::new(None),
            operation: Mutex::new(()),
            ready: Mutex::new(false),
            ready_changed: Condvar::new(),
            shutdown: AtomicBool::new(false),
            events_tx,
            events_rx,
            dispatcher,
            workers,
            reader: Mutex::new(None),
            power,
            reset_line,
        });
        let _ = target.set(Arc::downgrade(&device));

        let weak = Arc::downgrade(&device);
        engine.set_connect_hook(Box::new(move |channel| {
            weak.upgrade()
                .map(|device| device.accept_inbound(channel))
                .unwrap_or(false)
        }));

        *device.reader.lock() = Some(spawn_reader(engine, reader)?);
        bring_up::spawn(Arc::downgrade(&device))?;

        log::info!(
            "controller started: {} channels, {} dispatch workers",
            device.config.channel_count,
            device.workers.len()
        );
        Ok(device)
    }

    /// Device notifications. Receivers share one queue, so each event is
    /// seen by exactly one of them.
    pub fn events(&self) -> Receiver<DeviceEvent> {
        self.events_rx.clone()
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.lock()
    }

    /// Block until bring-up has finished, for at most `timeout`.
    pub fn wait_ready(&self, timeout: Duration) -> AtResult<()> {
        self.wait_until_ready(Some(Instant::now() + timeout))
    }

    pub fn dialect(&self) -> Dialect {
        self.vocabulary.read().dialect()
    }

    /// Firmware identification read during the last bring-up.
    pub fn firmware_version(&self) -> AtResult<FirmwareVersion> {
        self.wait_until_ready(None)?;
        self.firmware
            .read()
            .clone()
            .ok_or_else(|| AtError::ProtocolFault("firmware version not read yet".to_string()))
    }

    /// Addresses cached from earlier address queries.
    pub fn cached_addresses(&self) -> AddressInfo {
        self.addresses.lock().clone()
    }

    /// Stop the reader and fail every waiting and future operation with
    /// [`AtError::ShuttingDown`].
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        log::info!("controller shutting down");
        {
            let _ready = self.ready.lock();
            self.ready_changed.notify_all();
        }
        let reader = self.reader.lock().take();
        if let Some(mut reader) = reader {
            reader.stop();
        }
    }

    pub(crate) fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    fn timings(&self) -> &Timings {
        &self.config.timings
    }

    fn command(&self, command: Command) -> AtResult<&'static str> {
        self.vocabulary.read().get(command)
    }

    fn command_with(&self, command: Command, persist: bool) -> AtResult<&'static str> {
        self.vocabulary.read().lookup(command, persist)
    }

    fn wait_until_ready(&self, deadline: Option<Instant>) -> AtResult<()> {
        let mut ready = self.ready.lock();
        loop {
            if self.is_shutting_down() {
                return Err(AtError::ShuttingDown);
            }
            if *ready {
                return Ok(());
            }
            match deadline {
                Some(deadline) => {
                    if self
                        .ready_changed
                        .wait_until(&mut ready, deadline)
                        .timed_out()
                    {
                        return if *ready {
                            Ok(())
                        } else {
                            Err(AtError::timeout(None))
                        };
                    }
                }
                None => self.ready_changed.wait(&mut ready),
            }
        }
    }

    /// Wait for ready, then take the operation lock.
    fn begin(&self) -> AtResult<MutexGuard<'_, ()>> {
        self.wait_until_ready(None)?;
        Ok(self.operation.lock())
    }

    fn set_ready(&self, value: bool) {
        let mut ready = self.ready.lock();
        *ready = value;
        self.ready_changed.notify_all();
    }

    fn emit(&self, event: DeviceEvent) {
        match self.events_tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                log::debug!("event queue full, dropping {event:?}")
            }
            Err(TrySendError::Disconnected(_)) => {}
        }
    }

    /// Publish `line` as an info event if it is known status chatter.
    fn report_info(&self, line: &str) -> bool {
        match INFO_REPLIES.iter().position(|known| *known == line) {
            Some(index) => {
                log::debug!("module info: {line}");
                self.emit(DeviceEvent::Info {
                    message: line.to_string(),
                    index,
                });
                true
            }
            None => false,
        }
    }

    /// Send `text` and collect the reply lines up to `OK`. A trailing
    /// `ERROR` or `FAIL` becomes [`AtError::DeviceError`].
    fn query(&self, text: &str, timeout: Duration) -> AtResult<Vec<String>> {
        let lines = self
            .engine
            .send_and_read_until(Some(text), "OK", &["ERROR", "FAIL"], timeout)?;
        match lines.last().map(String::as_str) {
            Some("ERROR") | Some("FAIL") => Err(AtError::DeviceError {
                command: text.to_string(),
            }),
            _ => Ok(lines),
        }
    }

    fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::Payload { channel, data } => match self.socket(channel) {
                Some(socket) => socket.deliver(data),
                None => log::debug!(
                    "dropping {} bytes for channel {channel} with no socket",
                    data.len()
                ),
            },
            EngineEvent::ChannelClosed(channel) => {
                let Some(socket) = self.socket(channel) else {
                    return;
                };
                if socket.closed_by_peer() {
                    log::debug!("channel {channel} closed by peer");
                    self.channels.lock().release(channel, &socket);
                }
            }
            EngineEvent::Accepted(channel) => {
                let handler = self
                    .server
                    .lock()
                    .as_ref()
                    .map(|server| server.handler.clone());
                match (handler, self.socket(channel)) {
                    (Some(handler), Some(socket)) => handler(socket),
                    _ => log::debug!("accepted channel {channel} vanished before delivery"),
                }
            }
            EngineEvent::HardwareFault { cause } => {
                log::warn!("module rebooted unexpectedly (cause {cause:?})");
                self.emit(DeviceEvent::HardwareFault { cause });
            }
        }
    }
}

impl Drop for DeviceController {
    fn drop(&mut self) {
        self.shutdown();
    }
}
