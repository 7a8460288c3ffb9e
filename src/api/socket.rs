use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::{
    api::device::DeviceController,
    error::{AtError, AtResult},
    protocol::ChannelId,
};

/// Invoked on a dispatch worker for every received segment.
pub type DataCallback = Box<dyn Fn(&ChannelSocket, Bytes) + Send + Sync>;
/// Invoked on a dispatch worker when the peer closes the connection.
pub type CloseCallback = Box<dyn FnOnce(&ChannelSocket) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    Tcp,
    Udp,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Tcp => "TCP",
            Transport::Udp => "UDP",
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

struct SocketShared {
    id: ChannelId,
    host: Option<String>,
    port: u16,
    transport: Transport,
    connected: AtomicBool,
    disposed: AtomicBool,
    on_data: RwLock<Option<DataCallback>>,
    on_closed: Mutex<Option<CloseCallback>>,
    device: Weak<DeviceController>,
}

/// One multiplexed connection on the module.
///
/// Handles are cheap clones of the same socket. The socket keeps only a weak
/// reference to its controller; once the controller is gone every operation
/// fails with [`AtError::ShuttingDown`].
#[derive(Clone)]
pub struct ChannelSocket {
    shared: Arc<SocketShared>,
}

impl ChannelSocket {
    pub(crate) fn outbound(
        device: Weak<DeviceController>,
        id: ChannelId,
        host: &str,
        port: u16,
        transport: Transport,
    ) -> Self {
        Self::build(device, id, Some(host.to_string()), port, transport, false)
    }

    pub(crate) fn inbound(device: Weak<DeviceController>, id: ChannelId, port: u16) -> Self {
        // The module does not say which transport an accepted link uses.
        Self::build(device, id, None, port, Transport::Tcp, true)
    }

    fn build(
        device: Weak<DeviceController>,
        id: ChannelId,
        host: Option<String>,
        port: u16,
        transport: Transport,
        connected: bool,
    ) -> Self {
        Self {
            shared: Arc::new(SocketShared {
                id,
                host,
                port,
                transport,
                connected: AtomicBool::new(connected),
                disposed: AtomicBool::new(false),
                on_data: RwLock::new(None),
                on_closed: Mutex::new(None),
                device,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.shared.id
    }

    /// Remote host, `None` for connections accepted by a server.
    pub fn host(&self) -> Option<&str> {
        self.shared.host.as_deref()
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn transport(&self) -> Transport {
        self.shared.transport
    }

    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire)
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Whether two handles refer to the same socket.
    pub fn ptr_eq(&self, other: &ChannelSocket) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn on_data<F>(&self, callback: F)
    where
        F: Fn(&ChannelSocket, Bytes) + Send + Sync + 'static,
    {
        *self.shared.on_data.write() = Some(Box::new(callback));
    }

    pub fn on_closed<F>(&self, callback: F)
    where
        F: FnOnce(&ChannelSocket) + Send + 'static,
    {
        *self.shared.on_closed.lock() = Some(Box::new(callback));
    }

    /// Re-establish the connection on this socket's channel.
    pub fn open(&self) -> AtResult<()> {
        self.device()?.reopen_socket(self)
    }

    pub fn send(&self, payload: &[u8]) -> AtResult<()> {
        self.device()?.send_payload(self.id(), payload)
    }

    pub fn send_str(&self, text: &str) -> AtResult<()> {
        self.send(text.as_bytes())
    }

    /// Ask the module to close the connection. Does nothing unless the
    /// socket is connected.
    pub fn close(&self) -> AtResult<()> {
        if self.is_disposed() {
            return Err(AtError::SocketDisposed);
        }
        if !self.shared.connected.swap(false, Ordering::AcqRel) {
            return Ok(());
        }
        let device = self
            .shared
            .device
            .upgrade()
            .ok_or(AtError::ShuttingDown)?;
        device.close_channel(self.id())
    }

    /// Close (ignoring errors) and give the channel back.
    pub fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.shared.connected.swap(false, Ordering::AcqRel) {
            if let Some(device) = self.shared.device.upgrade() {
                if let Err(err) = device.close_channel(self.id()) {
                    log::debug!("close of channel {} during dispose failed: {err}", self.id());
                }
            }
        }
        if let Some(device) = self.shared.device.upgrade() {
            device.release_channel(self);
        }
        self.shared.on_data.write().take();
        self.shared.on_closed.lock().take();
    }

    fn device(&self) -> AtResult<Arc<DeviceController>> {
        if self.is_disposed() {
            return Err(AtError::SocketDisposed);
        }
        self.shared.device.upgrade().ok_or(AtError::ShuttingDown)
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.shared.connected.store(connected, Ordering::Release);
    }

    pub(crate) fn deliver(&self, data: Bytes) {
        match self.shared.on_data.read().as_ref() {
            Some(callback) => callback(self, data),
            None => log::debug!(
                "dropping {} bytes on channel {}: no data handler",
                data.len(),
                self.id()
            ),
        }
    }

    /// Handle `<id>,CLOSED`. Returns `false` when the socket was not
    /// connected, i.e. the notification acknowledges a local close.
    pub(crate) fn closed_by_peer(&self) -> bool {
        if !self.shared.connected.swap(false, Ordering::AcqRel) {
            return false;
        }
        let callback = self.shared.on_closed.lock().take();
        if let Some(callback) = callback {
            callback(self);
        }
        true
    }
}

impl fmt::Debug for ChannelSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelSocket")
            .field("id", &self.shared.id)
            .field("host", &self.shared.host)
            .field("port", &self.shared.port)
            .field("transport", &self.shared.transport)
            .field("connected", &self.is_connected())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
