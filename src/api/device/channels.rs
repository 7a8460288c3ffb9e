use std::{sync::Arc, thread};

use super::{DeviceController, Server, ServerHandler};
use crate::{
    api::{
        socket::{ChannelSocket, Transport},
        vocabulary::Command,
    },
    core::bus::EngineEvent,
    error::{AtError, AtResult},
    protocol::ChannelId,
};

const CONNECT_REPLY: &str = "CONNECT";
const DNS_FAIL_REPLY: &str = "DNS Fail";

/// Local view of the module's socket channels.
pub(crate) struct ChannelTable {
    slots: Vec<Option<ChannelSocket>>,
    last_used: Option<ChannelId>,
    last_freed: Option<ChannelId>,
}

impl ChannelTable {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            slots: vec![None; count],
            last_used: None,
            last_freed: None,
        }
    }

    pub(crate) fn get(&self, id: ChannelId) -> Option<ChannelSocket> {
        self.slots.get(id).cloned().flatten()
    }

    pub(crate) fn occupied(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    /// Claim a free channel for the socket built by `make`.
    ///
    /// The scan starts after the last channel handed out and passes over the
    /// most recently freed one while any other channel is free; the module
    /// misbehaves when a channel is reused right after closing.
    pub(crate) fn allocate(
        &mut self,
        make: impl FnOnce(ChannelId) -> ChannelSocket,
    ) -> AtResult<ChannelSocket> {
        let count = self.slots.len();
        if count == 0 {
            return Err(AtError::ChannelExhausted);
        }
        let start = self.last_used.map_or(0, |used| (used + 1) % count);

        let mut fallback = None;
        let mut chosen = None;
        for offset in 0..count {
            let id = (start + offset) % count;
            if self.slots[id].is_some() {
                continue;
            }
            if Some(id) == self.last_freed {
                fallback = Some(id);
                continue;
            }
            chosen = Some(id);
            break;
        }

        let id = chosen.or(fallback).ok_or(AtError::ChannelExhausted)?;
        let socket = make(id);
        self.slots[id] = Some(socket.clone());
        self.last_used = Some(id);
        Ok(socket)
    }

    /// Put `socket` into its channel if that channel is free.
    pub(crate) fn insert(&mut self, socket: &ChannelSocket) -> bool {
        match self.slots.get_mut(socket.id()) {
            Some(slot) if slot.is_none() => {
                *slot = Some(socket.clone());
                true
            }
            _ => false,
        }
    }

    /// Free `id` if it still holds `expected`.
    pub(crate) fn release(&mut self, id: ChannelId, expected: &ChannelSocket) -> bool {
        match self.slots.get_mut(id) {
            Some(slot) if slot.as_ref().is_some_and(|held| held.ptr_eq(expected)) => {
                *slot = None;
                self.last_freed = Some(id);
                true
            }
            _ => false,
        }
    }

    /// Empty every channel, returning the sockets that held one.
    pub(crate) fn drain(&mut self) -> Vec<ChannelSocket> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }
}

impl DeviceController {
    /// Connect to `host:port` on a free channel.
    pub fn open_socket(
        self: &Arc<Self>,
        host: &str,
        port: u16,
        transport: Transport,
    ) -> AtResult<ChannelSocket> {
        if host.is_empty() {
            return Err(AtError::InvalidArgument("host must not be empty".to_string()));
        }
        let _op = self.begin()?;
        let socket = self.channels.lock().allocate(|id| {
            ChannelSocket::outbound(Arc::downgrade(self), id, host, port, transport)
        })?;
        log::debug!("channel {} allocated for {transport} {host}:{port}", socket.id());

        if let Err(err) = self.open_channel(&socket) {
            self.channels.lock().release(socket.id(), &socket);
            return Err(err);
        }
        Ok(socket)
    }

    /// Socket currently holding channel `id`.
    pub fn socket(&self, id: ChannelId) -> Option<ChannelSocket> {
        self.channels.lock().get(id)
    }

    pub fn channels_in_use(&self) -> usize {
        self.channels.lock().occupied()
    }

    /// Accept inbound connections on `port`, handing each to `handler` on a
    /// dispatch worker.
    pub fn create_server<F>(&self, port: u16, handler: F) -> AtResult<()>
    where
        F: Fn(ChannelSocket) + Send + Sync + 'static,
    {
        let _op = self.begin()?;
        let command = format!("{}1,{port}", self.command(Command::Server)?);
        self.engine.send_and_expect_with(
            &command,
            &["no change"],
            "OK",
            self.timings().command_timeout(),
        )?;
        let handler: ServerHandler = Arc::new(handler);
        *self.server.lock() = Some(Server { port, handler });
        log::info!("listening on port {port}");
        Ok(())
    }

    /// Stop accepting connections. The module only forgets its server on
    /// reset, so this resets it.
    pub fn delete_server(&self) -> AtResult<()> {
        self.server.lock().take();
        self.reset(false)
    }

    pub(crate) fn reopen_socket(&self, socket: &ChannelSocket) -> AtResult<()> {
        if socket.host().is_none() {
            return Err(AtError::InvalidArgument(
                "accepted connections cannot be reopened".to_string(),
            ));
        }
        let _op = self.begin()?;
        {
            let mut channels = self.channels.lock();
            match channels.get(socket.id()) {
                Some(held) if held.ptr_eq(socket) => {}
                Some(_) => {
                    return Err(AtError::ProtocolFault(format!(
                        "channel {} is held by another socket",
                        socket.id()
                    )))
                }
                None => {
                    channels.insert(socket);
                }
            }
        }

        if let Err(err) = self.open_channel(socket) {
            self.channels.lock().release(socket.id(), socket);
            return Err(err);
        }
        Ok(())
    }

    /// Issue the session start for `socket` and wait for the module to
    /// confirm the channel. Does not touch the channel table.
    fn open_channel(&self, socket: &ChannelSocket) -> AtResult<()> {
        let id = socket.id();
        let host = socket.host().unwrap_or_default();
        let timings = self.timings();
        let command = format!(
            "{}{id},\"{}\",\"{host}\",{}",
            self.command(Command::SessionStart)?,
            socket.transport(),
            socket.port()
        );
        let linked = self.command(Command::LinkedReply).ok();
        let is_connect =
            |reply: &str| reply.contains(CONNECT_REPLY) || linked.is_some_and(|l| reply.contains(l));

        let attempts = timings.open_attempts.max(1);
        let mut reply = String::new();
        let mut success = false;
        for attempt in 1..=attempts {
            if attempt > 1 {
                thread::sleep(timings.open_backoff());
            }
            reply = self
                .engine
                .send_command_and_read_reply(&command, timings.command_timeout())?;
            loop {
                if is_connect(&reply) {
                    success = true;
                    break;
                }
                self.report_info(&reply);
                if reply.contains(DNS_FAIL_REPLY) {
                    break;
                }
                if reply == "FAIL" || reply == "ERROR" {
                    return Err(AtError::DeviceError { command });
                }
                reply = self.engine.next_reply(timings.open_reply_timeout())?;
            }
            if success {
                break;
            }
            log::debug!("open of channel {id} failed on attempt {attempt}/{attempts}: {reply}");
        }

        if !success {
            return Err(AtError::DnsLookupFailed {
                host: host.to_string(),
            });
        }
        if !linked.is_some_and(|l| reply.trim() == l) {
            check_confirmed_channel(id, &reply)?;
        }

        socket.set_connected(true);
        log::info!("channel {id} connected to {} {host}:{}", socket.transport(), socket.port());
        Ok(())
    }

    pub(crate) fn send_payload(&self, id: ChannelId, payload: &[u8]) -> AtResult<()> {
        if payload.is_empty() {
            return Ok(());
        }
        let _op = self.begin()?;
        let timeout = self.timings().command_timeout();
        let command = format!("{}{id},{}", self.command(Command::Send)?, payload.len());
        self.engine.send_and_expect(&command, "OK", timeout)?;
        self.engine.write(payload)?;
        self.engine.find(self.command(Command::SendReply)?, timeout)?;
        Ok(())
    }

    pub(crate) fn close_channel(&self, id: ChannelId) -> AtResult<()> {
        let _op = self.begin()?;
        let command = format!("{}{id}", self.command(Command::SessionEnd)?);
        self.engine
            .send_and_expect(&command, "OK", self.timings().command_timeout())
    }

    pub(crate) fn release_channel(&self, socket: &ChannelSocket) {
        if self.channels.lock().release(socket.id(), socket) {
            log::debug!("channel {} released", socket.id());
        }
    }

    /// Mark every socket disconnected and empty the table; the module drops
    /// all connections when it restarts.
    pub(super) fn forget_channels(&self) {
        let sockets = self.channels.lock().drain();
        for socket in sockets {
            socket.set_connected(false);
        }
    }

    /// Read-path hook for `<id>,CONNECT`. Claims the line when a server is
    /// listening and nothing local owns the channel.
    pub(crate) fn accept_inbound(self: &Arc<Self>, id: ChannelId) -> bool {
        let Some(port) = self.server.lock().as_ref().map(|server| server.port) else {
            return false;
        };
        {
            let mut channels = self.channels.lock();
            if id >= self.config.channel_count || channels.get(id).is_some() {
                return false;
            }
            channels.insert(&ChannelSocket::inbound(Arc::downgrade(self), id, port));
        }
        log::debug!("inbound connection on channel {id}");
        self.dispatcher.post(EngineEvent::Accepted(id));
        true
    }
}

/// Multi-connection firmware confirms an open with `<id>,CONNECT`; anything
/// else means the module's channel table no longer matches ours.
fn check_confirmed_channel(id: ChannelId, reply: &str) -> AtResult<()> {
    let confirmed = reply
        .split_once(',')
        .filter(|(_, status)| status.trim() == CONNECT_REPLY)
        .and_then(|(leading, _)| leading.trim().parse::<ChannelId>().ok());
    match confirmed {
        Some(confirmed) if confirmed == id => Ok(()),
        _ => Err(AtError::ProtocolFault(format!(
            "channel {id} opened but the module confirmed '{reply}'"
        ))),
    }
}
