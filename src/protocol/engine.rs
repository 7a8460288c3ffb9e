use std::{
    collections::VecDeque,
    time::{Duration, Instant},
};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};

use crate::{
    core::{
        bus::EngineEvent,
        helpers::{hex_dump, printable},
        task_manager::Dispatcher,
    },
    error::{AtError, AtResult},
    protocol::{
        demux::{Demux, DemuxSink, DemuxState},
        link::LinkWriter,
        ChannelId,
    },
};

/// Interim lines tolerated by [`ProtocolEngine::send_and_expect`] besides the
/// command echo.
pub const DEFAULT_INTERIM_REPLIES: [&str; 2] = ["no change", "link is not valid"];

/// Decides whether a `<channel>,CONNECT` line belongs to an inbound
/// connection. Runs on the read path and must not block.
pub type ConnectHook = Box<dyn Fn(ChannelId) -> bool + Send + Sync>;

#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// How long a discard waits for an in-flight binary capture.
    pub discard_wait: Duration,
    /// Log every received and sent chunk as hex at trace level.
    pub trace_bytes: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            discard_wait: Duration::from_secs(10),
            trace_bytes: false,
        }
    }
}

/// Serial protocol engine for one module.
///
/// Bytes arrive through [`feed`](Self::feed) (called by the link reader
/// thread) and are split into queued reply lines, notifications and binary
/// payloads. Callers talk to the module through the synchronous
/// request/response primitives; only one exchange runs at a time.
pub struct ProtocolEngine {
    demux: Mutex<Demux>,
    replies: Mutex<VecDeque<String>>,
    reply_ready: Condvar,
    stream_idle: Mutex<bool>,
    stream_idle_changed: Condvar,
    writer: Mutex<Box<dyn LinkWriter>>,
    exchange: Mutex<()>,
    events: Dispatcher<EngineEvent>,
    connect_hook: RwLock<Option<ConnectHook>>,
    options: EngineOptions,
}

impl ProtocolEngine {
    pub fn new(
        writer: Box<dyn LinkWriter>,
        events: Dispatcher<EngineEvent>,
        options: EngineOptions,
    ) -> AtResult<Self> {
        Ok(Self {
            demux: Mutex::new(Demux::new()?),
            replies: Mutex::new(VecDeque::new()),
            reply_ready: Condvar::new(),
            stream_idle: Mutex::new(true),
            stream_idle_changed: Condvar::new(),
            writer: Mutex::new(writer),
            exchange: Mutex::new(()),
            events,
            connect_hook: RwLock::new(None),
            options,
        })
    }

    pub fn set_connect_hook(&self, hook: ConnectHook) {
        *self.connect_hook.write() = Some(hook);
    }

    pub fn demux_state(&self) -> DemuxState {
        self.demux.lock().state()
    }

    /// Append received bytes and run the demultiplexer over them.
    pub fn feed(&self, bytes: &[u8]) {
        if self.options.trace_bytes {
            log::trace!("rx [{}]: {}", bytes.len(), hex_dump(bytes));
        }

        let mut demux = self.demux.lock();
        demux.push(bytes);
        let mut sink = EngineSink { engine: self };
        while let Err(err) = demux.pump(&mut sink) {
            log::warn!("dropping malformed input: {err}");
        }
    }

    /// Pop the next reply line, waiting up to `timeout` for one to arrive.
    pub fn next_reply(&self, timeout: Duration) -> AtResult<String> {
        let deadline = Instant::now() + timeout;
        let mut replies = self.replies.lock();
        loop {
            if let Some(line) = replies.pop_front() {
                return Ok(line);
            }
            if self
                .reply_ready
                .wait_until(&mut replies, deadline)
                .timed_out()
            {
                return replies.pop_front().ok_or_else(|| AtError::timeout(None));
            }
        }
    }

    /// Forget everything received so far.
    ///
    /// Waits for an in-flight binary capture to finish first; if it does not
    /// finish within the configured wait the capture is abandoned.
    pub fn discard_buffered_input(&self) {
        let deadline = Instant::now() + self.options.discard_wait;
        let mut demux = loop {
            self.wait_stream_idle(deadline);
            let demux = self.demux.lock();
            // A capture may have started after the wait returned.
            let capturing = matches!(demux.state(), DemuxState::CapturingStream { .. });
            if !capturing {
                break demux;
            }
            if Instant::now() >= deadline {
                log::warn!(
                    "stream read still in progress after {:?}, abandoning it",
                    self.options.discard_wait
                );
                break demux;
            }
            drop(demux);
        };

        self.replies.lock().clear();
        demux.reset();
        if let Err(err) = self.writer.lock().clear_input() {
            log::warn!("failed to clear link input: {err}");
        }
        self.set_stream_idle(true);
        log::trace!("input buffers cleared");
    }

    fn wait_stream_idle(&self, deadline: Instant) {
        let mut idle = self.stream_idle.lock();
        while !*idle {
            if self
                .stream_idle_changed
                .wait_until(&mut idle, deadline)
                .timed_out()
            {
                break;
            }
        }
    }

    /// Discard pending input and write `text` followed by CR LF.
    pub fn send_command(&self, text: &str) -> AtResult<()> {
        let _exchange = self.exchange.lock();
        self.write_command(text)
    }

    /// Send `text` and wait for `expect`, skipping the echo, blank lines and
    /// the usual interim replies.
    pub fn send_and_expect(&self, text: &str, expect: &str, timeout: Duration) -> AtResult<()> {
        let mut accept = vec![text];
        accept.extend(DEFAULT_INTERIM_REPLIES);
        self.exchange_expect(text, &accept, expect, timeout)
    }

    /// Like [`send_and_expect`](Self::send_and_expect) but with an explicit
    /// list of tolerated interim replies.
    pub fn send_and_expect_with(
        &self,
        text: &str,
        accept: &[&str],
        expect: &str,
        timeout: Duration,
    ) -> AtResult<()> {
        let mut all = vec![text];
        all.extend_from_slice(accept);
        self.exchange_expect(text, &all, expect, timeout)
    }

    /// Collect reply lines until one starts with `terminator`.
    ///
    /// Echo lines are skipped and the terminator line itself is not returned.
    /// A line equal to one of `bad_replies` is returned as the last element
    /// and ends the read early.
    pub fn send_and_read_until(
        &self,
        text: Option<&str>,
        terminator: &str,
        bad_replies: &[&str],
        timeout: Duration,
    ) -> AtResult<Vec<String>> {
        let _exchange = self.exchange.lock();
        if let Some(text) = text {
            self.write_command(text)?;
        }

        let mut lines = Vec::new();
        loop {
            let line = self
                .next_reply(timeout)
                .map_err(|_| AtError::timeout(text.or(Some(terminator))))?;
            if line.is_empty() {
                continue;
            }
            if text.is_some_and(|text| line.starts_with(text)) {
                continue;
            }
            if line.starts_with(terminator) {
                return Ok(lines);
            }
            let bad = bad_replies.contains(&line.as_str());
            lines.push(line);
            if bad {
                return Ok(lines);
            }
        }
    }

    /// Wait for a line starting with `terminator` without sending anything.
    pub fn find(&self, terminator: &str, timeout: Duration) -> AtResult<Vec<String>> {
        self.send_and_read_until(None, terminator, &[], timeout)
    }

    /// Send `text` and return the first reply that is neither blank nor its echo.
    pub fn send_command_and_read_reply(&self, text: &str, timeout: Duration) -> AtResult<String> {
        let _exchange = self.exchange.lock();
        self.write_command(text)?;
        loop {
            let line = self
                .next_reply(timeout)
                .map_err(|_| AtError::timeout(Some(text)))?;
            if !line.is_empty() && line != text {
                return Ok(line);
            }
        }
    }

    /// Write raw payload bytes, with no terminator and no discard.
    pub fn write(&self, payload: &[u8]) -> AtResult<()> {
        if self.options.trace_bytes {
            log::trace!("tx [{}]: {}", payload.len(), hex_dump(payload));
        }
        self.writer.lock().write_all(payload)?;
        Ok(())
    }

    /// Flush the OS buffers of a link that stopped answering.
    pub fn nudge_link(&self) {
        log::debug!("nudging link");
        if let Err(err) = self.writer.lock().nudge() {
            log::warn!("failed to reset link buffers: {err}");
        }
    }

    fn exchange_expect(
        &self,
        text: &str,
        accept: &[&str],
        expect: &str,
        timeout: Duration,
    ) -> AtResult<()> {
        let _exchange = self.exchange.lock();
        self.write_command(text)?;
        loop {
            let line = self
                .next_reply(timeout)
                .map_err(|_| AtError::timeout(Some(text)))?;
            if line.is_empty() || accept.iter().any(|a| line.eq_ignore_ascii_case(a)) {
                continue;
            }
            if line.eq_ignore_ascii_case(expect) {
                return Ok(());
            }
            return Err(AtError::UnexpectedReply {
                expected: expect.to_string(),
                actual: line,
            });
        }
    }

    fn write_command(&self, text: &str) -> AtResult<()> {
        self.discard_buffered_input();
        log::debug!("send: {}", printable(text.as_bytes()));
        let mut line = Vec::with_capacity(text.len() + 2);
        line.extend_from_slice(text.as_bytes());
        line.extend_from_slice(b"\r\n");
        self.write(&line)
    }

    fn set_stream_idle(&self, idle: bool) {
        let mut flag = self.stream_idle.lock();
        *flag = idle;
        if idle {
            self.stream_idle_changed.notify_all();
        }
    }
}

struct EngineSink<'a> {
    engine: &'a ProtocolEngine,
}

impl DemuxSink for EngineSink<'_> {
    fn reply(&mut self, line: String) {
        self.engine.replies.lock().push_back(line);
        self.engine.reply_ready.notify_all();
    }

    fn payload(&mut self, channel: ChannelId, data: Bytes) {
        if !self.engine.events.post(EngineEvent::Payload { channel, data }) {
            log::warn!("no dispatcher for payload on channel {channel}");
        }
    }

    fn channel_closed(&mut self, channel: ChannelId) {
        self.engine.events.post(EngineEvent::ChannelClosed(channel));
    }

    fn inbound_connect(&mut self, channel: ChannelId) -> bool {
        match self.engine.connect_hook.read().as_ref() {
            Some(hook) => hook(channel),
            None => false,
        }
    }

    fn hardware_fault(&mut self, cause: Option<i32>) {
        self.engine.events.post(EngineEvent::HardwareFault { cause });
    }

    fn capture_started(&mut self, _channel: ChannelId, _length: usize) {
        self.engine.set_stream_idle(false);
    }

    fn capture_finished(&mut self) {
        self.engine.set_stream_idle(true);
    }
}
