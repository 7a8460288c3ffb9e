use bytes::Bytes;

use crate::{
    error::{AtError, AtResult},
    protocol::{ring_buffer::RingBuffer, ChannelId},
};

/// Introducer of a counted binary segment: `+IPD,<channel>,<length>:`.
pub const STREAM_HEADER: &[u8] = b"+IPD";

const REBOOT_PREFIX: &str = "ets ";
const RESET_CAUSE: &str = "rst cause:";
const CLOSED_MARKER: &str = ",CLOSED";
const CONNECT_MARKER: &str = ",CONNECT";

/// Boot-ROM chatter that shows up while the module restarts.
const NOISE_PREFIXES: [&str; 5] = ["wdt ", "load ", "tail ", "chksum ", "csum "];

const INITIAL_CAPACITY: usize = 512;
const GROWTH_MULTIPLIER: usize = 1;
const GROWTH_CONSTANT: usize = 256;

/// Receives everything the demultiplexer pulls out of the byte stream.
///
/// Called with the read-loop monitor held, so implementations must not block.
pub trait DemuxSink {
    /// A complete, trimmed, non-empty text line that is not a notification.
    fn reply(&mut self, line: String);
    fn payload(&mut self, channel: ChannelId, data: Bytes);
    fn channel_closed(&mut self, channel: ChannelId);
    /// Returns `true` when the connection was claimed as an inbound one.
    fn inbound_connect(&mut self, channel: ChannelId) -> bool;
    fn hardware_fault(&mut self, cause: Option<i32>);
    fn capture_started(&mut self, channel: ChannelId, length: usize);
    fn capture_finished(&mut self);
}

enum Next {
    Line(usize),
    Header(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemuxState {
    ParsingLines,
    CapturingStream {
        channel: ChannelId,
        remaining: usize,
    },
}

/// Splits the module's byte stream into reply lines, notifications and
/// per-channel binary payloads.
#[derive(Debug)]
pub struct Demux {
    control: RingBuffer,
    stream: RingBuffer,
    state: DemuxState,
}

impl Demux {
    pub fn new() -> AtResult<Self> {
        Ok(Self {
            control: RingBuffer::new(INITIAL_CAPACITY, GROWTH_MULTIPLIER, GROWTH_CONSTANT)?,
            stream: RingBuffer::new(INITIAL_CAPACITY, GROWTH_MULTIPLIER, GROWTH_CONSTANT)?,
            state: DemuxState::ParsingLines,
        })
    }

    pub fn state(&self) -> DemuxState {
        self.state
    }

    pub fn buffered(&self) -> usize {
        self.control.len()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.control.put(bytes);
    }

    /// Drop all buffered input and any half-finished capture.
    pub fn reset(&mut self) {
        self.control.clear();
        self.stream.clear();
        self.state = DemuxState::ParsingLines;
    }

    /// Run one demultiplexing pass over the buffered input.
    ///
    /// Stops when nothing more can be decoded, or right after a boot-ROM noise
    /// line. An error means the offending line or header was consumed and the
    /// caller may pump again.
    pub fn pump(&mut self, sink: &mut impl DemuxSink) -> AtResult<()> {
        loop {
            if let DemuxState::CapturingStream { channel, remaining } = self.state {
                if self.control.is_empty() {
                    return Ok(());
                }
                let take = remaining.min(self.control.len());
                let chunk = self.control.get(take)?;
                self.stream.put(&chunk);

                let remaining = remaining - take;
                if remaining > 0 {
                    self.state = DemuxState::CapturingStream { channel, remaining };
                    continue;
                }

                let data = self.stream.get(self.stream.len())?;
                self.state = DemuxState::ParsingLines;
                log::trace!("captured {} bytes for channel {channel}", data.len());
                sink.payload(channel, Bytes::from(data));
                sink.capture_finished();
                continue;
            }

            let newline = self.control.index_of(b'\n');
            let header = self.control.index_of_seq(STREAM_HEADER);

            let next = match (newline, header) {
                (None, None) => return Ok(()),
                (Some(nl), Some(hdr)) if hdr < nl => Next::Header(hdr),
                (Some(nl), _) => Next::Line(nl),
                (None, Some(hdr)) => Next::Header(hdr),
            };

            match next {
                Next::Line(nl) => {
                    let raw = self.control.get(nl + 1)?;
                    let line = String::from_utf8_lossy(&raw).trim().to_string();
                    if line.is_empty() {
                        continue;
                    }
                    log::debug!("recv: {line}");
                    if !self.dispatch_line(line, sink)? {
                        return Ok(());
                    }
                }
                Next::Header(hdr) => {
                    let Some(colon) = self.control.index_of_from(b':', hdr) else {
                        // Header not complete yet.
                        return Ok(());
                    };
                    self.control.skip(hdr)?;
                    let raw = self.control.get(colon - hdr)?;
                    self.control.skip(1)?;
                    let introducer = String::from_utf8_lossy(&raw).trim().to_string();
                    let (channel, length) = parse_stream_header(&introducer)?;

                    log::trace!("stream of {length} bytes for channel {channel}");
                    if length == 0 {
                        sink.payload(channel, Bytes::new());
                        continue;
                    }
                    self.stream.clear();
                    self.state = DemuxState::CapturingStream {
                        channel,
                        remaining: length,
                    };
                    sink.capture_started(channel, length);
                }
            }
        }
    }

    /// Returns `false` when the rest of the pass must be abandoned.
    fn dispatch_line(&self, line: String, sink: &mut impl DemuxSink) -> AtResult<bool> {
        if line.starts_with(REBOOT_PREFIX) {
            let cause = parse_reset_cause(&line)?;
            log::warn!("module reboot detected (cause {cause:?})");
            sink.hardware_fault(cause);
            return Ok(true);
        }

        if NOISE_PREFIXES.iter().any(|prefix| line.starts_with(prefix)) {
            return Ok(false);
        }

        if let Some(idx) = line.find(CLOSED_MARKER) {
            sink.channel_closed(parse_channel(&line[..idx])?);
        } else if let Some(idx) = line.find(CONNECT_MARKER) {
            let channel = parse_channel(&line[..idx])?;
            if !sink.inbound_connect(channel) {
                sink.reply(line);
            }
        } else {
            sink.reply(line);
        }
        Ok(true)
    }
}

fn parse_channel(text: &str) -> AtResult<ChannelId> {
    text.trim()
        .parse()
        .map_err(|_| AtError::ProtocolFault(format!("invalid channel number '{text}'")))
}

fn parse_reset_cause(line: &str) -> AtResult<Option<i32>> {
    let Some(idx) = line.find(RESET_CAUSE) else {
        return Ok(None);
    };
    let rest = &line[idx + RESET_CAUSE.len()..];
    let code = rest.split(',').next().unwrap_or(rest).trim();
    code.parse()
        .map(Some)
        .map_err(|_| AtError::ProtocolFault(format!("invalid reset cause in '{line}'")))
}

fn parse_stream_header(introducer: &str) -> AtResult<(ChannelId, usize)> {
    let tokens: Vec<&str> = introducer.split(',').collect();
    if tokens.len() < 3 {
        return Err(AtError::ProtocolFault(format!(
            "stream header without channel: '{introducer}'"
        )));
    }
    let channel = parse_channel(tokens[1])?;
    let length = tokens[2].trim().parse().map_err(|_| {
        AtError::ProtocolFault(format!("invalid stream length in '{introducer}'"))
    })?;
    Ok((channel, length))
}
