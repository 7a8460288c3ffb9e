use std::{
    io,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use flume::{Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;

use crate::protocol::link::{LinkReader, LinkWriter, PowerLine, ResetLine};

const CHANNEL_PLACEHOLDER: &str = "{channel}";
const SEND_COMMAND: &str = "AT+CIPSEND=";

#[derive(Debug, Clone)]
struct Rule {
    prefix: String,
    responses: Vec<Vec<String>>,
    served: usize,
}

impl Rule {
    fn next_response(&mut self) -> Vec<String> {
        let index = self.served.min(self.responses.len().saturating_sub(1));
        self.served += 1;
        self.responses.get(index).cloned().unwrap_or_default()
    }
}

#[derive(Debug, Default)]
struct Script {
    rules: Vec<Rule>,
    echo: bool,
    line: Vec<u8>,
    pending_send: Option<(usize, Vec<u8>)>,
    commands: Vec<String>,
    payloads: Vec<Vec<u8>>,
}

struct SimState {
    script: Mutex<Script>,
    to_host: Sender<Vec<u8>>,
    from_module: Receiver<Vec<u8>>,
    powered: AtomicBool,
    power_offs: AtomicUsize,
    reset_pulses: AtomicUsize,
}

/// In-process stand-in for a radio module.
///
/// Commands written by the host are matched against scripted rules by
/// longest prefix; a rule answers with a fixed set of lines, or with the next
/// entry of a sequence (the last entry repeats). `{channel}` in a reply is
/// replaced by the first numeric argument of the command. Commands without a
/// rule are answered with `ERROR`. Unless a rule at least as specific exists,
/// `AT+CIPSEND=` gets the usual prompt, swallows the payload and reports
/// `SEND OK`.
#[derive(Clone)]
pub struct SimulatedModule {
    state: Arc<SimState>,
}

impl Default for SimulatedModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedModule {
    pub fn new() -> Self {
        let (to_host, from_module) = flume::unbounded();
        Self {
            state: Arc::new(SimState {
                script: Mutex::new(Script {
                    echo: true,
                    ..Default::default()
                }),
                to_host,
                from_module,
                powered: AtomicBool::new(true),
                power_offs: AtomicUsize::new(0),
                reset_pulses: AtomicUsize::new(0),
            }),
        }
    }

    /// A module that answers the bring-up sequence and the common commands,
    /// reporting `at_version` from `AT+GMR`.
    pub fn esp8266(at_version: &str) -> Self {
        let module = Self::new();
        let gmr = format!("AT version:{at_version}(Jul 19 2016 18:44:44)");
        module
            .respond("AT", &["OK"])
            .respond("ATE0", &["OK"])
            .respond("AT+RST", &["OK", "", "ready"])
            .respond("AT+RESTORE", &["OK", "", "ready"])
            .respond("AT+CIPMUX=", &["OK"])
            .respond(
                "AT+GMR",
                &[
                    gmr.as_str(),
                    "SDK version:2.0.0(656edbf)",
                    "compile time:Jul 19 2016 18:44:22",
                    "OK",
                ],
            )
            .respond("AT+CIPSTART=", &["{channel},CONNECT", "", "OK"])
            .respond("AT+CIPCLOSE=", &["{channel},CLOSED", "", "OK"])
            .respond("AT+CIPSERVER=", &["OK"])
            .respond("AT+CWJAP", &["WIFI CONNECTED", "WIFI GOT IP", "", "OK"])
            .respond("AT+CWQAP", &["OK", "WIFI DISCONNECT"])
            .respond("AT+CWMODE", &["OK"])
            .respond("AT+CWMODE?", &["+CWMODE:1", "", "OK"])
            .respond("AT+CWMODE_CUR?", &["+CWMODE_CUR:1", "", "OK"])
            .respond("AT+CWMODE_DEF?", &["+CWMODE_DEF:3", "", "OK"])
            .respond("AT+CWDHCP", &["OK"])
            .respond("AT+CWLAPOPT=", &["OK"])
            .respond(
                "AT+CWLAP",
                &[
                    "+CWLAP:(3,\"home-net\",-52,\"a0:f3:c1:11:22:33\",1)",
                    "+CWLAP:(0,\"cafe guest\",-80,\"00:1d:7e:44:55:66\",6)",
                    "",
                    "OK",
                ],
            )
            .respond(
                "AT+CIFSR",
                &[
                    "+CIFSR:APIP,\"192.168.4.1\"",
                    "+CIFSR:APMAC,\"5e:cf:7f:0a:0b:0c\"",
                    "+CIFSR:STAIP,\"192.168.1.20\"",
                    "+CIFSR:STAMAC,\"5c:cf:7f:0a:0b:0c\"",
                    "",
                    "OK",
                ],
            )
            .respond(
                "AT+CIPSTA?",
                &[
                    "+CIPSTA:ip:\"192.168.1.20\"",
                    "+CIPSTA:gateway:\"192.168.1.1\"",
                    "+CIPSTA:netmask:\"255.255.255.0\"",
                    "",
                    "OK",
                ],
            )
            .respond(
                "AT+CIPSTA_CUR?",
                &[
                    "+CIPSTA_CUR:ip:\"192.168.1.20\"",
                    "+CIPSTA_CUR:gateway:\"192.168.1.1\"",
                    "+CIPSTA_CUR:netmask:\"255.255.255.0\"",
                    "",
                    "OK",
                ],
            )
            .respond("AT+CIPSTAMAC?", &["+CIPSTAMAC:\"5c:cf:7f:0a:0b:0c\"", "", "OK"])
            .respond(
                "AT+CIPSTAMAC_CUR?",
                &["+CIPSTAMAC_CUR:\"5c:cf:7f:0a:0b:0c\"", "", "OK"],
            )
            .respond("AT+CWLIF", &["192.168.4.2,8c:85:90:aa:bb:cc", "", "OK"])
            .respond("AT+GSLP=", &["OK"]);
        module
    }

    /// Answer commands starting with `prefix` with `lines`, every time.
    pub fn respond(&self, prefix: &str, lines: &[&str]) -> &Self {
        self.respond_sequence(prefix, &[lines])
    }

    /// Answer successive matching commands with successive entries of
    /// `responses`; the last entry keeps repeating.
    pub fn respond_sequence(&self, prefix: &str, responses: &[&[&str]]) -> &Self {
        let rule = Rule {
            prefix: prefix.to_string(),
            responses: responses
                .iter()
                .map(|lines| lines.iter().map(|line| line.to_string()).collect())
                .collect(),
            served: 0,
        };
        let mut script = self.state.script.lock();
        script.rules.retain(|existing| existing.prefix != prefix);
        script.rules.push(rule);
        drop(script);
        self
    }

    /// Never answer commands starting with `prefix`.
    pub fn silence(&self, prefix: &str) -> &Self {
        self.respond(prefix, &[])
    }

    pub fn set_echo(&self, echo: bool) -> &Self {
        self.state.script.lock().echo = echo;
        self
    }

    /// Push unsolicited bytes towards the host.
    pub fn inject(&self, bytes: &[u8]) {
        let _ = self.state.to_host.send(bytes.to_vec());
    }

    /// Every command line the host has written, in order.
    pub fn commands(&self) -> Vec<String> {
        self.state.script.lock().commands.clone()
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .script
            .lock()
            .commands
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }

    /// Every raw payload that followed an `AT+CIPSEND`.
    pub fn payloads(&self) -> Vec<Vec<u8>> {
        self.state.script.lock().payloads.clone()
    }

    /// How many times the supply went from on to off.
    pub fn power_offs(&self) -> usize {
        self.state.power_offs.load(Ordering::Acquire)
    }

    pub fn reset_pulses(&self) -> usize {
        self.state.reset_pulses.load(Ordering::Acquire)
    }

    /// Host-side link halves. `poll` bounds each blocking read.
    pub fn link(&self, poll: Duration) -> (SimulatedReader, SimulatedWriter) {
        (
            SimulatedReader {
                rx: self.state.from_module.clone(),
                pending: Vec::new(),
                poll,
            },
            SimulatedWriter {
                module: self.clone(),
            },
        )
    }

    fn receive(&self, bytes: &[u8]) {
        if !self.state.powered.load(Ordering::Acquire) {
            return;
        }

        let mut script = self.state.script.lock();
        let mut out = Vec::new();
        for &byte in bytes {
            if let Some((expected, payload)) = script.pending_send.as_mut() {
                payload.push(byte);
                if payload.len() == *expected {
                    let payload = std::mem::take(payload);
                    out.extend_from_slice(
                        format!("\r\nRecv {} bytes\r\n\r\nSEND OK\r\n", payload.len()).as_bytes(),
                    );
                    script.payloads.push(payload);
                    script.pending_send = None;
                }
                continue;
            }

            if byte != b'\n' {
                script.line.push(byte);
                continue;
            }
            let raw = std::mem::take(&mut script.line);
            let command = String::from_utf8_lossy(&raw).trim().to_string();
            if !command.is_empty() {
                out.extend(Self::answer(&mut script, &command));
            }
        }
        drop(script);

        if !out.is_empty() {
            let _ = self.state.to_host.send(out);
        }
    }

    fn answer(script: &mut Script, command: &str) -> Vec<u8> {
        script.commands.push(command.to_string());
        let mut out = Vec::new();
        if script.echo {
            out.extend_from_slice(command.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        if command == "ATE0" {
            script.echo = false;
        }

        let channel = first_numeric_argument(command);
        let rule = script
            .rules
            .iter_mut()
            .filter(|rule| command.starts_with(&rule.prefix))
            .max_by_key(|rule| rule.prefix.len());

        let builtin_send = command.starts_with(SEND_COMMAND)
            && rule
                .as_ref()
                .map_or(true, |rule| rule.prefix.len() < SEND_COMMAND.len());
        if builtin_send {
            match command[SEND_COMMAND.len()..]
                .split(',')
                .nth(1)
                .and_then(|len| len.trim().parse::<usize>().ok())
            {
                Some(len) if len > 0 => {
                    script.pending_send = Some((len, Vec::with_capacity(len)));
                    out.extend_from_slice(b"OK\r\n> ");
                }
                _ => out.extend_from_slice(b"ERROR\r\n"),
            }
            return out;
        }

        match rule {
            Some(rule) => {
                for line in rule.next_response() {
                    let line = match channel {
                        Some(channel) => line.replace(CHANNEL_PLACEHOLDER, &channel.to_string()),
                        None => line,
                    };
                    out.extend_from_slice(line.as_bytes());
                    out.extend_from_slice(b"\r\n");
                }
            }
            None => out.extend_from_slice(b"ERROR\r\n"),
        }
        out
    }
}

fn first_numeric_argument(command: &str) -> Option<usize> {
    let (_, args) = command.split_once('=')?;
    args.split(',').next()?.trim().parse().ok()
}

impl PowerLine for SimulatedModule {
    fn is_on(&self) -> bool {
        self.state.powered.load(Ordering::Acquire)
    }

    fn set(&self, on: bool) -> io::Result<()> {
        let was_on = self.state.powered.swap(on, Ordering::AcqRel);
        if !on && was_on {
            self.state.power_offs.fetch_add(1, Ordering::AcqRel);
        }
        if on && !was_on {
            let mut script = self.state.script.lock();
            script.echo = true;
            script.line.clear();
            script.pending_send = None;
            drop(script);
            self.inject(b"\r\nready\r\n");
        }
        Ok(())
    }
}

impl ResetLine for SimulatedModule {
    fn pulse(&self, _low_for: Duration) -> io::Result<()> {
        self.state.reset_pulses.fetch_add(1, Ordering::AcqRel);
        if self.is_on() {
            self.inject(b"\r\nready\r\n");
        }
        Ok(())
    }
}

pub struct SimulatedReader {
    rx: Receiver<Vec<u8>>,
    pending: Vec<u8>,
    poll: Duration,
}

impl LinkReader for SimulatedReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv_timeout(self.poll) {
                Ok(chunk) => self.pending = chunk,
                Err(RecvTimeoutError::Timeout) => return Ok(0),
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(io::Error::from(io::ErrorKind::BrokenPipe))
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

pub struct SimulatedWriter {
    module: SimulatedModule,
}

impl LinkWriter for SimulatedWriter {
    fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        self.module.receive(bytes);
        Ok(())
    }

    fn clear_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(reader: &mut SimulatedReader) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            let n = reader.read(&mut buf).unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        String::from_utf8(out).unwrap()
    }

    #[test]
    fn test_longest_prefix_and_echo() {
        let module = SimulatedModule::esp8266("1.3.0.0");
        let (mut reader, mut writer) = module.link(Duration::from_millis(10));

        writer.write_all(b"AT\r\n").unwrap();
        assert_eq!(drain(&mut reader), "AT\r\nOK\r\n");

        writer.write_all(b"ATE0\r\nAT+CWMODE_CUR?\r\n").unwrap();
        assert_eq!(
            drain(&mut reader),
            "ATE0\r\nOK\r\n+CWMODE_CUR:1\r\n\r\nOK\r\n"
        );

        writer.write_all(b"AT+BOGUS\r\n").unwrap();
        assert_eq!(drain(&mut reader), "OK\r\n");
        assert_eq!(module.commands(), vec!["AT", "ATE0", "AT+CWMODE_CUR?", "AT+BOGUS"]);
    }

    #[test]
    fn test_sequences_and_placeholders() {
        let module = SimulatedModule::new();
        module.set_echo(false).respond_sequence(
            "AT+CIPSTART=",
            &[&["DNS Fail"], &["{channel},CONNECT"]],
        );
        let (mut reader, mut writer) = module.link(Duration::from_millis(10));

        writer.write_all(b"AT+CIPSTART=2,\"TCP\",\"a\",1\r\n").unwrap();
        assert_eq!(drain(&mut reader), "DNS Fail\r\n");
        writer.write_all(b"AT+CIPSTART=3,\"TCP\",\"a\",1\r\n").unwrap();
        assert_eq!(drain(&mut reader), "3,CONNECT\r\n");
        writer.write_all(b"AT+CIPSTART=1,\"TCP\",\"a\",1\r\n").unwrap();
        assert_eq!(drain(&mut reader), "1,CONNECT\r\n");
        writer.write_all(b"AT+NOPE\r\n").unwrap();
        assert_eq!(drain(&mut reader), "ERROR\r\n");
    }

    #[test]
    fn test_send_swallows_payload() {
        let module = SimulatedModule::new();
        module.set_echo(false);
        let (mut reader, mut writer) = module.link(Duration::from_millis(10));

        writer.write_all(b"AT+CIPSEND=0,6\r\n").unwrap();
        assert_eq!(drain(&mut reader), "OK\r\n> ");
        writer.write_all(b"he").unwrap();
        writer.write_all(b"l\nl").unwrap();
        writer.write_all(b"o").unwrap();
        assert_eq!(drain(&mut reader), "\r\nRecv 6 bytes\r\n\r\nSEND OK\r\n");
        assert_eq!(module.payloads(), vec![b"hel\nlo".to_vec()]);
    }

    #[test]
    fn test_power_off_goes_quiet() {
        let module = SimulatedModule::esp8266("1.3.0.0");
        let (mut reader, mut writer) = module.link(Duration::from_millis(10));

        module.set(false).unwrap();
        writer.write_all(b"AT\r\n").unwrap();
        assert_eq!(drain(&mut reader), "");

        module.set(true).unwrap();
        assert_eq!(drain(&mut reader), "\r\nready\r\n");
        module.pulse(Duration::from_millis(1)).unwrap();
        assert_eq!(module.reset_pulses(), 1);
    }
}
