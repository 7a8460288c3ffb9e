use std::{
    io,
    sync::Weak,
    thread::{self, JoinHandle},
    time::Duration,
};

use super::DeviceController;
use crate::{
    api::{
        types::FirmwareVersion,
        vocabulary::{Command, Dialect, Vocabulary},
    },
    core::bus::DeviceEvent,
    error::{AtError, AtResult},
};

const PING: &str = "AT";
const ECHO_OFF_TIMEOUT: Duration = Duration::from_secs(2);
/// Probe count left when the link gets nudged.
const NUDGE_AT_REMAINING: u32 = 5;
const ALIVE_PROBES: u32 = 2;

/// Run bring-up on its own thread until it succeeds or the controller is
/// dropped. The thread only holds the controller during an attempt.
pub(super) fn spawn(device: Weak<DeviceController>) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name("atlink-bring-up".to_string())
        .spawn(move || loop {
            let Some(device) = device.upgrade() else {
                break;
            };
            if device.is_shutting_down() {
                break;
            }
            let _op = device.operation.lock();
            match device.bring_up_once() {
                Ok(()) => break,
                Err(err) => log::warn!("bring-up attempt failed: {err}"),
            }
        })
}

impl DeviceController {
    /// Bring the module up, retrying until it answers or the controller
    /// shuts down. The caller holds the operation lock.
    fn bring_up(&self) -> AtResult<()> {
        loop {
            if self.is_shutting_down() {
                return Err(AtError::ShuttingDown);
            }
            match self.bring_up_once() {
                Ok(()) => return Ok(()),
                Err(AtError::ShuttingDown) => return Err(AtError::ShuttingDown),
                Err(err) => log::warn!("bring-up attempt failed: {err}"),
            }
        }
    }

    fn bring_up_once(&self) -> AtResult<()> {
        self.set_ready(false);
        *self.vocabulary.write() = Vocabulary::new(Dialect::Legacy);

        self.power_on()?;
        if !self.ping()? {
            log::warn!("module is not answering, cycling power");
            if let Some(power) = &self.power {
                power.set(false)?;
            }
            self.engine.nudge_link();
            return Err(AtError::timeout(Some(PING)));
        }
        self.configure()?;

        self.set_ready(true);
        log::info!("module ready ({} command set)", self.dialect());
        self.emit(DeviceEvent::Booted);
        Ok(())
    }

    fn power_on(&self) -> AtResult<()> {
        let Some(power) = &self.power else {
            return Ok(());
        };
        if power.is_on() {
            return Ok(());
        }
        log::info!("powering module on");
        thread::sleep(self.timings().power_settle());
        power.set(true)?;
        thread::sleep(self.timings().power_settle());
        Ok(())
    }

    /// Probe with `AT` until the module answers `OK`.
    fn ping(&self) -> AtResult<bool> {
        let timings = self.timings();
        for remaining in (1..=timings.ping_attempts).rev() {
            if self.is_shutting_down() {
                return Err(AtError::ShuttingDown);
            }
            if remaining == NUDGE_AT_REMAINING {
                self.engine.nudge_link();
            }
            match self
                .engine
                .send_and_expect(PING, "OK", timings.ping_timeout())
            {
                Ok(()) => return Ok(true),
                Err(AtError::UnexpectedReply { actual, .. }) => {
                    log::debug!("ping answered '{actual}'");
                    thread::sleep(timings.ping_backoff());
                }
                Err(err) => log::debug!("ping failed: {err}"),
            }
        }
        Ok(false)
    }

    fn configure(&self) -> AtResult<()> {
        let timeout = self.timings().command_timeout();
        self.engine
            .send_and_expect(self.command(Command::EchoOff)?, "OK", ECHO_OFF_TIMEOUT)?;
        self.engine.send_and_expect(
            &format!("{}1", self.command(Command::SetMuxMode)?),
            "OK",
            timeout,
        )?;

        let lines = self.query(self.command(Command::GetFirmwareVersion)?, timeout)?;
        let version = FirmwareVersion::new(lines);
        let dialect = Dialect::from_at_version(version.at_version());
        log::info!(
            "firmware AT {} / SDK {}",
            version.at_version().unwrap_or("unknown"),
            version.sdk_version().unwrap_or("unknown")
        );
        *self.vocabulary.write() = Vocabulary::new(dialect);
        *self.firmware.write() = Some(version);
        Ok(())
    }

    /// Restart the module with `AT+RST` and bring it up again.
    ///
    /// `force` skips waiting for an earlier bring-up, for modules that never
    /// came up in the first place.
    pub fn reset(&self, force: bool) -> AtResult<()> {
        if !force {
            self.wait_until_ready(None)?;
        }
        let _op = self.operation.lock();
        self.reset_locked()
    }

    fn reset_locked(&self) -> AtResult<()> {
        let timings = self.timings();
        let command = self.command(Command::Reset)?;
        let mut failures = 0;
        loop {
            self.engine
                .send_and_read_until(Some(command), "OK", &[], timings.command_timeout())?;
            match self.engine.find("ready", timings.reset_ready_timeout()) {
                Ok(_) => break,
                Err(err) => {
                    failures += 1;
                    if failures > timings.reset_attempts {
                        return Err(err);
                    }
                    log::warn!("module did not report ready after reset ({failures}): {err}");
                }
            }
        }
        self.forget_channels();
        self.bring_up()
    }

    /// Return the module to factory settings.
    pub fn restore(&self) -> AtResult<()> {
        let _op = self.begin()?;
        let command = self.command(Command::Restore)?;
        self.engine
            .send_and_read_until(Some(command), "OK", &[], self.timings().command_timeout())?;
        Ok(())
    }

    /// Check whether the module still answers `AT`.
    pub fn is_alive(&self) -> bool {
        let _op = self.operation.lock();
        let timings = self.timings();
        for _ in 0..ALIVE_PROBES {
            match self
                .engine
                .send_and_expect(PING, "OK", timings.ping_timeout())
            {
                Ok(()) => return true,
                Err(AtError::UnexpectedReply { .. }) => thread::sleep(timings.ping_backoff()),
                Err(err) => log::debug!("no response: {err}"),
            }
        }
        false
    }

    /// Switch the module's supply. Switching on runs bring-up again.
    /// Without a power line this does nothing.
    pub fn set_power(&self, on: bool) -> AtResult<()> {
        let Some(power) = &self.power else {
            return Ok(());
        };
        let _op = self.operation.lock();
        power.set(on)?;
        if on {
            thread::sleep(self.timings().power_on_settle());
            self.bring_up()
        } else {
            self.set_ready(false);
            self.forget_channels();
            Ok(())
        }
    }

    /// Over-the-air firmware update. Every status line goes to `progress`;
    /// the module is reset afterwards.
    pub fn update<F>(&self, mut progress: F) -> AtResult<()>
    where
        F: FnMut(&str),
    {
        let _op = self.begin()?;
        let command = self.command(Command::Update)?;
        let timeout = self.timings().update_timeout();
        self.engine.send_command(command)?;
        loop {
            let reply = self
                .engine
                .next_reply(timeout)
                .map_err(|_| AtError::timeout(Some(command)))?;
            if reply.is_empty() {
                continue;
            }
            if reply == "OK" {
                break;
            }
            progress(&reply);
            if reply == "ERROR" {
                return Err(AtError::DeviceError {
                    command: command.to_string(),
                });
            }
        }
        log::info!("firmware update finished, resetting");
        self.reset_locked()
    }

    /// Deep-sleep for `duration_ms`; zero sleeps until woken.
    pub fn deep_sleep(&self, duration_ms: u32) -> AtResult<()> {
        let _op = self.begin()?;
        let command = format!("{}{duration_ms}", self.command(Command::DeepSleep)?);
        self.engine
            .send_and_expect(&command, "OK", self.timings().command_timeout())
    }

    /// Pulse the reset line to end a deep sleep.
    pub fn wake(&self) -> AtResult<()> {
        let _op = self.begin()?;
        let line = self
            .reset_line
            .as_ref()
            .ok_or_else(|| AtError::InvalidArgument("no reset line configured".to_string()))?;
        line.pulse(self.timings().wake_pulse())?;
        Ok(())
    }
}
