use std::net::Ipv4Addr;

use super::DeviceController;
use crate::{
    api::{
        types::{
            unquote, AccessPoint, AccessPointClient, AccessPointConfig, AddressInfo,
            AddressReplyPrefixes, Ecn, OperatingMode,
        },
        vocabulary::Command,
    },
    error::{AtError, AtResult},
};

impl DeviceController {
    /// Join an access point. `persist` stores the credentials on the module.
    pub fn join_access_point(&self, ssid: &str, password: &str, persist: bool) -> AtResult<()> {
        let _op = self.begin()?;
        let prefix = self.command_with(Command::JoinAccessPoint, persist)?;
        let command = format!("{prefix}\"{ssid}\",\"{password}\"");
        let lines = self.engine.send_and_read_until(
            Some(&command),
            "OK",
            &["FAIL", "ERROR"],
            self.timings().join_timeout(),
        )?;
        for line in &lines {
            self.report_info(line);
        }

        match lines.last().map(String::as_str) {
            Some("FAIL") => Err(AtError::JoinFailed {
                ssid: ssid.to_string(),
            }),
            // Keep the password out of the error.
            Some("ERROR") => Err(AtError::DeviceError {
                command: prefix.to_string(),
            }),
            _ => {
                log::info!("joined access point '{ssid}'");
                Ok(())
            }
        }
    }

    pub fn leave_access_point(&self) -> AtResult<()> {
        let _op = self.begin()?;
        self.engine.send_and_expect(
            self.command(Command::QuitAccessPoint)?,
            "OK",
            self.timings().command_timeout(),
        )
    }

    pub fn operating_mode(&self) -> AtResult<OperatingMode> {
        let _op = self.begin()?;
        let lines = self.query(
            self.command(Command::GetOperatingMode)?,
            self.timings().command_timeout(),
        )?;
        let reply = self.command(Command::OperatingModeReply)?;
        lines
            .iter()
            .find_map(|line| line.strip_prefix(reply))
            .and_then(|value| unquote(value).parse::<u8>().ok())
            .and_then(|value| OperatingMode::try_from(value).ok())
            .ok_or_else(|| AtError::ProtocolFault(format!("no operating mode in {lines:?}")))
    }

    pub fn set_operating_mode(&self, mode: OperatingMode, persist: bool) -> AtResult<()> {
        let _op = self.begin()?;
        let command = format!(
            "{}{}",
            self.command_with(Command::SetOperatingMode, persist)?,
            u8::from(mode)
        );
        self.engine
            .send_and_expect(&command, "OK", self.timings().command_timeout())
    }

    /// Configure the module's own access point.
    pub fn configure_access_point(
        &self,
        ssid: &str,
        password: &str,
        channel: u8,
        ecn: Ecn,
        persist: bool,
    ) -> AtResult<()> {
        if matches!(ecn, Ecn::Unknown | Ecn::Wep) {
            return Err(AtError::InvalidArgument(format!(
                "{ecn:?} cannot be used for the module's access point"
            )));
        }
        let _op = self.begin()?;
        let command = format!(
            "{}\"{ssid}\",\"{password}\",{channel},{}",
            self.command_with(Command::SetAccessPoint, persist)?,
            u8::from(ecn)
        );
        self.engine
            .send_and_expect(&command, "OK", self.timings().command_timeout())
    }

    pub fn access_point_config(&self) -> AtResult<AccessPointConfig> {
        let _op = self.begin()?;
        let lines = self.query(
            self.command(Command::GetAccessPoint)?,
            self.timings().command_timeout(),
        )?;
        let reply = self.command(Command::AccessPointReply)?;
        lines
            .iter()
            .filter(|line| line.starts_with(reply))
            .find_map(|line| AccessPointConfig::parse(line))
            .ok_or_else(|| AtError::ProtocolFault(format!("no access point settings in {lines:?}")))
    }

    pub fn enable_dhcp(&self, mode: OperatingMode, enable: bool, persist: bool) -> AtResult<()> {
        let _op = self.begin()?;
        let command = format!(
            "{}{},{}",
            self.command_with(Command::SetDhcp, persist)?,
            mode.dhcp_selector(),
            u8::from(enable)
        );
        self.engine
            .send_and_expect(&command, "OK", self.timings().command_timeout())
    }

    pub fn station_address(&self) -> AtResult<Option<Ipv4Addr>> {
        Ok(self.refresh_addresses(Command::GetStationAddress)?.station_address)
    }

    pub fn set_station_address(&self, address: Ipv4Addr, persist: bool) -> AtResult<()> {
        self.assign(Command::SetStationAddress, &address.to_string(), persist)?;
        self.addresses.lock().station_address = Some(address);
        Ok(())
    }

    pub fn access_point_address(&self) -> AtResult<Option<Ipv4Addr>> {
        Ok(self.refresh_addresses(Command::GetApAddress)?.ap_address)
    }

    pub fn set_access_point_address(&self, address: Ipv4Addr, persist: bool) -> AtResult<()> {
        self.assign(Command::SetApAddress, &address.to_string(), persist)?;
        self.addresses.lock().ap_address = Some(address);
        Ok(())
    }

    pub fn station_mac(&self) -> AtResult<Option<String>> {
        Ok(self.refresh_addresses(Command::GetStationMac)?.station_mac)
    }

    pub fn set_station_mac(&self, mac: &str, persist: bool) -> AtResult<()> {
        self.assign(Command::SetStationMac, mac, persist)?;
        self.addresses.lock().station_mac = Some(mac.to_string());
        Ok(())
    }

    pub fn access_point_mac(&self) -> AtResult<Option<String>> {
        Ok(self.refresh_addresses(Command::GetApMac)?.ap_mac)
    }

    pub fn set_access_point_mac(&self, mac: &str, persist: bool) -> AtResult<()> {
        self.assign(Command::SetApMac, mac, persist)?;
        self.addresses.lock().ap_mac = Some(mac.to_string());
        Ok(())
    }

    /// Station and access point addresses as reported by `AT+CIFSR`.
    pub fn address_information(&self) -> AtResult<AddressInfo> {
        self.refresh_addresses(Command::GetAddressInformation)
    }

    /// Scan for access points, optionally asking the module to sort them by
    /// signal strength first.
    pub fn access_points(&self, sorted: bool) -> AtResult<Vec<AccessPoint>> {
        let _op = self.begin()?;
        let timeout = self.timings().join_timeout();
        if sorted {
            self.engine.send_and_expect(
                self.command(Command::SortAccessPoints)?,
                "OK",
                self.timings().command_timeout(),
            )?;
        }
        let lines = self.query(self.command(Command::ListAccessPoints)?, timeout)?;
        Ok(lines
            .iter()
            .filter_map(|line| match AccessPoint::parse(line) {
                Some(ap) => Some(ap),
                None => {
                    self.report_info(line);
                    None
                }
            })
            .collect())
    }

    /// Stations attached to the module's access point.
    pub fn connected_clients(&self) -> AtResult<Vec<AccessPointClient>> {
        let _op = self.begin()?;
        let lines = self.query(
            self.command(Command::ListConnectedClients)?,
            self.timings().command_timeout(),
        )?;
        Ok(lines
            .iter()
            .filter_map(|line| AccessPointClient::parse(line))
            .collect())
    }

    fn assign(&self, command: Command, value: &str, persist: bool) -> AtResult<()> {
        let _op = self.begin()?;
        let command = format!("{}\"{value}\"", self.command_with(command, persist)?);
        self.engine
            .send_and_expect(&command, "OK", self.timings().command_timeout())
    }

    fn refresh_addresses(&self, query: Command) -> AtResult<AddressInfo> {
        let _op = self.begin()?;
        let lines = self.query(self.command(query)?, self.timings().command_timeout())?;
        let vocabulary = self.vocabulary.read().clone();
        let prefixes = AddressReplyPrefixes {
            station_address: vocabulary.get(Command::StationAddressReply)?,
            ap_address: vocabulary.get(Command::ApAddressReply)?,
            station_mac: vocabulary.get(Command::StationMacReply)?,
            ap_mac: vocabulary.get(Command::ApMacReply)?,
        };

        let mut addresses = self.addresses.lock();
        for line in &lines {
            if !addresses.absorb(line, &prefixes) {
                log::debug!("ignoring address line '{line}'");
            }
        }
        Ok(addresses.clone())
    }
}
