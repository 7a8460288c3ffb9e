use std::{fmt, net::Ipv4Addr};

use num_enum::{FromPrimitive, IntoPrimitive, TryFromPrimitive};
use serde::{Deserialize, Serialize};

/// Wi-Fi role(s) the module plays.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, IntoPrimitive, TryFromPrimitive,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum OperatingMode {
    Station = 1,
    AccessPoint = 2,
    Both = 3,
}

impl OperatingMode {
    /// Argument `AT+CWDHCP` uses to address this mode.
    pub fn dhcp_selector(self) -> u8 {
        match self {
            OperatingMode::Station => 1,
            OperatingMode::AccessPoint => 0,
            OperatingMode::Both => 2,
        }
    }
}

impl fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatingMode::Station => write!(f, "station"),
            OperatingMode::AccessPoint => write!(f, "access_point"),
            OperatingMode::Both => write!(f, "both"),
        }
    }
}

/// Encryption scheme advertised by an access point.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    IntoPrimitive,
    FromPrimitive,
)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum Ecn {
    Open = 0,
    Wep = 1,
    WpaPsk = 2,
    Wpa2Psk = 3,
    WpaWpa2Psk = 4,
    #[default]
    Unknown = 0xff,
}

/// One entry of an access point scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPoint {
    pub ecn: Ecn,
    pub ssid: String,
    pub rssi: i32,
    pub mac_address: String,
    pub automatic_connection_mode: bool,
}

impl AccessPoint {
    /// Parse a `+CWLAP:(ecn,"ssid",rssi,"mac"[,mode...])` line.
    pub fn parse(line: &str) -> Option<Self> {
        let body = unquote(after(line, ':')?);
        let tokens: Vec<&str> = body.split(',').collect();
        if tokens.len() < 4 {
            return None;
        }
        let ecn = tokens[0].trim().parse::<u8>().ok().map(Ecn::from)?;
        let automatic_connection_mode = tokens
            .get(4)
            .and_then(|mode| mode.trim().parse::<i32>().ok())
            .map(|mode| mode != 0)
            .unwrap_or(false);

        Some(Self {
            ecn,
            ssid: unquote(tokens[1]).to_string(),
            rssi: tokens[2].trim().parse().ok()?,
            mac_address: unquote(tokens[3]).to_string(),
            automatic_connection_mode,
        })
    }
}

/// A station attached to the module's own access point.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPointClient {
    pub address: Ipv4Addr,
    pub mac_address: String,
}

impl AccessPointClient {
    /// Parse an `ip,mac` line from `AT+CWLIF`.
    pub fn parse(line: &str) -> Option<Self> {
        let (address, mac) = line.split_once(',')?;
        Some(Self {
            address: unquote(address).parse().ok()?,
            mac_address: mac.trim().to_string(),
        })
    }
}

/// Soft-AP settings as reported by `AT+CWSAP?`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessPointConfig {
    pub ssid: String,
    pub password: String,
    pub channel: u8,
    pub ecn: Ecn,
}

impl AccessPointConfig {
    /// Parse a `+CWSAP:"ssid","pwd",channel,ecn[,...]` line.
    pub fn parse(line: &str) -> Option<Self> {
        let tokens: Vec<&str> = after(line, ':')?.split(',').collect();
        if tokens.len() < 4 {
            return None;
        }
        Some(Self {
            ssid: unquote(tokens[0]).to_string(),
            password: unquote(tokens[1]).to_string(),
            channel: tokens[2].trim().parse().ok()?,
            ecn: tokens[3].trim().parse::<u8>().ok().map(Ecn::from)?,
        })
    }
}

/// Addresses learned from the module, filled in piecemeal by the
/// address and MAC queries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddressInfo {
    pub station_address: Option<Ipv4Addr>,
    pub station_gateway: Option<Ipv4Addr>,
    pub station_netmask: Option<Ipv4Addr>,
    pub station_mac: Option<String>,
    pub ap_address: Option<Ipv4Addr>,
    pub ap_gateway: Option<Ipv4Addr>,
    pub ap_netmask: Option<Ipv4Addr>,
    pub ap_mac: Option<String>,
}

/// Reply prefixes of the address queries for the active dialect.
#[derive(Debug, Clone, Copy)]
pub struct AddressReplyPrefixes<'a> {
    pub station_address: &'a str,
    pub ap_address: &'a str,
    pub station_mac: &'a str,
    pub ap_mac: &'a str,
}

impl AddressInfo {
    /// Merge one reply line into the cached addresses. Returns `true` when
    /// the line carried something recognised.
    pub fn absorb(&mut self, line: &str, prefixes: &AddressReplyPrefixes<'_>) -> bool {
        if line.starts_with(prefixes.station_address) {
            return Self::absorb_ip_triplet(
                line,
                &mut self.station_address,
                &mut self.station_gateway,
                &mut self.station_netmask,
            );
        }
        if line.starts_with(prefixes.ap_address) {
            return Self::absorb_ip_triplet(
                line,
                &mut self.ap_address,
                &mut self.ap_gateway,
                &mut self.ap_netmask,
            );
        }
        if line.starts_with(prefixes.station_mac) {
            self.station_mac = after(line, ':').map(|mac| unquote(mac).to_string());
            return self.station_mac.is_some();
        }
        if line.starts_with(prefixes.ap_mac) {
            self.ap_mac = after(line, ':').map(|mac| unquote(mac).to_string());
            return self.ap_mac.is_some();
        }

        // AT+CIFSR style: +CIFSR:STAIP,"192.168.1.20"
        let Some(value) = after(line, ',').map(unquote) else {
            return false;
        };
        if line.contains("STAIP") {
            self.station_address = value.parse().ok();
            self.station_address.is_some()
        } else if line.contains("STAMAC") {
            self.station_mac = Some(value.to_string());
            true
        } else if line.contains("APIP") {
            self.ap_address = value.parse().ok();
            self.ap_address.is_some()
        } else if line.contains("APMAC") {
            self.ap_mac = Some(value.to_string());
            true
        } else {
            false
        }
    }

    // +CIPSTA:ip:"192.168.1.20"
    fn absorb_ip_triplet(
        line: &str,
        address: &mut Option<Ipv4Addr>,
        gateway: &mut Option<Ipv4Addr>,
        netmask: &mut Option<Ipv4Addr>,
    ) -> bool {
        let tokens: Vec<&str> = line.split(':').collect();
        if tokens.len() != 3 {
            return false;
        }
        let value = unquote(tokens[2]).parse().ok();
        match tokens[1].trim().to_ascii_lowercase().as_str() {
            "ip" => *address = value,
            "gateway" => *gateway = value,
            "netmask" => *netmask = value,
            _ => return false,
        }
        value.is_some()
    }
}

/// Raw `AT+GMR` reply lines.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirmwareVersion {
    pub lines: Vec<String>,
}

impl FirmwareVersion {
    pub fn new(lines: Vec<String>) -> Self {
        Self { lines }
    }

    fn field(&self, prefix: &str) -> Option<&str> {
        self.lines
            .iter()
            .find(|line| line.starts_with(prefix))
            .map(|line| &line[prefix.len()..])
    }

    pub fn at_version(&self) -> Option<&str> {
        self.field("AT version:")
    }

    pub fn sdk_version(&self) -> Option<&str> {
        self.field("SDK version:")
    }

    pub fn compile_time(&self) -> Option<&str> {
        self.field("compile time:")
    }
}

/// Text after the first `sep`, if any.
fn after(line: &str, sep: char) -> Option<&str> {
    line.split_once(sep).map(|(_, rest)| rest)
}

/// Strip one level of matching `"…"`, `'…'` or `(…)` around `text`.
pub fn unquote(text: &str) -> &str {
    let text = text.trim();
    let close = match text.chars().next() {
        Some('"') => '"',
        Some('\'') => '\'',
        Some('(') => ')',
        _ => return text,
    };
    if text.len() < 2 || !text.ends_with(close) {
        return text;
    }
    &text[1..text.len() - 1]
}

#[cfg(test)]
mod tests {
    use super::*;

    const LEGACY: AddressReplyPrefixes<'static> = AddressReplyPrefixes {
        station_address: "+CIPSTA:",
        ap_address: "+CIPAP:",
        station_mac: "+CIPSTAMAC:",
        ap_mac: "+CIPAPMAC:",
    };

    #[test]
    fn test_unquote() {
        assert_eq!(unquote(" \"abc\" "), "abc");
        assert_eq!(unquote("(1,2)"), "1,2");
        assert_eq!(unquote("'x"), "'x");
        assert_eq!(unquote("\""), "\"");
        assert_eq!(unquote("plain"), "plain");
    }

    #[test]
    fn test_parse_access_point() {
        let ap = AccessPoint::parse("+CWLAP:(3,\"home-net\",-52,\"a0:f3:c1:11:22:33\",1)").unwrap();
        assert_eq!(ap.ecn, Ecn::Wpa2Psk);
        assert_eq!(ap.ssid, "home-net");
        assert_eq!(ap.rssi, -52);
        assert_eq!(ap.mac_address, "a0:f3:c1:11:22:33");
        assert!(ap.automatic_connection_mode);

        let ap = AccessPoint::parse("+CWLAP:(9,\"odd\",-90,\"00:00:00:00:00:01\")").unwrap();
        assert_eq!(ap.ecn, Ecn::Unknown);
        assert!(!ap.automatic_connection_mode);

        assert!(AccessPoint::parse("+CWLAP:(3,\"short\")").is_none());
    }

    #[test]
    fn test_parse_clients_and_ap_config() {
        let client = AccessPointClient::parse("192.168.4.2,8c:85:90:aa:bb:cc").unwrap();
        assert_eq!(client.address, Ipv4Addr::new(192, 168, 4, 2));
        assert_eq!(client.mac_address, "8c:85:90:aa:bb:cc");

        let config = AccessPointConfig::parse("+CWSAP_CUR:\"studio\",\"12345678\",5,3,4,0").unwrap();
        assert_eq!(config.ssid, "studio");
        assert_eq!(config.password, "12345678");
        assert_eq!(config.channel, 5);
        assert_eq!(config.ecn, Ecn::Wpa2Psk);
    }

    #[test]
    fn test_absorb_address_lines() {
        let mut info = AddressInfo::default();
        assert!(info.absorb("+CIPSTA:ip:\"192.168.1.20\"", &LEGACY));
        assert!(info.absorb("+CIPSTA:netmask:\"255.255.255.0\"", &LEGACY));
        assert!(info.absorb("+CIPAP:gateway:\"192.168.4.1\"", &LEGACY));
        assert!(info.absorb("+CIPSTAMAC:\"5c:cf:7f:0a:0b:0c\"", &LEGACY));
        assert!(info.absorb("+CIFSR:APIP,\"192.168.4.1\"", &LEGACY));
        assert!(info.absorb("+CIFSR:APMAC,\"5e:cf:7f:0a:0b:0c\"", &LEGACY));
        assert!(!info.absorb("busy p...", &LEGACY));

        assert_eq!(info.station_address, Some(Ipv4Addr::new(192, 168, 1, 20)));
        assert_eq!(info.station_netmask, Some(Ipv4Addr::new(255, 255, 255, 0)));
        assert_eq!(info.ap_gateway, Some(Ipv4Addr::new(192, 168, 4, 1)));
        assert_eq!(info.ap_address, Some(Ipv4Addr::new(192, 168, 4, 1)));
        assert_eq!(info.station_mac.as_deref(), Some("5c:cf:7f:0a:0b:0c"));
        assert_eq!(info.ap_mac.as_deref(), Some("5e:cf:7f:0a:0b:0c"));
    }

    #[test]
    fn test_firmware_fields() {
        let version = FirmwareVersion::new(vec![
            "AT version:1.3.0.0(Jul 14 2016 18:54:01)".to_string(),
            "SDK version:2.0.0(5a875ba)".to_string(),
        ]);
        assert_eq!(version.at_version(), Some("1.3.0.0(Jul 14 2016 18:54:01)"));
        assert_eq!(version.sdk_version(), Some("2.0.0(5a875ba)"));
        assert_eq!(version.compile_time(), None);
    }

    #[test]
    fn test_mode_conversions() {
        assert_eq!(OperatingMode::try_from(2u8).unwrap(), OperatingMode::AccessPoint);
        assert!(OperatingMode::try_from(0u8).is_err());
        assert_eq!(u8::from(OperatingMode::Both), 3);
        assert_eq!(OperatingMode::AccessPoint.dhcp_selector(), 0);
        assert_eq!(Ecn::from(4), Ecn::WpaWpa2Psk);
        assert_eq!(Ecn::from(9), Ecn::Unknown);
        assert_eq!(Ecn::default(), Ecn::Unknown);
        assert_eq!(u8::from(Ecn::Unknown), 0xff);
    }
}
