use std::fmt;

use serde::{Deserialize, Serialize};
use strum::{EnumCount, EnumIter, IntoEnumIterator, IntoStaticStr};

use crate::error::{AtError, AtResult};

/// Everything the driver ever asks the module, independent of the firmware's
/// spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumCount, EnumIter, IntoStaticStr)]
pub enum Command {
    EchoOff,
    Reset,
    Restore,
    GetFirmwareVersion,
    SetOperatingMode,
    GetOperatingMode,
    OperatingModeReply,
    SetDhcp,
    SetAccessPoint,
    GetAccessPoint,
    AccessPointReply,
    GetAddressInformation,
    SetStationAddress,
    GetStationAddress,
    StationAddressReply,
    SetApAddress,
    GetApAddress,
    ApAddressReply,
    GetStationMac,
    StationMacReply,
    SetStationMac,
    GetApMac,
    ApMacReply,
    SetApMac,
    ListAccessPoints,
    SortAccessPoints,
    JoinAccessPoint,
    QuitAccessPoint,
    ListConnectedClients,
    DeepSleep,
    SetMuxMode,
    SessionStart,
    SessionEnd,
    Server,
    Update,
    LinkedReply,
    Send,
    SendReply,
}

/// Firmware command-set generation, picked from the `AT version:` line.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dialect {
    /// AT firmware before 0.51: one spelling per command.
    #[default]
    Legacy,
    /// AT firmware 0.51 and 1.x: separate current (`_CUR`) and persisted
    /// (`_DEF`) spellings for configuration commands.
    Extended,
}

impl Dialect {
    pub fn from_at_version(version: Option<&str>) -> Self {
        match version.map(str::trim) {
            Some(v) if v.starts_with("1.") || v.starts_with("0.51") => Dialect::Extended,
            _ => Dialect::Legacy,
        }
    }
}

impl fmt::Display for Dialect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dialect::Legacy => write!(f, "legacy"),
            Dialect::Extended => write!(f, "extended"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Phrase {
    current: &'static str,
    persisted: &'static str,
}

const fn same(text: &'static str) -> Option<Phrase> {
    Some(Phrase {
        current: text,
        persisted: text,
    })
}

const fn pair(current: &'static str, persisted: &'static str) -> Option<Phrase> {
    Some(Phrase { current, persisted })
}

fn legacy_phrase(command: Command) -> Option<Phrase> {
    use Command::*;
    match command {
        EchoOff => same("ATE0"),
        Reset => same("AT+RST"),
        Restore => None,
        GetFirmwareVersion => same("AT+GMR"),
        SetOperatingMode => same("AT+CWMODE="),
        GetOperatingMode => same("AT+CWMODE?"),
        OperatingModeReply => same("+CWMODE:"),
        SetDhcp => same("AT+CWDHCP="),
        SetAccessPoint => same("AT+CWSAP="),
        GetAccessPoint => same("AT+CWSAP?"),
        AccessPointReply => same("+CWSAP:"),
        GetAddressInformation => same("AT+CIFSR"),
        SetStationAddress => same("AT+CIPSTA="),
        GetStationAddress => same("AT+CIPSTA?"),
        StationAddressReply => same("+CIPSTA:"),
        SetApAddress => same("AT+CIPAP="),
        GetApAddress => same("AT+CIPAP?"),
        ApAddressReply => same("+CIPAP:"),
        GetStationMac => same("AT+CIPSTAMAC?"),
        StationMacReply => same("+CIPSTAMAC:"),
        SetStationMac => same("AT+CIPSTAMAC="),
        GetApMac => same("AT+CIPAPMAC?"),
        ApMacReply => same("+CIPAPMAC:"),
        SetApMac => same("AT+CIPAPMAC="),
        ListAccessPoints => same("AT+CWLAP"),
        SortAccessPoints => same("AT+CWLAPOPT=1,31"),
        JoinAccessPoint => same("AT+CWJAP="),
        QuitAccessPoint => same("AT+CWQAP"),
        ListConnectedClients => same("AT+CWLIF"),
        DeepSleep => same("AT+GSLP="),
        SetMuxMode => same("AT+CIPMUX="),
        SessionStart => same("AT+CIPSTART="),
        SessionEnd => same("AT+CIPCLOSE="),
        Server => same("AT+CIPSERVER="),
        Update => same("AT+CIUPDATE"),
        LinkedReply => same("Linked"),
        Send => same("AT+CIPSEND="),
        SendReply => same("SEND OK"),
    }
}

fn extended_phrase(command: Command) -> Option<Phrase> {
    use Command::*;
    match command {
        Restore => pair("AT+RESTORE", "AT+RESTORE"),
        SetOperatingMode => pair("AT+CWMODE_CUR=", "AT+CWMODE_DEF="),
        GetOperatingMode => pair("AT+CWMODE_CUR?", "AT+CWMODE_DEF?"),
        OperatingModeReply => pair("+CWMODE_CUR:", "+CWMODE_DEF:"),
        SetDhcp => pair("AT+CWDHCP_CUR=", "AT+CWDHCP_DEF="),
        SetAccessPoint => pair("AT+CWSAP_CUR=", "AT+CWSAP_DEF="),
        GetAccessPoint => pair("AT+CWSAP_CUR?", "AT+CWSAP_DEF?"),
        AccessPointReply => pair("+CWSAP_CUR:", "+CWSAP_DEF:"),
        SetStationAddress => pair("AT+CIPSTA_CUR=", "AT+CIPSTA_DEF="),
        GetStationAddress => pair("AT+CIPSTA_CUR?", "AT+CIPSTA_DEF?"),
        StationAddressReply => pair("+CIPSTA_CUR:", "+CIPSTA_DEF:"),
        SetApAddress => pair("AT+CIPAP_CUR=", "AT+CIPAP_DEF="),
        GetApAddress => pair("AT+CIPAP_CUR?", "AT+CIPAP_DEF?"),
        ApAddressReply => pair("+CIPAP_CUR:", "+CIPAP_DEF:"),
        GetStationMac => pair("AT+CIPSTAMAC_CUR?", "AT+CIPSTAMAC_DEF?"),
        StationMacReply => pair("+CIPSTAMAC_CUR:", "+CIPSTAMAC_DEF:"),
        SetStationMac => pair("AT+CIPSTAMAC_CUR=", "AT+CIPSTAMAC_DEF="),
        GetApMac => pair("AT+CIPAPMAC_CUR?", "AT+CIPAPMAC_DEF?"),
        ApMacReply => pair("+CIPAPMAC_CUR:", "+CIPAPMAC_DEF:"),
        SetApMac => pair("AT+CIPAPMAC_CUR=", "AT+CIPAPMAC_DEF="),
        JoinAccessPoint => pair("AT+CWJAP_CUR=", "AT+CWJAP_DEF="),
        // Newer firmware answers CONNECT instead.
        LinkedReply => None,
        other => legacy_phrase(other),
    }
}

/// Literal command strings for one dialect, fixed once bring-up has read the
/// firmware version.
#[derive(Debug, Clone)]
pub struct Vocabulary {
    dialect: Dialect,
    table: [Option<Phrase>; Command::COUNT],
}

impl Vocabulary {
    pub fn new(dialect: Dialect) -> Self {
        let mut table = [None; Command::COUNT];
        for command in Command::iter() {
            table[command as usize] = match dialect {
                Dialect::Legacy => legacy_phrase(command),
                Dialect::Extended => extended_phrase(command),
            };
        }
        Self { dialect, table }
    }

    pub fn dialect(&self) -> Dialect {
        self.dialect
    }

    /// The current (non-persisted) spelling of `command`.
    pub fn get(&self, command: Command) -> AtResult<&'static str> {
        self.lookup(command, false)
    }

    /// Spelling of `command`, choosing the persisted variant when `persist`
    /// is set and the dialect distinguishes the two.
    pub fn lookup(&self, command: Command, persist: bool) -> AtResult<&'static str> {
        let phrase = self.table[command as usize].ok_or_else(|| {
            let name: &'static str = command.into();
            AtError::ProtocolFault(format!(
                "command {name} is not supported by the {} firmware dialect",
                self.dialect
            ))
        })?;
        Ok(if persist {
            phrase.persisted
        } else {
            phrase.current
        })
    }

    pub fn supports(&self, command: Command) -> bool {
        self.table[command as usize].is_some()
    }
}

impl Default for Vocabulary {
    fn default() -> Self {
        Self::new(Dialect::Legacy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dialect_selection() {
        assert_eq!(Dialect::from_at_version(Some("1.3.0.0(Jul 14 2016)")), Dialect::Extended);
        assert_eq!(Dialect::from_at_version(Some("0.51.0.0(Nov 27 2015)")), Dialect::Extended);
        assert_eq!(Dialect::from_at_version(Some("0.40.0.0(Aug  8 2015)")), Dialect::Legacy);
        assert_eq!(Dialect::from_at_version(Some("2.2.0.0")), Dialect::Legacy);
        assert_eq!(Dialect::from_at_version(None), Dialect::Legacy);
    }

    #[test]
    fn test_legacy_table() {
        let vocabulary = Vocabulary::new(Dialect::Legacy);
        assert_eq!(vocabulary.get(Command::SetOperatingMode).unwrap(), "AT+CWMODE=");
        assert_eq!(
            vocabulary.lookup(Command::JoinAccessPoint, true).unwrap(),
            "AT+CWJAP="
        );
        assert_eq!(vocabulary.get(Command::LinkedReply).unwrap(), "Linked");
        assert!(matches!(
            vocabulary.get(Command::Restore),
            Err(AtError::ProtocolFault(_))
        ));
    }

    #[test]
    fn test_extended_table() {
        let vocabulary = Vocabulary::new(Dialect::Extended);
        assert_eq!(
            vocabulary.get(Command::SetOperatingMode).unwrap(),
            "AT+CWMODE_CUR="
        );
        assert_eq!(
            vocabulary.lookup(Command::SetOperatingMode, true).unwrap(),
            "AT+CWMODE_DEF="
        );
        assert_eq!(
            vocabulary.lookup(Command::StationMacReply, true).unwrap(),
            "+CIPSTAMAC_DEF:"
        );
        assert_eq!(vocabulary.get(Command::Restore).unwrap(), "AT+RESTORE");
        assert_eq!(vocabulary.lookup(Command::Reset, true).unwrap(), "AT+RST");
        assert!(!vocabulary.supports(Command::LinkedReply));
        assert!(vocabulary.get(Command::LinkedReply).is_err());
    }

    #[test]
    fn test_every_command_resolves_in_some_dialect() {
        let legacy = Vocabulary::new(Dialect::Legacy);
        let extended = Vocabulary::new(Dialect::Extended);
        for command in Command::iter() {
            assert!(
                legacy.supports(command) || extended.supports(command),
                "{command:?} has no spelling"
            );
        }
    }
}
