//! MSP v1 command catalog.
//!
//! The catalog is a closed enumeration: adding a command means adding a variant
//! here and an arm in [`crate::parsers::parse_payload`].

use std::fmt;

use serde::{Serialize, Serializer};

/// Known MSP v1 commands and their wire ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Command {
    ApiVersion = 1,
    FcVariant = 2,
    FcVersion = 3,
    BoardInfo = 4,
    BuildInfo = 5,
    Name = 10,
    DataflashSummary = 70,
    Status = 101,
    RawImu = 102,
    Servo = 103,
    Motor = 104,
    Rc = 105,
    Attitude = 108,
    Altitude = 109,
    Analog = 110,
    Pid = 112,
    VoltageMeters = 128,
    CurrentMeters = 129,
    BatteryState = 130,
    EscSensorData = 134,
    StatusEx = 150,
    Uid = 160,
}

impl Command {
    pub const ALL: [Command; 22] = [
        Command::ApiVersion,
        Command::FcVariant,
        Command::FcVersion,
        Command::BoardInfo,
        Command::BuildInfo,
        Command::Name,
        Command::DataflashSummary,
        Command::Status,
        Command::RawImu,
        Command::Servo,
        Command::Motor,
        Command::Rc,
        Command::Attitude,
        Command::Altitude,
        Command::Analog,
        Command::Pid,
        Command::VoltageMeters,
        Command::CurrentMeters,
        Command::BatteryState,
        Command::EscSensorData,
        Command::StatusEx,
        Command::Uid,
    ];

    /// Handshake sequence issued on attach. UID is last because older firmware may not answer.
    pub const HANDSHAKE: [Command; 6] = [
        Command::ApiVersion,
        Command::FcVariant,
        Command::FcVersion,
        Command::BoardInfo,
        Command::BuildInfo,
        Command::Uid,
    ];

    #[inline]
    pub fn id(self) -> u8 {
        self as u8
    }

    pub fn from_id(id: u8) -> Option<Self> {
        Self::ALL.iter().copied().find(|c| c.id() == id)
    }

    pub fn name(self) -> &'static str {
        match self {
            Command::ApiVersion => "API_VERSION",
            Command::FcVariant => "FC_VARIANT",
            Command::FcVersion => "FC_VERSION",
            Command::BoardInfo => "BOARD_INFO",
            Command::BuildInfo => "BUILD_INFO",
            Command::Name => "NAME",
            Command::DataflashSummary => "DATAFLASH_SUMMARY",
            Command::Status => "STATUS",
            Command::RawImu => "RAW_IMU",
            Command::Servo => "SERVO",
            Command::Motor => "MOTOR",
            Command::Rc => "RC",
            Command::Attitude => "ATTITUDE",
            Command::Altitude => "ALTITUDE",
            Command::Analog => "ANALOG",
            Command::Pid => "PID",
            Command::VoltageMeters => "VOLTAGE_METERS",
            Command::CurrentMeters => "CURRENT_METERS",
            Command::BatteryState => "BATTERY_STATE",
            Command::EscSensorData => "ESC_SENSOR_DATA",
            Command::StatusEx => "STATUS_EX",
            Command::Uid => "UID",
        }
    }

    /// Look up by logical name, accepting an optional `MSP_` prefix in any case.
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_ascii_uppercase();
        let bare = upper.strip_prefix("MSP_").unwrap_or(&upper);
        Self::ALL.iter().copied().find(|c| c.name() == bare)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl From<Command> for i64 {
    fn from(command: Command) -> i64 {
        i64::from(command.id())
    }
}

impl Serialize for Command {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_round_trip() {
        for cmd in Command::ALL {
            assert_eq!(Command::from_id(cmd.id()), Some(cmd));
            assert_eq!(Command::from_name(cmd.name()), Some(cmd));
        }
        let mut ids: Vec<u8> = Command::ALL.iter().map(|c| c.id()).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), Command::ALL.len());
    }

    #[test]
    fn well_known_ids() {
        assert_eq!(Command::Status.id(), 101);
        assert_eq!(Command::Attitude.id(), 108);
        assert_eq!(Command::RawImu.id(), 102);
        assert_eq!(Command::Analog.id(), 110);
        assert_eq!(Command::VoltageMeters.id(), 128);
        assert_eq!(Command::CurrentMeters.id(), 129);
        assert_eq!(Command::BatteryState.id(), 130);
        assert_eq!(Command::Uid.id(), 160);
    }

    #[test]
    fn name_lookup_accepts_prefix() {
        assert_eq!(Command::from_name("MSP_STATUS"), Some(Command::Status));
        assert_eq!(Command::from_name("msp_raw_imu"), Some(Command::RawImu));
        assert_eq!(Command::from_name("NOPE"), None);
        assert_eq!(Command::from_id(200), None);
    }
}
