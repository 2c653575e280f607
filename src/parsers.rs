//! Payload parsers.
//!
//! Every parser is total: short or malformed payloads produce a partial record
//! flagged `invalid` instead of an error, so "zero" and "could not parse" stay
//! distinguishable downstream. All multi-byte fields are little endian.

use serde::Serialize;

use crate::commands::Command;
use crate::meters::{self, CurrentMeters, VoltageMeters};

// ============================================================================
// Common
// ============================================================================

/// A decoded payload together with its audit hex and validity flag.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parsed<T> {
    #[serde(flatten)]
    pub data: T,
    pub raw_hex: String,
    pub invalid: bool,
}

impl<T> Parsed<T> {
    pub fn new(data: T, payload: &[u8], invalid: bool) -> Self {
        Self {
            data,
            raw_hex: hex::encode(payload),
            invalid,
        }
    }
}

#[inline]
pub(crate) fn le_u16(buf: &[u8], at: usize) -> Option<u16> {
    buf.get(at..at + 2)?.try_into().ok().map(u16::from_le_bytes)
}

#[inline]
pub(crate) fn le_i16(buf: &[u8], at: usize) -> Option<i16> {
    buf.get(at..at + 2)?.try_into().ok().map(i16::from_le_bytes)
}

#[inline]
pub(crate) fn le_u32(buf: &[u8], at: usize) -> Option<u32> {
    buf.get(at..at + 4)?.try_into().ok().map(u32::from_le_bytes)
}

#[inline]
pub(crate) fn le_i32(buf: &[u8], at: usize) -> Option<i32> {
    buf.get(at..at + 4)?.try_into().ok().map(i32::from_le_bytes)
}

fn ascii(bytes: &[u8]) -> String {
    let end = bytes.iter().rposition(|&b| b != 0).map_or(0, |i| i + 1);
    bytes[..end]
        .iter()
        .filter(|b| b.is_ascii())
        .map(|&b| char::from(b))
        .collect()
}

fn ascii_field(payload: &[u8], start: usize, len: usize) -> Option<String> {
    payload.get(start..start + len).map(ascii)
}

fn triplet(payload: &[u8]) -> Option<String> {
    match payload {
        [a, b, c, ..] => Some(format!("{a}.{b}.{c}")),
        _ => None,
    }
}

// ============================================================================
// Telemetry records
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Sensor {
    #[serde(rename = "ACC")]
    Acc,
    #[serde(rename = "BARO")]
    Baro,
    #[serde(rename = "MAG")]
    Mag,
    #[serde(rename = "GPS")]
    Gps,
    #[serde(rename = "SONAR")]
    Sonar,
}

impl Sensor {
    const BITS: [Sensor; 5] = [
        Sensor::Acc,
        Sensor::Baro,
        Sensor::Mag,
        Sensor::Gps,
        Sensor::Sonar,
    ];

    pub fn from_mask(mask: u16) -> Vec<Sensor> {
        Self::BITS
            .iter()
            .enumerate()
            .filter(|(bit, _)| mask & (1 << bit) != 0)
            .map(|(_, s)| *s)
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Status {
    #[serde(rename = "cycleTime_us")]
    pub cycle_time_us: Option<u16>,
    pub i2c_errors: Option<u16>,
    pub sensors_mask: Option<u16>,
    pub sensors: Vec<Sensor>,
    pub flags: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Attitude {
    pub roll_deg: Option<f64>,
    pub pitch_deg: Option<f64>,
    pub yaw_deg: Option<f64>,
}

impl Attitude {
    /// Largest of |roll| and |pitch|, once both are known.
    pub fn tilt(&self) -> Option<f64> {
        Some(self.roll_deg?.abs().max(self.pitch_deg?.abs()))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Altitude {
    pub alt_m: Option<f64>,
    pub vario_cmps: Option<i16>,
    pub baro_alt_m: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Analog {
    #[serde(rename = "vbat_V")]
    pub vbat_v: Option<f64>,
    #[serde(rename = "mAh_used")]
    pub mah_used: Option<u16>,
    pub rssi_raw: Option<u16>,
    #[serde(rename = "amps_A")]
    pub amps_a: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RawImu {
    pub acc: Option<[i16; 3]>,
    pub gyro: Option<[i16; 3]>,
    pub mag: Option<[i16; 3]>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RcChannels {
    pub channels: Vec<u16>,
    pub min: Option<u16>,
    pub max: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Motors {
    pub motors: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatteryState {
    pub connected: Option<bool>,
    #[serde(rename = "voltage_V")]
    pub voltage_v: Option<f64>,
    #[serde(rename = "mAh_used")]
    pub mah_used: Option<u32>,
    #[serde(rename = "amps_A")]
    pub amps_a: Option<f64>,
    pub flags: Option<u16>,
}

pub fn parse_status(payload: &[u8]) -> Parsed<Status> {
    let sensors_mask = le_u16(payload, 4);
    let status = Status {
        cycle_time_us: le_u16(payload, 0),
        i2c_errors: le_u16(payload, 2),
        sensors_mask,
        sensors: sensors_mask.map(Sensor::from_mask).unwrap_or_default(),
        flags: le_u32(payload, 6),
    };
    Parsed::new(status, payload, payload.len() < 10)
}

pub fn parse_attitude(payload: &[u8]) -> Parsed<Attitude> {
    let attitude = Attitude {
        roll_deg: le_i16(payload, 0).map(|v| f64::from(v) / 10.0),
        pitch_deg: le_i16(payload, 2).map(|v| f64::from(v) / 10.0),
        yaw_deg: le_i16(payload, 4).map(f64::from),
    };
    Parsed::new(attitude, payload, payload.len() < 6)
}

pub fn parse_altitude(payload: &[u8]) -> Parsed<Altitude> {
    let altitude = Altitude {
        alt_m: le_i32(payload, 0).map(|v| f64::from(v) / 100.0),
        vario_cmps: le_i16(payload, 4),
        baro_alt_m: le_i32(payload, 6).map(|v| f64::from(v) / 100.0),
    };
    Parsed::new(altitude, payload, payload.len() < 6)
}

pub fn parse_analog(payload: &[u8]) -> Parsed<Analog> {
    let analog = Analog {
        vbat_v: payload.first().map(|&v| f64::from(v) / 10.0),
        mah_used: le_u16(payload, 1),
        rssi_raw: le_u16(payload, 3),
        amps_a: le_i16(payload, 5).map(|v| f64::from(v) / 100.0),
    };
    Parsed::new(analog, payload, payload.len() < 7)
}

pub fn parse_raw_imu(payload: &[u8]) -> Parsed<RawImu> {
    let axes = |at: usize| -> Option<[i16; 3]> {
        Some([
            le_i16(payload, at)?,
            le_i16(payload, at + 2)?,
            le_i16(payload, at + 4)?,
        ])
    };
    let imu = RawImu {
        acc: axes(0),
        gyro: axes(6),
        mag: axes(12),
    };
    Parsed::new(imu, payload, payload.len() < 18)
}

pub fn parse_rc(payload: &[u8]) -> Parsed<RcChannels> {
    let channels: Vec<u16> = payload
        .chunks_exact(2)
        .take(16)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    let rc = RcChannels {
        min: channels.iter().copied().min(),
        max: channels.iter().copied().max(),
        channels,
    };
    Parsed::new(rc, payload, payload.len() < 32)
}

pub fn parse_motor(payload: &[u8]) -> Parsed<Motors> {
    let motors = payload
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    Parsed::new(Motors { motors }, payload, payload.len() % 2 != 0)
}

/// Two firmware layouts exist:
/// - 7 or 9 bytes: connected(u8), voltage(u16 /100), mAh(u32), [amps(i16 /100)]
/// - 10+ bytes: voltage(u32 /100), mAh(u16), amps(i16 /100), flags(u16, bit0 = connected)
pub fn parse_battery_state(payload: &[u8]) -> Parsed<BatteryState> {
    let battery = match payload.len() {
        7 | 9 => BatteryState {
            connected: payload.first().map(|&b| b != 0),
            voltage_v: le_u16(payload, 1).map(|v| f64::from(v) / 100.0),
            mah_used: le_u32(payload, 3),
            amps_a: le_i16(payload, 7).map(|v| f64::from(v) / 100.0),
            flags: None,
        },
        n if n >= 10 => {
            let flags = le_u16(payload, 8);
            BatteryState {
                connected: flags.map(|f| f & 0x01 != 0),
                voltage_v: le_u32(payload, 0).map(|v| f64::from(v) / 100.0),
                mah_used: le_u16(payload, 4).map(u32::from),
                amps_a: le_i16(payload, 6).map(|v| f64::from(v) / 100.0),
                flags,
            }
        }
        _ => return Parsed::new(BatteryState::default(), payload, true),
    };
    Parsed::new(battery, payload, false)
}

// ============================================================================
// Identity records
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ApiVersion {
    pub protocol: Option<u8>,
    pub api_major: Option<u8>,
    pub api_minor: Option<u8>,
    pub version: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Text {
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FcVersion {
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BoardInfo {
    pub board_id: String,
    pub hardware_revision: Option<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildInfo {
    pub date: Option<String>,
    pub time: Option<String>,
    pub git_revision: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Uid {
    pub uid: Option<String>,
}

pub fn parse_api_version(payload: &[u8]) -> Parsed<ApiVersion> {
    let api = ApiVersion {
        protocol: payload.first().copied(),
        api_major: payload.get(1).copied(),
        api_minor: payload.get(2).copied(),
        version: triplet(payload).unwrap_or_else(|| "0.0.0".into()),
    };
    Parsed::new(api, payload, payload.len() < 3)
}

/// FC_VARIANT: four ASCII characters such as `BTFL` or `INAV`.
pub fn parse_fc_variant(payload: &[u8]) -> Parsed<Text> {
    let value = ascii(&payload[..payload.len().min(4)]);
    Parsed::new(Text { value }, payload, payload.len() < 4)
}

pub fn parse_fc_version(payload: &[u8]) -> Parsed<FcVersion> {
    let version = triplet(payload);
    let invalid = version.is_none();
    Parsed::new(FcVersion { version }, payload, invalid)
}

pub fn parse_board_info(payload: &[u8]) -> Parsed<BoardInfo> {
    let board = BoardInfo {
        board_id: ascii(&payload[..payload.len().min(4)]),
        hardware_revision: le_u16(payload, 4),
    };
    Parsed::new(board, payload, payload.len() < 4)
}

/// BUILD_INFO: date (11 chars), time (8 chars), git revision (7 chars).
pub fn parse_build_info(payload: &[u8]) -> Parsed<BuildInfo> {
    let build = BuildInfo {
        date: ascii_field(payload, 0, 11),
        time: ascii_field(payload, 11, 8),
        git_revision: ascii_field(payload, 19, 7),
    };
    Parsed::new(build, payload, payload.len() < 26)
}

pub fn parse_name(payload: &[u8]) -> Parsed<Text> {
    Parsed::new(
        Text {
            value: ascii(payload),
        },
        payload,
        false,
    )
}

/// UID: three u32 words rendered as 24 uppercase hex digits.
pub fn parse_uid(payload: &[u8]) -> Parsed<Uid> {
    if payload.len() != 12 {
        return Parsed::new(Uid::default(), payload, true);
    }
    let uid = (0..3)
        .filter_map(|word| le_u32(payload, word * 4))
        .map(|w| format!("{w:08X}"))
        .collect::<String>();
    Parsed::new(Uid { uid: Some(uid) }, payload, false)
}

// ============================================================================
// Dispatch
// ============================================================================

/// Decoded record for any command id.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Record {
    ApiVersion(ApiVersion),
    FcVariant(Text),
    FcVersion(FcVersion),
    BoardInfo(BoardInfo),
    BuildInfo(BuildInfo),
    Name(Text),
    Uid(Uid),
    Status(Status),
    Attitude(Attitude),
    Altitude(Altitude),
    Analog(Analog),
    RawImu(RawImu),
    Rc(RcChannels),
    Motor(Motors),
    VoltageMeters(VoltageMeters),
    CurrentMeters(CurrentMeters),
    BatteryState(BatteryState),
    /// Commands decoded only as hex (STATUS_EX, DATAFLASH_SUMMARY, ...).
    Raw,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedPayload {
    pub command: u8,
    pub record: Record,
    pub raw_hex: String,
    pub invalid: bool,
}

impl ParsedPayload {
    fn from_parsed<T>(command: u8, parsed: Parsed<T>, wrap: impl FnOnce(T) -> Record) -> Self {
        Self {
            command,
            record: wrap(parsed.data),
            raw_hex: parsed.raw_hex,
            invalid: parsed.invalid,
        }
    }
}

/// Decode `payload` according to the parser registered for `command`.
pub fn parse_payload(command: u8, payload: &[u8]) -> ParsedPayload {
    match Command::from_id(command) {
        Some(Command::ApiVersion) => {
            ParsedPayload::from_parsed(command, parse_api_version(payload), Record::ApiVersion)
        }
        Some(Command::FcVariant) => {
            ParsedPayload::from_parsed(command, parse_fc_variant(payload), Record::FcVariant)
        }
        Some(Command::FcVersion) => {
            ParsedPayload::from_parsed(command, parse_fc_version(payload), Record::FcVersion)
        }
        Some(Command::BoardInfo) => {
            ParsedPayload::from_parsed(command, parse_board_info(payload), Record::BoardInfo)
        }
        Some(Command::BuildInfo) => {
            ParsedPayload::from_parsed(command, parse_build_info(payload), Record::BuildInfo)
        }
        Some(Command::Name) => ParsedPayload::from_parsed(command, parse_name(payload), Record::Name),
        Some(Command::Uid) => ParsedPayload::from_parsed(command, parse_uid(payload), Record::Uid),
        Some(Command::Status) => {
            ParsedPayload::from_parsed(command, parse_status(payload), Record::Status)
        }
        Some(Command::Attitude) => {
            ParsedPayload::from_parsed(command, parse_attitude(payload), Record::Attitude)
        }
        Some(Command::Altitude) => {
            ParsedPayload::from_parsed(command, parse_altitude(payload), Record::Altitude)
        }
        Some(Command::Analog) => {
            ParsedPayload::from_parsed(command, parse_analog(payload), Record::Analog)
        }
        Some(Command::RawImu) => {
            ParsedPayload::from_parsed(command, parse_raw_imu(payload), Record::RawImu)
        }
        Some(Command::Rc) => ParsedPayload::from_parsed(command, parse_rc(payload), Record::Rc),
        Some(Command::Motor) => {
            ParsedPayload::from_parsed(command, parse_motor(payload), Record::Motor)
        }
        Some(Command::VoltageMeters) => ParsedPayload::from_parsed(
            command,
            meters::parse_voltage_meters(payload),
            Record::VoltageMeters,
        ),
        Some(Command::CurrentMeters) => ParsedPayload::from_parsed(
            command,
            meters::parse_current_meters(payload),
            Record::CurrentMeters,
        ),
        Some(Command::BatteryState) => ParsedPayload::from_parsed(
            command,
            parse_battery_state(payload),
            Record::BatteryState,
        ),
        Some(
            Command::StatusEx
            | Command::DataflashSummary
            | Command::EscSensorData
            | Command::Servo
            | Command::Pid,
        )
        | None => ParsedPayload {
            command,
            record: Record::Raw,
            raw_hex: hex::encode(payload),
            invalid: false,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(a: Option<f64>, b: f64) -> bool {
        a.is_some_and(|a| (a - b).abs() < 1e-9)
    }

    #[test]
    fn attitude_fixture() {
        let parsed = parse_attitude(&[0x64, 0x00, 0x9C, 0xFF, 0x20, 0x03]);
        assert!(!parsed.invalid);
        assert!(approx(parsed.data.roll_deg, 10.0));
        assert!(approx(parsed.data.pitch_deg, -10.0));
        assert!(approx(parsed.data.yaw_deg, 800.0));
        assert!(approx(parsed.data.tilt(), 10.0));
        assert_eq!(parsed.raw_hex, "64009cff2003");
    }

    #[test]
    fn attitude_short_payload_is_partial() {
        let parsed = parse_attitude(&[0x64, 0x00, 0x9C]);
        assert!(parsed.invalid);
        assert!(approx(parsed.data.roll_deg, 10.0));
        assert_eq!(parsed.data.pitch_deg, None);
        assert_eq!(parsed.data.tilt(), None);
    }

    #[test]
    fn analog_fixture() {
        let parsed = parse_analog(&[112, 0x10, 0x27, 0x34, 0x12, 0xF4, 0x01]);
        assert!(!parsed.invalid);
        assert!(approx(parsed.data.vbat_v, 11.2));
        assert_eq!(parsed.data.mah_used, Some(10000));
        assert_eq!(parsed.data.rssi_raw, Some(4660));
        assert!(approx(parsed.data.amps_a, 5.0));
    }

    #[test]
    fn status_fields_and_sensors() {
        let payload = [0x10, 0x27, 0x02, 0x00, 0x05, 0x00, 0xAA, 0x55, 0x00, 0x00];
        let parsed = parse_status(&payload);
        assert!(!parsed.invalid);
        assert_eq!(parsed.data.cycle_time_us, Some(10000));
        assert_eq!(parsed.data.i2c_errors, Some(2));
        assert_eq!(parsed.data.sensors, vec![Sensor::Acc, Sensor::Mag]);
        assert_eq!(parsed.data.flags, Some(0x55AA));

        let short = parse_status(&payload[..4]);
        assert!(short.invalid);
        assert_eq!(short.data.i2c_errors, Some(2));
        assert_eq!(short.data.flags, None);
        assert!(short.data.sensors.is_empty());
    }

    #[test]
    fn altitude_with_and_without_baro() {
        let mut payload = 1000i32.to_le_bytes().to_vec();
        payload.extend(50i16.to_le_bytes());
        let parsed = parse_altitude(&payload);
        assert!(!parsed.invalid);
        assert!(approx(parsed.data.alt_m, 10.0));
        assert_eq!(parsed.data.vario_cmps, Some(50));
        assert_eq!(parsed.data.baro_alt_m, None);

        payload.extend(1500i32.to_le_bytes());
        assert!(approx(parse_altitude(&payload).data.baro_alt_m, 15.0));
        assert!(parse_altitude(&payload[..5]).invalid);
    }

    #[test]
    fn raw_imu_axes() {
        let values: [i16; 9] = [1, 2, 512, -3, 4, -5, 100, 200, 300];
        let payload: Vec<u8> = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        let parsed = parse_raw_imu(&payload);
        assert!(!parsed.invalid);
        assert_eq!(parsed.data.acc, Some([1, 2, 512]));
        assert_eq!(parsed.data.gyro, Some([-3, 4, -5]));
        assert_eq!(parsed.data.mag, Some([100, 200, 300]));

        let partial = parse_raw_imu(&payload[..12]);
        assert!(partial.invalid);
        assert_eq!(partial.data.gyro, Some([-3, 4, -5]));
        assert_eq!(partial.data.mag, None);
    }

    #[test]
    fn rc_and_motor() {
        let payload: Vec<u8> = (0..16u16).flat_map(|i| (1000 + i * 10).to_le_bytes()).collect();
        let rc = parse_rc(&payload);
        assert!(!rc.invalid);
        assert_eq!(rc.data.channels.len(), 16);
        assert_eq!(rc.data.min, Some(1000));
        assert_eq!(rc.data.max, Some(1150));
        assert!(parse_rc(&payload[..8]).invalid);

        let motors = parse_motor(&[0xE8, 0x03, 0xD0, 0x07]);
        assert_eq!(motors.data.motors, vec![1000, 2000]);
        assert!(!motors.invalid);
        assert!(parse_motor(&[1, 2, 3]).invalid);
    }

    #[test]
    fn battery_layouts() {
        let compact = parse_battery_state(&[1, 0xB0, 0x04, 0x10, 0x27, 0, 0, 0xF4, 0x01]);
        assert!(!compact.invalid);
        assert_eq!(compact.data.connected, Some(true));
        assert!(approx(compact.data.voltage_v, 12.0));
        assert_eq!(compact.data.mah_used, Some(10000));
        assert!(approx(compact.data.amps_a, 5.0));

        let compact7 = parse_battery_state(&[0, 0xB0, 0x04, 0, 0, 0, 0]);
        assert_eq!(compact7.data.connected, Some(false));
        assert_eq!(compact7.data.amps_a, None);

        let mut extended = 1680u32.to_le_bytes().to_vec();
        extended.extend(250u16.to_le_bytes());
        extended.extend(120i16.to_le_bytes());
        extended.extend(1u16.to_le_bytes());
        let ext = parse_battery_state(&extended);
        assert!(!ext.invalid);
        assert!(approx(ext.data.voltage_v, 16.8));
        assert_eq!(ext.data.mah_used, Some(250));
        assert!(approx(ext.data.amps_a, 1.2));
        assert_eq!(ext.data.connected, Some(true));

        assert!(parse_battery_state(&[0x01, 0x10, 0x27]).invalid);
        assert!(parse_battery_state(&[0; 8]).invalid);
    }

    #[test]
    fn identity_records() {
        let uid = parse_uid(&[
            0x01, 0x00, 0x00, 0x00, 0xEF, 0xBE, 0xAD, 0xDE, 0x78, 0x56, 0x34, 0x12,
        ]);
        assert_eq!(uid.data.uid.as_deref(), Some("00000001DEADBEEF12345678"));
        assert!(parse_uid(&[0; 11]).invalid);
        assert!(parse_uid(&[0; 13]).invalid);

        let api = parse_api_version(&[0, 1, 46]);
        assert_eq!(api.data.version, "0.1.46");
        assert!(parse_api_version(&[0]).invalid);

        assert_eq!(parse_fc_variant(b"BTFL").data.value, "BTFL");
        assert_eq!(
            parse_fc_version(&[4, 5, 0]).data.version.as_deref(),
            Some("4.5.0")
        );

        let board = parse_board_info(&[b'S', b'7', b'X', b'2', 3, 0]);
        assert_eq!(board.data.board_id, "S7X2");
        assert_eq!(board.data.hardware_revision, Some(3));

        let name = parse_name(b"quad\0\0");
        assert_eq!(name.data.value, "quad");
    }

    #[test]
    fn build_info_fixed_offsets() {
        let payload = b"Jan 01 202412:34:56abcdef1";
        let parsed = parse_build_info(payload);
        assert!(!parsed.invalid);
        assert_eq!(parsed.data.date.as_deref(), Some("Jan 01 2024"));
        assert_eq!(parsed.data.time.as_deref(), Some("12:34:56"));
        assert_eq!(parsed.data.git_revision.as_deref(), Some("abcdef1"));

        let short = parse_build_info(&payload[..20]);
        assert!(short.invalid);
        assert_eq!(short.data.git_revision, None);
    }

    #[test]
    fn dispatch_by_command() {
        let parsed = parse_payload(108, &[0x64, 0x00, 0x9C, 0xFF, 0x20, 0x03]);
        assert!(matches!(parsed.record, Record::Attitude(_)));
        assert_eq!(parsed.command, 108);

        let raw = parse_payload(150, &[1, 2, 3]);
        assert_eq!(raw.record, Record::Raw);
        assert_eq!(raw.raw_hex, "010203");
        assert!(!raw.invalid);

        let unknown = parse_payload(222, &[]);
        assert_eq!(unknown.record, Record::Raw);

        let meters = parse_payload(128, &[1, 0x01]);
        assert!(meters.invalid);
    }

    #[test]
    fn records_serialize_with_report_keys() {
        let parsed = parse_analog(&[112, 0x10, 0x27, 0x34, 0x12, 0xF4, 0x01]);
        let json = serde_json::to_value(&parsed).unwrap();
        assert_eq!(json["vbat_V"], 11.2);
        assert_eq!(json["mAh_used"], 10000);
        assert_eq!(json["invalid"], false);
        assert_eq!(json["raw_hex"], "7010273412f401");
    }
}
