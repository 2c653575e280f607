//! VOLTAGE_METERS / CURRENT_METERS decoding.
//!
//! Both payloads start with a declared meter count. Firmware variants differ in
//! what follows, so the layout is chosen by which entry width multiplies out to
//! the remaining length exactly. Anything else is reported invalid with no meters.

use serde::Serialize;

use crate::parsers::{le_i16, le_i32, le_u16, Parsed};

/// Entry layout selected for a meter payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MeterLayout {
    /// id(u8) + value(u16)
    IdU16,
    /// id(u8) + value(i16), centiamps
    IdI16,
    /// id(u8) + value(i32), milliamps
    IdI32,
    /// bare 16-bit values, no ids
    ValuesOnly,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VoltageMeter {
    /// Firmware meter id; `None` for the values-only layout.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u8>,
    pub index: usize,
    pub value_raw: u16,
    #[serde(rename = "voltage_V")]
    pub voltage_v: f64,
    pub unit: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CurrentMeter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<u8>,
    pub index: usize,
    pub value_raw: i32,
    #[serde(rename = "amps_A")]
    pub amps_a: f64,
    pub unit: &'static str,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Meters<M> {
    pub count_declared: Option<u8>,
    pub format: Option<MeterLayout>,
    pub meters: Vec<M>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<M> Default for Meters<M> {
    fn default() -> Self {
        Self {
            count_declared: None,
            format: None,
            meters: Vec::new(),
            error: None,
        }
    }
}

pub type VoltageMeters = Meters<VoltageMeter>;
pub type CurrentMeters = Meters<CurrentMeter>;

/// Raw values up to 255 are tenths of a volt, larger ones hundredths.
fn voltage_from_raw(raw: u16) -> (f64, &'static str) {
    if raw <= 255 {
        (f64::from(raw) / 10.0, "V(0.1)")
    } else {
        (f64::from(raw) / 100.0, "V(0.01)")
    }
}

/// Split off the declared count and handle the shared empty/zero-count cases.
///
/// Returns the count and remaining bytes when entries should be decoded.
fn split_count<'a, M>(payload: &'a [u8], out: &mut Meters<M>) -> Option<(u8, &'a [u8])> {
    let (&count, rest) = match payload.split_first() {
        Some(split) => split,
        None => {
            out.error = Some("missing count".into());
            return None;
        }
    };
    out.count_declared = Some(count);
    if count == 0 {
        if !rest.is_empty() {
            out.error = Some("unexpected payload for zero count".into());
        }
        return None;
    }
    Some((count, rest))
}

fn finish<M>(payload: &[u8], mut out: Meters<M>) -> Parsed<Meters<M>> {
    let declared = out.count_declared.map(usize::from);
    if out.error.is_none() && out.format.is_some() && declared != Some(out.meters.len()) {
        out.error = Some("entry count does not match declared count".into());
    }
    let invalid = out.error.is_some();
    Parsed::new(out, payload, invalid)
}

pub fn parse_voltage_meters(payload: &[u8]) -> Parsed<VoltageMeters> {
    let mut out = VoltageMeters::default();
    let Some((count, rest)) = split_count(payload, &mut out) else {
        return finish(payload, out);
    };
    let count = usize::from(count);

    if rest.len() == count * 3 {
        out.format = Some(MeterLayout::IdU16);
        out.meters = rest
            .chunks_exact(3)
            .enumerate()
            .filter_map(|(index, entry)| {
                let value_raw = le_u16(entry, 1)?;
                let (voltage_v, unit) = voltage_from_raw(value_raw);
                Some(VoltageMeter {
                    id: Some(entry[0]),
                    index,
                    value_raw,
                    voltage_v,
                    unit,
                })
            })
            .collect();
    } else if rest.len() == count * 2 {
        out.format = Some(MeterLayout::ValuesOnly);
        out.meters = rest
            .chunks_exact(2)
            .enumerate()
            .filter_map(|(index, entry)| {
                let value_raw = le_u16(entry, 0)?;
                let (voltage_v, unit) = voltage_from_raw(value_raw);
                Some(VoltageMeter {
                    id: None,
                    index,
                    value_raw,
                    voltage_v,
                    unit,
                })
            })
            .collect();
    } else {
        out.error = Some(format!("payload length mismatch ({} bytes)", payload.len()));
    }
    finish(payload, out)
}

pub fn parse_current_meters(payload: &[u8]) -> Parsed<CurrentMeters> {
    let mut out = CurrentMeters::default();
    let Some((count, rest)) = split_count(payload, &mut out) else {
        return finish(payload, out);
    };
    let count = usize::from(count);

    let (layout, width) = if rest.len() == count * 3 {
        (MeterLayout::IdI16, 3)
    } else if rest.len() == count * 5 {
        (MeterLayout::IdI32, 5)
    } else if rest.len() == count * 2 {
        (MeterLayout::ValuesOnly, 2)
    } else {
        out.error = Some(format!("payload length mismatch ({} bytes)", payload.len()));
        return finish(payload, out);
    };

    out.format = Some(layout);
    out.meters = rest
        .chunks_exact(width)
        .enumerate()
        .filter_map(|(index, entry)| {
            let (id, value_raw, amps_a, unit) = match layout {
                MeterLayout::IdI32 => {
                    let raw = le_i32(entry, 1)?;
                    (Some(entry[0]), raw, f64::from(raw) / 1000.0, "A(1mA)")
                }
                MeterLayout::IdI16 | MeterLayout::IdU16 => {
                    let raw = i32::from(le_i16(entry, 1)?);
                    (Some(entry[0]), raw, f64::from(raw) / 100.0, "A(0.01)")
                }
                MeterLayout::ValuesOnly => {
                    let raw = i32::from(le_i16(entry, 0)?);
                    (None, raw, f64::from(raw) / 100.0, "A(0.01)")
                }
            };
            Some(CurrentMeter {
                id,
                index,
                value_raw,
                amps_a,
                unit,
            })
        })
        .collect();
    finish(payload, out)
}
