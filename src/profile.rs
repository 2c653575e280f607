//! Threshold profiles.
//!
//! A profile document is YAML with a top level `profiles` mapping:
//!
//! ```yaml
//! profiles:
//!   bench:
//!     ignore_tilt: true
//!     max_tilt: 5
//!     max_gyro_std: 6
//!     max_gyro_bias: 12
//!     max_accnorm_std: 6
//!     max_cyc_jitter: 20
//!     max_i2c_errors: 0
//!     min_vbat: 3.3          # optional
//!     sample_rates:          # optional, Hz; 0 disables a command
//!       raw_imu: 100
//! ```
//!
//! Profiles are immutable once resolved; CLI overrides produce a new value.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};

use crate::commands::Command;
use crate::errors::{MspError, Result};

/// Per-command polling rates in Hz. Zero disables a command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleRates {
    #[serde(alias = "status_hz")]
    pub status: f64,
    #[serde(alias = "attitude_hz")]
    pub attitude: f64,
    #[serde(alias = "raw_imu_hz")]
    pub raw_imu: f64,
    #[serde(alias = "analog_hz")]
    pub analog: f64,
    #[serde(alias = "voltage_hz")]
    pub voltage: f64,
    #[serde(alias = "current_hz")]
    pub current: f64,
    #[serde(alias = "battery_hz")]
    pub battery: f64,
    #[serde(alias = "altitude_hz")]
    pub altitude: f64,
    #[serde(alias = "rc_hz")]
    pub rc: f64,
    #[serde(alias = "motor_hz")]
    pub motor: f64,
}

impl Default for SampleRates {
    fn default() -> Self {
        Self {
            status: 10.0,
            attitude: 25.0,
            raw_imu: 50.0,
            analog: 5.0,
            voltage: 2.0,
            current: 2.0,
            battery: 2.0,
            altitude: 0.0,
            rc: 0.0,
            motor: 0.0,
        }
    }
}

impl SampleRates {
    /// Every polled command paired with its configured rate.
    pub fn commands(&self) -> [(Command, f64); 10] {
        [
            (Command::Status, self.status),
            (Command::Attitude, self.attitude),
            (Command::RawImu, self.raw_imu),
            (Command::Analog, self.analog),
            (Command::VoltageMeters, self.voltage),
            (Command::CurrentMeters, self.current),
            (Command::BatteryState, self.battery),
            (Command::Altitude, self.altitude),
            (Command::Rc, self.rc),
            (Command::Motor, self.motor),
        ]
    }

    /// Reject rates that are negative, non-finite or too slow to have a period.
    pub fn validate(&self) -> Result<()> {
        for (command, hz) in self.commands() {
            if hz != 0.0 && poll_period(hz).is_none() {
                return Err(MspError::Profile(format!(
                    "sample rate for {command} must be 0 or a positive rate, got {hz}"
                )));
            }
        }
        Ok(())
    }
}

/// Polling period for a rate in Hz. `None` for disabled or unusable rates.
pub fn poll_period(hz: f64) -> Option<Duration> {
    if !(hz.is_finite() && hz > 0.0) {
        return None;
    }
    Duration::try_from_secs_f64(1.0 / hz).ok()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Key under `profiles`, filled in on load.
    #[serde(skip)]
    pub name: String,
    pub ignore_tilt: bool,
    pub max_tilt: f64,
    pub max_gyro_std: f64,
    pub max_gyro_bias: f64,
    pub max_accnorm_std: f64,
    pub max_cyc_jitter: f64,
    /// Maximum I2C errors per second.
    pub max_i2c_errors: f64,
    /// Battery voltage floor; unset disables the check.
    pub min_vbat: Option<f64>,
    /// Current ceiling; unset disables the check.
    pub max_amps: Option<f64>,
    #[serde(default)]
    pub sample_rates: SampleRates,
}

/// Threshold overrides supplied on the command line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProfileOverrides {
    pub ignore_tilt: Option<bool>,
    pub max_tilt: Option<f64>,
    pub max_gyro_std: Option<f64>,
    pub max_gyro_bias: Option<f64>,
    pub max_accnorm_std: Option<f64>,
    pub max_cyc_jitter: Option<f64>,
    pub max_i2c_errors: Option<f64>,
    pub min_vbat: Option<f64>,
    pub max_amps: Option<f64>,
}

impl Profile {
    /// Copy of this profile with every set override applied.
    pub fn with_overrides(&self, o: &ProfileOverrides) -> Profile {
        Profile {
            name: self.name.clone(),
            ignore_tilt: o.ignore_tilt.unwrap_or(self.ignore_tilt),
            max_tilt: o.max_tilt.unwrap_or(self.max_tilt),
            max_gyro_std: o.max_gyro_std.unwrap_or(self.max_gyro_std),
            max_gyro_bias: o.max_gyro_bias.unwrap_or(self.max_gyro_bias),
            max_accnorm_std: o.max_accnorm_std.unwrap_or(self.max_accnorm_std),
            max_cyc_jitter: o.max_cyc_jitter.unwrap_or(self.max_cyc_jitter),
            max_i2c_errors: o.max_i2c_errors.unwrap_or(self.max_i2c_errors),
            min_vbat: o.min_vbat.or(self.min_vbat),
            max_amps: o.max_amps.or(self.max_amps),
            sample_rates: self.sample_rates.clone(),
        }
    }
}

static BUILTIN: Lazy<BTreeMap<String, Profile>> = Lazy::new(|| {
    let usb_stand = Profile {
        name: "usb_stand".into(),
        ignore_tilt: true,
        max_tilt: 5.0,
        max_gyro_std: 6.0,
        max_gyro_bias: 12.0,
        max_accnorm_std: 6.0,
        max_cyc_jitter: 20.0,
        max_i2c_errors: 0.0,
        min_vbat: None,
        max_amps: Some(1.0),
        sample_rates: SampleRates::default(),
    };
    let field_strict = Profile {
        name: "field_strict".into(),
        ignore_tilt: false,
        max_tilt: 5.0,
        max_gyro_std: 4.0,
        max_gyro_bias: 8.0,
        max_accnorm_std: 4.0,
        max_cyc_jitter: 10.0,
        max_i2c_errors: 0.0,
        min_vbat: Some(6.0),
        max_amps: Some(0.5),
        sample_rates: SampleRates::default(),
    };
    [usb_stand, field_strict]
        .into_iter()
        .map(|p| (p.name.clone(), p))
        .collect()
});

#[derive(Deserialize)]
struct ProfileDocument {
    profiles: BTreeMap<String, serde_yaml::Value>,
}

/// Named profiles available to a session.
#[derive(Debug, Clone, PartialEq)]
pub struct ProfileSet {
    profiles: BTreeMap<String, Profile>,
}

impl Default for ProfileSet {
    fn default() -> Self {
        Self::builtin()
    }
}

impl ProfileSet {
    pub fn builtin() -> Self {
        Self {
            profiles: BUILTIN.clone(),
        }
    }

    /// Parse a YAML document; its profiles are layered over the built-ins.
    pub fn from_yaml_str(text: &str) -> Result<Self> {
        let doc: ProfileDocument = serde_yaml::from_str(text)
            .map_err(|e| MspError::Profile(format!("config must contain a 'profiles' mapping: {e}")))?;
        let mut set = Self::builtin();
        for (name, value) in doc.profiles {
            let mut profile: Profile = serde_yaml::from_value(value)
                .map_err(|e| MspError::Profile(format!("profile '{name}': {e}")))?;
            profile.sample_rates.validate().map_err(|e| match e {
                MspError::Profile(msg) => MspError::Profile(format!("profile '{name}': {msg}")),
                other => other,
            })?;
            profile.name = name.clone();
            set.profiles.insert(name, profile);
        }
        Ok(set)
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading profile config {}", path.display()))?;
        Self::from_yaml_str(&text).with_context(|| format!("parsing {}", path.display()))
    }

    pub fn get(&self, name: &str) -> Result<Profile> {
        self.profiles.get(name).cloned().ok_or_else(|| {
            let available = self.names().collect::<Vec<_>>().join(", ");
            MspError::Profile(format!("unknown profile '{name}'. available: {available}"))
        })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.profiles.keys().map(String::as_str)
    }
}
