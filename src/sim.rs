//! In-memory flight controller.
//!
//! [`SimulatedLink`] decodes the request frames written to it and queues
//! Betaflight-like responses with seeded noise, so a `sim://` port behaves like
//! a healthy FC sitting on a USB stand.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::time::Instant;

use log::trace;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::client::Link;
use crate::codec::{self, Direction};
use crate::commands::Command;
use crate::errors::MspError;

/// Nominal loop period of the simulated firmware, microseconds.
const CYCLE_US: f64 = 250.0;
/// 1 g on the simulated accelerometer.
const ACC_1G: f64 = 512.0;

pub struct SimulatedLink {
    port: String,
    rng: StdRng,
    uid: [u8; 12],
    pending: Vec<u8>,
    outbound: VecDeque<u8>,
    started: Instant,
}

/// FNV-1a, so each port name gets its own reproducible telemetry.
fn seed_for(port: &str) -> u64 {
    port.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ u64::from(b)).wrapping_mul(0x0000_0100_0000_01b3)
    })
}

impl SimulatedLink {
    pub fn new(port: &str) -> Self {
        let mut rng = StdRng::seed_from_u64(seed_for(port));
        let uid = rng.gen();
        Self {
            port: port.to_string(),
            rng,
            uid,
            pending: Vec::new(),
            outbound: VecDeque::new(),
            started: Instant::now(),
        }
    }

    fn noise(&mut self, sigma: f64) -> f64 {
        let z: f64 = self.rng.sample(StandardNormal);
        z * sigma
    }

    fn noisy_i16(&mut self, mean: f64, sigma: f64) -> i16 {
        (mean + self.noise(sigma))
            .round()
            .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
    }

    fn response(&mut self, command: u8) -> Vec<u8> {
        let Some(command) = Command::from_id(command) else {
            return Vec::new();
        };
        let elapsed = self.started.elapsed().as_secs_f64();
        let vbat_cv = (1680.0 - elapsed * 0.5).max(0.0) as u16;
        let amps_ca = self.noisy_i16(20.0, 1.0).max(0);
        let mah = (elapsed * 0.05) as u16;

        match command {
            Command::ApiVersion => vec![0, 1, 46],
            Command::FcVariant => b"BTFL".to_vec(),
            Command::FcVersion => vec![4, 5, 0],
            Command::BoardInfo => {
                let mut p = b"SIMU".to_vec();
                p.extend(0u16.to_le_bytes());
                p
            }
            Command::BuildInfo => b"Jan 01 202412:00:00sim0001".to_vec(),
            Command::Name => b"SIM".to_vec(),
            Command::Uid => self.uid.to_vec(),
            Command::Status => {
                let cycle = self.noisy_i16(CYCLE_US, 2.0).max(1) as u16;
                let mut p = cycle.to_le_bytes().to_vec();
                p.extend(0u16.to_le_bytes());
                p.extend(0b11u16.to_le_bytes());
                p.extend(0u32.to_le_bytes());
                p
            }
            Command::Attitude => {
                let roll = self.noisy_i16(0.0, 5.0);
                let pitch = self.noisy_i16(0.0, 5.0);
                let yaw = (elapsed as i64 % 360) as i16;
                [roll, pitch, yaw].iter().flat_map(|v| v.to_le_bytes()).collect()
            }
            Command::RawImu => {
                let values = [
                    self.noisy_i16(0.0, 2.0),
                    self.noisy_i16(0.0, 2.0),
                    self.noisy_i16(ACC_1G, 2.0),
                    self.noisy_i16(0.0, 2.0),
                    self.noisy_i16(0.0, 2.0),
                    self.noisy_i16(0.0, 2.0),
                    self.noisy_i16(200.0, 3.0),
                    self.noisy_i16(-50.0, 3.0),
                    self.noisy_i16(400.0, 3.0),
                ];
                values.iter().flat_map(|v| v.to_le_bytes()).collect()
            }
            Command::Analog => {
                let mut p = vec![(vbat_cv / 10).min(255) as u8];
                p.extend(mah.to_le_bytes());
                p.extend(0u16.to_le_bytes());
                p.extend(amps_ca.to_le_bytes());
                p
            }
            Command::Altitude => {
                let mut p = 0i32.to_le_bytes().to_vec();
                p.extend(0i16.to_le_bytes());
                p
            }
            Command::VoltageMeters => {
                let mut p = vec![1, 10];
                p.extend(vbat_cv.to_le_bytes());
                p
            }
            Command::CurrentMeters => {
                let mut p = vec![1, 10];
                p.extend(amps_ca.to_le_bytes());
                p
            }
            Command::BatteryState => {
                let mut p = u32::from(vbat_cv).to_le_bytes().to_vec();
                p.extend(mah.to_le_bytes());
                p.extend(amps_ca.to_le_bytes());
                p.extend(1u16.to_le_bytes());
                p
            }
            Command::Rc => (0..16).flat_map(|_| 1500u16.to_le_bytes()).collect(),
            Command::Motor => (0..4).flat_map(|_| 1000u16.to_le_bytes()).collect(),
            Command::DataflashSummary
            | Command::EscSensorData
            | Command::StatusEx
            | Command::Servo
            | Command::Pid => Vec::new(),
        }
    }

    /// Decode every complete request in `pending` and queue its answer.
    fn process_pending(&mut self) {
        loop {
            let mut cursor: &[u8] = &self.pending;
            let result = codec::decode_frame(&mut cursor, Direction::ToDevice, Instant::now());
            let consumed = self.pending.len() - cursor.len();
            match result {
                Ok(frame) => {
                    self.pending.drain(..consumed);
                    trace!("{}: request cmd={}", self.port, frame.command);
                    let payload = self.response(frame.command);
                    if let Ok(bytes) = codec::encode_response(frame.command, &payload) {
                        self.outbound.extend(bytes);
                    }
                }
                Err(MspError::ChecksumMismatch { .. }) => {
                    self.pending.drain(..consumed);
                }
                Err(MspError::Truncated) => return,
                Err(_) => {
                    self.pending.clear();
                    return;
                }
            }
        }
    }
}

impl Read for SimulatedLink {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.outbound.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimulatedLink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.pending.extend_from_slice(buf);
        self.process_pending();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Link for SimulatedLink {
    fn set_control_lines(&mut self, _dtr: bool, _rts: bool) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::client::MspClient;
    use crate::parsers::{parse_raw_imu, parse_status, parse_uid};

    #[test]
    fn answers_handshake() {
        let mut client = MspClient::new(Box::new(SimulatedLink::new("sim://001")));
        assert_eq!(client.request(Command::FcVariant, &[]).unwrap(), b"BTFL");
        assert_eq!(client.request(Command::FcVersion, &[]).unwrap(), vec![4, 5, 0]);
        assert_eq!(client.request(Command::BuildInfo, &[]).unwrap().len(), 26);
        let uid = parse_uid(&client.request(Command::Uid, &[]).unwrap());
        assert!(!uid.invalid);
    }

    #[test]
    fn uid_is_stable_per_port() {
        let mut a = MspClient::new(Box::new(SimulatedLink::new("sim://001")));
        let mut b = MspClient::new(Box::new(SimulatedLink::new("sim://001")));
        let mut c = MspClient::new(Box::new(SimulatedLink::new("sim://002")));
        let ua = a.request(Command::Uid, &[]).unwrap();
        assert_eq!(ua, b.request(Command::Uid, &[]).unwrap());
        assert_ne!(ua, c.request(Command::Uid, &[]).unwrap());
    }

    #[test]
    fn telemetry_is_plausible() {
        let mut client = MspClient::new(Box::new(SimulatedLink::new("sim://003")))
            .with_timeout(Duration::from_millis(50));
        let status = parse_status(&client.request(Command::Status, &[]).unwrap());
        assert!(!status.invalid);
        let cycle = status.data.cycle_time_us.unwrap();
        assert!((200..300).contains(&cycle), "{cycle}");

        let imu = parse_raw_imu(&client.request(Command::RawImu, &[]).unwrap());
        assert!(!imu.invalid);
        assert!(imu.data.acc.unwrap()[2] > 450);
    }

    #[test]
    fn split_writes_are_reassembled() {
        let mut link = SimulatedLink::new("sim://004");
        let frame = codec::encode(Command::ApiVersion, &[]).unwrap();
        link.write_all(&frame[..3]).unwrap();
        assert!(link.outbound.is_empty());
        link.write_all(&frame[3..]).unwrap();
        let response = codec::decode(&mut link, Instant::now() + Duration::from_millis(10)).unwrap();
        assert_eq!(response.payload, vec![0, 1, 46]);
    }
}
