//! Port enumeration and opening.

use std::io;
use std::time::Duration;

use log::debug;
use serialport::{SerialPortInfo, SerialPortType};

use crate::client::{Link, SerialLink};
use crate::errors::{MspError, PortFault, Result};
use crate::sim::SimulatedLink;

/// STM32 virtual COM port, used by most Betaflight/INAV boards.
pub const DEFAULT_WHITELIST: &[(u16, u16)] = &[(0x0483, 0x5740)];

/// Default line speed for MSP over USB VCP.
pub const DEFAULT_BAUD: u32 = 115_200;

/// Per-read timeout on a serial port; the codec deadline bounds the overall wait.
const READ_TIMEOUT: Duration = Duration::from_millis(20);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortCandidate {
    pub name: String,
    pub vid: Option<u16>,
    pub pid: Option<u16>,
}

impl PortCandidate {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            vid: None,
            pid: None,
        }
    }
}

/// Supplies the ports visible right now.
pub trait PortSource: Send + Sync {
    fn list(&self) -> Result<Vec<PortCandidate>>;
}

/// Opens a port by name.
pub trait PortOpener: Send + Sync {
    fn open(&self, port: &str) -> Result<Box<dyn Link>>;
}

// ============================================================================
// Sources
// ============================================================================

/// An explicit list given on the command line.
#[derive(Debug, Clone)]
pub struct FixedPorts(pub Vec<String>);

impl PortSource for FixedPorts {
    fn list(&self) -> Result<Vec<PortCandidate>> {
        Ok(self.0.iter().cloned().map(PortCandidate::named).collect())
    }
}

/// `sim://001` .. `sim://NNN`.
#[derive(Debug, Clone, Copy)]
pub struct SimulatedPorts(pub usize);

impl PortSource for SimulatedPorts {
    fn list(&self) -> Result<Vec<PortCandidate>> {
        Ok((1..=self.0)
            .map(|i| PortCandidate::named(format!("sim://{i:03}")))
            .collect())
    }
}

/// OS enumeration through `serialport`, filtered to USB ACM/serial adapters.
#[derive(Debug, Clone)]
pub struct SystemPorts {
    /// Allowed (vid, pid) pairs; `None` accepts any device.
    pub whitelist: Option<Vec<(u16, u16)>>,
}

impl Default for SystemPorts {
    fn default() -> Self {
        Self {
            whitelist: Some(DEFAULT_WHITELIST.to_vec()),
        }
    }
}

impl SystemPorts {
    pub fn any() -> Self {
        Self { whitelist: None }
    }

    fn is_candidate_name(name: &str) -> bool {
        if cfg!(unix) {
            name.starts_with("/dev/ttyACM") || name.starts_with("/dev/ttyUSB")
        } else {
            true
        }
    }

    fn allowed(&self, candidate: &PortCandidate) -> bool {
        match (&self.whitelist, candidate.vid, candidate.pid) {
            (None, _, _) => true,
            (Some(list), Some(vid), Some(pid)) => list.contains(&(vid, pid)),
            // unknown ids are rejected while a whitelist is active
            (Some(_), _, _) => false,
        }
    }

    /// Apply the name and whitelist filters to raw enumeration results.
    pub fn filter(&self, ports: Vec<SerialPortInfo>) -> Vec<PortCandidate> {
        ports
            .into_iter()
            .filter(|p| Self::is_candidate_name(&p.port_name))
            .map(|p| {
                let (vid, pid) = match p.port_type {
                    SerialPortType::UsbPort(usb) => (Some(usb.vid), Some(usb.pid)),
                    _ => (None, None),
                };
                PortCandidate {
                    name: p.port_name,
                    vid,
                    pid,
                }
            })
            .filter(|c| {
                let ok = self.allowed(c);
                if !ok {
                    debug!("skipping {} (vid={:?} pid={:?})", c.name, c.vid, c.pid);
                }
                ok
            })
            .collect()
    }
}

impl PortSource for SystemPorts {
    fn list(&self) -> Result<Vec<PortCandidate>> {
        let ports = serialport::available_ports().map_err(|e| MspError::PortUnavailable {
            port: "*".into(),
            fault: fault_from_serial(&e),
        })?;
        Ok(self.filter(ports))
    }
}

// ============================================================================
// Opener
// ============================================================================

fn fault_from_serial(e: &serialport::Error) -> PortFault {
    let kind = match e.kind {
        serialport::ErrorKind::Io(kind) => Some(kind),
        serialport::ErrorKind::NoDevice => Some(io::ErrorKind::NotFound),
        _ => None,
    };
    PortFault::classify(kind, &e.description)
}

/// Opens real serial ports, routing `sim://` names to [`SimulatedLink`].
#[derive(Debug, Clone, Copy)]
pub struct SerialOpener {
    pub baud: u32,
}

impl Default for SerialOpener {
    fn default() -> Self {
        Self { baud: DEFAULT_BAUD }
    }
}

impl PortOpener for SerialOpener {
    fn open(&self, port: &str) -> Result<Box<dyn Link>> {
        if port.starts_with("sim://") {
            return Ok(Box::new(SimulatedLink::new(port)));
        }
        let serial = serialport::new(port, self.baud)
            .timeout(READ_TIMEOUT)
            .open()
            .map_err(|e| MspError::PortUnavailable {
                port: port.to_string(),
                fault: fault_from_serial(&e),
            })?;
        Ok(Box::new(SerialLink::new(serial)))
    }
}
