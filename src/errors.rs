use std::fmt;
use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum MspError {
    #[error("invalid command id {0} (must fit in one byte)")]
    InvalidCommand(i64),
    #[error("payload of {0} bytes exceeds the MSP v1 limit of 255")]
    PayloadTooLarge(usize),
    #[error("timeout waiting for response")]
    Timeout,
    #[error("frame truncated before all declared bytes arrived")]
    Truncated,
    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    ChecksumMismatch { expected: u8, actual: u8 },
    #[error("request failed: {0}")]
    RequestFailed(Box<MspError>),
    #[error("probe failed: {0}")]
    ProbeFailed(String),
    #[error("{port}: {fault}")]
    PortUnavailable { port: String, fault: PortFault },
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("profile error: {0}")]
    Profile(String),
    #[error("no device with uid {0}")]
    UnknownDevice(String),
}

impl MspError {
    /// Errors worth another attempt within a single request.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            MspError::Timeout | MspError::Truncated | MspError::ChecksumMismatch { .. }
        )
    }

    /// Short human readable reason, as shown in snapshots and events.
    pub fn reason(&self) -> String {
        match self {
            MspError::PortUnavailable { fault, .. } => fault.to_string(),
            MspError::ProbeFailed(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}

/// Why a serial port could not be opened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PortFault {
    PermissionDenied,
    Missing,
    Busy,
    Timeout,
    Other(String),
}

impl PortFault {
    /// Classify an OS level failure message into a fault.
    pub fn classify(kind: Option<io::ErrorKind>, message: &str) -> Self {
        let lower = message.to_lowercase();
        match kind {
            Some(io::ErrorKind::PermissionDenied) => return PortFault::PermissionDenied,
            Some(io::ErrorKind::NotFound) => return PortFault::Missing,
            Some(io::ErrorKind::TimedOut) => return PortFault::Timeout,
            _ => {}
        }
        if lower.contains("permission") {
            PortFault::PermissionDenied
        } else if lower.contains("busy") {
            PortFault::Busy
        } else if lower.contains("no such file") || lower.contains("not found") {
            PortFault::Missing
        } else if lower.contains("timed out") || lower.contains("timeout") {
            PortFault::Timeout
        } else {
            PortFault::Other(message.to_string())
        }
    }
}

impl fmt::Display for PortFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PortFault::PermissionDenied => write!(f, "permission denied (add the user to the dialout group)"),
            PortFault::Missing => write!(f, "port not available"),
            PortFault::Busy => write!(f, "port busy (ModemManager?)"),
            PortFault::Timeout => write!(f, "timeout while accessing the port"),
            PortFault::Other(msg) if msg.is_empty() => write!(f, "unknown error"),
            PortFault::Other(msg) => write!(f, "{msg}"),
        }
    }
}

pub type Result<T> = std::result::Result<T, MspError>;
