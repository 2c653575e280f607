//! MSP v1 diagnostics for Betaflight/INAV-style flight controllers.
//!
//! This crate talks the MultiWii Serial Protocol to one or many flight
//! controllers over USB serial, polls their telemetry on a per-command
//! schedule, and turns the result into a pass/fail verdict against a
//! threshold profile.
//!
//! # Layers
//!
//! - [`codec`] frames and unframes `$M<` / `$M>` packets.
//! - [`client`] performs request/response exchanges with timeouts and retries.
//! - [`parsers`] and [`meters`] decode payloads into typed records without panicking.
//! - [`analysis`] and [`evaluator`] keep rolling statistics and judge them.
//! - [`device`] runs one test against one controller.
//! - [`session`] discovers ports and runs many devices concurrently.
//!
//! # Quick start
//!
//! ```no_run
//! use msp_diag::{MspClient, Command, SerialOpener, PortOpener};
//!
//! let link = SerialOpener::default().open("/dev/ttyACM0")?;
//! let mut client = MspClient::new(link);
//! let variant = client.request(Command::FcVariant, &[])?;
//! println!("{}", String::from_utf8_lossy(&variant));
//! # Ok::<(), msp_diag::MspError>(())
//! ```

pub mod analysis;
pub mod client;
pub mod codec;
pub mod commands;
pub mod device;
pub mod errors;
pub mod evaluator;
pub mod logging;
pub mod meters;
pub mod parsers;
pub mod ports;
pub mod profile;
pub mod report;
pub mod scheduler;
pub mod session;
pub mod sim;

pub use client::{Link, MspClient, SerialLink};
pub use commands::Command;
pub use device::{DeviceContext, DeviceSnapshot, DeviceState, PollSettings, RunOutcome};
pub use errors::{MspError, PortFault, Result};
pub use evaluator::{evaluate, DiagnosticVerdict, EvaluationInput};
pub use ports::{PortCandidate, PortOpener, PortSource, SerialOpener};
pub use profile::{Profile, ProfileOverrides, ProfileSet};
pub use report::{JsonReportWriter, ReportSink};
pub use scheduler::Mode;
pub use session::{EventReceiver, Session, SessionConfig, SessionEvent};
