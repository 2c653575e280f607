//! Per-device state: handshake, telemetry ingestion and the polling loop.
//!
//! A [`DeviceContext`] is owned by exactly one task at a time. The session hands
//! it to a blocking worker for the duration of a test and gets it back when the
//! worker finishes.

use std::io;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::Serialize;

use crate::analysis::{
    BoundedHistory, ImuAnalyzer, ImuStatistics, LoopAnalyzer, LoopStatistics, HISTORY_LEN,
};
use crate::client::{Link, MspClient};
use crate::commands::Command;
use crate::errors::{MspError, Result};
use crate::evaluator::{self, DiagnosticVerdict, EvaluationInput};
use crate::meters::{CurrentMeters, VoltageMeters};
use crate::parsers::{
    self, Altitude, Analog, Attitude, BatteryState, BuildInfo, Motors, Parsed, RawImu,
    RcChannels, Record, Status,
};
use crate::ports::PortOpener;
use crate::profile::Profile;
use crate::scheduler::{Mode, Scheduler};

/// Packets kept for audit in each snapshot.
pub const RAW_PACKET_LEN: usize = 200;
/// Transient request errors kept in each snapshot.
pub const ERROR_LOG_LEN: usize = 50;
/// Granularity of cancellable sleeps.
const CANCEL_POLL: Duration = Duration::from_millis(10);

/// Seconds since the Unix epoch.
pub fn unix_now() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or_default()
}

// ============================================================================
// Settings / state
// ============================================================================

/// How a device is driven once attached.
#[derive(Debug, Clone)]
pub struct PollSettings {
    pub profile: Arc<Profile>,
    pub mode: Mode,
    /// Length of one test run.
    pub duration: Duration,
    /// Per-request response timeout.
    pub timeout: Duration,
    /// Retries per request after the first attempt.
    pub retries: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Idle,
    Testing,
    Complete,
    Error,
}

/// How a test run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Failed,
    Cancelled,
}

// ============================================================================
// Snapshot records
// ============================================================================

/// Firmware identity collected during the handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DeviceMeta {
    pub api_version: Option<String>,
    pub fc_variant: Option<String>,
    pub fc_version: Option<String>,
    pub board_id: Option<String>,
    pub hardware_revision: Option<u16>,
    pub build: Option<BuildInfo>,
    pub uid: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RawPacket {
    pub ts: f64,
    pub cmd: u8,
    pub name: &'static str,
    pub len: usize,
    pub payload_hex: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ErrorEntry {
    pub ts: f64,
    pub cmd: &'static str,
    pub error: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct History {
    pub cycle_us: BoundedHistory<f64>,
    pub loop_hz: BoundedHistory<f64>,
    pub vbat: BoundedHistory<f64>,
    pub amps: BoundedHistory<f64>,
}

impl Default for History {
    fn default() -> Self {
        Self {
            cycle_us: BoundedHistory::new(HISTORY_LEN),
            loop_hz: BoundedHistory::new(HISTORY_LEN),
            vbat: BoundedHistory::new(HISTORY_LEN),
            amps: BoundedHistory::new(HISTORY_LEN),
        }
    }
}

/// Serializable view of a device, emitted after every tick and persisted as the report.
#[derive(Debug, Clone, Serialize)]
pub struct DeviceSnapshot {
    pub uid: String,
    pub port: String,
    pub profile: String,
    pub mode: Mode,
    pub state: DeviceState,
    pub ok: Option<bool>,
    pub reasons: Vec<String>,
    pub meta: DeviceMeta,
    pub status: Option<Parsed<Status>>,
    pub attitude: Option<Parsed<Attitude>>,
    pub altitude: Option<Parsed<Altitude>>,
    pub analog: Option<Parsed<Analog>>,
    pub imu: Option<Parsed<RawImu>>,
    pub rc: Option<Parsed<RcChannels>>,
    pub motors: Option<Parsed<Motors>>,
    pub voltage_meters: Option<Parsed<VoltageMeters>>,
    pub current_meters: Option<Parsed<CurrentMeters>>,
    pub battery_state: Option<Parsed<BatteryState>>,
    #[serde(rename = "loop")]
    pub loop_stats: Option<LoopStatistics>,
    pub imu_stats: Option<ImuStatistics>,
    pub i2c_error_rate: Option<f64>,
    pub history: History,
    pub raw_packets: BoundedHistory<RawPacket>,
    pub errors: BoundedHistory<ErrorEntry>,
    pub duration_s: f64,
    pub updated: f64,
}

impl DeviceSnapshot {
    /// Firmware UID when one was reported, used to name the report file.
    pub fn firmware_uid(&self) -> Option<&str> {
        self.meta.uid.as_deref()
    }
}

/// Latest decoded value per command.
#[derive(Debug, Clone, Default)]
struct Telemetry {
    status: Option<Parsed<Status>>,
    attitude: Option<Parsed<Attitude>>,
    altitude: Option<Parsed<Altitude>>,
    analog: Option<Parsed<Analog>>,
    imu: Option<Parsed<RawImu>>,
    rc: Option<Parsed<RcChannels>>,
    motors: Option<Parsed<Motors>>,
    voltage_meters: Option<Parsed<VoltageMeters>>,
    current_meters: Option<Parsed<CurrentMeters>>,
    battery_state: Option<Parsed<BatteryState>>,
}

// ============================================================================
// Handshake
// ============================================================================

/// Identify the flight controller behind `client`.
///
/// The first five identity commands must answer; UID is optional.
pub fn handshake(client: &mut MspClient) -> Result<DeviceMeta> {
    let mut meta = DeviceMeta::default();
    for command in Command::HANDSHAKE {
        let payload = match client.request(command, &[]) {
            Ok(payload) => payload,
            Err(e) if command == Command::Uid => {
                debug!("UID not reported: {}", e);
                continue;
            }
            Err(e) => {
                return Err(MspError::ProbeFailed(format!(
                    "no response to {}: {}",
                    command,
                    e.reason()
                )))
            }
        };
        match parsers::parse_payload(command.id(), &payload).record {
            Record::ApiVersion(api) => meta.api_version = Some(api.version),
            Record::FcVariant(text) => meta.fc_variant = Some(text.value),
            Record::FcVersion(v) => meta.fc_version = v.version,
            Record::BoardInfo(board) => {
                meta.board_id = Some(board.board_id);
                meta.hardware_revision = board.hardware_revision;
            }
            Record::BuildInfo(build) => meta.build = Some(build),
            Record::Uid(uid) => meta.uid = uid.uid,
            _ => {}
        }
    }
    Ok(meta)
}

/// Stable id for a port without a firmware UID.
pub fn fallback_uid(port: &str) -> String {
    if let Some(rest) = port.strip_prefix("sim://") {
        return format!("SIM-{rest}");
    }
    let base = Path::new(port)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(port);
    format!("FC-{base}")
}

// ============================================================================
// DeviceContext
// ============================================================================

pub struct DeviceContext {
    port: String,
    uid: String,
    settings: PollSettings,
    state: DeviceState,
    meta: DeviceMeta,
    client: Option<MspClient>,
    opener: Option<Arc<dyn PortOpener>>,
    telemetry: Telemetry,
    loop_analyzer: LoopAnalyzer,
    imu_analyzer: ImuAnalyzer,
    history: History,
    raw_packets: BoundedHistory<RawPacket>,
    errors: BoundedHistory<ErrorEntry>,
    last_i2c: Option<(u16, f64)>,
    i2c_error_rate: Option<f64>,
    verdict: Option<DiagnosticVerdict>,
    duration_s: f64,
    updated: f64,
}

impl DeviceContext {
    /// Wake the link, run the handshake and build an idle context.
    pub fn attach(port: &str, link: Box<dyn Link>, settings: PollSettings) -> Result<Self> {
        let mut client = MspClient::new(link)
            .with_timeout(settings.timeout)
            .with_retries(settings.retries);
        client.wake();
        let meta = handshake(&mut client)?;
        let uid = meta.uid.clone().unwrap_or_else(|| fallback_uid(port));
        info!(
            "{}: attached {} {} ({})",
            port,
            meta.fc_variant.as_deref().unwrap_or("?"),
            meta.fc_version.as_deref().unwrap_or("?"),
            uid
        );
        let mut ctx = Self::new(port, uid, settings);
        ctx.meta = meta;
        ctx.client = Some(client);
        Ok(ctx)
    }

    /// Context without a connection; used before attach and in tests.
    pub fn new(port: &str, uid: String, settings: PollSettings) -> Self {
        Self {
            port: port.to_string(),
            uid,
            settings,
            state: DeviceState::Idle,
            meta: DeviceMeta::default(),
            client: None,
            opener: None,
            telemetry: Telemetry::default(),
            loop_analyzer: LoopAnalyzer::default(),
            imu_analyzer: ImuAnalyzer::default(),
            history: History::default(),
            raw_packets: BoundedHistory::new(RAW_PACKET_LEN),
            errors: BoundedHistory::new(ERROR_LOG_LEN),
            last_i2c: None,
            i2c_error_rate: None,
            verdict: None,
            duration_s: 0.0,
            updated: unix_now(),
        }
    }

    /// Opener used to get the link back when a run starts without one.
    pub fn with_opener(mut self, opener: Arc<dyn PortOpener>) -> Self {
        self.opener = Some(opener);
        self
    }

    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn i2c_error_rate(&self) -> Option<f64> {
        self.i2c_error_rate
    }

    /// Drop accumulated measurements ahead of a new run. Identity is kept.
    pub fn reset_measurements(&mut self) {
        self.telemetry = Telemetry::default();
        self.loop_analyzer.reset();
        self.imu_analyzer.reset();
        self.history = History::default();
        self.raw_packets.clear();
        self.errors.clear();
        self.last_i2c = None;
        self.i2c_error_rate = None;
        self.verdict = None;
        self.duration_s = 0.0;
    }

    /// Feed one response payload into telemetry, analyzers and histories.
    pub fn ingest(&mut self, command: Command, payload: &[u8], ts: f64) {
        let parsed = parsers::parse_payload(command.id(), payload);
        self.raw_packets.push(RawPacket {
            ts,
            cmd: command.id(),
            name: command.name(),
            len: payload.len(),
            payload_hex: parsed.raw_hex.clone(),
        });
        let (raw_hex, invalid) = (parsed.raw_hex, parsed.invalid);

        match parsed.record {
            Record::Status(status) => {
                if let Some(cycle) = status.cycle_time_us.filter(|&c| c > 0) {
                    let cycle = f64::from(cycle);
                    self.loop_analyzer.add_sample(cycle, ts);
                    self.history.cycle_us.push(cycle);
                    self.history.loop_hz.push(1_000_000.0 / cycle);
                }
                if let Some(count) = status.i2c_errors {
                    self.update_i2c(count, ts);
                }
                self.telemetry.status = keep(status, raw_hex, invalid);
            }
            Record::Attitude(attitude) => self.telemetry.attitude = keep(attitude, raw_hex, invalid),
            Record::Altitude(altitude) => self.telemetry.altitude = keep(altitude, raw_hex, invalid),
            Record::Analog(analog) => {
                if let Some(vbat) = analog.vbat_v {
                    self.history.vbat.push(vbat);
                }
                if let Some(amps) = analog.amps_a {
                    self.history.amps.push(amps);
                }
                self.telemetry.analog = keep(analog, raw_hex, invalid);
            }
            Record::RawImu(imu) => {
                if let (Some(gyro), Some(acc)) = (imu.gyro, imu.acc) {
                    self.imu_analyzer.add_sample(gyro, acc, ts);
                }
                self.telemetry.imu = keep(imu, raw_hex, invalid);
            }
            Record::Rc(rc) => self.telemetry.rc = keep(rc, raw_hex, invalid),
            Record::Motor(motors) => self.telemetry.motors = keep(motors, raw_hex, invalid),
            Record::VoltageMeters(m) => self.telemetry.voltage_meters = keep(m, raw_hex, invalid),
            Record::CurrentMeters(m) => self.telemetry.current_meters = keep(m, raw_hex, invalid),
            Record::BatteryState(b) => self.telemetry.battery_state = keep(b, raw_hex, invalid),
            _ => {}
        }
        self.updated = ts;
    }

    /// First difference of the cumulative I2C counter. A counter that went
    /// backwards (reset or wrap) leaves the previous rate in place.
    fn update_i2c(&mut self, count: u16, ts: f64) {
        if let Some((prev, prev_ts)) = self.last_i2c {
            if count >= prev {
                let dt = (ts - prev_ts).max(1e-6);
                self.i2c_error_rate = Some(f64::from(count - prev) / dt);
            } else {
                debug!("{}: i2c counter reset ({} -> {})", self.port, prev, count);
            }
        }
        self.last_i2c = Some((count, ts));
    }

    pub fn record_error(&mut self, command: Command, error: &MspError, ts: f64) {
        self.push_error(command.name(), error, ts);
    }

    fn push_error(&mut self, cmd: &'static str, error: &MspError, ts: f64) {
        self.errors.push(ErrorEntry {
            ts,
            cmd,
            error: error.reason(),
        });
    }

    /// Recompute the verdict from everything accumulated so far.
    pub fn evaluate(&mut self) -> &DiagnosticVerdict {
        let loop_stats = self.loop_analyzer.snapshot();
        let imu_stats = self.imu_analyzer.snapshot();
        let input = EvaluationInput {
            loop_stats: loop_stats.as_ref(),
            imu_stats: imu_stats.as_ref(),
            i2c_error_rate: self.i2c_error_rate,
            analog: self.telemetry.analog.as_ref().map(|p| &p.data),
            attitude: self.telemetry.attitude.as_ref().map(|p| &p.data),
        };
        self.verdict.insert(evaluator::evaluate(&self.settings.profile, &input))
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        let t = &self.telemetry;
        DeviceSnapshot {
            uid: self.uid.clone(),
            port: self.port.clone(),
            profile: self.settings.profile.name.clone(),
            mode: self.settings.mode,
            state: self.state,
            ok: self.verdict.as_ref().map(|v| v.ok),
            reasons: self
                .verdict
                .as_ref()
                .map(|v| v.reasons.clone())
                .unwrap_or_default(),
            meta: self.meta.clone(),
            status: t.status.clone(),
            attitude: t.attitude.clone(),
            altitude: t.altitude.clone(),
            analog: t.analog.clone(),
            imu: t.imu.clone(),
            rc: t.rc.clone(),
            motors: t.motors.clone(),
            voltage_meters: t.voltage_meters.clone(),
            current_meters: t.current_meters.clone(),
            battery_state: t.battery_state.clone(),
            loop_stats: self.loop_analyzer.snapshot(),
            imu_stats: self.imu_analyzer.snapshot(),
            i2c_error_rate: self.i2c_error_rate,
            history: self.history.clone(),
            raw_packets: self.raw_packets.clone(),
            errors: self.errors.clone(),
            duration_s: self.duration_s,
            updated: self.updated,
        }
    }

    /// Issue one request and ingest the response.
    fn poll(&mut self, command: Command) -> Result<()> {
        let client = self.client.as_mut().ok_or_else(|| {
            MspError::Io(io::Error::new(io::ErrorKind::NotConnected, "link closed"))
        })?;
        let payload = client.request(command, &[])?;
        self.ingest(command, &payload, unix_now());
        Ok(())
    }

    /// Run one test: poll due commands every tick until the duration elapses,
    /// the link fails, or `cancel` is raised. `emit` receives a snapshot after
    /// every tick and once at the end.
    ///
    /// A link lost by an earlier run is reopened first. A cancelled run leaves
    /// the context `Idle`.
    pub fn run_test(
        &mut self,
        cancel: &AtomicBool,
        mut emit: impl FnMut(DeviceSnapshot),
    ) -> RunOutcome {
        self.reset_measurements();
        if cancel.load(Ordering::Acquire) {
            return self.cancelled();
        }
        self.state = DeviceState::Testing;
        info!("{}: testing {} for {:?}", self.port, self.uid, self.settings.duration);
        emit(self.snapshot());

        let started = Instant::now();
        if let Err(e) = self.reconnect() {
            warn!("{}: cannot reopen link: {}", self.port, e);
            self.push_error("OPEN", &e, unix_now());
            return self.failed(started, &mut emit);
        }

        // durations past the clock's range simply never expire
        let deadline = started.checked_add(self.settings.duration);
        let expired = |now: Instant| deadline.is_some_and(|d| now >= d);
        let tick = self.settings.mode.tick();
        let mut scheduler = Scheduler::new(&self.settings.profile.sample_rates);

        'ticks: loop {
            let tick_start = Instant::now();
            if expired(tick_start) {
                break;
            }
            for command in scheduler.due(tick_start) {
                if cancel.load(Ordering::Acquire) {
                    return self.cancelled();
                }
                if expired(Instant::now()) {
                    break 'ticks;
                }
                match self.poll(command) {
                    Ok(()) => {}
                    Err(MspError::Io(e)) => {
                        warn!("{}: link failed: {}", self.port, e);
                        self.record_error(command, &MspError::Io(e), unix_now());
                        return self.failed(started, &mut emit);
                    }
                    Err(e) => {
                        warn!("{}: {} failed: {}", self.port, command, e);
                        self.record_error(command, &e, unix_now());
                    }
                }
            }
            self.duration_s = started.elapsed().as_secs_f64();
            self.evaluate();
            emit(self.snapshot());

            let next = tick_start + tick;
            let next = deadline.map_or(next, |d| next.min(d));
            if !sleep_until(cancel, next) {
                return self.cancelled();
            }
        }

        self.duration_s = started.elapsed().as_secs_f64();
        let ok = self.evaluate().ok;
        self.state = DeviceState::Complete;
        self.updated = unix_now();
        info!(
            "{}: test complete ({})",
            self.port,
            if ok { "ok" } else { "fail" }
        );
        emit(self.snapshot());
        RunOutcome::Completed
    }

    /// Reopen the link through the opener if a previous run dropped it.
    fn reconnect(&mut self) -> Result<()> {
        if self.client.is_some() {
            return Ok(());
        }
        let Some(opener) = &self.opener else {
            return Err(MspError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "link closed",
            )));
        };
        let link = opener.open(&self.port)?;
        let mut client = MspClient::new(link)
            .with_timeout(self.settings.timeout)
            .with_retries(self.settings.retries);
        client.wake();
        self.client = Some(client);
        info!("{}: link reopened", self.port);
        Ok(())
    }

    /// Terminal transport failure: drop the link and publish the error state.
    fn failed(&mut self, started: Instant, emit: &mut impl FnMut(DeviceSnapshot)) -> RunOutcome {
        self.state = DeviceState::Error;
        self.client = None;
        self.duration_s = started.elapsed().as_secs_f64();
        self.updated = unix_now();
        self.evaluate();
        emit(self.snapshot());
        RunOutcome::Failed
    }

    fn cancelled(&mut self) -> RunOutcome {
        debug!("{}: run cancelled", self.port);
        self.state = DeviceState::Idle;
        self.updated = unix_now();
        RunOutcome::Cancelled
    }

    /// Close the link.
    pub fn close(&mut self) {
        if let Some(client) = self.client.take() {
            client.close();
        }
    }
}

fn keep<T>(data: T, raw_hex: String, invalid: bool) -> Option<Parsed<T>> {
    Some(Parsed {
        data,
        raw_hex,
        invalid,
    })
}

/// Sleep until `until` in short slices; `false` if cancelled first.
fn sleep_until(cancel: &AtomicBool, until: Instant) -> bool {
    loop {
        if cancel.load(Ordering::Acquire) {
            return false;
        }
        let now = Instant::now();
        if now >= until {
            return true;
        }
        thread::sleep((until - now).min(CANCEL_POLL));
    }
}
