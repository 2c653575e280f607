use std::collections::HashSet;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{info, warn};

use msp_diag::commands::Command;
use msp_diag::device::DeviceState;
use msp_diag::logging::init_logging;
use msp_diag::ports::{FixedPorts, SimulatedPorts, SystemPorts, DEFAULT_BAUD};
use msp_diag::{
    DeviceSnapshot, JsonReportWriter, Mode, PollSettings, PortSource, ProfileOverrides,
    ProfileSet, ReportSink, SerialOpener, Session, SessionConfig, SessionEvent,
};

/// Slack on top of test duration and probe time before giving up on stragglers.
const SETTLE_GRACE: Duration = Duration::from_secs(5);
/// Upper bound on the overall wait so the deadline stays representable.
const MAX_SETTLE: Duration = Duration::from_secs(100 * 365 * 86_400);

#[derive(Parser, Debug)]
#[command(
    name = "msp-diag",
    version,
    about = "Run MSP health checks against one or more flight controllers"
)]
struct Args {
    /// Serial ports to test (default: enumerate USB serial ports)
    ports: Vec<String>,
    /// Directory for per-device JSON reports
    #[arg(long, default_value = "reports")]
    out: PathBuf,
    /// YAML profile file layered over the built-in profiles
    #[arg(long)]
    config: Option<PathBuf>,
    /// Threshold profile name
    #[arg(long, default_value = "usb_stand")]
    profile: String,
    #[arg(long, value_enum, default_value_t = Mode::Normal)]
    mode: Mode,
    #[arg(long, default_value_t = DEFAULT_BAUD)]
    baud: u32,
    /// Test duration in seconds
    #[arg(long, default_value_t = 10.0)]
    duration: f64,
    /// Per-request response timeout
    #[arg(long, default_value_t = 300)]
    timeout_ms: u64,
    /// Retries after the first attempt of each request
    #[arg(long, default_value_t = 3)]
    retries: u32,
    /// Test N simulated controllers instead of real ports
    #[arg(long, value_name = "N")]
    simulate: Option<usize>,
    /// Accept any USB serial device, not only whitelisted VID/PID pairs
    #[arg(long)]
    all_ports: bool,
    /// List candidate ports and exit
    #[arg(long)]
    list: bool,
    /// Print every session event as a JSON line on stdout
    #[arg(long)]
    jsonl: bool,
    /// Log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,

    #[arg(long)]
    ignore_tilt: bool,
    #[arg(long)]
    max_tilt: Option<f64>,
    #[arg(long)]
    max_gyro_std: Option<f64>,
    #[arg(long)]
    max_gyro_bias: Option<f64>,
    #[arg(long)]
    max_accnorm_std: Option<f64>,
    #[arg(long)]
    max_cyc_jitter: Option<f64>,
    #[arg(long)]
    max_i2c_errors: Option<f64>,
    #[arg(long)]
    min_vbat: Option<f64>,
    #[arg(long)]
    max_amps: Option<f64>,
}

impl Args {
    fn overrides(&self) -> ProfileOverrides {
        ProfileOverrides {
            ignore_tilt: self.ignore_tilt.then_some(true),
            max_tilt: self.max_tilt,
            max_gyro_std: self.max_gyro_std,
            max_gyro_bias: self.max_gyro_bias,
            max_accnorm_std: self.max_accnorm_std,
            max_cyc_jitter: self.max_cyc_jitter,
            max_i2c_errors: self.max_i2c_errors,
            min_vbat: self.min_vbat,
            max_amps: self.max_amps,
        }
    }

    fn source(&self) -> Box<dyn PortSource> {
        if let Some(n) = self.simulate {
            Box::new(SimulatedPorts(n))
        } else if !self.ports.is_empty() {
            Box::new(FixedPorts(self.ports.clone()))
        } else if self.all_ports {
            Box::new(SystemPorts::any())
        } else {
            Box::new(SystemPorts::default())
        }
    }
}

fn main() {
    match run() {
        Ok(true) => {}
        Ok(false) => exit(1),
        Err(e) => {
            eprintln!("Error: {e:#}");
            exit(2);
        }
    }
}

fn run() -> Result<bool> {
    let args = Args::parse();
    init_logging(args.log_level.as_deref());

    let source = args.source();
    let candidates = source.list()?;
    if args.list {
        for c in &candidates {
            match (c.vid, c.pid) {
                (Some(vid), Some(pid)) => println!("{}\t{vid:04x}:{pid:04x}", c.name),
                _ => println!("{}", c.name),
            }
        }
        return Ok(true);
    }
    if candidates.is_empty() {
        bail!("no candidate ports found (try --all-ports or name a port)");
    }

    let profiles = match &args.config {
        Some(path) => ProfileSet::load(path)?,
        None => ProfileSet::builtin(),
    };
    let profile = profiles.get(&args.profile)?.with_overrides(&args.overrides());
    let duration = Duration::try_from_secs_f64(args.duration)
        .with_context(|| format!("invalid --duration {}", args.duration))?;
    let settings = PollSettings {
        profile: Arc::new(profile),
        mode: args.mode,
        duration,
        timeout: Duration::from_millis(args.timeout_ms),
        retries: args.retries,
    };

    let expected: HashSet<String> = candidates.into_iter().map(|c| c.name).collect();
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(drive(&args, source, settings, expected))
}

/// Run the session until every expected port has settled, then report.
async fn drive(
    args: &Args,
    source: Box<dyn PortSource>,
    settings: PollSettings,
    mut pending: HashSet<String>,
) -> Result<bool> {
    let probes = Command::HANDSHAKE.len() as u32 + 1;
    let attempts = settings.retries.saturating_add(1).saturating_mul(probes);
    let settle = settle_budget(settings.duration, settings.timeout, attempts);
    let deadline = tokio::time::Instant::now() + settle;

    let sink: Arc<dyn ReportSink> = Arc::new(JsonReportWriter::new(&args.out));
    let opener = Arc::new(SerialOpener { baud: args.baud });
    let session = Session::start(SessionConfig::new(settings), source, opener, Some(sink));
    let mut events = session.subscribe();
    let mut probe_failures = Vec::new();

    while !pending.is_empty() {
        let event = tokio::select! {
            event = events.recv() => event,
            _ = tokio::time::sleep_until(deadline) => {
                warn!("gave up waiting for: {:?}", pending);
                break;
            }
        };
        let Some(event) = event else { break };
        if args.jsonl {
            println!("{}", serde_json::to_string(&event)?);
        }
        match event {
            SessionEvent::Snapshot { snapshot, .. } => {
                if matches!(snapshot.state, DeviceState::Complete | DeviceState::Error) {
                    pending.remove(&snapshot.port);
                }
            }
            SessionEvent::ProbeFailed { port, reason } => {
                pending.remove(&port);
                probe_failures.push((port, reason));
            }
            SessionEvent::Removed { port, uid } => {
                info!("{} ({}) went away", port, uid);
                pending.remove(&port);
            }
        }
    }

    let timed_out = !pending.is_empty();
    let reports = session.stop().await;
    if !args.jsonl {
        print_summary(&reports, &probe_failures);
        println!("reports written to {}", args.out.display());
    }
    let all_ok = !timed_out
        && probe_failures.is_empty()
        && !reports.is_empty()
        && reports.iter().all(|r| r.ok == Some(true));
    Ok(all_ok)
}

/// Test duration plus worst-case handshake time plus grace, capped at [`MAX_SETTLE`].
fn settle_budget(duration: Duration, timeout: Duration, attempts: u32) -> Duration {
    duration
        .saturating_add(timeout.saturating_mul(attempts))
        .saturating_add(SETTLE_GRACE)
        .min(MAX_SETTLE)
}

fn print_summary(reports: &[DeviceSnapshot], probe_failures: &[(String, String)]) {
    for r in reports {
        let verdict = match r.ok {
            Some(true) => "PASS",
            Some(false) => "FAIL",
            None => "----",
        };
        println!("{verdict}  {:<24} {}", r.uid, r.port);
        for reason in &r.reasons {
            println!("      {reason}");
        }
    }
    for (port, reason) in probe_failures {
        println!("ERR   {port}: {reason}");
    }
}
