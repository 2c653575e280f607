//! Per-command rate limiting for the polling loop.

use std::time::{Duration, Instant};

use log::warn;
use serde::{Deserialize, Serialize};

use crate::commands::Command;
use crate::profile::{poll_period, SampleRates};

/// Polling cadence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    #[default]
    Normal,
    Pro,
}

impl Mode {
    pub fn tick(self) -> Duration {
        match self {
            Mode::Normal => Duration::from_millis(200),
            Mode::Pro => Duration::from_millis(100),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Normal => "normal",
            Mode::Pro => "pro",
        }
    }
}

#[derive(Debug, Clone)]
struct Entry {
    command: Command,
    period: Duration,
    last_run: Option<Instant>,
}

/// Decides which commands are due on each tick.
#[derive(Debug, Clone)]
pub struct Scheduler {
    entries: Vec<Entry>,
}

impl Scheduler {
    /// Build from configured rates; disabled and unusable rates are left out.
    pub fn new(rates: &SampleRates) -> Self {
        let entries = rates
            .commands()
            .into_iter()
            .filter_map(|(command, hz)| match poll_period(hz) {
                Some(period) => Some(Entry {
                    command,
                    period,
                    last_run: None,
                }),
                None => {
                    if hz != 0.0 {
                        warn!("not polling {}: unusable rate {} Hz", command, hz);
                    }
                    None
                }
            })
            .collect();
        Self { entries }
    }

    /// Commands whose period has elapsed since their last run, marking them as run at `now`.
    pub fn due(&mut self, now: Instant) -> Vec<Command> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            let ready = entry
                .last_run
                .map_or(true, |last| now.saturating_duration_since(last) >= entry.period);
            if ready {
                entry.last_run = Some(now);
                due.push(entry.command);
            }
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_rate_is_never_polled() {
        let mut sched = Scheduler::new(&SampleRates::default());
        let cmds = sched.due(Instant::now());
        assert!(cmds.contains(&Command::Status));
        assert!(!cmds.contains(&Command::Rc));
        assert!(!cmds.contains(&Command::Motor));
        assert!(!cmds.contains(&Command::Altitude));
    }

    #[test]
    fn respects_period() {
        let rates = SampleRates {
            status: 10.0,
            attitude: 2.0,
            raw_imu: 0.0,
            analog: 0.0,
            voltage: 0.0,
            current: 0.0,
            battery: 0.0,
            altitude: 0.0,
            rc: 0.0,
            motor: 0.0,
        };
        let mut sched = Scheduler::new(&rates);
        let t0 = Instant::now();
        assert_eq!(sched.due(t0), vec![Command::Status, Command::Attitude]);
        assert!(sched.due(t0 + Duration::from_millis(50)).is_empty());
        assert_eq!(sched.due(t0 + Duration::from_millis(100)), vec![Command::Status]);
        assert_eq!(
            sched.due(t0 + Duration::from_millis(500)),
            vec![Command::Status, Command::Attitude]
        );
    }

    #[test]
    fn unusable_rates_are_skipped() {
        let rates = SampleRates {
            status: 1e-20,
            attitude: f64::INFINITY,
            raw_imu: -5.0,
            analog: f64::NAN,
            ..SampleRates::default()
        };
        let mut sched = Scheduler::new(&rates);
        let due = sched.due(Instant::now());
        assert!(!due.contains(&Command::Status));
        assert!(!due.contains(&Command::Attitude));
        assert!(!due.contains(&Command::RawImu));
        assert!(!due.contains(&Command::Analog));
        assert!(due.contains(&Command::VoltageMeters));
    }

    #[test]
    fn mode_ticks() {
        assert_eq!(Mode::Normal.tick(), Duration::from_millis(200));
        assert_eq!(Mode::Pro.tick(), Duration::from_millis(100));
    }
}
