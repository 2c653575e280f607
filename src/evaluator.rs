//! Pass/fail verdicts from accumulated statistics.

use serde::Serialize;

use crate::analysis::{ImuStatistics, LoopStatistics};
use crate::parsers::{Analog, Attitude};
use crate::profile::Profile;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DiagnosticVerdict {
    pub ok: bool,
    pub reasons: Vec<String>,
}

/// Everything the evaluator looks at. Missing inputs skip their checks.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvaluationInput<'a> {
    pub loop_stats: Option<&'a LoopStatistics>,
    pub imu_stats: Option<&'a ImuStatistics>,
    pub i2c_error_rate: Option<f64>,
    pub analog: Option<&'a Analog>,
    pub attitude: Option<&'a Attitude>,
}

const AXES: [char; 3] = ['x', 'y', 'z'];

/// Run every check against `profile`; all violations are reported in a fixed order.
pub fn evaluate(profile: &Profile, input: &EvaluationInput<'_>) -> DiagnosticVerdict {
    let mut reasons = Vec::new();

    if let Some(stats) = input.loop_stats {
        if stats.std_us > profile.max_cyc_jitter {
            reasons.push(format!(
                "loop_jitter {:.2} > {}",
                stats.std_us, profile.max_cyc_jitter
            ));
        }
    }

    if let Some(imu) = input.imu_stats {
        for (axis, std) in AXES.iter().zip(imu.gyro_std) {
            if std > profile.max_gyro_std {
                reasons.push(format!(
                    "gyro_std_{axis} {std:.2} > {}",
                    profile.max_gyro_std
                ));
            }
        }
        for (axis, bias) in AXES.iter().zip(imu.gyro_bias) {
            if bias.abs() > profile.max_gyro_bias {
                reasons.push(format!(
                    "gyro_bias_{axis} {bias:.2} > {}",
                    profile.max_gyro_bias
                ));
            }
        }
        if imu.acc_norm_std > profile.max_accnorm_std {
            reasons.push(format!(
                "acc_norm_std {:.2} > {}",
                imu.acc_norm_std, profile.max_accnorm_std
            ));
        }
    }

    if let Some(rate) = input.i2c_error_rate {
        if rate > profile.max_i2c_errors {
            reasons.push(format!(
                "i2c_error_rate {rate:.2} > {}",
                profile.max_i2c_errors
            ));
        }
    }

    if !profile.ignore_tilt {
        if let Some(tilt) = input.attitude.and_then(Attitude::tilt) {
            if tilt > profile.max_tilt {
                reasons.push(format!("tilt {tilt:.1} > {}", profile.max_tilt));
            }
        }
    }

    if let Some(analog) = input.analog {
        if let (Some(floor), Some(vbat)) = (profile.min_vbat, analog.vbat_v) {
            if vbat < floor {
                reasons.push(format!("vbat_low {vbat:.2} < {floor}"));
            }
        }
        if let (Some(ceiling), Some(amps)) = (profile.max_amps, analog.amps_a) {
            if amps > ceiling {
                reasons.push(format!("amps_high {amps:.2} > {ceiling}"));
            }
        }
    }

    DiagnosticVerdict {
        ok: reasons.is_empty(),
        reasons,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profile::ProfileSet;

    fn loop_stats(std_us: f64) -> LoopStatistics {
        LoopStatistics {
            samples: 100,
            mean_us: 250.0,
            std_us,
            min_us: 240.0,
            max_us: 260.0,
            p95: 255.0,
            p99: 256.0,
            loop_hz: 4000.0,
        }
    }

    fn imu(std: [f64; 3], bias: [f64; 3], acc: f64) -> ImuStatistics {
        ImuStatistics {
            samples: 100,
            gyro_std: std,
            gyro_bias: bias,
            acc_norm_std: acc,
        }
    }

    fn analog(vbat: f64, amps: f64) -> Analog {
        Analog {
            vbat_v: Some(vbat),
            mah_used: Some(0),
            rssi_raw: Some(0),
            amps_a: Some(amps),
        }
    }

    fn attitude(roll: f64, pitch: f64) -> Attitude {
        Attitude {
            roll_deg: Some(roll),
            pitch_deg: Some(pitch),
            yaw_deg: Some(0.0),
        }
    }

    #[test]
    fn within_bounds_is_ok() {
        let profile = ProfileSet::builtin().get("usb_stand").unwrap();
        let (l, i, a, t) = (
            loop_stats(5.0),
            imu([2.0; 3], [1.0; 3], 1.5),
            analog(5.0, 0.2),
            attitude(2.0, 3.0),
        );
        let verdict = evaluate(
            &profile,
            &EvaluationInput {
                loop_stats: Some(&l),
                imu_stats: Some(&i),
                i2c_error_rate: Some(0.0),
                analog: Some(&a),
                attitude: Some(&t),
            },
        );
        assert!(verdict.ok);
        assert!(verdict.reasons.is_empty());
    }

    #[test]
    fn jitter_violation_is_reported() {
        let profile = ProfileSet::builtin().get("field_strict").unwrap();
        let l = loop_stats(30.0);
        let verdict = evaluate(
            &profile,
            &EvaluationInput {
                loop_stats: Some(&l),
                ..Default::default()
            },
        );
        assert!(!verdict.ok);
        assert_eq!(verdict.reasons, vec!["loop_jitter 30.00 > 10".to_string()]);
    }

    #[test]
    fn every_violation_is_reported() {
        let profile = ProfileSet::builtin().get("field_strict").unwrap();
        let (l, i, a, t) = (
            loop_stats(30.0),
            imu([7.0, 2.0, 2.0], [-13.0, 0.0, 0.0], 7.0),
            analog(3.5, 0.6),
            attitude(20.0, 5.0),
        );
        let verdict = evaluate(
            &profile,
            &EvaluationInput {
                loop_stats: Some(&l),
                imu_stats: Some(&i),
                i2c_error_rate: Some(1.0),
                analog: Some(&a),
                attitude: Some(&t),
            },
        );
        assert!(!verdict.ok);
        assert_eq!(
            verdict.reasons,
            vec![
                "loop_jitter 30.00 > 10",
                "gyro_std_x 7.00 > 4",
                "gyro_bias_x 13.00 > 8",
                "acc_norm_std 7.00 > 4",
                "i2c_error_rate 1.00 > 0",
                "tilt 20.0 > 5",
                "vbat_low 3.50 < 6",
                "amps_high 0.60 > 0.5",
            ]
        );
    }

    #[test]
    fn tilt_is_skipped_when_ignored() {
        let profile = ProfileSet::builtin().get("usb_stand").unwrap();
        let t = attitude(45.0, -60.0);
        let verdict = evaluate(
            &profile,
            &EvaluationInput {
                attitude: Some(&t),
                ..Default::default()
            },
        );
        assert!(verdict.ok);
    }

    #[test]
    fn missing_inputs_skip_checks() {
        let profile = ProfileSet::builtin().get("field_strict").unwrap();
        let verdict = evaluate(&profile, &EvaluationInput::default());
        assert!(verdict.ok);

        let partial = Analog {
            vbat_v: None,
            amps_a: Some(9.0),
            ..Default::default()
        };
        let verdict = evaluate(
            &profile,
            &EvaluationInput {
                analog: Some(&partial),
                ..Default::default()
            },
        );
        assert_eq!(verdict.reasons, vec!["amps_high 9.00 > 0.5".to_string()]);
    }

    #[test]
    fn gyro_bias_reason_keeps_sign() {
        let profile = ProfileSet::builtin().get("field_strict").unwrap();
        let i = imu([1.0; 3], [0.0, -9.5, 2.0], 1.0);
        let verdict = evaluate(
            &profile,
            &EvaluationInput {
                imu_stats: Some(&i),
                ..Default::default()
            },
        );
        assert_eq!(verdict.reasons, vec!["gyro_bias_y -9.50 > 8".to_string()]);
    }

    #[test]
    fn negative_pitch_counts_as_tilt() {
        let profile = ProfileSet::builtin().get("field_strict").unwrap();
        let t = attitude(1.0, -7.5);
        let verdict = evaluate(
            &profile,
            &EvaluationInput {
                attitude: Some(&t),
                ..Default::default()
            },
        );
        assert_eq!(verdict.reasons, vec!["tilt 7.5 > 5".to_string()]);
    }
}
