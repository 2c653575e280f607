//! Rolling statistics over telemetry samples.
//!
//! Timestamps are seconds (`f64`). Windowed containers evict every sample older
//! than `window` seconds relative to the newest insertion.

use std::collections::VecDeque;

use serde::{Serialize, Serializer};

/// Default look-back of the loop timing analyzer, seconds.
pub const LOOP_WINDOW_S: f64 = 60.0;
/// Default look-back of the IMU analyzer, seconds.
pub const IMU_WINDOW_S: f64 = 30.0;
/// Capacity of each scalar history series.
pub const HISTORY_LEN: usize = 600;

// ============================================================================
// RollingStats
// ============================================================================

/// Time-windowed running sum / sum of squares with exact min, max and percentiles.
#[derive(Debug, Clone)]
pub struct RollingStats {
    window: f64,
    items: VecDeque<(f64, f64)>,
    sum: f64,
    sum_sq: f64,
}

impl RollingStats {
    pub fn new(window: f64) -> Self {
        Self {
            window,
            items: VecDeque::new(),
            sum: 0.0,
            sum_sq: 0.0,
        }
    }

    pub fn push(&mut self, value: f64, ts: f64) {
        self.items.push_back((ts, value));
        self.sum += value;
        self.sum_sq += value * value;
        self.evict(ts);
    }

    fn evict(&mut self, now: f64) {
        while let Some(&(ts, value)) = self.items.front() {
            if now - ts <= self.window {
                break;
            }
            self.items.pop_front();
            self.sum -= value;
            self.sum_sq -= value * value;
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn mean(&self) -> f64 {
        if self.items.is_empty() {
            return 0.0;
        }
        self.sum / self.items.len() as f64
    }

    /// Population standard deviation; zero below two samples.
    pub fn std(&self) -> f64 {
        let n = self.items.len();
        if n < 2 {
            return 0.0;
        }
        let mean = self.mean();
        (self.sum_sq / n as f64 - mean * mean).max(0.0).sqrt()
    }

    pub fn min(&self) -> f64 {
        self.values().reduce(f64::min).unwrap_or(0.0)
    }

    pub fn max(&self) -> f64 {
        self.values().reduce(f64::max).unwrap_or(0.0)
    }

    /// Linear-interpolated percentile, `pct` in `0..=100`.
    pub fn percentile(&self, pct: f64) -> f64 {
        let mut sorted: Vec<f64> = self.values().collect();
        if sorted.is_empty() {
            return 0.0;
        }
        sorted.sort_by(f64::total_cmp);
        let k = (sorted.len() - 1) as f64 * (pct / 100.0);
        let lo = k.floor() as usize;
        let hi = (k.ceil() as usize).min(sorted.len() - 1);
        if lo == hi {
            return sorted[lo];
        }
        sorted[lo] * (hi as f64 - k) + sorted[hi] * (k - lo as f64)
    }

    pub fn clear(&mut self) {
        self.items.clear();
        self.sum = 0.0;
        self.sum_sq = 0.0;
    }

    fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.items.iter().map(|&(_, v)| v)
    }
}

// ============================================================================
// Loop timing
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LoopStatistics {
    pub samples: usize,
    pub mean_us: f64,
    pub std_us: f64,
    pub min_us: f64,
    pub max_us: f64,
    pub p95: f64,
    pub p99: f64,
    pub loop_hz: f64,
}

#[derive(Debug, Clone)]
pub struct LoopAnalyzer {
    stats: RollingStats,
}

impl Default for LoopAnalyzer {
    fn default() -> Self {
        Self::new(LOOP_WINDOW_S)
    }
}

impl LoopAnalyzer {
    pub fn new(window: f64) -> Self {
        Self {
            stats: RollingStats::new(window),
        }
    }

    pub fn add_sample(&mut self, cycle_time_us: f64, ts: f64) {
        self.stats.push(cycle_time_us, ts);
    }

    pub fn snapshot(&self) -> Option<LoopStatistics> {
        if self.stats.is_empty() {
            return None;
        }
        let mean_us = self.stats.mean();
        Some(LoopStatistics {
            samples: self.stats.len(),
            mean_us,
            std_us: self.stats.std(),
            min_us: self.stats.min(),
            max_us: self.stats.max(),
            p95: self.stats.percentile(95.0),
            p99: self.stats.percentile(99.0),
            loop_hz: if mean_us > 0.0 { 1_000_000.0 / mean_us } else { 0.0 },
        })
    }

    pub fn reset(&mut self) {
        self.stats.clear();
    }
}

// ============================================================================
// IMU
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImuStatistics {
    pub samples: usize,
    pub gyro_std: [f64; 3],
    pub gyro_bias: [f64; 3],
    pub acc_norm_std: f64,
}

#[derive(Debug, Clone, Copy)]
struct ImuSample {
    ts: f64,
    gyro: [i16; 3],
    acc: [i16; 3],
}

#[derive(Debug, Clone)]
pub struct ImuAnalyzer {
    window: f64,
    samples: VecDeque<ImuSample>,
}

impl Default for ImuAnalyzer {
    fn default() -> Self {
        Self::new(IMU_WINDOW_S)
    }
}

impl ImuAnalyzer {
    pub fn new(window: f64) -> Self {
        Self {
            window,
            samples: VecDeque::new(),
        }
    }

    pub fn add_sample(&mut self, gyro: [i16; 3], acc: [i16; 3], ts: f64) {
        self.samples.push_back(ImuSample { ts, gyro, acc });
        while let Some(front) = self.samples.front() {
            if ts - front.ts <= self.window {
                break;
            }
            self.samples.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn snapshot(&self) -> Option<ImuStatistics> {
        if self.samples.is_empty() {
            return None;
        }
        let mut gyro_std = [0.0; 3];
        let mut gyro_bias = [0.0; 3];
        for axis in 0..3 {
            let values: Vec<f64> = self
                .samples
                .iter()
                .map(|s| f64::from(s.gyro[axis]))
                .collect();
            let (mean, std) = mean_std(&values);
            gyro_bias[axis] = mean;
            gyro_std[axis] = std;
        }
        let norms: Vec<f64> = self
            .samples
            .iter()
            .map(|s| s.acc.iter().map(|&a| f64::from(a).powi(2)).sum::<f64>().sqrt())
            .collect();
        Some(ImuStatistics {
            samples: self.samples.len(),
            gyro_std,
            gyro_bias,
            acc_norm_std: mean_std(&norms).1,
        })
    }

    pub fn reset(&mut self) {
        self.samples.clear();
    }
}

/// Mean and population standard deviation.
fn mean_std(values: &[f64]) -> (f64, f64) {
    if values.is_empty() {
        return (0.0, 0.0);
    }
    let n = values.len() as f64;
    let mean = values.iter().sum::<f64>() / n;
    let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, var.sqrt())
}

// ============================================================================
// Bounded history
// ============================================================================

/// Fixed-capacity FIFO; pushing onto a full history evicts the oldest entry.
#[derive(Debug, Clone)]
pub struct BoundedHistory<T> {
    capacity: usize,
    items: VecDeque<T>,
}

impl<T> BoundedHistory<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            items: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn push(&mut self, item: T) {
        if self.capacity == 0 {
            return;
        }
        if self.items.len() == self.capacity {
            self.items.pop_front();
        }
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn last(&self) -> Option<&T> {
        self.items.back()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

impl<T: Serialize> Serialize for BoundedHistory<T> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_seq(&self.items)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn rolling_stats_basic_moments() {
        let mut stats = RollingStats::new(60.0);
        for (i, v) in [2.0, 4.0, 4.0, 4.0, 5.0, 5.0, 7.0, 9.0].iter().enumerate() {
            stats.push(*v, i as f64);
        }
        assert_eq!(stats.len(), 8);
        assert!(close(stats.mean(), 5.0));
        assert!(close(stats.std(), 2.0));
        assert_eq!(stats.min(), 2.0);
        assert_eq!(stats.max(), 9.0);
    }

    #[test]
    fn rolling_stats_evicts_outside_window() {
        let mut stats = RollingStats::new(10.0);
        stats.push(100.0, 0.0);
        stats.push(1.0, 5.0);
        stats.push(1.0, 10.0);
        // exactly `window` old is kept
        assert_eq!(stats.len(), 3);
        stats.push(1.0, 10.5);
        assert_eq!(stats.len(), 3);
        assert!(close(stats.mean(), 1.0));
        assert!(close(stats.std(), 0.0));
    }

    #[test]
    fn percentiles_interpolate() {
        let mut stats = RollingStats::new(1000.0);
        for v in 1..=100 {
            stats.push(f64::from(v), 0.0);
        }
        assert!(close(stats.percentile(95.0), 95.05));
        assert!(close(stats.percentile(99.0), 99.01));
        assert!(close(stats.percentile(100.0), 100.0));
        assert_eq!(RollingStats::new(1.0).percentile(50.0), 0.0);
    }

    #[test]
    fn single_sample_has_zero_std() {
        let mut stats = RollingStats::new(1.0);
        stats.push(42.0, 0.0);
        assert_eq!(stats.std(), 0.0);
    }

    #[test]
    fn loop_analyzer_snapshot() {
        let mut analyzer = LoopAnalyzer::default();
        assert!(analyzer.snapshot().is_none());
        for (i, cycle) in [240.0, 250.0, 260.0].iter().enumerate() {
            analyzer.add_sample(*cycle, i as f64 * 0.1);
        }
        let snap = analyzer.snapshot().unwrap();
        assert_eq!(snap.samples, 3);
        assert!(close(snap.mean_us, 250.0));
        assert!(close(snap.loop_hz, 4000.0));
        assert_eq!(snap.min_us, 240.0);
        assert_eq!(snap.max_us, 260.0);
        analyzer.reset();
        assert!(analyzer.snapshot().is_none());
    }

    #[test]
    fn imu_analyzer_bias_std_and_norm() {
        let mut imu = ImuAnalyzer::default();
        imu.add_sample([1, 10, -2], [0, 0, 510], 0.0);
        imu.add_sample([3, 10, -4], [0, 0, 514], 0.1);
        let snap = imu.snapshot().unwrap();
        assert_eq!(snap.samples, 2);
        assert!(close(snap.gyro_bias[0], 2.0));
        assert!(close(snap.gyro_bias[1], 10.0));
        assert!(close(snap.gyro_bias[2], -3.0));
        assert!(close(snap.gyro_std[0], 1.0));
        assert!(close(snap.gyro_std[1], 0.0));
        assert!(close(snap.acc_norm_std, 2.0));
    }

    #[test]
    fn imu_analyzer_window() {
        let mut imu = ImuAnalyzer::new(1.0);
        imu.add_sample([100, 0, 0], [0, 0, 512], 0.0);
        imu.add_sample([0, 0, 0], [0, 0, 512], 2.0);
        assert_eq!(imu.len(), 1);
        assert!(close(imu.snapshot().unwrap().gyro_bias[0], 0.0));
    }

    #[test]
    fn bounded_history_drops_oldest() {
        let mut history = BoundedHistory::new(3);
        for v in 0..5 {
            history.push(v);
        }
        assert_eq!(history.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(history.last(), Some(&4));
        assert_eq!(serde_json::to_string(&history).unwrap(), "[2,3,4]");
    }
}
