//! RSSI smoothing and distance estimation
//!
//! Raw RSSI advertisements are noisy; the device governor pushes every sample
//! through a filter and reports the smoothed value. Distance is estimated
//! from the log-distance path loss model.

use std::collections::VecDeque;
use std::fmt;

/// A stateful smoothing filter over raw RSSI samples
pub trait SignalFilter: Send + fmt::Debug {
    /// Feed one raw sample, returning the smoothed estimate
    fn next(&mut self, raw: i16) -> i16;

    /// The current estimate, `None` before the first sample
    fn current(&self) -> Option<i16>;
}

/// Built-in filter selection. A fresh instance is created per selection;
/// switching filters discards prior filter state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// Pass samples through unchanged
    None,
    /// One-dimensional Kalman filter (default)
    Kalman,
    /// Mean over a sliding window of recent samples
    MovingAverage,
}

impl FilterKind {
    /// Construct a new filter instance of this kind
    pub fn create(self) -> Box<dyn SignalFilter> {
        match self {
            FilterKind::None => Box::new(PassthroughFilter::default()),
            FilterKind::Kalman => Box::new(KalmanFilter::default()),
            FilterKind::MovingAverage => Box::new(MovingAverageFilter::default()),
        }
    }
}

impl Default for FilterKind {
    fn default() -> Self {
        FilterKind::Kalman
    }
}

/// Identity filter
#[derive(Debug, Default)]
pub struct PassthroughFilter {
    last: Option<i16>,
}

impl SignalFilter for PassthroughFilter {
    fn next(&mut self, raw: i16) -> i16 {
        self.last = Some(raw);
        raw
    }

    fn current(&self) -> Option<i16> {
        self.last
    }
}

/// One-dimensional Kalman filter for RSSI streams.
///
/// The state is the smoothed RSSI itself. The first sample initializes the
/// estimate; each subsequent sample is blended in proportionally to the
/// current error covariance.
#[derive(Debug)]
pub struct KalmanFilter {
    process_variance: f64,
    measurement_variance: f64,
    estimate: Option<f64>,
    error_covariance: f64,
}

impl KalmanFilter {
    const DEFAULT_PROCESS_VARIANCE: f64 = 0.125;
    const DEFAULT_MEASUREMENT_VARIANCE: f64 = 30.0;

    pub fn new(process_variance: f64, measurement_variance: f64) -> Self {
        Self {
            process_variance,
            measurement_variance,
            estimate: None,
            error_covariance: 0.0,
        }
    }
}

impl Default for KalmanFilter {
    fn default() -> Self {
        Self::new(
            Self::DEFAULT_PROCESS_VARIANCE,
            Self::DEFAULT_MEASUREMENT_VARIANCE,
        )
    }
}

impl SignalFilter for KalmanFilter {
    fn next(&mut self, raw: i16) -> i16 {
        let measurement = f64::from(raw);
        let estimate = match self.estimate {
            None => {
                self.error_covariance = self.measurement_variance;
                measurement
            }
            Some(previous) => {
                let predicted_covariance = self.error_covariance + self.process_variance;
                let gain = predicted_covariance / (predicted_covariance + self.measurement_variance);
                self.error_covariance = (1.0 - gain) * predicted_covariance;
                previous + gain * (measurement - previous)
            }
        };
        self.estimate = Some(estimate);
        estimate.round() as i16
    }

    fn current(&self) -> Option<i16> {
        self.estimate.map(|estimate| estimate.round() as i16)
    }
}

/// Mean over the last `window` samples
#[derive(Debug)]
pub struct MovingAverageFilter {
    window: usize,
    samples: VecDeque<i16>,
}

impl MovingAverageFilter {
    const DEFAULT_WINDOW: usize = 10;

    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            samples: VecDeque::new(),
        }
    }
}

impl Default for MovingAverageFilter {
    fn default() -> Self {
        Self::new(Self::DEFAULT_WINDOW)
    }
}

impl SignalFilter for MovingAverageFilter {
    fn next(&mut self, raw: i16) -> i16 {
        if self.samples.len() == self.window {
            self.samples.pop_front();
        }
        self.samples.push_back(raw);
        self.current().unwrap_or(raw)
    }

    fn current(&self) -> Option<i16> {
        if self.samples.is_empty() {
            return None;
        }
        let sum: i32 = self.samples.iter().map(|&sample| i32::from(sample)).sum();
        Some((f64::from(sum) / self.samples.len() as f64).round() as i16)
    }
}

/// Log-distance path loss estimate: `d = 10 ^ ((tx_power - rssi) / (10 * n))`.
///
/// `tx_power` is the RSSI measured one meter away. A tx power of 0 means
/// "unavailable" and yields a 0.0 sentinel. The propagation exponent `n`
/// normally ranges from 2.0 (open air) to 4.0 (indoors).
pub fn estimate_distance(tx_power: i16, rssi: i16, propagation_exponent: f64) -> f64 {
    if tx_power == 0 {
        return 0.0;
    }
    let exponent = f64::from(tx_power - rssi) / (10.0 * propagation_exponent);
    10f64.powf(exponent)
}
