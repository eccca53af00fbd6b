//! Layer statistics and throughput estimation.

use std::fmt::Write as _;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Value of a statistic.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum StatValue {
    /// Monotonically increasing value
    Counter(u64),
    /// Value that can go up or down
    Gauge(f64),
}

impl StatValue {
    /// Numeric value as `f64`.
    pub fn as_f64(&self) -> f64 {
        match self {
            StatValue::Counter(v) => *v as f64,
            StatValue::Gauge(v) => *v,
        }
    }
}

/// A named counter or gauge reported by one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistic {
    /// Name of the reporting layer.
    pub layer: String,
    /// Metric name within the layer.
    pub name: String,
    /// Point-in-time value.
    pub value: StatValue,
}

impl Statistic {
    /// Builds a counter statistic.
    pub fn counter(layer: &str, name: &str, value: u64) -> Self {
        Self {
            layer: layer.to_string(),
            name: name.to_string(),
            value: StatValue::Counter(value),
        }
    }

    /// Builds a gauge statistic.
    pub fn gauge(layer: &str, name: &str, value: f64) -> Self {
        Self {
            layer: layer.to_string(),
            name: name.to_string(),
            value: StatValue::Gauge(value),
        }
    }
}

/// Finds a statistic by layer and name.
pub fn find<'a>(stats: &'a [Statistic], layer: &str, name: &str) -> Option<&'a Statistic> {
    stats.iter().find(|s| s.layer == layer && s.name == name)
}

/// Renders statistics in Prometheus text exposition format.
pub fn render_prometheus(stats: &[Statistic]) -> String {
    let mut out = String::new();
    for stat in stats {
        let (kind, value) = match stat.value {
            StatValue::Counter(v) => ("counter", v.to_string()),
            StatValue::Gauge(v) => ("gauge", format!("{}", v)),
        };
        let name = format!("streamstack_{}", stat.name);
        let _ = writeln!(out, "# TYPE {} {}", name, kind);
        let _ = writeln!(out, "{}{{layer=\"{}\"}} {}", name, stat.layer, value);
    }
    out
}

const SAMPLE_CAPACITY: usize = 64;

/// Rolling throughput model used for completion estimates.
///
/// Keeps the last 64 (bytes, elapsed) samples in a ring buffer.
#[derive(Debug, Clone)]
pub struct ThroughputEstimator {
    samples: Vec<(u64, Duration)>,
    index: usize,
    default_bytes_per_sec: f64,
}

impl ThroughputEstimator {
    /// Creates an estimator that assumes `default_bytes_per_sec` until samples arrive.
    pub fn new(default_bytes_per_sec: f64) -> Self {
        Self {
            samples: Vec::with_capacity(SAMPLE_CAPACITY),
            index: 0,
            default_bytes_per_sec: default_bytes_per_sec.max(1.0),
        }
    }

    /// Records one finished operation.
    pub fn record(&mut self, bytes: u64, elapsed: Duration) {
        if self.samples.len() < SAMPLE_CAPACITY {
            self.samples.push((bytes, elapsed));
        } else {
            self.samples[self.index] = (bytes, elapsed);
            self.index = (self.index + 1) % SAMPLE_CAPACITY;
        }
    }

    /// Number of recorded samples (at most 64).
    pub fn sample_count(&self) -> usize {
        self.samples.len()
    }

    /// Observed throughput, or the configured default with no usable samples.
    pub fn bytes_per_second(&self) -> f64 {
        let bytes: u64 = self.samples.iter().map(|(b, _)| *b).sum();
        let secs: f64 = self.samples.iter().map(|(_, d)| d.as_secs_f64()).sum();
        if bytes == 0 || secs <= f64::EPSILON {
            self.default_bytes_per_sec
        } else {
            bytes as f64 / secs
        }
    }

    /// Average size of recorded operations.
    pub fn average_bytes(&self) -> Option<u64> {
        if self.samples.is_empty() {
            return None;
        }
        let bytes: u64 = self.samples.iter().map(|(b, _)| *b).sum();
        Some(bytes / self.samples.len() as u64)
    }

    /// Predicted duration for an operation of `bytes` (or of average size if unknown).
    pub fn estimate(&self, bytes: Option<u64>) -> Duration {
        let bytes = bytes.or_else(|| self.average_bytes()).unwrap_or(0);
        Duration::from_secs_f64(bytes as f64 / self.bytes_per_second())
    }
}

impl Default for ThroughputEstimator {
    fn default() -> Self {
        Self::new(100.0 * 1024.0 * 1024.0)
    }
}
