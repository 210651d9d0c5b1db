//! Quality metrics engine
//!
//! Computes one [`QualityMetricRow`] per unit. Each metric is independent:
//! a metric that cannot be computed for a unit (too few spikes, missing
//! waveform, singular covariance, ...) yields null for that metric only.
//!
//! Metrics without a built-in implementation are taken from the sorter's
//! external metric table, already renamed by the column adapter.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{Result, SortError};
use crate::models::{QualityMetricRow, SortResult, Unit};

/// Canonical cluster metric names
pub const CLUSTER_METRICS: &[&str] = &[
    "firing_rate",
    "snr",
    "presence_ratio",
    "isi_violation",
    "number_violation",
    "amplitude_cutoff",
    "isolation_distance",
    "l_ratio",
    "d_prime",
    "nn_hit_rate",
    "nn_miss_rate",
    "silhouette_score",
    "max_drift",
    "cumulative_drift",
    "contamination_rate",
];

/// Canonical waveform metric names
pub const WAVEFORM_METRICS: &[&str] = &[
    "amplitude",
    "duration",
    "halfwidth",
    "pt_ratio",
    "repolarization_slope",
    "recovery_slope",
    "spread",
    "velocity_above",
    "velocity_below",
];

/// Tunables of the built-in metrics
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricParams {
    /// ISIs shorter than this count as refractory violations
    pub refractory_period_s: f64,
    /// ISIs shorter than this are treated as duplicate detections
    pub censored_period_s: f64,
    /// Bin width for presence_ratio
    pub presence_bin_s: f64,
}

impl Default for MetricParams {
    fn default() -> Self {
        Self {
            refractory_period_s: 0.0015,
            censored_period_s: 0.0,
            presence_bin_s: 60.0,
        }
    }
}

/// Inputs shared by every metric of one computation
pub struct MetricContext<'a> {
    pub result: &'a SortResult,
    pub params: &'a MetricParams,
}

/// A per-unit metric
pub trait UnitMetric: Send + Sync {
    fn name(&self) -> &'static str;

    /// `None` when the metric is not computable for this unit
    fn compute(&self, ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64>;
}

struct NumSpikes;

impl UnitMetric for NumSpikes {
    fn name(&self) -> &'static str {
        "num_spikes"
    }

    fn compute(&self, _ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64> {
        Some(unit.spike_count() as f64)
    }
}

struct FiringRate;

impl UnitMetric for FiringRate {
    fn name(&self) -> &'static str {
        "firing_rate"
    }

    fn compute(&self, ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64> {
        let duration = ctx.result.duration_s;
        (duration > 0.0).then(|| unit.spike_count() as f64 / duration)
    }
}

struct PresenceRatio;

impl UnitMetric for PresenceRatio {
    fn name(&self) -> &'static str {
        "presence_ratio"
    }

    fn compute(&self, ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64> {
        let duration = ctx.result.duration_s;
        let bin = ctx.params.presence_bin_s;
        if duration <= 0.0 || bin <= 0.0 {
            return None;
        }

        let n_bins = ((duration / bin).ceil() as usize).max(1);
        let mut occupied = vec![false; n_bins];
        for t in &unit.spike_times {
            let index = ((t / bin) as usize).min(n_bins - 1);
            occupied[index] = true;
        }
        Some(occupied.iter().filter(|o| **o).count() as f64 / n_bins as f64)
    }
}

/// Inter-spike intervals at or above the censored period
fn intervals(unit: &Unit, censored: f64) -> Vec<f64> {
    unit.spike_times
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|isi| *isi >= censored)
        .collect()
}

struct NumberViolation;

impl UnitMetric for NumberViolation {
    fn name(&self) -> &'static str {
        "number_violation"
    }

    fn compute(&self, ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64> {
        let p = ctx.params;
        let count = intervals(unit, p.censored_period_s)
            .into_iter()
            .filter(|isi| *isi < p.refractory_period_s)
            .count();
        Some(count as f64)
    }
}

/// Rate of refractory violations relative to the unit's overall rate
struct IsiViolation;

impl UnitMetric for IsiViolation {
    fn name(&self) -> &'static str {
        "isi_violation"
    }

    fn compute(&self, ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64> {
        let p = ctx.params;
        let window = p.refractory_period_s - p.censored_period_s;
        let n = unit.spike_count() as f64;
        let duration = ctx.result.duration_s;
        if n == 0.0 || window <= 0.0 || duration <= 0.0 {
            return None;
        }

        let violations = intervals(unit, p.censored_period_s)
            .into_iter()
            .filter(|isi| *isi < p.refractory_period_s)
            .count() as f64;

        let violation_time = 2.0 * n * window;
        let total_rate = n / duration;
        Some((violations / violation_time) / total_rate)
    }
}

/// Mahalanobis isolation distance in feature space
struct IsolationDistance;

impl UnitMetric for IsolationDistance {
    fn name(&self) -> &'static str {
        "isolation_distance"
    }

    fn compute(&self, ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64> {
        let own = unit.features.available()?;
        let n = own.len();
        let dims = own.first()?.len();
        if dims == 0 || n <= dims {
            return None;
        }

        let others: Vec<&Vec<f64>> = ctx
            .result
            .units
            .iter()
            .filter(|u| u.unit != unit.unit)
            .filter_map(|u| u.features.available())
            .flatten()
            .filter(|f| f.len() == dims)
            .collect();
        if others.len() < n {
            return None;
        }

        let mean: Vec<f64> = (0..dims)
            .map(|d| own.iter().map(|f| f[d]).sum::<f64>() / n as f64)
            .collect();

        let mut cov = vec![vec![0.0; dims]; dims];
        for f in own {
            for i in 0..dims {
                for j in 0..dims {
                    cov[i][j] += (f[i] - mean[i]) * (f[j] - mean[j]);
                }
            }
        }
        for row in cov.iter_mut() {
            for v in row.iter_mut() {
                *v /= (n - 1) as f64;
            }
        }
        let inv = invert(cov)?;

        let mut distances: Vec<f64> = others
            .iter()
            .map(|f| {
                let delta: Vec<f64> = (0..dims).map(|d| f[d] - mean[d]).collect();
                (0..dims)
                    .map(|i| delta[i] * (0..dims).map(|j| inv[i][j] * delta[j]).sum::<f64>())
                    .sum::<f64>()
            })
            .collect();
        distances.sort_by(|a, b| a.total_cmp(b));
        distances.get(n - 1).copied()
    }
}

/// Gauss-Jordan inversion with partial pivoting; `None` when singular
fn invert(mut m: Vec<Vec<f64>>) -> Option<Vec<Vec<f64>>> {
    let n = m.len();
    let mut inv: Vec<Vec<f64>> = (0..n)
        .map(|i| (0..n).map(|j| if i == j { 1.0 } else { 0.0 }).collect())
        .collect();

    for col in 0..n {
        let pivot = (col..n).max_by(|a, b| m[*a][col].abs().total_cmp(&m[*b][col].abs()))?;
        if m[pivot][col].abs() < 1e-12 {
            return None;
        }
        m.swap(col, pivot);
        inv.swap(col, pivot);

        let p = m[col][col];
        for j in 0..n {
            m[col][j] /= p;
            inv[col][j] /= p;
        }
        for row in 0..n {
            if row != col {
                let factor = m[row][col];
                if factor != 0.0 {
                    for j in 0..n {
                        let (dm, dinv) = (factor * m[col][j], factor * inv[col][j]);
                        m[row][j] -= dm;
                        inv[row][j] -= dinv;
                    }
                }
            }
        }
    }
    Some(inv)
}

/// Index of the trough and of the largest sample after it
fn trough_and_peak(waveform: &[f64]) -> Option<(usize, usize)> {
    let trough = waveform
        .iter()
        .enumerate()
        .min_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| i)?;
    let peak = waveform[trough..]
        .iter()
        .enumerate()
        .skip(1)
        .max_by(|a, b| a.1.total_cmp(b.1))
        .map(|(i, _)| trough + i)?;
    Some((trough, peak))
}

/// Peak-to-peak amplitude of the mean waveform (µV)
struct Amplitude;

impl UnitMetric for Amplitude {
    fn name(&self) -> &'static str {
        "amplitude"
    }

    fn compute(&self, _ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64> {
        let waveform = unit.peak_waveform.available()?;
        let max = waveform.iter().copied().reduce(f64::max)?;
        let min = waveform.iter().copied().reduce(f64::min)?;
        Some(max - min)
    }
}

/// Trough-to-peak duration (ms)
struct Duration;

impl UnitMetric for Duration {
    fn name(&self) -> &'static str {
        "duration"
    }

    fn compute(&self, ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64> {
        let (trough, peak) = trough_and_peak(unit.peak_waveform.available()?)?;
        let rate = ctx.result.sampling_rate_hz;
        (rate > 0.0).then(|| (peak - trough) as f64 / rate * 1000.0)
    }
}

/// |peak after trough| / |trough|
struct PtRatio;

impl UnitMetric for PtRatio {
    fn name(&self) -> &'static str {
        "pt_ratio"
    }

    fn compute(&self, _ctx: &MetricContext<'_>, unit: &Unit) -> Option<f64> {
        let waveform = unit.peak_waveform.available()?;
        let (trough, peak) = trough_and_peak(waveform)?;
        let trough = waveform[trough].abs();
        (trough > 0.0).then(|| waveform[peak].abs() / trough)
    }
}

fn builtin_metrics() -> Vec<Box<dyn UnitMetric>> {
    vec![
        Box::new(NumSpikes),
        Box::new(FiringRate),
        Box::new(PresenceRatio),
        Box::new(IsiViolation),
        Box::new(NumberViolation),
        Box::new(IsolationDistance),
        Box::new(Amplitude),
        Box::new(Duration),
        Box::new(PtRatio),
    ]
}

/// Ordered selection of metric names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricSet {
    names: Vec<String>,
}

impl MetricSet {
    /// Every known metric: built-ins plus all canonical cluster/waveform names
    pub fn all() -> Self {
        let mut names = vec!["num_spikes".to_string()];
        for name in CLUSTER_METRICS.iter().chain(WAVEFORM_METRICS.iter()) {
            names.push(name.to_string());
        }
        Self { names }
    }

    pub fn from_names<S: AsRef<str>>(names: &[S]) -> Result<Self> {
        let known = Self::all();
        let mut selected: Vec<String> = Vec::new();
        for name in names {
            let name = name.as_ref().trim();
            if !known.names.iter().any(|k| k == name) {
                return Err(SortError::Common(ephys_common::Error::InvalidInput(format!(
                    "unknown metric '{}'",
                    name
                ))));
            }
            if !selected.iter().any(|s| s == name) {
                selected.push(name.to_string());
            }
        }
        Ok(Self { names: selected })
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

impl Default for MetricSet {
    fn default() -> Self {
        Self::all()
    }
}

/// Computes metric rows from a sort result
pub struct QualityMetricsEngine {
    metrics: BTreeMap<&'static str, Box<dyn UnitMetric>>,
    params: MetricParams,
}

impl QualityMetricsEngine {
    pub fn new(params: MetricParams) -> Self {
        let metrics = builtin_metrics().into_iter().map(|m| (m.name(), m)).collect();
        Self { metrics, params }
    }

    /// Add or replace a metric implementation
    pub fn register(&mut self, metric: Box<dyn UnitMetric>) {
        self.metrics.insert(metric.name(), metric);
    }

    /// One row per unit, in unit order
    pub fn compute(&self, result: &SortResult, metric_set: &MetricSet) -> Vec<QualityMetricRow> {
        let ctx = MetricContext {
            result,
            params: &self.params,
        };
        let external = result.external_metrics.available();

        result
            .units
            .iter()
            .map(|unit| {
                let from_table = external.and_then(|m| m.get(&unit.unit));
                let values = metric_set
                    .names()
                    .iter()
                    .map(|name| {
                        let computed = self
                            .metrics
                            .get(name.as_str())
                            .and_then(|m| m.compute(&ctx, unit))
                            .filter(|v| v.is_finite());
                        let value =
                            computed.or_else(|| from_table.and_then(|t| t.get(name).copied().flatten()));
                        (name.clone(), value)
                    })
                    .collect();
                QualityMetricRow {
                    unit: unit.unit,
                    values,
                }
            })
            .collect()
    }
}

impl Default for QualityMetricsEngine {
    fn default() -> Self {
        Self::new(MetricParams::default())
    }
}
