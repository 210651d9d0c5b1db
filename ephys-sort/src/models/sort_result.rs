//! Normalized sorter output
//!
//! Optional per-unit data is carried as [`Derived`], so a consumer can tell
//! "the sorter did not produce this" apart from "empty".

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use super::JobIdentity;
use crate::error::SortError;

/// Curated cluster quality
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QualityLabel {
    #[serde(rename = "good")]
    Good,
    #[serde(rename = "ok")]
    Ok,
    /// Multi-unit activity
    #[serde(rename = "mua")]
    Mua,
    #[serde(rename = "noise")]
    Noise,
    #[serde(rename = "n.a.")]
    NotAvailable,
}

impl QualityLabel {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityLabel::Good => "good",
            QualityLabel::Ok => "ok",
            QualityLabel::Mua => "mua",
            QualityLabel::Noise => "noise",
            QualityLabel::NotAvailable => "n.a.",
        }
    }
}

impl fmt::Display for QualityLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for QualityLabel {
    type Err = SortError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "good" => Ok(QualityLabel::Good),
            "ok" => Ok(QualityLabel::Ok),
            "mua" => Ok(QualityLabel::Mua),
            "noise" => Ok(QualityLabel::Noise),
            "n.a." | "na" | "" => Ok(QualityLabel::NotAvailable),
            other => Err(SortError::schema(
                "units.tsv",
                format!("unknown quality label '{}'", other),
            )),
        }
    }
}

/// Optional output that records why it is missing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum Derived<T> {
    Available(T),
    Unavailable { reason: String },
}

impl<T> Derived<T> {
    pub fn unavailable(reason: impl Into<String>) -> Self {
        Derived::Unavailable {
            reason: reason.into(),
        }
    }

    pub fn available(&self) -> Option<&T> {
        match self {
            Derived::Available(v) => Some(v),
            Derived::Unavailable { .. } => None,
        }
    }

    pub fn is_available(&self) -> bool {
        matches!(self, Derived::Available(_))
    }
}

/// One sorted unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Unit {
    pub unit: u32,
    pub quality_label: QualityLabel,
    pub peak_channel: Option<u32>,
    /// Spike times in seconds, ascending
    pub spike_times: Vec<f64>,
    /// Channel per spike
    pub spike_sites: Derived<Vec<u32>>,
    /// Depth (µm) per spike
    pub spike_depths: Derived<Vec<f64>>,
    /// Mean waveform on the peak channel (µV per sample)
    pub peak_waveform: Derived<Vec<f64>>,
    /// Feature vector per spike
    pub features: Derived<Vec<Vec<f64>>>,
}

impl Unit {
    pub fn spike_count(&self) -> usize {
        self.spike_times.len()
    }
}

/// External metric values per unit, already renamed to canonical metric names
pub type ExternalMetrics = BTreeMap<u32, BTreeMap<String, Option<f64>>>;

/// Ingested output of one successful job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SortResult {
    pub identity: JobIdentity,
    /// Recording duration used for rate metrics
    pub duration_s: f64,
    pub sampling_rate_hz: f64,
    /// Ordered by unit id
    pub units: Vec<Unit>,
    pub external_metrics: Derived<ExternalMetrics>,
}

impl SortResult {
    pub fn unit(&self, unit: u32) -> Option<&Unit> {
        self.units.iter().find(|u| u.unit == unit)
    }
}

/// Quality metrics for one unit; null when not computable
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QualityMetricRow {
    pub unit: u32,
    pub values: BTreeMap<String, Option<f64>>,
}

impl QualityMetricRow {
    pub fn get(&self, metric: &str) -> Option<f64> {
        self.values.get(metric).copied().flatten()
    }
}
