//! Column-name adapters for sorter output tables
//!
//! Every column of every output table must be either mapped to a canonical
//! name or explicitly ignored; anything else is a `SchemaMismatch`. Adapters
//! are versioned: `[[adapter]]` config tables add new versions, optionally
//! extending an existing adapter.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{Result, SortError};
use crate::services::quality_metrics::{CLUSTER_METRICS, WAVEFORM_METRICS};
use crate::services::result_ingestor::{FEATURES_FILE, METRICS_FILE, SPIKES_FILE, UNITS_FILE, WAVEFORMS_FILE};

/// Name of the adapter used when a sorter does not declare one
pub const DEFAULT_ADAPTER: &str = "spikeinterface";

/// Sorter output table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Artifact {
    Units,
    Spikes,
    Waveforms,
    Features,
    Metrics,
}

impl Artifact {
    pub fn file_name(&self) -> &'static str {
        match self {
            Artifact::Units => UNITS_FILE,
            Artifact::Spikes => SPIKES_FILE,
            Artifact::Waveforms => WAVEFORMS_FILE,
            Artifact::Features => FEATURES_FILE,
            Artifact::Metrics => METRICS_FILE,
        }
    }
}

/// external name → canonical name, for one table
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnMap {
    #[serde(default)]
    pub columns: BTreeMap<String, String>,
    /// external prefix → canonical prefix, e.g. `pc_` → `f` maps `pc_3` to `f3`
    #[serde(default)]
    pub prefixes: BTreeMap<String, String>,
    /// Columns known to carry nothing we consume
    #[serde(default)]
    pub ignored: Vec<String>,
}

impl ColumnMap {
    fn overlay(&mut self, other: &ColumnMap) {
        self.columns
            .extend(other.columns.iter().map(|(k, v)| (k.clone(), v.clone())));
        self.prefixes
            .extend(other.prefixes.iter().map(|(k, v)| (k.clone(), v.clone())));
        for name in &other.ignored {
            if !self.ignored.contains(name) {
                self.ignored.push(name.clone());
            }
        }
    }

    fn lookup(&self, external: &str) -> Option<ColumnTarget> {
        if let Some(canonical) = self.columns.get(external) {
            return Some(ColumnTarget::Canonical(canonical.clone()));
        }
        if self.ignored.iter().any(|i| i == external) {
            return Some(ColumnTarget::Ignored);
        }
        // Longest matching prefix wins
        self.prefixes
            .iter()
            .filter(|(prefix, _)| external.len() > prefix.len() && external.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .and_then(|(prefix, canonical_prefix)| {
                let suffix = &external[prefix.len()..];
                suffix
                    .chars()
                    .all(|c| c.is_ascii_digit())
                    .then(|| ColumnTarget::Canonical(format!("{}{}", canonical_prefix, suffix)))
            })
    }
}

/// Where an external column goes
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnTarget {
    Canonical(String),
    Ignored,
}

/// `[[adapter]]` config table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub name: String,
    pub version: u32,
    /// Base adapter, `name` (latest version) or `name@version`
    #[serde(default)]
    pub extends: Option<String>,
    #[serde(default)]
    pub units: ColumnMap,
    #[serde(default)]
    pub spikes: ColumnMap,
    #[serde(default)]
    pub waveforms: ColumnMap,
    #[serde(default)]
    pub features: ColumnMap,
    #[serde(default)]
    pub metrics: ColumnMap,
}

/// One version of a column adapter
#[derive(Debug, Clone, PartialEq)]
pub struct NameAdapter {
    pub name: String,
    pub version: u32,
    maps: BTreeMap<Artifact, ColumnMap>,
}

impl NameAdapter {
    /// Map every header of `artifact` to a target, failing closed
    pub fn map_columns(&self, artifact: Artifact, headers: &[String]) -> Result<Vec<ColumnTarget>> {
        let empty = ColumnMap::default();
        let map = self.maps.get(&artifact).unwrap_or(&empty);
        let mut seen = BTreeSet::new();
        let mut targets = Vec::with_capacity(headers.len());

        for header in headers {
            let header = header.trim();
            let target = map.lookup(header).ok_or_else(|| {
                SortError::schema(
                    artifact.file_name(),
                    format!(
                        "unmapped column '{}' (adapter {}@{})",
                        header, self.name, self.version
                    ),
                )
            })?;

            if let ColumnTarget::Canonical(name) = &target {
                if !seen.insert(name.clone()) {
                    return Err(SortError::schema(
                        artifact.file_name(),
                        format!("more than one column maps to '{}'", name),
                    ));
                }
            }
            targets.push(target);
        }

        Ok(targets)
    }

    /// Built-in adapter for SpikeInterface / Kilosort style tables
    pub fn builtin() -> Self {
        fn map(columns: &[(&str, &str)], ignored: &[&str]) -> ColumnMap {
            ColumnMap {
                columns: columns
                    .iter()
                    .map(|(e, c)| (e.to_string(), c.to_string()))
                    .collect(),
                prefixes: BTreeMap::new(),
                ignored: ignored.iter().map(|s| s.to_string()).collect(),
            }
        }

        let units = map(
            &[
                ("unit", "unit"),
                ("unit_id", "unit"),
                ("cluster_id", "unit"),
                ("quality_label", "quality_label"),
                ("KSLabel", "quality_label"),
                ("cluster_quality_label", "quality_label"),
                ("quality", "quality_label"),
                ("peak_channel", "peak_channel"),
                ("ch", "peak_channel"),
                ("spike_count", "spike_count"),
                ("num_spikes", "spike_count"),
                ("n_spikes", "spike_count"),
            ],
            &["Amplitude", "ContamPct", "amp", "fr", "depth", "sh", "group"],
        );

        let spikes = map(
            &[
                ("unit", "unit"),
                ("unit_id", "unit"),
                ("spike_clusters", "unit"),
                ("cluster", "unit"),
                ("spike_time", "spike_time"),
                ("spike_times", "spike_time"),
                ("spike_time_s", "spike_time"),
                ("spike_sample", "spike_sample"),
                ("sample_index", "spike_sample"),
                ("spike_site", "spike_site"),
                ("channel_index", "spike_site"),
                ("spike_depth", "spike_depth"),
                ("depth", "spike_depth"),
            ],
            &["amplitude", "spike_amplitude"],
        );

        let waveforms = map(
            &[
                ("unit", "unit"),
                ("unit_id", "unit"),
                ("sample_index", "sample_index"),
                ("sample", "sample_index"),
                ("amplitude_uv", "amplitude_uv"),
                ("amplitude", "amplitude_uv"),
                ("value", "amplitude_uv"),
            ],
            &["channel"],
        );

        let mut features = map(
            &[
                ("unit", "unit"),
                ("unit_id", "unit"),
                ("spike_index", "spike_index"),
            ],
            &[],
        );
        features.prefixes.insert("pc_".to_string(), "f".to_string());
        features.prefixes.insert("f".to_string(), "f".to_string());

        let mut metric_columns: Vec<(&str, &str)> = vec![
            ("unit", "unit"),
            ("unit_id", "unit"),
            ("num_spikes", "num_spikes"),
            ("amplitude_median", "amplitude"),
            ("isi_violations_ratio", "isi_violation"),
            ("isi_violations_count", "number_violation"),
            ("silhouette", "silhouette_score"),
            ("rp_contamination", "contamination_rate"),
            ("drift_ptp", "max_drift"),
            ("drift_mad", "cumulative_drift"),
            ("half_width", "halfwidth"),
            ("peak_trough_ratio", "pt_ratio"),
            ("peak_to_valley", "duration"),
        ];
        metric_columns.extend(CLUSTER_METRICS.iter().map(|m| (*m, *m)));
        metric_columns.extend(WAVEFORM_METRICS.iter().map(|m| (*m, *m)));
        let metrics = map(
            &metric_columns,
            &[
                "rp_violations",
                "drift_std",
                "sync_spike_2",
                "sync_spike_4",
                "sync_spike_8",
                "firing_range",
                "sd_ratio",
                "amplitude_cv_median",
                "amplitude_cv_range",
                "exp_decay",
                "num_positive_peaks",
                "num_negative_peaks",
            ],
        );

        let mut maps = BTreeMap::new();
        maps.insert(Artifact::Units, units);
        maps.insert(Artifact::Spikes, spikes);
        maps.insert(Artifact::Waveforms, waveforms);
        maps.insert(Artifact::Features, features);
        maps.insert(Artifact::Metrics, metrics);

        Self {
            name: DEFAULT_ADAPTER.to_string(),
            version: 1,
            maps,
        }
    }
}

/// All known adapters, by name then version
#[derive(Debug, Clone)]
pub struct AdapterRegistry {
    adapters: BTreeMap<String, BTreeMap<u32, NameAdapter>>,
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        let builtin = NameAdapter::builtin();
        let mut adapters = BTreeMap::new();
        adapters
            .entry(builtin.name.clone())
            .or_insert_with(BTreeMap::new)
            .insert(builtin.version, builtin);
        Self { adapters }
    }
}

impl AdapterRegistry {
    /// Built-in adapter plus configured versions, applied in order
    pub fn new(configs: &[AdapterConfig]) -> Result<Self> {
        let mut registry = Self::default();

        for config in configs {
            let exists = registry
                .adapters
                .get(&config.name)
                .map_or(false, |versions| versions.contains_key(&config.version));
            if exists {
                return Err(SortError::Common(ephys_common::Error::Config(format!(
                    "adapter {}@{} declared twice",
                    config.name, config.version
                ))));
            }

            let mut maps = match &config.extends {
                Some(base) => registry.resolve(Some(base))?.maps.clone(),
                None => BTreeMap::new(),
            };
            for (artifact, overlay) in [
                (Artifact::Units, &config.units),
                (Artifact::Spikes, &config.spikes),
                (Artifact::Waveforms, &config.waveforms),
                (Artifact::Features, &config.features),
                (Artifact::Metrics, &config.metrics),
            ] {
                maps.entry(artifact).or_default().overlay(overlay);
            }

            tracing::debug!(adapter = %config.name, version = config.version, "Registered column adapter");
            registry
                .adapters
                .entry(config.name.clone())
                .or_default()
                .insert(
                    config.version,
                    NameAdapter {
                        name: config.name.clone(),
                        version: config.version,
                        maps,
                    },
                );
        }

        Ok(registry)
    }

    /// Resolve `name`, `name@version` or (None) the default adapter's latest version
    pub fn resolve(&self, spec: Option<&str>) -> Result<&NameAdapter> {
        let spec = spec.unwrap_or(DEFAULT_ADAPTER);
        let (name, version) = match spec.split_once('@') {
            Some((name, version)) => {
                let version = version.parse::<u32>().map_err(|_| {
                    SortError::UnresolvedDependency(format!("invalid adapter version in '{}'", spec))
                })?;
                (name, Some(version))
            }
            None => (spec, None),
        };

        let versions = self
            .adapters
            .get(name)
            .ok_or_else(|| SortError::UnresolvedDependency(format!("adapter '{}' is not defined", name)))?;

        let adapter = match version {
            Some(v) => versions.get(&v),
            None => versions.values().next_back(),
        };

        adapter.ok_or_else(|| SortError::UnresolvedDependency(format!("adapter '{}' is not defined", spec)))
    }
}
