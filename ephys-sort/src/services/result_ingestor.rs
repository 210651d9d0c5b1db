//! Result ingestion
//!
//! Parses a sorter's tab-separated output set into a [`SortResult`]:
//!
//! | file                  | required | canonical columns                                  |
//! |-----------------------|----------|----------------------------------------------------|
//! | `units.tsv`           | yes      | unit, quality_label, peak_channel, spike_count     |
//! | `spike_times.tsv`     | yes      | unit, spike_time / spike_sample, spike_site, spike_depth |
//! | `waveforms.tsv`       | no       | unit, sample_index, amplitude_uv                   |
//! | `features.tsv`        | no       | unit, spike_index, f0..fN                          |
//! | `quality_metrics.tsv` | no       | unit + canonical metric names                      |
//!
//! External column names go through the sorter's [`NameAdapter`]. Anything
//! inconsistent (unknown unit ids, count mismatches, unparsable values) is a
//! `SchemaMismatch`; the ingestor never guesses.

use sqlx::SqlitePool;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;

use crate::db;
use crate::error::{Result, SortError};
use crate::models::{
    Derived, ExternalMetrics, Job, JobIdentity, JobState, QualityLabel, Recording, SortResult, Unit,
};
use crate::services::name_adapter::{AdapterRegistry, Artifact, ColumnTarget, NameAdapter};
use crate::services::sorter_catalog::SorterCatalog;

pub const UNITS_FILE: &str = "units.tsv";
pub const SPIKES_FILE: &str = "spike_times.tsv";
pub const WAVEFORMS_FILE: &str = "waveforms.tsv";
pub const FEATURES_FILE: &str = "features.tsv";
pub const METRICS_FILE: &str = "quality_metrics.tsv";

/// One table after column remapping: canonical name → raw cell, per row
struct Table {
    artifact: Artifact,
    columns: BTreeSet<String>,
    rows: Vec<BTreeMap<String, String>>,
}

impl Table {
    fn has(&self, column: &str) -> bool {
        self.columns.contains(column)
    }

    fn require(&self, column: &str) -> Result<()> {
        if self.has(column) {
            Ok(())
        } else {
            Err(SortError::schema(
                self.artifact.file_name(),
                format!("missing required column '{}'", column),
            ))
        }
    }
}

/// Read a table, `None` when the file does not exist
fn read_table(dir: &Path, artifact: Artifact, adapter: &NameAdapter) -> Result<Option<Table>> {
    let path = dir.join(artifact.file_name());
    if !path.exists() {
        return Ok(None);
    }

    let malformed = |e: csv::Error| SortError::schema(artifact.file_name(), e.to_string());

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .trim(csv::Trim::All)
        .from_path(&path)
        .map_err(malformed)?;

    let headers: Vec<String> = reader
        .headers()
        .map_err(malformed)?
        .iter()
        .map(str::to_string)
        .collect();
    let targets = adapter.map_columns(artifact, &headers)?;

    let columns = targets
        .iter()
        .filter_map(|t| match t {
            ColumnTarget::Canonical(name) => Some(name.clone()),
            ColumnTarget::Ignored => None,
        })
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(malformed)?;
        let row = targets
            .iter()
            .zip(record.iter())
            .filter_map(|(target, cell)| match target {
                ColumnTarget::Canonical(name) => Some((name.clone(), cell.to_string())),
                ColumnTarget::Ignored => None,
            })
            .collect();
        rows.push(row);
    }

    Ok(Some(Table {
        artifact,
        columns,
        rows,
    }))
}

fn cell<'a>(row: &'a BTreeMap<String, String>, column: &str) -> Option<&'a str> {
    row.get(column).map(String::as_str).filter(|v| !v.is_empty())
}

fn parse_u32(artifact: Artifact, line: usize, column: &str, raw: &str) -> Result<u32> {
    raw.parse::<u32>().map_err(|_| {
        SortError::schema(
            artifact.file_name(),
            format!("row {}: '{}' is not a valid {}", line, raw, column),
        )
    })
}

fn parse_finite(artifact: Artifact, line: usize, column: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| {
            SortError::schema(
                artifact.file_name(),
                format!("row {}: '{}' is not a finite {}", line, raw, column),
            )
        })
}

/// Metric cell: empty, NaN and ±inf become null
fn parse_metric(line: usize, column: &str, raw: &str) -> Result<Option<f64>> {
    if raw.is_empty() {
        return Ok(None);
    }
    match raw.to_ascii_lowercase().as_str() {
        "nan" | "inf" | "+inf" | "-inf" | "infinity" | "-infinity" | "null" | "none" => Ok(None),
        _ => raw
            .parse::<f64>()
            .map(|v| v.is_finite().then_some(v))
            .map_err(|_| {
                SortError::schema(
                    METRICS_FILE,
                    format!("row {}: '{}' is not a number for {}", line, raw, column),
                )
            }),
    }
}

fn unknown_unit(artifact: Artifact, line: usize, unit: u32) -> SortError {
    SortError::schema(
        artifact.file_name(),
        format!("row {}: unit {} is not listed in {}", line, unit, UNITS_FILE),
    )
}

/// Per-unit spike data accumulated from `spike_times.tsv`
#[derive(Default)]
struct SpikeColumns {
    times: Vec<f64>,
    sites: Vec<u32>,
    depths: Vec<f64>,
}

/// Parse and validate an output directory
///
/// Used both for ingestion of SUCCEEDED jobs and by the trigger to validate
/// an output set before recording success.
pub fn parse_output(
    identity: &JobIdentity,
    output_dir: &Path,
    recording: &Recording,
    adapter: &NameAdapter,
) -> Result<SortResult> {
    let units_table = read_table(output_dir, Artifact::Units, adapter)?
        .ok_or_else(|| SortError::schema(UNITS_FILE, "file is missing"))?;
    let spikes_table = read_table(output_dir, Artifact::Spikes, adapter)?
        .ok_or_else(|| SortError::schema(SPIKES_FILE, "file is missing"))?;

    // units.tsv
    units_table.require("unit")?;
    let artifact = Artifact::Units;
    let mut declared: BTreeMap<u32, (QualityLabel, Option<u32>, Option<u32>)> = BTreeMap::new();
    for (i, row) in units_table.rows.iter().enumerate() {
        let line = i + 2;
        let unit = parse_u32(artifact, line, "unit", cell(row, "unit").unwrap_or(""))?;
        let label = match cell(row, "quality_label") {
            Some(raw) => raw.parse::<QualityLabel>()?,
            None => QualityLabel::NotAvailable,
        };
        let peak_channel = cell(row, "peak_channel")
            .map(|raw| parse_u32(artifact, line, "peak_channel", raw))
            .transpose()?;
        let spike_count = cell(row, "spike_count")
            .map(|raw| parse_u32(artifact, line, "spike_count", raw))
            .transpose()?;

        if declared.insert(unit, (label, peak_channel, spike_count)).is_some() {
            return Err(SortError::schema(UNITS_FILE, format!("unit {} listed twice", unit)));
        }
    }

    // spike_times.tsv
    spikes_table.require("unit")?;
    let artifact = Artifact::Spikes;
    let by_sample = !spikes_table.has("spike_time");
    if by_sample {
        spikes_table.require("spike_sample").map_err(|_| {
            SortError::schema(SPIKES_FILE, "needs a spike_time or spike_sample column")
        })?;
    }
    let has_sites = spikes_table.has("spike_site");
    let has_depths = spikes_table.has("spike_depth");

    let mut spikes: BTreeMap<u32, SpikeColumns> = BTreeMap::new();
    for (i, row) in spikes_table.rows.iter().enumerate() {
        let line = i + 2;
        let unit = parse_u32(artifact, line, "unit", cell(row, "unit").unwrap_or(""))?;
        if !declared.contains_key(&unit) {
            return Err(unknown_unit(artifact, line, unit));
        }

        let time = if by_sample {
            let sample = parse_finite(artifact, line, "spike_sample", cell(row, "spike_sample").unwrap_or(""))?;
            sample / recording.spec.sampling_rate_hz
        } else {
            parse_finite(artifact, line, "spike_time", cell(row, "spike_time").unwrap_or(""))?
        };
        if time < 0.0 {
            return Err(SortError::schema(
                SPIKES_FILE,
                format!("row {}: negative spike time {}", line, time),
            ));
        }

        let entry = spikes.entry(unit).or_default();
        if entry.times.last().map_or(false, |last| time < *last) {
            return Err(SortError::schema(
                SPIKES_FILE,
                format!("row {}: spike times of unit {} are not ascending", line, unit),
            ));
        }
        entry.times.push(time);

        if has_sites {
            entry
                .sites
                .push(parse_u32(artifact, line, "spike_site", cell(row, "spike_site").unwrap_or(""))?);
        }
        if has_depths {
            entry
                .depths
                .push(parse_finite(artifact, line, "spike_depth", cell(row, "spike_depth").unwrap_or(""))?);
        }
    }

    for (unit, (_, _, count)) in &declared {
        let actual = spikes.get(unit).map_or(0, |s| s.times.len());
        if let Some(expected) = count {
            if *expected as usize != actual {
                return Err(SortError::schema(
                    SPIKES_FILE,
                    format!(
                        "unit {} declares {} spikes but {} rows were found",
                        unit, expected, actual
                    ),
                ));
            }
        }
    }

    let mut waveforms = read_waveforms(output_dir, adapter, &declared)?;
    let mut features = read_features(output_dir, adapter, &declared, &spikes)?;
    let external_metrics = match read_metric_table(output_dir, adapter)? {
        Some(metrics) => {
            if let Some(unit) = metrics.keys().find(|u| !declared.contains_key(u)) {
                return Err(SortError::schema(
                    METRICS_FILE,
                    format!("unit {} is not listed in {}", unit, UNITS_FILE),
                ));
            }
            Derived::Available(metrics)
        }
        None => Derived::unavailable(format!("{} not produced", METRICS_FILE)),
    };

    let units = declared
        .into_iter()
        .map(|(unit, (quality_label, peak_channel, _))| {
            let SpikeColumns { times, sites, depths } = spikes.remove(&unit).unwrap_or_default();

            let spike_depths = if has_depths {
                Derived::Available(depths)
            } else if has_sites {
                depths_from_probe(recording, &sites)
            } else {
                Derived::unavailable(format!("{} has no spike_site or spike_depth column", SPIKES_FILE))
            };
            let spike_sites = if has_sites {
                Derived::Available(sites)
            } else {
                Derived::unavailable(format!("{} has no spike_site column", SPIKES_FILE))
            };

            Unit {
                unit,
                quality_label,
                peak_channel,
                spike_times: times,
                spike_sites,
                spike_depths,
                peak_waveform: take_or_unavailable(&mut waveforms, unit, WAVEFORMS_FILE),
                features: take_or_unavailable(&mut features, unit, FEATURES_FILE),
            }
        })
        .collect();

    Ok(SortResult {
        identity: identity.clone(),
        duration_s: recording.spec.duration_s,
        sampling_rate_hz: recording.spec.sampling_rate_hz,
        units,
        external_metrics,
    })
}

fn take_or_unavailable<T>(table: &mut Option<BTreeMap<u32, T>>, unit: u32, file: &str) -> Derived<T> {
    match table {
        Some(values) => match values.remove(&unit) {
            Some(v) => Derived::Available(v),
            None => Derived::unavailable(format!("unit {} has no rows in {}", unit, file)),
        },
        None => Derived::unavailable(format!("{} not produced", file)),
    }
}

fn depths_from_probe(recording: &Recording, sites: &[u32]) -> Derived<Vec<f64>> {
    let mut depths = Vec::with_capacity(sites.len());
    for site in sites {
        match recording.spec.channel_depth(*site) {
            Some(depth) => depths.push(depth),
            None => return Derived::unavailable(format!("channel {} is not in the probe map", site)),
        }
    }
    Derived::Available(depths)
}

type Declared = BTreeMap<u32, (QualityLabel, Option<u32>, Option<u32>)>;

fn read_waveforms(dir: &Path, adapter: &NameAdapter, declared: &Declared) -> Result<Option<BTreeMap<u32, Vec<f64>>>> {
    let artifact = Artifact::Waveforms;
    let table = match read_table(dir, artifact, adapter)? {
        Some(t) => t,
        None => return Ok(None),
    };
    for column in ["unit", "sample_index", "amplitude_uv"] {
        table.require(column)?;
    }

    let mut samples: BTreeMap<u32, BTreeMap<u32, f64>> = BTreeMap::new();
    for (i, row) in table.rows.iter().enumerate() {
        let line = i + 2;
        let unit = parse_u32(artifact, line, "unit", cell(row, "unit").unwrap_or(""))?;
        if !declared.contains_key(&unit) {
            return Err(unknown_unit(artifact, line, unit));
        }
        let index = parse_u32(artifact, line, "sample_index", cell(row, "sample_index").unwrap_or(""))?;
        let value = parse_finite(artifact, line, "amplitude_uv", cell(row, "amplitude_uv").unwrap_or(""))?;
        if samples.entry(unit).or_default().insert(index, value).is_some() {
            return Err(SortError::schema(
                WAVEFORMS_FILE,
                format!("row {}: duplicate sample {} for unit {}", line, index, unit),
            ));
        }
    }

    let mut waveforms = BTreeMap::new();
    for (unit, by_index) in samples {
        if by_index.keys().enumerate().any(|(expected, actual)| expected as u32 != *actual) {
            return Err(SortError::schema(
                WAVEFORMS_FILE,
                format!("waveform of unit {} has gaps in sample_index", unit),
            ));
        }
        waveforms.insert(unit, by_index.into_values().collect());
    }
    Ok(Some(waveforms))
}

fn read_features(
    dir: &Path,
    adapter: &NameAdapter,
    declared: &Declared,
    spikes: &BTreeMap<u32, SpikeColumns>,
) -> Result<Option<BTreeMap<u32, Vec<Vec<f64>>>>> {
    let artifact = Artifact::Features;
    let table = match read_table(dir, artifact, adapter)? {
        Some(t) => t,
        None => return Ok(None),
    };
    table.require("unit")?;
    table.require("spike_index")?;

    let dims = table.columns.iter().filter(|c| c.starts_with('f')).count();
    if dims == 0 {
        return Err(SortError::schema(FEATURES_FILE, "no feature columns"));
    }
    let feature_columns: Vec<String> = (0..dims).map(|d| format!("f{}", d)).collect();
    if let Some(missing) = feature_columns.iter().find(|c| !table.has(c)) {
        return Err(SortError::schema(
            FEATURES_FILE,
            format!("feature columns are not contiguous, '{}' is missing", missing),
        ));
    }

    let mut rows: BTreeMap<u32, BTreeMap<u32, Vec<f64>>> = BTreeMap::new();
    for (i, row) in table.rows.iter().enumerate() {
        let line = i + 2;
        let unit = parse_u32(artifact, line, "unit", cell(row, "unit").unwrap_or(""))?;
        if !declared.contains_key(&unit) {
            return Err(unknown_unit(artifact, line, unit));
        }
        let index = parse_u32(artifact, line, "spike_index", cell(row, "spike_index").unwrap_or(""))?;
        let vector = feature_columns
            .iter()
            .map(|c| parse_finite(artifact, line, c, cell(row, c).unwrap_or("")))
            .collect::<Result<Vec<f64>>>()?;
        if rows.entry(unit).or_default().insert(index, vector).is_some() {
            return Err(SortError::schema(
                FEATURES_FILE,
                format!("row {}: duplicate spike_index {} for unit {}", line, index, unit),
            ));
        }
    }

    let mut features = BTreeMap::new();
    for (unit, by_index) in rows {
        let spike_count = spikes.get(&unit).map_or(0, |s| s.times.len());
        let contiguous = by_index.keys().enumerate().all(|(expected, actual)| expected as u32 == *actual);
        if !contiguous || by_index.len() != spike_count {
            return Err(SortError::schema(
                FEATURES_FILE,
                format!(
                    "unit {} has {} feature rows for {} spikes",
                    unit,
                    by_index.len(),
                    spike_count
                ),
            ));
        }
        features.insert(unit, by_index.into_values().collect());
    }
    Ok(Some(features))
}

/// [`parse_output`] on the blocking thread pool
///
/// Spike tables run to millions of rows; parsing them inline would stall the
/// heartbeats of every other job sharing the runtime.
pub async fn parse_output_blocking(
    identity: &JobIdentity,
    output_dir: &Path,
    recording: &Recording,
    adapter: &NameAdapter,
) -> Result<SortResult> {
    let identity = identity.clone();
    let output_dir = output_dir.to_path_buf();
    let recording = recording.clone();
    let adapter = adapter.clone();

    tokio::task::spawn_blocking(move || parse_output(&identity, &output_dir, &recording, &adapter))
        .await
        .map_err(|e| {
            SortError::Common(ephys_common::Error::Internal(format!("Output parsing task failed: {}", e)))
        })?
}

/// Read an external metric table, renaming columns to canonical metric names
pub fn read_metric_table(dir: &Path, adapter: &NameAdapter) -> Result<Option<ExternalMetrics>> {
    let artifact = Artifact::Metrics;
    let table = match read_table(dir, artifact, adapter)? {
        Some(t) => t,
        None => return Ok(None),
    };
    table.require("unit")?;

    let mut metrics = ExternalMetrics::new();
    for (i, row) in table.rows.iter().enumerate() {
        let line = i + 2;
        let unit = parse_u32(artifact, line, "unit", cell(row, "unit").unwrap_or(""))?;
        let mut values = BTreeMap::new();
        for (name, raw) in row.iter().filter(|(name, _)| name.as_str() != "unit") {
            values.insert(name.clone(), parse_metric(line, name, raw)?);
        }
        if metrics.insert(unit, values).is_some() {
            return Err(SortError::schema(METRICS_FILE, format!("unit {} listed twice", unit)));
        }
    }
    Ok(Some(metrics))
}

/// Loads SUCCEEDED jobs' outputs through the sorter's adapter
#[derive(Clone)]
pub struct ResultIngestor {
    db: SqlitePool,
    catalog: Arc<SorterCatalog>,
    adapters: Arc<AdapterRegistry>,
}

impl ResultIngestor {
    pub fn new(db: SqlitePool, catalog: Arc<SorterCatalog>, adapters: Arc<AdapterRegistry>) -> Self {
        Self { db, catalog, adapters }
    }

    /// Adapter declared by the job's sorter (built-in default when none)
    pub fn adapter_for(&self, sorter_name: &str) -> Result<&NameAdapter> {
        let tool = self.catalog.require(sorter_name)?;
        self.adapters.resolve(tool.adapter.as_deref())
    }

    /// Parse the validated output of a SUCCEEDED job
    pub async fn ingest(&self, job: &Job) -> Result<SortResult> {
        if job.state != JobState::Succeeded {
            return Err(SortError::NotSucceeded(job.identity.to_string()));
        }
        let output_dir = job
            .output_dir
            .as_ref()
            .ok_or_else(|| SortError::NotSucceeded(job.identity.to_string()))?;

        let recording = db::recordings::load_recording(&self.db, &job.recording_id)
            .await?
            .ok_or_else(|| SortError::UnresolvedDependency(format!("recording {}", job.recording_id)))?;

        let adapter = self.adapter_for(&job.sorter_name)?;
        let result = parse_output_blocking(&job.identity, output_dir, &recording, adapter).await?;

        tracing::debug!(
            identity = %job.identity,
            units = result.units.len(),
            "Ingested sort result"
        );
        Ok(result)
    }
}
