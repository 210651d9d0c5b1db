//! Test helper utilities
//!
//! Builds a pipeline over a temp root folder whose sorters are a small `sh`
//! script. The script appends one line to a counter file per invocation, so
//! tests can assert how often the "tool" actually ran.

#![allow(dead_code)]

use ephys_sort::config::SortConfig;
use ephys_sort::models::{Electrode, Options, RecordingSpec};
use ephys_sort::services::SorterTool;
use ephys_sort::Pipeline;
use serde_json::json;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Fake sorter
///
/// args: <output_dir> <counter_file> <unit_count> <mode>
/// modes: ok, hang, crash, bad_schema, no_output, fail_after_output
const FAKE_SORTER: &str = r#"#!/bin/sh
out="$1"
counter="$2"
units="$3"
mode="$4"
echo run >> "$counter"
echo "fake sorter: mode=$mode units=$units cwd=$(pwd)"

case "$mode" in
  hang)
    exec sleep 30
    ;;
  crash)
    echo "fatal: out of GPU memory" >&2
    exit 3
    ;;
  no_output)
    exit 0
    ;;
esac

if [ "$mode" = "bad_schema" ]; then
  printf 'unit_id\tKSLabel\tmystery_column\n' > "$out/units.tsv"
else
  printf 'unit_id\tKSLabel\tn_spikes\n' > "$out/units.tsv"
fi
printf 'unit_id\tspike_time\n' > "$out/spike_times.tsv"

u=0
while [ "$u" -lt "$units" ]; do
  printf '%d\tgood\t10\n' "$u" >> "$out/units.tsv"
  k=0
  while [ "$k" -lt 10 ]; do
    printf '%d\t%d.%02d\n' "$u" "$k" "$u" >> "$out/spike_times.tsv"
    k=$((k + 1))
  done
  u=$((u + 1))
done
if [ "$mode" = "fail_after_output" ]; then
  echo "fatal: post-processing failed" >&2
  exit 2
fi
echo "fake sorter: done"
"#;

pub struct TestEnv {
    pub dir: TempDir,
    pub pipeline: Pipeline,
    pub counter: PathBuf,
    pub script: PathBuf,
    pub config: SortConfig,
}

impl TestEnv {
    /// Pipeline with one sorter per `(name, mode, units)` entry
    pub async fn new(sorters: &[(&str, &str, u32)]) -> Self {
        Self::with_config(sorters, |_| {}).await
    }

    pub async fn with_config(sorters: &[(&str, &str, u32)], customize: impl FnOnce(&mut SortConfig)) -> Self {
        let dir = TempDir::new().unwrap();
        let script = dir.path().join("fake_sorter.sh");
        std::fs::write(&script, FAKE_SORTER).unwrap();
        let counter = dir.path().join("invocations.txt");

        let mut config = SortConfig::default();
        config.pipeline.heartbeat_interval_ms = 50;
        config.pipeline.io_retry_initial_ms = 1;
        config.sorter = sorters
            .iter()
            .map(|(name, mode, units)| fake_tool(&script, &counter, name, mode, *units))
            .collect();
        customize(&mut config);

        let root = dir.path().join("root");
        let pipeline = Pipeline::open(&root, &config).await.unwrap();

        Self {
            dir,
            pipeline,
            counter,
            script,
            config,
        }
    }

    pub fn root(&self) -> PathBuf {
        self.dir.path().join("root")
    }

    /// A second orchestrator sharing the same database and work root
    pub async fn second_pipeline(&self) -> Pipeline {
        Pipeline::open(&self.root(), &self.config).await.unwrap()
    }

    /// Number of times any fake sorter was started
    pub fn invocations(&self) -> usize {
        std::fs::read_to_string(&self.counter)
            .map(|c| c.lines().count())
            .unwrap_or(0)
    }
}

pub fn fake_tool(script: &Path, counter: &Path, name: &str, mode: &str, units: u32) -> SorterTool {
    SorterTool {
        name: name.to_string(),
        version: "1.0.0".to_string(),
        program: "sh".to_string(),
        args: vec![
            script.to_string_lossy().into_owned(),
            "{output_dir}".to_string(),
            counter.to_string_lossy().into_owned(),
            units.to_string(),
            mode.to_string(),
        ],
        expected_outputs: vec!["units.tsv".to_string(), "spike_times.tsv".to_string()],
        required_options: vec![],
        adapter: None,
        timeout_secs: None,
        env: BTreeMap::new(),
    }
}

/// 60 s, 30 kHz, four-channel linear probe
pub fn recording_spec(name: &str) -> RecordingSpec {
    RecordingSpec {
        name: name.to_string(),
        source_path: format!("/data/{}/continuous.dat", name),
        acquisition_software: "SpikeGLX".to_string(),
        sampling_rate_hz: 30000.0,
        channel_count: 4,
        duration_s: 60.0,
        probe: (0..4)
            .map(|ch| Electrode {
                channel: ch,
                electrode: ch,
                x_um: 0.0,
                y_um: 20.0 * ch as f64,
                shank: 0,
            })
            .collect(),
    }
}

pub fn threshold_options(threshold: i64) -> Options {
    let mut options = Options::new();
    options.insert("threshold".to_string(), json!(threshold));
    options
}
