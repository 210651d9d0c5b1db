//! Configured sorter tools
//!
//! A sorter is an opaque external command. Its name and version feed the job
//! identity, so changing either produces new jobs rather than reusing results.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

use crate::error::{Result, SortError};
use crate::services::result_ingestor::{SPIKES_FILE, UNITS_FILE};

/// One external sorter as declared in `[[sorter]]` config tables
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SorterTool {
    pub name: String,
    pub version: String,
    /// Executable, resolved through PATH when not absolute
    pub program: String,
    /// Argument template; see [`SorterTool::render_args`] for placeholders
    #[serde(default)]
    pub args: Vec<String>,
    /// Files whose presence marks a complete output set
    #[serde(default = "default_expected_outputs")]
    pub expected_outputs: Vec<String>,
    /// Option keys every parameter set for this sorter must carry
    #[serde(default)]
    pub required_options: Vec<String>,
    /// Column adapter, `name` or `name@version`; built-in default when absent
    #[serde(default)]
    pub adapter: Option<String>,
    /// Wall-clock limit; falls back to the pipeline default
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    /// Extra environment for the child process
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

fn default_expected_outputs() -> Vec<String> {
    vec![UNITS_FILE.to_string(), SPIKES_FILE.to_string()]
}

/// Paths substituted into the argument template
pub struct InvocationPaths<'a> {
    pub input_dir: &'a Path,
    pub output_dir: &'a Path,
    pub scratch_dir: &'a Path,
    pub params_file: &'a Path,
    pub recording_file: &'a Path,
}

impl SorterTool {
    /// Expand `{input_dir}`, `{output_dir}`, `{scratch_dir}`, `{params_file}`
    /// and `{recording_file}` in every argument
    pub fn render_args(&self, paths: &InvocationPaths<'_>) -> Vec<String> {
        let substitutions = [
            ("{input_dir}", paths.input_dir),
            ("{output_dir}", paths.output_dir),
            ("{scratch_dir}", paths.scratch_dir),
            ("{params_file}", paths.params_file),
            ("{recording_file}", paths.recording_file),
        ];

        self.args
            .iter()
            .map(|arg| {
                substitutions
                    .iter()
                    .fold(arg.clone(), |acc, (key, path)| acc.replace(key, &path.to_string_lossy()))
            })
            .collect()
    }

    /// Method label used in working directory names ("kilosort2.5" → "kilosort2-5")
    pub fn method_label(&self) -> String {
        self.name.replace('.', "-")
    }

    fn validate(&self) -> Result<()> {
        let problem = if self.name.trim().is_empty() {
            Some("sorter name must not be empty".to_string())
        } else if self.version.trim().is_empty() {
            Some(format!("sorter '{}' has an empty version", self.name))
        } else if self.program.trim().is_empty() {
            Some(format!("sorter '{}' has an empty program", self.name))
        } else {
            [UNITS_FILE, SPIKES_FILE]
                .iter()
                .find(|required| !self.expected_outputs.iter().any(|o| o == *required))
                .map(|missing| format!("sorter '{}' must expect {}", self.name, missing))
        };

        match problem {
            Some(msg) => Err(SortError::Common(ephys_common::Error::Config(msg))),
            None => Ok(()),
        }
    }
}

/// Known sorters by name
#[derive(Debug, Clone, Default)]
pub struct SorterCatalog {
    tools: BTreeMap<String, SorterTool>,
}

impl SorterCatalog {
    pub fn new(tools: Vec<SorterTool>) -> Result<Self> {
        let mut catalog = BTreeMap::new();
        for tool in tools {
            tool.validate()?;
            if catalog.contains_key(&tool.name) {
                return Err(SortError::Common(ephys_common::Error::Config(format!(
                    "sorter '{}' declared twice",
                    tool.name
                ))));
            }
            catalog.insert(tool.name.clone(), tool);
        }
        Ok(Self { tools: catalog })
    }

    pub fn get(&self, name: &str) -> Option<&SorterTool> {
        self.tools.get(name)
    }

    /// Look up a sorter, failing with `UnresolvedDependency`
    pub fn require(&self, name: &str) -> Result<&SorterTool> {
        self.get(name)
            .ok_or_else(|| SortError::UnresolvedDependency(format!("sorter '{}' is not configured", name)))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
