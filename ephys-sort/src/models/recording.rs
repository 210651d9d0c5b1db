//! Recording references
//!
//! A recording points at one continuous acquisition session on disk. The
//! orchestrator never reads the raw data itself; it only hands the reference
//! (path plus probe geometry) to the sorter.

use chrono::{DateTime, Utc};
use ephys_common::hash::content_digest;
use serde::{Deserialize, Serialize};

use super::RecordingId;
use crate::error::{Result, SortError};

/// One recording site on the probe
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Electrode {
    /// Channel index in the acquisition file
    pub channel: u32,
    /// Electrode index on the probe
    pub electrode: u32,
    pub x_um: f64,
    pub y_um: f64,
    #[serde(default)]
    pub shank: u32,
}

/// User-supplied description of a recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordingSpec {
    /// Human-readable name, unique within the catalog (not part of the identity)
    pub name: String,
    pub source_path: String,
    /// e.g. "SpikeGLX", "Open Ephys"
    #[serde(default)]
    pub acquisition_software: String,
    pub sampling_rate_hz: f64,
    pub channel_count: u32,
    pub duration_s: f64,
    #[serde(default)]
    pub probe: Vec<Electrode>,
}

impl RecordingSpec {
    /// Reject descriptions no sorter could run on
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(invalid("recording name must not be empty"));
        }
        if self.source_path.trim().is_empty() {
            return Err(invalid("source_path must not be empty"));
        }
        if !(self.sampling_rate_hz.is_finite() && self.sampling_rate_hz > 0.0) {
            return Err(invalid("sampling_rate_hz must be positive"));
        }
        if !(self.duration_s.is_finite() && self.duration_s > 0.0) {
            return Err(invalid("duration_s must be positive"));
        }
        if self.channel_count == 0 {
            return Err(invalid("channel_count must be positive"));
        }
        if let Some(e) = self.probe.iter().find(|e| e.channel >= self.channel_count) {
            return Err(invalid(&format!(
                "probe channel {} outside channel_count {}",
                e.channel, self.channel_count
            )));
        }
        Ok(())
    }

    /// Content identity: digest of everything except the name
    pub fn identity(&self) -> Result<RecordingId> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("name");
        }
        Ok(RecordingId(content_digest(&value)))
    }

    /// Depth (y position) of a channel, when the probe map covers it
    pub fn channel_depth(&self, channel: u32) -> Option<f64> {
        self.probe.iter().find(|e| e.channel == channel).map(|e| e.y_um)
    }
}

fn invalid(msg: &str) -> SortError {
    SortError::Common(ephys_common::Error::InvalidInput(msg.to_string()))
}

/// Registered recording
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recording {
    pub id: RecordingId,
    pub spec: RecordingSpec,
    pub created_at: DateTime<Utc>,
}

impl Recording {
    pub fn name(&self) -> &str {
        &self.spec.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(name: &str) -> RecordingSpec {
        RecordingSpec {
            name: name.to_string(),
            source_path: "/data/mouse1/session1.ap.bin".to_string(),
            acquisition_software: "SpikeGLX".to_string(),
            sampling_rate_hz: 30000.0,
            channel_count: 4,
            duration_s: 600.0,
            probe: (0..4)
                .map(|c| Electrode {
                    channel: c,
                    electrode: c,
                    x_um: 16.0,
                    y_um: 20.0 * c as f64,
                    shank: 0,
                })
                .collect(),
        }
    }

    #[test]
    fn test_identity_ignores_name() {
        assert_eq!(spec("R1").identity().unwrap(), spec("other").identity().unwrap());
    }

    #[test]
    fn test_identity_tracks_metadata() {
        let mut changed = spec("R1");
        changed.sampling_rate_hz = 25000.0;
        assert_ne!(spec("R1").identity().unwrap(), changed.identity().unwrap());
    }

    #[test]
    fn test_validate_rejects_probe_outside_channels() {
        let mut bad = spec("R1");
        bad.probe[0].channel = 9;
        assert!(bad.validate().is_err());
        assert!(spec("R1").validate().is_ok());
    }

    #[test]
    fn test_channel_depth() {
        let s = spec("R1");
        assert_eq!(s.channel_depth(2), Some(40.0));
        assert_eq!(s.channel_depth(7), None);
    }
}
