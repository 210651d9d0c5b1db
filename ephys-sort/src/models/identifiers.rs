//! Identifier newtypes
//!
//! Content-addressed identifiers are 64-char lowercase SHA-256 hex digests.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Content digest of a recording's acquisition metadata
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordingId(pub String);

/// Database id of a registered parameter set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParameterSetId(pub i64);

/// Content digest of (sorter name, options)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(pub String);

/// Content digest of (recording, parameter fingerprint, tool name + version)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobIdentity(pub String);

impl JobIdentity {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Prefix used for working directory names
    pub fn short(&self) -> &str {
        let end = self.0.len().min(16);
        &self.0[..end]
    }
}

impl RecordingId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! display_inner {
    ($($ty:ty),*) => {
        $(impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(&self.0, f)
            }
        })*
    };
}

display_inner!(RecordingId, ParameterSetId, Fingerprint, JobIdentity);

impl From<&str> for JobIdentity {
    fn from(s: &str) -> Self {
        JobIdentity(s.to_string())
    }
}
