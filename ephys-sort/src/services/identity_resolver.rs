//! Job identity resolution
//!
//! identity = sha256(canonical {"recording", "parameters", "tool": {"name", "version"}})

use ephys_common::hash::content_digest;
use serde_json::json;

use crate::error::Result;
use crate::models::{Fingerprint, JobIdentity, ParameterSet, ParameterSetId, Recording, RecordingId};
use crate::services::parameter_registry::ParameterRegistry;
use crate::services::recording_catalog::RecordingCatalog;

/// Pure identity function
pub fn compute_identity(
    recording: &RecordingId,
    parameters: &Fingerprint,
    tool_name: &str,
    tool_version: &str,
) -> JobIdentity {
    let value = json!({
        "recording": recording.as_str(),
        "parameters": parameters.as_str(),
        "tool": {
            "name": tool_name,
            "version": tool_version,
        },
    });
    JobIdentity(content_digest(&value))
}

/// An identity together with the rows it was derived from
#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub identity: JobIdentity,
    pub recording: Recording,
    pub paramset: ParameterSet,
    pub tool_name: String,
    pub tool_version: String,
}

#[derive(Clone)]
pub struct IdentityResolver {
    recordings: RecordingCatalog,
    parameters: ParameterRegistry,
}

impl IdentityResolver {
    pub fn new(recordings: RecordingCatalog, parameters: ParameterRegistry) -> Self {
        Self { recordings, parameters }
    }

    /// Fails with `UnresolvedDependency` when either input is unknown
    pub async fn resolve(
        &self,
        recording_id: &RecordingId,
        paramset_id: ParameterSetId,
        tool_version: &str,
    ) -> Result<ResolvedIdentity> {
        let recording = self.recordings.get(recording_id).await?;
        let paramset = self.parameters.get(paramset_id).await?;
        let identity = compute_identity(&recording.id, &paramset.fingerprint, &paramset.sorter_name, tool_version);

        Ok(ResolvedIdentity {
            identity,
            tool_name: paramset.sorter_name.clone(),
            tool_version: tool_version.to_string(),
            recording,
            paramset,
        })
    }
}
