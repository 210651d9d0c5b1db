//! Named sorter parameter sets

use chrono::{DateTime, Utc};
use ephys_common::hash::content_digest;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

use super::{Fingerprint, ParameterSetId};

/// Sorter options: option name → JSON value
pub type Options = BTreeMap<String, Value>;

/// A registered, immutable parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub id: ParameterSetId,
    pub name: String,
    pub sorter_name: String,
    /// Free text, not part of the fingerprint
    pub description: String,
    pub options: Options,
    pub fingerprint: Fingerprint,
    pub created_at: DateTime<Utc>,
}

/// Fingerprint of (sorter, options), independent of option insertion order
pub fn fingerprint(sorter_name: &str, options: &Options) -> Fingerprint {
    let value = serde_json::json!({
        "sorter": sorter_name,
        "options": options,
    });
    Fingerprint(content_digest(&value))
}
