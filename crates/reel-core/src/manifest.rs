// SPDX-License-Identifier: MIT OR Apache-2.0
//! The manifest: a materialized last-write-wins view over artifact events.

use crate::event::ArtifactEvent;
use crate::{ContractError, canonical_json, sha256_hex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Provider and model recorded for one producer at plan time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProducerSelection {
    /// Provider name.
    pub provider: String,
    /// Model identifier.
    pub model: String,
}

/// The current mapping from artifact id to its latest event, plus the input
/// snapshot and producer selections the artifacts were built from.
///
/// Rewritten atomically per run; `manifest_hash` chains through
/// `previous_hash`, giving a verifiable history.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Manifest {
    /// Canonical hash of this manifest (with this field nulled while
    /// hashing). Filled in by [`Manifest::with_hash`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manifest_hash: Option<String>,
    /// Hash of the manifest this one superseded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_hash: Option<String>,
    /// Producer/model selections used for the run, keyed by alias.
    #[serde(default)]
    pub producers: BTreeMap<String, ProducerSelection>,
    /// Input snapshot sealed at plan time, keyed by canonical input id.
    #[serde(default)]
    pub inputs: BTreeMap<String, serde_json::Value>,
    /// Latest event per artifact, keyed by canonical artifact id.
    #[serde(default)]
    pub artifacts: BTreeMap<String, ArtifactEvent>,
}

impl Manifest {
    /// Apply an event, last-write-wins per artifact id.
    pub fn apply(&mut self, event: ArtifactEvent) {
        self.artifacts.insert(event.artifact_id.to_string(), event);
    }

    /// The latest event for an artifact id, if any.
    #[must_use]
    pub fn artifact(&self, id: &str) -> Option<&ArtifactEvent> {
        self.artifacts.get(id)
    }

    /// Compute the canonical hash of this manifest.
    ///
    /// `manifest_hash` is treated as `null` while hashing so the stored hash
    /// cannot be self-referential.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Json`] if the manifest cannot be serialized.
    pub fn compute_hash(&self) -> Result<String, ContractError> {
        let mut v = serde_json::to_value(self)?;
        if let serde_json::Value::Object(map) = &mut v {
            map.insert("manifest_hash".to_string(), serde_json::Value::Null);
        }
        let json = canonical_json(&v)?;
        Ok(sha256_hex(json.as_bytes()))
    }

    /// Compute and attach the canonical hash, returning the updated manifest.
    ///
    /// # Errors
    ///
    /// Returns [`ContractError::Json`] if the manifest cannot be serialized.
    pub fn with_hash(mut self) -> Result<Self, ContractError> {
        let h = self.compute_hash()?;
        self.manifest_hash = Some(h);
        Ok(self)
    }
}
