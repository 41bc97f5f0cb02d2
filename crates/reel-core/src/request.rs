// SPDX-License-Identifier: MIT OR Apache-2.0
//! The uniform boundary between the executor and provider handlers.

use crate::blueprint::SdkMapping;
use crate::id::CanonicalId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Context shipped with a [`ProduceRequest`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct RequestContext {
    /// Input alias → resolved JSON value. Fan-in inputs arrive as ordered
    /// arrays; binary inputs as `{"$blob": ...}` references.
    #[serde(default)]
    pub resolved_inputs: BTreeMap<String, serde_json::Value>,
    /// Input alias → canonical id, element access included.
    #[serde(default)]
    pub input_bindings: BTreeMap<String, CanonicalId>,
    /// Declarative payload shaping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_mapping: Option<SdkMapping>,
    /// Declared input schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    /// Declared output schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_schema: Option<serde_json::Value>,
    /// Free-form extras (prompt overrides, cost hints).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, serde_json::Value>,
}

/// One produce invocation handed to a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProduceRequest {
    /// Job id being executed.
    pub job_id: CanonicalId,
    /// Provider the handler represents.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Revision token of the plan instance.
    pub revision: Uuid,
    /// Layer the job sits in.
    pub layer: usize,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Canonical ids of every input.
    pub inputs: Vec<CanonicalId>,
    /// Canonical ids of every expected output.
    pub produces: Vec<CanonicalId>,
    /// Execution context.
    pub context: RequestContext,
}

/// Handler-side status of a produce call or one of its artifacts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProduceStatus {
    /// The call (or artifact) succeeded.
    Succeeded,
    /// The call (or artifact) failed.
    Failed,
}

/// Bytes returned by a handler for one artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ProducedBlob {
    /// The artifact bytes.
    pub data: Vec<u8>,
    /// MIME type of the bytes.
    pub mime_type: String,
}

/// One artifact returned from a handler.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProducedArtifact {
    /// Artifact id, matching an entry of the request's `produces`.
    pub artifact_id: CanonicalId,
    /// Per-artifact status.
    pub status: ProduceStatus,
    /// The produced bytes, for succeeded artifacts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<ProducedBlob>,
    /// Free-form diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

/// The result of a produce invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProduceResult {
    /// Overall status.
    pub status: ProduceStatus,
    /// Artifacts, one per produced id. A missing expected artifact is
    /// recorded by the executor as failed with reason `missing_output`.
    pub artifacts: Vec<ProducedArtifact>,
    /// Free-form diagnostics.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

impl ProduceResult {
    /// A fully-succeeded result over the given artifacts.
    #[must_use]
    pub fn succeeded(artifacts: Vec<ProducedArtifact>) -> Self {
        Self {
            status: ProduceStatus::Succeeded,
            artifacts,
            diagnostics: None,
        }
    }

    /// Find the entry for an artifact id.
    #[must_use]
    pub fn artifact(&self, id: &CanonicalId) -> Option<&ProducedArtifact> {
        self.artifacts.iter().find(|a| &a.artifact_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_lookup_by_id() {
        let id: CanonicalId = "Artifact:Doc.Title".parse().unwrap();
        let result = ProduceResult::succeeded(vec![ProducedArtifact {
            artifact_id: id.clone(),
            status: ProduceStatus::Succeeded,
            blob: Some(ProducedBlob {
                data: b"A title".to_vec(),
                mime_type: "text/plain".into(),
            }),
            diagnostics: None,
        }]);
        assert!(result.artifact(&id).is_some());
        assert!(result.artifact(&"Artifact:Doc.Body".parse().unwrap()).is_none());
    }
}
