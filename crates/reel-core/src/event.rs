// SPDX-License-Identifier: MIT OR Apache-2.0
//! Append-only event records and blob references.

use crate::id::CanonicalId;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A content-addressed reference to immutable blob bytes.
///
/// The bytes themselves live in the artifact store at
/// `blobs/<hash[0:2]>/<hash>.<ext>`; the ref is addressing metadata only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BlobRef {
    /// Hex-encoded SHA-256 of the blob bytes.
    pub hash: String,
    /// Size of the blob in bytes.
    pub size: u64,
    /// MIME type recorded at write time.
    pub mime_type: String,
}

/// Terminal status of an artifact (and of the job that produced it).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// The artifact was produced successfully.
    Succeeded,
    /// Production failed; see `reason`/`diagnostics` on the event.
    Failed,
    /// The producing job's conditions were unmet; nothing was produced.
    Skipped,
}

/// One record in the append-only artifact stream.
///
/// The manifest is a materialized view over these events with
/// last-write-wins per artifact id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactEvent {
    /// The artifact this event supersedes or creates.
    pub artifact_id: CanonicalId,
    /// Revision token of the plan instance that produced the event.
    pub revision: Uuid,
    /// Inputs hash of the producing job, for incremental rebuilds.
    pub inputs_hash: String,
    /// Terminal status.
    pub status: ArtifactStatus,
    /// Job id string of the producer, or `"user_override"` for synthetic
    /// replacement events injected by a leaf override.
    pub produced_by: String,
    /// Timestamp the event was recorded.
    pub created_at: DateTime<Utc>,
    /// Blob reference for succeeded artifacts with persisted bytes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blob: Option<BlobRef>,
    /// Machine-parseable failure/skip reason (`missing_output`, `cancelled`,
    /// `upstream_failed`, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Free-form diagnostics from the handler.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub diagnostics: Option<String>,
}

/// Origin of the job id recorded for override events.
pub const USER_OVERRIDE: &str = "user_override";

/// One record in the append-only input stream: a user input as resolved at
/// plan time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InputEvent {
    /// Canonical input id.
    pub input_id: CanonicalId,
    /// Revision token of the plan that sealed this value.
    pub revision: Uuid,
    /// The resolved value.
    pub value: serde_json::Value,
    /// Timestamp the event was recorded.
    pub recorded_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn artifact_event_serde_round_trip() {
        let ev = ArtifactEvent {
            artifact_id: "Artifact:Doc.Title".parse().unwrap(),
            revision: Uuid::nil(),
            inputs_hash: "abc".into(),
            status: ArtifactStatus::Succeeded,
            produced_by: "Producer:Doc".into(),
            created_at: Utc::now(),
            blob: Some(BlobRef {
                hash: "deadbeef".into(),
                size: 4,
                mime_type: "text/plain".into(),
            }),
            reason: None,
            diagnostics: None,
        };
        let json = serde_json::to_string(&ev).unwrap();
        assert!(!json.contains("reason"), "empty optionals omitted: {json}");
        let back: ArtifactEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }
}
