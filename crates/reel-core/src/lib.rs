// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The validated blueprint tree and SDK-mapping contract.
pub mod blueprint;
/// Cancellation primitives shared by the executor and handlers.
pub mod cancel;
/// Boolean predicates gating producers and inputs.
pub mod condition;
/// Append-only event records and blob references.
pub mod event;
/// Canonical identifier grammar.
pub mod id;
/// Manifests: last-write-wins views over artifact events.
pub mod manifest;
/// Jobs and sealed plans.
pub mod plan;
/// The executor ↔ handler request/result contract.
pub mod request;
/// Tagged artifact values and lazy fan-in sequences.
pub mod value;

pub use blueprint::{
    AnnotationKind, BlueprintKind, BlueprintMeta, BlueprintTree, Connection, DimCount, Dimension,
    FieldMapping, InputDecl, InputType, MappingGate, ProducerDecl, PromptOverride, SdkMapping,
    SystemAnnotations, Transform,
};
pub use cancel::{CancellationReason, CancellationToken};
pub use condition::{ConditionExpr, ConditionOp};
pub use event::{ArtifactEvent, ArtifactStatus, BlobRef, InputEvent, USER_OVERRIDE};
pub use id::{CanonicalId, IdError, IdKind, Index, Segment, parse_dotted_path};
pub use manifest::{Manifest, ProducerSelection};
pub use plan::{FanIn, FanInMember, Job, JobContext, PLAN_FORMAT_VERSION, Plan, SchemaRefs};
pub use request::{
    ProduceRequest, ProduceResult, ProduceStatus, ProducedArtifact, ProducedBlob, RequestContext,
};
pub use value::{ArtifactValue, BlobSource, FanInItem, FanInSequence};

use serde::Serialize;
use sha2::{Digest, Sha256};

/// Errors from contract-level operations (serialization, hashing).
#[derive(Debug, thiserror::Error)]
pub enum ContractError {
    /// JSON serialization or deserialization failed.
    #[error("failed to serialize JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<ContractError> for reel_error::ForgeError {
    fn from(err: ContractError) -> Self {
        reel_error::ForgeError::new(reel_error::ErrorCode::Internal, err.to_string())
    }
}

/// Produce a deterministic JSON string for hashing.
///
/// Not a full JCS implementation, but stable for our types: keys are sorted
/// (every map in the contract is a `BTreeMap`) and numbers are serialized
/// consistently by `serde_json`.
///
/// # Errors
///
/// Returns [`ContractError::Json`] if the value cannot be serialized.
pub fn canonical_json<T: Serialize>(value: &T) -> Result<String, ContractError> {
    let v = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&v)?)
}

/// Compute the hex-encoded SHA-256 digest of `bytes`.
#[must_use]
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sha256_hex_matches_known_vector() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn canonical_json_is_stable_across_key_insertion_order() {
        use std::collections::BTreeMap;
        let mut a = BTreeMap::new();
        a.insert("z", 1);
        a.insert("a", 2);
        let mut b = BTreeMap::new();
        b.insert("a", 2);
        b.insert("z", 1);
        assert_eq!(canonical_json(&a).unwrap(), canonical_json(&b).unwrap());
    }
}
