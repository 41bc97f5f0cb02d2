// SPDX-License-Identifier: MIT OR Apache-2.0
//! Deterministic stub handlers for simulated mode.
//!
//! The simulated handler satisfies the declared output schema without
//! calling any external service: scalar leaves get schema defaults (or
//! deterministic text), media leaves get minimal valid PNG/WAV payloads
//! sized from declared durations. The executor treats simulated and live
//! handlers identically.

use crate::{ProducerHandler, ProviderError, leaf_schema};
use async_trait::async_trait;
use reel_core::{
    CancellationToken, CanonicalId, ProduceRequest, ProduceResult, ProduceStatus,
    ProducedArtifact, ProducedBlob,
};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

/// A handler that synthesizes deterministic stub artifacts.
#[derive(Debug, Clone)]
pub struct SimulatedHandler {
    provider: String,
}

impl SimulatedHandler {
    /// A simulated handler answering for the given provider name.
    #[must_use]
    pub fn new(provider: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
        }
    }
}

#[async_trait]
impl ProducerHandler for SimulatedHandler {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn invoke(
        &self,
        request: ProduceRequest,
        cancel: CancellationToken,
    ) -> Result<ProduceResult, ProviderError> {
        if cancel.is_cancelled() {
            return Err(ProviderError::cancelled());
        }
        // Shape the payload exactly like a live handler would, so simulated
        // runs surface the same user-input errors (bad enums, out-of-bounds
        // element access, missing required fields).
        if let Some(mapping) = &request.context.sdk_mapping {
            let _payload = crate::shape::shape_payload(
                &request.context.resolved_inputs,
                mapping,
                request.context.input_schema.as_ref(),
            )?;
        }
        let output_schema = request.context.output_schema.clone().unwrap_or(Value::Null);
        let mut artifacts = Vec::with_capacity(request.produces.len());
        for produce in &request.produces {
            let leaf = leaf_schema(&output_schema, produce);
            let (data, mime_type) = synthesize(&leaf, produce, &request);
            artifacts.push(ProducedArtifact {
                artifact_id: produce.clone(),
                status: ProduceStatus::Succeeded,
                blob: Some(ProducedBlob { data, mime_type }),
                diagnostics: None,
            });
        }
        debug!(
            target: "reel.provider",
            job = %request.job_id,
            artifacts = artifacts.len(),
            "simulated produce"
        );
        Ok(ProduceResult::succeeded(artifacts))
    }
}

/// Synthesize deterministic bytes satisfying a leaf schema.
fn synthesize(schema: &Value, id: &CanonicalId, request: &ProduceRequest) -> (Vec<u8>, String) {
    let mime = schema
        .get("contentMediaType")
        .and_then(Value::as_str)
        .unwrap_or("");
    if mime.starts_with("image/") {
        return (png_stub(id), "image/png".to_string());
    }
    if mime.starts_with("audio/") {
        let duration = duration_hint(schema, request);
        return (wav_stub(id, duration), "audio/wav".to_string());
    }
    if mime.starts_with("video/") {
        // Minimal MP4 `ftyp` box plus deterministic filler.
        let mut data = vec![0, 0, 0, 20];
        data.extend_from_slice(b"ftypisom");
        data.extend_from_slice(&seed(id)[..8]);
        return (data, "video/mp4".to_string());
    }

    let value = synthesize_json(schema, id);
    (
        serde_json::to_vec(&value).unwrap_or_default(),
        "application/json".to_string(),
    )
}

fn synthesize_json(schema: &Value, id: &CanonicalId) -> Value {
    if let Some(default) = schema.get("default") {
        return default.clone();
    }
    if let Some(first) = schema
        .get("enum")
        .and_then(Value::as_array)
        .and_then(|a| a.first())
    {
        return first.clone();
    }
    match schema.get("type").and_then(Value::as_str).unwrap_or("string") {
        "integer" => Value::from(0),
        "number" => Value::from(0.0),
        "boolean" => Value::Bool(false),
        "object" => {
            let mut obj = serde_json::Map::new();
            if let Some(props) = schema.get("properties").and_then(Value::as_object) {
                for (name, sub) in props {
                    obj.insert(name.clone(), synthesize_json(sub, id));
                }
            }
            Value::Object(obj)
        }
        _ => Value::String(format!("stub for {id}")),
    }
}

fn duration_hint(schema: &Value, request: &ProduceRequest) -> f64 {
    if let Some(d) = schema.get("x-duration-seconds").and_then(Value::as_f64) {
        return d.clamp(0.1, 10.0);
    }
    for key in ["Duration", "DurationSeconds"] {
        if let Some(d) = request
            .context
            .resolved_inputs
            .get(key)
            .and_then(Value::as_f64)
        {
            return d.clamp(0.1, 10.0);
        }
    }
    1.0
}

fn seed(id: &CanonicalId) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string().as_bytes());
    hasher.finalize().into()
}

/// A syntactically valid PNG header followed by deterministic filler.
fn png_stub(id: &CanonicalId) -> Vec<u8> {
    let mut data = vec![0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];
    data.extend_from_slice(&seed(id));
    data
}

/// A valid 8 kHz mono 16-bit PCM WAV of the given duration, zero samples.
fn wav_stub(id: &CanonicalId, duration_secs: f64) -> Vec<u8> {
    const SAMPLE_RATE: u32 = 8000;
    let data_len = ((duration_secs * f64::from(SAMPLE_RATE)) as u32) * 2;
    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&1u16.to_le_bytes()); // mono
    out.extend_from_slice(&SAMPLE_RATE.to_le_bytes());
    out.extend_from_slice(&(SAMPLE_RATE * 2).to_le_bytes());
    out.extend_from_slice(&2u16.to_le_bytes());
    out.extend_from_slice(&16u16.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    let pattern = seed(id);
    out.extend((0..data_len as usize).map(|i| pattern[i % 32] & 0x0F));
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    fn request(produces: Vec<&str>, output_schema: Value) -> ProduceRequest {
        ProduceRequest {
            job_id: "Producer:Doc".parse().unwrap(),
            provider: "mock".into(),
            model: "stub-1".into(),
            revision: Uuid::nil(),
            layer: 0,
            attempt: 1,
            inputs: vec![],
            produces: produces.iter().map(|p| p.parse().unwrap()).collect(),
            context: reel_core::RequestContext {
                resolved_inputs: BTreeMap::new(),
                input_bindings: BTreeMap::new(),
                sdk_mapping: None,
                input_schema: None,
                output_schema: Some(output_schema),
                extras: BTreeMap::new(),
            },
        }
    }

    #[tokio::test]
    async fn produces_every_expected_artifact() {
        let schema = json!({
            "type": "object",
            "properties": {
                "Title": {"type": "string"},
                "Image": {"type": "string", "contentMediaType": "image/png"}
            }
        });
        let handler = SimulatedHandler::new("mock");
        let result = handler
            .invoke(
                request(vec!["Artifact:Doc.Title", "Artifact:Doc.Image"], schema),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(result.status, ProduceStatus::Succeeded);
        assert_eq!(result.artifacts.len(), 2);

        let title = result
            .artifact(&"Artifact:Doc.Title".parse().unwrap())
            .unwrap();
        assert_eq!(title.blob.as_ref().unwrap().mime_type, "application/json");

        let image = result
            .artifact(&"Artifact:Doc.Image".parse().unwrap())
            .unwrap();
        let blob = image.blob.as_ref().unwrap();
        assert_eq!(blob.mime_type, "image/png");
        assert_eq!(&blob.data[..4], &[0x89, b'P', b'N', b'G']);
    }

    #[tokio::test]
    async fn output_is_deterministic() {
        let schema = json!({
            "type": "object",
            "properties": {"Title": {"type": "string"}}
        });
        let handler = SimulatedHandler::new("mock");
        let a = handler
            .invoke(
                request(vec!["Artifact:Doc.Title"], schema.clone()),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let b = handler
            .invoke(
                request(vec!["Artifact:Doc.Title"], schema),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(a.artifacts[0].blob, b.artifacts[0].blob);
    }

    #[tokio::test]
    async fn wav_stub_length_follows_duration() {
        let schema = json!({
            "type": "object",
            "properties": {
                "Audio": {
                    "type": "string",
                    "contentMediaType": "audio/wav",
                    "x-duration-seconds": 2.0
                }
            }
        });
        let handler = SimulatedHandler::new("mock");
        let result = handler
            .invoke(
                request(vec!["Artifact:Doc.Audio"], schema),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let blob = result.artifacts[0].blob.as_ref().unwrap();
        assert_eq!(&blob.data[..4], b"RIFF");
        // 44-byte header + 2 s * 8000 Hz * 2 bytes.
        assert_eq!(blob.data.len(), 44 + 32000);
    }

    #[tokio::test]
    async fn enum_leaves_use_the_first_member() {
        let schema = json!({
            "type": "object",
            "properties": {
                "Kind": {"type": "string", "enum": ["ImageNarration", "TalkingHead"]}
            }
        });
        let handler = SimulatedHandler::new("mock");
        let result = handler
            .invoke(
                request(vec!["Artifact:Doc.Kind"], schema),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let blob = result.artifacts[0].blob.as_ref().unwrap();
        let value: Value = serde_json::from_slice(&blob.data).unwrap();
        assert_eq!(value, json!("ImageNarration"));
    }

    #[tokio::test]
    async fn nested_array_leaves_resolve_their_item_schema() {
        let schema = json!({
            "type": "object",
            "properties": {
                "Segments": {
                    "type": "array",
                    "maxItems": 2,
                    "items": {
                        "type": "object",
                        "properties": {
                            "Prompt": {"type": "string", "default": "a hill"}
                        }
                    }
                }
            }
        });
        let handler = SimulatedHandler::new("mock");
        let result = handler
            .invoke(
                request(vec!["Artifact:Doc.Segments[1].Prompt"], schema),
                CancellationToken::new(),
            )
            .await
            .unwrap();
        let blob = result.artifacts[0].blob.as_ref().unwrap();
        let value: Value = serde_json::from_slice(&blob.data).unwrap();
        assert_eq!(value, json!("a hill"));
    }
}
