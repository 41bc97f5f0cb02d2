// SPDX-License-Identifier: MIT OR Apache-2.0
//! Shared fixtures for the end-to-end suites.

use async_trait::async_trait;
use reel_core::{
    BlueprintKind, BlueprintMeta, BlueprintTree, CancellationToken, Connection, DimCount,
    Dimension, InputDecl, InputType, ProduceRequest, ProduceResult, ProduceStatus,
    ProducedArtifact, ProducedBlob, ProducerDecl,
};
use reel_provider::{ProducerHandler, ProviderError};
use serde_json::Value;
use std::collections::BTreeMap;

pub fn blueprint(
    inputs: Vec<InputDecl>,
    producers: Vec<ProducerDecl>,
    connections: Vec<Connection>,
) -> BlueprintTree {
    BlueprintTree {
        meta: BlueprintMeta {
            id: "bp-e2e".into(),
            name: "e2e".into(),
            kind: BlueprintKind::Blueprint,
        },
        inputs,
        producers,
        connections,
    }
}

pub fn input_decl(name: &str, input_type: InputType) -> InputDecl {
    InputDecl {
        name: name.into(),
        input_type,
        item_type: None,
        required: true,
        values: vec![],
        annotations: None,
    }
}

pub fn producer(alias: &str, schema: Value) -> ProducerDecl {
    ProducerDecl {
        alias: alias.into(),
        producer_ref: format!("catalog/{alias}"),
        provider: "mock".into(),
        model: "stub-1".into(),
        output_schema: schema,
        input_schema: None,
        dimensions: vec![],
        condition: None,
        sdk_mapping: None,
    }
}

pub fn dim(name: &str, count: usize) -> Dimension {
    Dimension {
        name: name.into(),
        count: DimCount::Literal(count),
    }
}

pub fn conn(consumer: &str, source: &str, looped: bool) -> Connection {
    Connection {
        consumer: consumer.into(),
        source: source.into(),
        looped,
    }
}

pub fn scalar_out(field: &str) -> Value {
    serde_json::json!({"type": "object", "properties": {field: {"type": "string"}}})
}

/// A handler that answers with pre-scripted JSON values per artifact id,
/// falling back to deterministic stubs.
pub struct ScriptedHandler {
    provider: String,
    outputs: BTreeMap<String, Value>,
}

impl ScriptedHandler {
    pub fn new(provider: impl Into<String>, outputs: BTreeMap<String, Value>) -> Self {
        Self {
            provider: provider.into(),
            outputs,
        }
    }
}

#[async_trait]
impl ProducerHandler for ScriptedHandler {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn invoke(
        &self,
        request: ProduceRequest,
        _cancel: CancellationToken,
    ) -> Result<ProduceResult, ProviderError> {
        let artifacts = request
            .produces
            .iter()
            .map(|id| {
                let value = self
                    .outputs
                    .get(&id.to_string())
                    .cloned()
                    .unwrap_or_else(|| Value::String(format!("scripted stub for {id}")));
                ProducedArtifact {
                    artifact_id: id.clone(),
                    status: ProduceStatus::Succeeded,
                    blob: Some(ProducedBlob {
                        data: serde_json::to_vec(&value).expect("scripted values serialize"),
                        mime_type: "application/json".into(),
                    }),
                    diagnostics: None,
                }
            })
            .collect();
        Ok(ProduceResult::succeeded(artifacts))
    }
}
