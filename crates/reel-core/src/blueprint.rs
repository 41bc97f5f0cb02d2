// SPDX-License-Identifier: MIT OR Apache-2.0
//! The validated blueprint tree handed to the core by the front-end parsers.
//!
//! This is intentionally declarative: aliases, schema values, and connection
//! strings. The graph builder resolves it into a checked [`ProducerGraph`]
//! (see `reel-graph`); nothing here is assumed consistent yet.

use crate::condition::ConditionExpr;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// What kind of document a blueprint file declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BlueprintKind {
    /// A full movie blueprint.
    Blueprint,
    /// A single reusable producer spec.
    Producer,
}

/// Identity metadata for a blueprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BlueprintMeta {
    /// Stable blueprint identifier.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Document kind.
    pub kind: BlueprintKind,
}

/// Declared type of a blueprint input.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    /// Short string.
    String,
    /// Long-form text.
    Text,
    /// Integer.
    Int,
    /// Floating-point number.
    Number,
    /// Boolean flag.
    Boolean,
    /// Array; element type in `item_type`.
    Array,
    /// Image reference.
    Image,
    /// Video reference.
    Video,
    /// Audio reference.
    Audio,
    /// Arbitrary JSON.
    Json,
    /// Enumerated string.
    Enum,
}

/// Who supplies an input and where it came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum AnnotationKind {
    /// Supplied by the user through the form UI.
    User,
    /// Derived from other inputs.
    Derived,
    /// Injected by the runtime.
    Runtime,
}

/// Optional system annotations attached to an input declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct SystemAnnotations {
    /// Provenance kind.
    pub kind: AnnotationKind,
    /// Whether the user explicitly supplied a value.
    pub user_supplied: bool,
    /// Source expression for derived inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
}

/// One declared blueprint input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InputDecl {
    /// Input name, unique within the blueprint.
    pub name: String,
    /// Declared type.
    pub input_type: InputType,
    /// Element type for arrays.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub item_type: Option<InputType>,
    /// Whether the input must be present at plan time.
    #[serde(default)]
    pub required: bool,
    /// Allowed values for enum inputs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub values: Vec<serde_json::Value>,
    /// Optional system annotations.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<SystemAnnotations>,
}

/// How many jobs a fan-out dimension expands into.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DimCount {
    /// A fixed count declared in the blueprint.
    Literal(usize),
    /// Resolved at plan time from an integer input.
    FromInput(String),
}

/// A fan-out dimension declared on a producer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Dimension {
    /// Dimension name; shows up as `[name=i]` in produced artifact ids.
    pub name: String,
    /// Number of indices.
    pub count: DimCount,
}

/// One producer declaration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ProducerDecl {
    /// Alias, unique within the blueprint.
    pub alias: String,
    /// Reference to the producer spec in the catalog.
    pub producer_ref: String,
    /// Provider the producer runs on (e.g. `"openai"`, `"mock"`).
    pub provider: String,
    /// Model identifier passed through to the provider.
    pub model: String,
    /// Declared output JSON schema. The root must be an object; arrays carry
    /// `maxItems` (their static size) and optionally `x-dim` naming the
    /// grouping dimension.
    pub output_schema: serde_json::Value,
    /// Declared input JSON schema, when the producer spec ships one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<serde_json::Value>,
    /// Fan-out dimensions in declared order; empty for singleton producers.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dimensions: Vec<Dimension>,
    /// Predicate over upstream artifacts gating every job of this producer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpr>,
    /// Declarative payload shaping applied before the provider call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_mapping: Option<SdkMapping>,
}

/// A typed connection from a producer output (or blueprint input) to a
/// consumer input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Connection {
    /// Consumer side: `Alias.InputName`, optionally `[k]` for element-wise
    /// wiring into an array input.
    pub consumer: String,
    /// Source side: a blueprint input name (optionally indexed) or a
    /// producer output path `Alias.Output.Path`.
    pub source: String,
    /// When true the consumer instantiates one job per source index instead
    /// of aggregating (fan-in). Source dimensions are matched to the
    /// consumer's declared dimensions by name; array inputs use the
    /// consumer's first dimension.
    #[serde(default)]
    pub looped: bool,
}

/// A validated blueprint: the input contract of the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BlueprintTree {
    /// Identity metadata.
    pub meta: BlueprintMeta,
    /// Ordered input declarations.
    pub inputs: Vec<InputDecl>,
    /// Producer declarations.
    pub producers: Vec<ProducerDecl>,
    /// Connections between producers and inputs.
    pub connections: Vec<Connection>,
}

impl BlueprintTree {
    /// Look up an input declaration by name.
    #[must_use]
    pub fn input(&self, name: &str) -> Option<&InputDecl> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Look up a producer declaration by alias.
    #[must_use]
    pub fn producer(&self, alias: &str) -> Option<&ProducerDecl> {
        self.producers.iter().find(|p| p.alias == alias)
    }
}

// ---------------------------------------------------------------------------
// SDK mapping (payload shaping contract)
// ---------------------------------------------------------------------------

/// A gate on another resolved input, used by conditional field mappings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MappingGate {
    /// Input alias the gate reads.
    pub input: String,
    /// Comparison operator.
    pub op: crate::condition::ConditionOp,
    /// Literal for `equals`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<serde_json::Value>,
}

/// A value transform applied while shaping a provider payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    /// Replace the value via a lookup table keyed by its string rendering.
    Lookup {
        /// Table of rendered-value → replacement.
        table: BTreeMap<String, serde_json::Value>,
    },
    /// Render an integer as its decimal string.
    IntToString,
    /// Render an integer as `"<n>s"`.
    IntToSecondsString,
    /// Convert a duration in seconds to a frame count at the given rate.
    DurationToFrames {
        /// Frames per second.
        fps: u32,
    },
    /// Invert a boolean.
    Invert,
    /// Take the first element of an array value.
    FirstOf,
    /// Build a composite key from several inputs and look it up in a table.
    Combine {
        /// Input aliases joined (in order) with `|` to form the key.
        inputs: Vec<String>,
        /// Table of composite key → replacement.
        table: BTreeMap<String, serde_json::Value>,
    },
}

/// One field of an SDK mapping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FieldMapping {
    /// Input alias to read; may carry an element index (`Images[0]`).
    pub alias: String,
    /// Target payload field; defaults to the alias.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_field: Option<String>,
    /// Optional value transform.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<Transform>,
    /// Optional gate on another input; unmet gates skip the field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub when: Option<MappingGate>,
    /// When true the (object-valued) result's keys are spread into the
    /// payload root instead of nesting under `api_field`.
    #[serde(default)]
    pub expand: bool,
}

/// Declarative payload shaping: how resolved inputs become a provider payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct SdkMapping {
    /// Field mappings, applied in order.
    pub fields: Vec<FieldMapping>,
}

/// Per-producer prompt override loaded from `prompts/<Alias>.toml`.
///
/// The override text participates in the job inputs hash, so editing a
/// prompt dirties exactly the jobs of that producer.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct PromptOverride {
    /// Replacement system prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Replacement user prompt template.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blueprint_lookups() {
        let bp = BlueprintTree {
            meta: BlueprintMeta {
                id: "bp-1".into(),
                name: "Demo".into(),
                kind: BlueprintKind::Blueprint,
            },
            inputs: vec![InputDecl {
                name: "Topic".into(),
                input_type: InputType::String,
                item_type: None,
                required: true,
                values: vec![],
                annotations: None,
            }],
            producers: vec![ProducerDecl {
                alias: "Doc".into(),
                producer_ref: "catalog/doc".into(),
                provider: "mock".into(),
                model: "stub-1".into(),
                output_schema: json!({"type": "object", "properties": {"Title": {"type": "string"}}}),
                input_schema: None,
                dimensions: vec![],
                condition: None,
                sdk_mapping: None,
            }],
            connections: vec![],
        };
        assert!(bp.input("Topic").is_some());
        assert!(bp.input("Missing").is_none());
        assert!(bp.producer("Doc").is_some());
    }

    #[test]
    fn sdk_mapping_serde_round_trip() {
        let mapping = SdkMapping {
            fields: vec![FieldMapping {
                alias: "Duration".into(),
                api_field: Some("duration".into()),
                transform: Some(Transform::IntToSecondsString),
                when: Some(MappingGate {
                    input: "Mode".into(),
                    op: crate::condition::ConditionOp::Equals,
                    value: Some(json!("timed")),
                }),
                expand: false,
            }],
        };
        let text = serde_json::to_string(&mapping).unwrap();
        let back: SdkMapping = serde_json::from_str(&text).unwrap();
        assert_eq!(back, mapping);
    }
}
