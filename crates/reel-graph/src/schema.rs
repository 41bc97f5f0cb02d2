// SPDX-License-Identifier: MIT OR Apache-2.0
//! Output-schema expansion into leaf artifact sets.
//!
//! A producer's declared output schema is a restricted JSON Schema: the root
//! is an object; fields are scalars, objects, arrays of scalars, or arrays
//! of objects. Arrays are statically sized via `maxItems` and may name their
//! grouping dimension with `x-dim` (defaulting to the field name).

use crate::GraphError;
use reel_core::{Index, Segment};
use serde_json::Value;

/// One leaf of a producer's output: a scalar addressable by JSON path.
#[derive(Debug, Clone, PartialEq)]
pub struct LeafSpec {
    /// Concrete path segments, ordinal indices filled in.
    pub path: Vec<Segment>,
    /// `(dimension name, index)` per enclosing array level, outermost first.
    pub dims: Vec<(String, usize)>,
    /// The scalar subschema at this leaf.
    pub schema: Value,
}

impl LeafSpec {
    /// Render the JSON path (`Segments[0].ImagePrompts[1]`).
    #[must_use]
    pub fn json_path(&self) -> String {
        self.path
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(".")
    }

    /// True when `prefix` addresses this leaf or an enclosing subtree.
    /// Indices present in the prefix must match; absent indices match any.
    #[must_use]
    pub fn matches_prefix(&self, prefix: &[Segment]) -> bool {
        if prefix.is_empty() || prefix.len() > self.path.len() {
            return false;
        }
        prefix.iter().zip(&self.path).all(|(p, s)| {
            p.name == s.name
                && p.indices.len() <= s.indices.len()
                && p.indices == s.indices[..p.indices.len()]
        })
    }
}

/// Expand a producer output schema into its leaf artifact set.
///
/// # Errors
///
/// [`GraphError::InvalidSchema`] when the root is not an object or an array
/// nests another array directly; [`GraphError::UnsizedArray`] when an array
/// lacks `maxItems`.
pub fn expand_leaves(producer: &str, schema: &Value) -> Result<Vec<LeafSpec>, GraphError> {
    let props = object_properties(schema).ok_or_else(|| GraphError::InvalidSchema {
        producer: producer.to_string(),
        reason: "output schema root must be an object with properties".into(),
    })?;
    let mut leaves = Vec::new();
    for (name, subschema) in props {
        expand_field(producer, name, subschema, &[], &[], &mut leaves)?;
    }
    Ok(leaves)
}

fn object_properties(schema: &Value) -> Option<&serde_json::Map<String, Value>> {
    if schema.get("type").and_then(Value::as_str) != Some("object") {
        return None;
    }
    schema.get("properties").and_then(Value::as_object)
}

fn expand_field(
    producer: &str,
    name: &str,
    schema: &Value,
    path: &[Segment],
    dims: &[(String, usize)],
    out: &mut Vec<LeafSpec>,
) -> Result<(), GraphError> {
    let ty = schema.get("type").and_then(Value::as_str).unwrap_or("string");
    match ty {
        "object" => {
            let props = object_properties(schema).ok_or_else(|| GraphError::InvalidSchema {
                producer: producer.to_string(),
                reason: format!("object field `{name}` has no properties"),
            })?;
            let mut child_path = path.to_vec();
            child_path.push(Segment::bare(name));
            for (child, subschema) in props {
                expand_field(producer, child, subschema, &child_path, dims, out)?;
            }
            Ok(())
        }
        "array" => {
            let size = schema
                .get("maxItems")
                .and_then(Value::as_u64)
                .ok_or_else(|| GraphError::UnsizedArray {
                    producer: producer.to_string(),
                    field: name.to_string(),
                })? as usize;
            let dim = schema
                .get("x-dim")
                .and_then(Value::as_str)
                .unwrap_or(name)
                .to_string();
            let items = schema.get("items").cloned().unwrap_or(Value::Null);
            let item_ty = items.get("type").and_then(Value::as_str).unwrap_or("string");
            if item_ty == "array" {
                return Err(GraphError::InvalidSchema {
                    producer: producer.to_string(),
                    reason: format!("array field `{name}` nests another array directly"),
                });
            }
            for i in 0..size {
                let mut elem_path = path.to_vec();
                elem_path.push(Segment {
                    name: name.to_string(),
                    indices: vec![Index::Ordinal(i)],
                });
                let mut elem_dims = dims.to_vec();
                elem_dims.push((dim.clone(), i));
                if item_ty == "object" {
                    let props =
                        object_properties(&items).ok_or_else(|| GraphError::InvalidSchema {
                            producer: producer.to_string(),
                            reason: format!("array field `{name}` items have no properties"),
                        })?;
                    for (child, subschema) in props {
                        expand_field(producer, child, subschema, &elem_path, &elem_dims, out)?;
                    }
                } else {
                    out.push(LeafSpec {
                        path: elem_path,
                        dims: elem_dims,
                        schema: items.clone(),
                    });
                }
            }
            Ok(())
        }
        _ => {
            let mut leaf_path = path.to_vec();
            leaf_path.push(Segment::bare(name));
            out.push(LeafSpec {
                path: leaf_path,
                dims: dims.to_vec(),
                schema: schema.clone(),
            });
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_fields_become_single_leaves() {
        let schema = json!({
            "type": "object",
            "properties": {
                "Title": {"type": "string"},
                "WordCount": {"type": "integer"}
            }
        });
        let leaves = expand_leaves("Doc", &schema).unwrap();
        let paths: Vec<String> = leaves.iter().map(LeafSpec::json_path).collect();
        assert_eq!(paths, vec!["Title", "WordCount"]);
    }

    #[test]
    fn arrays_of_objects_expand_to_cartesian_products() {
        let schema = json!({
            "type": "object",
            "properties": {
                "Segments": {
                    "type": "array",
                    "maxItems": 2,
                    "x-dim": "segment",
                    "items": {
                        "type": "object",
                        "properties": {
                            "ImagePrompts": {
                                "type": "array",
                                "maxItems": 2,
                                "x-dim": "prompt",
                                "items": {"type": "string"}
                            }
                        }
                    }
                }
            }
        });
        let leaves = expand_leaves("Doc", &schema).unwrap();
        let paths: Vec<String> = leaves.iter().map(LeafSpec::json_path).collect();
        assert_eq!(
            paths,
            vec![
                "Segments[0].ImagePrompts[0]",
                "Segments[0].ImagePrompts[1]",
                "Segments[1].ImagePrompts[0]",
                "Segments[1].ImagePrompts[1]",
            ]
        );
        assert_eq!(
            leaves[3].dims,
            vec![("segment".to_string(), 1), ("prompt".to_string(), 1)]
        );
    }

    #[test]
    fn unsized_arrays_are_rejected() {
        let schema = json!({
            "type": "object",
            "properties": {
                "Items": {"type": "array", "items": {"type": "string"}}
            }
        });
        let err = expand_leaves("Doc", &schema).unwrap_err();
        assert!(matches!(err, GraphError::UnsizedArray { .. }));
    }

    #[test]
    fn non_object_root_is_rejected() {
        let err = expand_leaves("Doc", &json!({"type": "string"})).unwrap_err();
        assert!(matches!(err, GraphError::InvalidSchema { .. }));
    }

    #[test]
    fn prefix_matching_respects_indices() {
        let schema = json!({
            "type": "object",
            "properties": {
                "Segments": {
                    "type": "array",
                    "maxItems": 2,
                    "items": {
                        "type": "object",
                        "properties": {"Prompt": {"type": "string"}}
                    }
                }
            }
        });
        let leaves = expand_leaves("Doc", &schema).unwrap();
        let all = reel_core::parse_dotted_path("Segments").unwrap();
        assert_eq!(leaves.iter().filter(|l| l.matches_prefix(&all)).count(), 2);
        let first = reel_core::parse_dotted_path("Segments[0]").unwrap();
        assert_eq!(leaves.iter().filter(|l| l.matches_prefix(&first)).count(), 1);
        let exact = reel_core::parse_dotted_path("Segments[1].Prompt").unwrap();
        assert_eq!(leaves.iter().filter(|l| l.matches_prefix(&exact)).count(), 1);
    }
}
