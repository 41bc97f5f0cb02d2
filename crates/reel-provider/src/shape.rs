// SPDX-License-Identifier: MIT OR Apache-2.0
//! Declarative payload shaping: resolved inputs → provider payload.
//!
//! Mappings rename fields, transform values, gate on other inputs, spread
//! object results into the payload root, and snap numeric values to the
//! nearest allowed enum variant of the declared input schema.

use crate::ProviderError;
use reel_core::{ConditionExpr, MappingGate, SdkMapping, Transform};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Shape a provider payload from resolved inputs.
///
/// Fields whose gate is unmet are skipped. Schema-required fields missing
/// from the resolved inputs are skipped when the schema provides a default
/// (the provider fills them in), and rejected otherwise.
///
/// # Errors
///
/// [`ProviderError`] with kind `UserInput` on out-of-bounds element access,
/// missing defaults, unmappable lookups, or un-snappable enum values.
pub fn shape_payload(
    resolved: &BTreeMap<String, Value>,
    mapping: &SdkMapping,
    input_schema: Option<&Value>,
) -> Result<Map<String, Value>, ProviderError> {
    let mut payload = Map::new();
    for field in &mapping.fields {
        if let Some(gate) = &field.when {
            if !gate_met(gate, resolved) {
                continue;
            }
        }

        let (base, value) = match resolve_alias(&field.alias, resolved)? {
            (base, Some(v)) => (base, v),
            (base, None) => {
                check_missing(&base, input_schema)?;
                continue;
            }
        };

        let mut value = match &field.transform {
            Some(t) => apply_transform(t, value, resolved)?,
            None => value,
        };
        if let Some(allowed) = enum_values(&base, input_schema) {
            value = snap_enum(value, allowed, schema_type(&base, input_schema))?;
        }

        if field.expand {
            match value {
                Value::Object(obj) => {
                    for (k, v) in obj {
                        payload.insert(k, v);
                    }
                }
                other => {
                    return Err(ProviderError::user_input(format!(
                        "expand on `{}` needs an object value, got {other}",
                        field.alias
                    )));
                }
            }
        } else {
            let key = field.api_field.clone().unwrap_or_else(|| base.clone());
            payload.insert(key, value);
        }
    }
    Ok(payload)
}

fn gate_met(gate: &MappingGate, resolved: &BTreeMap<String, Value>) -> bool {
    let expr = ConditionExpr::When {
        artifact: gate.input.clone(),
        op: gate.op,
        value: gate.value.clone(),
    };
    expr.evaluate(&|key: &str| resolved.get(key).cloned())
}

/// Split an alias into (base, element index), resolve it, and descend the
/// parent array for indexed access. Out of bounds is a user error.
fn resolve_alias(
    alias: &str,
    resolved: &BTreeMap<String, Value>,
) -> Result<(String, Option<Value>), ProviderError> {
    // Element bindings resolved at plan time land under their full key
    // (`SourceImages[0]`); prefer those over descending the parent array.
    if let Some(value) = resolved.get(alias) {
        let base = alias.split('[').next().unwrap_or(alias).to_string();
        return Ok((base, Some(value.clone())));
    }
    if let Some((base, rest)) = alias.split_once('[') {
        let index: usize = rest
            .strip_suffix(']')
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| {
                ProviderError::user_input(format!("malformed indexed alias `{alias}`"))
            })?;
        let Some(parent) = resolved.get(base) else {
            return Ok((base.to_string(), None));
        };
        let arr = parent.as_array().ok_or_else(|| {
            ProviderError::user_input(format!("`{base}` is not an array, cannot index"))
        })?;
        let value = arr.get(index).cloned().ok_or_else(|| {
            ProviderError::user_input(format!(
                "index {index} out of bounds for `{base}` (length {})",
                arr.len()
            ))
        })?;
        Ok((base.to_string(), Some(value)))
    } else {
        Ok((alias.to_string(), resolved.get(alias).cloned()))
    }
}

fn check_missing(base: &str, input_schema: Option<&Value>) -> Result<(), ProviderError> {
    let Some(schema) = input_schema else {
        return Ok(());
    };
    let required = schema
        .get("required")
        .and_then(Value::as_array)
        .is_some_and(|r| r.iter().any(|v| v.as_str() == Some(base)));
    if !required {
        return Ok(());
    }
    let has_default = schema
        .get("properties")
        .and_then(|p| p.get(base))
        .and_then(|p| p.get("default"))
        .is_some();
    if has_default {
        // The provider fills the default in; omit the field.
        Ok(())
    } else {
        Err(ProviderError::user_input(format!(
            "required input `{base}` has no value and no default"
        )))
    }
}

fn apply_transform(
    transform: &Transform,
    value: Value,
    resolved: &BTreeMap<String, Value>,
) -> Result<Value, ProviderError> {
    match transform {
        Transform::Lookup { table } => {
            let key = render_key(&value);
            table.get(&key).cloned().ok_or_else(|| {
                ProviderError::user_input(format!("no mapping for value `{key}`"))
            })
        }
        Transform::IntToString => {
            let n = value.as_i64().ok_or_else(|| {
                ProviderError::user_input(format!("expected an integer, got {value}"))
            })?;
            Ok(Value::String(n.to_string()))
        }
        Transform::IntToSecondsString => {
            let n = value.as_i64().ok_or_else(|| {
                ProviderError::user_input(format!("expected an integer, got {value}"))
            })?;
            Ok(Value::String(format!("{n}s")))
        }
        Transform::DurationToFrames { fps } => {
            let secs = value.as_f64().ok_or_else(|| {
                ProviderError::user_input(format!("expected a duration, got {value}"))
            })?;
            Ok(Value::from((secs * f64::from(*fps)).round() as i64))
        }
        Transform::Invert => {
            let b = match &value {
                Value::Bool(b) => *b,
                Value::String(s) if s == "true" => true,
                Value::String(s) if s == "false" => false,
                other => {
                    return Err(ProviderError::user_input(format!(
                        "expected a boolean, got {other}"
                    )));
                }
            };
            Ok(Value::Bool(!b))
        }
        Transform::FirstOf => {
            let arr = value.as_array().ok_or_else(|| {
                ProviderError::user_input(format!("expected an array, got {value}"))
            })?;
            arr.first()
                .cloned()
                .ok_or_else(|| ProviderError::user_input("firstOf on an empty array"))
        }
        Transform::Combine { inputs, table } => {
            let mut parts = Vec::with_capacity(inputs.len());
            for alias in inputs {
                let (_, v) = resolve_alias(alias, resolved)?;
                let v = v.ok_or_else(|| {
                    ProviderError::user_input(format!("combine input `{alias}` has no value"))
                })?;
                parts.push(render_key(&v));
            }
            let key = parts.join("|");
            table.get(&key).cloned().ok_or_else(|| {
                ProviderError::user_input(format!("no combined mapping for `{key}`"))
            })
        }
    }
}

fn render_key(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn enum_values<'a>(base: &str, input_schema: Option<&'a Value>) -> Option<&'a Vec<Value>> {
    input_schema?
        .get("properties")?
        .get(base)?
        .get("enum")?
        .as_array()
}

fn schema_type<'a>(base: &str, input_schema: Option<&'a Value>) -> Option<&'a str> {
    input_schema?
        .get("properties")?
        .get(base)?
        .get("type")?
        .as_str()
}

/// Snap a value to the nearest allowed enum variant.
///
/// Exact members pass through. Numeric values (or strings with a numeric
/// prefix) snap to the variant whose numeric reading is closest, rendered
/// in the schema's declared type.
fn snap_enum(
    value: Value,
    allowed: &[Value],
    declared_type: Option<&str>,
) -> Result<Value, ProviderError> {
    if allowed.contains(&value) {
        return Ok(value);
    }
    let n = numeric_reading(&value).ok_or_else(|| {
        ProviderError::user_input(format!("value {value} is not an allowed enum member"))
    })?;

    let mut best: Option<(f64, &Value)> = None;
    for candidate in allowed {
        let Some(c) = numeric_reading(candidate) else {
            continue;
        };
        let distance = (c - n).abs();
        let better = match best {
            None => true,
            Some((d, _)) => distance < d,
        };
        if better {
            best = Some((distance, candidate));
        }
    }
    let (_, nearest) = best.ok_or_else(|| {
        ProviderError::user_input(format!("no numeric enum member to snap {value} to"))
    })?;

    match declared_type {
        Some("integer") => Ok(Value::from(
            numeric_reading(nearest).unwrap_or_default().round() as i64,
        )),
        _ => Ok(nearest.clone()),
    }
}

fn numeric_reading(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let prefix: String = s
                .chars()
                .take_while(|c| c.is_ascii_digit() || *c == '.' || *c == '-')
                .collect();
            prefix.parse().ok()
        }
        _ => None,
    }
}
