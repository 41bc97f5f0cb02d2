// SPDX-License-Identifier: MIT OR Apache-2.0
//! Boolean predicates gating producers and their inputs.
//!
//! The grammar is deliberately small: `when <artifact> equals <literal>`,
//! `not_empty`, `empty`, combined with `any(...)` / `all(...)`. Evaluation
//! short-circuits and coerces the strings `"true"`/`"false"` to booleans, so
//! a producer emitting a textual flag can still gate its consumers.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Comparison operator inside a `when` clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    /// The artifact value equals the literal (after boolean coercion).
    Equals,
    /// The artifact exists and is non-empty.
    NotEmpty,
    /// The artifact is absent or empty.
    Empty,
}

/// A boolean expression over upstream artifact values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditionExpr {
    /// A single `when` clause against one artifact path.
    When {
        /// Artifact path the clause reads. Unindexed paths are substituted
        /// with the consuming job's dimension indices at plan time.
        artifact: String,
        /// Comparison operator.
        op: ConditionOp,
        /// Literal to compare against; only used by [`ConditionOp::Equals`].
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<serde_json::Value>,
    },
    /// True when at least one child is true. Short-circuits.
    Any(Vec<ConditionExpr>),
    /// True when every child is true. Short-circuits.
    All(Vec<ConditionExpr>),
}

impl ConditionExpr {
    /// Convenience constructor for an equality clause.
    #[must_use]
    pub fn when_equals(artifact: impl Into<String>, value: serde_json::Value) -> Self {
        Self::When {
            artifact: artifact.into(),
            op: ConditionOp::Equals,
            value: Some(value),
        }
    }

    /// Convenience constructor for a non-empty clause.
    #[must_use]
    pub fn when_not_empty(artifact: impl Into<String>) -> Self {
        Self::When {
            artifact: artifact.into(),
            op: ConditionOp::NotEmpty,
            value: None,
        }
    }

    /// Every artifact path referenced anywhere in the expression.
    #[must_use]
    pub fn referenced_artifacts(&self) -> Vec<&str> {
        let mut out = Vec::new();
        self.collect_refs(&mut out);
        out
    }

    fn collect_refs<'a>(&'a self, out: &mut Vec<&'a str>) {
        match self {
            Self::When { artifact, .. } => out.push(artifact),
            Self::Any(children) | Self::All(children) => {
                for c in children {
                    c.collect_refs(out);
                }
            }
        }
    }

    /// Evaluate against a lookup returning the current value of an artifact
    /// path, or `None` when the artifact was never produced (or skipped).
    pub fn evaluate<F>(&self, lookup: &F) -> bool
    where
        F: Fn(&str) -> Option<serde_json::Value>,
    {
        match self {
            Self::When {
                artifact,
                op,
                value,
            } => {
                let current = lookup(artifact);
                match op {
                    ConditionOp::Empty => match &current {
                        None => true,
                        Some(v) => is_empty(v),
                    },
                    ConditionOp::NotEmpty => match &current {
                        None => false,
                        Some(v) => !is_empty(v),
                    },
                    ConditionOp::Equals => match (&current, value) {
                        (Some(actual), Some(expected)) => {
                            coerce_bool(actual) == coerce_bool(expected)
                        }
                        _ => false,
                    },
                }
            }
            Self::Any(children) => children.iter().any(|c| c.evaluate(lookup)),
            Self::All(children) => children.iter().all(|c| c.evaluate(lookup)),
        }
    }

    /// Rewrite every referenced artifact path through `f`. Used by the
    /// planner to substitute concrete dimension indices.
    #[must_use]
    pub fn map_artifacts<F>(&self, f: &F) -> Self
    where
        F: Fn(&str) -> String,
    {
        match self {
            Self::When {
                artifact,
                op,
                value,
            } => Self::When {
                artifact: f(artifact),
                op: *op,
                value: value.clone(),
            },
            Self::Any(children) => Self::Any(children.iter().map(|c| c.map_artifacts(f)).collect()),
            Self::All(children) => Self::All(children.iter().map(|c| c.map_artifacts(f)).collect()),
        }
    }
}

fn is_empty(v: &serde_json::Value) -> bool {
    match v {
        serde_json::Value::Null => true,
        serde_json::Value::String(s) => s.is_empty(),
        serde_json::Value::Array(a) => a.is_empty(),
        serde_json::Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Coerce `"true"`/`"false"` strings to booleans; leave everything else as-is.
fn coerce_bool(v: &serde_json::Value) -> serde_json::Value {
    if let serde_json::Value::String(s) = v {
        match s.as_str() {
            "true" => return serde_json::Value::Bool(true),
            "false" => return serde_json::Value::Bool(false),
            _ => {}
        }
    }
    v.clone()
}
