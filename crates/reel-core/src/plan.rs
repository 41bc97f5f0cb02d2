// SPDX-License-Identifier: MIT OR Apache-2.0
//! Jobs and sealed plans.

use crate::blueprint::SdkMapping;
use crate::condition::ConditionExpr;
use crate::id::CanonicalId;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// One member of an inferred fan-in, in final order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FanInMember {
    /// Artifact id of the member.
    pub id: CanonicalId,
    /// Group key (outer dimension value) the member belongs to.
    pub group: String,
    /// Condition gating the member's source producer, when it is conditional.
    /// Whether the member materializes is decided at execution time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpr>,
}

/// An inferred fan-in record for one consumer input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FanIn {
    /// Dimension the members are grouped by, or `"singleton"` when a single
    /// unlooped source feeds the input.
    pub group_by: String,
    /// Dimension the members are ordered by, when grouped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub order_by: Option<String>,
    /// Ordered members, conditional sources included.
    pub members: Vec<FanInMember>,
}

/// Input and output schema references attached to a job.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct SchemaRefs {
    /// Declared input schema, when the producer spec ships one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
    /// Declared output schema.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<serde_json::Value>,
}

/// Everything the executor needs to run a job beyond its edges.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct JobContext {
    /// Provider the job runs on.
    pub provider: String,
    /// Model identifier.
    pub model: String,
    /// Input alias → resolved canonical id, element access included.
    #[serde(default)]
    pub input_bindings: BTreeMap<String, CanonicalId>,
    /// Inputs already materialized at plan time (literal blueprint inputs).
    #[serde(default)]
    pub resolved_inputs: BTreeMap<String, serde_json::Value>,
    /// Per-input predicates gating availability, keyed by input alias.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub input_conditions: BTreeMap<String, ConditionExpr>,
    /// The producer's own gate, dimension indices substituted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<ConditionExpr>,
    /// Inferred fan-in per input alias.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub fan_in: BTreeMap<String, FanIn>,
    /// Declarative payload shaping.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_mapping: Option<SdkMapping>,
    /// Schema references.
    #[serde(default)]
    pub schema: SchemaRefs,
    /// Free-form extras (prompt overrides, cost hints).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, serde_json::Value>,
    /// Stable digest of everything that influences this job's output.
    pub inputs_hash: String,
}

/// A concrete producer instantiation, immutable once sealed into a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Job {
    /// Job id: `Producer:<Alias>[i0][i1]...`.
    pub job_id: CanonicalId,
    /// Producer alias.
    pub producer: String,
    /// Dimension index vector, in declared dimension order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dims: Vec<usize>,
    /// Layer index in the plan.
    pub layer: usize,
    /// Every canonical id this job reads (fan-in members expanded).
    pub inputs: Vec<CanonicalId>,
    /// Every artifact id this job writes, virtual leaves enumerated.
    pub produces: Vec<CanonicalId>,
    /// Execution context.
    pub context: JobContext,
}

/// Format tag embedded in persisted plans.
pub const PLAN_FORMAT_VERSION: &str = "reelforge/plan-v1";

/// An ordered, layered set of jobs. A layer only starts once every job in
/// the previous layer reached a terminal status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct Plan {
    /// Plan format tag.
    pub version: String,
    /// Revision token identifying this plan instance's target state; derived
    /// deterministically so identical inputs yield identical plans.
    pub target_revision: Uuid,
    /// Layers in execution order. Layer indices on jobs are preserved from
    /// the full graph, so a filtered (incremental) plan may skip numbers.
    pub layers: Vec<Vec<Job>>,
}

impl Plan {
    /// Iterate all jobs in deterministic execution order.
    pub fn jobs(&self) -> impl Iterator<Item = &Job> {
        self.layers.iter().flatten()
    }

    /// Total number of jobs.
    #[must_use]
    pub fn job_count(&self) -> usize {
        self.layers.iter().map(Vec::len).sum()
    }

    /// Look up a job by id.
    #[must_use]
    pub fn job(&self, id: &CanonicalId) -> Option<&Job> {
        self.jobs().find(|j| &j.job_id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job(alias: &str, dims: Vec<usize>, layer: usize) -> Job {
        Job {
            job_id: CanonicalId::job(alias, dims.clone()),
            producer: alias.into(),
            dims,
            layer,
            inputs: vec![],
            produces: vec![],
            context: JobContext::default(),
        }
    }

    #[test]
    fn jobs_iterate_in_layer_order() {
        let plan = Plan {
            version: PLAN_FORMAT_VERSION.into(),
            target_revision: Uuid::nil(),
            layers: vec![
                vec![job("Doc", vec![], 0)],
                vec![job("Image", vec![0], 1), job("Image", vec![1], 1)],
            ],
        };
        assert_eq!(plan.job_count(), 3);
        let ids: Vec<String> = plan.jobs().map(|j| j.job_id.to_string()).collect();
        assert_eq!(
            ids,
            vec!["Producer:Doc", "Producer:Image[0]", "Producer:Image[1]"]
        );
        assert!(plan.job(&CanonicalId::job("Image", vec![1])).is_some());
    }

    #[test]
    fn plan_serde_round_trip() {
        let plan = Plan {
            version: PLAN_FORMAT_VERSION.into(),
            target_revision: Uuid::nil(),
            layers: vec![vec![job("Doc", vec![], 0)]],
        };
        let json = serde_json::to_string_pretty(&plan).unwrap();
        let back: Plan = serde_json::from_str(&json).unwrap();
        assert_eq!(back, plan);
    }
}
