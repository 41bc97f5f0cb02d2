// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

mod dirty;
mod jobs;

use chrono::Utc;
use reel_config::ExecutionMode;
use reel_core::{CanonicalId, InputEvent, Manifest, Plan, PromptOverride};
use reel_error::{ErrorCode, ForgeError};
use reel_graph::ProducerGraph;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info};
use uuid::Uuid;

/// Errors from planning. All abort before any job runs.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum PlanError {
    /// A required input has no value.
    #[error("missing required input `{name}`")]
    MissingInput {
        /// Input name.
        name: String,
    },

    /// An input value does not match its declaration.
    #[error("invalid input `{name}`: {reason}")]
    InvalidInput {
        /// Input name.
        name: String,
        /// What was wrong.
        reason: String,
    },

    /// An element binding reached past the end of an array input.
    #[error("index out of bounds resolving `{id}` (array length {len})")]
    IndexOutOfBounds {
        /// The canonical id that failed to resolve.
        id: String,
        /// Actual array length.
        len: usize,
    },

    /// A fan-out dimension count could not be resolved.
    #[error("producer `{producer}` dimension `{dim}`: {reason}")]
    UnresolvedDimension {
        /// Producer declaring the dimension.
        producer: String,
        /// Dimension name.
        dim: String,
        /// What was wrong.
        reason: String,
    },

    /// A consumer input could not be bound to a concrete source.
    #[error("job `{job}` input `{input}`: {reason}")]
    UnsatisfiedBinding {
        /// The consuming job.
        job: String,
        /// The input alias.
        input: String,
        /// What was wrong.
        reason: String,
    },

    /// Fan-in members span more than one plausible grouping dimension.
    #[error("job `{job}` input `{input}`: fan-in spans dimensions {dims:?}")]
    AmbiguousFanIn {
        /// The consuming job.
        job: String,
        /// The input alias.
        input: String,
        /// The dimension names in conflict.
        dims: Vec<String>,
    },

    /// A target or override id does not address anything in the graph.
    #[error("unknown artifact `{id}`")]
    UnknownArtifact {
        /// The id that failed to resolve.
        id: String,
    },

    /// Contract-level serialization failed while hashing.
    #[error("hashing failed: {0}")]
    Hashing(String),
}

impl From<PlanError> for ForgeError {
    fn from(err: PlanError) -> Self {
        let code = match &err {
            PlanError::MissingInput { .. } => ErrorCode::InputMissing,
            PlanError::InvalidInput { .. } => ErrorCode::InputInvalid,
            PlanError::IndexOutOfBounds { .. } => ErrorCode::InputIndexOutOfBounds,
            PlanError::UnresolvedDimension { .. } => ErrorCode::PlanUnsatisfiedBinding,
            PlanError::UnsatisfiedBinding { .. } => ErrorCode::PlanUnsatisfiedBinding,
            PlanError::AmbiguousFanIn { .. } => ErrorCode::PlanAmbiguousFanIn,
            PlanError::UnknownArtifact { .. } => ErrorCode::PlanUnknownReference,
            PlanError::Hashing(_) => ErrorCode::Internal,
        };
        ForgeError::new(code, err.to_string())
    }
}

/// Replacement payload for one overridden leaf.
#[derive(Debug, Clone, PartialEq)]
pub enum OverridePayload {
    /// An inline JSON value, stored as an `application/json` blob.
    Json(serde_json::Value),
    /// Raw bytes with their MIME type (e.g. a replacement image).
    Bytes {
        /// Replacement bytes.
        data: Vec<u8>,
        /// MIME type of the bytes.
        mime_type: String,
    },
}

/// A synthetic artifact-replacement event the executor must record before
/// running the plan.
#[derive(Debug, Clone, PartialEq)]
pub struct OverrideEvent {
    /// The overridden leaf.
    pub artifact_id: CanonicalId,
    /// Replacement payload.
    pub payload: OverridePayload,
}

/// Options narrowing or forcing parts of a plan.
#[derive(Debug, Clone, Default)]
pub struct PlannerOptions {
    /// Execution mode; part of every job's inputs hash so switching between
    /// live and simulated invalidates everything.
    pub mode: ExecutionMode,
    /// Drop all jobs whose layer index is greater than this.
    pub up_to_layer: Option<usize>,
    /// Mark all jobs at this layer or deeper dirty regardless of hashes.
    pub re_run_from: Option<usize>,
    /// Restrict the dirty set to the transitive downstream of this artifact.
    pub target_artifact_id: Option<CanonicalId>,
    /// Leaf overrides: `Producer.Field.Path` → replacement payload.
    pub overrides: BTreeMap<String, OverridePayload>,
    /// Prompt overrides keyed by producer alias; folded into inputs hashes.
    pub prompt_overrides: BTreeMap<String, PromptOverride>,
}

/// Everything a successful planning pass yields.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    /// The sealed plan: only dirty jobs, layered.
    pub plan: Plan,
    /// Skeleton of the manifest the run will produce: prior artifacts
    /// carried over, input snapshot and producer selections refreshed,
    /// `previous_hash` pointing at the prior manifest.
    pub next_manifest: Manifest,
    /// Artifact ids the run will produce or update.
    pub pending: BTreeSet<String>,
    /// Input events to append when the run starts.
    pub input_events: Vec<InputEvent>,
    /// Synthetic replacement events for overridden leaves.
    pub override_events: Vec<OverrideEvent>,
}

/// Compute a plan.
///
/// Deterministic: identical (graph, inputs, prior, options) yield a
/// byte-identical serialized plan.
///
/// # Errors
///
/// Every [`PlanError`] variant; planning errors abort before any job runs.
pub fn plan(
    graph: &ProducerGraph,
    inputs: &BTreeMap<String, serde_json::Value>,
    prior: Option<&Manifest>,
    options: &PlannerOptions,
) -> Result<PlanOutcome, PlanError> {
    validate_inputs(graph, inputs)?;

    let resolved_overrides = resolve_overrides(graph, options)?;
    let override_ids: Vec<CanonicalId> =
        resolved_overrides.iter().map(|o| o.artifact_id.clone()).collect();

    // Expand every job with bindings, conditions, fan-in, and layer.
    let expansion = jobs::expand(graph, inputs, options)?;

    // Dirty-set computation and option-driven narrowing.
    let dirty = dirty::compute(&expansion, prior, options, &override_ids);

    let mut layered: BTreeMap<usize, Vec<reel_core::Job>> = BTreeMap::new();
    for job in &expansion.jobs {
        if !dirty.contains(&job.job_id.to_string()) {
            continue;
        }
        if let Some(max) = options.up_to_layer {
            if job.layer > max {
                continue;
            }
        }
        layered.entry(job.layer).or_default().push(job.clone());
    }
    for jobs in layered.values_mut() {
        jobs.sort_by(|a, b| (&a.producer, &a.dims).cmp(&(&b.producer, &b.dims)));
    }

    let layers: Vec<Vec<reel_core::Job>> = layered.into_values().collect();
    let target_revision = derive_revision(graph, prior, &layers)?;
    let plan = Plan {
        version: reel_core::PLAN_FORMAT_VERSION.to_string(),
        target_revision,
        layers,
    };

    let mut pending: BTreeSet<String> = plan
        .jobs()
        .flat_map(|j| j.produces.iter().map(ToString::to_string))
        .collect();
    for id in &override_ids {
        pending.insert(id.to_string());
    }

    // Next-manifest skeleton: carry prior artifacts, refresh the rest.
    let mut next_manifest = Manifest {
        manifest_hash: None,
        previous_hash: prior.and_then(|m| m.manifest_hash.clone()),
        producers: BTreeMap::new(),
        inputs: BTreeMap::new(),
        artifacts: prior.map(|m| m.artifacts.clone()).unwrap_or_default(),
    };
    for (alias, node) in &graph.nodes {
        next_manifest.producers.insert(
            alias.clone(),
            reel_core::ProducerSelection {
                provider: node.decl.provider.clone(),
                model: node.decl.model.clone(),
            },
        );
    }
    let mut input_events = Vec::new();
    for decl in &graph.blueprint.inputs {
        if let Some(value) = inputs.get(&decl.name) {
            let input_id = CanonicalId::input(decl.name.clone());
            next_manifest
                .inputs
                .insert(input_id.to_string(), value.clone());
            input_events.push(InputEvent {
                input_id,
                revision: target_revision,
                value: value.clone(),
                recorded_at: Utc::now(),
            });
        }
    }

    let override_events = resolved_overrides;

    info!(
        target: "reel.planner",
        jobs = plan.job_count(),
        layers = plan.layers.len(),
        pending = pending.len(),
        "plan computed"
    );

    Ok(PlanOutcome {
        plan,
        next_manifest,
        pending,
        input_events,
        override_events,
    })
}

fn validate_inputs(
    graph: &ProducerGraph,
    inputs: &BTreeMap<String, serde_json::Value>,
) -> Result<(), PlanError> {
    use reel_core::InputType;
    for decl in &graph.blueprint.inputs {
        let Some(value) = inputs.get(&decl.name) else {
            if decl.required {
                return Err(PlanError::MissingInput {
                    name: decl.name.clone(),
                });
            }
            continue;
        };
        let ok = match decl.input_type {
            InputType::String | InputType::Text => value.is_string(),
            InputType::Int => value.is_i64() || value.is_u64(),
            InputType::Number => value.is_number(),
            InputType::Boolean => value.is_boolean(),
            InputType::Array => value.is_array(),
            InputType::Json => true,
            InputType::Enum => decl.values.contains(value),
            // Media inputs arrive as references (paths or blob refs).
            InputType::Image | InputType::Video | InputType::Audio => {
                value.is_string() || value.is_object()
            }
        };
        if !ok {
            return Err(PlanError::InvalidInput {
                name: decl.name.clone(),
                reason: format!("value does not match declared type {:?}", decl.input_type),
            });
        }
    }
    Ok(())
}

/// Parse and check every override key against the virtual-artifact index.
fn resolve_overrides(
    graph: &ProducerGraph,
    options: &PlannerOptions,
) -> Result<Vec<OverrideEvent>, PlanError> {
    let mut out = Vec::new();
    for (key, payload) in &options.overrides {
        let rendered = format!("Artifact:{key}");
        let id: CanonicalId = rendered
            .parse()
            .map_err(|_| PlanError::UnknownArtifact { id: key.clone() })?;
        let known = graph
            .virtual_index
            .keys()
            .any(|leaf| match leaf.parse::<CanonicalId>() {
                Ok(leaf_id) => leaf_id.overlaps(&id),
                Err(_) => false,
            });
        if !known {
            return Err(PlanError::UnknownArtifact { id: key.clone() });
        }
        out.push(OverrideEvent {
            artifact_id: id,
            payload: payload.clone(),
        });
    }
    Ok(out)
}

/// Derive the deterministic revision token for a plan.
fn derive_revision(
    graph: &ProducerGraph,
    prior: Option<&Manifest>,
    layers: &[Vec<reel_core::Job>],
) -> Result<Uuid, PlanError> {
    let fingerprint = serde_json::json!({
        "blueprint": graph.blueprint.meta.id,
        "previous": prior.and_then(|m| m.manifest_hash.clone()),
        "jobs": layers
            .iter()
            .flatten()
            .map(|j| (j.job_id.to_string(), j.context.inputs_hash.clone()))
            .collect::<Vec<_>>(),
    });
    let canonical =
        reel_core::canonical_json(&fingerprint).map_err(|e| PlanError::Hashing(e.to_string()))?;
    debug!(target: "reel.planner", bytes = canonical.len(), "revision fingerprint");
    Ok(Uuid::new_v5(&Uuid::NAMESPACE_OID, canonical.as_bytes()))
}

#[doc(hidden)]
pub use jobs::Expansion;
