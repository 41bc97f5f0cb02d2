// SPDX-License-Identifier: MIT OR Apache-2.0
//! Job expansion: dimensions, bindings, conditions, fan-in, layering.

use crate::{PlanError, PlannerOptions};
use reel_core::{
    CanonicalId, ConditionExpr, DimCount, FanIn, FanInMember, Index, Job, JobContext, SchemaRefs,
    Segment, parse_dotted_path,
};
use reel_graph::{Edge, EdgeSource, LeafSpec, ProducerGraph, ProducerNode};
use std::collections::{BTreeMap, BTreeSet};

/// The full job set for a graph, before dirty filtering.
#[derive(Debug, Clone)]
pub struct Expansion {
    /// Jobs in deterministic topological order, layers assigned.
    pub jobs: Vec<Job>,
    /// Artifact id → producing job id.
    pub produced_by: BTreeMap<String, String>,
}

pub(crate) fn expand(
    graph: &ProducerGraph,
    inputs: &BTreeMap<String, serde_json::Value>,
    options: &PlannerOptions,
) -> Result<Expansion, PlanError> {
    let mut dims_resolved: BTreeMap<String, Vec<(String, usize)>> = BTreeMap::new();
    for (alias, node) in &graph.nodes {
        dims_resolved.insert(alias.clone(), resolve_dims(node, inputs)?);
    }

    let mut jobs = Vec::new();
    let mut produced_by: BTreeMap<String, String> = BTreeMap::new();
    let mut job_layer: BTreeMap<String, usize> = BTreeMap::new();
    let mut job_condition: BTreeMap<String, ConditionExpr> = BTreeMap::new();

    for alias in &graph.topo_order {
        let node = graph.node(alias).expect("topo order lists known aliases");
        let dims = &dims_resolved[alias];
        let counts: Vec<usize> = dims.iter().map(|(_, c)| *c).collect();

        for dimvec in cartesian(&counts) {
            let job_id = CanonicalId::job(alias.clone(), dimvec.clone());
            let job_str = job_id.to_string();
            let dim_index: BTreeMap<String, usize> = dims
                .iter()
                .map(|(n, _)| n.clone())
                .zip(dimvec.iter().copied())
                .collect();

            let mut builder = JobBuilder {
                graph,
                inputs,
                dims_resolved: &dims_resolved,
                job_condition: &job_condition,
                job_str: &job_str,
                dim_index: &dim_index,
                bindings: BTreeMap::new(),
                resolved: BTreeMap::new(),
                input_conditions: BTreeMap::new(),
                fan_in: BTreeMap::new(),
                all_inputs: BTreeSet::new(),
            };

            // Resolve every edge, grouped per binding key so that multiple
            // connections to the same input merge into one fan-in.
            let mut keys: Vec<String> = Vec::new();
            let mut per_key: BTreeMap<String, Vec<&Edge>> = BTreeMap::new();
            for edge in graph.edges_for(alias) {
                let key = edge.binding_key();
                if !per_key.contains_key(&key) {
                    keys.push(key.clone());
                }
                per_key.entry(key).or_default().push(edge);
            }
            for key in keys {
                builder.resolve_key(&key, &per_key[&key])?;
            }

            // The producer's own gate, dimension indices substituted. The
            // referenced artifacts are dependencies: the gate cannot be
            // evaluated before they materialize, and editing them must
            // invalidate this job.
            let condition = match &node.decl.condition {
                Some(expr) => Some(builder.substitute_condition(expr)?),
                None => None,
            };
            if let Some(cond) = &condition {
                for reference in cond.referenced_artifacts() {
                    builder.all_inputs.insert(reference.to_string());
                }
            }

            // Virtual-artifact decomposition: one produce per leaf, job
            // dimensions rendered as named indices.
            let job_dims: Vec<(String, usize)> = dims
                .iter()
                .map(|(n, _)| n.clone())
                .zip(dimvec.iter().copied())
                .collect();
            let produces: Vec<CanonicalId> = node
                .leaves
                .iter()
                .map(|leaf| produced_id(alias, leaf, &job_dims))
                .collect();

            let JobBuilder {
                bindings,
                resolved,
                input_conditions,
                fan_in,
                all_inputs,
                ..
            } = builder;

            // Layer: strictly above every producing dependency.
            let layer = all_inputs
                .iter()
                .filter_map(|id| produced_by.get(id))
                .filter_map(|job| job_layer.get(job))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);

            let mut extras = BTreeMap::new();
            if let Some(prompt) = options.prompt_overrides.get(alias) {
                extras.insert(
                    "prompt_override".to_string(),
                    serde_json::to_value(prompt).map_err(|e| PlanError::Hashing(e.to_string()))?,
                );
            }

            let mut context = JobContext {
                provider: node.decl.provider.clone(),
                model: node.decl.model.clone(),
                input_bindings: bindings,
                resolved_inputs: resolved,
                input_conditions,
                condition: condition.clone(),
                fan_in,
                sdk_mapping: node.decl.sdk_mapping.clone(),
                schema: SchemaRefs {
                    input: node.decl.input_schema.clone(),
                    output: Some(node.decl.output_schema.clone()),
                },
                extras,
                inputs_hash: String::new(),
            };
            context.inputs_hash = inputs_hash(&context, options)?;

            for produce in &produces {
                produced_by.insert(produce.to_string(), job_str.clone());
            }
            job_layer.insert(job_str.clone(), layer);
            if let Some(cond) = &condition {
                job_condition.insert(job_str.clone(), cond.clone());
            }

            let mut input_list: Vec<CanonicalId> = Vec::new();
            for id in &all_inputs {
                input_list.push(
                    id.parse()
                        .expect("input ids were rendered from canonical ids"),
                );
            }

            jobs.push(Job {
                job_id,
                producer: alias.clone(),
                dims: dimvec,
                layer,
                inputs: input_list,
                produces,
                context,
            });
        }
    }

    Ok(Expansion { jobs, produced_by })
}

/// Render the artifact id a job writes for one leaf: the job's dimension
/// indices become named indices on the leaf's final segment.
pub(crate) fn produced_id(
    alias: &str,
    leaf: &LeafSpec,
    job_dims: &[(String, usize)],
) -> CanonicalId {
    let mut path = leaf.path.clone();
    if let Some(last) = path.last_mut() {
        for (dim, ix) in job_dims {
            last.indices.push(Index::Named {
                dim: dim.clone(),
                value: ix.to_string(),
            });
        }
    }
    CanonicalId::artifact(alias, path)
}

fn resolve_dims(
    node: &ProducerNode,
    inputs: &BTreeMap<String, serde_json::Value>,
) -> Result<Vec<(String, usize)>, PlanError> {
    node.decl
        .dimensions
        .iter()
        .map(|d| {
            let count = match &d.count {
                DimCount::Literal(n) => *n,
                DimCount::FromInput(name) => inputs
                    .get(name)
                    .ok_or_else(|| PlanError::UnresolvedDimension {
                        producer: node.decl.alias.clone(),
                        dim: d.name.clone(),
                        reason: format!("count input `{name}` is missing"),
                    })?
                    .as_u64()
                    .ok_or_else(|| PlanError::UnresolvedDimension {
                        producer: node.decl.alias.clone(),
                        dim: d.name.clone(),
                        reason: format!("count input `{name}` is not a non-negative integer"),
                    })? as usize,
            };
            Ok((d.name.clone(), count))
        })
        .collect()
}

fn cartesian(counts: &[usize]) -> Vec<Vec<usize>> {
    let mut out = vec![Vec::new()];
    for &count in counts {
        let mut next = Vec::with_capacity(out.len() * count);
        for prefix in &out {
            for i in 0..count {
                let mut v = prefix.clone();
                v.push(i);
                next.push(v);
            }
        }
        out = next;
    }
    out
}

/// Which array levels of `leaf` are pinned by explicit indices in `prefix`.
fn pinned_levels(prefix: &[Segment], leaf: &LeafSpec) -> BTreeSet<usize> {
    let mut pinned = BTreeSet::new();
    let mut level = 0;
    for (i, leaf_seg) in leaf.path.iter().enumerate() {
        for j in 0..leaf_seg.indices.len() {
            if let Some(pseg) = prefix.get(i) {
                if j < pseg.indices.len() {
                    pinned.insert(level);
                }
            }
            level += 1;
        }
    }
    pinned
}

/// One candidate member of a (possibly merged) fan-in.
struct MemberDraft {
    id: CanonicalId,
    outer: Option<(String, usize)>,
    edge_order: usize,
    leaf_order: usize,
    condition: Option<ConditionExpr>,
}

enum ResolvedEdge {
    Literal {
        id: CanonicalId,
        value: serde_json::Value,
    },
    Direct {
        id: CanonicalId,
        condition: Option<ConditionExpr>,
    },
    Members(Vec<MemberDraft>),
}

struct JobBuilder<'a> {
    graph: &'a ProducerGraph,
    inputs: &'a BTreeMap<String, serde_json::Value>,
    dims_resolved: &'a BTreeMap<String, Vec<(String, usize)>>,
    job_condition: &'a BTreeMap<String, ConditionExpr>,
    job_str: &'a str,
    dim_index: &'a BTreeMap<String, usize>,
    bindings: BTreeMap<String, CanonicalId>,
    resolved: BTreeMap<String, serde_json::Value>,
    input_conditions: BTreeMap<String, ConditionExpr>,
    fan_in: BTreeMap<String, FanIn>,
    all_inputs: BTreeSet<String>,
}

impl JobBuilder<'_> {
    fn resolve_key(&mut self, key: &str, edges: &[&Edge]) -> Result<(), PlanError> {
        let mut parts = Vec::with_capacity(edges.len());
        for edge in edges {
            parts.push((edge, self.resolve_edge(edge)?));
        }

        let is_simple = parts.len() == 1
            && matches!(
                parts[0].1,
                ResolvedEdge::Literal { .. } | ResolvedEdge::Direct { .. }
            );
        if is_simple {
            let (_, resolved) = parts.into_iter().next().expect("one part");
            match resolved {
                ResolvedEdge::Literal { id, value } => {
                    self.all_inputs.insert(id.to_string());
                    self.bindings.insert(key.to_string(), id);
                    self.resolved.insert(key.to_string(), value);
                }
                ResolvedEdge::Direct { id, condition } => {
                    self.all_inputs.insert(id.to_string());
                    self.bindings.insert(key.to_string(), id);
                    if let Some(cond) = condition {
                        self.input_conditions.insert(key.to_string(), cond);
                    }
                }
                ResolvedEdge::Members(_) => unreachable!("filtered above"),
            }
            return Ok(());
        }

        // Fan-in: merge every edge's members.
        let mut members: Vec<MemberDraft> = Vec::new();
        for (edge, resolved) in parts {
            match resolved {
                ResolvedEdge::Members(ms) => members.extend(ms),
                ResolvedEdge::Direct { id, condition } => members.push(MemberDraft {
                    id,
                    outer: None,
                    edge_order: edge.order,
                    leaf_order: 0,
                    condition,
                }),
                ResolvedEdge::Literal { .. } => {
                    return Err(PlanError::UnsatisfiedBinding {
                        job: self.job_str.to_string(),
                        input: key.to_string(),
                        reason: "literal inputs cannot join a fan-in".into(),
                    });
                }
            }
        }

        let dims: BTreeSet<&str> = members
            .iter()
            .filter_map(|m| m.outer.as_ref().map(|(n, _)| n.as_str()))
            .collect();
        let group_by = match dims.len() {
            0 => "singleton".to_string(),
            1 => {
                let dim = dims.into_iter().next().expect("one dim").to_string();
                if members.iter().any(|m| m.outer.is_none()) {
                    return Err(PlanError::AmbiguousFanIn {
                        job: self.job_str.to_string(),
                        input: key.to_string(),
                        dims: vec![dim, "singleton".into()],
                    });
                }
                dim
            }
            _ => {
                return Err(PlanError::AmbiguousFanIn {
                    job: self.job_str.to_string(),
                    input: key.to_string(),
                    dims: dims.into_iter().map(String::from).collect(),
                });
            }
        };

        members.sort_by_key(|m| {
            (
                m.outer.as_ref().map_or(0, |(_, i)| *i),
                m.edge_order,
                m.leaf_order,
            )
        });

        for m in &members {
            self.all_inputs.insert(m.id.to_string());
        }
        let order_by = (group_by != "singleton").then(|| group_by.clone());
        self.fan_in.insert(
            key.to_string(),
            FanIn {
                group_by: group_by.clone(),
                order_by,
                members: members
                    .into_iter()
                    .map(|m| FanInMember {
                        group: m
                            .outer
                            .map_or_else(|| "singleton".to_string(), |(_, i)| i.to_string()),
                        id: m.id,
                        condition: m.condition,
                    })
                    .collect(),
            },
        );
        Ok(())
    }

    fn resolve_edge(&self, edge: &Edge) -> Result<ResolvedEdge, PlanError> {
        match &edge.source {
            EdgeSource::Input { name, index } => {
                let value = self.inputs.get(name).cloned().unwrap_or(serde_json::Value::Null);
                let effective = match (index, edge.looped) {
                    (Some(k), _) => Some(*k),
                    // Looped array inputs are wired element-wise through the
                    // consumer's first dimension.
                    (None, true) => Some(self.first_dim_index(edge)?),
                    (None, false) => None,
                };
                match effective {
                    Some(k) => {
                        let arr =
                            value
                                .as_array()
                                .ok_or_else(|| PlanError::UnsatisfiedBinding {
                                    job: self.job_str.to_string(),
                                    input: edge.binding_key(),
                                    reason: format!("input `{name}` is not an array"),
                                })?;
                        let element =
                            arr.get(k).cloned().ok_or_else(|| PlanError::IndexOutOfBounds {
                                id: CanonicalId::input_element(name.clone(), k).to_string(),
                                len: arr.len(),
                            })?;
                        Ok(ResolvedEdge::Literal {
                            id: CanonicalId::input_element(name.clone(), k),
                            value: element,
                        })
                    }
                    None => Ok(ResolvedEdge::Literal {
                        id: CanonicalId::input(name.clone()),
                        value,
                    }),
                }
            }
            EdgeSource::Artifact { producer, path } => {
                let node = self.graph.node(producer).expect("edges are validated");
                let src_dims = &self.dims_resolved[producer];
                if edge.looped {
                    let (leaf, src_ixs) = self.resolve_looped_leaf(edge, node, path, src_dims)?;
                    let job_dims: Vec<(String, usize)> = src_dims
                        .iter()
                        .map(|(n, _)| n.clone())
                        .zip(src_ixs.iter().copied())
                        .collect();
                    let id = produced_id(producer, leaf, &job_dims);
                    let src_job = CanonicalId::job(producer.clone(), src_ixs).to_string();
                    Ok(ResolvedEdge::Direct {
                        id,
                        condition: self.job_condition.get(&src_job).cloned(),
                    })
                } else {
                    let leaves = node.leaves_under(path);
                    if leaves.is_empty() {
                        return Err(PlanError::UnsatisfiedBinding {
                            job: self.job_str.to_string(),
                            input: edge.binding_key(),
                            reason: format!("no outputs under `{producer}.{}`", render_path(path)),
                        });
                    }
                    let counts: Vec<usize> = src_dims.iter().map(|(_, c)| *c).collect();
                    let vectors = cartesian(&counts);
                    if vectors.len() == 1 && leaves.len() == 1 && src_dims.is_empty() {
                        let id = produced_id(producer, leaves[0], &[]);
                        let src_job = CanonicalId::job(producer.clone(), vec![]).to_string();
                        return Ok(ResolvedEdge::Direct {
                            id,
                            condition: self.job_condition.get(&src_job).cloned(),
                        });
                    }
                    let mut members = Vec::with_capacity(vectors.len() * leaves.len());
                    for vector in &vectors {
                        let job_dims: Vec<(String, usize)> = src_dims
                            .iter()
                            .map(|(n, _)| n.clone())
                            .zip(vector.iter().copied())
                            .collect();
                        let src_job = CanonicalId::job(producer.clone(), vector.clone());
                        let condition = self.job_condition.get(&src_job.to_string()).cloned();
                        for (leaf_order, leaf) in leaves.iter().enumerate() {
                            let outer = if let Some((dim, ix)) = job_dims.first() {
                                Some((dim.clone(), *ix))
                            } else {
                                leaf.dims.first().map(|(d, i)| (d.clone(), *i))
                            };
                            members.push(MemberDraft {
                                id: produced_id(producer, leaf, &job_dims),
                                outer,
                                edge_order: edge.order,
                                leaf_order,
                                condition: condition.clone(),
                            });
                        }
                    }
                    Ok(ResolvedEdge::Members(members))
                }
            }
        }
    }

    /// Pick the single source leaf a looped edge binds for this job, plus
    /// the source producer's fan-out indices derived from the consumer's
    /// dimension values.
    fn resolve_looped_leaf<'g>(
        &self,
        edge: &Edge,
        node: &'g ProducerNode,
        path: &[Segment],
        src_dims: &[(String, usize)],
    ) -> Result<(&'g LeafSpec, Vec<usize>), PlanError> {
        let mut candidates: Vec<&LeafSpec> = node.leaves_under(path);
        candidates.retain(|leaf| {
            let pinned = pinned_levels(path, leaf);
            leaf.dims.iter().enumerate().all(|(pos, (dim, ix))| {
                pinned.contains(&pos) || self.dim_index.get(dim) == Some(ix)
            })
        });
        if candidates.len() != 1 {
            return Err(PlanError::UnsatisfiedBinding {
                job: self.job_str.to_string(),
                input: edge.binding_key(),
                reason: format!(
                    "looped binding resolves to {} leaves of `{}.{}`",
                    candidates.len(),
                    node.decl.alias,
                    render_path(path)
                ),
            });
        }
        let src_ixs = src_dims
            .iter()
            .map(|(dim, _)| {
                self.dim_index.get(dim).copied().ok_or_else(|| {
                    PlanError::UnsatisfiedBinding {
                        job: self.job_str.to_string(),
                        input: edge.binding_key(),
                        reason: format!("consumer has no dimension `{dim}`"),
                    }
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok((candidates[0], src_ixs))
    }

    fn first_dim_index(&self, edge: &Edge) -> Result<usize, PlanError> {
        let node = self
            .graph
            .node(self.job_str_alias())
            .expect("builder alias is known");
        let first = node.decl.dimensions.first().ok_or_else(|| {
            PlanError::UnsatisfiedBinding {
                job: self.job_str.to_string(),
                input: edge.binding_key(),
                reason: "looped input on a producer with no dimensions".into(),
            }
        })?;
        Ok(*self
            .dim_index
            .get(&first.name)
            .expect("declared dimensions always have indices"))
    }

    fn job_str_alias(&self) -> &str {
        match self.job_str.strip_prefix("Producer:") {
            Some(rest) => rest.split('[').next().unwrap_or(rest),
            None => self.job_str,
        }
    }

    /// Rewrite a blueprint-level condition into concrete artifact ids for
    /// this job's dimension values.
    fn substitute_condition(&self, expr: &ConditionExpr) -> Result<ConditionExpr, PlanError> {
        match expr {
            ConditionExpr::When {
                artifact,
                op,
                value,
            } => {
                let segs =
                    parse_dotted_path(artifact).map_err(|_| PlanError::UnsatisfiedBinding {
                        job: self.job_str.to_string(),
                        input: artifact.clone(),
                        reason: "condition reference is not a dotted path".into(),
                    })?;
                let producer = &segs[0].name;
                let node =
                    self.graph
                        .node(producer)
                        .ok_or_else(|| PlanError::UnsatisfiedBinding {
                            job: self.job_str.to_string(),
                            input: artifact.clone(),
                            reason: format!("condition references unknown producer `{producer}`"),
                        })?;
                let src_dims = &self.dims_resolved[producer];
                let synthetic = Edge {
                    consumer: String::new(),
                    input: artifact.clone(),
                    element: None,
                    source: EdgeSource::Artifact {
                        producer: producer.clone(),
                        path: segs[1..].to_vec(),
                    },
                    looped: true,
                    order: 0,
                };
                let (leaf, src_ixs) =
                    self.resolve_looped_leaf(&synthetic, node, &segs[1..], src_dims)?;
                let job_dims: Vec<(String, usize)> = src_dims
                    .iter()
                    .map(|(n, _)| n.clone())
                    .zip(src_ixs)
                    .collect();
                Ok(ConditionExpr::When {
                    artifact: produced_id(producer, leaf, &job_dims).to_string(),
                    op: *op,
                    value: value.clone(),
                })
            }
            ConditionExpr::Any(children) => Ok(ConditionExpr::Any(
                children
                    .iter()
                    .map(|c| self.substitute_condition(c))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
            ConditionExpr::All(children) => Ok(ConditionExpr::All(
                children
                    .iter()
                    .map(|c| self.substitute_condition(c))
                    .collect::<Result<Vec<_>, _>>()?,
            )),
        }
    }
}

fn render_path(path: &[Segment]) -> String {
    path.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(".")
}

/// Stable digest of everything that influences a job's output.
fn inputs_hash(context: &JobContext, options: &PlannerOptions) -> Result<String, PlanError> {
    let schema_fingerprint = |schema: &Option<serde_json::Value>| -> Result<Option<String>, PlanError> {
        schema
            .as_ref()
            .map(|s| {
                reel_core::canonical_json(s)
                    .map(|c| reel_core::sha256_hex(c.as_bytes()))
                    .map_err(|e| PlanError::Hashing(e.to_string()))
            })
            .transpose()
    };

    let doc = serde_json::json!({
        "provider": context.provider,
        "model": context.model,
        "mode": options.mode,
        "bindings": context.input_bindings,
        "resolved": context.resolved_inputs,
        "condition": context.condition,
        "input_conditions": context.input_conditions,
        "fan_in": context.fan_in,
        "sdk_mapping": context.sdk_mapping,
        "schema": {
            "input": schema_fingerprint(&context.schema.input)?,
            "output": schema_fingerprint(&context.schema.output)?,
        },
        "extras": context.extras,
    });
    let canonical =
        reel_core::canonical_json(&doc).map_err(|e| PlanError::Hashing(e.to_string()))?;
    Ok(reel_core::sha256_hex(canonical.as_bytes()))
}
