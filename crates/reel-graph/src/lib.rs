// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Output-schema expansion into leaf artifact sets.
pub mod schema;

use reel_core::{BlueprintTree, CanonicalId, ProducerDecl, Segment, parse_dotted_path};
use reel_error::{ErrorCode, ForgeError};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use tracing::debug;

pub use schema::{LeafSpec, expand_leaves};

/// Errors from graph compilation. All fatal for the run.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum GraphError {
    /// Two producers share an alias.
    #[error("duplicate producer alias `{0}`")]
    DuplicateAlias(String),

    /// Two inputs share a name.
    #[error("duplicate input `{0}`")]
    DuplicateInput(String),

    /// A connection's consumer side references an unknown producer.
    #[error("connection `{connection}` names unknown consumer `{alias}`")]
    UnknownConsumer {
        /// The offending connection string.
        connection: String,
        /// The alias that failed to resolve.
        alias: String,
    },

    /// A connection's source resolves to neither an input nor a producer.
    #[error("connection `{connection}` names unknown source `{source_name}`")]
    UnknownSource {
        /// The offending connection string.
        connection: String,
        /// The source that failed to resolve.
        source_name: String,
    },

    /// A connection's source path does not match any output of the producer.
    #[error("producer `{producer}` has no output at `{path}`")]
    UnknownOutput {
        /// The source producer.
        producer: String,
        /// The path that failed to resolve.
        path: String,
    },

    /// A connection string could not be parsed.
    #[error("malformed connection `{connection}`: {reason}")]
    MalformedConnection {
        /// The offending connection string.
        connection: String,
        /// Parse error detail.
        reason: String,
    },

    /// An output-schema array lacks a static size.
    #[error("producer `{producer}`: array field `{field}` has no maxItems")]
    UnsizedArray {
        /// Producer whose schema is at fault.
        producer: String,
        /// The unsized array field.
        field: String,
    },

    /// An output schema is structurally invalid.
    #[error("producer `{producer}`: {reason}")]
    InvalidSchema {
        /// Producer whose schema is at fault.
        producer: String,
        /// What was wrong.
        reason: String,
    },

    /// The producer graph contains a cycle.
    #[error("producer graph has a cycle through `{alias}`")]
    Cycle {
        /// One alias on the cycle.
        alias: String,
    },

    /// A condition references an artifact no producer emits.
    #[error("producer `{producer}` condition references unknown artifact `{artifact}`")]
    UnknownCondition {
        /// Producer declaring the condition.
        producer: String,
        /// The reference that failed to resolve.
        artifact: String,
    },
}

impl From<GraphError> for ForgeError {
    fn from(err: GraphError) -> Self {
        let code = match &err {
            GraphError::Cycle { .. } => ErrorCode::PlanCycle,
            GraphError::UnsizedArray { .. } => ErrorCode::PlanUnsizedArray,
            GraphError::UnknownCondition { .. } => ErrorCode::PlanUnknownCondition,
            GraphError::MalformedConnection { .. } | GraphError::InvalidSchema { .. } => {
                ErrorCode::PlanUnknownReference
            }
            _ => ErrorCode::PlanUnknownReference,
        };
        ForgeError::new(code, err.to_string())
    }
}

/// Where a consumer edge reads from.
#[derive(Debug, Clone, PartialEq)]
pub enum EdgeSource {
    /// A blueprint input, optionally one element of an array input.
    Input {
        /// Input name.
        name: String,
        /// Element index for array inputs.
        index: Option<usize>,
    },
    /// A producer output subtree.
    Artifact {
        /// Source producer alias.
        producer: String,
        /// Output path below the producer; indices optional.
        path: Vec<Segment>,
    },
}

/// One resolved, typed connection.
#[derive(Debug, Clone, PartialEq)]
pub struct Edge {
    /// Consumer producer alias.
    pub consumer: String,
    /// Consumer input name.
    pub input: String,
    /// Element index when the connection wires into `input[k]`.
    pub element: Option<usize>,
    /// Resolved source.
    pub source: EdgeSource,
    /// True when the consumer loops (one job per source index).
    pub looped: bool,
    /// Declaration order, used for deterministic fan-in member ordering.
    pub order: usize,
}

impl Edge {
    /// The binding key this edge resolves into (`input` or `input[k]`).
    #[must_use]
    pub fn binding_key(&self) -> String {
        match self.element {
            Some(k) => format!("{}[{k}]", self.input),
            None => self.input.clone(),
        }
    }
}

/// One compiled producer with its leaf artifact set.
#[derive(Debug, Clone)]
pub struct ProducerNode {
    /// The declaration this node was compiled from.
    pub decl: ProducerDecl,
    /// Leaf artifact set expanded from the output schema.
    pub leaves: Vec<LeafSpec>,
}

impl ProducerNode {
    /// The leaves under a path prefix, in schema order.
    #[must_use]
    pub fn leaves_under(&self, prefix: &[Segment]) -> Vec<&LeafSpec> {
        self.leaves
            .iter()
            .filter(|l| l.matches_prefix(prefix))
            .collect()
    }
}

/// A virtual-artifact index entry: which producer owns a leaf, at what path.
#[derive(Debug, Clone, PartialEq)]
pub struct VirtualArtifact {
    /// Owning producer alias.
    pub producer: String,
    /// JSON path of the leaf below the producer.
    pub json_path: String,
}

/// The compiled producer graph: checked nodes, a typed edge table, a
/// deterministic topological order, and the virtual-artifact index.
#[derive(Debug, Clone)]
pub struct ProducerGraph {
    /// The blueprint the graph was compiled from.
    pub blueprint: BlueprintTree,
    /// Compiled producers, keyed by alias.
    pub nodes: BTreeMap<String, ProducerNode>,
    /// Typed edges in declaration order.
    pub edges: Vec<Edge>,
    /// Aliases in deterministic topological order.
    pub topo_order: Vec<String>,
    /// Leaf artifact id → owning producer and JSON path.
    pub virtual_index: BTreeMap<String, VirtualArtifact>,
}

impl ProducerGraph {
    /// Look up a compiled producer by alias.
    #[must_use]
    pub fn node(&self, alias: &str) -> Option<&ProducerNode> {
        self.nodes.get(alias)
    }

    /// The consumer edges of one producer, in declaration order.
    pub fn edges_for(&self, consumer: &str) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.consumer == consumer)
    }

    /// The aliases a producer directly depends on.
    #[must_use]
    pub fn upstream_of(&self, consumer: &str) -> BTreeSet<String> {
        self.edges_for(consumer)
            .filter_map(|e| match &e.source {
                EdgeSource::Artifact { producer, .. } => Some(producer.clone()),
                EdgeSource::Input { .. } => None,
            })
            .collect()
    }
}

/// Compile a validated blueprint tree into a [`ProducerGraph`].
///
/// # Errors
///
/// Every [`GraphError`] variant; all are fatal for the run.
pub fn build(blueprint: &BlueprintTree) -> Result<ProducerGraph, GraphError> {
    // Uniqueness of aliases and input names.
    let mut aliases = BTreeSet::new();
    for p in &blueprint.producers {
        if !aliases.insert(p.alias.clone()) {
            return Err(GraphError::DuplicateAlias(p.alias.clone()));
        }
    }
    let mut input_names = BTreeSet::new();
    for i in &blueprint.inputs {
        if !input_names.insert(i.name.clone()) {
            return Err(GraphError::DuplicateInput(i.name.clone()));
        }
    }

    // Leaf artifact sets.
    let mut nodes = BTreeMap::new();
    for decl in &blueprint.producers {
        let leaves = expand_leaves(&decl.alias, &decl.output_schema)?;
        nodes.insert(
            decl.alias.clone(),
            ProducerNode {
                decl: decl.clone(),
                leaves,
            },
        );
    }

    // Connections → typed edges.
    let mut edges = Vec::with_capacity(blueprint.connections.len());
    for (order, conn) in blueprint.connections.iter().enumerate() {
        let connection = format!("{} <- {}", conn.consumer, conn.source);
        let malformed = |reason: &str| GraphError::MalformedConnection {
            connection: connection.clone(),
            reason: reason.to_string(),
        };

        let (alias, input_part) = conn
            .consumer
            .split_once('.')
            .ok_or_else(|| malformed("consumer side needs `Alias.Input`"))?;
        if !nodes.contains_key(alias) {
            return Err(GraphError::UnknownConsumer {
                connection,
                alias: alias.to_string(),
            });
        }
        let input_segs =
            parse_dotted_path(input_part).map_err(|e| malformed(&e.to_string()))?;
        if input_segs.len() != 1 {
            return Err(malformed("consumer input cannot be a dotted path"));
        }
        let (input, element) = match input_segs[0].indices.as_slice() {
            [] => (input_segs[0].name.clone(), None),
            [reel_core::Index::Ordinal(k)] => (input_segs[0].name.clone(), Some(*k)),
            _ => return Err(malformed("consumer input index must be a single ordinal")),
        };

        let source_segs =
            parse_dotted_path(&conn.source).map_err(|e| malformed(&e.to_string()))?;
        let head = &source_segs[0];
        let source = if input_names.contains(&head.name) {
            if source_segs.len() != 1 {
                return Err(malformed("input sources cannot have a dotted path"));
            }
            let index = match head.indices.as_slice() {
                [] => None,
                [reel_core::Index::Ordinal(k)] => Some(*k),
                _ => return Err(malformed("input index must be a single ordinal")),
            };
            EdgeSource::Input {
                name: head.name.clone(),
                index,
            }
        } else if let Some(node) = nodes.get(&head.name) {
            if !head.indices.is_empty() {
                return Err(malformed("source producer alias cannot be indexed"));
            }
            if source_segs.len() < 2 {
                return Err(malformed("producer sources need an output path"));
            }
            let path = source_segs[1..].to_vec();
            if node.leaves_under(&path).is_empty() {
                return Err(GraphError::UnknownOutput {
                    producer: head.name.clone(),
                    path: path
                        .iter()
                        .map(ToString::to_string)
                        .collect::<Vec<_>>()
                        .join("."),
                });
            }
            EdgeSource::Artifact {
                producer: head.name.clone(),
                path,
            }
        } else {
            return Err(GraphError::UnknownSource {
                connection,
                source_name: head.name.clone(),
            });
        };

        edges.push(Edge {
            consumer: alias.to_string(),
            input,
            element,
            source,
            looped: conn.looped,
            order,
        });
    }

    // Conditions must reference known producer outputs.
    for decl in &blueprint.producers {
        if let Some(cond) = &decl.condition {
            for reference in cond.referenced_artifacts() {
                validate_condition_ref(&nodes, &decl.alias, reference)?;
            }
        }
    }

    let topo_order = topo_sort(&nodes, &edges)?;
    debug!(target: "reel.graph", producers = nodes.len(), edges = edges.len(), "graph compiled");

    // Virtual-artifact index over every leaf.
    let mut virtual_index = BTreeMap::new();
    for (alias, node) in &nodes {
        for leaf in &node.leaves {
            let id = CanonicalId::artifact(alias.clone(), leaf.path.clone());
            virtual_index.insert(
                id.to_string(),
                VirtualArtifact {
                    producer: alias.clone(),
                    json_path: leaf.json_path(),
                },
            );
        }
    }

    Ok(ProducerGraph {
        blueprint: blueprint.clone(),
        nodes,
        edges,
        topo_order,
        virtual_index,
    })
}

fn validate_condition_ref(
    nodes: &BTreeMap<String, ProducerNode>,
    declaring: &str,
    reference: &str,
) -> Result<(), GraphError> {
    let unknown = || GraphError::UnknownCondition {
        producer: declaring.to_string(),
        artifact: reference.to_string(),
    };
    let segs = parse_dotted_path(reference).map_err(|_| unknown())?;
    if segs.len() < 2 {
        return Err(unknown());
    }
    let node = nodes.get(&segs[0].name).ok_or_else(unknown)?;
    if node.leaves_under(&segs[1..]).is_empty() {
        return Err(unknown());
    }
    Ok(())
}

/// Kahn's algorithm with an ordered ready set, so the produced order is
/// deterministic for identical blueprints.
fn topo_sort(
    nodes: &BTreeMap<String, ProducerNode>,
    edges: &[Edge],
) -> Result<Vec<String>, GraphError> {
    let mut indegree: BTreeMap<&str, usize> = nodes.keys().map(|a| (a.as_str(), 0)).collect();
    let mut downstream: BTreeMap<&str, BTreeSet<&str>> = BTreeMap::new();
    for edge in edges {
        if let EdgeSource::Artifact { producer, .. } = &edge.source {
            if downstream
                .entry(producer.as_str())
                .or_default()
                .insert(edge.consumer.as_str())
            {
                *indegree.entry(edge.consumer.as_str()).or_default() += 1;
            }
        }
    }

    let mut ready: VecDeque<&str> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(a, _)| *a)
        .collect();
    let mut order = Vec::with_capacity(nodes.len());
    while let Some(alias) = ready.pop_front() {
        order.push(alias.to_string());
        if let Some(consumers) = downstream.get(alias) {
            for consumer in consumers {
                let d = indegree.get_mut(consumer).expect("known consumer");
                *d -= 1;
                if *d == 0 {
                    // Keep the ready queue sorted for determinism.
                    let pos = ready.iter().position(|r| *r > *consumer).unwrap_or(ready.len());
                    ready.insert(pos, consumer);
                }
            }
        }
    }

    if order.len() != nodes.len() {
        let stuck = indegree
            .iter()
            .find(|(_, d)| **d > 0)
            .map(|(a, _)| (*a).to_string())
            .unwrap_or_default();
        return Err(GraphError::Cycle { alias: stuck });
    }
    Ok(order)
}
