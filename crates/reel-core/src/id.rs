// SPDX-License-Identifier: MIT OR Apache-2.0
//! Canonical identifier grammar.
//!
//! Three kinds of stable string IDs, each beginning with a kind prefix:
//!
//! - `Input:<path>` — a blueprint-level input, optionally indexed.
//! - `Artifact:<Producer>.<OutputPath>` — a producer output; the path may
//!   carry ordinal `[n]` and named `[dim=v]` indices, nested arbitrarily.
//! - `Producer:<Alias>[i0][i1]` — a producer node, indexed per fan-out
//!   dimension to name a concrete job.
//!
//! IDs are canonicalized at construction; comparisons are bytewise over the
//! canonical rendering. Ordinal indices are zero-based.

use schemars::{JsonSchema, Schema, SchemaGenerator};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::str::FromStr;

/// Errors raised while parsing or constructing a [`CanonicalId`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The string has no `Kind:` prefix or an unknown kind.
    #[error("unknown id kind in `{0}`")]
    UnknownKind(String),
    /// A path segment or index is malformed.
    #[error("malformed id `{id}`: {reason}")]
    Malformed {
        /// The offending input string.
        id: String,
        /// What was wrong with it.
        reason: String,
    },
}

impl From<IdError> for reel_error::ForgeError {
    fn from(err: IdError) -> Self {
        reel_error::ForgeError::new(reel_error::ErrorCode::InputInvalid, err.to_string())
    }
}

/// A single index applied to a path segment: ordinal `[3]` or named
/// `[character=2]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Index {
    /// Zero-based position in an array dimension.
    Ordinal(usize),
    /// A named dimension with a value, e.g. `[segment=0]`.
    Named {
        /// Dimension name.
        dim: String,
        /// Index value within the dimension.
        value: String,
    },
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Index::Ordinal(n) => write!(f, "[{n}]"),
            Index::Named { dim, value } => write!(f, "[{dim}={value}]"),
        }
    }
}

/// A dotted-path segment with zero or more indices, e.g. `Segments[0]`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Segment {
    /// Field name.
    pub name: String,
    /// Indices applied to the field, outermost first.
    pub indices: Vec<Index>,
}

impl Segment {
    /// A bare segment with no indices.
    #[must_use]
    pub fn bare(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            indices: Vec::new(),
        }
    }

    /// A segment with a single ordinal index.
    #[must_use]
    pub fn indexed(name: impl Into<String>, index: usize) -> Self {
        Self {
            name: name.into(),
            indices: vec![Index::Ordinal(index)],
        }
    }

    /// True when `self` is an index-prefix of `other` with the same name:
    /// `Segments` prefixes `Segments[0]`, `Segments[0]` prefixes itself.
    #[must_use]
    pub fn prefixes(&self, other: &Segment) -> bool {
        self.name == other.name
            && self.indices.len() <= other.indices.len()
            && self.indices == other.indices[..self.indices.len()]
    }
}

impl fmt::Display for Segment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        for ix in &self.indices {
            write!(f, "{ix}")?;
        }
        Ok(())
    }
}

/// The kind discriminator of a [`CanonicalId`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdKind {
    /// A blueprint-level input.
    Input,
    /// A produced (possibly virtual) artifact.
    Artifact,
    /// A producer node or concrete job.
    Producer,
}

/// A canonical identifier. See the module docs for the grammar.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum CanonicalId {
    /// `Input:<path>`
    Input {
        /// Dotted path, usually a single segment.
        path: Vec<Segment>,
    },
    /// `Artifact:<Producer>.<OutputPath>`
    Artifact {
        /// Alias of the producer that owns the output.
        producer: String,
        /// Output path below the producer, never empty.
        path: Vec<Segment>,
    },
    /// `Producer:<Alias>[i0][i1]...`
    Producer {
        /// Producer alias.
        alias: String,
        /// Fan-out dimension index vector; empty for unlooped producers.
        indices: Vec<usize>,
    },
}

impl CanonicalId {
    /// An unindexed input id.
    #[must_use]
    pub fn input(name: impl Into<String>) -> Self {
        Self::Input {
            path: vec![Segment::bare(name)],
        }
    }

    /// An input id addressing one element of an array input.
    #[must_use]
    pub fn input_element(name: impl Into<String>, index: usize) -> Self {
        Self::Input {
            path: vec![Segment::indexed(name, index)],
        }
    }

    /// An artifact id from a producer alias and output path segments.
    #[must_use]
    pub fn artifact(producer: impl Into<String>, path: Vec<Segment>) -> Self {
        Self::Artifact {
            producer: producer.into(),
            path,
        }
    }

    /// The job id for a producer under a dimension index vector.
    #[must_use]
    pub fn job(alias: impl Into<String>, indices: Vec<usize>) -> Self {
        Self::Producer {
            alias: alias.into(),
            indices,
        }
    }

    /// The kind discriminator.
    #[must_use]
    pub fn kind(&self) -> IdKind {
        match self {
            Self::Input { .. } => IdKind::Input,
            Self::Artifact { .. } => IdKind::Artifact,
            Self::Producer { .. } => IdKind::Producer,
        }
    }

    /// The producer alias, for artifact and producer ids.
    #[must_use]
    pub fn producer_alias(&self) -> Option<&str> {
        match self {
            Self::Artifact { producer, .. } => Some(producer),
            Self::Producer { alias, .. } => Some(alias),
            Self::Input { .. } => None,
        }
    }

    /// True when `self` addresses the same node as `other` or an enclosing
    /// subtree of it: `Artifact:Doc.Segments[0]` contains
    /// `Artifact:Doc.Segments[0].ImagePrompts[1]`.
    #[must_use]
    pub fn contains(&self, other: &CanonicalId) -> bool {
        match (self, other) {
            (Self::Input { path: a }, Self::Input { path: b }) => path_prefixes(a, b),
            (
                Self::Artifact {
                    producer: pa,
                    path: a,
                },
                Self::Artifact {
                    producer: pb,
                    path: b,
                },
            ) => pa == pb && path_prefixes(a, b),
            _ => false,
        }
    }

    /// True when the two ids address overlapping subtrees (either contains
    /// the other). Used for override invalidation.
    #[must_use]
    pub fn overlaps(&self, other: &CanonicalId) -> bool {
        self.contains(other) || other.contains(self)
    }

    /// The canonical string rendering.
    #[must_use]
    pub fn canonical(&self) -> String {
        self.to_string()
    }
}

fn path_prefixes(prefix: &[Segment], path: &[Segment]) -> bool {
    if prefix.is_empty() || prefix.len() > path.len() {
        return prefix.is_empty() && !path.is_empty();
    }
    let (last, head) = prefix.split_last().expect("non-empty prefix");
    head.iter().zip(path).all(|(a, b)| a == b) && last.prefixes(&path[prefix.len() - 1])
}

impl fmt::Display for CanonicalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input { path } => {
                f.write_str("Input:")?;
                write_path(f, path)
            }
            Self::Artifact { producer, path } => {
                write!(f, "Artifact:{producer}.")?;
                write_path(f, path)
            }
            Self::Producer { alias, indices } => {
                write!(f, "Producer:{alias}")?;
                for ix in indices {
                    write!(f, "[{ix}]")?;
                }
                Ok(())
            }
        }
    }
}

fn write_path(f: &mut fmt::Formatter<'_>, path: &[Segment]) -> fmt::Result {
    for (i, seg) in path.iter().enumerate() {
        if i > 0 {
            f.write_str(".")?;
        }
        write!(f, "{seg}")?;
    }
    Ok(())
}

// Bytewise ordering over the canonical rendering, per the id invariants.
impl PartialOrd for CanonicalId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CanonicalId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_string().cmp(&other.to_string())
    }
}

impl From<CanonicalId> for String {
    fn from(id: CanonicalId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for CanonicalId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl FromStr for CanonicalId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (kind, rest) = s
            .split_once(':')
            .ok_or_else(|| IdError::UnknownKind(s.to_string()))?;
        match kind {
            "Input" => Ok(Self::Input {
                path: parse_path(s, rest)?,
            }),
            "Artifact" => {
                let path = parse_path(s, rest)?;
                if path.len() < 2 {
                    return Err(IdError::Malformed {
                        id: s.to_string(),
                        reason: "artifact ids need `Producer.OutputPath`".into(),
                    });
                }
                let producer = &path[0];
                if !producer.indices.is_empty() {
                    return Err(IdError::Malformed {
                        id: s.to_string(),
                        reason: "producer alias cannot be indexed".into(),
                    });
                }
                Ok(Self::Artifact {
                    producer: producer.name.clone(),
                    path: path[1..].to_vec(),
                })
            }
            "Producer" => {
                let path = parse_path(s, rest)?;
                if path.len() != 1 {
                    return Err(IdError::Malformed {
                        id: s.to_string(),
                        reason: "producer ids are a single segment".into(),
                    });
                }
                let seg = &path[0];
                let mut indices = Vec::with_capacity(seg.indices.len());
                for ix in &seg.indices {
                    match ix {
                        Index::Ordinal(n) => indices.push(*n),
                        Index::Named { .. } => {
                            return Err(IdError::Malformed {
                                id: s.to_string(),
                                reason: "job indices are ordinal".into(),
                            });
                        }
                    }
                }
                Ok(Self::Producer {
                    alias: seg.name.clone(),
                    indices,
                })
            }
            _ => Err(IdError::UnknownKind(s.to_string())),
        }
    }
}

/// Parse a bare dotted path with bracket indices, e.g.
/// `Segments[0].ImagePrompt`. Used for connection and condition strings
/// that are not full canonical ids.
///
/// # Errors
///
/// Returns [`IdError::Malformed`] on syntax errors.
pub fn parse_dotted_path(s: &str) -> Result<Vec<Segment>, IdError> {
    parse_path(s, s)
}

/// Parse a dotted path with bracket indices. `full` is the whole id string,
/// used only for error reporting.
pub(crate) fn parse_path(full: &str, rest: &str) -> Result<Vec<Segment>, IdError> {
    let malformed = |reason: &str| IdError::Malformed {
        id: full.to_string(),
        reason: reason.to_string(),
    };

    if rest.is_empty() {
        return Err(malformed("empty path"));
    }

    let mut segments = Vec::new();
    let mut name = String::new();
    let mut indices: Vec<Index> = Vec::new();
    let mut chars = rest.chars();

    let flush = |name: &mut String, indices: &mut Vec<Index>, segments: &mut Vec<Segment>| {
        if name.is_empty() {
            return Err(());
        }
        segments.push(Segment {
            name: std::mem::take(name),
            indices: std::mem::take(indices),
        });
        Ok(())
    };

    while let Some(c) = chars.next() {
        match c {
            '.' => {
                flush(&mut name, &mut indices, &mut segments)
                    .map_err(|()| malformed("empty segment name"))?;
            }
            '[' => {
                let mut body = String::new();
                loop {
                    match chars.next() {
                        Some(']') => break,
                        Some(ch) => body.push(ch),
                        None => return Err(malformed("unterminated index")),
                    }
                }
                if name.is_empty() {
                    return Err(malformed("index without a segment name"));
                }
                let ix = if let Some((dim, value)) = body.split_once('=') {
                    if dim.is_empty() || value.is_empty() {
                        return Err(malformed("named index needs `dim=value`"));
                    }
                    Index::Named {
                        dim: dim.to_string(),
                        value: value.to_string(),
                    }
                } else {
                    Index::Ordinal(
                        body.parse()
                            .map_err(|_| malformed("ordinal index is not a number"))?,
                    )
                };
                indices.push(ix);
            }
            ']' => return Err(malformed("unbalanced `]`")),
            ':' => return Err(malformed("`:` not allowed in paths")),
            _ => {
                if !indices.is_empty() {
                    return Err(malformed("segment name after index"));
                }
                name.push(c);
            }
        }
    }
    flush(&mut name, &mut indices, &mut segments)
        .map_err(|()| malformed("empty segment name"))?;
    Ok(segments)
}

impl JsonSchema for CanonicalId {
    fn schema_name() -> Cow<'static, str> {
        Cow::Borrowed("CanonicalId")
    }

    fn json_schema(generator: &mut SchemaGenerator) -> Schema {
        String::json_schema(generator)
    }

    fn inline_schema() -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn parses_simple_input() {
        let id: CanonicalId = "Input:Topic".parse().unwrap();
        assert_eq!(id, CanonicalId::input("Topic"));
        assert_eq!(id.to_string(), "Input:Topic");
    }

    #[test]
    fn parses_indexed_input() {
        let id: CanonicalId = "Input:CelebrityThenImages[2]".parse().unwrap();
        assert_eq!(id, CanonicalId::input_element("CelebrityThenImages", 2));
    }

    #[test]
    fn parses_nested_artifact() {
        let id: CanonicalId = "Artifact:DocProducer.Segments[0].ImagePrompts[1]"
            .parse()
            .unwrap();
        match &id {
            CanonicalId::Artifact { producer, path } => {
                assert_eq!(producer, "DocProducer");
                assert_eq!(path.len(), 2);
                assert_eq!(path[0], Segment::indexed("Segments", 0));
                assert_eq!(path[1], Segment::indexed("ImagePrompts", 1));
            }
            other => panic!("expected artifact, got {other:?}"),
        }
        assert_eq!(
            id.to_string(),
            "Artifact:DocProducer.Segments[0].ImagePrompts[1]"
        );
    }

    #[test]
    fn parses_named_dimension() {
        let id: CanonicalId = "Artifact:MeetingVideo.Video[character=2]".parse().unwrap();
        assert_eq!(id.to_string(), "Artifact:MeetingVideo.Video[character=2]");
    }

    #[test]
    fn parses_job_ids() {
        let id: CanonicalId = "Producer:ImageProducer[0][1]".parse().unwrap();
        assert_eq!(id, CanonicalId::job("ImageProducer", vec![0, 1]));
        let id: CanonicalId = "Producer:DocProducer".parse().unwrap();
        assert_eq!(id, CanonicalId::job("DocProducer", vec![]));
    }

    #[test]
    fn rejects_garbage() {
        assert!("Topic".parse::<CanonicalId>().is_err());
        assert!("Widget:Topic".parse::<CanonicalId>().is_err());
        assert!("Artifact:OnlyProducer".parse::<CanonicalId>().is_err());
        assert!("Input:A[".parse::<CanonicalId>().is_err());
        assert!("Input:A[x]".parse::<CanonicalId>().is_err());
        assert!("Input:A[=1]".parse::<CanonicalId>().is_err());
        assert!("Producer:A[b=1]".parse::<CanonicalId>().is_err());
        assert!("Input:".parse::<CanonicalId>().is_err());
    }

    #[test]
    fn subtree_containment() {
        let parent: CanonicalId = "Artifact:Doc.Segments[0]".parse().unwrap();
        let leaf: CanonicalId = "Artifact:Doc.Segments[0].ImagePrompts[1]".parse().unwrap();
        let sibling: CanonicalId = "Artifact:Doc.Segments[1].ImagePrompts[1]".parse().unwrap();
        let collection: CanonicalId = "Artifact:Doc.Segments".parse().unwrap();

        assert!(parent.contains(&leaf));
        assert!(!leaf.contains(&parent));
        assert!(parent.overlaps(&leaf) && leaf.overlaps(&parent));
        assert!(!parent.overlaps(&sibling));
        assert!(collection.contains(&parent));
        assert!(collection.contains(&leaf));
        assert!(collection.contains(&sibling));
    }

    #[test]
    fn ordering_is_bytewise_over_canonical_form() {
        let mut ids: Vec<CanonicalId> = vec![
            "Producer:B".parse().unwrap(),
            "Artifact:A.Out".parse().unwrap(),
            "Input:Z".parse().unwrap(),
            "Artifact:A.Out[0]".parse().unwrap(),
        ];
        ids.sort();
        let rendered: Vec<String> = ids.iter().map(ToString::to_string).collect();
        let mut expected = rendered.clone();
        expected.sort();
        assert_eq!(rendered, expected);
    }

    #[test]
    fn serde_uses_the_canonical_string() {
        let id: CanonicalId = "Artifact:Doc.Segments[0].ImagePrompt".parse().unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"Artifact:Doc.Segments[0].ImagePrompt\"");
        let back: CanonicalId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    proptest! {
        #[test]
        fn display_parse_round_trip(
            alias in "[A-Za-z][A-Za-z0-9_]{0,8}",
            field in "[A-Za-z][A-Za-z0-9_]{0,8}",
            i in 0usize..16,
            j in 0usize..16,
        ) {
            let id = CanonicalId::artifact(
                alias,
                vec![Segment::indexed(field, i), Segment::indexed("Leaf", j)],
            );
            let parsed: CanonicalId = id.to_string().parse().unwrap();
            prop_assert_eq!(parsed, id);
        }
    }
}
