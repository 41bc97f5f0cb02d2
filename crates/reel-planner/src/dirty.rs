// SPDX-License-Identifier: MIT OR Apache-2.0
//! Dirty-set computation for incremental rebuilds.

use crate::PlannerOptions;
use crate::jobs::Expansion;
use reel_core::{ArtifactStatus, CanonicalId, Manifest};
use std::collections::BTreeSet;
use tracing::debug;

/// Which jobs must run to restore consistency between inputs and artifacts.
///
/// A job is dirty when it has never produced, when its inputs hash drifted,
/// when its prior attempt failed, when it sits strictly downstream of a
/// dirty job, or when it consumes an overridden leaf. Overrides never dirty
/// the producer of the leaf itself; sibling leaves stay clean.
pub(crate) fn compute(
    expansion: &Expansion,
    prior: Option<&Manifest>,
    options: &PlannerOptions,
    override_ids: &[CanonicalId],
) -> BTreeSet<String> {
    let mut dirty: BTreeSet<String> = BTreeSet::new();
    let mut dirty_artifacts: BTreeSet<String> = BTreeSet::new();

    for job in &expansion.jobs {
        let job_str = job.job_id.to_string();
        let mut is_dirty = match prior {
            None => true,
            Some(prior) => job.produces.iter().any(|p| {
                match prior.artifact(&p.to_string()) {
                    None => true,
                    Some(ev) => {
                        ev.inputs_hash != job.context.inputs_hash
                            || ev.status == ArtifactStatus::Failed
                    }
                }
            }),
        };

        if let Some(from) = options.re_run_from {
            if job.layer >= from {
                is_dirty = true;
            }
        }

        if !is_dirty {
            is_dirty = job.inputs.iter().any(|input| {
                dirty_artifacts.contains(&input.to_string())
                    || override_ids.iter().any(|o| o.overlaps(input))
            });
        }

        if is_dirty {
            dirty.insert(job_str);
            for p in &job.produces {
                dirty_artifacts.insert(p.to_string());
            }
        }
    }

    if let Some(target) = &options.target_artifact_id {
        let downstream = downstream_jobs(expansion, target);
        dirty.retain(|j| downstream.contains(j));
    }

    debug!(target: "reel.planner", dirty = dirty.len(), total = expansion.jobs.len(), "dirty set");
    dirty
}

/// Jobs transitively downstream of an artifact (consumers, their consumers,
/// and so on — never the artifact's own producer).
fn downstream_jobs(expansion: &Expansion, target: &CanonicalId) -> BTreeSet<String> {
    let mut jobs = BTreeSet::new();
    let mut artifacts: BTreeSet<String> = BTreeSet::new();
    for job in &expansion.jobs {
        let hit = job.inputs.iter().any(|input| {
            input.overlaps(target) || artifacts.contains(&input.to_string())
        });
        if hit {
            jobs.insert(job.job_id.to_string());
            for p in &job.produces {
                artifacts.insert(p.to_string());
            }
        }
    }
    jobs
}
