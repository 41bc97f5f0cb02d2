// SPDX-License-Identifier: MIT OR Apache-2.0
//! The top-level build facade: plan, persist, execute.

use crate::{BuildSummary, Executor, RuntimeError};
use chrono::Utc;
use reel_config::{ForgeConfig, OverrideValue, RunOptions};
use reel_core::{BlueprintTree, CancellationToken, Plan};
use reel_error::ForgeError;
use reel_planner::{OverridePayload, PlannerOptions};
use reel_provider::HandlerRegistry;
use reel_store::FsArtifactStore;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Estimated work for a plan, reported by `costs_only` runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostEstimate {
    /// Total planned jobs.
    pub job_count: usize,
    /// Planned jobs per provider.
    pub by_provider: BTreeMap<String, usize>,
}

impl CostEstimate {
    fn for_plan(plan: &Plan) -> Self {
        let mut by_provider = BTreeMap::new();
        for job in plan.jobs() {
            *by_provider.entry(job.context.provider.clone()).or_insert(0) += 1;
        }
        Self {
            job_count: plan.job_count(),
            by_provider,
        }
    }
}

/// What a build invocation produced.
#[derive(Debug, Clone)]
pub struct BuildReport {
    /// The computed plan.
    pub plan: Plan,
    /// Where the plan was persisted.
    pub plan_path: PathBuf,
    /// Execution summary; `None` for dry and costs-only runs.
    pub summary: Option<BuildSummary>,
    /// Cost estimate; `Some` for costs-only runs.
    pub costs: Option<CostEstimate>,
}

/// Ties the store, planner, and executor together for one movie.
pub struct Forge {
    store: Arc<FsArtifactStore>,
    handlers: HandlerRegistry,
    config: ForgeConfig,
}

impl Forge {
    /// Build a facade over a store, handler registry, and configuration.
    #[must_use]
    pub fn new(store: Arc<FsArtifactStore>, handlers: HandlerRegistry, config: ForgeConfig) -> Self {
        Self {
            store,
            handlers,
            config,
        }
    }

    /// The underlying artifact store.
    #[must_use]
    pub fn store(&self) -> &Arc<FsArtifactStore> {
        &self.store
    }

    /// Plan and (unless dry) execute a build for the given blueprint and
    /// inputs, against whatever manifest the store currently holds.
    ///
    /// # Errors
    ///
    /// Planning errors abort before any job runs; storage conflicts at the
    /// final manifest save surface as `STORAGE_CONFLICT` and call for a
    /// re-plan.
    pub async fn build(
        &self,
        blueprint: &BlueprintTree,
        inputs: &BTreeMap<String, serde_json::Value>,
        run: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<BuildReport, ForgeError> {
        let graph = reel_graph::build(blueprint)?;
        let prior = self.store.load_manifest()?;
        let prompt_overrides = self.store.prompt_overrides()?;

        let mut overrides = BTreeMap::new();
        for (key, value) in &run.overrides {
            overrides.insert(key.clone(), resolve_override(value)?);
        }

        let options = PlannerOptions {
            mode: self.config.mode,
            up_to_layer: run.up_to_layer,
            re_run_from: run.re_run_from,
            target_artifact_id: run.target_artifact_id.clone(),
            overrides,
            prompt_overrides,
        };
        let outcome = reel_planner::plan(&graph, inputs, prior.as_ref(), &options)?;

        let label = Utc::now().format("%Y%m%dT%H%M%S%3f").to_string();
        let plan_path = self.store.save_plan(&outcome.plan, &label)?;
        info!(
            target: "reel.runtime",
            plan = %plan_path.display(),
            jobs = outcome.plan.job_count(),
            pending = outcome.pending.len(),
            "plan persisted"
        );

        if run.costs_only {
            return Ok(BuildReport {
                costs: Some(CostEstimate::for_plan(&outcome.plan)),
                plan: outcome.plan,
                plan_path,
                summary: None,
            });
        }
        if run.dry_run {
            return Ok(BuildReport {
                plan: outcome.plan,
                plan_path,
                summary: None,
                costs: None,
            });
        }

        let logger = self.store.run_logger(&label)?;
        let executor = Executor::new(
            Arc::clone(&self.store),
            self.handlers.clone(),
            self.config.clone(),
        );
        let plan = outcome.plan.clone();
        let summary = executor
            .execute(outcome, cancel, Some(&logger))
            .await
            .map_err(|e: RuntimeError| ForgeError::from(e))?;

        Ok(BuildReport {
            plan,
            plan_path,
            summary: Some(summary),
            costs: None,
        })
    }
}

/// Inline override values pass through; file overrides are read from disk
/// with a MIME type guessed from the extension.
fn resolve_override(value: &OverrideValue) -> Result<OverridePayload, ForgeError> {
    match value {
        OverrideValue::Value(v) => Ok(OverridePayload::Json(v.clone())),
        OverrideValue::File(path) => {
            let data = std::fs::read(path).map_err(|e| {
                ForgeError::new(
                    reel_error::ErrorCode::InputInvalid,
                    format!("cannot read override file {path}: {e}"),
                )
            })?;
            let mime_type = match PathBuf::from(path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or("")
            {
                "json" => "application/json",
                "png" => "image/png",
                "jpg" | "jpeg" => "image/jpeg",
                "wav" => "audio/wav",
                "mp3" => "audio/mpeg",
                "mp4" => "video/mp4",
                "txt" => "text/plain",
                _ => "application/octet-stream",
            }
            .to_string();
            Ok(OverridePayload::Bytes { data, mime_type })
        }
    }
}
