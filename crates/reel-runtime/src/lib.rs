// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// The top-level build facade tying store, planner, and executor together.
pub mod forge;

use chrono::Utc;
use reel_config::{FailureMode, ForgeConfig};
use reel_core::{
    ArtifactEvent, ArtifactStatus, ArtifactValue, BlobSource, CancellationToken, CanonicalId,
    FanInItem, FanInSequence, Job, Manifest, ProduceRequest, ProduceStatus, RequestContext,
    USER_OVERRIDE,
};
use reel_planner::{OverridePayload, PlanOutcome};
use reel_provider::{HandlerRegistry, ProducerHandler, ProviderError, backoff_delay};
use reel_store::{FsArtifactStore, RunLogger, StoreError};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc, oneshot};
use tracing::{debug, info, warn};

pub use forge::{BuildReport, CostEstimate, Forge};

/// Bounded grace period an in-flight handler gets after cancellation.
const CANCEL_GRACE: Duration = Duration::from_secs(5);

/// Errors from the executor.
#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    /// The artifact store failed.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// No handler is registered for a provider the plan needs.
    #[error("no handler registered for provider `{provider}`")]
    HandlerMissing {
        /// The provider name.
        provider: String,
    },

    /// A handler's warm start failed.
    #[error("warm start failed for provider `{provider}`: {source}")]
    WarmStartFailed {
        /// The provider name.
        provider: String,
        /// The handler's error.
        #[source]
        source: ProviderError,
    },

    /// The manifest aggregation task died.
    #[error("manifest aggregation failed: {0}")]
    Aggregator(String),
}

impl From<RuntimeError> for reel_error::ForgeError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Store(e) => e.into(),
            RuntimeError::HandlerMissing { provider } => reel_error::ForgeError::new(
                reel_error::ErrorCode::ProviderNotFound,
                format!("no handler registered for provider `{provider}`"),
            ),
            RuntimeError::WarmStartFailed { source, .. } => source.into(),
            RuntimeError::Aggregator(msg) => {
                reel_error::ForgeError::new(reel_error::ErrorCode::Internal, msg)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Build summary
// ---------------------------------------------------------------------------

/// Overall result of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum BuildStatus {
    /// Every planned job reached succeeded or skipped.
    Complete,
    /// At least one job failed.
    Failed,
    /// The run was cancelled before completion.
    Cancelled,
}

/// Terminal (or not-reached) status of one planned job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// All artifacts produced.
    Succeeded,
    /// The job failed (handler error, missing output, cancellation).
    Failed,
    /// Conditions unmet or an upstream dependency failed.
    Skipped,
    /// Never started (halt at a barrier, or cancellation).
    NotRun,
}

/// Per-job record in the build summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobReport {
    /// Job id.
    pub job_id: String,
    /// Terminal status.
    pub status: JobStatus,
    /// Number of attempts made (0 when never started).
    pub attempts: u32,
    /// Machine-parseable reason for failures and skips.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Counts of terminal job statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub struct StatusCounts {
    /// Jobs that produced all artifacts.
    pub succeeded: usize,
    /// Jobs that failed.
    pub failed: usize,
    /// Jobs skipped by conditions or failed upstreams.
    pub skipped: usize,
}

/// What a run did, returned to the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct BuildSummary {
    /// Overall status.
    pub status: BuildStatus,
    /// Terminal status counts.
    pub counts: StatusCounts,
    /// Per-job records in plan order.
    pub jobs: Vec<JobReport>,
    /// Path of the saved manifest.
    pub manifest_path: String,
    /// Hash of the saved manifest.
    pub manifest_hash: String,
}

// ---------------------------------------------------------------------------
// Manifest aggregation
// ---------------------------------------------------------------------------

enum ManifestMsg {
    Apply(ArtifactEvent, oneshot::Sender<Result<(), StoreError>>),
    Snapshot(oneshot::Sender<Manifest>),
    Finish(oneshot::Sender<Manifest>),
}

#[derive(Clone)]
struct ManifestHandle {
    tx: mpsc::Sender<ManifestMsg>,
}

impl ManifestHandle {
    /// Single-owner mutation point: one task serializes every artifact-event
    /// application and the matching event-log append.
    fn spawn(initial: Manifest, store: Arc<FsArtifactStore>) -> Self {
        let (tx, mut rx) = mpsc::channel::<ManifestMsg>(64);
        tokio::spawn(async move {
            let mut manifest = initial;
            while let Some(msg) = rx.recv().await {
                match msg {
                    ManifestMsg::Apply(event, ack) => {
                        let result = store.append_artifact_event(&event);
                        if result.is_ok() {
                            manifest.apply(event);
                        }
                        let _ = ack.send(result);
                    }
                    ManifestMsg::Snapshot(reply) => {
                        let _ = reply.send(manifest.clone());
                    }
                    ManifestMsg::Finish(reply) => {
                        let _ = reply.send(manifest);
                        break;
                    }
                }
            }
        });
        Self { tx }
    }

    async fn apply(&self, event: ArtifactEvent) -> Result<(), RuntimeError> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(ManifestMsg::Apply(event, ack_tx))
            .await
            .map_err(|_| RuntimeError::Aggregator("aggregation task is gone".into()))?;
        ack_rx
            .await
            .map_err(|_| RuntimeError::Aggregator("aggregation task dropped the ack".into()))?
            .map_err(RuntimeError::Store)
    }

    async fn snapshot(&self) -> Result<Manifest, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ManifestMsg::Snapshot(tx))
            .await
            .map_err(|_| RuntimeError::Aggregator("aggregation task is gone".into()))?;
        rx.await
            .map_err(|_| RuntimeError::Aggregator("aggregation task dropped the snapshot".into()))
    }

    async fn finish(self) -> Result<Manifest, RuntimeError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(ManifestMsg::Finish(tx))
            .await
            .map_err(|_| RuntimeError::Aggregator("aggregation task is gone".into()))?;
        rx.await
            .map_err(|_| RuntimeError::Aggregator("aggregation task dropped the manifest".into()))
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Executes plans layer by layer with bounded parallelism.
pub struct Executor {
    store: Arc<FsArtifactStore>,
    handlers: HandlerRegistry,
    config: ForgeConfig,
}

struct JobOutcome {
    job_id: String,
    status: JobStatus,
    attempts: u32,
    reason: Option<String>,
}

impl Executor {
    /// Build an executor over a store, handler registry, and configuration.
    #[must_use]
    pub fn new(store: Arc<FsArtifactStore>, handlers: HandlerRegistry, config: ForgeConfig) -> Self {
        Self {
            store,
            handlers,
            config,
        }
    }

    /// Execute a plan outcome to completion, halt, or cancellation.
    ///
    /// # Errors
    ///
    /// [`RuntimeError`] on missing handlers, warm-start failures, and
    /// storage problems (including a manifest conflict at the final save).
    pub async fn execute(
        &self,
        outcome: PlanOutcome,
        cancel: CancellationToken,
        logger: Option<&RunLogger>,
    ) -> Result<BuildSummary, RuntimeError> {
        let PlanOutcome {
            plan,
            mut next_manifest,
            input_events,
            override_events,
            ..
        } = outcome;

        // Pre-flight: every provider in the plan needs a warm handler.
        let mut providers: Vec<&str> = plan.jobs().map(|j| j.context.provider.as_str()).collect();
        providers.sort_unstable();
        providers.dedup();
        for provider in providers {
            let handler = self
                .handlers
                .get(provider)
                .ok_or_else(|| RuntimeError::HandlerMissing {
                    provider: provider.to_string(),
                })?;
            handler
                .warm_start()
                .await
                .map_err(|source| RuntimeError::WarmStartFailed {
                    provider: provider.to_string(),
                    source,
                })?;
        }

        for event in &input_events {
            self.store.append_input_event(event)?;
        }

        // Synthetic replacement events for overridden leaves. The prior
        // inputs hash is carried over so the leaf's producer stays clean on
        // the next plan.
        for ov in &override_events {
            let (bytes, mime) = match &ov.payload {
                OverridePayload::Json(v) => (
                    serde_json::to_vec(v).map_err(StoreError::Json)?,
                    "application/json".to_string(),
                ),
                OverridePayload::Bytes { data, mime_type } => (data.clone(), mime_type.clone()),
            };
            let blob = self.store.put_blob(&bytes, &mime)?;
            let carried_hash = next_manifest
                .artifact(&ov.artifact_id.to_string())
                .map(|ev| ev.inputs_hash.clone())
                .unwrap_or_default();
            let event = ArtifactEvent {
                artifact_id: ov.artifact_id.clone(),
                revision: plan.target_revision,
                inputs_hash: carried_hash,
                status: ArtifactStatus::Succeeded,
                produced_by: USER_OVERRIDE.to_string(),
                created_at: Utc::now(),
                blob: Some(blob),
                reason: None,
                diagnostics: None,
            };
            self.store.append_artifact_event(&event)?;
            next_manifest.apply(event);
        }

        let previous_hash = next_manifest.previous_hash.clone();
        let manifest = ManifestHandle::spawn(next_manifest, Arc::clone(&self.store));

        if let Some(log) = logger {
            let _ = log.info(format!(
                "run started: {} jobs in {} layers",
                plan.job_count(),
                plan.layers.len()
            ));
        }
        info!(target: "reel.runtime", jobs = plan.job_count(), layers = plan.layers.len(), "run started");

        let mut reports: BTreeMap<String, JobReport> = plan
            .jobs()
            .map(|j| {
                let id = j.job_id.to_string();
                (
                    id.clone(),
                    JobReport {
                        job_id: id,
                        status: JobStatus::NotRun,
                        attempts: 0,
                        reason: None,
                    },
                )
            })
            .collect();

        let mut halted = false;
        for layer in &plan.layers {
            if halted || cancel.is_cancelled() {
                break;
            }
            let snapshot = Arc::new(manifest.snapshot().await?);
            let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
            let mut handles = Vec::with_capacity(layer.len());

            for job in layer {
                // Not-yet-started jobs abort immediately on cancellation.
                if cancel.is_cancelled() {
                    break;
                }
                let permit = match Arc::clone(&semaphore).acquire_owned().await {
                    Ok(p) => p,
                    Err(_) => break,
                };
                if cancel.is_cancelled() {
                    break;
                }

                let handler = self
                    .handlers
                    .get(&job.context.provider)
                    .ok_or_else(|| RuntimeError::HandlerMissing {
                        provider: job.context.provider.clone(),
                    })?;
                let ctx = JobRun {
                    job: job.clone(),
                    revision: plan.target_revision,
                    store: Arc::clone(&self.store),
                    handler,
                    snapshot: Arc::clone(&snapshot),
                    manifest: manifest.clone(),
                    cancel: cancel.child(),
                    max_attempts: self.config.max_attempts.max(1),
                };
                handles.push(tokio::spawn(async move {
                    let _permit = permit;
                    ctx.run().await
                }));
            }

            let mut layer_failed = false;
            for handle in handles {
                match handle.await {
                    Ok(Ok(outcome)) => {
                        if outcome.status == JobStatus::Failed {
                            layer_failed = true;
                        }
                        if let Some(log) = logger {
                            let mut fields = BTreeMap::new();
                            fields.insert(
                                "status".to_string(),
                                serde_json::to_value(outcome.status).unwrap_or_default(),
                            );
                            fields.insert("attempts".to_string(), outcome.attempts.into());
                            let _ = log.job(outcome.job_id.clone(), "job finished", fields);
                        }
                        if let Some(report) = reports.get_mut(&outcome.job_id) {
                            report.status = outcome.status;
                            report.attempts = outcome.attempts;
                            report.reason = outcome.reason;
                        }
                    }
                    Ok(Err(e)) => return Err(e),
                    Err(join) => {
                        return Err(RuntimeError::Aggregator(format!(
                            "worker panicked: {join}"
                        )));
                    }
                }
            }

            // A layer is a barrier: under fail-fast a failure finishes the
            // layer but refuses to start the next one.
            if layer_failed && self.config.failure_mode == FailureMode::FailFast {
                warn!(target: "reel.runtime", "halting at layer barrier after failure");
                halted = true;
            }
        }

        let final_manifest = manifest.finish().await?;
        let manifest_hash = self
            .store
            .save_manifest(&final_manifest, previous_hash.as_deref())?;

        let mut counts = StatusCounts::default();
        let jobs: Vec<JobReport> = plan
            .jobs()
            .map(|j| reports[&j.job_id.to_string()].clone())
            .collect();
        for report in &jobs {
            match report.status {
                JobStatus::Succeeded => counts.succeeded += 1,
                JobStatus::Failed => counts.failed += 1,
                JobStatus::Skipped => counts.skipped += 1,
                JobStatus::NotRun => {}
            }
        }
        let status = if cancel.is_cancelled() {
            BuildStatus::Cancelled
        } else if counts.failed > 0 {
            BuildStatus::Failed
        } else {
            BuildStatus::Complete
        };

        if let Some(log) = logger {
            let _ = log.info(format!(
                "run finished: {:?} ({} succeeded, {} failed, {} skipped)",
                status, counts.succeeded, counts.failed, counts.skipped
            ));
        }
        info!(target: "reel.runtime", ?status, succeeded = counts.succeeded, failed = counts.failed, skipped = counts.skipped, "run finished");

        Ok(BuildSummary {
            status,
            counts,
            jobs,
            manifest_path: self.store.manifest_path().display().to_string(),
            manifest_hash,
        })
    }
}

// ---------------------------------------------------------------------------
// Per-job execution
// ---------------------------------------------------------------------------

struct JobRun {
    job: Job,
    revision: uuid::Uuid,
    store: Arc<FsArtifactStore>,
    handler: Arc<dyn ProducerHandler>,
    snapshot: Arc<Manifest>,
    manifest: ManifestHandle,
    cancel: CancellationToken,
    max_attempts: u32,
}

impl JobRun {
    async fn run(self) -> Result<JobOutcome, RuntimeError> {
        let job_str = self.job.job_id.to_string();
        debug!(target: "reel.runtime", job = %job_str, layer = self.job.layer, "job starting");

        // 1. Conditions against the manifest under construction.
        if !self.conditions_met() {
            self.record_all(ArtifactStatus::Skipped, Some("condition_unmet"), None)
                .await?;
            return Ok(JobOutcome {
                job_id: job_str,
                status: JobStatus::Skipped,
                attempts: 0,
                reason: Some("condition_unmet".into()),
            });
        }

        // 2. Required upstreams must have materialized.
        if let Some(missing) = self.missing_upstream() {
            self.record_all(ArtifactStatus::Skipped, Some("upstream_failed"), None)
                .await?;
            return Ok(JobOutcome {
                job_id: job_str,
                status: JobStatus::Skipped,
                attempts: 0,
                reason: Some(format!("upstream_failed: {missing}")),
            });
        }

        // 3. Resolve inputs.
        let resolved = match self.resolve_inputs() {
            Ok(r) => r,
            Err(e) => {
                self.record_all(ArtifactStatus::Failed, Some("input_resolution"), Some(&e.message))
                    .await?;
                return Ok(JobOutcome {
                    job_id: job_str,
                    status: JobStatus::Failed,
                    attempts: 0,
                    reason: Some(format!("input_resolution: {}", e.message)),
                });
            }
        };

        // 4.-6. Invoke with retries honoring provider hints.
        let mut attempt = 1u32;
        let result = loop {
            let request = self.request(attempt, resolved.clone());
            let invoke = self.handler.invoke(request, self.cancel.child());
            tokio::pin!(invoke);
            let outcome = tokio::select! {
                res = &mut invoke => res,
                () = self.cancel.cancelled() => {
                    // In-flight handlers get a bounded grace period.
                    match tokio::time::timeout(CANCEL_GRACE, &mut invoke).await {
                        Ok(res) => res,
                        Err(_) => Err(ProviderError::cancelled()),
                    }
                }
            };
            match outcome {
                Ok(result) => break Ok(result),
                Err(e) if self.cancel.is_cancelled() => {
                    break Err((e, "cancelled"));
                }
                Err(e) if e.retryable && attempt < self.max_attempts => {
                    let delay = backoff_delay(attempt, e.retry_after_ms);
                    debug!(target: "reel.runtime", job = %job_str, attempt, delay_ms = delay.as_millis() as u64, "retrying after provider error");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => break Err((e, "provider_error")),
            }
        };

        let result = match result {
            Ok(r) => r,
            Err((e, reason)) => {
                let reason = if e.kind == reel_provider::ProviderErrorKind::Cancelled {
                    "cancelled"
                } else {
                    reason
                };
                self.record_all(ArtifactStatus::Failed, Some(reason), Some(&e.message))
                    .await?;
                return Ok(JobOutcome {
                    job_id: job_str,
                    status: JobStatus::Failed,
                    attempts: attempt,
                    reason: Some(reason.to_string()),
                });
            }
        };

        // 5. Persist artifacts and stream events.
        let mut failed = false;
        let mut first_reason: Option<String> = None;
        let output_schema = self
            .job
            .context
            .schema
            .output
            .clone()
            .unwrap_or(serde_json::Value::Null);
        for produce in &self.job.produces {
            let produced = result.artifact(produce);
            let (status, blob, reason, diagnostics) = match produced {
                None => (
                    ArtifactStatus::Failed,
                    None,
                    Some("missing_output".to_string()),
                    None,
                ),
                Some(a) if a.status == ProduceStatus::Failed || a.blob.is_none() => (
                    ArtifactStatus::Failed,
                    None,
                    Some("missing_output".to_string()),
                    a.diagnostics.clone(),
                ),
                Some(a) => {
                    let produced_blob = a.blob.as_ref().expect("checked above");
                    match self.validate_output(&output_schema, produce, produced_blob) {
                        Err(violation) => (
                            ArtifactStatus::Failed,
                            None,
                            Some("output_schema_violation".to_string()),
                            Some(violation),
                        ),
                        Ok(()) => {
                            let blob = self
                                .store
                                .put_blob(&produced_blob.data, &produced_blob.mime_type)?;
                            (ArtifactStatus::Succeeded, Some(blob), None, a.diagnostics.clone())
                        }
                    }
                }
            };
            if status == ArtifactStatus::Failed {
                failed = true;
                if first_reason.is_none() {
                    first_reason.clone_from(&reason);
                }
            }
            self.manifest
                .apply(ArtifactEvent {
                    artifact_id: produce.clone(),
                    revision: self.revision,
                    inputs_hash: self.job.context.inputs_hash.clone(),
                    status,
                    produced_by: self.job.job_id.to_string(),
                    created_at: Utc::now(),
                    blob,
                    reason,
                    diagnostics,
                })
                .await?;
        }

        let status = if failed {
            JobStatus::Failed
        } else {
            JobStatus::Succeeded
        };
        debug!(target: "reel.runtime", job = %job_str, ?status, attempts = attempt, "job finished");
        Ok(JobOutcome {
            job_id: job_str,
            status,
            attempts: attempt,
            reason: first_reason,
        })
    }

    fn lookup(&self) -> impl Fn(&str) -> Option<serde_json::Value> + '_ {
        move |artifact: &str| {
            let ev = self.snapshot.artifact(artifact)?;
            if ev.status != ArtifactStatus::Succeeded {
                return None;
            }
            let blob = ev.blob.as_ref()?;
            let bytes = self.store.get_blob(blob).ok()?;
            Some(ArtifactValue::from_blob(bytes, &blob.mime_type).to_json())
        }
    }

    fn conditions_met(&self) -> bool {
        let lookup = self.lookup();
        if let Some(cond) = &self.job.context.condition {
            if !cond.evaluate(&lookup) {
                return false;
            }
        }
        self.job
            .context
            .input_conditions
            .values()
            .all(|cond| cond.evaluate(&lookup))
    }

    /// A bound (non-fan-in) artifact input whose event is absent or not
    /// succeeded, if any.
    fn missing_upstream(&self) -> Option<String> {
        for id in self.job.context.input_bindings.values() {
            if id.kind() != reel_core::IdKind::Artifact {
                continue;
            }
            let ok = self
                .snapshot
                .artifact(&id.to_string())
                .is_some_and(|ev| ev.status == ArtifactStatus::Succeeded);
            if !ok {
                return Some(id.to_string());
            }
        }
        None
    }

    /// Literal inputs come from plan time; artifact bindings read blobs;
    /// fan-in inputs compose lazy ordered sequences of materialized members.
    fn resolve_inputs(&self) -> Result<BTreeMap<String, serde_json::Value>, ProviderError> {
        let mut resolved = self.job.context.resolved_inputs.clone();
        let lookup = self.lookup();

        for (key, id) in &self.job.context.input_bindings {
            if id.kind() != reel_core::IdKind::Artifact {
                continue;
            }
            let ev = self
                .snapshot
                .artifact(&id.to_string())
                .ok_or_else(|| ProviderError::unknown(format!("upstream `{id}` vanished")))?;
            let blob = ev.blob.as_ref().ok_or_else(|| {
                ProviderError::unknown(format!("upstream `{id}` has no blob"))
            })?;
            let bytes = self
                .store
                .get_blob(blob)
                .map_err(|e| ProviderError::unknown(e.to_string()))?;
            resolved.insert(
                key.clone(),
                ArtifactValue::from_blob(bytes, &blob.mime_type).to_json(),
            );
        }

        for (key, fan_in) in &self.job.context.fan_in {
            let items: Vec<FanInItem> = fan_in
                .members
                .iter()
                .filter(|m| {
                    m.condition
                        .as_ref()
                        .is_none_or(|cond| cond.evaluate(&lookup))
                })
                .map(|m| {
                    let blob = self
                        .snapshot
                        .artifact(&m.id.to_string())
                        .filter(|ev| ev.status == ArtifactStatus::Succeeded)
                        .and_then(|ev| ev.blob.clone());
                    FanInItem {
                        id: m.id.clone(),
                        group: m.group.clone(),
                        blob,
                    }
                })
                .collect();
            let sequence = FanInSequence::new(items);
            let value = sequence
                .resolve_json(self.store.as_ref() as &dyn BlobSource)
                .map_err(|e| ProviderError::unknown(e.message))?;
            resolved.insert(key.clone(), value);
        }

        Ok(resolved)
    }

    fn request(&self, attempt: u32, resolved: BTreeMap<String, serde_json::Value>) -> ProduceRequest {
        ProduceRequest {
            job_id: self.job.job_id.clone(),
            provider: self.job.context.provider.clone(),
            model: self.job.context.model.clone(),
            revision: self.revision,
            layer: self.job.layer,
            attempt,
            inputs: self.job.inputs.clone(),
            produces: self.job.produces.clone(),
            context: RequestContext {
                resolved_inputs: resolved,
                input_bindings: self.job.context.input_bindings.clone(),
                sdk_mapping: self.job.context.sdk_mapping.clone(),
                input_schema: self.job.context.schema.input.clone(),
                output_schema: self.job.context.schema.output.clone(),
                extras: self.job.context.extras.clone(),
            },
        }
    }

    /// Structured outputs are checked against the declared leaf schema.
    fn validate_output(
        &self,
        output_schema: &serde_json::Value,
        id: &CanonicalId,
        blob: &reel_core::ProducedBlob,
    ) -> Result<(), String> {
        if blob.mime_type != "application/json" {
            return Ok(());
        }
        let value: serde_json::Value = serde_json::from_slice(&blob.data)
            .map_err(|e| format!("artifact `{id}` is not valid JSON: {e}"))?;
        let leaf = reel_provider::leaf_schema(output_schema, id);
        if leaf.is_null() || !leaf.is_object() {
            return Ok(());
        }
        match jsonschema::validator_for(&leaf) {
            Ok(validator) if !validator.is_valid(&value) => {
                Err(format!("artifact `{id}` violates its declared schema"))
            }
            _ => Ok(()),
        }
    }

    async fn record_all(
        &self,
        status: ArtifactStatus,
        reason: Option<&str>,
        diagnostics: Option<&str>,
    ) -> Result<(), RuntimeError> {
        for produce in &self.job.produces {
            self.manifest
                .apply(ArtifactEvent {
                    artifact_id: produce.clone(),
                    revision: self.revision,
                    inputs_hash: self.job.context.inputs_hash.clone(),
                    status,
                    produced_by: self.job.job_id.to_string(),
                    created_at: Utc::now(),
                    blob: None,
                    reason: reason.map(String::from),
                    diagnostics: diagnostics.map(String::from),
                })
                .await?;
        }
        Ok(())
    }
}
