// SPDX-License-Identifier: MIT OR Apache-2.0
//! Executor semantics: retries, failure policies, cancellation, fan-in.

mod support;

use async_trait::async_trait;
use reel_config::{FailureMode, ForgeConfig, RunOptions};
use reel_core::{
    ArtifactStatus, CancellationToken, ConditionExpr, ProduceRequest, ProduceResult,
    ProduceStatus, ProducedArtifact, ProducedBlob,
};
use reel_provider::{HandlerRegistry, ProducerHandler, ProviderError, SimulatedHandler};
use reel_runtime::{BuildStatus, Forge, JobStatus};
use reel_store::FsArtifactStore;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use support::{ScriptedHandler, blueprint, conn, dim, input_decl, producer, scalar_out};

fn forge_with(
    dir: &tempfile::TempDir,
    handlers: HandlerRegistry,
    failure_mode: FailureMode,
) -> Forge {
    let store = Arc::new(FsArtifactStore::open(dir.path(), "movies", "m-1").unwrap());
    let config = ForgeConfig {
        concurrency: 2,
        failure_mode,
        ..ForgeConfig::default()
    };
    Forge::new(store, handlers, config)
}

fn topic_inputs() -> BTreeMap<String, serde_json::Value> {
    let mut inputs = BTreeMap::new();
    inputs.insert("Topic".to_string(), json!("t"));
    inputs
}

/// Fails with a retryable rate limit for the first N attempts, then
/// succeeds with stub JSON.
struct FlakyHandler {
    provider: String,
    failures: u32,
    seen: AtomicU32,
}

#[async_trait]
impl ProducerHandler for FlakyHandler {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn invoke(
        &self,
        request: ProduceRequest,
        _cancel: CancellationToken,
    ) -> Result<ProduceResult, ProviderError> {
        let attempt = self.seen.fetch_add(1, Ordering::SeqCst);
        if attempt < self.failures {
            return Err(ProviderError::rate_limited("429 slow down", Some(10)));
        }
        let artifacts = request
            .produces
            .iter()
            .map(|id| ProducedArtifact {
                artifact_id: id.clone(),
                status: ProduceStatus::Succeeded,
                blob: Some(ProducedBlob {
                    data: serde_json::to_vec(&json!("eventually")).unwrap(),
                    mime_type: "application/json".into(),
                }),
                diagnostics: None,
            })
            .collect();
        Ok(ProduceResult::succeeded(artifacts))
    }
}

/// Always fails, non-retryably.
struct BrokenHandler {
    provider: String,
}

#[async_trait]
impl ProducerHandler for BrokenHandler {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn invoke(
        &self,
        _request: ProduceRequest,
        _cancel: CancellationToken,
    ) -> Result<ProduceResult, ProviderError> {
        Err(ProviderError::upstream("upstream exploded", false))
    }
}

/// Returns success but no artifacts at all.
struct ForgetfulHandler {
    provider: String,
}

#[async_trait]
impl ProducerHandler for ForgetfulHandler {
    fn provider(&self) -> &str {
        &self.provider
    }

    async fn invoke(
        &self,
        _request: ProduceRequest,
        _cancel: CancellationToken,
    ) -> Result<ProduceResult, ProviderError> {
        Ok(ProduceResult::succeeded(vec![]))
    }
}

fn two_step_chain(first_provider: &str) -> reel_core::BlueprintTree {
    let mut first = producer("First", scalar_out("Out"));
    first.provider = first_provider.into();
    blueprint(
        vec![input_decl("Topic", reel_core::InputType::String)],
        vec![first, producer("Second", scalar_out("Out"))],
        vec![
            conn("First.Topic", "Topic", false),
            conn("Second.In", "First.Out", false),
        ],
    )
}

#[tokio::test]
async fn retryable_errors_are_retried_with_the_providers_hint() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(SimulatedHandler::new("mock"));
    handlers.register(FlakyHandler {
        provider: "flaky".into(),
        failures: 1,
        seen: AtomicU32::new(0),
    });

    let dir = tempfile::tempdir().unwrap();
    let forge = forge_with(&dir, handlers, FailureMode::FailFast);
    let report = forge
        .build(
            &two_step_chain("flaky"),
            &topic_inputs(),
            &RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let summary = report.summary.unwrap();
    assert_eq!(summary.status, BuildStatus::Complete);
    let first = summary
        .jobs
        .iter()
        .find(|j| j.job_id == "Producer:First")
        .unwrap();
    assert_eq!(first.status, JobStatus::Succeeded);
    assert_eq!(first.attempts, 2, "one rate limit, one success");
}

#[tokio::test]
async fn non_retryable_failure_halts_at_the_layer_barrier() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(SimulatedHandler::new("mock"));
    handlers.register(BrokenHandler {
        provider: "broken".into(),
    });

    let dir = tempfile::tempdir().unwrap();
    let forge = forge_with(&dir, handlers, FailureMode::FailFast);
    let report = forge
        .build(
            &two_step_chain("broken"),
            &topic_inputs(),
            &RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let summary = report.summary.unwrap();
    assert_eq!(summary.status, BuildStatus::Failed);
    let status_of = |id: &str| {
        summary
            .jobs
            .iter()
            .find(|j| j.job_id == id)
            .unwrap()
            .status
    };
    assert_eq!(status_of("Producer:First"), JobStatus::Failed);
    assert_eq!(status_of("Producer:Second"), JobStatus::NotRun);

    // The failure is recorded in the manifest with its reason.
    let manifest = forge.store().load_manifest().unwrap().unwrap();
    let ev = &manifest.artifacts["Artifact:First.Out"];
    assert_eq!(ev.status, ArtifactStatus::Failed);
    assert_eq!(ev.reason.as_deref(), Some("provider_error"));

    // A later build retries the failed job.
    let retry = forge
        .build(
            &two_step_chain("broken"),
            &topic_inputs(),
            &RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();
    assert_eq!(retry.plan.job_count(), 2);
}

#[tokio::test]
async fn best_effort_skips_jobs_with_failed_upstreams() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(SimulatedHandler::new("mock"));
    handlers.register(BrokenHandler {
        provider: "broken".into(),
    });

    let dir = tempfile::tempdir().unwrap();
    let forge = forge_with(&dir, handlers, FailureMode::BestEffort);
    let report = forge
        .build(
            &two_step_chain("broken"),
            &topic_inputs(),
            &RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let summary = report.summary.unwrap();
    assert_eq!(summary.status, BuildStatus::Failed);
    let second = summary
        .jobs
        .iter()
        .find(|j| j.job_id == "Producer:Second")
        .unwrap();
    assert_eq!(second.status, JobStatus::Skipped);
    assert!(second.reason.as_deref().unwrap().starts_with("upstream_failed"));
}

#[tokio::test]
async fn cancellation_before_start_runs_nothing() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(SimulatedHandler::new("mock"));

    let dir = tempfile::tempdir().unwrap();
    let forge = forge_with(&dir, handlers, FailureMode::FailFast);
    let cancel = CancellationToken::new();
    cancel.cancel();
    let report = forge
        .build(
            &two_step_chain("mock"),
            &topic_inputs(),
            &RunOptions::default(),
            cancel,
        )
        .await
        .unwrap();

    let summary = report.summary.unwrap();
    assert_eq!(summary.status, BuildStatus::Cancelled);
    assert!(summary.jobs.iter().all(|j| j.status == JobStatus::NotRun));
    assert_eq!(summary.counts.succeeded, 0);
}

#[tokio::test]
async fn missing_expected_outputs_are_failed_with_a_reason() {
    let mut handlers = HandlerRegistry::new();
    handlers.register(SimulatedHandler::new("mock"));
    handlers.register(ForgetfulHandler {
        provider: "forgetful".into(),
    });

    let dir = tempfile::tempdir().unwrap();
    let forge = forge_with(&dir, handlers, FailureMode::FailFast);
    let report = forge
        .build(
            &two_step_chain("forgetful"),
            &topic_inputs(),
            &RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    let summary = report.summary.unwrap();
    assert_eq!(summary.status, BuildStatus::Failed);
    let manifest = forge.store().load_manifest().unwrap().unwrap();
    let ev = &manifest.artifacts["Artifact:First.Out"];
    assert_eq!(ev.status, ArtifactStatus::Failed);
    assert_eq!(ev.reason.as_deref(), Some("missing_output"));
}

// -- 4. fan-in at execution time ---------------------------------------

#[tokio::test]
async fn conditional_fan_in_members_are_filtered_at_runtime() {
    let plot_schema = json!({
        "type": "object",
        "properties": {"WithMeetings": {"type": "boolean"}}
    });
    let mut plot = producer("Plot", plot_schema);
    plot.provider = "script".into();
    let mut meeting = producer("MeetingVideo", scalar_out("Video"));
    meeting.dimensions = vec![dim("character", 2)];
    meeting.condition = Some(ConditionExpr::when_equals("Plot.WithMeetings", json!(true)));
    let music = producer(
        "Music",
        json!({"type": "object", "properties": {"GeneratedMusic": {"type": "string"}}}),
    );
    let bp = blueprint(
        vec![input_decl("Topic", reel_core::InputType::String)],
        vec![plot, meeting, music, producer("Timeline", scalar_out("Cut"))],
        vec![
            conn("Plot.Topic", "Topic", false),
            conn("Timeline.VideoSegments", "MeetingVideo.Video", false),
            conn("Timeline.Music", "Music.GeneratedMusic", false),
        ],
    );

    let mut outputs = BTreeMap::new();
    outputs.insert("Artifact:Plot.WithMeetings".to_string(), json!(false));
    let mut handlers = HandlerRegistry::new();
    handlers.register(SimulatedHandler::new("mock"));
    handlers.register(ScriptedHandler::new("script", outputs));

    let dir = tempfile::tempdir().unwrap();
    let forge = forge_with(&dir, handlers, FailureMode::FailFast);
    let report = forge
        .build(
            &bp,
            &topic_inputs(),
            &RunOptions::default(),
            CancellationToken::new(),
        )
        .await
        .unwrap();

    // The plan still carries the conditional members; execution decides.
    let timeline = report
        .plan
        .jobs()
        .find(|j| j.producer == "Timeline")
        .unwrap();
    assert_eq!(timeline.context.fan_in["VideoSegments"].members.len(), 2);
    assert_eq!(timeline.context.fan_in["Music"].group_by, "singleton");

    let summary = report.summary.unwrap();
    assert_eq!(summary.status, BuildStatus::Complete);
    let status_of = |id: &str| {
        summary
            .jobs
            .iter()
            .find(|j| j.job_id == id)
            .unwrap()
            .status
    };
    assert_eq!(status_of("Producer:MeetingVideo[0]"), JobStatus::Skipped);
    assert_eq!(status_of("Producer:MeetingVideo[1]"), JobStatus::Skipped);
    assert_eq!(status_of("Producer:Timeline"), JobStatus::Succeeded);
}
