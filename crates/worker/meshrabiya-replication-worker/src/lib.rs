//! Replication Worker: one execution of a replication job —
//! invoke the Orchestrator, upload the blob to each non-originator
//! assignee, collect results (locally and from the gossip bus), and decide
//! whether the job is complete or needs another attempt.

use futures::stream::{self, StreamExt};
use meshrabiya_codec::{
    Assignment, AssignmentResult, DelegationMessage, JobStatus, ReplicationJob, ResourceOffer,
};
use meshrabiya_gossip::{listener_fn, GossipBus, GossipPayload, WireMessage};
use meshrabiya_orchestrator::OrchestratorOutcome;
use meshrabiya_scheduler::WorkerOutcome;
use meshrabiya_signer::Signer;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("io failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub upload_concurrency: usize,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub offer_window: Duration,
    pub replication_wait: Duration,
    pub poll_interval: Duration,
    pub test_mode: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            upload_concurrency: 4,
            connect_timeout: Duration::from_secs(10),
            read_timeout: Duration::from_secs(30),
            offer_window: Duration::from_millis(1000),
            replication_wait: Duration::from_secs(15),
            poll_interval: Duration::from_millis(500),
            test_mode: false,
        }
    }
}

pub struct WorkerContext {
    pub job_dir: PathBuf,
    pub bus: Arc<dyn GossipBus>,
    pub signer: Arc<dyn Signer>,
    pub origin_id: String,
    pub config: WorkerConfig,
    pub http: reqwest::Client,
    pub local_auth_token: Option<String>,
}

impl WorkerContext {
    pub fn new(
        job_dir: impl Into<PathBuf>,
        bus: Arc<dyn GossipBus>,
        signer: Arc<dyn Signer>,
        origin_id: impl Into<String>,
        config: WorkerConfig,
        local_auth_token: Option<String>,
    ) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .timeout(config.read_timeout)
            .build()
            .expect("reqwest client configuration is always valid");
        Self {
            job_dir: job_dir.into(),
            bus,
            signer,
            origin_id: origin_id.into(),
            config,
            http,
            local_auth_token,
        }
    }
}

async fn load_job(job_path: &Path) -> Result<ReplicationJob, WorkerError> {
    let bytes = tokio::fs::read(job_path).await?;
    Ok(serde_json::from_slice(&bytes)?)
}

async fn persist(job_path: &Path, job: &ReplicationJob) -> Result<(), WorkerError> {
    let bytes = serde_json::to_vec_pretty(job)?;
    meshrabiya_codec::write_atomic(job_path, &bytes).await?;
    Ok(())
}

/// Runs one Worker execution for the job at `job_path`.
pub async fn run(job_path: &Path, ctx: &WorkerContext) -> WorkerOutcome {
    let job = match load_job(job_path).await {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(job = ?job_path, error = %e, "failed to load job; fatal");
            return WorkerOutcome::Failure;
        }
    };
    let span = tracing::info_span!("replication_job", blob_id = %job.id);
    let _enter = span.enter();
    drop(job);

    let resolve_endpoint = |_offer: &ResourceOffer| None;
    let orchestrator_outcome = match meshrabiya_orchestrator::process_job(
        &ctx.job_dir,
        job_path,
        ctx.bus.as_ref(),
        ctx.signer.as_ref(),
        &ctx.origin_id,
        ctx.config.offer_window,
        &resolve_endpoint,
    )
    .await
    {
        Ok(outcome) => outcome,
        Err(e) => {
            tracing::error!(job = ?job_path, error = %e, "orchestrator pass failed");
            return WorkerOutcome::Failure;
        }
    };

    let mut job = match load_job(job_path).await {
        Ok(job) => job,
        Err(e) => {
            tracing::error!(job = ?job_path, error = %e, "failed to reload job after orchestrator pass");
            return WorkerOutcome::Failure;
        }
    };

    if matches!(orchestrator_outcome, OrchestratorOutcome::NoOffers) && job.assignments.is_empty() {
        job.attempts += 1;
        job.status = JobStatus::NoOffers;
        if let Err(e) = persist(job_path, &job).await {
            tracing::error!(job = ?job_path, error = %e, "failed to persist no_offers state");
            return WorkerOutcome::Failure;
        }
        return WorkerOutcome::Retry { attempt: job.attempts };
    }

    let request_id = job.assignments.first().map(|a| a.request_id);

    let already_resolved: HashSet<(Uuid, String)> = job
        .assignment_results
        .iter()
        .map(|r| (r.request_id, r.assignee_id.clone()))
        .collect();

    let pending: Vec<Assignment> = job
        .assignments
        .iter()
        .filter(|a| a.assignee_id != job.origin_id) // never upload to own originator
        .filter(|a| !already_resolved.contains(&(a.request_id, a.assignee_id.clone())))
        .cloned()
        .collect();

    let fresh_results: Vec<AssignmentResult> = stream::iter(pending.into_iter())
        .map(|assignment| upload_to_assignee(ctx, job.id, assignment))
        .buffer_unordered(ctx.config.upload_concurrency.max(1))
        .filter_map(|r| async move { r })
        .collect()
        .await;

    for result in fresh_results {
        publish_result(ctx, &result);
        job.assignment_results.push(result);
    }
    job.recompute_accepted();
    if let Err(e) = persist(job_path, &job).await {
        tracing::error!(job = ?job_path, error = %e, "failed to persist assignment results");
        return WorkerOutcome::Failure;
    }

    if let Some(request_id) = request_id {
        if job.accepted < job.target_replicas {
            job = collect_remote_results(ctx, job_path, job, request_id).await;
        }
    }

    if job.accepted >= job.target_replicas {
        job.status = JobStatus::Complete;
        if let Err(e) = persist(job_path, &job).await {
            tracing::error!(job = ?job_path, error = %e, "failed to persist completed job");
            return WorkerOutcome::Failure;
        }
        WorkerOutcome::Success
    } else {
        job.attempts += 1;
        job.status = JobStatus::InProgress;
        if let Err(e) = persist(job_path, &job).await {
            tracing::error!(job = ?job_path, error = %e, "failed to persist in_progress state");
            return WorkerOutcome::Failure;
        }
        WorkerOutcome::Retry { attempt: job.attempts }
    }
}

/// Subscribes for `Result` messages carrying `request_id`, polling the job
/// file until `replication_wait` elapses or `accepted >= target_replicas`.
async fn collect_remote_results(
    ctx: &WorkerContext,
    job_path: &Path,
    mut job: ReplicationJob,
    request_id: Uuid,
) -> ReplicationJob {
    let collected: Arc<StdMutex<Vec<AssignmentResult>>> = Arc::new(StdMutex::new(Vec::new()));
    let collected_for_listener = collected.clone();
    let listener = listener_fn(move |payload| {
        if let GossipPayload::Typed(DelegationMessage::Result(result)) = payload {
            if result.request_id == request_id {
                collected_for_listener.lock().unwrap().push(result);
            }
        }
    });
    let subscription = ctx.bus.subscribe(listener);

    let deadline = tokio::time::Instant::now() + ctx.config.replication_wait;
    loop {
        tokio::time::sleep(ctx.config.poll_interval).await;

        let fresh = std::mem::take(&mut *collected.lock().unwrap());
        if !fresh.is_empty() {
            for result in fresh {
                let key = (result.request_id, result.assignee_id.clone());
                let already = job
                    .assignment_results
                    .iter()
                    .any(|r| (r.request_id, r.assignee_id.clone()) == key);
                if !already {
                    job.assignment_results.push(result);
                }
            }
            job.recompute_accepted();
            if let Err(e) = persist(job_path, &job).await {
                tracing::warn!(job = ?job_path, error = %e, "failed to persist remote results mid-poll");
            }
        }

        if job.accepted >= job.target_replicas || tokio::time::Instant::now() >= deadline {
            break;
        }
    }

    ctx.bus.unsubscribe(subscription);
    job
}

fn publish_result(ctx: &WorkerContext, result: &AssignmentResult) {
    let message = DelegationMessage::Result(result.clone());
    match meshrabiya_codec::encode_envelope(message, ctx.signer.as_ref()) {
        Ok(envelope) => match serde_json::to_string(&envelope) {
            Ok(json) => ctx.bus.publish(WireMessage::new("delegation", json)),
            Err(e) => tracing::warn!(error = %e, "failed to serialize result envelope"),
        },
        Err(_) => {
            tracing::debug!("no signer key available; result published locally only");
        }
    }
}

/// Attempts (or synthesizes, or skips) the upload for one assignment.
/// Returns `None` when the assignment is skipped outright (no endpoint and
/// not in test mode) — a skip produces no `assignment_results`
/// entry since no outbound attempt occurred.
async fn upload_to_assignee(
    ctx: &WorkerContext,
    blob_id: Uuid,
    assignment: Assignment,
) -> Option<AssignmentResult> {
    let result_for = |success: bool, message: Option<String>| AssignmentResult {
        request_id: assignment.request_id,
        assignee_id: assignment.assignee_id.clone(),
        blob_id,
        success,
        message,
    };

    let Some(endpoint) = assignment.upload_endpoint.clone() else {
        return if ctx.config.test_mode {
            Some(result_for(true, Some("test_mode_synthesized".into())))
        } else {
            tracing::debug!(assignee = %assignment.assignee_id, "skipping assignment with no upload endpoint");
            None
        };
    };

    if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
        return Some(result_for(false, Some("unsupported endpoint".into())));
    }

    if probe_already_present(ctx, &endpoint).await {
        return Some(result_for(true, Some("already_present".into())));
    }

    match upload_body(ctx, &endpoint, &assignment, blob_id).await {
        Ok(()) => Some(result_for(true, None)),
        Err(message) => Some(result_for(false, Some(message))),
    }
}

async fn probe_already_present(ctx: &WorkerContext, endpoint: &str) -> bool {
    let request = apply_loopback_auth(ctx.http.head(endpoint), endpoint, ctx);
    matches!(request.send().await, Ok(resp) if resp.status().is_success())
}

async fn upload_body(
    ctx: &WorkerContext,
    endpoint: &str,
    assignment: &Assignment,
    blob_id: Uuid,
) -> Result<(), String> {
    let blob_path = ctx.job_dir.join(format!("{blob_id}.blob"));
    let mut file = tokio::fs::File::open(&blob_path)
        .await
        .map_err(|e| format!("failed to open blob for upload: {e}"))?;
    let mut body = Vec::new();
    file.read_to_end(&mut body)
        .await
        .map_err(|e| format!("failed to read blob for upload: {e}"))?;

    let request = ctx
        .http
        .post(endpoint)
        .header("Content-Type", "application/octet-stream")
        .header("X-Meshrabiya-Capability", &assignment.capability_token)
        .body(body);
    let request = apply_loopback_auth(request, endpoint, ctx);

    match request.send().await {
        Ok(resp) if resp.status().is_success() => Ok(()),
        Ok(resp) => Err(format!("upload rejected with status {}", resp.status())),
        Err(e) => Err(format!("upload request failed: {e}")),
    }
}

fn apply_loopback_auth(
    request: reqwest::RequestBuilder,
    endpoint: &str,
    ctx: &WorkerContext,
) -> reqwest::RequestBuilder {
    if is_loopback(endpoint) {
        if let Some(token) = ctx.local_auth_token.as_deref() {
            return request.header("X-Meshrabiya-Auth", token);
        }
    }
    request
}

fn is_loopback(endpoint: &str) -> bool {
    endpoint.contains("127.0.0.1") || endpoint.contains("localhost") || endpoint.contains("::1")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::routing::post;
    use axum::Router;
    use chrono::Utc;
    use meshrabiya_gossip::NoOpGossipBus;
    use meshrabiya_signer::NoSigner;
    use std::net::SocketAddr;

    fn sample_job(id: Uuid, origin_id: &str) -> ReplicationJob {
        let mut job = ReplicationJob::new(
            id,
            format!("{id}.blob"),
            format!("{id}.meta"),
            origin_id.into(),
            Utc::now(),
        );
        job.target_replicas = 1;
        job
    }

    async fn write_job_meta_blob(dir: &Path, job: &ReplicationJob) {
        tokio::fs::write(
            dir.join(format!("{}.job", job.id)),
            serde_json::to_vec(job).unwrap(),
        )
        .await
        .unwrap();
        let meta = meshrabiya_codec::MetadataRecord {
            id: job.id,
            size: 7,
            created_at: Utc::now(),
            owner_id: "owner".into(),
            owner_tags: vec![],
        };
        tokio::fs::write(dir.join(&job.meta_path), serde_json::to_vec(&meta).unwrap())
            .await
            .unwrap();
        tokio::fs::write(dir.join(&job.blob_path), b"payload").await.unwrap();
    }

    fn ctx(dir: &Path, test_mode: bool) -> WorkerContext {
        WorkerContext::new(
            dir.to_path_buf(),
            Arc::new(NoOpGossipBus),
            Arc::new(NoSigner::default()),
            "origin-node",
            WorkerConfig {
                offer_window: Duration::from_millis(5),
                replication_wait: Duration::from_millis(20),
                poll_interval: Duration::from_millis(5),
                test_mode,
                ..Default::default()
            },
            None,
        )
    }

    #[tokio::test]
    async fn missing_job_file_is_a_fatal_failure() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = ctx(dir.path(), false);
        let outcome = run(&dir.path().join("missing.job"), &ctx).await;
        assert!(matches!(outcome, WorkerOutcome::Failure));
    }

    #[tokio::test]
    async fn no_offers_and_no_assignments_requests_retry() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let job = sample_job(id, "origin-node");
        write_job_meta_blob(dir.path(), &job).await;
        let ctx = ctx(dir.path(), false);

        let outcome = run(&dir.path().join(format!("{id}.job")), &ctx).await;
        assert!(matches!(outcome, WorkerOutcome::Retry { attempt: 1 }));

        let written: ReplicationJob = serde_json::from_slice(
            &tokio::fs::read(dir.path().join(format!("{id}.job")))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(written.status, JobStatus::NoOffers);
    }

    #[tokio::test]
    async fn never_uploads_to_own_originator() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let mut job = sample_job(id, "origin-node");
        job.assignments.push(Assignment {
            request_id: Uuid::new_v4(),
            assignee_id: "origin-node".into(),
            blob_id: id,
            capability_token: "tok".into(),
            upload_endpoint: Some("http://127.0.0.1:9/store".into()),
        });
        write_job_meta_blob(dir.path(), &job).await;
        let ctx = ctx(dir.path(), false);

        let outcome = run(&dir.path().join(format!("{id}.job")), &ctx).await;
        let written: ReplicationJob = serde_json::from_slice(
            &tokio::fs::read(dir.path().join(format!("{id}.job")))
                .await
                .unwrap(),
        )
        .unwrap();
        assert!(written.assignment_results.is_empty());
        assert!(matches!(outcome, WorkerOutcome::Retry { .. }));
    }

    #[tokio::test]
    async fn unsupported_endpoint_scheme_records_failure() {
        let dir = tempfile::tempdir().unwrap();
        let id = Uuid::new_v4();
        let mut job = sample_job(id, "origin-node");
        job.assignments.push(Assignment {
            request_id: Uuid::new_v4(),
            assignee_id: "onion-peer".into(),
            blob_id: id,
            capability_token: "tok".into(),
            upload_endpoint: Some("onion://abcdef.onion/store".into()),
        });
        write_job_meta_blob(dir.path(), &job).await;
        let ctx = ctx(dir.path(), false);

        run(&dir.path().join(format!("{id}.job")), &ctx).await;
        let written: ReplicationJob = serde_json::from_slice(
            &tokio::fs::read(dir.path().join(format!("{id}.job")))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(written.assignment_results.len(), 1);
        assert!(!written.assignment_results[0].success);
        assert_eq!(
            written.assignment_results[0].message.as_deref(),
            Some("unsupported endpoint")
        );
    }

    #[tokio::test]
    async fn successful_upload_completes_the_job() {
        let dir = tempfile::tempdir().unwrap();
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let app = Router::new().route("/store", post(|| async { "ok" }));
        let listener = tokio::net::TcpListener::bind(addr).await.unwrap();
        let bound = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let id = Uuid::new_v4();
        let mut job = sample_job(id, "origin-node");
        job.assignments.push(Assignment {
            request_id: Uuid::new_v4(),
            assignee_id: "peer1".into(),
            blob_id: id,
            capability_token: "tok".into(),
            upload_endpoint: Some(format!("http://{bound}/store")),
        });
        write_job_meta_blob(dir.path(), &job).await;
        let ctx = ctx(dir.path(), false);

        let outcome = run(&dir.path().join(format!("{id}.job")), &ctx).await;
        assert!(matches!(outcome, WorkerOutcome::Success));

        let written: ReplicationJob = serde_json::from_slice(
            &tokio::fs::read(dir.path().join(format!("{id}.job")))
                .await
                .unwrap(),
        )
        .unwrap();
        assert_eq!(written.status, JobStatus::Complete);
        assert_eq!(written.accepted, 1);
    }
}
