//! Delegation Orchestrator: broadcasts a Resource Request,
//! collects Offers within a window, selects assignees, and writes
//! Assignments back into the job file.

use meshrabiya_codec::{
    encode_envelope, Assignment, DelegationMessage, MetadataRecord, ReplicationJob,
    ResourceOffer, ResourceRequest,
};
use meshrabiya_gossip::{listener_fn, GossipBus, GossipPayload, WireMessage};
use meshrabiya_signer::Signer;
use std::io;
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("io failed: {0}")]
    Io(#[from] io::Error),
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrchestratorOutcome {
    Delegated,
    NoOffers,
}

/// Runs one Orchestrator pass over the job at `job_path`. `job_dir` is the
/// directory containing the job's sibling blob/meta files (needed to read
/// the blob's size for the Resource Request). `resolve_endpoint` lets a
/// caller (typically a test harness) attach an `upload_endpoint` to an
/// offer's resulting Assignment; production callers without a resolvable
/// mesh endpoint should pass a resolver that always returns `None`.
pub async fn process_job(
    job_dir: &Path,
    job_path: &Path,
    bus: &dyn GossipBus,
    signer: &dyn Signer,
    origin_id: &str,
    offer_window: Duration,
    resolve_endpoint: &dyn Fn(&ResourceOffer) -> Option<String>,
) -> Result<OrchestratorOutcome, OrchestratorError> {
    let mut job: ReplicationJob = serde_json::from_slice(&tokio::fs::read(job_path).await?)?;
    let meta: MetadataRecord =
        serde_json::from_slice(&tokio::fs::read(job_dir.join(&job.meta_path)).await?)?;

    let span = tracing::info_span!("replication_job", blob_id = %job.id);
    let _enter = span.enter();

    let request_id = Uuid::new_v4();
    let request = ResourceRequest {
        request_id,
        blob_id: job.id,
        size_bytes: meta.size,
        originator_id: origin_id.to_string(),
        target_replicas: job.target_replicas,
    };

    let collected: Arc<Mutex<Vec<ResourceOffer>>> = Arc::new(Mutex::new(Vec::new()));
    let collected_for_listener = collected.clone();
    let listener = listener_fn(move |payload| {
        if let GossipPayload::Typed(DelegationMessage::Offer(offer)) = payload {
            if offer.request_id == request_id {
                collected_for_listener.lock().unwrap().push(offer);
            }
        }
    });
    let subscription = bus.subscribe(listener);

    match encode_envelope(DelegationMessage::Request(request), signer) {
        Ok(envelope) => match serde_json::to_string(&envelope) {
            Ok(json) => bus.publish(WireMessage::new("delegation", json)),
            Err(e) => tracing::warn!(blob_id = %job.id, error = %e, "failed to serialize request envelope"),
        },
        Err(_) => {
            tracing::warn!(
                blob_id = %job.id,
                "no signer key available; skipping broadcast of resource request"
            );
        }
    }

    tokio::time::sleep(offer_window).await;
    bus.unsubscribe(subscription);

    let fresh_offers = std::mem::take(&mut *collected.lock().unwrap());
    job.merge_offers(fresh_offers);

    let already_assigned: std::collections::HashSet<&str> =
        job.assignments.iter().map(|a| a.assignee_id.as_str()).collect();

    let mut ranked: Vec<&ResourceOffer> = job
        .offers
        .iter()
        .filter(|o| !already_assigned.contains(o.offerer_id.as_str()))
        .collect();
    ranked.sort_by(|a, b| {
        b.estimated_bandwidth
            .cmp(&a.estimated_bandwidth)
            .then(b.available_space.cmp(&a.available_space))
    });
    let remaining_slots = (job.target_replicas as usize).saturating_sub(job.assignments.len());
    let selected: Vec<ResourceOffer> = ranked
        .into_iter()
        .take(remaining_slots)
        .cloned()
        .collect();

    let outcome = if selected.is_empty() {
        if job.assignments.is_empty() {
            job.status = meshrabiya_codec::JobStatus::NoOffers;
            OrchestratorOutcome::NoOffers
        } else {
            job.status = meshrabiya_codec::JobStatus::Delegated;
            OrchestratorOutcome::Delegated
        }
    } else {
        for offer in &selected {
            let token = Uuid::new_v4().to_string();
            job.assignments.push(Assignment {
                request_id,
                assignee_id: offer.offerer_id.clone(),
                blob_id: job.id,
                capability_token: token,
                upload_endpoint: resolve_endpoint(offer),
            });
        }
        job.status = meshrabiya_codec::JobStatus::Delegated;
        OrchestratorOutcome::Delegated
    };

    let bytes = serde_json::to_vec_pretty(&job)?;
    meshrabiya_codec::write_atomic(job_path, &bytes).await?;

    Ok(outcome)
}
