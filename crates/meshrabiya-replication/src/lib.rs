//! Top-level aggregation crate. Holds node-level configuration
//! and the end-to-end tests that exercise ingestion through a completed
//! replication job across the in-process fakes. Re-exports the pieces an
//! out-of-scope platform bridge (e.g. an Android JNI layer) would wire
//! together: Blob Store, Signer, Gossip Bus, Orchestrator, Scheduler,
//! Worker, and Loopback Endpoint.

pub use meshrabiya_blobstore::{BlobStore, BlobStoreError};
pub use meshrabiya_codec::{
    encode_envelope, verify_envelope, Assignment, AssignmentResult, DelegationMessage, JobSink,
    JobStatus, MetadataRecord, NoOpJobSink, ReplicationJob, ResourceOffer, ResourceRequest,
    SignedEnvelope,
};
pub use meshrabiya_gossip::{
    listener_fn, GossipBus, GossipListener, GossipPayload, JsonFlowGossipBus, MmcpGossipBus,
    NoOpGossipBus, SubscriptionId, WireMessage,
};
pub use meshrabiya_loopback::{AppState as LoopbackState, LocalToken};
pub use meshrabiya_orchestrator::{process_job, OrchestratorOutcome};
pub use meshrabiya_receipts::ReceiptLedger;
pub use meshrabiya_replication_worker::{
    run as run_replication_worker, WorkerConfig, WorkerContext,
};
pub use meshrabiya_scheduler::{find_pending, BackoffPolicy, JobRunner, Scheduler, WorkerOutcome};
pub use meshrabiya_signer::{verify_detached, Ed25519Signer, NoSigner, Signer};

use std::path::PathBuf;

/// Aggregates the environment-tunable knobs a long-lived node process would
/// read at start-up.
#[derive(Debug, Clone)]
pub struct ReplicationConfig {
    pub blob_dir: PathBuf,
    pub max_blob_bytes: u64,
    pub origin_id: String,
    pub local_token_path: PathBuf,
    pub http_listen_addr: String,
    pub worker: WorkerConfig,
    pub backoff: BackoffPolicy,
    pub dev_fallback_receipts: bool,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            blob_dir: PathBuf::from("./meshrabiya-data/blobs"),
            max_blob_bytes: 10 * 1024 * 1024,
            origin_id: "origin-node".to_string(),
            local_token_path: PathBuf::from("./meshrabiya-data/local_token"),
            http_listen_addr: "127.0.0.1:0".to_string(),
            worker: WorkerConfig::default(),
            backoff: BackoffPolicy::default(),
            dev_fallback_receipts: false,
        }
    }
}

impl ReplicationConfig {
    /// Builds a config from environment variables, falling back to
    /// `Default`'s values for anything unset or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            blob_dir: std::env::var("MESHRABIYA_BLOB_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.blob_dir),
            max_blob_bytes: std::env::var("MESHRABIYA_MAX_BLOB_BYTES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_blob_bytes),
            origin_id: std::env::var("MESHRABIYA_ORIGIN_ID").unwrap_or(defaults.origin_id),
            local_token_path: std::env::var("MESHRABIYA_LOCAL_TOKEN_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.local_token_path),
            http_listen_addr: std::env::var("MESHRABIYA_HTTP_LISTEN_ADDR")
                .unwrap_or(defaults.http_listen_addr),
            worker: defaults.worker,
            backoff: defaults.backoff,
            dev_fallback_receipts: std::env::var("MESHRABIYA_DEV_FALLBACK_RECEIPTS")
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(defaults.dev_fallback_receipts),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn replication_config_from_env_falls_back_to_defaults() {
        let _ = tracing_subscriber::fmt::try_init();
        std::env::remove_var("MESHRABIYA_ORIGIN_ID");
        let config = ReplicationConfig::from_env();
        assert_eq!(config.origin_id, "origin-node");
        assert_eq!(config.max_blob_bytes, 10 * 1024 * 1024);
    }

    /// Builds a fresh blob store, an origin `Ed25519Signer`, and a separate
    /// signer standing in for one fake peer that answers every `Request`
    /// with a single `Offer`. Returns the store and the shared gossip bus so
    /// callers can ingest and then drive a Worker execution against it.
    async fn node_with_one_responsive_peer(
        dir: &std::path::Path,
    ) -> (BlobStore, Arc<dyn GossipBus>, Arc<Ed25519Signer>) {
        let origin_signer = Arc::new(Ed25519Signer::generate());
        let peer_signer = Ed25519Signer::generate();
        let bus: Arc<dyn GossipBus> = Arc::new(MmcpGossipBus::new());

        let peer_bus = bus.clone();
        bus.subscribe(listener_fn(move |payload| {
            if let GossipPayload::Typed(DelegationMessage::Request(req)) = payload {
                let offer = DelegationMessage::Offer(ResourceOffer {
                    request_id: req.request_id,
                    offerer_id: "peer-1".into(),
                    available_space: 10_000_000,
                    estimated_bandwidth: 100,
                });
                if let Ok(envelope) = encode_envelope(offer, &peer_signer) {
                    if let Ok(json) = serde_json::to_string(&envelope) {
                        peer_bus.publish(WireMessage::new("delegation", json));
                    }
                }
            }
        }));

        let receipts = Arc::new(
            ReceiptLedger::open(dir.join("receipts.txt"), true)
                .await
                .unwrap(),
        );
        let blob_store = BlobStore::new(
            dir.join("blobs"),
            1024,
            origin_signer.clone(),
            receipts,
            Arc::new(NoOpJobSink),
            "origin-node",
        )
        .await
        .unwrap();

        (blob_store, bus, origin_signer)
    }

    /// Pins a freshly-ingested job's `target_replicas` down to 1 so a single
    /// fake peer's offer is enough to reach convergence deterministically.
    async fn force_single_replica(job_path: &std::path::Path) {
        let mut job: ReplicationJob =
            serde_json::from_slice(&tokio::fs::read(job_path).await.unwrap()).unwrap();
        job.target_replicas = 1;
        tokio::fs::write(job_path, serde_json::to_vec_pretty(&job).unwrap())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn ingestion_converges_to_a_completed_job_in_test_mode() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (blob_store, bus, origin_signer) = node_with_one_responsive_peer(dir.path()).await;

        let blob_id = blob_store
            .ingest(std::io::Cursor::new(b"converge-me".to_vec()), "owner-1", vec![])
            .await
            .unwrap();
        let job_path = blob_store.base_dir().join(format!("{blob_id}.job"));
        force_single_replica(&job_path).await;

        let ctx = WorkerContext::new(
            blob_store.base_dir().clone(),
            bus,
            origin_signer,
            "origin-node",
            WorkerConfig {
                offer_window: Duration::from_millis(20),
                replication_wait: Duration::from_millis(50),
                poll_interval: Duration::from_millis(5),
                test_mode: true,
                ..Default::default()
            },
            None,
        );

        let outcome = run_replication_worker(&job_path, &ctx).await;
        assert!(matches!(outcome, WorkerOutcome::Success));

        let job: ReplicationJob =
            serde_json::from_slice(&tokio::fs::read(&job_path).await.unwrap()).unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.accepted >= job.target_replicas);
    }

    struct WorkerJobRunner {
        ctx: Arc<WorkerContext>,
    }

    #[async_trait]
    impl JobRunner for WorkerJobRunner {
        async fn run(&self, job_path: PathBuf) -> WorkerOutcome {
            run_replication_worker(&job_path, &self.ctx).await
        }
    }

    #[tokio::test]
    async fn scheduler_drives_an_enqueued_job_to_completion() {
        let _ = tracing_subscriber::fmt::try_init();
        let dir = tempfile::tempdir().unwrap();
        let (blob_store, bus, origin_signer) = node_with_one_responsive_peer(dir.path()).await;

        let blob_id = blob_store
            .ingest(std::io::Cursor::new(b"scheduled-converge".to_vec()), "owner-1", vec![])
            .await
            .unwrap();
        let job_path = blob_store.base_dir().join(format!("{blob_id}.job"));
        force_single_replica(&job_path).await;

        let ctx = Arc::new(WorkerContext::new(
            blob_store.base_dir().clone(),
            bus,
            origin_signer,
            "origin-node",
            WorkerConfig {
                offer_window: Duration::from_millis(20),
                replication_wait: Duration::from_millis(50),
                poll_interval: Duration::from_millis(5),
                test_mode: true,
                ..Default::default()
            },
            None,
        ));
        let runner = Arc::new(WorkerJobRunner { ctx });
        let backoff = BackoffPolicy {
            base: Duration::from_millis(5),
            factor: 1.0,
            max: Duration::from_millis(20),
            max_attempts: 5,
        };
        let scheduler = Scheduler::new(runner, backoff, 1);
        scheduler.schedule(job_path.clone()).await;

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job: ReplicationJob =
                serde_json::from_slice(&tokio::fs::read(&job_path).await.unwrap()).unwrap();
            if job.status == JobStatus::Complete {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job did not converge before the test deadline"
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }
}
