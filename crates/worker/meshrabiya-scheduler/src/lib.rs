//! Scheduler: deduplicated enqueue of replication jobs by
//! job-file identity, a fixed-size worker pool, exponential backoff with
//! deterministic jitter, and a bootstrap sweep that recovers in-flight jobs.

use meshrabiya_codec::{write_atomic, JobStatus, ReplicationJob};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

/// What a single Worker execution reports back to the Scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Success,
    Retry { attempt: u32 },
    Failure,
}

#[async_trait::async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job_path: PathBuf) -> WorkerOutcome;
}

/// Exponential backoff with a deterministic jitter so delays are
/// reproducible in tests without pulling in `rand`.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub factor: f64,
    pub max: Duration,
    pub max_attempts: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for(&self, job_path: &Path, attempt: u32) -> Duration {
        let exponent = attempt.min(32) as i32;
        let base_ms = self.base.as_millis() as f64 * self.factor.powi(exponent);
        let max_ms = self.max.as_millis() as f64;
        let capped_ms = base_ms.min(max_ms);
        let jitter = deterministic_jitter(job_seed(job_path), attempt);
        let jittered_ms = (capped_ms * jitter).min(max_ms);
        Duration::from_millis(jittered_ms as u64)
    }
}

fn job_seed(job_path: &Path) -> u64 {
    let mut hasher = DefaultHasher::new();
    job_path.hash(&mut hasher);
    hasher.finish()
}

/// Deterministic pseudo-jitter in `[0.5, 1.5)`, keyed on the job path and
/// attempt number so repeated calls with the same inputs are reproducible.
fn deterministic_jitter(seed: u64, attempt: u32) -> f64 {
    let mut x = seed ^ (attempt as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15);
    x ^= x >> 33;
    x = x.wrapping_mul(0xFF51_AFD7_ED55_8CCD);
    x ^= x >> 33;
    let unit = (x % 1000) as f64 / 1000.0;
    0.5 + unit
}

/// Lists job files under `dir` whose status is not terminal — used by a
/// bootstrap sweeper at start-up to recover in-flight jobs after restart.
pub async fn find_pending(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut pending = Vec::new();
    let mut entries = tokio::fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some("job") {
            continue;
        }
        let Ok(bytes) = tokio::fs::read(&path).await else {
            continue;
        };
        let Ok(job) = serde_json::from_slice::<ReplicationJob>(&bytes) else {
            continue;
        };
        if !job.is_terminal() {
            pending.push(path);
        }
    }
    Ok(pending)
}

/// Marks a job abandoned in place once its retry budget is exhausted.
async fn abandon(job_path: &Path) -> io::Result<()> {
    let bytes = tokio::fs::read(job_path).await?;
    let mut job: ReplicationJob = match serde_json::from_slice(&bytes) {
        Ok(job) => job,
        Err(e) => {
            tracing::warn!(job = ?job_path, error = %e, "failed to parse job while abandoning");
            return Ok(());
        }
    };
    job.status = JobStatus::Abandoned;
    let out = serde_json::to_vec_pretty(&job)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    write_atomic(job_path, &out).await
}

/// Deduplicated enqueue keyed on job-file identity, backed by a fixed pool
/// of worker tasks consuming a shared `mpsc` queue.
pub struct Scheduler {
    pending: Arc<Mutex<HashSet<PathBuf>>>,
    tx: mpsc::Sender<PathBuf>,
}

impl Scheduler {
    pub fn new<R>(runner: Arc<R>, backoff: BackoffPolicy, worker_count: usize) -> Self
    where
        R: JobRunner + 'static,
    {
        let (tx, rx) = mpsc::channel(1024);
        let pending = Arc::new(Mutex::new(HashSet::new()));
        spawn_workers(rx, tx.clone(), pending.clone(), runner, backoff, worker_count.max(1));
        Self { pending, tx }
    }

    /// Enqueues `job_path` for execution. A duplicate enqueue while the job
    /// is already pending or running is silently ignored.
    pub async fn schedule(&self, job_path: PathBuf) {
        let mut pending = self.pending.lock().await;
        if pending.insert(job_path.clone()) {
            drop(pending);
            if self.tx.send(job_path.clone()).await.is_err() {
                self.pending.lock().await.remove(&job_path);
            }
        }
    }

    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }
}

fn spawn_workers<R>(
    rx: mpsc::Receiver<PathBuf>,
    tx: mpsc::Sender<PathBuf>,
    pending: Arc<Mutex<HashSet<PathBuf>>>,
    runner: Arc<R>,
    backoff: BackoffPolicy,
    worker_count: usize,
) where
    R: JobRunner + 'static,
{
    let rx = Arc::new(Mutex::new(rx));
    for _ in 0..worker_count {
        let rx = rx.clone();
        let tx = tx.clone();
        let pending = pending.clone();
        let runner = runner.clone();
        tokio::spawn(async move {
            loop {
                let job_path = {
                    let mut guard = rx.lock().await;
                    guard.recv().await
                };
                let Some(job_path) = job_path else {
                    break;
                };
                let outcome = runner.run(job_path.clone()).await;
                pending.lock().await.remove(&job_path);
                match outcome {
                    WorkerOutcome::Success | WorkerOutcome::Failure => {}
                    WorkerOutcome::Retry { attempt } => {
                        if attempt >= backoff.max_attempts {
                            tracing::warn!(job = ?job_path, attempt, "max attempts reached, abandoning job");
                            if let Err(e) = abandon(&job_path).await {
                                tracing::warn!(job = ?job_path, error = %e, "failed to persist abandonment");
                            }
                            continue;
                        }
                        let delay = backoff.delay_for(&job_path, attempt);
                        let tx = tx.clone();
                        let pending = pending.clone();
                        let job_path = job_path.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            let mut guard = pending.lock().await;
                            if guard.insert(job_path.clone()) {
                                drop(guard);
                                let _ = tx.send(job_path).await;
                            }
                        });
                    }
                }
            }
        });
    }
}
