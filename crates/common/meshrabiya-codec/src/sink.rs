use std::path::PathBuf;

/// Notified by the Blob Store whenever a new job file is written, so the
/// Scheduler can enqueue it without the Store depending on the Scheduler
/// crate.
pub trait JobSink: Send + Sync {
    fn job_created(&self, job_path: PathBuf);
}

/// Discards every notification. Used where a caller ingests blobs without
/// wiring up a scheduler, e.g. in isolated Blob Store tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpJobSink;

impl JobSink for NoOpJobSink {
    fn job_created(&self, _job_path: PathBuf) {}
}
