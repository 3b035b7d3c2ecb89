//! Content-addressed blob store.
//!
//! Owns every file under the blobs directory: body (`{id}.blob`), metadata
//! (`{id}.meta`), and replication job (`{id}.job`). The body is written via
//! write-temp-then-rename so a reader can never observe a partial blob; meta
//! and job are plain writes, acceptable because both are recoverable from
//! the body alone if absent.

use chrono::Utc;
use meshrabiya_codec::{JobSink, MetadataRecord, ReplicationJob};
use meshrabiya_receipts::ReceiptLedger;
use meshrabiya_signer::Signer;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use uuid::Uuid;

const MAX_READ_RANGE: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum BlobStoreError {
    #[error("blob not found")]
    NotFound,
    #[error("blob exceeds configured size cap")]
    TooLarge,
    #[error("io failed: {0}")]
    IoFailed(#[from] io::Error),
}

pub struct BlobStore {
    base_dir: PathBuf,
    max_blob_bytes: u64,
    signer: Arc<dyn Signer>,
    receipts: Arc<ReceiptLedger>,
    job_sink: Arc<dyn JobSink>,
    origin_id: String,
}

impl BlobStore {
    pub async fn new(
        base_dir: impl Into<PathBuf>,
        max_blob_bytes: u64,
        signer: Arc<dyn Signer>,
        receipts: Arc<ReceiptLedger>,
        job_sink: Arc<dyn JobSink>,
        origin_id: impl Into<String>,
    ) -> io::Result<Self> {
        let base_dir = base_dir.into();
        tokio::fs::create_dir_all(&base_dir).await?;
        Ok(Self {
            base_dir,
            max_blob_bytes,
            signer,
            receipts,
            job_sink,
            origin_id: origin_id.into(),
        })
    }

    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Streams `reader` into a fresh blob, then writes its metadata and
    /// replication job files, appends a receipt, and notifies the job sink.
    /// Returns `TooLarge` the instant the running total exceeds the cap,
    /// deleting the temp file.
    pub async fn ingest<R>(
        &self,
        mut reader: R,
        owner_id: &str,
        owner_tags: Vec<String>,
    ) -> Result<Uuid, BlobStoreError>
    where
        R: AsyncRead + Unpin,
    {
        let id = Uuid::new_v4();
        let blob_name = format!("{id}.blob");
        let blob_path = self.base_dir.join(&blob_name);
        let tmp_path = self.base_dir.join(format!("{blob_name}.tmp-{}", Uuid::new_v4()));

        let total = match self.stream_to_temp(&mut reader, &tmp_path).await {
            Ok(total) => total,
            Err(err) => {
                let _ = tokio::fs::remove_file(&tmp_path).await;
                return Err(err);
            }
        };

        tokio::fs::rename(&tmp_path, &blob_path).await?;
        if let Ok(dir) = tokio::fs::File::open(&self.base_dir).await {
            let _ = dir.sync_all().await;
        }

        let created_at = Utc::now();
        let meta = MetadataRecord {
            id,
            size: total,
            created_at,
            owner_id: owner_id.to_string(),
            owner_tags,
        };
        let meta_name = format!("{id}.meta");
        let meta_path = self.base_dir.join(&meta_name);
        tokio::fs::write(&meta_path, serde_json::to_vec_pretty(&meta)?).await?;

        let job = ReplicationJob::new(id, blob_name, meta_name, self.origin_id.clone(), created_at);
        let job_path = self.base_dir.join(format!("{id}.job"));
        tokio::fs::write(&job_path, serde_json::to_vec_pretty(&job)?).await?;

        if let Err(e) = self.receipts.append(id, self.signer.public_key_b64()).await {
            tracing::warn!(blob_id = %id, error = %e, "failed to append receipt");
        }

        self.job_sink.job_created(job_path);
        tracing::info!(blob_id = %id, size = total, "ingested blob");
        Ok(id)
    }

    async fn stream_to_temp<R>(&self, reader: &mut R, tmp_path: &PathBuf) -> Result<u64, BlobStoreError>
    where
        R: AsyncRead + Unpin,
    {
        let mut file = tokio::fs::File::create(tmp_path).await?;
        let mut buf = [0u8; 64 * 1024];
        let mut total: u64 = 0;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            total += n as u64;
            if total > self.max_blob_bytes {
                return Err(BlobStoreError::TooLarge);
            }
            file.write_all(&buf[..n]).await?;
        }
        file.sync_all().await?;
        Ok(total)
    }

    pub async fn open(&self, id: Uuid) -> Result<tokio::fs::File, BlobStoreError> {
        let path = self.base_dir.join(format!("{id}.blob"));
        match tokio::fs::File::open(&path).await {
            Ok(f) => Ok(f),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(BlobStoreError::NotFound),
            Err(e) => Err(BlobStoreError::IoFailed(e)),
        }
    }

    /// Reads up to `length` bytes (capped at 64 KiB) starting at `offset`.
    /// `offset >= size` returns an empty vector rather than an error.
    pub async fn read_range(
        &self,
        id: Uuid,
        offset: u64,
        length: u64,
    ) -> Result<Vec<u8>, BlobStoreError> {
        let mut file = self.open(id).await?;
        let size = file.metadata().await?.len();
        if offset >= size {
            return Ok(Vec::new());
        }
        let to_read = length.min(MAX_READ_RANGE).min(size - offset);
        file.seek(io::SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; to_read as usize];
        file.read_exact(&mut buf).await?;
        Ok(buf)
    }
}
