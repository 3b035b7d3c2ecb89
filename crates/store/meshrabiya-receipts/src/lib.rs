//! Append-only receipt ledger.
//!
//! One line per successful ingestion: `{blob_id}|{signer_public_key_base64}`.
//! Writes are serialised behind a single mutex and followed by a data sync.

use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ReceiptError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed receipt line: {0:?}")]
    Malformed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptLine {
    pub blob_id: String,
    pub public_key_b64: String,
}

pub struct ReceiptLedger {
    path: PathBuf,
    file: tokio::sync::Mutex<tokio::fs::File>,
    dev_fallback: bool,
}

impl ReceiptLedger {
    /// Open (creating if absent) the ledger file at `path`. `dev_fallback`
    /// controls whether a missing signer key is papered over with a
    /// deterministic placeholder or causes the receipt to be
    /// skipped.
    pub async fn open(path: impl Into<PathBuf>, dev_fallback: bool) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        Ok(Self {
            path,
            file: tokio::sync::Mutex::new(file),
            dev_fallback,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one receipt line. Returns `Ok(true)` if a line was written,
    /// `Ok(false)` if the signer had no key and the dev fallback is
    /// disabled — lookup then intentionally has no entry for this blob
    /// rather than a synthetic one.
    pub async fn append(&self, blob_id: Uuid, public_key_b64: Option<String>) -> io::Result<bool> {
        let key = match public_key_b64 {
            Some(k) => k,
            None if self.dev_fallback => fallback_key_for(blob_id),
            None => {
                tracing::warn!(
                    %blob_id,
                    "no signer key available and dev fallback disabled; skipping receipt"
                );
                return Ok(false);
            }
        };
        let line = format!("{blob_id}|{key}\n");
        let mut file = self.file.lock().await;
        file.write_all(line.as_bytes()).await?;
        file.sync_data().await?;
        Ok(true)
    }
}

fn fallback_key_for(blob_id: Uuid) -> String {
    let digest = Sha256::digest(blob_id.as_bytes());
    STANDARD.encode(digest)
}

/// Parse every line of a receipts file. Returns an empty list if the file
/// does not exist yet.
pub async fn read_lines(path: &Path) -> Result<Vec<ReceiptLine>, ReceiptError> {
    let contents = match tokio::fs::read_to_string(path).await {
        Ok(s) => s,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    contents
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| {
            let mut parts = line.splitn(2, '|');
            let blob_id = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ReceiptError::Malformed(line.to_string()))?;
            let key = parts
                .next()
                .filter(|s| !s.is_empty())
                .ok_or_else(|| ReceiptError::Malformed(line.to_string()))?;
            Ok(ReceiptLine {
                blob_id: blob_id.to_string(),
                public_key_b64: key.to_string(),
            })
        })
        .collect()
}
