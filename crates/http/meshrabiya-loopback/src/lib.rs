//! Loopback Upload Endpoint.
//!
//! A small `axum` server bound to loopback only, used both by local clients
//! completing a descriptor handshake and by remote peers finishing an
//! Assignment upload. Every route sits behind a device-secret auth
//! check; `/store` additionally redeems a one-time descriptor token when the
//! caller presents one, closing the gap where any string would otherwise be
//! accepted as a capability.

use axum::{
    extract::{FromRequest, Multipart, Request, State},
    http::{header, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use futures::StreamExt;
use meshrabiya_blobstore::{BlobStore, BlobStoreError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use uuid::Uuid;

const API_VERSION: u32 = 1;
const DEFAULT_MAX_BODY_BYTES: usize = 64 * 1024 * 1024;
const SERVICE_UNAVAILABLE_RETRY_AFTER_SECS: u64 = 5;

/// A per-device secret, generated once and persisted at a fixed path.
pub struct LocalToken {
    value: String,
}

impl LocalToken {
    /// Reads an existing secret at `path`, or generates and persists a fresh
    /// one if the file is absent or empty.
    pub fn load_or_generate(path: &Path) -> io::Result<Self> {
        if let Ok(existing) = std::fs::read_to_string(path) {
            let trimmed = existing.trim();
            if !trimmed.is_empty() {
                return Ok(Self { value: trimmed.to_string() });
            }
        }
        let value = Uuid::new_v4().to_string();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, &value)?;
        Ok(Self { value })
    }

    pub fn from_value(value: impl Into<String>) -> Self {
        Self { value: value.into() }
    }

    pub fn matches(&self, candidate: &str) -> bool {
        self.value == candidate
    }

    pub fn value(&self) -> &str {
        &self.value
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("missing X-Meshrabiya-Auth header")]
    AuthRequired,
    #[error("invalid X-Meshrabiya-Auth header")]
    Unauthorized,
    #[error("descriptor token rejected: {0}")]
    VerificationFailed(String),
    #[error("node is not participating in delegation")]
    ServiceUnavailable,
    #[error("blob exceeds configured size cap")]
    TooLarge,
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::AuthRequired | AppError::Unauthorized | AppError::VerificationFailed(_) => {
                (StatusCode::UNAUTHORIZED, Json(serde_json::json!({ "error": "unauthorized" })))
                    .into_response()
            }
            AppError::ServiceUnavailable => {
                let mut response = (
                    StatusCode::SERVICE_UNAVAILABLE,
                    Json(serde_json::json!({
                        "error": "service_unavailable",
                        "message": "this node is not currently participating in delegation",
                        "retryAfter": SERVICE_UNAVAILABLE_RETRY_AFTER_SECS,
                    })),
                )
                    .into_response();
                response.headers_mut().insert(
                    header::RETRY_AFTER,
                    HeaderValue::from_str(&SERVICE_UNAVAILABLE_RETRY_AFTER_SECS.to_string())
                        .expect("integer formats as a valid header value"),
                );
                response
            }
            AppError::TooLarge => {
                (StatusCode::PAYLOAD_TOO_LARGE, Json(serde_json::json!({ "error": "too_large" })))
                    .into_response()
            }
            AppError::Internal(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "internal", "ex": err.to_string() })),
            )
                .into_response(),
        }
    }
}

/// Shared state behind every route. Descriptor tokens are tracked in-process
/// only; a node restart forgets any handshake that hadn't yet completed.
#[derive(Clone)]
pub struct AppState {
    pub blob_store: Arc<BlobStore>,
    pub token: Arc<LocalToken>,
    participating: Arc<AtomicBool>,
    onion_pubkey: String,
    onion_address: Option<String>,
    public_base_url: String,
    max_body_bytes: usize,
    descriptors: Arc<StdMutex<HashMap<String, Uuid>>>,
}

impl AppState {
    pub fn new(
        blob_store: Arc<BlobStore>,
        token: Arc<LocalToken>,
        onion_pubkey: impl Into<String>,
        onion_address: Option<String>,
        public_base_url: impl Into<String>,
    ) -> Self {
        Self {
            blob_store,
            token,
            participating: Arc::new(AtomicBool::new(true)),
            onion_pubkey: onion_pubkey.into(),
            onion_address,
            public_base_url: public_base_url.into(),
            max_body_bytes: DEFAULT_MAX_BODY_BYTES,
            descriptors: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    pub fn set_participating(&self, participating: bool) {
        self.participating.store(participating, Ordering::SeqCst);
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/identity", get(identity))
        .route("/store", post(store))
        .route("/descriptor", post(descriptor))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth))
        .layer(middleware::from_fn(connection_close))
        .with_state(state)
}

/// Binds an ephemeral loopback port and serves `router(state)` on it,
/// returning the bound address and a handle to the background task.
pub async fn serve(state: AppState) -> io::Result<(SocketAddr, JoinHandle<()>)> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let app = router(state);
    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "loopback server exited");
        }
    });
    Ok((addr, handle))
}

async fn require_auth(State(state): State<AppState>, request: Request, next: Next) -> Response {
    match request.headers().get("x-meshrabiya-auth").and_then(|v| v.to_str().ok()) {
        Some(value) if state.token.matches(value) => next.run(request).await,
        Some(_) => AppError::Unauthorized.into_response(),
        None => AppError::AuthRequired.into_response(),
    }
}

async fn connection_close(request: Request, next: Next) -> Response {
    let mut response = next.run(request).await;
    response
        .headers_mut()
        .insert(header::CONNECTION, HeaderValue::from_static("close"));
    response
}

#[derive(Serialize)]
struct IdentityResponse {
    onion_pubkey: String,
    onion_address: Option<String>,
    api_version: u32,
}

async fn identity(State(state): State<AppState>) -> impl IntoResponse {
    Json(IdentityResponse {
        onion_pubkey: state.onion_pubkey.clone(),
        onion_address: state.onion_address.clone(),
        api_version: API_VERSION,
    })
}

/// Accepts a raw or multipart body and hands it straight to the Blob Store's
/// ingest path. A `X-Meshrabiya-Descriptor-Token` header, if present, must
/// name a token this node itself issued via `/descriptor`; it is redeemed
/// (removed) on first use. Tokens carried in an Assignment's
/// `X-Meshrabiya-Capability` header are the Orchestrator's concern, not
/// this node's, and are accepted without a lookup here.
async fn store(State(state): State<AppState>, request: Request) -> Response {
    if !state.participating.load(Ordering::SeqCst) {
        return AppError::ServiceUnavailable.into_response();
    }

    let (parts, body) = request.into_parts();

    if let Some(descriptor_token) = parts
        .headers
        .get("x-meshrabiya-descriptor-token")
        .and_then(|v| v.to_str().ok())
    {
        let redeemed = state.descriptors.lock().unwrap().remove(descriptor_token);
        if redeemed.is_none() {
            return AppError::VerificationFailed(
                "descriptor token not recognized or already redeemed".into(),
            )
            .into_response();
        }
    }

    let content_type = parts
        .headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let staged = if content_type.starts_with("multipart/") {
        stage_multipart_field(Request::from_parts(parts, body), &state).await
    } else {
        stage_raw_body(body, state.max_body_bytes).await
    };

    let (reader, tmp_path) = match staged {
        Ok(staged) => staged,
        Err(response) => return response,
    };

    let result = state.blob_store.ingest(reader, "loopback-peer", vec![]).await;
    let _ = tokio::fs::remove_file(&tmp_path).await;

    match result {
        Ok(id) => (StatusCode::OK, Json(serde_json::json!({ "blobId": id }))).into_response(),
        Err(BlobStoreError::TooLarge) => AppError::TooLarge.into_response(),
        Err(e) => AppError::Internal(anyhow::anyhow!(e)).into_response(),
    }
}

fn staging_path() -> PathBuf {
    std::env::temp_dir().join(format!("meshrabiya-upload-{}.tmp", Uuid::new_v4()))
}

fn internal_response<E: std::fmt::Display>(e: E) -> Response {
    AppError::Internal(anyhow::anyhow!("{e}")).into_response()
}

/// Streams a `Content-Length`-bearing raw body into a temp file, rejecting
/// the upload the instant the running total exceeds `max_bytes` rather than
/// buffering the whole body in memory first.
async fn stage_raw_body(
    body: axum::body::Body,
    max_bytes: usize,
) -> Result<(tokio::fs::File, PathBuf), Response> {
    let path = staging_path();
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(internal_response)?;

    let mut stream = body.into_data_stream();
    let mut total: usize = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(internal_response)?;
        total += chunk.len();
        if total > max_bytes {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(AppError::TooLarge.into_response());
        }
        file.write_all(&chunk).await.map_err(internal_response)?;
    }
    file.flush().await.map_err(internal_response)?;

    let reader = tokio::fs::File::open(&path).await.map_err(internal_response)?;
    Ok((reader, path))
}

/// Streams the first multipart field's chunks into a temp file, reusing the
/// same staged-file handoff as the raw path.
async fn stage_multipart_field(
    request: Request,
    state: &AppState,
) -> Result<(tokio::fs::File, PathBuf), Response> {
    let mut multipart = Multipart::from_request(request, state)
        .await
        .map_err(internal_response)?;
    let Some(mut field) = multipart.next_field().await.map_err(internal_response)? else {
        return Err(internal_response("multipart body carried no fields"));
    };

    let path = staging_path();
    let mut file = tokio::fs::File::create(&path)
        .await
        .map_err(internal_response)?;

    let mut total: usize = 0;
    while let Some(chunk) = field.chunk().await.map_err(internal_response)? {
        total += chunk.len();
        if total > state.max_body_bytes {
            let _ = tokio::fs::remove_file(&path).await;
            return Err(AppError::TooLarge.into_response());
        }
        file.write_all(&chunk).await.map_err(internal_response)?;
    }
    file.flush().await.map_err(internal_response)?;

    let reader = tokio::fs::File::open(&path).await.map_err(internal_response)?;
    Ok((reader, path))
}

#[derive(Deserialize)]
struct DescriptorRequest {
    #[allow(dead_code)]
    offerer_id: String,
    #[allow(dead_code)]
    size_bytes: u64,
}

#[derive(Serialize)]
struct DescriptorResponse {
    #[serde(rename = "descriptorId")]
    descriptor_id: Uuid,
    accepted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    upload_endpoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
}

async fn descriptor(State(state): State<AppState>, Json(_req): Json<DescriptorRequest>) -> Response {
    if !state.participating.load(Ordering::SeqCst) {
        return AppError::ServiceUnavailable.into_response();
    }

    let descriptor_id = Uuid::new_v4();
    let token = Uuid::new_v4().to_string();
    state.descriptors.lock().unwrap().insert(token.clone(), descriptor_id);

    (
        StatusCode::OK,
        Json(DescriptorResponse {
            descriptor_id,
            accepted: true,
            upload_endpoint: Some(format!("{}/store", state.public_base_url)),
            token: Some(token),
        }),
    )
        .into_response()
}
