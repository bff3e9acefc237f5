//! Embedded HTTP server side of the peer transport
//!
//! The handshake endpoint is the only plaintext route. Every other
//! route runs through the seal/open pipeline: request bodies are opened
//! with the sender's session, responses are sealed back to it. A forged
//! device header yields a response the impostor cannot open.

use axum::extract::{ConnectInfo, DefaultBodyLimit, Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::directory::{ConnectionState, PeerDirectory};
use crate::discovery::types::DeviceInfo;
use crate::identity::DeviceIdentity;
use crate::paste::{BlobStore, PasteStore};
use crate::secure::{PendingHandshake, Role, SecureStore};
use crate::sync::Reconciler;
use crate::transport::protocol::{
    ChangesRequest, ChangesResponse, HandshakeRequest, HandshakeResponse, Heartbeat, HeartbeatAck,
    SyncBatch, DEVICE_ID_HEADER, PROTOCOL_VERSION,
};

const CHANGES_PAGE_LIMIT: usize = 500;

/// Shared state behind every route
pub struct AppState {
    /// Service configuration
    pub config: Arc<Config>,
    /// Local signing identity
    pub identity: Arc<DeviceIdentity>,
    /// Device directory
    pub directory: PeerDirectory,
    /// Live sessions
    pub secure: SecureStore,
    /// Record store
    pub store: Arc<PasteStore>,
    /// Blob store
    pub blobs: BlobStore,
    /// Apply path for inbound mutations
    pub reconciler: Arc<Reconciler>,
}

/// Error type rendered as an HTTP status
struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, message)
    }

    fn internal(message: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, self.message).into_response()
    }
}

impl AppState {
    /// Open a sealed request body, identifying the sender from headers.
    /// A body that fails to open tears the session down.
    async fn open_request(
        &self,
        headers: &HeaderMap,
        body: &[u8],
    ) -> Result<(Uuid, Vec<u8>), ApiError> {
        let peer_id = headers
            .get(DEVICE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| ApiError::bad_request("missing or invalid device header"))?;

        if !self.secure.has_session(&peer_id).await {
            return Err(ApiError::unauthorized("no session"));
        }

        match self.secure.open(&peer_id, body, peer_id.as_bytes()).await {
            Ok(plaintext) => Ok((peer_id, plaintext)),
            Err(e) => {
                warn!("Dropping session with {}: {}", peer_id, e);
                self.secure.remove(&peer_id).await;
                self.directory
                    .set_state(&peer_id, ConnectionState::Disconnected)
                    .await;
                Err(ApiError::unauthorized("session rejected"))
            }
        }
    }

    /// Seal a response body back to the sender
    async fn seal_response<T: Serialize>(
        &self,
        peer_id: &Uuid,
        value: &T,
    ) -> Result<Vec<u8>, ApiError> {
        let plaintext =
            serde_json::to_vec(value).map_err(|e| ApiError::internal(e.to_string()))?;
        self.seal_bytes(peer_id, &plaintext).await
    }

    async fn seal_bytes(&self, peer_id: &Uuid, plaintext: &[u8]) -> Result<Vec<u8>, ApiError> {
        self.secure
            .seal(peer_id, plaintext, self.config.device_id.as_bytes())
            .await
            .map_err(|e| ApiError::internal(e.to_string()))
    }

    /// Require a session to exist for the claimed device on body-less
    /// routes. The response is sealed to that session, so a forged
    /// header yields nothing readable.
    async fn require_session(&self, headers: &HeaderMap) -> Result<Uuid, ApiError> {
        let peer_id = headers
            .get(DEVICE_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .ok_or_else(|| ApiError::bad_request("missing or invalid device header"))?;

        if !self.secure.has_session(&peer_id).await {
            return Err(ApiError::unauthorized("no session"));
        }
        Ok(peer_id)
    }
}

/// Build the transport router
pub fn router(state: Arc<AppState>) -> Router {
    // A sealed frame adds a counter and a GCM tag on top of the payload.
    let body_limit = state.config.sync.max_payload + 4096;

    Router::new()
        .route("/session/handshake", post(handshake))
        .route("/sync/heartbeat", post(heartbeat))
        .route("/sync/messages", post(messages))
        .route("/sync/changes", post(changes))
        .route("/pull/manifest/{hash}", get(pull_manifest))
        .route("/pull/chunk/{hash}/{index}", get(pull_chunk))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// The embedded transport server
pub struct PasteServer {
    state: Arc<AppState>,
}

impl PasteServer {
    /// Create a server around shared state
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    /// Serve on an already-bound listener until the task is cancelled
    pub async fn serve(self, listener: TcpListener) -> std::io::Result<()> {
        let addr = listener.local_addr()?;
        info!("Transport listening on {}", addr);

        let app = router(self.state);
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
    }
}

async fn handshake(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    Json(request): Json<HandshakeRequest>,
) -> Result<Json<HandshakeResponse>, ApiError> {
    if request.protocol_version != PROTOCOL_VERSION {
        debug!(
            "Handshake from {} at protocol v{}, ours is v{}",
            request.device_id, request.protocol_version, PROTOCOL_VERSION
        );
        return Ok(Json(HandshakeResponse::Incompatible {
            protocol_version: PROTOCOL_VERSION,
        }));
    }

    let offer = request
        .offer()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    offer
        .verify()
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let fingerprint = offer.identity.fingerprint();

    // Record what we learned about the caller either way.
    let info = DeviceInfo {
        id: request.device_id,
        name: request.device_name.clone(),
        addresses: vec![SocketAddr::new(remote.ip(), request.port)],
        port: request.port,
        protocol_version: request.protocol_version,
        platform: request.platform.clone(),
        fingerprint: Some(fingerprint.clone()),
    };
    state
        .directory
        .observe(&info, false)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;
    state
        .directory
        .bind_fingerprint(&request.device_id, &fingerprint)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    if !state.directory.is_fingerprint_trusted(&fingerprint).await {
        debug!(
            "Handshake from {} ({}) parked: fingerprint not trusted",
            request.device_name, fingerprint
        );
        state
            .directory
            .set_state(&request.device_id, ConnectionState::Verifying)
            .await;
        return Ok(Json(HandshakeResponse::Unmatched { fingerprint }));
    }

    let (our_offer, pending) =
        PendingHandshake::offer(&state.identity, state.config.device_id, Role::Responder)
            .map_err(|e| ApiError::internal(e.to_string()))?;
    let cipher = pending
        .complete(&offer)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;

    let session_id = Uuid::new_v4();
    state
        .secure
        .insert(request.device_id, session_id, fingerprint, cipher)
        .await;
    state.directory.touch(&request.device_id).await;

    info!(
        "Session {} established with {} ({})",
        session_id, request.device_name, request.device_id
    );

    Ok(Json(HandshakeResponse::accepted(
        session_id,
        &our_offer,
        state.config.device_name.clone(),
    )))
}

async fn heartbeat(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Vec<u8>, ApiError> {
    let (peer_id, plaintext) = state.open_request(&headers, &body).await?;
    let _heartbeat: Heartbeat =
        serde_json::from_slice(&plaintext).map_err(|e| ApiError::bad_request(e.to_string()))?;

    state.directory.touch(&peer_id).await;

    let ack = HeartbeatAck {
        latest_seq: state
            .store
            .latest_seq()
            .await
            .map_err(|e| ApiError::internal(e.to_string()))?,
    };
    state.seal_response(&peer_id, &ack).await
}

async fn messages(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Vec<u8>, ApiError> {
    let (peer_id, plaintext) = state.open_request(&headers, &body).await?;
    let batch: SyncBatch =
        serde_json::from_slice(&plaintext).map_err(|e| ApiError::bad_request(e.to_string()))?;

    if batch.sender != peer_id {
        return Err(ApiError::bad_request("batch sender does not match session"));
    }

    let applied = state
        .reconciler
        .apply_batch(peer_id, &batch.messages)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    state.directory.touch(&peer_id).await;
    state
        .seal_response(&peer_id, &serde_json::json!({ "applied": applied }))
        .await
}

async fn changes(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Vec<u8>, ApiError> {
    let (peer_id, plaintext) = state.open_request(&headers, &body).await?;
    let request: ChangesRequest =
        serde_json::from_slice(&plaintext).map_err(|e| ApiError::bad_request(e.to_string()))?;

    let limit = request.limit.clamp(1, CHANGES_PAGE_LIMIT);
    let records = state
        .store
        .changes_since(request.since, limit)
        .await
        .map_err(|e| ApiError::internal(e.to_string()))?;

    let cursor = records.last().map(|r| r.seq).unwrap_or(request.since);
    let more = records.len() == limit;

    let response = ChangesResponse {
        records,
        cursor,
        more,
    };
    state.seal_response(&peer_id, &response).await
}

async fn pull_manifest(
    State(state): State<Arc<AppState>>,
    Path(hash): Path<String>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ApiError> {
    let peer_id = state.require_session(&headers).await?;

    if !state.blobs.has(&hash) {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "no such blob"));
    }

    let manifest = state
        .blobs
        .manifest(&hash, state.config.sync.chunk_size)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    state.seal_response(&peer_id, &manifest).await
}

async fn pull_chunk(
    State(state): State<Arc<AppState>>,
    Path((hash, index)): Path<(String, usize)>,
    headers: HeaderMap,
) -> Result<Vec<u8>, ApiError> {
    let peer_id = state.require_session(&headers).await?;

    if !state.blobs.has(&hash) {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "no such blob"));
    }

    let chunk = state
        .blobs
        .read_chunk(&hash, index, state.config.sync.chunk_size)
        .map_err(|e| ApiError::internal(e.to_string()))?;

    if chunk.is_empty() {
        return Err(ApiError::new(StatusCode::NOT_FOUND, "chunk out of range"));
    }

    state.seal_bytes(&peer_id, &chunk).await
}
