//! HTTP client side of the peer transport

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::identity::DeviceIdentity;
use crate::paste::blobs::{BlobManifest, BlobStore};
use crate::secure::{PendingHandshake, Role, SecureStore};
use crate::transport::protocol::{
    ChangesRequest, ChangesResponse, HandshakeRequest, HandshakeResponse, Heartbeat, HeartbeatAck,
    SyncBatch, DEVICE_ID_HEADER, PROTOCOL_VERSION,
};
use crate::transport::{Result, TransportError};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const CHUNK_RETRY_DELAY: Duration = Duration::from_millis(250);

/// Result of a handshake attempt
#[derive(Debug, Clone)]
pub enum HandshakeOutcome {
    /// Session established
    Established {
        /// Session id assigned by the responder
        session_id: Uuid,
        /// Responder identity fingerprint
        fingerprint: String,
        /// Responder device id (may differ from the placeholder id of a
        /// manually configured peer)
        device_id: Uuid,
        /// Responder advertised name
        device_name: String,
        /// Responder platform
        platform: String,
    },
    /// The peer does not trust our identity
    Unmatched {
        /// Fingerprint the peer saw for us
        fingerprint: String,
    },
    /// The peer speaks a different protocol version
    Incompatible {
        /// Peer protocol version
        protocol_version: u32,
    },
}

/// Client for one peer's transport endpoint
pub struct PeerClient {
    http: reqwest::Client,
    base_url: String,
    local_id: Uuid,
    peer_id: Uuid,
    // Manually configured peers carry a placeholder id until the first
    // handshake reveals the real one.
    expect_peer_id: bool,
    secure: SecureStore,
    max_payload: usize,
    // Sealed exchanges are serialized per peer: response frames carry
    // strictly increasing counters, so round-trips must not interleave.
    exchange_lock: Mutex<()>,
}

impl PeerClient {
    /// Create a client for the peer at `addr`
    pub fn new(
        local_id: Uuid,
        peer_id: Uuid,
        expect_peer_id: bool,
        addr: SocketAddr,
        secure: SecureStore,
        max_payload: usize,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(REQUEST_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: format!("http://{addr}"),
            local_id,
            peer_id,
            expect_peer_id,
            secure,
            max_payload,
            exchange_lock: Mutex::new(()),
        })
    }

    /// The peer this client talks to
    pub fn peer_id(&self) -> Uuid {
        self.peer_id
    }

    /// Run the handshake, installing a session on success.
    ///
    /// Trust is the caller's concern: the returned fingerprint must be
    /// checked against the directory before the session is used.
    pub async fn handshake(
        &mut self,
        identity: &DeviceIdentity,
        device_name: &str,
        listen_port: u16,
    ) -> Result<HandshakeOutcome> {
        let (offer, pending) =
            PendingHandshake::offer(identity, self.local_id, Role::Initiator)
                .map_err(TransportError::Secure)?;
        let request = HandshakeRequest::from_offer(&offer, device_name.to_string(), listen_port);

        let response = self
            .http
            .post(format!("{}/session/handshake", self.base_url))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let response: HandshakeResponse = response.json().await?;
        match &response {
            HandshakeResponse::Accepted {
                session_id,
                device_name: peer_name,
                platform,
                ..
            } => {
                let peer_offer = response.offer()?;
                if peer_offer.device_id != self.peer_id {
                    if self.expect_peer_id {
                        return Err(TransportError::Protocol(format!(
                            "handshake answered by {} instead of {}",
                            peer_offer.device_id, self.peer_id
                        )));
                    }
                    // Manual peer: adopt the id the device actually has.
                    self.peer_id = peer_offer.device_id;
                }

                let fingerprint = peer_offer.identity.fingerprint();
                let cipher = pending
                    .complete(&peer_offer)
                    .map_err(TransportError::Secure)?;

                self.secure
                    .insert(self.peer_id, *session_id, fingerprint.clone(), cipher)
                    .await;

                debug!("Session {} established with {}", session_id, self.peer_id);
                Ok(HandshakeOutcome::Established {
                    session_id: *session_id,
                    fingerprint,
                    device_id: self.peer_id,
                    device_name: peer_name.clone(),
                    platform: platform.clone(),
                })
            }
            HandshakeResponse::Unmatched { fingerprint } => Ok(HandshakeOutcome::Unmatched {
                fingerprint: fingerprint.clone(),
            }),
            HandshakeResponse::Incompatible { protocol_version } => {
                if *protocol_version != PROTOCOL_VERSION {
                    Ok(HandshakeOutcome::Incompatible {
                        protocol_version: *protocol_version,
                    })
                } else {
                    Err(TransportError::Protocol(
                        "peer reported incompatibility at our own version".into(),
                    ))
                }
            }
        }
    }

    /// Send a heartbeat and return the peer's acknowledgment
    pub async fn heartbeat(&self, heartbeat: &Heartbeat) -> Result<HeartbeatAck> {
        self.sealed_post("/sync/heartbeat", heartbeat).await
    }

    /// Push a batch of record mutations
    pub async fn send_batch(&self, batch: &SyncBatch) -> Result<()> {
        let _: serde_json::Value = self.sealed_post("/sync/messages", batch).await?;
        Ok(())
    }

    /// Pull a page of changes past a cursor
    pub async fn changes(&self, request: &ChangesRequest) -> Result<ChangesResponse> {
        self.sealed_post("/sync/changes", request).await
    }

    /// Fetch the chunk manifest for a blob
    pub async fn pull_manifest(&self, hash: &str) -> Result<BlobManifest> {
        let body = self
            .sealed_get(&format!("/pull/manifest/{hash}"))
            .await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch one chunk of a blob
    pub async fn pull_chunk(&self, hash: &str, index: usize) -> Result<Vec<u8>> {
        self.sealed_get(&format!("/pull/chunk/{hash}/{index}")).await
    }

    /// Pull a whole blob chunk by chunk, verifying every piece, and
    /// store it locally. Each chunk gets a bounded number of retries.
    pub async fn pull_blob(
        &self,
        hash: &str,
        blobs: &BlobStore,
        chunk_retries: u32,
    ) -> Result<()> {
        if blobs.has(hash) {
            return Ok(());
        }

        let manifest = self.pull_manifest(hash).await?;
        debug!(
            "Pulling blob {} ({} bytes, {} chunks) from {}",
            hash,
            manifest.size,
            manifest.chunk_count(),
            self.peer_id
        );

        let mut assembled = Vec::with_capacity(manifest.size as usize);
        for index in 0..manifest.chunk_count() {
            let chunk = self
                .pull_chunk_verified(&manifest, index, chunk_retries)
                .await?;
            assembled.extend_from_slice(&chunk);
        }

        blobs
            .put_verified(hash, &assembled)
            .map_err(|_| TransportError::PullFailed(hash.to_string()))?;
        Ok(())
    }

    async fn pull_chunk_verified(
        &self,
        manifest: &BlobManifest,
        index: usize,
        retries: u32,
    ) -> Result<Vec<u8>> {
        use sha2::{Digest, Sha256};

        let mut attempt = 0;
        loop {
            attempt += 1;
            match self.pull_chunk(&manifest.hash, index).await {
                Ok(chunk) => {
                    let actual = hex::encode(Sha256::digest(&chunk));
                    if actual == manifest.chunk_hashes[index] {
                        return Ok(chunk);
                    }
                    warn!(
                        "Chunk {}/{} of {} failed verification (attempt {})",
                        index,
                        manifest.chunk_count(),
                        manifest.hash,
                        attempt
                    );
                    if attempt > retries {
                        return Err(TransportError::ChunkVerification {
                            hash: manifest.hash.clone(),
                            index,
                        });
                    }
                }
                Err(e) if attempt > retries => return Err(e),
                Err(e) => {
                    warn!("Chunk {} fetch failed (attempt {}): {}", index, attempt, e);
                }
            }
            tokio::time::sleep(CHUNK_RETRY_DELAY * attempt).await;
        }
    }

    async fn sealed_post<Req: Serialize, Resp: DeserializeOwned>(
        &self,
        path: &str,
        request: &Req,
    ) -> Result<Resp> {
        let plaintext = serde_json::to_vec(request)?;
        if plaintext.len() > self.max_payload {
            return Err(TransportError::PayloadTooLarge {
                size: plaintext.len(),
                limit: self.max_payload,
            });
        }

        let _guard = self.exchange_lock.lock().await;
        let frame = self
            .secure
            .seal(&self.peer_id, &plaintext, self.local_id.as_bytes())
            .await?;

        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .header(DEVICE_ID_HEADER, self.local_id.to_string())
            .body(frame)
            .send()
            .await?;

        let body = self.check_sealed_response(response).await?;
        Ok(serde_json::from_slice(&body)?)
    }

    async fn sealed_get(&self, path: &str) -> Result<Vec<u8>> {
        let _guard = self.exchange_lock.lock().await;

        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .header(DEVICE_ID_HEADER, self.local_id.to_string())
            .send()
            .await?;

        self.check_sealed_response(response).await
    }

    async fn check_sealed_response(&self, response: reqwest::Response) -> Result<Vec<u8>> {
        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            // The peer no longer holds our session; force a re-handshake.
            self.secure.remove(&self.peer_id).await;
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: "session rejected".into(),
            });
        }
        if !status.is_success() {
            return Err(TransportError::Rejected {
                status: status.as_u16(),
                message: response.text().await.unwrap_or_default(),
            });
        }

        let frame = response.bytes().await?;
        let plaintext = self
            .secure
            .open(&self.peer_id, &frame, self.peer_id.as_bytes())
            .await?;
        Ok(plaintext)
    }
}
