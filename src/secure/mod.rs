//! Secure session establishment and storage
//!
//! A session exists for a peer only after its identity fingerprint is
//! trusted and a signed key exchange has completed. Sessions live in the
//! [`SecureStore`]; dropping one forces a fresh handshake.

pub mod cipher;
pub mod handshake;

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

pub use cipher::{Role, SessionCipher};
pub use handshake::{HandshakeOffer, PendingHandshake};

/// Secure session errors
#[derive(Debug, Error)]
pub enum SecureError {
    /// Peer offer failed signature verification
    #[error("Handshake offer rejected")]
    OfferRejected,

    /// Key agreement or HKDF failure
    #[error("Key derivation failed")]
    KeyDerivation,

    /// Encryption failure
    #[error("Failed to seal frame")]
    Seal,

    /// Decryption or authentication failure
    #[error("Failed to open frame")]
    Open,

    /// Frame counter went backwards
    #[error("Replayed frame: counter {counter} after {last}")]
    Replay { counter: u64, last: u64 },

    /// Frame too short to carry a counter and ciphertext
    #[error("Malformed frame")]
    MalformedFrame,

    /// Session send counter wrapped
    #[error("Session counter exhausted")]
    CounterExhausted,

    /// No session established with this peer
    #[error("No session for peer {0}")]
    NoSession(Uuid),
}

/// An established session with one peer
pub struct Session {
    /// Server-assigned session id
    pub session_id: Uuid,
    /// Fingerprint the session was bound to at handshake time
    pub fingerprint: String,
    /// The cipher; locked because seal/open advance counters
    pub cipher: Mutex<SessionCipher>,
}

/// Holds the live sessions, keyed by peer device id
#[derive(Clone, Default)]
pub struct SecureStore {
    sessions: Arc<RwLock<HashMap<Uuid, Arc<Session>>>>,
}

impl SecureStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a session for a peer, replacing any previous one
    pub async fn insert(
        &self,
        peer_id: Uuid,
        session_id: Uuid,
        fingerprint: String,
        cipher: SessionCipher,
    ) -> Arc<Session> {
        let session = Arc::new(Session {
            session_id,
            fingerprint,
            cipher: Mutex::new(cipher),
        });
        self.sessions.write().await.insert(peer_id, session.clone());
        session
    }

    /// Look up the session for a peer
    pub async fn get(&self, peer_id: &Uuid) -> Option<Arc<Session>> {
        self.sessions.read().await.get(peer_id).cloned()
    }

    /// Whether a session exists for this peer
    pub async fn has_session(&self, peer_id: &Uuid) -> bool {
        self.sessions.read().await.contains_key(peer_id)
    }

    /// Drop the session for a peer, forcing a future re-handshake
    pub async fn remove(&self, peer_id: &Uuid) {
        self.sessions.write().await.remove(peer_id);
    }

    /// Seal a payload for a peer
    pub async fn seal(&self, peer_id: &Uuid, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SecureError> {
        let session = self
            .get(peer_id)
            .await
            .ok_or(SecureError::NoSession(*peer_id))?;
        let mut cipher = session.cipher.lock().await;
        cipher.seal(plaintext, aad)
    }

    /// Open a payload from a peer
    pub async fn open(&self, peer_id: &Uuid, frame: &[u8], aad: &[u8]) -> Result<Vec<u8>, SecureError> {
        let session = self
            .get(peer_id)
            .await
            .ok_or(SecureError::NoSession(*peer_id))?;
        let mut cipher = session.cipher.lock().await;
        cipher.open(frame, aad)
    }
}
