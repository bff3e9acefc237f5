//! HTTP transport carrying the sync protocol
//!
//! The server side is an embedded axum router; the client side wraps
//! reqwest. Apart from the handshake itself, every request and response
//! body is sealed with the per-peer session cipher.

pub mod client;
pub mod protocol;
pub mod server;

use thiserror::Error;
use uuid::Uuid;

pub use client::{HandshakeOutcome, PeerClient};
pub use protocol::PROTOCOL_VERSION;
pub use server::{AppState, PasteServer};

/// Transport errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Peer answered with an unexpected status
    #[error("Peer rejected request: {status} {message}")]
    Rejected {
        /// HTTP status code
        status: u16,
        /// Body or reason text
        message: String,
    },

    /// Session-layer failure
    #[error("Session error: {0}")]
    Secure(#[from] crate::secure::SecureError),

    /// Wire payload could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    /// Body exceeded the configured ceiling
    #[error("Payload of {size} bytes exceeds limit of {limit}")]
    PayloadTooLarge {
        /// Offending size
        size: usize,
        /// Configured ceiling
        limit: usize,
    },

    /// A pulled chunk failed hash verification
    #[error("Chunk {index} of blob {hash} failed verification")]
    ChunkVerification {
        /// Blob hash
        hash: String,
        /// Chunk index
        index: usize,
    },

    /// Blob pull exhausted its retries
    #[error("Pull of blob {0} failed after retries")]
    PullFailed(String),

    /// No usable address for a peer
    #[error("No address known for peer {0}")]
    NoAddress(Uuid),

    /// Store error surfaced through the transport
    #[error("Store error: {0}")]
    Store(#[from] crate::paste::StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result alias for transport operations
pub type Result<T> = std::result::Result<T, TransportError>;
