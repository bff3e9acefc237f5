//! # PasteSync
//!
//! Cross-device paste record synchronization service.
//!
//! PasteSync keeps a store of paste records in sync across a set of peer
//! devices on the local network. Peers are found over mDNS, authenticated
//! by Ed25519 device identities, and talk to each other over an embedded
//! HTTP transport whose request/response bodies are sealed with per-peer
//! session ciphers.

pub mod cli;
pub mod config;
pub mod directory;
pub mod discovery;
pub mod identity;
pub mod paste;
pub mod secure;
pub mod sync;
pub mod transport;

pub use config::Config;

/// Result type alias for PasteSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for PasteSync operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    /// Device identity error
    #[error("Identity error: {0}")]
    Identity(#[from] identity::IdentityError),

    /// Secure session error
    #[error("Session error: {0}")]
    Secure(#[from] secure::SecureError),

    /// Paste store error
    #[error("Store error: {0}")]
    Store(#[from] paste::StoreError),

    /// Transport error
    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

/// Library version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Maximum size of a single paste record payload (5MB default)
pub const MAX_PAYLOAD_SIZE: usize = 5 * 1024 * 1024;
