//! Paste records: the data model that gets reconciled between devices

pub mod blobs;
pub mod encryption;
pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use uuid::Uuid;

pub use blobs::BlobStore;
pub use encryption::Encryptor;
pub use store::PasteStore;

/// Paste store errors
#[derive(Debug, Error)]
pub enum StoreError {
    /// SQLite error
    #[error("Database error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Encryption/decryption failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Stored row failed integrity checks
    #[error("Corrupt record {0}")]
    Corrupt(Uuid),

    /// Blob bytes do not hash to their name
    #[error("Blob hash mismatch: expected {expected}")]
    BlobMismatch { expected: String },

    /// No such record
    #[error("Record {0} not found")]
    NotFound(Uuid),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Reference to a file payload stored as a content-addressed blob
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRef {
    /// Original file name
    pub name: String,
    /// File size in bytes
    pub size: u64,
    /// SHA-256 of the file contents, lowercase hex
    pub hash: String,
}

/// The content carried by a paste record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum PasteContent {
    /// Plain text
    Text(String),

    /// HTML markup with a plain-text fallback
    Html { html: String, plain: String },

    /// Rich text format bytes
    Rtf(Vec<u8>),

    /// Inline image data
    Image { mime_type: String, data: Vec<u8> },

    /// A set of files, payloads pulled separately as blobs
    Files(Vec<FileRef>),

    /// A single ARGB color value
    Color(u32),
}

impl PasteContent {
    /// Short kind tag used for storage and display
    pub fn kind(&self) -> &'static str {
        match self {
            PasteContent::Text(_) => "text",
            PasteContent::Html { .. } => "html",
            PasteContent::Rtf(_) => "rtf",
            PasteContent::Image { .. } => "image",
            PasteContent::Files(_) => "files",
            PasteContent::Color(_) => "color",
        }
    }

    /// Approximate payload size in bytes
    pub fn size(&self) -> u64 {
        match self {
            PasteContent::Text(text) => text.len() as u64,
            PasteContent::Html { html, plain } => (html.len() + plain.len()) as u64,
            PasteContent::Rtf(data) => data.len() as u64,
            PasteContent::Image { data, .. } => data.len() as u64,
            PasteContent::Files(files) => files.iter().map(|f| f.size).sum(),
            PasteContent::Color(_) => 4,
        }
    }

    /// Content hash used for dedup across devices.
    ///
    /// Files hash over their sorted (hash, name, size) triples so the
    /// same file set produces the same record hash on every origin.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.kind().as_bytes());
        hasher.update([0u8]);
        match self {
            PasteContent::Text(text) => hasher.update(text.as_bytes()),
            PasteContent::Html { html, plain } => {
                hasher.update(html.as_bytes());
                hasher.update([0u8]);
                hasher.update(plain.as_bytes());
            }
            PasteContent::Rtf(data) => hasher.update(data),
            PasteContent::Image { mime_type, data } => {
                hasher.update(mime_type.as_bytes());
                hasher.update([0u8]);
                hasher.update(data);
            }
            PasteContent::Files(files) => {
                let mut sorted: Vec<_> = files.iter().collect();
                sorted.sort_by(|a, b| a.hash.cmp(&b.hash).then_with(|| a.name.cmp(&b.name)));
                for file in sorted {
                    hasher.update(file.hash.as_bytes());
                    hasher.update([0u8]);
                    hasher.update(file.name.as_bytes());
                    hasher.update([0u8]);
                    hasher.update(file.size.to_be_bytes());
                }
            }
            PasteContent::Color(argb) => hasher.update(argb.to_be_bytes()),
        }
        hex::encode(hasher.finalize())
    }

    /// File references carried by this content, if any
    pub fn file_refs(&self) -> &[FileRef] {
        match self {
            PasteContent::Files(files) => files,
            _ => &[],
        }
    }
}

/// A single reconciled paste record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PasteRecord {
    /// Stable record id, assigned at the origin
    pub id: Uuid,
    /// Device that created the record
    pub origin: Uuid,
    /// Content hash for dedup and integrity
    pub hash: String,
    /// Record content; cleared on tombstones
    pub content: PasteContent,
    /// Pinned records survive retention pruning
    pub favorite: bool,
    /// Tombstone marker
    pub deleted: bool,
    /// Creation time at the origin
    pub created_at: DateTime<Utc>,
    /// Last mutation time, drives conflict resolution
    pub updated_at: DateTime<Utc>,

    /// Local change sequence; never travels the wire
    #[serde(skip)]
    pub seq: i64,
    /// Whether all referenced blobs are present locally
    #[serde(skip, default = "default_complete")]
    pub complete: bool,
}

fn default_complete() -> bool {
    true
}

impl PasteRecord {
    /// Create a fresh local record
    pub fn new(origin: Uuid, content: PasteContent) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            origin,
            hash: content.content_hash(),
            content,
            favorite: false,
            deleted: false,
            created_at: now,
            updated_at: now,
            seq: 0,
            complete: true,
        }
    }

    /// Turn this record into a tombstone
    pub fn tombstone(&mut self) {
        self.deleted = true;
        self.content = PasteContent::Text(String::new());
        self.updated_at = Utc::now();
    }

    /// Total-order comparison for conflict resolution: later update wins,
    /// exact ties break on origin device id so every replica picks the
    /// same winner.
    pub fn wins_over(&self, other: &PasteRecord) -> bool {
        (self.updated_at, self.origin) > (other.updated_at, other.origin)
    }
}
