//! Wire protocol definitions for the PasteSync transport
//!
//! The handshake travels as plaintext JSON (it carries only public
//! material and signatures). Everything after it is JSON sealed inside
//! a session-cipher frame.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::identity::PublicIdentity;
use crate::paste::PasteRecord;
use crate::secure::HandshakeOffer;
use crate::transport::TransportError;

/// Protocol version for compatibility checking
pub const PROTOCOL_VERSION: u32 = 1;

/// Header naming the sending device on sealed requests
pub const DEVICE_ID_HEADER: &str = "x-pastesync-device";

/// Handshake request from an initiating peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HandshakeRequest {
    /// Initiator protocol version
    pub protocol_version: u32,

    /// Initiator device id
    pub device_id: Uuid,

    /// Initiator advertised name
    pub device_name: String,

    /// Initiator platform
    pub platform: String,

    /// Port the initiator's own transport listens on
    pub port: u16,

    /// Ed25519 identity public key, base64
    pub identity_pub: String,

    /// Ephemeral X25519 public key, base64
    pub exchange_pub: String,

    /// Handshake nonce, base64
    pub nonce: String,

    /// Identity signature over the exchange material, base64
    pub signature: String,
}

/// Handshake response from the answering peer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandshakeResponse {
    /// Exchange accepted, session established
    Accepted {
        /// Session id assigned by the responder
        session_id: Uuid,
        /// Responder device id
        device_id: Uuid,
        /// Responder advertised name
        device_name: String,
        /// Responder platform
        platform: String,
        /// Responder identity public key, base64
        identity_pub: String,
        /// Responder ephemeral X25519 public key, base64
        exchange_pub: String,
        /// Responder nonce, base64
        nonce: String,
        /// Responder signature, base64
        signature: String,
    },

    /// The initiator's identity is not trusted on the responder
    Unmatched {
        /// Fingerprint the responder saw
        fingerprint: String,
    },

    /// Protocol versions do not match
    Incompatible {
        /// Responder protocol version
        protocol_version: u32,
    },
}

fn decode_b64(field: &str, value: &str) -> Result<Vec<u8>, TransportError> {
    BASE64
        .decode(value)
        .map_err(|e| TransportError::Protocol(format!("invalid base64 in {field}: {e}")))
}

fn decode_nonce(value: &str) -> Result<[u8; 32], TransportError> {
    let bytes = decode_b64("nonce", value)?;
    bytes
        .try_into()
        .map_err(|_| TransportError::Protocol("nonce must be 32 bytes".into()))
}

impl HandshakeRequest {
    /// Build a request around our handshake offer
    pub fn from_offer(
        offer: &HandshakeOffer,
        device_name: String,
        port: u16,
    ) -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            device_id: offer.device_id,
            device_name,
            platform: std::env::consts::OS.to_string(),
            port,
            identity_pub: offer.identity.to_base64(),
            exchange_pub: BASE64.encode(&offer.exchange_pub),
            nonce: BASE64.encode(offer.nonce),
            signature: BASE64.encode(&offer.signature),
        }
    }

    /// Decode the embedded handshake offer
    pub fn offer(&self) -> Result<HandshakeOffer, TransportError> {
        Ok(HandshakeOffer {
            device_id: self.device_id,
            identity: PublicIdentity::from_base64(&self.identity_pub)
                .map_err(|e| TransportError::Protocol(e.to_string()))?,
            exchange_pub: decode_b64("exchange_pub", &self.exchange_pub)?,
            nonce: decode_nonce(&self.nonce)?,
            signature: decode_b64("signature", &self.signature)?,
        })
    }
}

impl HandshakeResponse {
    /// Build an accepted response around our handshake offer
    pub fn accepted(
        session_id: Uuid,
        offer: &HandshakeOffer,
        device_name: String,
    ) -> Self {
        HandshakeResponse::Accepted {
            session_id,
            device_id: offer.device_id,
            device_name,
            platform: std::env::consts::OS.to_string(),
            identity_pub: offer.identity.to_base64(),
            exchange_pub: BASE64.encode(&offer.exchange_pub),
            nonce: BASE64.encode(offer.nonce),
            signature: BASE64.encode(&offer.signature),
        }
    }

    /// Decode the responder's offer from an accepted response
    pub fn offer(&self) -> Result<HandshakeOffer, TransportError> {
        match self {
            HandshakeResponse::Accepted {
                device_id,
                identity_pub,
                exchange_pub,
                nonce,
                signature,
                ..
            } => Ok(HandshakeOffer {
                device_id: *device_id,
                identity: PublicIdentity::from_base64(identity_pub)
                    .map_err(|e| TransportError::Protocol(e.to_string()))?,
                exchange_pub: decode_b64("exchange_pub", exchange_pub)?,
                nonce: decode_nonce(nonce)?,
                signature: decode_b64("signature", signature)?,
            }),
            _ => Err(TransportError::Protocol(
                "no offer in a non-accepted response".into(),
            )),
        }
    }
}

/// One record mutation on the wire
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SyncMessage {
    /// Record created at the sender
    Create {
        /// The new record
        record: PasteRecord,
    },
    /// Record updated at the sender
    Update {
        /// The record after the update
        record: PasteRecord,
    },
    /// Record deleted at the sender (tombstone)
    Delete {
        /// The tombstoned record
        record: PasteRecord,
    },
}

impl SyncMessage {
    /// The record carried by this message
    pub fn record(&self) -> &PasteRecord {
        match self {
            SyncMessage::Create { record }
            | SyncMessage::Update { record }
            | SyncMessage::Delete { record } => record,
        }
    }

    /// Build the message matching a record's state transition
    pub fn for_record(record: PasteRecord, created: bool) -> Self {
        if record.deleted {
            SyncMessage::Delete { record }
        } else if created {
            SyncMessage::Create { record }
        } else {
            SyncMessage::Update { record }
        }
    }
}

/// A batch of mutations pushed to a peer
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncBatch {
    /// Sending device
    pub sender: Uuid,
    /// Mutations in sender order
    pub messages: Vec<SyncMessage>,
}

/// Periodic liveness probe
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Sending device
    pub sender: Uuid,
    /// Sender's latest change sequence
    pub latest_seq: i64,
    /// Send time
    pub sent_at: DateTime<Utc>,
}

/// Heartbeat acknowledgment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatAck {
    /// Responder's latest change sequence
    pub latest_seq: i64,
}

/// Catch-up request for changes past a cursor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesRequest {
    /// Sequence cursor; only changes past it are returned
    pub since: i64,
    /// Page size
    pub limit: usize,
}

/// Catch-up response page
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangesResponse {
    /// Records in sequence order
    pub records: Vec<PasteRecord>,
    /// Sequence cursor after this page
    pub cursor: i64,
    /// Whether more pages remain
    pub more: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::DeviceIdentity;
    use crate::paste::PasteContent;
    use crate::secure::{PendingHandshake, Role};
    use tempfile::TempDir;

    #[test]
    fn test_handshake_request_roundtrip() {
        let temp = TempDir::new().unwrap();
        let identity = DeviceIdentity::load_or_create(&temp.path().join("id.p8")).unwrap();
        let device_id = Uuid::new_v4();

        let (offer, _) = PendingHandshake::offer(&identity, device_id, Role::Initiator).unwrap();
        let request = HandshakeRequest::from_offer(&offer, "desk".into(), 13129);

        let json = serde_json::to_string(&request).unwrap();
        let parsed: HandshakeRequest = serde_json::from_str(&json).unwrap();
        let decoded = parsed.offer().unwrap();

        assert_eq!(decoded.device_id, device_id);
        assert_eq!(decoded.exchange_pub, offer.exchange_pub);
        assert_eq!(decoded.nonce, offer.nonce);
        decoded.verify().unwrap();
    }

    #[test]
    fn test_handshake_response_tags() {
        let unmatched = HandshakeResponse::Unmatched {
            fingerprint: "ab:cd".into(),
        };
        let json = serde_json::to_string(&unmatched).unwrap();
        assert!(json.contains("\"status\":\"unmatched\""));

        let incompatible = HandshakeResponse::Incompatible {
            protocol_version: 9,
        };
        let json = serde_json::to_string(&incompatible).unwrap();
        assert!(json.contains("\"status\":\"incompatible\""));
    }

    #[test]
    fn test_sync_message_for_record() {
        let record = PasteRecord::new(Uuid::new_v4(), PasteContent::Text("x".into()));

        assert!(matches!(
            SyncMessage::for_record(record.clone(), true),
            SyncMessage::Create { .. }
        ));
        assert!(matches!(
            SyncMessage::for_record(record.clone(), false),
            SyncMessage::Update { .. }
        ));

        let mut deleted = record;
        deleted.tombstone();
        assert!(matches!(
            SyncMessage::for_record(deleted, false),
            SyncMessage::Delete { .. }
        ));
    }

    #[test]
    fn test_rejects_bad_nonce_length() {
        let temp = TempDir::new().unwrap();
        let identity = DeviceIdentity::load_or_create(&temp.path().join("id.p8")).unwrap();
        let (offer, _) =
            PendingHandshake::offer(&identity, Uuid::new_v4(), Role::Initiator).unwrap();

        let mut request = HandshakeRequest::from_offer(&offer, "desk".into(), 13129);
        request.nonce = BASE64.encode([0u8; 8]);
        assert!(request.offer().is_err());
    }
}
