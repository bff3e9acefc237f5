//! Signed ephemeral key exchange
//!
//! Session establishment is a single request/response: each side offers
//! an ephemeral X25519 public key and a random nonce, signed together
//! with its device id by its Ed25519 identity key. The shared secret is
//! run through HKDF-SHA256, salted with both nonces, to derive one
//! AES-256-GCM key per direction.

use hkdf::Hkdf;
use ring::agreement::{self, EphemeralPrivateKey, UnparsedPublicKey, X25519};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::identity::{DeviceIdentity, PublicIdentity};
use crate::secure::cipher::{Role, SessionCipher, SessionKeys};
use crate::secure::SecureError;

const EXCHANGE_DOMAIN: &[u8] = b"pastesync-exchange-v1";
const INFO_I2R: &[u8] = b"pastesync i2r";
const INFO_R2I: &[u8] = b"pastesync r2i";

/// One side's contribution to the exchange
#[derive(Debug, Clone)]
pub struct HandshakeOffer {
    /// Signer's device id
    pub device_id: Uuid,
    /// Signer's Ed25519 identity public key
    pub identity: PublicIdentity,
    /// Ephemeral X25519 public key
    pub exchange_pub: Vec<u8>,
    /// Random handshake nonce
    pub nonce: [u8; 32],
    /// Identity signature over the exchange material
    pub signature: Vec<u8>,
}

impl HandshakeOffer {
    fn sign_material(device_id: &Uuid, exchange_pub: &[u8], nonce: &[u8; 32]) -> Vec<u8> {
        let mut material =
            Vec::with_capacity(EXCHANGE_DOMAIN.len() + 16 + exchange_pub.len() + nonce.len());
        material.extend_from_slice(EXCHANGE_DOMAIN);
        material.extend_from_slice(device_id.as_bytes());
        material.extend_from_slice(exchange_pub);
        material.extend_from_slice(nonce);
        material
    }

    /// Verify the identity signature on this offer
    pub fn verify(&self) -> Result<(), SecureError> {
        let material = Self::sign_material(&self.device_id, &self.exchange_pub, &self.nonce);
        self.identity
            .verify(&material, &self.signature)
            .map_err(|_| SecureError::OfferRejected)
    }
}

/// In-flight exchange state held between offer and completion
pub struct PendingHandshake {
    eph_priv: EphemeralPrivateKey,
    nonce: [u8; 32],
    role: Role,
}

impl PendingHandshake {
    /// Create our offer and the pending state needed to complete it
    pub fn offer(
        identity: &DeviceIdentity,
        device_id: Uuid,
        role: Role,
    ) -> Result<(HandshakeOffer, Self), SecureError> {
        let rng = SystemRandom::new();
        let eph_priv =
            EphemeralPrivateKey::generate(&X25519, &rng).map_err(|_| SecureError::KeyDerivation)?;
        let exchange_pub = eph_priv
            .compute_public_key()
            .map_err(|_| SecureError::KeyDerivation)?
            .as_ref()
            .to_vec();

        let mut nonce = [0u8; 32];
        rng.fill(&mut nonce).map_err(|_| SecureError::KeyDerivation)?;

        let material = HandshakeOffer::sign_material(&device_id, &exchange_pub, &nonce);
        let signature = identity.sign(&material);

        let offer = HandshakeOffer {
            device_id,
            identity: identity.public().clone(),
            exchange_pub,
            nonce,
            signature,
        };

        Ok((offer, Self {
            eph_priv,
            nonce,
            role,
        }))
    }

    /// Complete the exchange against a verified peer offer, producing a
    /// ready session cipher.
    pub fn complete(self, peer: &HandshakeOffer) -> Result<SessionCipher, SecureError> {
        peer.verify()?;

        // Salt is always initiator nonce || responder nonce so both
        // sides derive identical keys.
        let (initiator_nonce, responder_nonce) = match self.role {
            Role::Initiator => (self.nonce, peer.nonce),
            Role::Responder => (peer.nonce, self.nonce),
        };
        let mut salt_bytes = [0u8; 64];
        salt_bytes[..32].copy_from_slice(&initiator_nonce);
        salt_bytes[32..].copy_from_slice(&responder_nonce);

        let peer_pub = UnparsedPublicKey::new(&X25519, peer.exchange_pub.clone());
        let role = self.role;

        let keys = agreement::agree_ephemeral(self.eph_priv, &peer_pub, |shared_secret| {
            derive_session_keys(shared_secret, &salt_bytes, role)
        })
        .map_err(|_| SecureError::KeyDerivation)??;

        SessionCipher::new(keys, role)
    }
}

fn derive_session_keys(
    shared_secret: &[u8],
    salt_bytes: &[u8],
    role: Role,
) -> Result<SessionKeys, SecureError> {
    let hkdf = Hkdf::<Sha256>::new(Some(salt_bytes), shared_secret);

    let mut i2r = Zeroizing::new([0u8; 32]);
    let mut r2i = Zeroizing::new([0u8; 32]);

    hkdf.expand(INFO_I2R, &mut i2r[..])
        .map_err(|_| SecureError::KeyDerivation)?;
    hkdf.expand(INFO_R2I, &mut r2i[..])
        .map_err(|_| SecureError::KeyDerivation)?;

    Ok(match role {
        Role::Initiator => SessionKeys { send: i2r, recv: r2i },
        Role::Responder => SessionKeys { send: r2i, recv: i2r },
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn test_identity(dir: &TempDir, name: &str) -> DeviceIdentity {
        DeviceIdentity::load_or_create(&dir.path().join(name)).unwrap()
    }

    #[test]
    fn test_full_exchange() {
        let temp = TempDir::new().unwrap();
        let alice = test_identity(&temp, "alice.p8");
        let bob = test_identity(&temp, "bob.p8");

        let (alice_offer, alice_pending) =
            PendingHandshake::offer(&alice, Uuid::new_v4(), Role::Initiator).unwrap();
        let (bob_offer, bob_pending) =
            PendingHandshake::offer(&bob, Uuid::new_v4(), Role::Responder).unwrap();

        let mut alice_cipher = alice_pending.complete(&bob_offer).unwrap();
        let mut bob_cipher = bob_pending.complete(&alice_offer).unwrap();

        let frame = alice_cipher.seal(b"paste record", b"").unwrap();
        assert_eq!(bob_cipher.open(&frame, b"").unwrap(), b"paste record");

        let reply = bob_cipher.seal(b"ack", b"").unwrap();
        assert_eq!(alice_cipher.open(&reply, b"").unwrap(), b"ack");
    }

    #[test]
    fn test_tampered_offer_rejected() {
        let temp = TempDir::new().unwrap();
        let alice = test_identity(&temp, "alice.p8");
        let bob = test_identity(&temp, "bob.p8");

        let (mut bob_offer, _) =
            PendingHandshake::offer(&bob, Uuid::new_v4(), Role::Responder).unwrap();
        let (_, alice_pending) =
            PendingHandshake::offer(&alice, Uuid::new_v4(), Role::Initiator).unwrap();

        // Swap in a different exchange key; signature no longer matches.
        bob_offer.exchange_pub[0] ^= 0xff;
        assert!(matches!(
            alice_pending.complete(&bob_offer),
            Err(SecureError::OfferRejected)
        ));
    }

    #[test]
    fn test_offer_signed_by_wrong_identity_rejected() {
        let temp = TempDir::new().unwrap();
        let alice = test_identity(&temp, "alice.p8");
        let bob = test_identity(&temp, "bob.p8");
        let mallory = test_identity(&temp, "mallory.p8");

        let (mut bob_offer, _) =
            PendingHandshake::offer(&bob, Uuid::new_v4(), Role::Responder).unwrap();
        // Claim mallory's identity with bob's signature.
        bob_offer.identity = mallory.public().clone();

        let (_, alice_pending) =
            PendingHandshake::offer(&alice, Uuid::new_v4(), Role::Initiator).unwrap();
        assert!(alice_pending.complete(&bob_offer).is_err());
    }
}
