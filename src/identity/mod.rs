//! Device identity key management
//!
//! Every node carries a long-lived Ed25519 keypair. The public key
//! fingerprint is what operators trust; the private key signs session
//! handshakes so a peer can bind an exchange to a claimed identity.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ring::rand::SystemRandom;
use ring::signature::{Ed25519KeyPair, KeyPair as RingKeyPair, UnparsedPublicKey, ED25519};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Identity errors
#[derive(Debug, Error)]
pub enum IdentityError {
    /// IO error on key file
    #[error("Key file IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Key generation or parsing failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// Key file has unsafe permissions
    #[error("Key file has insecure permissions: {0:o}")]
    InsecurePermissions(u32),

    /// Signature verification failed
    #[error("Signature verification failed")]
    BadSignature,

    /// Malformed key material
    #[error("Invalid key format: {0}")]
    InvalidKeyFormat(String),
}

/// A peer's Ed25519 public identity key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublicIdentity {
    key_data: Vec<u8>,
}

impl PublicIdentity {
    /// Wrap raw Ed25519 public key bytes
    pub fn from_bytes(key_data: &[u8]) -> Result<Self, IdentityError> {
        if key_data.len() != 32 {
            return Err(IdentityError::InvalidKeyFormat(format!(
                "expected 32 bytes, got {}",
                key_data.len()
            )));
        }
        Ok(Self {
            key_data: key_data.to_vec(),
        })
    }

    /// Decode from base64
    pub fn from_base64(encoded: &str) -> Result<Self, IdentityError> {
        let bytes = BASE64
            .decode(encoded)
            .map_err(|e| IdentityError::InvalidKeyFormat(format!("invalid base64: {e}")))?;
        Self::from_bytes(&bytes)
    }

    /// Encode as base64
    pub fn to_base64(&self) -> String {
        BASE64.encode(&self.key_data)
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.key_data
    }

    /// SHA-256 fingerprint rendered as colon-separated hex pairs
    pub fn fingerprint(&self) -> String {
        fingerprint_of(&self.key_data)
    }

    /// Verify an Ed25519 signature over `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<(), IdentityError> {
        let public_key = UnparsedPublicKey::new(&ED25519, &self.key_data);
        public_key
            .verify(message, signature)
            .map_err(|_| IdentityError::BadSignature)
    }
}

fn fingerprint_of(key_data: &[u8]) -> String {
    let digest = Sha256::digest(key_data);
    digest
        .iter()
        .take(16)
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// The local device's signing identity
pub struct DeviceIdentity {
    key_pair: Ed25519KeyPair,
    public: PublicIdentity,
    key_path: PathBuf,
}

impl DeviceIdentity {
    /// Load the identity key from `path`, generating and persisting a new
    /// one on first run.
    pub fn load_or_create(path: &Path) -> Result<Self, IdentityError> {
        if path.exists() {
            Self::load(path)
        } else {
            Self::generate(path)
        }
    }

    fn generate(path: &Path) -> Result<Self, IdentityError> {
        let rng = SystemRandom::new();
        let pkcs8 = Ed25519KeyPair::generate_pkcs8(&rng)
            .map_err(|e| IdentityError::Crypto(e.to_string()))?;

        Self::write_key_file(path, pkcs8.as_ref())?;
        tracing::info!("Generated new device identity at {}", path.display());

        Self::from_pkcs8(pkcs8.as_ref(), path)
    }

    fn load(path: &Path) -> Result<Self, IdentityError> {
        Self::check_permissions(path)?;
        let pkcs8 = std::fs::read(path)?;
        Self::from_pkcs8(&pkcs8, path)
    }

    fn from_pkcs8(pkcs8: &[u8], path: &Path) -> Result<Self, IdentityError> {
        let key_pair = Ed25519KeyPair::from_pkcs8(pkcs8)
            .map_err(|e| IdentityError::Crypto(e.to_string()))?;
        let public = PublicIdentity::from_bytes(key_pair.public_key().as_ref())?;

        Ok(Self {
            key_pair,
            public,
            key_path: path.to_path_buf(),
        })
    }

    fn write_key_file(path: &Path, pkcs8: &[u8]) -> Result<(), IdentityError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = std::fs::metadata(parent)?.permissions();
                perms.set_mode(0o700);
                std::fs::set_permissions(parent, perms)?;
            }
        }

        std::fs::write(path, pkcs8)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = std::fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            std::fs::set_permissions(path, perms)?;
        }

        Ok(())
    }

    fn check_permissions(path: &Path) -> Result<(), IdentityError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(path)?.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(IdentityError::InsecurePermissions(mode));
            }
        }
        let _ = path;
        Ok(())
    }

    /// The public half of this identity
    pub fn public(&self) -> &PublicIdentity {
        &self.public
    }

    /// Fingerprint of our own public key
    pub fn fingerprint(&self) -> String {
        self.public.fingerprint()
    }

    /// Path the key was loaded from
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// Sign a message with the identity key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.key_pair.sign(message).as_ref().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_generate_and_reload() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("identity.p8");

        let identity = DeviceIdentity::load_or_create(&path).unwrap();
        let fingerprint = identity.fingerprint();
        assert!(path.exists());

        let reloaded = DeviceIdentity::load_or_create(&path).unwrap();
        assert_eq!(reloaded.fingerprint(), fingerprint);
    }

    #[test]
    fn test_sign_and_verify() {
        let temp = TempDir::new().unwrap();
        let identity = DeviceIdentity::load_or_create(&temp.path().join("id.p8")).unwrap();

        let message = b"handshake material";
        let signature = identity.sign(message);

        identity.public().verify(message, &signature).unwrap();
        assert!(identity
            .public()
            .verify(b"tampered", &signature)
            .is_err());
    }

    #[test]
    fn test_fingerprint_format() {
        let temp = TempDir::new().unwrap();
        let identity = DeviceIdentity::load_or_create(&temp.path().join("id.p8")).unwrap();

        let fp = identity.fingerprint();
        assert_eq!(fp.split(':').count(), 16);
        assert!(fp.split(':').all(|p| p.len() == 2));
    }

    #[cfg(unix)]
    #[test]
    fn test_rejects_world_readable_key() {
        use std::os::unix::fs::PermissionsExt;

        let temp = TempDir::new().unwrap();
        let path = temp.path().join("id.p8");
        DeviceIdentity::load_or_create(&path).unwrap();

        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o644);
        std::fs::set_permissions(&path, perms).unwrap();

        assert!(matches!(
            DeviceIdentity::load_or_create(&path),
            Err(IdentityError::InsecurePermissions(_))
        ));
    }

    #[test]
    fn test_public_identity_base64_roundtrip() {
        let temp = TempDir::new().unwrap();
        let identity = DeviceIdentity::load_or_create(&temp.path().join("id.p8")).unwrap();

        let encoded = identity.public().to_base64();
        let decoded = PublicIdentity::from_base64(&encoded).unwrap();
        assert_eq!(&decoded, identity.public());
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(PublicIdentity::from_bytes(&[0u8; 16]).is_err());
    }
}
