//! AES-256-GCM at-rest encryption for stored record content

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::{Argon2, PasswordHasher};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use zeroize::{Zeroize, Zeroizing};
use zstd::stream::{decode_all, encode_all};

use crate::paste::StoreError;

const COMPRESSION_THRESHOLD: usize = 100 * 1024; // 100KB
const COMPRESSION_LEVEL: i32 = 3;

/// AES-256-GCM encryptor with file-backed key management
pub struct Encryptor {
    cipher: Aes256Gcm,
    key: Zeroizing<[u8; 32]>,
}

/// Encrypted data container with metadata
#[derive(Debug)]
pub struct EncryptedData {
    /// The encrypted ciphertext
    pub ciphertext: Vec<u8>,
    /// The nonce used for encryption
    pub nonce: Vec<u8>,
    /// Whether the data was compressed before encryption
    pub compressed: bool,
}

impl Encryptor {
    /// Create an encryptor backed by the key file at `key_path`,
    /// generating the key on first use.
    pub fn new(key_path: &Path) -> Result<Self, StoreError> {
        let key = Self::load_or_create_key(key_path)?;
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;

        Ok(Self {
            cipher,
            key: Zeroizing::new(key),
        })
    }

    /// Build from raw key material (tests)
    #[cfg(test)]
    pub fn from_key(key: [u8; 32]) -> Result<Self, StoreError> {
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| StoreError::Crypto(e.to_string()))?;
        Ok(Self {
            cipher,
            key: Zeroizing::new(key),
        })
    }

    /// Encrypt data, compressing large payloads first
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedData, StoreError> {
        let mut data = plaintext.to_vec();
        let compressed = data.len() > COMPRESSION_THRESHOLD;

        if compressed {
            data = encode_all(&data[..], COMPRESSION_LEVEL)?;
        }

        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, data.as_ref())
            .map_err(|e| StoreError::Crypto(format!("encryption failed: {e}")))?;

        data.zeroize();

        Ok(EncryptedData {
            ciphertext,
            nonce: nonce.to_vec(),
            compressed,
        })
    }

    /// Decrypt data and decompress if needed
    pub fn decrypt(&self, encrypted: &EncryptedData) -> Result<Vec<u8>, StoreError> {
        let nonce = Nonce::from_slice(&encrypted.nonce);
        let mut plaintext = self
            .cipher
            .decrypt(nonce, encrypted.ciphertext.as_ref())
            .map_err(|e| StoreError::Crypto(format!("decryption failed: {e}")))?;

        if encrypted.compressed {
            let decompressed = decode_all(&plaintext[..])?;
            plaintext.zeroize();
            plaintext = decompressed;
        }

        Ok(plaintext)
    }

    /// Compute SHA-256 checksum of data, lowercase hex
    pub fn compute_checksum(data: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(data);
        hex::encode(hasher.finalize())
    }

    fn load_or_create_key(key_path: &Path) -> Result<[u8; 32], StoreError> {
        if key_path.exists() {
            return Self::load_from_file(key_path);
        }

        let mut key = [0u8; 32];
        OsRng.fill_bytes(&mut key);
        Self::save_to_file(key_path, &key)?;
        Ok(key)
    }

    fn load_from_file(path: &Path) -> Result<[u8; 32], StoreError> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = fs::metadata(path)?.permissions().mode();
            if mode & 0o077 != 0 {
                return Err(StoreError::Crypto(format!(
                    "key file has insecure permissions: {mode:o}"
                )));
            }
        }

        let data = fs::read(path)?;
        if data.len() != 32 {
            return Err(StoreError::Crypto(format!(
                "invalid key file: expected 32 bytes, got {}",
                data.len()
            )));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(&data);
        Ok(key)
    }

    fn save_to_file(path: &Path, key: &[u8; 32]) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;

            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                let mut perms = fs::metadata(parent)?.permissions();
                perms.set_mode(0o700);
                fs::set_permissions(parent, perms)?;
            }
        }

        fs::write(path, key)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mut perms = fs::metadata(path)?.permissions();
            perms.set_mode(0o600);
            fs::set_permissions(path, perms)?;
        }

        tracing::info!("Store encryption key saved to {}", path.display());
        Ok(())
    }

    /// Derive an encryption key from a passphrase using Argon2id
    pub fn derive_from_passphrase(passphrase: &str) -> Result<[u8; 32], StoreError> {
        use argon2::password_hash::SaltString;
        use argon2::{Algorithm, Params, Version};

        let salt = SaltString::generate(&mut OsRng);
        let argon2 = Argon2::new(
            Algorithm::Argon2id,
            Version::V0x13,
            Params::new(15000, 2, 1, Some(32))
                .map_err(|e| StoreError::Crypto(format!("invalid argon2 params: {e}")))?,
        );

        let hash = argon2
            .hash_password(passphrase.as_bytes(), &salt)
            .map_err(|e| StoreError::Crypto(format!("key derivation failed: {e}")))?;

        let hash_bytes = hash
            .hash
            .ok_or_else(|| StoreError::Crypto("no hash output".into()))?;
        let bytes = hash_bytes.as_bytes();

        if bytes.len() != 32 {
            return Err(StoreError::Crypto("invalid derived key length".into()));
        }

        let mut key = [0u8; 32];
        key.copy_from_slice(bytes);
        Ok(key)
    }
}
