//! Session cipher for peer-to-peer message sealing
//!
//! Each established session holds two AES-256-GCM keys, one per
//! direction. Nonces are built from a fixed direction tag plus a
//! monotonically increasing counter, so a key stream is never shared
//! between directions and a replayed frame fails to open.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

use crate::secure::SecureError;

/// Which side of the handshake we were
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// We initiated the handshake
    Initiator,
    /// We answered the handshake
    Responder,
}

impl Role {
    fn send_tag(self) -> [u8; 4] {
        match self {
            Role::Initiator => *b"i2r\0",
            Role::Responder => *b"r2i\0",
        }
    }

    fn recv_tag(self) -> [u8; 4] {
        match self {
            Role::Initiator => *b"r2i\0",
            Role::Responder => *b"i2r\0",
        }
    }
}

/// Derived key material for one session
pub struct SessionKeys {
    /// Key for frames we send
    pub send: Zeroizing<[u8; 32]>,
    /// Key for frames we receive
    pub recv: Zeroizing<[u8; 32]>,
}

/// Authenticated cipher for one established session
pub struct SessionCipher {
    send_cipher: Aes256Gcm,
    recv_cipher: Aes256Gcm,
    role: Role,
    send_counter: u64,
    last_recv_counter: Option<u64>,
}

/// Number of bytes prefixed to every sealed frame (the send counter)
pub const FRAME_HEADER_LEN: usize = 8;

impl SessionCipher {
    /// Build a cipher from derived session keys
    pub fn new(keys: SessionKeys, role: Role) -> Result<Self, SecureError> {
        let send_cipher = Aes256Gcm::new_from_slice(keys.send.as_ref())
            .map_err(|_| SecureError::KeyDerivation)?;
        let recv_cipher = Aes256Gcm::new_from_slice(keys.recv.as_ref())
            .map_err(|_| SecureError::KeyDerivation)?;

        Ok(Self {
            send_cipher,
            recv_cipher,
            role,
            send_counter: 0,
            last_recv_counter: None,
        })
    }

    fn nonce(tag: [u8; 4], counter: u64) -> [u8; 12] {
        let mut nonce = [0u8; 12];
        nonce[..4].copy_from_slice(&tag);
        nonce[4..].copy_from_slice(&counter.to_be_bytes());
        nonce
    }

    /// Seal a plaintext into a counter-prefixed frame.
    ///
    /// `aad` binds the frame to out-of-band context (the sender's device
    /// id on the wire).
    pub fn seal(&mut self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, SecureError> {
        self.send_counter = self
            .send_counter
            .checked_add(1)
            .ok_or(SecureError::CounterExhausted)?;

        let nonce = Self::nonce(self.role.send_tag(), self.send_counter);
        let ciphertext = self
            .send_cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| SecureError::Seal)?;

        let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + ciphertext.len());
        frame.extend_from_slice(&self.send_counter.to_be_bytes());
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Open a counter-prefixed frame. Frames must arrive with strictly
    /// increasing counters; anything else is treated as a replay.
    pub fn open(&mut self, frame: &[u8], aad: &[u8]) -> Result<Vec<u8>, SecureError> {
        if frame.len() <= FRAME_HEADER_LEN {
            return Err(SecureError::MalformedFrame);
        }

        let mut counter_bytes = [0u8; 8];
        counter_bytes.copy_from_slice(&frame[..FRAME_HEADER_LEN]);
        let counter = u64::from_be_bytes(counter_bytes);

        if let Some(last) = self.last_recv_counter {
            if counter <= last {
                return Err(SecureError::Replay { counter, last });
            }
        }

        let nonce = Self::nonce(self.role.recv_tag(), counter);
        let plaintext = self
            .recv_cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &frame[FRAME_HEADER_LEN..],
                    aad,
                },
            )
            .map_err(|_| SecureError::Open)?;

        self.last_recv_counter = Some(counter);
        Ok(plaintext)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_ciphers() -> (SessionCipher, SessionCipher) {
        let a_to_b = [7u8; 32];
        let b_to_a = [9u8; 32];

        let a = SessionCipher::new(
            SessionKeys {
                send: Zeroizing::new(a_to_b),
                recv: Zeroizing::new(b_to_a),
            },
            Role::Initiator,
        )
        .unwrap();
        let b = SessionCipher::new(
            SessionKeys {
                send: Zeroizing::new(b_to_a),
                recv: Zeroizing::new(a_to_b),
            },
            Role::Responder,
        )
        .unwrap();
        (a, b)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (mut a, mut b) = paired_ciphers();

        let frame = a.seal(b"hello", b"aad").unwrap();
        let plaintext = b.open(&frame, b"aad").unwrap();
        assert_eq!(plaintext, b"hello");
    }

    #[test]
    fn test_replay_rejected() {
        let (mut a, mut b) = paired_ciphers();

        let frame = a.seal(b"once", b"").unwrap();
        b.open(&frame, b"").unwrap();
        assert!(matches!(
            b.open(&frame, b""),
            Err(SecureError::Replay { .. })
        ));
    }

    #[test]
    fn test_out_of_order_rejected() {
        let (mut a, mut b) = paired_ciphers();

        let first = a.seal(b"one", b"").unwrap();
        let second = a.seal(b"two", b"").unwrap();

        b.open(&second, b"").unwrap();
        assert!(b.open(&first, b"").is_err());
    }

    #[test]
    fn test_aad_mismatch_fails() {
        let (mut a, mut b) = paired_ciphers();

        let frame = a.seal(b"bound", b"device-a").unwrap();
        assert!(matches!(
            b.open(&frame, b"device-b"),
            Err(SecureError::Open)
        ));
    }

    #[test]
    fn test_directions_do_not_cross() {
        let (mut a, _) = paired_ciphers();

        // A frame sealed by the initiator must not open on the initiator's
        // own receive side even with the same keys.
        let frame = a.seal(b"loopback", b"").unwrap();
        assert!(a.open(&frame, b"").is_err());
    }

    #[test]
    fn test_truncated_frame() {
        let (_, mut b) = paired_ciphers();
        assert!(matches!(
            b.open(&[0u8; 8], b""),
            Err(SecureError::MalformedFrame)
        ));
    }
}
