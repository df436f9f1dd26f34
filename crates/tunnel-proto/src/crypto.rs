//! AEAD transform for encrypted packets and tunnel data.
//!
//! Resolves the open question left by the design notes: ChaCha20-Poly1305
//! with a 96-bit nonce derived from a monotonic per-direction counter. The
//! counter is never reused for a given key, so the high 4 bytes of the
//! nonce are a fixed per-connection salt and the low 8 bytes are the
//! counter; this keeps every nonce unique without needing randomness on
//! the hot path.

use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("encryption failed")]
    EncryptFailed,
    #[error("decryption failed: authentication tag mismatch")]
    DecryptFailed,
    #[error("nonce counter exhausted")]
    NonceExhausted,
}

/// One direction (send or receive) of an encrypted stream. Each physical
/// connection owns two: one for writes, one for reads, so the nonce
/// counters never collide between directions.
pub struct DirectionalCipher {
    cipher: ChaCha20Poly1305,
    salt: [u8; 4],
    counter: AtomicU64,
}

impl DirectionalCipher {
    /// `salt` should differ between the two directions of a connection
    /// (e.g. derived from whether this endpoint dialed or accepted).
    pub fn new(key: &[u8; 32], salt: [u8; 4]) -> Self {
        Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
            salt,
            counter: AtomicU64::new(0),
        }
    }

    fn next_nonce(&self) -> Result<Nonce, CryptoError> {
        let counter = self.counter.fetch_add(1, Ordering::SeqCst);
        if counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }
        let mut bytes = [0u8; 12];
        bytes[..4].copy_from_slice(&self.salt);
        bytes[4..].copy_from_slice(&counter.to_be_bytes());
        Ok(*Nonce::from_slice(&bytes))
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;
        let mut ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::EncryptFailed)?;
        // Prepend the nonce so the reader can reconstruct it; only the
        // low 8 bytes vary per message so this is cheap.
        let mut out = Vec::with_capacity(12 + ciphertext.len());
        out.extend_from_slice(nonce.as_slice());
        out.append(&mut ciphertext);
        Ok(out)
    }

    pub fn decrypt(&self, framed: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if framed.len() < 12 {
            return Err(CryptoError::DecryptFailed);
        }
        let (nonce_bytes, ciphertext) = framed.split_at(12);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CryptoError::DecryptFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let key = [7u8; 32];
        let sender = DirectionalCipher::new(&key, [1, 0, 0, 0]);
        let receiver = DirectionalCipher::new(&key, [1, 0, 0, 0]);

        let msg = b"hello tunnel";
        let framed = sender.encrypt(msg).unwrap();
        let recovered = receiver.decrypt(&framed).unwrap();
        assert_eq!(recovered, msg);
    }

    #[test]
    fn tampered_ciphertext_fails_auth() {
        let key = [3u8; 32];
        let sender = DirectionalCipher::new(&key, [9, 9, 9, 9]);
        let mut framed = sender.encrypt(b"payload").unwrap();
        *framed.last_mut().unwrap() ^= 0xFF;

        let receiver = DirectionalCipher::new(&key, [9, 9, 9, 9]);
        assert!(receiver.decrypt(&framed).is_err());
    }

    #[test]
    fn nonces_never_repeat_within_a_direction() {
        let key = [1u8; 32];
        let sender = DirectionalCipher::new(&key, [0, 0, 0, 1]);
        let a = sender.encrypt(b"a").unwrap();
        let b = sender.encrypt(b"b").unwrap();
        assert_ne!(&a[..12], &b[..12]);
    }
}
