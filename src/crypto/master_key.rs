//! Symmetric at-rest encryption for the local durable store's `secrets`
//! table (§4.3). Distinct from the asymmetric sealed envelopes in
//! [`crate::crypto::seal`]: this key never leaves the worker and there is no
//! second party to authenticate against, so a plain AEAD with a random
//! nonce per message is enough.

use crate::types::{Error, Result};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};

const NONCE_LEN: usize = 24;

/// A worker's local secrets-at-rest key, generated once per worker and
/// persisted to `<data_dir>/<worker_id>/master.key`.
pub struct MasterKey {
    bytes: [u8; 32],
    cipher: XChaCha20Poly1305,
}

impl MasterKey {
    /// Generate a fresh key.
    pub fn generate() -> Self {
        let key = XChaCha20Poly1305::generate_key(&mut OsRng);
        Self::from_key(key.into())
    }

    /// Load a key from its raw 32-byte representation (as read from
    /// `master.key` on disk).
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::crypto("master key must be 32 bytes".to_string()))?;
        Ok(Self::from_key(arr))
    }

    fn from_key(bytes: [u8; 32]) -> Self {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&bytes));
        Self { bytes, cipher }
    }

    /// Raw bytes, for writing to `master.key`.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.bytes
    }

    /// Encrypt `plaintext`, returning `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| Error::crypto(format!("encrypt failed: {e}")))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a blob produced by [`MasterKey::encrypt`].
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(Error::crypto("secret blob truncated".to_string()));
        }
        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|e| Error::crypto(format!("decrypt failed: {e}")))
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "MasterKey(..)")
    }
}
