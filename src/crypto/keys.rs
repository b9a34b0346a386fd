//! Key material: HQ and worker identities.
//!
//! Public keys are exchanged as opaque, base64-encoded strings (§3 "Key
//! material"). Each holder exclusively owns its secret half; public keys are
//! freely copyable and `Clone + Debug` without leaking key bytes in `Debug`
//! output.

use crate::types::{Error, Result};
use crypto_box::{PublicKey as BoxPublicKey, SecretKey as BoxSecretKey};
use rand_core::OsRng;

/// A public key, opaque outside this module beyond base64 round-tripping.
#[derive(Clone)]
pub struct PublicKey(pub(crate) BoxPublicKey);

impl PartialEq for PublicKey {
    fn eq(&self, other: &Self) -> bool {
        self.0.as_bytes() == other.0.as_bytes()
    }
}

impl Eq for PublicKey {}

impl PublicKey {
    /// Parse a public key from its base64 wire representation.
    pub fn from_str(s: &str) -> Result<Self> {
        let bytes = base64::decode(s).map_err(|e| Error::crypto(format!("invalid key: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::crypto("invalid key: expected 32 bytes".to_string()))?;
        Ok(Self(BoxPublicKey::from(arr)))
    }

    /// Encode as the opaque base64 string used on the wire.
    pub fn to_wire_string(&self) -> String {
        base64::encode(self.0.as_bytes())
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({})", self.to_wire_string())
    }
}

/// A secret key. Never serialized by Debug; never cloned implicitly.
pub struct SecretKey(pub(crate) BoxSecretKey);

impl SecretKey {
    /// Generate a fresh random keypair.
    pub fn generate() -> (Self, PublicKey) {
        let secret = BoxSecretKey::generate(&mut OsRng);
        let public = PublicKey(secret.public_key());
        (Self(secret), public)
    }

    /// Parse a secret key from its base64 representation (used to load
    /// long-lived identities from `master.key`-style files).
    pub fn from_str(s: &str) -> Result<Self> {
        let bytes = base64::decode(s).map_err(|e| Error::crypto(format!("invalid key: {e}")))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| Error::crypto("invalid key: expected 32 bytes".to_string()))?;
        Ok(Self(BoxSecretKey::from(arr)))
    }

    pub fn to_wire_string(&self) -> String {
        base64::encode(self.0.to_bytes())
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.0.public_key())
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "SecretKey(..)")
    }
}

/// A long-lived identity: a secret key plus the public key derived from it.
#[derive(Debug)]
pub struct Identity {
    pub secret: SecretKey,
    pub public: PublicKey,
}

impl Identity {
    pub fn generate() -> Self {
        let (secret, public) = SecretKey::generate();
        Self { secret, public }
    }

    pub fn from_secret(secret: SecretKey) -> Self {
        let public = secret.public_key();
        Self { secret, public }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_key_round_trips_through_wire_string() {
        let identity = Identity::generate();
        let wire = identity.public.to_wire_string();
        let parsed = PublicKey::from_str(&wire).unwrap();
        assert!(parsed == identity.public);
    }

    #[test]
    fn secret_key_round_trips_through_wire_string() {
        let identity = Identity::generate();
        let wire = identity.secret.to_wire_string();
        let parsed = SecretKey::from_str(&wire).unwrap();
        assert_eq!(parsed.public_key(), identity.public);
    }

    #[test]
    fn malformed_key_string_is_invalid_key() {
        assert!(PublicKey::from_str("not-base64!!!").is_err());
        assert!(PublicKey::from_str(&base64::encode(b"too short")).is_err());
    }
}
