//! Sealed envelopes (§3 "Key material").
//!
//! Two modes, distinguished by a leading mode byte so `open` never needs to
//! be told which one a blob used:
//!
//! - **Anonymous** (`seal`): the sender is ephemeral and unauthenticated.
//!   Used when HQ addresses a worker it has never talked to before.
//! - **Authenticated** (`seal_from`): the sender proves who they are by
//!   encrypting with their own secret key against the recipient's public
//!   key. Used once HQ and a worker have exchanged public keys and want the
//!   other side to know a message really came from them.

use crate::crypto::keys::{PublicKey, SecretKey};
use crate::types::{Error, Result};
use crypto_box::aead::{Aead, AeadCore, OsRng};
use crypto_box::SalsaBox;

const MODE_ANONYMOUS: u8 = 0;
const MODE_AUTHENTICATED: u8 = 1;

/// Seal `plaintext` for `recipient` with no sender authentication.
pub fn seal(recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let sealed = crypto_box::seal(&mut OsRng, &recipient.0, plaintext)
        .map_err(|e| Error::crypto(format!("seal failed: {e}")))?;
    let mut out = Vec::with_capacity(sealed.len() + 1);
    out.push(MODE_ANONYMOUS);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Seal `plaintext` for `recipient`, authenticated as `sender`.
pub fn seal_from(sender: &SecretKey, recipient: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>> {
    let cipher = SalsaBox::new(&recipient.0, &sender.0);
    let nonce = SalsaBox::generate_nonce(&mut OsRng);
    let ciphertext = cipher
        .encrypt(&nonce, plaintext)
        .map_err(|e| Error::crypto(format!("seal failed: {e}")))?;
    let mut out = Vec::with_capacity(ciphertext.len() + nonce.len() + 1);
    out.push(MODE_AUTHENTICATED);
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Open a blob produced by [`seal`]. `own_secret`/`own_public` are the
/// recipient's keypair.
pub fn open(own_secret: &SecretKey, own_public: &PublicKey, blob: &[u8]) -> Result<Vec<u8>> {
    let (mode, body) = split_mode(blob)?;
    match mode {
        MODE_ANONYMOUS => crypto_box::seal_open(&own_secret.0, &own_public.0, body)
            .map_err(|e| Error::crypto(format!("open failed: {e}"))),
        MODE_AUTHENTICATED => Err(Error::crypto(
            "authenticated envelope requires the sender's public key".to_string(),
        )),
        other => Err(Error::crypto(format!("unknown envelope mode {other}"))),
    }
}

/// Open a blob produced by [`seal_from`], verifying it came from `sender`.
pub fn open_from(
    own_secret: &SecretKey,
    sender: &PublicKey,
    blob: &[u8],
) -> Result<Vec<u8>> {
    let (mode, body) = split_mode(blob)?;
    if mode != MODE_AUTHENTICATED {
        return Err(Error::crypto(
            "expected an authenticated envelope".to_string(),
        ));
    }
    if body.len() < 24 {
        return Err(Error::crypto("envelope truncated".to_string()));
    }
    let (nonce_bytes, ciphertext) = body.split_at(24);
    let nonce = crypto_box::aead::generic_array::GenericArray::from_slice(nonce_bytes);
    let cipher = SalsaBox::new(&sender.0, &own_secret.0);
    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|e| Error::crypto(format!("open failed: {e}")))
}

fn split_mode(blob: &[u8]) -> Result<(u8, &[u8])> {
    match blob.split_first() {
        Some((mode, body)) => Ok((*mode, body)),
        None => Err(Error::crypto("empty envelope".to_string())),
    }
}
