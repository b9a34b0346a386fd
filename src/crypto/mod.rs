//! Key material and sealed envelopes (§2 "C1").
//!
//! HQ and every worker hold a long-lived X25519 identity. Messages that need
//! confidentiality in transit are sealed against the recipient's public key
//! before being handed to the [`crate::protocol`] layer; secrets persisted
//! by the [`crate::store`] layer are encrypted at rest under a worker-local
//! symmetric key.

mod keys;
mod master_key;
mod seal;

pub use keys::{Identity, PublicKey, SecretKey};
pub use master_key::MasterKey;
pub use seal::{open, open_from, seal, seal_from};
