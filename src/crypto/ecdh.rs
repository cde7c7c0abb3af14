//! secp256k1 ECDH with HKDF-SHA256 expansion.
//!
//! Primitive for agent-to-agent encrypted payloads: both sides derive the
//! same symmetric key from their keypair and the peer's public key. The
//! wallet core exposes this but does not orchestrate any encrypted channel.

use hkdf::Hkdf;
use secp256k1::ecdh::SharedSecret;
use secp256k1::{PublicKey, SecretKey};
use sha2::Sha256;
use zeroize::Zeroizing;

use crate::error::WalletError;

/// Derive a 32-byte shared key: ECDH(secret, peer) → HKDF-SHA256(info).
pub fn shared_key(
    secret: &SecretKey,
    peer: &PublicKey,
    info: &[u8],
) -> Result<Zeroizing<[u8; 32]>, WalletError> {
    let shared = Zeroizing::new(SharedSecret::new(peer, secret).secret_bytes());
    let hk = Hkdf::<Sha256>::new(None, shared.as_slice());
    let mut okm = Zeroizing::new([0u8; 32]);
    hk.expand(info, okm.as_mut_slice())
        .map_err(|_| WalletError::Validation("HKDF expand failed".into()))?;
    Ok(okm)
}
