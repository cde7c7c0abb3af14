//! Passphrase key derivation for the keystore.
//!
//! scrypt with the parameters baked into the keystore file format. The
//! parameters are persisted alongside the ciphertext so a future version
//! can raise them without breaking old files.

use scrypt::Params;
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

use crate::error::WalletError;

pub const SCRYPT_LOG_N: u8 = 15; // N = 32768
pub const SCRYPT_R: u32 = 8;
pub const SCRYPT_P: u32 = 1;
pub const SALT_BYTES: usize = 32;
pub const KEY_BYTES: usize = 32;

/// KDF parameters as stored in the keystore file.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct KdfParams {
    pub n: u32,
    pub r: u32,
    pub p: u32,
    /// Hex-encoded 32-byte salt.
    pub salt: String,
    pub dklen: u32,
}

impl KdfParams {
    pub fn generate() -> Self {
        use rand::RngCore;
        let mut salt = [0u8; SALT_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut salt);
        Self {
            n: 1 << SCRYPT_LOG_N,
            r: SCRYPT_R,
            p: SCRYPT_P,
            salt: hex::encode(salt),
            dklen: KEY_BYTES as u32,
        }
    }
}

/// Derive the AES key for the keystore. Raw KDF failures never leave this
/// module; they surface as `InvalidPassphrase`.
pub fn derive_key(
    passphrase: &str,
    params: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_BYTES]>, WalletError> {
    let salt = hex::decode(&params.salt).map_err(|_| WalletError::InvalidPassphrase)?;
    let log_n = params
        .n
        .checked_ilog2()
        .ok_or(WalletError::InvalidPassphrase)? as u8;
    let scrypt_params = Params::new(log_n, params.r, params.p, params.dklen as usize)
        .map_err(|_| WalletError::InvalidPassphrase)?;

    let mut key = Zeroizing::new([0u8; KEY_BYTES]);
    scrypt::scrypt(passphrase.as_bytes(), &salt, &scrypt_params, key.as_mut_slice())
        .map_err(|_| WalletError::InvalidPassphrase)?;
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn same_inputs_same_key() {
        let params = KdfParams::generate();
        let k1 = derive_key("hunter2", &params).unwrap();
        let k2 = derive_key("hunter2", &params).unwrap();
        assert_eq!(*k1, *k2);
    }

    #[test]
    fn different_passphrase_different_key() {
        let params = KdfParams::generate();
        let k1 = derive_key("hunter2", &params).unwrap();
        let k2 = derive_key("hunter3", &params).unwrap();
        assert_ne!(*k1, *k2);
    }

    #[test]
    fn different_salt_different_key() {
        let a = KdfParams::generate();
        let b = KdfParams::generate();
        assert_ne!(a.salt, b.salt);
        assert_ne!(
            *derive_key("hunter2", &a).unwrap(),
            *derive_key("hunter2", &b).unwrap()
        );
    }

    #[test]
    fn params_carry_spec_values() {
        let p = KdfParams::generate();
        assert_eq!(p.n, 32768);
        assert_eq!(p.r, 8);
        assert_eq!(p.p, 1);
        assert_eq!(p.dklen, 32);
        assert_eq!(hex::decode(&p.salt).unwrap().len(), SALT_BYTES);
    }
}
