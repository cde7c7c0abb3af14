//! BIP32 hierarchical key derivation over secp256k1.
//!
//! The wallet derives exactly one key: BIP44 path m/44'/3'/0'/0/0 (coin type
//! 3 = Dogecoin). The implementation is the textbook HMAC-SHA512 ladder; no
//! extended-key serialization (xprv/xpub) is needed because nothing leaves
//! this process.

use hmac::{Hmac, Mac};
use secp256k1::{PublicKey, Scalar, Secp256k1, SecretKey};
use sha2::Sha512;
use zeroize::{Zeroize, Zeroizing};

use crate::error::WalletError;

type HmacSha512 = Hmac<Sha512>;

pub const HARDENED: u32 = 0x8000_0000;

/// BIP44 account path for the wallet's single external receiving key.
pub const DOGECOIN_BIP44_PATH: [u32; 5] = [
    44 | HARDENED, // purpose
    3 | HARDENED,  // coin type: Dogecoin
    HARDENED,      // account 0
    0,             // external chain
    0,             // index 0
];

/// A derived private key with its chain code. Zeroized on drop.
pub struct DerivedKey {
    pub secret_key: SecretKey,
    chain_code: [u8; 32],
}

impl Drop for DerivedKey {
    fn drop(&mut self) {
        // SecretKey zeroizes itself; the chain code is ours to wipe
        self.chain_code.zeroize();
    }
}

impl DerivedKey {
    /// BIP32 master key from a BIP39 seed.
    pub fn master(seed: &[u8]) -> Result<Self, WalletError> {
        let mut mac = HmacSha512::new_from_slice(b"Bitcoin seed")
            .map_err(|_| WalletError::InvalidMnemonic)?;
        mac.update(seed);
        let digest = Zeroizing::new(<[u8; 64]>::from(mac.finalize().into_bytes()));

        let secret_key =
            SecretKey::from_slice(&digest[..32]).map_err(|_| WalletError::InvalidMnemonic)?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..]);
        Ok(Self {
            secret_key,
            chain_code,
        })
    }

    /// Derive one child (hardened when `index >= HARDENED`).
    pub fn child(&self, index: u32) -> Result<Self, WalletError> {
        let secp = Secp256k1::new();
        let mut mac = HmacSha512::new_from_slice(&self.chain_code)
            .map_err(|_| WalletError::InvalidMnemonic)?;

        if index >= HARDENED {
            mac.update(&[0u8]);
            mac.update(&self.secret_key.secret_bytes());
        } else {
            let pubkey = PublicKey::from_secret_key(&secp, &self.secret_key);
            mac.update(&pubkey.serialize());
        }
        mac.update(&index.to_be_bytes());
        let digest = Zeroizing::new(<[u8; 64]>::from(mac.finalize().into_bytes()));

        let mut il = [0u8; 32];
        il.copy_from_slice(&digest[..32]);
        let tweak = Scalar::from_be_bytes(il).map_err(|_| WalletError::InvalidMnemonic)?;
        il.zeroize();

        let secret_key = self
            .secret_key
            .add_tweak(&tweak)
            .map_err(|_| WalletError::InvalidMnemonic)?;
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&digest[32..]);
        Ok(Self {
            secret_key,
            chain_code,
        })
    }

    /// Walk a full derivation path from this key.
    pub fn derive_path(&self, path: &[u32]) -> Result<Self, WalletError> {
        let mut key = self.child(path[0])?;
        for index in &path[1..] {
            key = key.child(*index)?;
        }
        Ok(key)
    }

    pub fn public_key(&self) -> PublicKey {
        let secp = Secp256k1::new();
        PublicKey::from_secret_key(&secp, &self.secret_key)
    }
}

/// Seed → the wallet's single signing key at m/44'/3'/0'/0/0.
pub fn wallet_key_from_seed(seed: &[u8]) -> Result<DerivedKey, WalletError> {
    DerivedKey::master(seed)?.derive_path(&DOGECOIN_BIP44_PATH)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::mnemonic;

    #[test]
    fn derivation_is_deterministic() {
        let phrase = mnemonic::generate().unwrap();
        let m = mnemonic::parse(&phrase).unwrap();
        let seed = mnemonic::to_seed(&m);
        let k1 = wallet_key_from_seed(seed.as_ref()).unwrap();
        let k2 = wallet_key_from_seed(seed.as_ref()).unwrap();
        assert_eq!(k1.secret_key.secret_bytes(), k2.secret_key.secret_bytes());
    }

    #[test]
    fn hardened_and_normal_children_differ() {
        let seed = [7u8; 64];
        let master = DerivedKey::master(&seed).unwrap();
        let hardened = master.child(HARDENED).unwrap();
        let normal = master.child(0).unwrap();
        assert_ne!(
            hardened.secret_key.secret_bytes(),
            normal.secret_key.secret_bytes()
        );
    }

    #[test]
    fn different_seeds_different_keys() {
        let a = wallet_key_from_seed(&[1u8; 64]).unwrap();
        let b = wallet_key_from_seed(&[2u8; 64]).unwrap();
        assert_ne!(a.secret_key.secret_bytes(), b.secret_key.secret_bytes());
    }

    #[test]
    fn bip32_vector_1_master() {
        // BIP32 test vector 1: seed 000102030405060708090a0b0c0d0e0f
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let master = DerivedKey::master(&seed).unwrap();
        assert_eq!(
            hex::encode(master.secret_key.secret_bytes()),
            "e8f32e723decf4051aefac8e2c93c9c5b214313817cdb01a1494b917c8436b35"
        );
        assert_eq!(
            hex::encode(master.chain_code),
            "873dff81c02f525623fd1fe5167eac3a55a049de3d314bb42ee227ffed37d508"
        );
    }

    #[test]
    fn bip32_vector_1_child_0h() {
        let seed = hex::decode("000102030405060708090a0b0c0d0e0f").unwrap();
        let child = DerivedKey::master(&seed).unwrap().child(HARDENED).unwrap();
        assert_eq!(
            hex::encode(child.secret_key.secret_bytes()),
            "edb2e14f9ee77d26dd93b4ecede8d16ed408ce149b6cd80b0715a2d911a0afea"
        );
    }
}
