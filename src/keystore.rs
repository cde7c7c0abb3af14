//! Encrypted keystore and in-memory key custody.
//!
//! Security: the seed mnemonic and derived private key are encrypted at rest
//! with AES-256-GCM under a scrypt-derived key, written 0600. While
//! unlocked, the cleartext payload lives in process memory only; `lock()`
//! zeroizes it, and an optional inactivity timer locks automatically.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};
use parking_lot::Mutex;
use rand::RngCore;
use secp256k1::{PublicKey, Secp256k1, SecretKey};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use zeroize::{Zeroize, ZeroizeOnDrop, Zeroizing};

use crate::address::Address;
use crate::clock::SharedClock;
use crate::crypto::{hd, kdf, mnemonic};
use crate::error::WalletError;
use crate::network_type::NetworkType;
use crate::secure_fs;

pub const KEYSTORE_FILE: &str = "wallet.json";
const GCM_IV_BYTES: usize = 12;
const GCM_TAG_BYTES: usize = 16;

/// Encrypted keystore file format (`keys/wallet.json`).
#[derive(Serialize, Deserialize)]
struct KeystoreFile {
    version: u32,
    address: String,
    network: NetworkType,
    crypto: CryptoBox,
    kdf: kdf::KdfParams,
}

#[derive(Serialize, Deserialize)]
struct CryptoBox {
    /// Base64 ciphertext (without the GCM tag).
    ciphertext: String,
    /// Hex, 12 bytes.
    iv: String,
    /// Hex, 16 bytes.
    tag: String,
}

/// Cleartext payload as encrypted into the keystore.
#[derive(Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
struct KeyPayload {
    mnemonic: String,
    private_key_hex: String,
    address: String,
}

/// In-memory unlocked material. Dropped (and wiped) on lock.
struct UnlockedKey {
    mnemonic: Zeroizing<String>,
    secret_key: SecretKey,
    public_key: PublicKey,
    address: String,
}

pub struct InitResult {
    pub mnemonic: Zeroizing<String>,
    pub address: String,
    pub public_key: PublicKey,
}

pub struct Keystore {
    path: PathBuf,
    network: NetworkType,
    unlocked: Mutex<Option<UnlockedKey>>,
    auto_lock_ms: AtomicU64,
    last_access_ms: AtomicI64,
    clock: SharedClock,
}

impl Keystore {
    /// `keys_dir` is the wallet's `keys/` directory; the keystore file lives
    /// directly inside it.
    pub fn new(keys_dir: &Path, network: NetworkType, clock: SharedClock) -> Self {
        Self {
            path: keys_dir.join(KEYSTORE_FILE),
            network,
            unlocked: Mutex::new(None),
            auto_lock_ms: AtomicU64::new(0),
            last_access_ms: AtomicI64::new(0),
            clock,
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.path.exists()
    }

    pub fn is_unlocked(&self) -> bool {
        self.unlocked.lock().is_some()
    }

    /// Create a brand-new wallet. Fails if a keystore already exists.
    /// Leaves the wallet unlocked.
    pub fn init(&self, passphrase: &str) -> Result<InitResult, WalletError> {
        if self.is_initialized() {
            return Err(WalletError::AlreadyInitialized);
        }
        let phrase = mnemonic::generate()?;
        let result = self.install_mnemonic(&phrase, passphrase)?;
        tracing::info!(address = %result.address, "🔑 Wallet initialized");
        Ok(result)
    }

    /// Restore from an existing mnemonic, overwriting any keystore on disk.
    /// Leaves the wallet unlocked.
    pub fn recover(&self, phrase: &str, passphrase: &str) -> Result<String, WalletError> {
        let parsed = mnemonic::parse(phrase)?;
        let normalized = Zeroizing::new(parsed.to_string());
        let result = self.install_mnemonic(&normalized, passphrase)?;
        tracing::info!(address = %result.address, "🔑 Wallet recovered from mnemonic");
        Ok(result.address)
    }

    fn install_mnemonic(
        &self,
        phrase: &Zeroizing<String>,
        passphrase: &str,
    ) -> Result<InitResult, WalletError> {
        let parsed = mnemonic::parse(phrase)?;
        let seed = mnemonic::to_seed(&parsed);
        let derived = hd::wallet_key_from_seed(seed.as_ref())?;
        let public_key = derived.public_key();
        let address = Address::from_public_key(&public_key, self.network).to_string();

        let payload = KeyPayload {
            mnemonic: phrase.to_string(),
            private_key_hex: hex::encode(derived.secret_key.secret_bytes()),
            address: address.clone(),
        };
        self.write_keystore(&payload, passphrase)?;

        *self.unlocked.lock() = Some(UnlockedKey {
            mnemonic: phrase.clone(),
            secret_key: derived.secret_key,
            public_key,
            address: address.clone(),
        });
        self.touch();

        Ok(InitResult {
            mnemonic: phrase.clone(),
            address,
            public_key,
        })
    }

    fn write_keystore(&self, payload: &KeyPayload, passphrase: &str) -> Result<(), WalletError> {
        let kdf_params = kdf::KdfParams::generate();
        let key = kdf::derive_key(passphrase, &kdf_params)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|_| WalletError::InvalidPassphrase)?;

        let mut iv = [0u8; GCM_IV_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut iv);

        let plaintext = Zeroizing::new(serde_json::to_vec(payload)?);
        let mut sealed = cipher
            .encrypt(
                Nonce::from_slice(&iv),
                Payload {
                    msg: &plaintext,
                    aad: &[],
                },
            )
            .map_err(|_| WalletError::InvalidPassphrase)?;

        // aes-gcm appends the tag; the file format stores it separately
        let tag_at = sealed.len() - GCM_TAG_BYTES;
        let tag = sealed.split_off(tag_at);

        let file = KeystoreFile {
            version: 1,
            address: payload.address.clone(),
            network: self.network,
            crypto: CryptoBox {
                ciphertext: {
                    use base64::Engine;
                    base64::engine::general_purpose::STANDARD.encode(&sealed)
                },
                iv: hex::encode(iv),
                tag: hex::encode(tag),
            },
            kdf: kdf_params,
        };
        secure_fs::write_json(&self.path, &file)?;
        Ok(())
    }

    /// Decrypt the keystore and cache the key material in memory.
    pub fn unlock(&self, passphrase: &str) -> Result<(), WalletError> {
        let file = self.read_keystore()?;
        let key = kdf::derive_key(passphrase, &file.kdf)?;
        let cipher = Aes256Gcm::new_from_slice(key.as_ref())
            .map_err(|_| WalletError::InvalidPassphrase)?;

        let iv = hex::decode(&file.crypto.iv).map_err(|_| WalletError::InvalidPassphrase)?;
        let tag = hex::decode(&file.crypto.tag).map_err(|_| WalletError::InvalidPassphrase)?;
        let mut sealed = {
            use base64::Engine;
            base64::engine::general_purpose::STANDARD
                .decode(&file.crypto.ciphertext)
                .map_err(|_| WalletError::InvalidPassphrase)?
        };
        sealed.extend_from_slice(&tag);
        if iv.len() != GCM_IV_BYTES {
            return Err(WalletError::InvalidPassphrase);
        }

        // GCM tag mismatch (wrong passphrase or tampered file) and parse
        // failures all map to InvalidPassphrase
        let plaintext = Zeroizing::new(
            cipher
                .decrypt(
                    Nonce::from_slice(&iv),
                    Payload {
                        msg: &sealed,
                        aad: &[],
                    },
                )
                .map_err(|_| WalletError::InvalidPassphrase)?,
        );
        let payload: KeyPayload =
            serde_json::from_slice(&plaintext).map_err(|_| WalletError::InvalidPassphrase)?;

        let mut sk_bytes =
            hex::decode(&payload.private_key_hex).map_err(|_| WalletError::InvalidPassphrase)?;
        let secret_key =
            SecretKey::from_slice(&sk_bytes).map_err(|_| WalletError::InvalidPassphrase)?;
        sk_bytes.zeroize();

        let secp = Secp256k1::new();
        let public_key = PublicKey::from_secret_key(&secp, &secret_key);

        *self.unlocked.lock() = Some(UnlockedKey {
            mnemonic: Zeroizing::new(payload.mnemonic.clone()),
            secret_key,
            public_key,
            address: payload.address.clone(),
        });
        self.touch();
        tracing::info!("🔓 Keystore unlocked");
        Ok(())
    }

    /// Wipe the in-memory key material. Idempotent.
    pub fn lock(&self) {
        let mut guard = self.unlocked.lock();
        if let Some(mut unlocked) = guard.take() {
            // the mnemonic is Zeroizing and wipes itself on drop
            unlocked.secret_key.non_secure_erase();
            tracing::info!("🔒 Keystore locked");
        }
    }

    /// A copy of the private key, never an alias. Bumps the auto-lock timer.
    pub fn get_private_key(&self) -> Result<SecretKey, WalletError> {
        let guard = self.unlocked.lock();
        let unlocked = guard.as_ref().ok_or(WalletError::WalletLocked)?;
        self.touch();
        Ok(unlocked.secret_key)
    }

    pub fn get_public_key(&self) -> Result<PublicKey, WalletError> {
        let guard = self.unlocked.lock();
        let unlocked = guard.as_ref().ok_or(WalletError::WalletLocked)?;
        Ok(unlocked.public_key)
    }

    /// Wallet address. Works while locked by reading the keystore header.
    pub fn get_address(&self) -> Result<String, WalletError> {
        if let Some(unlocked) = self.unlocked.lock().as_ref() {
            return Ok(unlocked.address.clone());
        }
        Ok(self.read_keystore()?.address)
    }

    /// Export the mnemonic (owner-gated by the caller). Unlocked only.
    pub fn get_mnemonic(&self) -> Result<Zeroizing<String>, WalletError> {
        let guard = self.unlocked.lock();
        let unlocked = guard.as_ref().ok_or(WalletError::WalletLocked)?;
        self.touch();
        Ok(unlocked.mnemonic.clone())
    }

    /// 0 disables the inactivity auto-lock.
    pub fn set_auto_lock_ms(&self, ms: u64) {
        self.auto_lock_ms.store(ms, Ordering::SeqCst);
        self.touch();
    }

    /// Lock if the inactivity window has elapsed. Driven by the
    /// orchestrator's timer; safe to call at any time.
    pub fn maybe_auto_lock(&self) -> bool {
        let window = self.auto_lock_ms.load(Ordering::SeqCst);
        if window == 0 || !self.is_unlocked() {
            return false;
        }
        let idle = self.clock.now_ms() - self.last_access_ms.load(Ordering::SeqCst);
        if idle >= window as i64 {
            tracing::info!(idle_ms = idle, "⏰ Auto-lock after inactivity");
            self.lock();
            true
        } else {
            false
        }
    }

    fn touch(&self) {
        self.last_access_ms.store(self.clock.now_ms(), Ordering::SeqCst);
    }

    fn read_keystore(&self) -> Result<KeystoreFile, WalletError> {
        match secure_fs::read_json::<KeystoreFile>(&self.path)? {
            Some(file) => Ok(file),
            None => Err(WalletError::NotInitialized),
        }
    }
}
