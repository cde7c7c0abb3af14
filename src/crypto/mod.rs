//! Cryptographic primitives for key derivation and agent payloads.

pub mod ecdh;
pub mod hd;
pub mod kdf;
pub mod mnemonic;

pub use hd::DerivedKey;
