//! BIP39 mnemonic generation and seed derivation.
//!
//! The wallet always uses 24-word (256-bit entropy) phrases. The BIP39
//! passphrase is empty; the wallet passphrase protects the keystore file,
//! not the seed derivation.

use bip39::{Language, Mnemonic};
use rand::RngCore;
use zeroize::Zeroizing;

use crate::error::WalletError;

pub const ENTROPY_BYTES: usize = 32;
pub const WORD_COUNT: usize = 24;

/// Generate a fresh 24-word mnemonic from OS entropy.
pub fn generate() -> Result<Zeroizing<String>, WalletError> {
    let mut entropy = Zeroizing::new([0u8; ENTROPY_BYTES]);
    rand::rngs::OsRng.fill_bytes(entropy.as_mut_slice());
    let mnemonic = Mnemonic::from_entropy_in(Language::English, entropy.as_slice())
        .map_err(|_| WalletError::InvalidMnemonic)?;
    Ok(Zeroizing::new(mnemonic.to_string()))
}

/// Validate checksum and word list. Whitespace is normalized.
pub fn parse(phrase: &str) -> Result<Mnemonic, WalletError> {
    let normalized: String = phrase.split_whitespace().collect::<Vec<_>>().join(" ");
    let mnemonic = Mnemonic::parse_in_normalized(Language::English, &normalized)
        .map_err(|_| WalletError::InvalidMnemonic)?;
    if mnemonic.word_count() != WORD_COUNT {
        return Err(WalletError::InvalidMnemonic);
    }
    Ok(mnemonic)
}

/// BIP39 seed (64 bytes) for the phrase, empty passphrase.
pub fn to_seed(mnemonic: &Mnemonic) -> Zeroizing<[u8; 64]> {
    Zeroizing::new(mnemonic.to_seed_normalized(""))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_24_words() {
        let phrase = generate().unwrap();
        assert_eq!(phrase.split_whitespace().count(), 24);
        // and the phrase we generated parses back
        parse(&phrase).unwrap();
    }

    #[test]
    fn accepts_reference_vector() {
        // all-zero entropy vector from the BIP39 reference tests
        let phrase = format!("{} art", ["abandon"; 23].join(" "));
        parse(&phrase).unwrap();
    }

    #[test]
    fn rejects_bad_checksum() {
        let phrase = ["abandon"; 24].join(" ");
        assert!(parse(&phrase).is_err());
    }

    #[test]
    fn rejects_wrong_word_count() {
        assert!(parse("abandon abandon abandon").is_err());
    }

    #[test]
    fn seed_is_deterministic() {
        let phrase = generate().unwrap();
        let m = parse(&phrase).unwrap();
        assert_eq!(*to_seed(&m), *to_seed(&parse(&phrase).unwrap()));
    }

    #[test]
    fn normalizes_whitespace() {
        let phrase = generate().unwrap();
        let spaced = phrase.replace(' ', "  ");
        assert!(parse(&spaced).is_ok());
    }
}
