// src/address.rs
use crate::network_type::NetworkType;
use ripemd::Ripemd160;
use secp256k1::PublicKey;
use sha2::{Digest, Sha256};
use std::fmt;

/// Dogecoin P2PKH address.
///
/// Base58Check of `version_byte || HASH160(pubkey)`:
/// - Mainnet: version 0x1e, addresses start with 'D'
/// - Testnet: version 0x71, addresses start with 'n'
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Address {
    network: NetworkType,
    payload: [u8; 20], // HASH160 of the compressed public key
}

impl Address {
    /// Create address from a secp256k1 public key (compressed encoding).
    pub fn from_public_key(pubkey: &PublicKey, network: NetworkType) -> Self {
        Self {
            network,
            payload: hash160(&pubkey.serialize()),
        }
    }

    pub fn from_pubkey_hash(payload: [u8; 20], network: NetworkType) -> Self {
        Self { network, payload }
    }

    /// Parse and checksum-verify a Base58Check address string.
    pub fn from_string(s: &str) -> Result<Self, AddressError> {
        if s.len() < 26 || s.len() > 35 {
            return Err(AddressError::InvalidLength);
        }

        let decoded = bs58::decode(s)
            .into_vec()
            .map_err(|_| AddressError::InvalidBase58)?;

        if decoded.len() != 25 {
            return Err(AddressError::InvalidPayload);
        }

        let version = decoded[0];
        let payload_bytes = &decoded[1..21];
        let checksum = &decoded[21..25];
        let computed = compute_checksum(&decoded[..21]);
        if checksum != computed {
            return Err(AddressError::InvalidChecksum);
        }

        let network = if version == NetworkType::Mainnet.address_prefix_byte() {
            NetworkType::Mainnet
        } else if version == NetworkType::Testnet.address_prefix_byte() {
            NetworkType::Testnet
        } else {
            return Err(AddressError::InvalidNetwork);
        };

        let mut payload = [0u8; 20];
        payload.copy_from_slice(payload_bytes);
        Ok(Self { network, payload })
    }

    /// Parse an address and require it to belong to `network`.
    pub fn from_string_for_network(s: &str, network: NetworkType) -> Result<Self, AddressError> {
        let addr = Self::from_string(s)?;
        if addr.network != network {
            return Err(AddressError::WrongNetwork {
                expected: network,
                found: addr.network,
            });
        }
        Ok(addr)
    }

    pub fn as_string(&self) -> String {
        let mut data = Vec::with_capacity(25);
        data.push(self.network.address_prefix_byte());
        data.extend_from_slice(&self.payload);
        let checksum = compute_checksum(&data);
        data.extend_from_slice(&checksum);
        bs58::encode(data).into_string()
    }

    pub fn network(&self) -> NetworkType {
        self.network
    }

    /// The HASH160 payload, as embedded in a P2PKH scriptPubKey.
    pub fn pubkey_hash(&self) -> &[u8; 20] {
        &self.payload
    }
}

/// SHA256 then RIPEMD160.
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let mut out = [0u8; 20];
    out.copy_from_slice(&Ripemd160::digest(sha));
    out
}

fn compute_checksum(data: &[u8]) -> [u8; 4] {
    let hash1 = Sha256::digest(data);
    let hash2 = Sha256::digest(hash1);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&hash2[..4]);
    checksum
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_string())
    }
}

impl serde::Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.as_string())
    }
}

impl<'de> serde::Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Address::from_string(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AddressError {
    #[error("Invalid address length")]
    InvalidLength,
    #[error("Invalid address version byte")]
    InvalidNetwork,
    #[error("Address is for {found}, expected {expected}")]
    WrongNetwork {
        expected: NetworkType,
        found: NetworkType,
    },
    #[error("Invalid payload")]
    InvalidPayload,
    #[error("Invalid checksum")]
    InvalidChecksum,
    #[error("Invalid base58 character")]
    InvalidBase58,
}

#[cfg(test)]
mod tests {
    use super::*;
    use secp256k1::{Secp256k1, SecretKey};

    fn test_pubkey() -> PublicKey {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x42u8; 32]).unwrap();
        PublicKey::from_secret_key(&secp, &sk)
    }

    #[test]
    fn test_address_generation() {
        let mainnet = Address::from_public_key(&test_pubkey(), NetworkType::Mainnet);
        let mainnet_str = mainnet.to_string();
        assert!(mainnet_str.starts_with('D'), "got {mainnet_str}");

        let testnet = Address::from_public_key(&test_pubkey(), NetworkType::Testnet);
        assert!(testnet.to_string().starts_with('n'));
    }

    #[test]
    fn test_address_round_trip() {
        let addr = Address::from_public_key(&test_pubkey(), NetworkType::Mainnet);
        let parsed = Address::from_string(&addr.to_string()).unwrap();
        assert_eq!(addr, parsed);
        assert_eq!(parsed.network(), NetworkType::Mainnet);
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(Address::from_string("INVALID").is_err());
        assert!(Address::from_string("").is_err());
        // flipped last character breaks the checksum
        let addr = Address::from_public_key(&test_pubkey(), NetworkType::Mainnet).to_string();
        let mut broken = addr.clone();
        let last = if addr.ends_with('2') { '3' } else { '2' };
        broken.pop();
        broken.push(last);
        assert!(Address::from_string(&broken).is_err());
    }

    #[test]
    fn test_network_mismatch() {
        let addr = Address::from_public_key(&test_pubkey(), NetworkType::Testnet).to_string();
        let err = Address::from_string_for_network(&addr, NetworkType::Mainnet).unwrap_err();
        assert!(matches!(err, AddressError::WrongNetwork { .. }));
    }
}
