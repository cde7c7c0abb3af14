//! Network selection for the Dogecoin wallet.

use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Serialize, Deserialize, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum NetworkType {
    Mainnet,
    Testnet,
}

impl NetworkType {
    /// P2PKH address version byte.
    pub fn address_prefix_byte(&self) -> u8 {
        match self {
            NetworkType::Mainnet => 0x1e, // addresses start with 'D'
            NetworkType::Testnet => 0x71, // addresses start with 'n'
        }
    }

    /// Leading character of a valid address on this network.
    pub fn address_prefix_char(&self) -> char {
        match self {
            NetworkType::Mainnet => 'D',
            NetworkType::Testnet => 'n',
        }
    }

    /// Confirmations required before an inbound payment is considered settled.
    pub fn min_confirmations(&self) -> u32 {
        match self {
            NetworkType::Mainnet => 6,
            NetworkType::Testnet => 1,
        }
    }

    pub fn from_str_loose(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "mainnet" => Some(NetworkType::Mainnet),
            "testnet" => Some(NetworkType::Testnet),
            _ => None,
        }
    }
}

impl std::fmt::Display for NetworkType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetworkType::Mainnet => write!(f, "mainnet"),
            NetworkType::Testnet => write!(f, "testnet"),
        }
    }
}
