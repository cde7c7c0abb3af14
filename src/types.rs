//! Core data types shared across wallet subsystems.

use serde::{Deserialize, Serialize};

/// (txid, vout) identity of an unspent output. Txid is display-order hex.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OutPoint {
    pub txid: String,
    pub vout: u32,
}

impl OutPoint {
    pub fn new(txid: &str, vout: u32) -> Self {
        Self {
            txid: txid.to_string(),
            vout,
        }
    }
}

impl std::fmt::Display for OutPoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.txid, self.vout)
    }
}

/// A spendable output owned by the wallet address.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Utxo {
    pub txid: String,
    pub vout: u32,
    pub address: String,
    /// Amount in koinu.
    pub amount: u64,
    /// Hex-encoded scriptPubKey.
    pub script_pubkey: String,
    pub confirmations: u32,
    /// Block height of the confirming block, when the provider reports it.
    #[serde(default)]
    pub block_height: Option<u64>,
    /// Reserved by an in-flight send.
    #[serde(default)]
    pub locked: bool,
    /// Send intent that holds the lock. Always present when `locked`.
    #[serde(default)]
    pub locked_for: Option<String>,
    /// Unix ms when the lock was taken.
    #[serde(default)]
    pub locked_at: Option<i64>,
}

impl Utxo {
    pub fn outpoint(&self) -> OutPoint {
        OutPoint::new(&self.txid, self.vout)
    }

    pub fn is_confirmed(&self) -> bool {
        self.confirmations >= 1
    }
}

/// Who initiated an operation, for audit and policy attribution.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Initiator {
    Owner,
    Agent,
    System,
    External,
}

impl std::fmt::Display for Initiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Initiator::Owner => write!(f, "owner"),
            Initiator::Agent => write!(f, "agent"),
            Initiator::System => write!(f, "system"),
            Initiator::External => write!(f, "external"),
        }
    }
}
