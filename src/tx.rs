//! Dogecoin transaction wire format and signing.
//!
//! Standard version-1 transactions with P2PKH inputs and outputs, locktime
//! 0. Serialization order is exactly the vector order the builder produced;
//! outputs are never reordered, so the change output's index in the built
//! transaction is the index that appears on-chain.

use secp256k1::{ecdsa::Signature, Message, PublicKey, Secp256k1, SecretKey};
use sha2::{Digest, Sha256};

pub const TX_VERSION: u32 = 1;
pub const SEQUENCE_FINAL: u32 = 0xffff_ffff;
pub const SIGHASH_ALL: u32 = 0x01;

/// Estimated serialized sizes for fee math: P2PKH input ≈ 148 bytes,
/// output ≈ 34 bytes, version/locktime/counts overhead ≈ 10 bytes.
pub const INPUT_SIZE_BYTES: usize = 148;
pub const OUTPUT_SIZE_BYTES: usize = 34;
pub const TX_OVERHEAD_BYTES: usize = 10;

pub fn estimate_tx_size(n_inputs: usize, n_outputs: usize) -> usize {
    TX_OVERHEAD_BYTES + n_inputs * INPUT_SIZE_BYTES + n_outputs * OUTPUT_SIZE_BYTES
}

#[derive(Debug, thiserror::Error)]
pub enum TxError {
    #[error("Invalid txid hex: {0}")]
    InvalidTxid(String),

    #[error("Input index {0} out of range")]
    InputIndex(usize),

    #[error("Signing failed: {0}")]
    Signing(#[from] secp256k1::Error),
}

#[derive(Clone, Debug)]
pub struct TxInput {
    /// Funding txid, display order (big-endian hex).
    pub prev_txid: String,
    pub prev_vout: u32,
    pub script_sig: Vec<u8>,
    pub sequence: u32,
}

impl TxInput {
    pub fn new(prev_txid: &str, prev_vout: u32) -> Self {
        Self {
            prev_txid: prev_txid.to_string(),
            prev_vout,
            script_sig: Vec::new(),
            sequence: SEQUENCE_FINAL,
        }
    }
}

#[derive(Clone, Debug)]
pub struct TxOutput {
    pub value: u64, // koinu
    pub script_pubkey: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct Transaction {
    pub version: u32,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
    pub lock_time: u32,
}

impl Transaction {
    pub fn new(inputs: Vec<TxInput>, outputs: Vec<TxOutput>) -> Self {
        Self {
            version: TX_VERSION,
            inputs,
            outputs,
            lock_time: 0,
        }
    }

    /// Serialize to consensus wire bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, TxError> {
        let mut buf = Vec::with_capacity(estimate_tx_size(self.inputs.len(), self.outputs.len()));
        buf.extend_from_slice(&self.version.to_le_bytes());

        write_varint(&mut buf, self.inputs.len() as u64);
        for input in &self.inputs {
            buf.extend_from_slice(&txid_to_wire(&input.prev_txid)?);
            buf.extend_from_slice(&input.prev_vout.to_le_bytes());
            write_varint(&mut buf, input.script_sig.len() as u64);
            buf.extend_from_slice(&input.script_sig);
            buf.extend_from_slice(&input.sequence.to_le_bytes());
        }

        write_varint(&mut buf, self.outputs.len() as u64);
        for output in &self.outputs {
            buf.extend_from_slice(&output.value.to_le_bytes());
            write_varint(&mut buf, output.script_pubkey.len() as u64);
            buf.extend_from_slice(&output.script_pubkey);
        }

        buf.extend_from_slice(&self.lock_time.to_le_bytes());
        Ok(buf)
    }

    pub fn to_hex(&self) -> Result<String, TxError> {
        Ok(hex::encode(self.serialize()?))
    }

    /// Transaction id: double SHA256 of the wire bytes, displayed reversed.
    pub fn txid(&self) -> Result<String, TxError> {
        let bytes = self.serialize()?;
        let mut hash = double_sha256(&bytes);
        hash.reverse();
        Ok(hex::encode(hash))
    }

    /// Legacy SIGHASH_ALL digest for one input.
    ///
    /// `script_pubkey` is the scriptPubKey of the output this input spends.
    pub fn sighash_all(&self, input_index: usize, script_pubkey: &[u8]) -> Result<[u8; 32], TxError> {
        if input_index >= self.inputs.len() {
            return Err(TxError::InputIndex(input_index));
        }
        let mut copy = self.clone();
        for (i, input) in copy.inputs.iter_mut().enumerate() {
            input.script_sig = if i == input_index {
                script_pubkey.to_vec()
            } else {
                Vec::new()
            };
        }
        let mut preimage = copy.serialize()?;
        preimage.extend_from_slice(&SIGHASH_ALL.to_le_bytes());
        Ok(double_sha256(&preimage))
    }

    /// Sign one input with ECDSA/SIGHASH_ALL and install the scriptSig
    /// `<sig||0x01> <compressed pubkey>`.
    pub fn sign_input(
        &mut self,
        input_index: usize,
        script_pubkey: &[u8],
        secret_key: &SecretKey,
    ) -> Result<(), TxError> {
        let digest = self.sighash_all(input_index, script_pubkey)?;
        let secp = Secp256k1::new();
        let msg = Message::from_digest(digest);
        let sig: Signature = secp.sign_ecdsa(&msg, secret_key);
        let pubkey = PublicKey::from_secret_key(&secp, secret_key);

        let mut sig_bytes = sig.serialize_der().to_vec();
        sig_bytes.push(SIGHASH_ALL as u8);

        let pubkey_bytes = pubkey.serialize();
        let mut script_sig = Vec::with_capacity(2 + sig_bytes.len() + pubkey_bytes.len());
        script_sig.push(sig_bytes.len() as u8);
        script_sig.extend_from_slice(&sig_bytes);
        script_sig.push(pubkey_bytes.len() as u8);
        script_sig.extend_from_slice(&pubkey_bytes);

        self.inputs[input_index].script_sig = script_sig;
        Ok(())
    }
}

/// Display-order txid hex → 32 wire bytes (little-endian).
fn txid_to_wire(txid: &str) -> Result<[u8; 32], TxError> {
    let bytes = hex::decode(txid).map_err(|_| TxError::InvalidTxid(txid.to_string()))?;
    if bytes.len() != 32 {
        return Err(TxError::InvalidTxid(txid.to_string()));
    }
    let mut wire = [0u8; 32];
    for (i, b) in bytes.iter().rev().enumerate() {
        wire[i] = *b;
    }
    Ok(wire)
}

pub fn double_sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(Sha256::digest(data)).into()
}

fn write_varint(buf: &mut Vec<u8>, value: u64) {
    match value {
        0..=0xfc => buf.push(value as u8),
        0xfd..=0xffff => {
            buf.push(0xfd);
            buf.extend_from_slice(&(value as u16).to_le_bytes());
        }
        0x1_0000..=0xffff_ffff => {
            buf.push(0xfe);
            buf.extend_from_slice(&(value as u32).to_le_bytes());
        }
        _ => {
            buf.push(0xff);
            buf.extend_from_slice(&value.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::network_type::NetworkType;
    use crate::script::p2pkh_script;

    const FUNDING_TXID: &str = "aa00000000000000000000000000000000000000000000000000000000000bb0";

    fn sample_tx() -> Transaction {
        let dest = Address::from_pubkey_hash([0x11; 20], NetworkType::Mainnet);
        let change = Address::from_pubkey_hash([0x22; 20], NetworkType::Mainnet);
        Transaction::new(
            vec![TxInput::new(FUNDING_TXID, 1)],
            vec![
                TxOutput {
                    value: 250_000_000,
                    script_pubkey: p2pkh_script(&dest),
                },
                TxOutput {
                    value: 100_000_000,
                    script_pubkey: p2pkh_script(&change),
                },
            ],
        )
    }

    #[test]
    fn serializes_in_declared_order() {
        let tx = sample_tx();
        let bytes = tx.serialize().unwrap();
        // version 1 LE
        assert_eq!(&bytes[..4], &[1, 0, 0, 0]);
        // one input
        assert_eq!(bytes[4], 1);
        // txid bytes are reversed on the wire
        assert_eq!(bytes[5], 0xb0);
        assert_eq!(bytes[6], 0x0b);
        // payment output precedes change output
        let hex = hex::encode(&bytes);
        let pay = hex.find(&"11".repeat(20)).unwrap();
        let chg = hex.find(&"22".repeat(20)).unwrap();
        assert!(pay < chg);
        // locktime 0
        assert_eq!(&bytes[bytes.len() - 4..], &[0, 0, 0, 0]);
    }

    #[test]
    fn txid_is_stable_and_changes_with_content() {
        let tx = sample_tx();
        let id1 = tx.txid().unwrap();
        let id2 = tx.txid().unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1.len(), 64);

        let mut other = sample_tx();
        other.outputs[0].value += 1;
        assert_ne!(other.txid().unwrap(), id1);
    }

    #[test]
    fn sighash_differs_per_input() {
        let dest = Address::from_pubkey_hash([0x33; 20], NetworkType::Mainnet);
        let spk = p2pkh_script(&dest);
        let tx = Transaction::new(
            vec![TxInput::new(FUNDING_TXID, 0), TxInput::new(FUNDING_TXID, 1)],
            vec![TxOutput {
                value: 1_000,
                script_pubkey: spk.clone(),
            }],
        );
        let h0 = tx.sighash_all(0, &spk).unwrap();
        let h1 = tx.sighash_all(1, &spk).unwrap();
        assert_ne!(h0, h1);
        assert!(tx.sighash_all(2, &spk).is_err());
    }

    #[test]
    fn sign_input_installs_script_sig() {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[0x55u8; 32]).unwrap();
        let pk = PublicKey::from_secret_key(&secp, &sk);
        let own = Address::from_public_key(&pk, NetworkType::Mainnet);
        let spk = p2pkh_script(&own);

        let mut tx = sample_tx();
        tx.sign_input(0, &spk, &sk).unwrap();

        let script_sig = &tx.inputs[0].script_sig;
        assert!(!script_sig.is_empty());
        // first push is the DER signature ending with the SIGHASH_ALL byte
        let sig_len = script_sig[0] as usize;
        assert_eq!(script_sig[sig_len], 0x01);
        // second push is the 33-byte compressed pubkey
        assert_eq!(script_sig[sig_len + 1], 33);
        assert_eq!(&script_sig[sig_len + 2..], &pk.serialize()[..]);

        // signature verifies against the sighash
        let digest = {
            let mut unsigned = sample_tx();
            unsigned.inputs[0].script_sig = Vec::new();
            unsigned.sighash_all(0, &spk).unwrap()
        };
        let der = &script_sig[1..sig_len];
        let sig = Signature::from_der(der).unwrap();
        let msg = Message::from_digest(digest);
        assert!(secp.verify_ecdsa(&msg, &sig, &pk).is_ok());
    }

    #[test]
    fn size_estimate_matches_formula() {
        assert_eq!(estimate_tx_size(1, 2), 226);
        assert_eq!(estimate_tx_size(3, 2), 522);
    }
}
