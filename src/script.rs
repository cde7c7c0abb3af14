//! Bitcoin-script construction for the output shapes the wallet emits.
//!
//! Only three script forms exist here: P2PKH (every payment and change
//! output), OP_RETURN data outputs (invoice tagging), and the HTLC
//! primitive. Nothing in this module validates full scripts; the wallet
//! never evaluates script, it only builds and pattern-matches its own.

use crate::address::Address;

pub const OP_DUP: u8 = 0x76;
pub const OP_HASH160: u8 = 0xa9;
pub const OP_EQUAL: u8 = 0x87;
pub const OP_EQUALVERIFY: u8 = 0x88;
pub const OP_CHECKSIG: u8 = 0xac;
pub const OP_RETURN: u8 = 0x6a;
pub const OP_IF: u8 = 0x63;
pub const OP_ELSE: u8 = 0x67;
pub const OP_ENDIF: u8 = 0x68;
pub const OP_DROP: u8 = 0x75;
pub const OP_SHA256: u8 = 0xa8;
pub const OP_CHECKLOCKTIMEVERIFY: u8 = 0xb1;

/// `OP_DUP OP_HASH160 <20B> OP_EQUALVERIFY OP_CHECKSIG`
pub fn p2pkh_script(address: &Address) -> Vec<u8> {
    let hash = address.pubkey_hash();
    let mut script = Vec::with_capacity(25);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Extract the pubkey hash from a P2PKH scriptPubKey, if it is one.
pub fn parse_p2pkh(script: &[u8]) -> Option<[u8; 20]> {
    if script.len() == 25
        && script[0] == OP_DUP
        && script[1] == OP_HASH160
        && script[2] == 20
        && script[23] == OP_EQUALVERIFY
        && script[24] == OP_CHECKSIG
    {
        let mut hash = [0u8; 20];
        hash.copy_from_slice(&script[3..23]);
        Some(hash)
    } else {
        None
    }
}

/// `OP_RETURN <data>` — a provably unspendable data carrier.
///
/// Data is limited to 80 bytes, the standardness cap relays enforce.
pub fn op_return_script(data: &[u8]) -> Option<Vec<u8>> {
    if data.is_empty() || data.len() > 80 {
        return None;
    }
    let mut script = Vec::with_capacity(data.len() + 2);
    script.push(OP_RETURN);
    script.push(data.len() as u8);
    script.extend_from_slice(data);
    Some(script)
}

/// Extract the payload of an `OP_RETURN <push>` script.
pub fn parse_op_return(script: &[u8]) -> Option<&[u8]> {
    if script.len() >= 2 && script[0] == OP_RETURN {
        let len = script[1] as usize;
        if len > 0 && len <= 80 && script.len() == 2 + len {
            return Some(&script[2..]);
        }
    }
    None
}

/// Hash-and-time-locked contract script (primitive only; the wallet never
/// orchestrates HTLC flows).
///
/// ```text
/// OP_IF
///     OP_SHA256 <hash> OP_EQUALVERIFY
///     OP_DUP OP_HASH160 <recipient-hash>
/// OP_ELSE
///     <locktime> OP_CHECKLOCKTIMEVERIFY OP_DROP
///     OP_DUP OP_HASH160 <refund-hash>
/// OP_ENDIF
/// OP_EQUALVERIFY OP_CHECKSIG
/// ```
pub fn htlc_script(
    payment_hash: &[u8; 32],
    recipient: &Address,
    refund: &Address,
    locktime: u32,
) -> Vec<u8> {
    let mut script = Vec::with_capacity(100);
    script.push(OP_IF);
    script.push(OP_SHA256);
    script.push(32);
    script.extend_from_slice(payment_hash);
    script.push(OP_EQUALVERIFY);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(recipient.pubkey_hash());
    script.push(OP_ELSE);
    push_int(&mut script, locktime as i64);
    script.push(OP_CHECKLOCKTIMEVERIFY);
    script.push(OP_DROP);
    script.push(OP_DUP);
    script.push(OP_HASH160);
    script.push(20);
    script.extend_from_slice(refund.pubkey_hash());
    script.push(OP_ENDIF);
    script.push(OP_EQUALVERIFY);
    script.push(OP_CHECKSIG);
    script
}

/// Minimal-encoding script number push (positive values only).
fn push_int(script: &mut Vec<u8>, value: i64) {
    debug_assert!(value >= 0);
    if value == 0 {
        script.push(0x00); // OP_0
        return;
    }
    if value <= 16 {
        script.push(0x50 + value as u8); // OP_1..OP_16
        return;
    }
    let mut bytes = Vec::new();
    let mut v = value;
    while v > 0 {
        bytes.push((v & 0xff) as u8);
        v >>= 8;
    }
    // sign bit must be clear for a positive number
    if bytes.last().map(|b| b & 0x80 != 0).unwrap_or(false) {
        bytes.push(0x00);
    }
    script.push(bytes.len() as u8);
    script.extend_from_slice(&bytes);
}
