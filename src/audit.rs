//! Append-only audit trail.
//!
//! One JSON object per line in `audit/audit.jsonl`. Entries are never
//! mutated after write. Receive events are deduplicated by txid so a
//! re-polled inbound transaction cannot produce a second entry.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::WalletError;
use crate::secure_fs;
use crate::types::Initiator;

pub const AUDIT_FILE: &str = "audit.jsonl";

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuditAction {
    Send,
    Receive,
    Approve,
    Deny,
    Freeze,
    Unfreeze,
    InvoiceCreated,
    InvoicePaid,
    AddressGenerated,
    PolicyCheck,
    PreflightCheck,
    Error,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    pub id: String,
    /// ISO-8601 UTC.
    pub timestamp: String,
    pub action: AuditAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
    /// Koinu.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fee: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tier: Option<String>,
    pub reason: String,
    pub initiated_by: Initiator,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
}

pub struct AuditLog {
    path: PathBuf,
    clock: SharedClock,
    /// Serializes appends and guards the receive-dedup set.
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    seen_receive_txids: HashSet<String>,
}

impl AuditLog {
    /// `audit_dir` is the wallet's `audit/` directory.
    pub fn new(audit_dir: &std::path::Path, clock: SharedClock) -> Self {
        Self {
            path: audit_dir.join(AUDIT_FILE),
            clock,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Rebuild the receive-dedup set from the existing log.
    pub fn load(&self) -> Result<(), WalletError> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Ok(());
        };
        let mut inner = self.inner.lock();
        for line in text.lines() {
            if let Ok(entry) = serde_json::from_str::<AuditEntry>(line) {
                if entry.action == AuditAction::Receive {
                    if let Some(txid) = entry.txid {
                        inner.seen_receive_txids.insert(txid);
                    }
                }
            }
        }
        Ok(())
    }

    pub fn entry(&self, action: AuditAction, reason: &str, initiated_by: Initiator) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4().to_string(),
            timestamp: self.clock.now().to_rfc3339(),
            action,
            txid: None,
            amount: None,
            address: None,
            fee: None,
            tier: None,
            reason: reason.to_string(),
            initiated_by,
            metadata: None,
        }
    }

    /// Append one entry. Receive entries for an already-seen txid are
    /// silently dropped; returns whether the entry was written.
    pub fn record(&self, entry: AuditEntry) -> Result<bool, WalletError> {
        let mut inner = self.inner.lock();
        if entry.action == AuditAction::Receive {
            match &entry.txid {
                Some(txid) if !inner.seen_receive_txids.insert(txid.clone()) => {
                    return Ok(false);
                }
                _ => {}
            }
        }
        let line = serde_json::to_string(&entry)?;
        secure_fs::append_line(&self.path, &line)?;
        Ok(true)
    }

    /// Entire log, oldest first. Test and history surface.
    pub fn read_all(&self) -> Result<Vec<AuditEntry>, WalletError> {
        let Ok(text) = std::fs::read_to_string(&self.path) else {
            return Ok(Vec::new());
        };
        let mut entries = Vec::new();
        for line in text.lines() {
            entries.push(serde_json::from_str(line)?);
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use tempfile::tempdir;

    #[test]
    fn records_and_reads_back() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), system_clock());

        let mut entry = log.entry(AuditAction::Send, "test send", Initiator::Agent);
        entry.txid = Some("aabb".into());
        entry.amount = Some(250_000_000);
        entry.fee = Some(226_000);
        assert!(log.record(entry).unwrap());

        let all = log.read_all().unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].action, AuditAction::Send);
        assert_eq!(all[0].amount, Some(250_000_000));
    }

    #[test]
    fn receive_dedups_by_txid() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), system_clock());

        let mut entry = log.entry(AuditAction::Receive, "inbound", Initiator::External);
        entry.txid = Some("cafe".into());
        assert!(log.record(entry.clone()).unwrap());
        entry.id = Uuid::new_v4().to_string();
        assert!(!log.record(entry).unwrap());

        assert_eq!(log.read_all().unwrap().len(), 1);
    }

    #[test]
    fn dedup_survives_reload() {
        let dir = tempdir().unwrap();
        {
            let log = AuditLog::new(dir.path(), system_clock());
            let mut entry = log.entry(AuditAction::Receive, "inbound", Initiator::External);
            entry.txid = Some("cafe".into());
            log.record(entry).unwrap();
        }
        let log = AuditLog::new(dir.path(), system_clock());
        log.load().unwrap();
        let mut entry = log.entry(AuditAction::Receive, "inbound again", Initiator::External);
        entry.txid = Some("cafe".into());
        assert!(!log.record(entry).unwrap());
    }

    #[test]
    fn non_receive_entries_are_never_deduped() {
        let dir = tempdir().unwrap();
        let log = AuditLog::new(dir.path(), system_clock());
        for _ in 0..3 {
            let mut entry = log.entry(AuditAction::Send, "same txid", Initiator::Agent);
            entry.txid = Some("aaaa".into());
            assert!(log.record(entry).unwrap());
        }
        assert_eq!(log.read_all().unwrap().len(), 3);
    }
}
