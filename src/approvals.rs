//! Persistent approval queue for sends the policy will not auto-execute.
//!
//! State machine: `pending → {approved | denied | expired}`, and
//! `approved → executed` once the pipeline broadcasts. Every transition is
//! persisted before it is acknowledged. Only the configured owner identity
//! (or the distinguished `system:auto` timer identity) can resolve an
//! entry; anyone else is rejected without touching it.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use uuid::Uuid;

use crate::clock::SharedClock;
use crate::error::WalletError;
use crate::policy::{PolicyAction, Tier};
use crate::secure_fs;

pub const PENDING_FILE: &str = "pending.json";

/// Identity used when the expiry sweeper resolves an entry.
pub const SYSTEM_AUTO: &str = "system:auto";

const DEFAULT_EXPIRY_HOURS: i64 = 24;
const RESOLVED_KEEP: usize = 100;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ApprovalStatus {
    Pending,
    Approved,
    Denied,
    Expired,
    Executed,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AutoAction {
    Approve,
    Deny,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingApproval {
    pub id: String,
    pub to: String,
    /// Koinu.
    pub amount: u64,
    pub amount_doge: f64,
    pub tier: Option<Tier>,
    pub action: PolicyAction,
    pub reason: String,
    pub created_at: String,
    pub expires_at: String,
    pub auto_action: AutoAction,
    pub status: ApprovalStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_by: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
}

pub struct ApprovalRequest {
    pub to: String,
    pub amount: u64,
    pub amount_doge: f64,
    pub tier: Option<Tier>,
    pub action: PolicyAction,
    pub reason: String,
    pub delay_minutes: Option<u64>,
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct PendingFile {
    version: u32,
    pending: Vec<PendingApproval>,
}

pub struct ApprovalQueue {
    path: PathBuf,
    clock: SharedClock,
    owner_ids: Vec<String>,
    entries: Mutex<Vec<PendingApproval>>,
}

impl ApprovalQueue {
    pub fn new(data_dir: &std::path::Path, owner_ids: Vec<String>, clock: SharedClock) -> Self {
        Self {
            path: data_dir.join(PENDING_FILE),
            clock,
            owner_ids,
            entries: Mutex::new(Vec::new()),
        }
    }

    pub fn load(&self) -> Result<(), WalletError> {
        if let Some(file) = secure_fs::read_json::<PendingFile>(&self.path)? {
            *self.entries.lock() = file.pending;
        }
        Ok(())
    }

    /// Queue a send for owner decision. Delay-tier entries auto-approve at
    /// expiry; everything else auto-denies after 24 h of silence.
    pub fn queue_for_approval(&self, request: ApprovalRequest) -> Result<PendingApproval, WalletError> {
        let now = self.clock.now();
        let (expires_at, auto_action) = if request.action == PolicyAction::Delay {
            let minutes = request.delay_minutes.unwrap_or(60) as i64;
            (now + chrono::Duration::minutes(minutes), AutoAction::Approve)
        } else {
            (
                now + chrono::Duration::hours(DEFAULT_EXPIRY_HOURS),
                AutoAction::Deny,
            )
        };

        let entry = PendingApproval {
            id: Uuid::new_v4().to_string(),
            to: request.to,
            amount: request.amount,
            amount_doge: request.amount_doge,
            tier: request.tier,
            action: request.action,
            reason: request.reason,
            created_at: now.to_rfc3339(),
            expires_at: expires_at.to_rfc3339(),
            auto_action,
            status: ApprovalStatus::Pending,
            resolved_by: None,
            resolved_at: None,
        };

        self.entries.lock().push(entry.clone());
        self.persist()?;
        tracing::info!(
            id = %entry.id,
            to = %entry.to,
            amount = entry.amount,
            action = ?entry.action,
            "📋 Send queued for approval"
        );
        Ok(entry)
    }

    pub fn approve(&self, id: &str, caller: &str) -> Result<PendingApproval, WalletError> {
        self.resolve(id, caller, ApprovalStatus::Approved)
    }

    pub fn deny(&self, id: &str, caller: &str) -> Result<PendingApproval, WalletError> {
        self.resolve(id, caller, ApprovalStatus::Denied)
    }

    fn is_authorized(&self, caller: &str) -> bool {
        use subtle::ConstantTimeEq;
        if caller.as_bytes().ct_eq(SYSTEM_AUTO.as_bytes()).into() {
            return true;
        }
        self.owner_ids
            .iter()
            .any(|owner| caller.as_bytes().ct_eq(owner.as_bytes()).into())
    }

    fn resolve(
        &self,
        id: &str,
        caller: &str,
        status: ApprovalStatus,
    ) -> Result<PendingApproval, WalletError> {
        if !self.is_authorized(caller) {
            // the pending entry is left untouched
            return Err(WalletError::Unauthorized(format!(
                "approval decision from non-owner identity `{caller}`"
            )));
        }

        let resolved = {
            let mut entries = self.entries.lock();
            let entry = entries
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| WalletError::Validation(format!("no approval with id {id}")))?;
            if entry.status != ApprovalStatus::Pending {
                return Err(WalletError::Validation(format!(
                    "approval {id} is not pending"
                )));
            }
            entry.status = status;
            entry.resolved_by = Some(caller.to_string());
            entry.resolved_at = Some(self.clock.now().to_rfc3339());
            entry.clone()
        };
        self.persist()?;
        Ok(resolved)
    }

    /// Expiry sweep. Entries past `expires_at` transition per their
    /// `auto_action`; the newly auto-approved ones are returned so the
    /// pipeline can execute them.
    pub fn expire(&self) -> Result<Vec<PendingApproval>, WalletError> {
        let now = self.clock.now();
        let mut auto_approved = Vec::new();
        let mut changed = false;
        {
            let mut entries = self.entries.lock();
            for entry in entries.iter_mut() {
                if entry.status != ApprovalStatus::Pending {
                    continue;
                }
                let Ok(expires) = chrono::DateTime::parse_from_rfc3339(&entry.expires_at) else {
                    continue;
                };
                if now < expires {
                    continue;
                }
                changed = true;
                entry.resolved_by = Some(SYSTEM_AUTO.to_string());
                entry.resolved_at = Some(now.to_rfc3339());
                match entry.auto_action {
                    AutoAction::Approve => {
                        entry.status = ApprovalStatus::Approved;
                        auto_approved.push(entry.clone());
                        tracing::info!(id = %entry.id, "⏳ Delay elapsed — send auto-approved");
                    }
                    AutoAction::Deny => {
                        entry.status = ApprovalStatus::Expired;
                        tracing::info!(id = %entry.id, "Approval expired unanswered");
                    }
                }
            }
        }
        if changed {
            self.persist()?;
        }
        Ok(auto_approved)
    }

    /// Terminal marker after a successful broadcast; the entry is kept for
    /// history.
    pub fn mark_executed(&self, id: &str) -> Result<(), WalletError> {
        {
            let mut entries = self.entries.lock();
            let entry = entries
                .iter_mut()
                .find(|e| e.id == id)
                .ok_or_else(|| WalletError::Validation(format!("no approval with id {id}")))?;
            if entry.status != ApprovalStatus::Approved {
                return Err(WalletError::Validation(format!(
                    "approval {id} is not in approved state"
                )));
            }
            entry.status = ApprovalStatus::Executed;
        }
        self.persist()
    }

    /// Trim resolved history to the most recent entries.
    pub fn cleanup(&self) -> Result<usize, WalletError> {
        let removed = {
            let mut entries = self.entries.lock();
            let resolved: Vec<usize> = entries
                .iter()
                .enumerate()
                .filter(|(_, e)| e.status != ApprovalStatus::Pending)
                .map(|(i, _)| i)
                .collect();
            if resolved.len() <= RESOLVED_KEEP {
                0
            } else {
                let excess = resolved.len() - RESOLVED_KEEP;
                let drop_indexes: std::collections::HashSet<usize> =
                    resolved.into_iter().take(excess).collect();
                let before = entries.len();
                let mut index = 0;
                entries.retain(|_| {
                    let keep = !drop_indexes.contains(&index);
                    index += 1;
                    keep
                });
                before - entries.len()
            }
        };
        if removed > 0 {
            self.persist()?;
        }
        Ok(removed)
    }

    pub fn get(&self, id: &str) -> Option<PendingApproval> {
        self.entries.lock().iter().find(|e| e.id == id).cloned()
    }

    pub fn list_pending(&self) -> Vec<PendingApproval> {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.status == ApprovalStatus::Pending)
            .cloned()
            .collect()
    }

    fn persist(&self) -> Result<(), WalletError> {
        let file = PendingFile {
            version: 1,
            pending: self.entries.lock().clone(),
        };
        secure_fs::write_json(&self.path, &file)?;
        Ok(())
    }
}
