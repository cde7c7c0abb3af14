//! Inbound payment monitor.
//!
//! Polls the chain for transactions touching the wallet address, remembers
//! which txids it has already handled, and publishes a `Received` event at
//! most once per inbound transaction. The audit log applies its own dedup
//! as a second layer.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use crate::audit::{AuditAction, AuditLog};
use crate::chain::ChainProvider;
use crate::clock::SharedClock;
use crate::error::WalletError;
use crate::events::{EventBus, WalletEvent};
use crate::secure_fs;
use crate::types::Initiator;

pub const RECEIVE_STATE_FILE: &str = "receive-state.json";

/// How many recent transactions each poll inspects.
const POLL_TX_LIMIT: usize = 25;
/// Cap on the remembered txid set; oldest entries are dropped first.
const SEEN_CAP: usize = 10_000;

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct ReceiveStateFile {
    version: u32,
    seen_txids: Vec<String>,
    last_poll_at: Option<String>,
}

#[derive(Default)]
struct State {
    seen: HashSet<String>,
    /// Insertion order, for trimming.
    order: Vec<String>,
    last_poll_at: Option<String>,
}

pub struct ReceiveMonitor {
    provider: Arc<dyn ChainProvider>,
    audit: Arc<AuditLog>,
    events: EventBus,
    path: PathBuf,
    clock: SharedClock,
    state: Mutex<State>,
}

impl ReceiveMonitor {
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        audit: Arc<AuditLog>,
        events: EventBus,
        data_dir: &std::path::Path,
        clock: SharedClock,
    ) -> Self {
        Self {
            provider,
            audit,
            events,
            path: data_dir.join(RECEIVE_STATE_FILE),
            clock,
            state: Mutex::new(State::default()),
        }
    }

    pub fn load(&self) -> Result<(), WalletError> {
        if let Some(file) = secure_fs::read_json::<ReceiveStateFile>(&self.path)? {
            let mut state = self.state.lock();
            state.seen = file.seen_txids.iter().cloned().collect();
            state.order = file.seen_txids;
            state.last_poll_at = file.last_poll_at;
        }
        Ok(())
    }

    /// Mark a txid handled without emitting (used for the wallet's own
    /// outbound transactions, whose change would otherwise look inbound).
    pub fn suppress(&self, txid: &str) {
        let mut state = self.state.lock();
        if state.seen.insert(txid.to_string()) {
            state.order.push(txid.to_string());
        }
    }

    /// One poll cycle. Returns the number of newly seen inbound payments.
    pub async fn poll(&self, address: &str) -> Result<usize, WalletError> {
        let txs = self.provider.get_transactions(address, POLL_TX_LIMIT).await?;
        let now = self.clock.now().to_rfc3339();

        let mut fresh = Vec::new();
        {
            let mut state = self.state.lock();
            state.last_poll_at = Some(now);
            for tx in &txs {
                if state.seen.contains(&tx.txid) {
                    continue;
                }
                let amount: u64 = tx
                    .outputs
                    .iter()
                    .filter(|o| o.address.as_deref() == Some(address))
                    .map(|o| o.value)
                    .sum();
                if amount == 0 {
                    continue;
                }
                state.seen.insert(tx.txid.clone());
                state.order.push(tx.txid.clone());
                fresh.push((tx.txid.clone(), amount, tx.confirmations));
            }
            while state.order.len() > SEEN_CAP {
                let oldest = state.order.remove(0);
                state.seen.remove(&oldest);
            }
        }

        for (txid, amount, confirmations) in &fresh {
            let mut entry = self
                .audit
                .entry(AuditAction::Receive, "inbound payment", Initiator::External);
            entry.txid = Some(txid.clone());
            entry.amount = Some(*amount);
            entry.address = Some(address.to_string());
            self.audit.record(entry)?;

            // audit precedes the notification
            self.events.publish(WalletEvent::Received {
                txid: txid.clone(),
                amount: *amount,
                confirmations: *confirmations,
            });
            tracing::info!(%txid, amount = *amount, "📥 Inbound payment detected");
        }

        self.persist();
        Ok(fresh.len())
    }

    fn persist(&self) {
        let state = self.state.lock();
        let file = ReceiveStateFile {
            version: 1,
            seen_txids: state.order.clone(),
            last_poll_at: state.last_poll_at.clone(),
        };
        drop(state);
        if let Err(e) = secure_fs::write_json(&self.path, &file) {
            tracing::warn!(error = %e, "Failed to persist receive state");
        }
    }
}
