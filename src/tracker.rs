//! Confirmation tracking for broadcast transactions.
//!
//! Polls each tracked txid until it confirms or is given up on. Provider
//! trouble (rate limits, 5xx, network errors) is kept strictly separate
//! from a real "transaction unknown" answer: API degradation backs off
//! exponentially and never counts toward failure, while a real not-found is
//! re-checked against the other provider before it counts. Terminal
//! failure or unverified status releases the inputs the send had locked.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;

use crate::chain::{ChainProvider, FailoverChain, ProviderErrorKind};
use crate::clock::SharedClock;
use crate::error::WalletError;
use crate::events::{EventBus, WalletEvent};
use crate::secure_fs;
use crate::utxo_store::UtxoStore;

pub const TRACKING_FILE: &str = "tracking.json";

/// Baseline poll interval.
pub const BASE_POLL_INTERVAL_MS: u64 = 120_000;
/// Backoff cap: 10 minutes.
pub const MAX_POLL_INTERVAL_MS: u64 = 600_000;
/// Confirmations for a terminal `confirmed`.
pub const CONFIRMATION_TARGET: u32 = 6;
/// Real not-founds before giving up.
pub const MAX_POLL_FAILURES: u32 = 30;
/// Age beyond which a still-unconfirmed tx is aged out.
const MAX_AGE_MS: i64 = 24 * 3_600_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TxStatus {
    Pending,
    Confirming,
    Confirmed,
    Failed,
    Unverified,
}

impl TxStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TxStatus::Confirmed | TxStatus::Failed | TxStatus::Unverified)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxMetadata {
    pub to: String,
    /// Koinu.
    pub amount: u64,
    pub fee: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackedTransaction {
    pub txid: String,
    pub status: TxStatus,
    pub confirmations: u32,
    /// Unix ms.
    pub started_at: i64,
    pub last_checked_at: Option<i64>,
    /// Real not-found count.
    pub poll_failures: u32,
    /// Degraded-API error count.
    pub api_errors: u32,
    pub metadata: TxMetadata,
    /// Current poll interval after backoff.
    #[serde(default = "default_interval")]
    pub poll_interval_ms: u64,
}

fn default_interval() -> u64 {
    BASE_POLL_INTERVAL_MS
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct TrackingFile {
    version: u32,
    transactions: Vec<TrackedTransaction>,
}

pub struct TxTracker {
    provider: Arc<FailoverChain>,
    utxo_store: Arc<UtxoStore>,
    events: EventBus,
    path: PathBuf,
    clock: SharedClock,
    transactions: Mutex<Vec<TrackedTransaction>>,
}

impl TxTracker {
    pub fn new(
        provider: Arc<FailoverChain>,
        utxo_store: Arc<UtxoStore>,
        events: EventBus,
        data_dir: &std::path::Path,
        clock: SharedClock,
    ) -> Self {
        Self {
            provider,
            utxo_store,
            events,
            path: data_dir.join(TRACKING_FILE),
            clock,
            transactions: Mutex::new(Vec::new()),
        }
    }

    pub fn load(&self) -> Result<(), WalletError> {
        if let Some(file) = secure_fs::read_json::<TrackingFile>(&self.path)? {
            *self.transactions.lock() = file.transactions;
        }
        Ok(())
    }

    /// Register a freshly broadcast transaction.
    pub fn track(&self, txid: &str, metadata: TxMetadata) {
        let mut transactions = self.transactions.lock();
        if transactions.iter().any(|t| t.txid == txid) {
            // idempotent re-broadcast: no double tracking
            return;
        }
        transactions.push(TrackedTransaction {
            txid: txid.to_string(),
            status: TxStatus::Pending,
            confirmations: 0,
            started_at: self.clock.now_ms(),
            last_checked_at: None,
            poll_failures: 0,
            api_errors: 0,
            metadata,
            poll_interval_ms: BASE_POLL_INTERVAL_MS,
        });
        drop(transactions);
        self.persist();
        tracing::info!(txid, "👁️ Tracking transaction to confirmation");
    }

    pub fn get(&self, txid: &str) -> Option<TrackedTransaction> {
        self.transactions.lock().iter().find(|t| t.txid == txid).cloned()
    }

    pub fn all(&self) -> Vec<TrackedTransaction> {
        self.transactions.lock().clone()
    }

    pub fn is_tracked(&self, txid: &str) -> bool {
        self.transactions.lock().iter().any(|t| t.txid == txid)
    }

    /// Poll every active transaction whose interval has elapsed. Driven by
    /// the orchestrator timer.
    pub async fn poll_due(&self) {
        let now = self.clock.now_ms();
        let due: Vec<String> = self
            .transactions
            .lock()
            .iter()
            .filter(|t| !t.status.is_terminal())
            .filter(|t| {
                t.last_checked_at
                    .map(|last| now - last >= t.poll_interval_ms as i64)
                    .unwrap_or(true)
            })
            .map(|t| t.txid.clone())
            .collect();

        for txid in due {
            self.poll_one(&txid).await;
        }
    }

    /// One poll cycle for one transaction.
    pub async fn poll_one(&self, txid: &str) {
        let result = self.provider.get_transaction(txid).await;
        let now = self.clock.now_ms();

        enum Outcome {
            Confirmed,
            FailedTerminal(TxStatus),
            NotFound,
            Nothing,
        }

        let outcome = {
            let mut transactions = self.transactions.lock();
            let Some(tx) = transactions.iter_mut().find(|t| t.txid == txid) else {
                return;
            };
            if tx.status.is_terminal() {
                return;
            }
            tx.last_checked_at = Some(now);

            match result {
                Ok(chain_tx) => {
                    // a successful poll clears degradation state
                    tx.api_errors = 0;
                    tx.poll_failures = 0;
                    tx.poll_interval_ms = BASE_POLL_INTERVAL_MS;
                    tx.confirmations = chain_tx.confirmations;

                    if chain_tx.confirmations >= CONFIRMATION_TARGET {
                        tx.status = TxStatus::Confirmed;
                        Outcome::Confirmed
                    } else if chain_tx.confirmations >= 1 {
                        tx.status = TxStatus::Confirming;
                        Outcome::Nothing
                    } else {
                        Outcome::Nothing
                    }
                }
                Err(err) if err.kind == ProviderErrorKind::NotFound => Outcome::NotFound,
                Err(err) => {
                    // API-degraded: back off, never count toward failure
                    tx.api_errors += 1;
                    tx.poll_interval_ms = (tx.poll_interval_ms * 2).min(MAX_POLL_INTERVAL_MS);
                    tracing::debug!(
                        txid,
                        api_errors = tx.api_errors,
                        interval_ms = tx.poll_interval_ms,
                        error = %err,
                        "Poll degraded, backing off"
                    );
                    self.check_age_out(tx)
                        .map(Outcome::FailedTerminal)
                        .unwrap_or(Outcome::Nothing)
                }
            }
        };

        match outcome {
            Outcome::Confirmed => self.finish_confirmed(txid),
            Outcome::FailedTerminal(status) => self.finish_failed(txid, status),
            // real not-found: probe the other providers before counting
            Outcome::NotFound => self.handle_not_found(txid).await,
            Outcome::Nothing => self.persist(),
        }
    }

    async fn handle_not_found(&self, txid: &str) {
        let fallback = self.provider.probe_transaction(txid).await;

        let outcome = {
            let mut transactions = self.transactions.lock();
            let Some(tx) = transactions.iter_mut().find(|t| t.txid == txid) else {
                return;
            };
            match fallback {
                Some(chain_tx) => {
                    tx.api_errors = 0;
                    tx.poll_failures = 0;
                    tx.poll_interval_ms = BASE_POLL_INTERVAL_MS;
                    tx.confirmations = chain_tx.confirmations;
                    if chain_tx.confirmations >= CONFIRMATION_TARGET {
                        tx.status = TxStatus::Confirmed;
                        Some(TxStatus::Confirmed)
                    } else if chain_tx.confirmations >= 1 {
                        tx.status = TxStatus::Confirming;
                        None
                    } else {
                        None
                    }
                }
                None => {
                    tx.poll_failures += 1;
                    tracing::warn!(
                        txid,
                        poll_failures = tx.poll_failures,
                        "Transaction not found on any provider"
                    );
                    if tx.poll_failures >= MAX_POLL_FAILURES {
                        tx.status = TxStatus::Failed;
                        Some(TxStatus::Failed)
                    } else {
                        self.check_age_out(tx)
                    }
                }
            }
        };

        match outcome {
            Some(TxStatus::Confirmed) => self.finish_confirmed(txid),
            Some(status @ (TxStatus::Failed | TxStatus::Unverified)) => {
                self.finish_failed(txid, status)
            }
            _ => self.persist(),
        }
    }

    /// Age-out rule for transactions older than 24 h: mostly real
    /// not-founds means failed; mostly API errors means unverified.
    fn check_age_out(&self, tx: &mut TrackedTransaction) -> Option<TxStatus> {
        if self.clock.now_ms() - tx.started_at <= MAX_AGE_MS {
            return None;
        }
        let status = if tx.poll_failures > tx.api_errors {
            TxStatus::Failed
        } else {
            TxStatus::Unverified
        };
        tx.status = status;
        Some(status)
    }

    fn finish_confirmed(&self, txid: &str) {
        // the inputs this send consumed are gone for good
        self.utxo_store.remove_spent_by(txid);
        self.persist();
        tracing::info!(txid, "✅ Transaction confirmed");
        self.events.publish(WalletEvent::Confirmed { txid: txid.to_string() });
    }

    fn finish_failed(&self, txid: &str, status: TxStatus) {
        // the send did not happen; release its inputs for reuse
        let released = self.utxo_store.unlock_all_for(txid);
        self.persist();
        tracing::warn!(txid, ?status, released, "Transaction tracking ended without confirmation");
        self.events.publish(WalletEvent::SendFailed {
            txid: txid.to_string(),
            terminal: format!("{status:?}").to_lowercase(),
        });
    }

    fn persist(&self) {
        let file = TrackingFile {
            version: 1,
            transactions: self.transactions.lock().clone(),
        };
        if let Err(e) = secure_fs::write_json(&self.path, &file) {
            tracing::warn!(error = %e, "Failed to persist tracking state");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockProvider;
    use crate::chain::{ChainTransaction, ProviderErrorKind};
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    struct Fixture {
        tracker: TxTracker,
        primary: Arc<MockProvider>,
        fallback: Arc<MockProvider>,
        clock: ManualClock,
        _dir: TempDir,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let clock = ManualClock::new(Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap());
        let shared: SharedClock = Arc::new(clock.clone());
        let primary = Arc::new(MockProvider::named("primary"));
        let fallback = Arc::new(MockProvider::named("fallback"));
        let chain = Arc::new(FailoverChain::new(
            vec![primary.clone() as Arc<dyn ChainProvider>, fallback.clone()],
            shared.clone(),
        ));
        let utxo_store = Arc::new(UtxoStore::new(
            chain.clone(),
            dir.path(),
            crate::utxo_store::DEFAULT_DUST_THRESHOLD,
            shared.clone(),
        ));
        let tracker = TxTracker::new(chain, utxo_store, EventBus::new(), dir.path(), shared);
        Fixture {
            tracker,
            primary,
            fallback,
            clock,
            _dir: dir,
        }
    }

    fn chain_tx(txid: &str, confirmations: u32) -> ChainTransaction {
        ChainTransaction {
            txid: txid.to_string(),
            confirmations,
            block_height: Some(5_000_000),
            outputs: vec![],
        }
    }

    fn metadata() -> TxMetadata {
        TxMetadata {
            to: "DRecipient".into(),
            amount: 250_000_000,
            fee: 226_000,
        }
    }

    #[tokio::test]
    async fn confirms_at_target() {
        let f = fixture();
        f.tracker.track("aa", metadata());
        assert_eq!(f.tracker.get("aa").unwrap().status, TxStatus::Pending);

        f.primary.set_transaction(chain_tx("aa", 1));
        f.tracker.poll_one("aa").await;
        assert_eq!(f.tracker.get("aa").unwrap().status, TxStatus::Confirming);

        f.primary.set_transaction(chain_tx("aa", 6));
        f.tracker.poll_one("aa").await;
        let tracked = f.tracker.get("aa").unwrap();
        assert_eq!(tracked.status, TxStatus::Confirmed);
        assert_eq!(tracked.confirmations, 6);

        // terminal: further polls are no-ops
        f.primary.remove_transaction("aa");
        f.tracker.poll_one("aa").await;
        assert_eq!(f.tracker.get("aa").unwrap().status, TxStatus::Confirmed);
    }

    #[tokio::test]
    async fn api_degradation_backs_off_without_failing() {
        let f = fixture();
        f.tracker.track("aa", metadata());
        f.primary.fail_all_with(ProviderErrorKind::RateLimited);
        f.fallback.fail_all_with(ProviderErrorKind::RateLimited);

        for _ in 0..30 {
            f.tracker.poll_one("aa").await;
            f.clock.advance_ms(60_000);
        }

        let tracked = f.tracker.get("aa").unwrap();
        assert_eq!(tracked.poll_failures, 0);
        assert_eq!(tracked.api_errors, 30);
        assert!(matches!(tracked.status, TxStatus::Pending | TxStatus::Confirming));
        assert_eq!(tracked.poll_interval_ms, MAX_POLL_INTERVAL_MS);

        // one good poll resets counters and interval
        f.primary.heal();
        f.fallback.heal();
        f.primary.set_transaction(chain_tx("aa", 1));
        f.tracker.poll_one("aa").await;
        let tracked = f.tracker.get("aa").unwrap();
        assert_eq!(tracked.api_errors, 0);
        assert_eq!(tracked.poll_interval_ms, BASE_POLL_INTERVAL_MS);
        assert_eq!(tracked.status, TxStatus::Confirming);
    }

    #[tokio::test]
    async fn not_found_probes_fallback_before_counting() {
        let f = fixture();
        f.tracker.track("aa", metadata());

        // primary does not know the tx, fallback does
        f.fallback.set_transaction(chain_tx("aa", 2));
        f.tracker.poll_one("aa").await;
        let tracked = f.tracker.get("aa").unwrap();
        assert_eq!(tracked.poll_failures, 0);
        assert_eq!(tracked.status, TxStatus::Confirming);
    }

    #[tokio::test]
    async fn repeated_real_not_found_fails_and_unlocks() {
        let f = fixture();
        f.tracker.track("aa", metadata());

        // pretend the send locked an input, re-pointed to the txid
        f.tracker.utxo_store.add_utxo(crate::types::Utxo {
            txid: "input".into(),
            vout: 0,
            address: "DMine".into(),
            amount: 500_000_000,
            script_pubkey: String::new(),
            confirmations: 3,
            block_height: None,
            locked: true,
            locked_for: Some("aa".into()),
            locked_at: Some(0),
        });

        let mut events = f.tracker.events.subscribe();
        for _ in 0..MAX_POLL_FAILURES {
            f.tracker.poll_one("aa").await;
            f.clock.advance_ms(120_000);
        }

        let tracked = f.tracker.get("aa").unwrap();
        assert_eq!(tracked.status, TxStatus::Failed);
        assert!(f.tracker.utxo_store.locked_outpoints().is_empty());
        match events.recv().await.unwrap() {
            WalletEvent::SendFailed { txid, .. } => assert_eq!(txid, "aa"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn ages_out_unverified_when_api_errors_dominate() {
        let f = fixture();
        f.tracker.track("aa", metadata());
        f.primary.fail_all_with(ProviderErrorKind::Transient);
        f.fallback.fail_all_with(ProviderErrorKind::Transient);

        f.clock.advance_ms(24 * 3_600_000 + 1);
        f.tracker.poll_one("aa").await;
        assert_eq!(f.tracker.get("aa").unwrap().status, TxStatus::Unverified);
    }

    #[tokio::test]
    async fn tracking_is_idempotent_per_txid() {
        let f = fixture();
        f.tracker.track("aa", metadata());
        f.tracker.track("aa", metadata());
        assert_eq!(f.tracker.all().len(), 1);
    }

    #[tokio::test]
    async fn state_survives_restart() {
        let dir = TempDir::new().unwrap();
        let clock: SharedClock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 6, 1, 0, 0, 0).unwrap(),
        ));
        let primary = Arc::new(MockProvider::new());
        let chain = Arc::new(FailoverChain::new(vec![primary.clone() as Arc<dyn ChainProvider>], clock.clone()));
        let store = Arc::new(UtxoStore::new(
            chain.clone(),
            dir.path(),
            crate::utxo_store::DEFAULT_DUST_THRESHOLD,
            clock.clone(),
        ));
        {
            let tracker = TxTracker::new(
                chain.clone(),
                store.clone(),
                EventBus::new(),
                dir.path(),
                clock.clone(),
            );
            tracker.track("aa", metadata());
        }
        let tracker = TxTracker::new(chain, store, EventBus::new(), dir.path(), clock);
        tracker.load().unwrap();
        assert!(tracker.is_tracked("aa"));
    }

    #[tokio::test]
    async fn poll_due_respects_intervals() {
        let f = fixture();
        f.tracker.track("aa", metadata());
        f.primary.set_transaction(chain_tx("aa", 0));

        f.tracker.poll_due().await;
        assert_eq!(f.primary.calls("get_transaction"), 1);

        // not due yet
        f.clock.advance_ms(1_000);
        f.tracker.poll_due().await;
        assert_eq!(f.primary.calls("get_transaction"), 1);

        f.clock.advance_ms(BASE_POLL_INTERVAL_MS as i64);
        f.tracker.poll_due().await;
        assert_eq!(f.primary.calls("get_transaction"), 2);
    }
}
