//! UTXO state management.
//!
//! Holds the cached set of unspent outputs for the wallet address and
//! mediates every spend-side access. A single store-wide mutex guards
//! selection, locking and mutation; `select_and_lock` holds it across both
//! selection and lock-assignment so two in-flight sends can never choose
//! overlapping inputs. No network call happens under the mutex.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use crate::chain::ChainProvider;
use crate::clock::SharedClock;
use crate::error::WalletError;
use crate::secure_fs;
use crate::tx::estimate_tx_size;
use crate::types::{OutPoint, Utxo};

pub const CACHE_FILE: &str = "cache.json";

/// Default dust threshold: 0.001 DOGE.
pub const DEFAULT_DUST_THRESHOLD: u64 = 100_000;

/// Accept a single UTXO as an "exact match" when it overshoots
/// target + fee by no more than this (the overshoot is absorbed as fee).
const EXACT_MATCH_TOLERANCE: u64 = 10_000;

/// Branch-and-bound exploration budget (deterministic stand-in for a wall
/// clock limit).
const BNB_MAX_STEPS: usize = 50_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionAlgorithm {
    ExactMatch,
    BranchAndBound,
    LargestFirst,
}

#[derive(Clone, Debug)]
pub struct Selection {
    pub selected: Vec<Utxo>,
    /// Fee actually paid: inputs − target − change.
    pub fee: u64,
    pub change: u64,
    pub algorithm: SelectionAlgorithm,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Balance {
    /// Koinu in unlocked UTXOs with ≥1 confirmation.
    pub confirmed: u64,
    /// Koinu in unlocked, still-unconfirmed UTXOs.
    pub unconfirmed: u64,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    version: u32,
    address: String,
    utxos: Vec<Utxo>,
    last_refreshed: Option<String>,
    confirmed_balance: u64,
    unconfirmed_balance: u64,
}

#[derive(Default)]
struct State {
    address: String,
    utxos: BTreeMap<OutPoint, Utxo>,
    last_refreshed: Option<String>,
}

pub struct UtxoStore {
    provider: Arc<dyn ChainProvider>,
    state: Mutex<State>,
    path: PathBuf,
    dust_threshold: u64,
    clock: SharedClock,
}

impl UtxoStore {
    /// `utxo_dir` is the wallet's `utxo/` directory.
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        utxo_dir: &std::path::Path,
        dust_threshold: u64,
        clock: SharedClock,
    ) -> Self {
        Self {
            provider,
            state: Mutex::new(State::default()),
            path: utxo_dir.join(CACHE_FILE),
            dust_threshold,
            clock,
        }
    }

    /// Load the persisted cache, if any. Locks survive restarts so an
    /// in-flight send cannot double-spend across a crash.
    pub fn load(&self) -> Result<(), WalletError> {
        if let Some(file) = secure_fs::read_json::<CacheFile>(&self.path)? {
            let mut state = self.state.lock();
            state.address = file.address;
            state.last_refreshed = file.last_refreshed;
            state.utxos = file
                .utxos
                .into_iter()
                .map(|u| (u.outpoint(), u))
                .collect();
            tracing::debug!(count = state.utxos.len(), "Loaded UTXO cache");
        }
        Ok(())
    }

    /// Fetch the current UTXO set and merge it into the cache.
    ///
    /// Lock flags are preserved for outputs still present. Outputs absent
    /// from the refreshed set are dropped unless still locked by an
    /// in-flight send; those are kept until explicit unlock or spend
    /// confirmation.
    pub async fn refresh(&self, address: &str) -> Result<Balance, WalletError> {
        let fresh = self.provider.get_utxos(address).await?;
        let now = self.clock.now().to_rfc3339();

        let balance = {
            let mut state = self.state.lock();
            state.address = address.to_string();

            let mut merged: BTreeMap<OutPoint, Utxo> = BTreeMap::new();
            for mut utxo in fresh {
                let outpoint = utxo.outpoint();
                if let Some(existing) = state.utxos.get(&outpoint) {
                    utxo.locked = existing.locked;
                    utxo.locked_for = existing.locked_for.clone();
                    utxo.locked_at = existing.locked_at;
                }
                merged.insert(outpoint, utxo);
            }
            // keep locked entries that the provider no longer reports
            for (outpoint, utxo) in state.utxos.iter() {
                if utxo.locked && !merged.contains_key(outpoint) {
                    merged.insert(outpoint.clone(), utxo.clone());
                }
            }

            state.utxos = merged;
            state.last_refreshed = Some(now);
            Self::balance_of(&state)
        };

        self.persist();
        Ok(balance)
    }

    pub fn get_balance(&self) -> Balance {
        Self::balance_of(&self.state.lock())
    }

    fn balance_of(state: &State) -> Balance {
        let mut balance = Balance::default();
        for utxo in state.utxos.values() {
            if utxo.locked {
                continue;
            }
            if utxo.confirmations >= 1 {
                balance.confirmed += utxo.amount;
            } else {
                balance.unconfirmed += utxo.amount;
            }
        }
        balance
    }

    pub fn get_spendable_utxos(&self, min_confirmations: u32) -> Vec<Utxo> {
        let state = self.state.lock();
        let mut spendable: Vec<Utxo> = state
            .utxos
            .values()
            .filter(|u| !u.locked && u.confirmations >= min_confirmations)
            .cloned()
            .collect();
        spendable.sort_by(compare_for_selection);
        spendable
    }

    pub fn utxo_count(&self) -> usize {
        self.state.lock().utxos.len()
    }

    /// Atomically select inputs covering `target + fee` and lock them for
    /// `locked_for`. Algorithm order: exact single-UTXO match, then
    /// branch-and-bound subset search, then largest-first greedy.
    ///
    /// On `InsufficientFunds` nothing is locked.
    pub fn select_and_lock(
        &self,
        target: u64,
        fee_rate: u64,
        min_confirmations: u32,
        locked_for: &str,
    ) -> Result<Selection, WalletError> {
        let mut state = self.state.lock();

        let mut candidates: Vec<&Utxo> = state
            .utxos
            .values()
            .filter(|u| !u.locked && u.confirmations >= min_confirmations)
            .collect();
        candidates.sort_by(|a, b| compare_for_selection(a, b));

        let dust = self.dust_threshold;
        let selection = select_exact_match(&candidates, target, fee_rate, dust)
            .or_else(|| select_branch_and_bound(&candidates, target, fee_rate, dust))
            .or_else(|| select_largest_first(&candidates, target, fee_rate, dust));

        let Some(selection) = selection else {
            let available: u64 = candidates.iter().map(|u| u.amount).sum();
            let fee_floor = fee_rate * estimate_tx_size(1, 2) as u64;
            return Err(WalletError::InsufficientFunds {
                needed: target + fee_floor,
                available,
            });
        };

        // lock under the same critical section that selected
        let now = self.clock.now_ms();
        let outpoints: Vec<OutPoint> = selection.selected.iter().map(|u| u.outpoint()).collect();
        for outpoint in &outpoints {
            let utxo = state.utxos.get_mut(outpoint).expect("selected from cache");
            utxo.locked = true;
            utxo.locked_for = Some(locked_for.to_string());
            utxo.locked_at = Some(now);
        }
        drop(state);

        tracing::debug!(
            inputs = outpoints.len(),
            fee = selection.fee,
            change = selection.change,
            algorithm = ?selection.algorithm,
            intent = locked_for,
            "🔒 Selected and locked inputs"
        );
        self.persist();
        Ok(selection)
    }

    /// Lock a specific set of outpoints for one intent. All-or-nothing:
    /// if any is missing or already locked, nothing changes.
    pub fn lock_outpoints(
        &self,
        outpoints: &[OutPoint],
        locked_for: &str,
    ) -> Result<(), WalletError> {
        let now = self.clock.now_ms();
        let mut state = self.state.lock();
        for outpoint in outpoints {
            match state.utxos.get(outpoint) {
                Some(u) if !u.locked => {}
                Some(_) => {
                    return Err(WalletError::Validation(format!(
                        "output {outpoint} is already locked"
                    )))
                }
                None => {
                    return Err(WalletError::Validation(format!(
                        "output {outpoint} is not in the cache"
                    )))
                }
            }
        }
        for outpoint in outpoints {
            let utxo = state.utxos.get_mut(outpoint).expect("checked above");
            utxo.locked = true;
            utxo.locked_for = Some(locked_for.to_string());
            utxo.locked_at = Some(now);
        }
        drop(state);
        self.persist();
        Ok(())
    }

    /// Optimistic insertion used right after broadcast so the change output
    /// is spendable before the next refresh.
    pub fn add_utxo(&self, utxo: Utxo) {
        let mut state = self.state.lock();
        state.utxos.insert(utxo.outpoint(), utxo);
        drop(state);
        self.persist();
    }

    /// Safe to call on already-unlocked entries.
    pub fn unlock_utxo(&self, txid: &str, vout: u32) {
        let mut state = self.state.lock();
        if let Some(utxo) = state.utxos.get_mut(&OutPoint::new(txid, vout)) {
            utxo.locked = false;
            utxo.locked_for = None;
            utxo.locked_at = None;
        }
        drop(state);
        self.persist();
    }

    /// Release every lock held by one send intent. Returns how many were
    /// unlocked.
    pub fn unlock_all_for(&self, locked_for: &str) -> usize {
        let mut state = self.state.lock();
        let mut unlocked = 0;
        for utxo in state.utxos.values_mut() {
            if utxo.locked && utxo.locked_for.as_deref() == Some(locked_for) {
                utxo.locked = false;
                utxo.locked_for = None;
                utxo.locked_at = None;
                unlocked += 1;
            }
        }
        drop(state);
        if unlocked > 0 {
            tracing::debug!(intent = locked_for, count = unlocked, "🔓 Released input locks");
            self.persist();
        }
        unlocked
    }

    /// Re-point locks from a send intent to the broadcast txid, recording
    /// that these outputs are consumed by an in-flight transaction.
    pub fn mark_spent_by(&self, locked_for: &str, spending_txid: &str) {
        let mut state = self.state.lock();
        for utxo in state.utxos.values_mut() {
            if utxo.locked && utxo.locked_for.as_deref() == Some(locked_for) {
                utxo.locked_for = Some(spending_txid.to_string());
            }
        }
        drop(state);
        self.persist();
    }

    /// Drop every output consumed by `spending_txid`; called when the spend
    /// confirms.
    pub fn remove_spent_by(&self, spending_txid: &str) -> usize {
        let mut state = self.state.lock();
        let before = state.utxos.len();
        state
            .utxos
            .retain(|_, u| !(u.locked && u.locked_for.as_deref() == Some(spending_txid)));
        let removed = before - state.utxos.len();
        drop(state);
        if removed > 0 {
            self.persist();
        }
        removed
    }

    pub fn locked_outpoints(&self) -> Vec<(OutPoint, String)> {
        self.state
            .lock()
            .utxos
            .values()
            .filter(|u| u.locked)
            .map(|u| (u.outpoint(), u.locked_for.clone().unwrap_or_default()))
            .collect()
    }

    fn persist(&self) {
        let state = self.state.lock();
        let balance = Self::balance_of(&state);
        let file = CacheFile {
            version: 1,
            address: state.address.clone(),
            utxos: state.utxos.values().cloned().collect(),
            last_refreshed: state.last_refreshed.clone(),
            confirmed_balance: balance.confirmed,
            unconfirmed_balance: balance.unconfirmed,
        };
        drop(state);
        if let Err(e) = secure_fs::write_json(&self.path, &file) {
            tracing::warn!(error = %e, "Failed to persist UTXO cache");
        }
    }
}

/// Selection preference order: non-dust before dust, then larger amounts,
/// ties broken by (block height asc, txid asc, vout asc). Dust here means
/// below the caller-visible default threshold.
fn compare_for_selection(a: &Utxo, b: &Utxo) -> std::cmp::Ordering {
    let a_dust = a.amount < DEFAULT_DUST_THRESHOLD;
    let b_dust = b.amount < DEFAULT_DUST_THRESHOLD;
    a_dust
        .cmp(&b_dust)
        .then(b.amount.cmp(&a.amount))
        .then(a.block_height.unwrap_or(u64::MAX).cmp(&b.block_height.unwrap_or(u64::MAX)))
        .then(a.txid.cmp(&b.txid))
        .then(a.vout.cmp(&b.vout))
}

fn fee_for(fee_rate: u64, n_inputs: usize) -> u64 {
    fee_rate * estimate_tx_size(n_inputs, 2) as u64
}

fn finalize(selected: Vec<Utxo>, target: u64, fee_rate: u64, dust: u64, algorithm: SelectionAlgorithm) -> Selection {
    let total: u64 = selected.iter().map(|u| u.amount).sum();
    let est_fee = fee_for(fee_rate, selected.len());
    let mut change = total.saturating_sub(target + est_fee);
    if change <= dust {
        // sub-dust change is absorbed into the fee
        change = 0;
    }
    let fee = total - target - change;
    Selection {
        selected,
        fee,
        change,
        algorithm,
    }
}

/// (a) one UTXO that covers target+fee with at most EXACT_MATCH_TOLERANCE
/// overshoot; the overshoot is paid as fee, no change output.
fn select_exact_match(
    candidates: &[&Utxo],
    target: u64,
    fee_rate: u64,
    _dust: u64,
) -> Option<Selection> {
    let needed = target + fee_for(fee_rate, 1);
    let hit = candidates
        .iter()
        .filter(|u| u.amount >= needed && u.amount - needed <= EXACT_MATCH_TOLERANCE)
        .min_by_key(|u| u.amount)?;
    let fee = hit.amount - target;
    Some(Selection {
        selected: vec![(*hit).clone()],
        fee,
        change: 0,
        algorithm: SelectionAlgorithm::ExactMatch,
    })
}

/// (b) depth-first subset search for a combination whose overshoot of
/// target+fee stays within the dust threshold ("bounded waste"), so no
/// change output is produced. Exploration is step-budgeted.
fn select_branch_and_bound(
    candidates: &[&Utxo],
    target: u64,
    fee_rate: u64,
    dust: u64,
) -> Option<Selection> {
    struct Search<'a> {
        candidates: &'a [&'a Utxo],
        target: u64,
        fee_rate: u64,
        waste_bound: u64,
        steps: usize,
        best: Option<(u64, Vec<usize>)>,
    }

    impl Search<'_> {
        fn dfs(&mut self, index: usize, chosen: &mut Vec<usize>, sum: u64, remaining: u64) {
            if self.steps >= BNB_MAX_STEPS {
                return;
            }
            self.steps += 1;

            if !chosen.is_empty() {
                let needed = self.target + fee_for(self.fee_rate, chosen.len());
                if sum >= needed && sum - needed <= self.waste_bound {
                    let waste = sum - needed;
                    if self.best.as_ref().map(|(w, _)| waste < *w).unwrap_or(true) {
                        self.best = Some((waste, chosen.clone()));
                    }
                    return;
                }
            }
            if index >= self.candidates.len() {
                return;
            }
            // even taking everything left cannot reach the target
            let floor = self.target + fee_for(self.fee_rate, chosen.len() + 1);
            if sum + remaining < floor {
                return;
            }

            let amount = self.candidates[index].amount;
            chosen.push(index);
            self.dfs(index + 1, chosen, sum + amount, remaining - amount);
            chosen.pop();
            self.dfs(index + 1, chosen, sum, remaining - amount);
        }
    }

    let remaining: u64 = candidates.iter().map(|u| u.amount).sum();
    let mut search = Search {
        candidates,
        target,
        fee_rate,
        waste_bound: dust,
        steps: 0,
        best: None,
    };
    let mut chosen = Vec::new();
    search.dfs(0, &mut chosen, 0, remaining);

    let (_, indexes) = search.best?;
    let selected: Vec<Utxo> = indexes.iter().map(|i| candidates[*i].clone()).collect();
    let total: u64 = selected.iter().map(|u| u.amount).sum();
    Some(Selection {
        fee: total - target,
        change: 0,
        algorithm: SelectionAlgorithm::BranchAndBound,
        selected,
    })
}

/// (c) accumulate largest-first until the running total covers target+fee.
fn select_largest_first(
    candidates: &[&Utxo],
    target: u64,
    fee_rate: u64,
    dust: u64,
) -> Option<Selection> {
    let mut selected: Vec<Utxo> = Vec::new();
    let mut total = 0u64;
    for utxo in candidates {
        selected.push((*utxo).clone());
        total += utxo.amount;
        if total >= target + fee_for(fee_rate, selected.len()) {
            return Some(finalize(selected, target, fee_rate, dust, SelectionAlgorithm::LargestFirst));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockProvider;
    use crate::clock::system_clock;
    use tempfile::TempDir;

    fn utxo(txid: &str, vout: u32, amount: u64, confirmations: u32) -> Utxo {
        Utxo {
            txid: txid.to_string(),
            vout,
            address: "DTest".to_string(),
            amount,
            script_pubkey: "76a914aa88ac".to_string(),
            confirmations,
            block_height: Some(100),
            locked: false,
            locked_for: None,
            locked_at: None,
        }
    }

    fn store_with(utxos: Vec<Utxo>) -> (UtxoStore, Arc<MockProvider>, TempDir) {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::new());
        provider.set_utxos(utxos);
        let store = UtxoStore::new(
            provider.clone(),
            dir.path(),
            DEFAULT_DUST_THRESHOLD,
            system_clock(),
        );
        (store, provider, dir)
    }

    #[tokio::test]
    async fn refresh_populates_and_balances() {
        let (store, _, _dir) = store_with(vec![
            utxo("aa", 0, 500_000_000, 3),
            utxo("bb", 1, 200_000_000, 0),
        ]);
        let balance = store.refresh("DTest").await.unwrap();
        assert_eq!(balance.confirmed, 500_000_000);
        assert_eq!(balance.unconfirmed, 200_000_000);
    }

    #[tokio::test]
    async fn refresh_preserves_locks_and_keeps_locked_missing() {
        let (store, provider, _dir) = store_with(vec![
            utxo("aa", 0, 500_000_000, 3),
            utxo("bb", 0, 300_000_000, 3),
        ]);
        store.refresh("DTest").await.unwrap();
        store
            .select_and_lock(400_000_000, 1_000, 1, "intent-1")
            .unwrap();

        // provider now reports only bb; aa (locked) must survive the merge
        provider.set_utxos(vec![utxo("bb", 0, 300_000_000, 4)]);
        store.refresh("DTest").await.unwrap();

        let locked = store.locked_outpoints();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].0, OutPoint::new("aa", 0));
        assert_eq!(locked[0].1, "intent-1");

        // and an unlocked missing UTXO is dropped
        provider.set_utxos(vec![]);
        store.refresh("DTest").await.unwrap();
        assert_eq!(store.utxo_count(), 1); // only the locked one remains
    }

    #[tokio::test]
    async fn locked_utxos_excluded_from_balance_and_spendable() {
        let (store, _, _dir) = store_with(vec![
            utxo("aa", 0, 500_000_000, 3),
            utxo("bb", 0, 300_000_000, 3),
        ]);
        store.refresh("DTest").await.unwrap();
        store
            .select_and_lock(450_000_000, 1_000, 1, "intent-1")
            .unwrap();

        let balance = store.get_balance();
        assert_eq!(balance.confirmed, 300_000_000);
        assert_eq!(store.get_spendable_utxos(1).len(), 1);
    }

    #[tokio::test]
    async fn select_exact_match_prefers_single_utxo() {
        let fee_rate = 1_000;
        let fee1 = fee_for(fee_rate, 1);
        let (store, _, _dir) = store_with(vec![
            utxo("aa", 0, 100_000_000 + fee1, 3),
            utxo("bb", 0, 500_000_000, 3),
        ]);
        store.refresh("DTest").await.unwrap();

        let sel = store
            .select_and_lock(100_000_000, fee_rate, 1, "intent-x")
            .unwrap();
        assert_eq!(sel.algorithm, SelectionAlgorithm::ExactMatch);
        assert_eq!(sel.selected.len(), 1);
        assert_eq!(sel.selected[0].txid, "aa");
        assert_eq!(sel.change, 0);
        assert_eq!(sel.fee, fee1);
    }

    #[tokio::test]
    async fn select_falls_back_to_greedy_with_change() {
        let (store, _, _dir) = store_with(vec![
            utxo("aa", 0, 900_000_000, 3),
            utxo("bb", 0, 400_000_000, 3),
        ]);
        store.refresh("DTest").await.unwrap();

        let sel = store
            .select_and_lock(100_000_000, 1_000, 1, "intent-x")
            .unwrap();
        assert_eq!(sel.algorithm, SelectionAlgorithm::LargestFirst);
        // largest first: picks the 9 DOGE input
        assert_eq!(sel.selected[0].txid, "aa");
        assert!(sel.change > 0);
        let total: u64 = sel.selected.iter().map(|u| u.amount).sum();
        assert_eq!(total, 100_000_000 + sel.fee + sel.change);
    }

    #[tokio::test]
    async fn branch_and_bound_finds_changeless_combination() {
        let fee_rate = 1_000;
        let fee2 = fee_for(fee_rate, 2);
        // aa + bb exactly covers target + two-input fee; no single UTXO does
        let (store, _, _dir) = store_with(vec![
            utxo("aa", 0, 60_000_000, 3),
            utxo("bb", 0, 40_000_000 + fee2, 3),
            utxo("cc", 0, 900_000_000, 3),
        ]);
        store.refresh("DTest").await.unwrap();

        let sel = store
            .select_and_lock(100_000_000, fee_rate, 1, "intent-x")
            .unwrap();
        assert_eq!(sel.algorithm, SelectionAlgorithm::BranchAndBound);
        assert_eq!(sel.change, 0);
        assert_eq!(sel.selected.len(), 2);
    }

    #[tokio::test]
    async fn insufficient_funds_locks_nothing() {
        let (store, _, _dir) = store_with(vec![utxo("aa", 0, 50_000_000, 3)]);
        store.refresh("DTest").await.unwrap();

        let err = store
            .select_and_lock(100_000_000, 1_000, 1, "intent-x")
            .unwrap_err();
        assert!(matches!(err, WalletError::InsufficientFunds { .. }));
        assert!(store.locked_outpoints().is_empty());
    }

    #[tokio::test]
    async fn min_confirmations_filters_candidates() {
        let (store, _, _dir) = store_with(vec![utxo("aa", 0, 500_000_000, 0)]);
        store.refresh("DTest").await.unwrap();
        assert!(store.select_and_lock(100_000_000, 1_000, 1, "i").is_err());
        assert!(store.select_and_lock(100_000_000, 1_000, 0, "i").is_ok());
    }

    #[tokio::test]
    async fn dust_is_deprioritized_but_spendable() {
        let (store, _, _dir) = store_with(vec![
            utxo("dust", 0, 50_000, 9),
            utxo("big", 0, 500_000_000, 3),
        ]);
        store.refresh("DTest").await.unwrap();
        let spendable = store.get_spendable_utxos(1);
        assert_eq!(spendable[0].txid, "big");
        assert_eq!(spendable[1].txid, "dust");
    }

    #[tokio::test]
    async fn equal_amounts_tie_break_by_height_txid_vout() {
        let mut a = utxo("bb", 2, 100_000_000, 3);
        a.block_height = Some(50);
        let mut b = utxo("aa", 1, 100_000_000, 3);
        b.block_height = Some(50);
        let mut c = utxo("aa", 0, 100_000_000, 3);
        c.block_height = Some(40);
        let (store, _, _dir) = store_with(vec![a, b, c]);
        store.refresh("DTest").await.unwrap();

        let spendable = store.get_spendable_utxos(1);
        assert_eq!((spendable[0].txid.as_str(), spendable[0].vout), ("aa", 0));
        assert_eq!((spendable[1].txid.as_str(), spendable[1].vout), ("aa", 1));
        assert_eq!((spendable[2].txid.as_str(), spendable[2].vout), ("bb", 2));
    }

    #[tokio::test]
    async fn unlock_all_for_releases_only_that_intent() {
        let (store, _, _dir) = store_with(vec![
            utxo("aa", 0, 500_000_000, 3),
            utxo("bb", 0, 500_000_000, 3),
        ]);
        store.refresh("DTest").await.unwrap();
        store.select_and_lock(400_000_000, 1_000, 1, "one").unwrap();
        store.select_and_lock(400_000_000, 1_000, 1, "two").unwrap();
        assert_eq!(store.locked_outpoints().len(), 2);

        assert_eq!(store.unlock_all_for("one"), 1);
        let locked = store.locked_outpoints();
        assert_eq!(locked.len(), 1);
        assert_eq!(locked[0].1, "two");
        // idempotent
        assert_eq!(store.unlock_all_for("one"), 0);
    }

    #[tokio::test]
    async fn optimistic_change_add_counts_toward_balance() {
        let (store, _, _dir) = store_with(vec![]);
        store.refresh("DTest").await.unwrap();
        store.add_utxo(utxo("change", 1, 123_000_000, 0));
        assert_eq!(store.get_balance().unconfirmed, 123_000_000);
    }

    #[tokio::test]
    async fn mark_spent_then_remove_on_confirmation() {
        let (store, _, _dir) = store_with(vec![utxo("aa", 0, 500_000_000, 3)]);
        store.refresh("DTest").await.unwrap();
        store.select_and_lock(100_000_000, 1_000, 1, "intent").unwrap();
        store.mark_spent_by("intent", "deadbeef");
        assert_eq!(store.remove_spent_by("deadbeef"), 1);
        assert_eq!(store.utxo_count(), 0);
    }

    #[tokio::test]
    async fn cache_survives_reload() {
        let dir = TempDir::new().unwrap();
        let provider = Arc::new(MockProvider::new());
        provider.set_utxos(vec![utxo("aa", 0, 500_000_000, 3)]);
        let store = UtxoStore::new(provider.clone(), dir.path(), DEFAULT_DUST_THRESHOLD, system_clock());
        store.refresh("DTest").await.unwrap();
        store.select_and_lock(100_000_000, 1_000, 1, "intent").unwrap();

        let store2 = UtxoStore::new(provider, dir.path(), DEFAULT_DUST_THRESHOLD, system_clock());
        store2.load().unwrap();
        assert_eq!(store2.utxo_count(), 1);
        assert_eq!(store2.locked_outpoints().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_selection_cannot_overlap() {
        let (store, _, _dir) = store_with(vec![utxo("aa", 0, 500_000_000, 3)]);
        store.refresh("DTest").await.unwrap();
        let store = Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.select_and_lock(100_000_000, 1_000, 1, &format!("intent-{i}"))
            }));
        }
        let mut successes = 0;
        for handle in handles {
            if handle.await.unwrap().is_ok() {
                successes += 1;
            }
        }
        // only one intent can win the single UTXO
        assert_eq!(successes, 1);
    }
}
