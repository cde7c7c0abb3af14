//! In-process provider for tests: scriptable responses, call counting.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

use super::{
    AddressBalance, ChainProvider, ChainTransaction, NetworkInfo, ProviderError,
    ProviderErrorKind,
};
use crate::types::Utxo;

#[derive(Default)]
struct MockState {
    balance: AddressBalance,
    utxos: Vec<Utxo>,
    transactions: HashMap<String, ChainTransaction>,
    address_txs: Vec<ChainTransaction>,
    network_info: Option<NetworkInfo>,
    broadcast_txid: Option<String>,
    fail_all: Option<ProviderErrorKind>,
    fail_broadcast: Option<ProviderErrorKind>,
    fail_get_transaction: Option<ProviderErrorKind>,
    broadcast_log: Vec<String>,
}

pub struct MockProvider {
    name: String,
    state: Mutex<MockState>,
    calls: Mutex<HashMap<&'static str, u32>>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::named("mock")
    }

    pub fn named(name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn set_balance(&self, confirmed: u64, unconfirmed: u64) {
        self.state.lock().balance = AddressBalance {
            confirmed,
            unconfirmed,
        };
    }

    pub fn set_utxos(&self, utxos: Vec<Utxo>) {
        self.state.lock().utxos = utxos;
    }

    pub fn set_transaction(&self, tx: ChainTransaction) {
        self.state.lock().transactions.insert(tx.txid.clone(), tx);
    }

    pub fn remove_transaction(&self, txid: &str) {
        self.state.lock().transactions.remove(txid);
    }

    pub fn set_address_transactions(&self, txs: Vec<ChainTransaction>) {
        self.state.lock().address_txs = txs;
    }

    pub fn set_network_info(&self, info: NetworkInfo) {
        self.state.lock().network_info = Some(info);
    }

    pub fn set_broadcast_txid(&self, txid: &str) {
        self.state.lock().broadcast_txid = Some(txid.to_string());
    }

    pub fn fail_all_with(&self, kind: ProviderErrorKind) {
        self.state.lock().fail_all = Some(kind);
    }

    pub fn fail_broadcast_with(&self, kind: ProviderErrorKind) {
        self.state.lock().fail_broadcast = Some(kind);
    }

    pub fn fail_get_transaction_with(&self, kind: ProviderErrorKind) {
        self.state.lock().fail_get_transaction = Some(kind);
    }

    /// Clear every configured failure.
    pub fn heal(&self) {
        let mut state = self.state.lock();
        state.fail_all = None;
        state.fail_broadcast = None;
        state.fail_get_transaction = None;
    }

    pub fn calls(&self, op: &str) -> u32 {
        *self.calls.lock().get(op).unwrap_or(&0)
    }

    pub fn broadcast_log(&self) -> Vec<String> {
        self.state.lock().broadcast_log.clone()
    }

    fn count(&self, op: &'static str) {
        *self.calls.lock().entry(op).or_insert(0) += 1;
    }

    fn check_fail(&self, op: &str) -> Result<(), ProviderError> {
        if let Some(kind) = self.state.lock().fail_all {
            return Err(ProviderError::new(&self.name, kind, format!("{op} scripted failure")));
        }
        Ok(())
    }
}

impl Default for MockProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainProvider for MockProvider {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_balance(&self, _address: &str) -> Result<AddressBalance, ProviderError> {
        self.count("get_balance");
        self.check_fail("get_balance")?;
        Ok(self.state.lock().balance.clone())
    }

    async fn get_utxos(&self, _address: &str) -> Result<Vec<Utxo>, ProviderError> {
        self.count("get_utxos");
        self.check_fail("get_utxos")?;
        Ok(self.state.lock().utxos.clone())
    }

    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction, ProviderError> {
        self.count("get_transaction");
        self.check_fail("get_transaction")?;
        if let Some(kind) = self.state.lock().fail_get_transaction {
            return Err(ProviderError::new(&self.name, kind, "scripted tx failure"));
        }
        self.state
            .lock()
            .transactions
            .get(txid)
            .cloned()
            .ok_or_else(|| {
                ProviderError::new(&self.name, ProviderErrorKind::NotFound, "no such tx")
            })
    }

    async fn get_transactions(
        &self,
        _address: &str,
        limit: usize,
    ) -> Result<Vec<ChainTransaction>, ProviderError> {
        self.count("get_transactions");
        self.check_fail("get_transactions")?;
        Ok(self
            .state
            .lock()
            .address_txs
            .iter()
            .take(limit)
            .cloned()
            .collect())
    }

    async fn broadcast_tx(&self, raw_hex: &str) -> Result<String, ProviderError> {
        self.count("broadcast_tx");
        self.check_fail("broadcast_tx")?;
        if let Some(kind) = self.state.lock().fail_broadcast {
            return Err(ProviderError::new(&self.name, kind, "scripted broadcast failure"));
        }
        let mut state = self.state.lock();
        state.broadcast_log.push(raw_hex.to_string());
        if let Some(txid) = &state.broadcast_txid {
            return Ok(txid.clone());
        }
        // real txid of the submitted bytes, so callers can cross-check
        let bytes = hex::decode(raw_hex).map_err(|_| {
            ProviderError::new(&self.name, ProviderErrorKind::InvalidResponse, "bad hex")
        })?;
        let mut hash = crate::tx::double_sha256(&bytes);
        hash.reverse();
        Ok(hex::encode(hash))
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError> {
        self.count("get_network_info");
        self.check_fail("get_network_info")?;
        Ok(self
            .state
            .lock()
            .network_info
            .clone()
            .unwrap_or(NetworkInfo {
                height: 5_000_000,
                fee_per_kb: Some(1_000_000),
            }))
    }
}
