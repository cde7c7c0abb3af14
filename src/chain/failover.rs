//! Two-tier provider failover with health tracking.
//!
//! Call order per operation: providers currently considered healthy (or past
//! their probation window) first, then unhealthy ones as last resort. A
//! success heals the provider; a transport-class failure marks it unhealthy
//! for `UNHEALTHY_DURATION_MS` before it gets another first-line try.
//!
//! The composite implements [`ChainProvider`] itself, so the rest of the
//! wallet cannot tell one provider from many.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;

use super::{
    AddressBalance, ChainProvider, ChainTransaction, NetworkInfo, ProviderError,
    ProviderErrorKind,
};
use crate::clock::SharedClock;
use crate::types::Utxo;

pub const UNHEALTHY_DURATION_MS: i64 = 60_000;

#[derive(Clone, Debug)]
pub struct ProviderHealth {
    pub name: String,
    pub healthy: bool,
    pub consecutive_failures: u32,
    pub last_error_at_ms: Option<i64>,
}

pub struct FailoverChain {
    providers: Vec<Arc<dyn ChainProvider>>,
    /// Consulted for broadcast only, after every standard provider failed.
    last_resort: Option<Arc<dyn ChainProvider>>,
    health: Mutex<Vec<ProviderHealth>>,
    unhealthy_duration_ms: i64,
    clock: SharedClock,
}

/// Run one operation against each provider in failover order. Stops early
/// on errors that are definitive answers (not-found, double-spend,
/// fee-too-low, already-known) rather than provider trouble.
macro_rules! failover_call {
    ($self:ident, $op_name:literal, |$provider:ident| $call:expr) => {{
        let mut tried: Vec<String> = Vec::new();
        let mut last_error: Option<ProviderError> = None;
        let mut result = None;

        for index in $self.call_order() {
            let $provider = &$self.providers[index];
            tried.push($provider.name().to_string());
            match $call {
                Ok(value) => {
                    $self.record_success(index);
                    result = Some(Ok(value));
                    break;
                }
                Err(err) => {
                    $self.record_failure(index, &err);
                    if !err.is_retriable_elsewhere() {
                        result = Some(Err(err));
                        break;
                    }
                    tracing::debug!(provider = %$provider.name(), %err, concat!($op_name, " failed, trying next"));
                    last_error = Some(err);
                }
            }
        }

        match result {
            Some(outcome) => outcome,
            None => {
                let last = last_error.unwrap_or_else(|| {
                    ProviderError::new(
                        "failover",
                        ProviderErrorKind::Transient,
                        "no providers configured",
                    )
                });
                Err(ProviderError::new(
                    "failover",
                    last.kind,
                    format!(
                        concat!($op_name, " failed on all providers (tried {:?}): {}"),
                        tried, last
                    ),
                )
                .with_tried(tried))
            }
        }
    }};
}

impl FailoverChain {
    pub fn new(providers: Vec<Arc<dyn ChainProvider>>, clock: SharedClock) -> Self {
        let health = providers
            .iter()
            .map(|p| ProviderHealth {
                name: p.name().to_string(),
                healthy: true,
                consecutive_failures: 0,
                last_error_at_ms: None,
            })
            .collect();
        Self {
            providers,
            last_resort: None,
            health: Mutex::new(health),
            unhealthy_duration_ms: UNHEALTHY_DURATION_MS,
            clock,
        }
    }

    pub fn with_last_resort(mut self, provider: Arc<dyn ChainProvider>) -> Self {
        self.last_resort = Some(provider);
        self
    }

    pub fn provider_names(&self) -> Vec<String> {
        self.providers.iter().map(|p| p.name().to_string()).collect()
    }

    pub fn health_snapshot(&self) -> Vec<ProviderHealth> {
        self.health.lock().clone()
    }

    /// Healthy-or-probation providers first, unhealthy last.
    fn call_order(&self) -> Vec<usize> {
        let now = self.clock.now_ms();
        let health = self.health.lock();
        let mut first_line = Vec::new();
        let mut last_resort = Vec::new();
        for (i, h) in health.iter().enumerate() {
            let probation_over = h
                .last_error_at_ms
                .map(|t| now - t >= self.unhealthy_duration_ms)
                .unwrap_or(true);
            if h.healthy || probation_over {
                first_line.push(i);
            } else {
                last_resort.push(i);
            }
        }
        first_line.extend(last_resort);
        first_line
    }

    fn record_success(&self, index: usize) {
        let mut health = self.health.lock();
        let h = &mut health[index];
        if !h.healthy {
            tracing::info!(provider = %h.name, "✅ Provider recovered");
        }
        h.healthy = true;
        h.consecutive_failures = 0;
        h.last_error_at_ms = None;
    }

    fn record_failure(&self, index: usize, err: &ProviderError) {
        if !err.counts_against_health() {
            return;
        }
        let mut health = self.health.lock();
        let h = &mut health[index];
        h.healthy = false;
        h.consecutive_failures += 1;
        h.last_error_at_ms = Some(self.clock.now_ms());
        tracing::warn!(
            provider = %h.name,
            failures = h.consecutive_failures,
            error = %err,
            "Provider marked unhealthy"
        );
    }

    /// Ask every configured provider for a transaction, ignoring health
    /// state. Used by the confirmation tracker as its secondary
    /// verification probe before counting a real not-found.
    pub async fn probe_transaction(&self, txid: &str) -> Option<ChainTransaction> {
        for provider in &self.providers {
            if let Ok(tx) = provider.get_transaction(txid).await {
                return Some(tx);
            }
        }
        None
    }
}

#[async_trait]
impl ChainProvider for FailoverChain {
    fn name(&self) -> &str {
        "failover"
    }

    async fn get_balance(&self, address: &str) -> Result<AddressBalance, ProviderError> {
        failover_call!(self, "get_balance", |p| p.get_balance(address).await)
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError> {
        failover_call!(self, "get_utxos", |p| p.get_utxos(address).await)
    }

    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction, ProviderError> {
        failover_call!(self, "get_transaction", |p| p.get_transaction(txid).await)
    }

    async fn get_transactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<ChainTransaction>, ProviderError> {
        failover_call!(self, "get_transactions", |p| p
            .get_transactions(address, limit)
            .await)
    }

    async fn broadcast_tx(&self, raw_hex: &str) -> Result<String, ProviderError> {
        let result = failover_call!(self, "broadcast_tx", |p| p.broadcast_tx(raw_hex).await);

        if let Err(err) = &result {
            if err.is_retriable_elsewhere() {
                if let Some(last_resort) = &self.last_resort {
                    tracing::warn!(%err, "Standard providers exhausted, trying last-resort broadcaster");
                    if let Ok(txid) = last_resort.broadcast_tx(raw_hex).await {
                        return Ok(txid);
                    }
                }
            }
        }
        result
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError> {
        failover_call!(self, "get_network_info", |p| p.get_network_info().await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chain::mock::MockProvider;
    use crate::clock::ManualClock;
    use chrono::{TimeZone, Utc};

    fn clock() -> (ManualClock, SharedClock) {
        let c = ManualClock::new(Utc.with_ymd_and_hms(2026, 5, 1, 0, 0, 0).unwrap());
        let shared: SharedClock = Arc::new(c.clone());
        (c, shared)
    }

    #[tokio::test]
    async fn falls_over_to_second_provider() {
        let (_, shared) = clock();
        let a = Arc::new(MockProvider::named("a"));
        let b = Arc::new(MockProvider::named("b"));
        a.fail_all_with(ProviderErrorKind::Transient);
        b.set_balance(700, 0);

        let chain = FailoverChain::new(vec![a.clone() as Arc<dyn ChainProvider>, b.clone()], shared);
        let balance = chain.get_balance("DAddr").await.unwrap();
        assert_eq!(balance.confirmed, 700);

        let health = chain.health_snapshot();
        assert!(!health[0].healthy);
        assert!(health[1].healthy);
    }

    #[tokio::test]
    async fn unhealthy_provider_is_demoted_then_retried_after_probation() {
        let (manual, shared) = clock();
        let a = Arc::new(MockProvider::named("a"));
        let b = Arc::new(MockProvider::named("b"));
        a.fail_all_with(ProviderErrorKind::Transient);
        b.set_balance(1, 0);

        let chain = FailoverChain::new(vec![a.clone() as Arc<dyn ChainProvider>, b.clone()], shared);
        chain.get_balance("DAddr").await.unwrap();
        assert_eq!(a.calls("get_balance"), 1);

        // while unhealthy, a is tried last, so b alone serves the call
        chain.get_balance("DAddr").await.unwrap();
        assert_eq!(a.calls("get_balance"), 1);

        // after probation the first provider gets a fresh first-line try
        manual.advance_ms(UNHEALTHY_DURATION_MS + 1);
        a.heal();
        a.set_balance(9, 0);
        let balance = chain.get_balance("DAddr").await.unwrap();
        assert_eq!(balance.confirmed, 9);
        assert!(chain.health_snapshot()[0].healthy);
    }

    #[tokio::test]
    async fn definitive_errors_do_not_fail_over() {
        let (_, shared) = clock();
        let a = Arc::new(MockProvider::named("a"));
        let b = Arc::new(MockProvider::named("b"));
        a.fail_broadcast_with(ProviderErrorKind::DoubleSpend);

        let chain = FailoverChain::new(vec![a.clone() as Arc<dyn ChainProvider>, b.clone()], shared);
        let err = chain.broadcast_tx("00").await.unwrap_err();
        assert_eq!(err.kind, ProviderErrorKind::DoubleSpend);
        assert_eq!(b.calls("broadcast_tx"), 0);
        // a double-spend answer is an answer, not provider trouble
        assert!(chain.health_snapshot()[0].healthy);
    }

    #[tokio::test]
    async fn broadcast_uses_last_resort_after_all_fail() {
        let (_, shared) = clock();
        let a = Arc::new(MockProvider::named("a"));
        let last = Arc::new(MockProvider::named("blockchair"));
        a.fail_broadcast_with(ProviderErrorKind::Transient);
        last.set_broadcast_txid("feed");

        let chain = FailoverChain::new(vec![a.clone() as Arc<dyn ChainProvider>], shared).with_last_resort(last.clone());
        let txid = chain.broadcast_tx("00").await.unwrap();
        assert_eq!(txid, "feed");
        assert_eq!(last.calls("broadcast_tx"), 1);
    }

    #[tokio::test]
    async fn aggregated_error_lists_tried_providers() {
        let (_, shared) = clock();
        let a = Arc::new(MockProvider::named("a"));
        let b = Arc::new(MockProvider::named("b"));
        a.fail_all_with(ProviderErrorKind::Transient);
        b.fail_all_with(ProviderErrorKind::RateLimited);

        let chain = FailoverChain::new(vec![a as Arc<dyn ChainProvider>, b], shared);
        let err = chain.get_utxos("DAddr").await.unwrap_err();
        assert!(err.message.contains("\"a\""));
        assert!(err.message.contains("\"b\""));
        assert_eq!(err.kind, ProviderErrorKind::RateLimited);
    }
}
