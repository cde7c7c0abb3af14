//! Transaction pipeline: select → build → sign → broadcast → track.
//!
//! Every failure after input selection releases the locks it took; the
//! private-key copy used for signing is erased on success and error paths
//! alike. Broadcast responses equivalent to "already known" count as
//! success, with the txid recomputed locally.

use std::sync::Arc;
use uuid::Uuid;

use crate::address::Address;
use crate::audit::{AuditAction, AuditLog};
use crate::chain::{ChainProvider, FailoverChain, ProviderErrorKind};
use crate::clock::SharedClock;
use crate::error::WalletError;
use crate::events::{EventBus, WalletEvent};
use crate::keystore::Keystore;
use crate::network_type::NetworkType;
use crate::policy::{PolicyEngine, Tier};
use crate::script::p2pkh_script;
use crate::tracker::{TxMetadata, TxTracker};
use crate::tx::{Transaction, TxInput, TxOutput};
use crate::types::{Initiator, Utxo};
use crate::utxo_store::{Selection, UtxoStore};

/// Fee selection strategy over the provider's estimate.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeeStrategy {
    Low,
    Medium,
    High,
}

impl FeeStrategy {
    fn scale(&self, fee_per_kb: u64) -> u64 {
        match self {
            FeeStrategy::Low => fee_per_kb / 2,
            FeeStrategy::Medium => fee_per_kb,
            FeeStrategy::High => fee_per_kb * 2,
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct FeePolicy {
    pub strategy: FeeStrategy,
    /// Hard ceiling, koinu per kB.
    pub max_fee_per_kb: u64,
    /// Used when the provider cannot supply an estimate, koinu per kB.
    pub fallback_fee_per_kb: u64,
}

#[derive(Clone, Debug)]
pub struct SendResult {
    pub txid: String,
    pub amount: u64,
    pub fee: u64,
    pub change: u64,
}

pub struct TxPipeline {
    keystore: Arc<Keystore>,
    utxo_store: Arc<UtxoStore>,
    provider: Arc<FailoverChain>,
    tracker: Arc<TxTracker>,
    policy: Arc<PolicyEngine>,
    audit: Arc<AuditLog>,
    events: EventBus,
    network: NetworkType,
    fees: FeePolicy,
    min_confirmations: u32,
    _clock: SharedClock,
}

impl TxPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        keystore: Arc<Keystore>,
        utxo_store: Arc<UtxoStore>,
        provider: Arc<FailoverChain>,
        tracker: Arc<TxTracker>,
        policy: Arc<PolicyEngine>,
        audit: Arc<AuditLog>,
        events: EventBus,
        network: NetworkType,
        fees: FeePolicy,
        min_confirmations: u32,
        clock: SharedClock,
    ) -> Self {
        Self {
            keystore,
            utxo_store,
            provider,
            tracker,
            policy,
            audit,
            events,
            network,
            fees,
            min_confirmations,
            _clock: clock,
        }
    }

    /// Fee rate in koinu per byte for the next transaction.
    async fn fee_rate(&self) -> u64 {
        let per_kb = match self.provider.get_network_info().await {
            Ok(info) => match info.fee_per_kb {
                Some(estimate) if estimate > 0 => self.fees.strategy.scale(estimate),
                _ => self.fees.fallback_fee_per_kb,
            },
            Err(err) => {
                tracing::debug!(%err, "No fee estimate available, using fallback");
                self.fees.fallback_fee_per_kb
            }
        };
        (per_kb / 1000).max(1)
    }

    /// Execute a policy-cleared send. `tier` is recorded for audit only;
    /// evaluation already happened upstream.
    pub async fn execute_send(
        &self,
        to: &str,
        amount: u64,
        reason: &str,
        tier: Option<Tier>,
        initiated_by: Initiator,
    ) -> Result<SendResult, WalletError> {
        if !self.keystore.is_unlocked() {
            return Err(WalletError::WalletLocked);
        }
        let recipient = Address::from_string_for_network(to, self.network)
            .map_err(|e| WalletError::Validation(e.to_string()))?;
        let own_address_str = self.keystore.get_address()?;
        let own_address = Address::from_string_for_network(&own_address_str, self.network)
            .map_err(|e| WalletError::Validation(e.to_string()))?;

        let fee_rate = self.fee_rate().await;
        let intent = Uuid::new_v4().to_string();
        let selection =
            self.utxo_store
                .select_and_lock(amount, fee_rate, self.min_confirmations, &intent)?;

        // from here on, every early return must release the locks
        let result = self
            .build_sign_broadcast(&recipient, &own_address, amount, &selection)
            .await;

        let (txid, change_vout) = match result {
            Ok(v) => v,
            Err(err) => {
                self.utxo_store.unlock_all_for(&intent);
                return Err(err);
            }
        };

        // broadcast → re-point locks → optimistic change → tracking
        self.utxo_store.mark_spent_by(&intent, &txid);
        if selection.change > 0 {
            self.utxo_store.add_utxo(Utxo {
                txid: txid.clone(),
                vout: change_vout,
                address: own_address_str.clone(),
                amount: selection.change,
                script_pubkey: hex::encode(p2pkh_script(&own_address)),
                confirmations: 0,
                block_height: None,
                locked: false,
                locked_for: None,
                locked_at: None,
            });
        }
        self.policy.record_spend(amount);
        self.tracker.track(
            &txid,
            TxMetadata {
                to: to.to_string(),
                amount,
                fee: selection.fee,
            },
        );

        let mut entry = self.audit.entry(AuditAction::Send, reason, initiated_by);
        entry.txid = Some(txid.clone());
        entry.amount = Some(amount);
        entry.address = Some(to.to_string());
        entry.fee = Some(selection.fee);
        entry.tier = tier.map(|t| t.to_string());
        self.audit.record(entry)?;

        // audit entry precedes the external notification
        self.events.publish(WalletEvent::Sent {
            txid: txid.clone(),
            to: to.to_string(),
            amount,
            fee: selection.fee,
        });

        tracing::info!(
            %txid,
            to,
            amount,
            fee = selection.fee,
            "💸 Send broadcast and tracking"
        );
        Ok(SendResult {
            txid,
            amount,
            fee: selection.fee,
            change: selection.change,
        })
    }

    /// Build outputs `[payment, change?]`, sign every input, enforce the
    /// fee ceiling, broadcast. Returns (txid, change_vout).
    async fn build_sign_broadcast(
        &self,
        recipient: &Address,
        own_address: &Address,
        amount: u64,
        selection: &Selection,
    ) -> Result<(String, u32), WalletError> {
        let mut outputs = vec![TxOutput {
            value: amount,
            script_pubkey: p2pkh_script(recipient),
        }];
        let change_vout = outputs.len() as u32;
        if selection.change > 0 {
            outputs.push(TxOutput {
                value: selection.change,
                script_pubkey: p2pkh_script(own_address),
            });
        }

        let inputs: Vec<TxInput> = selection
            .selected
            .iter()
            .map(|u| TxInput::new(&u.txid, u.vout))
            .collect();
        let mut tx = Transaction::new(inputs, outputs);

        // sign with a private-key copy that is erased on every exit path
        let mut secret = self.keystore.get_private_key()?;
        let own_spk = p2pkh_script(own_address);
        let sign_result = (|| -> Result<(), WalletError> {
            for (i, utxo) in selection.selected.iter().enumerate() {
                let spk = if utxo.script_pubkey.is_empty() {
                    own_spk.clone()
                } else {
                    hex::decode(&utxo.script_pubkey)
                        .map_err(|_| WalletError::Validation("bad cached scriptPubKey".into()))?
                };
                tx.sign_input(i, &spk, &secret)
                    .map_err(|e| WalletError::Validation(e.to_string()))?;
            }
            Ok(())
        })();
        secret.non_secure_erase();
        sign_result?;

        let raw = tx
            .to_hex()
            .map_err(|e| WalletError::Validation(e.to_string()))?;
        let local_txid = tx
            .txid()
            .map_err(|e| WalletError::Validation(e.to_string()))?;

        // fee ceiling: fee ≤ maxFeePerKb × size / 1000
        let size = raw.len() / 2;
        let max_fee = self.fees.max_fee_per_kb.saturating_mul(size as u64) / 1000;
        if selection.fee > max_fee {
            return Err(WalletError::Validation(format!(
                "fee {} koinu exceeds ceiling {} koinu for {} bytes",
                selection.fee, max_fee, size
            )));
        }

        match self.provider.broadcast_tx(&raw).await {
            Ok(txid) => {
                if txid != local_txid {
                    tracing::warn!(
                        provider_txid = %txid,
                        local_txid = %local_txid,
                        "Provider returned unexpected txid; trusting local computation"
                    );
                }
                Ok((local_txid, change_vout))
            }
            Err(err) => match err.kind {
                // the network already has this transaction: success
                ProviderErrorKind::AlreadyKnown => {
                    tracing::info!(txid = %local_txid, "Broadcast reported already-known; treating as success");
                    Ok((local_txid, change_vout))
                }
                ProviderErrorKind::DoubleSpend => Err(WalletError::DoubleSpend(err.message)),
                ProviderErrorKind::FeeTooLow => Err(WalletError::FeeTooLow(err.message)),
                _ => Err(WalletError::BroadcastFailed(err.to_string())),
            },
        }
    }

    /// Sweep spendable outputs back into one self-spend when the set has
    /// grown past `threshold`. Never auto-fired; the operator (or agent,
    /// through policy) invokes it explicitly.
    pub async fn consolidate_utxos(
        &self,
        threshold: usize,
        max_inputs: usize,
    ) -> Result<Option<SendResult>, WalletError> {
        if !self.keystore.is_unlocked() {
            return Err(WalletError::WalletLocked);
        }
        let spendable = self.utxo_store.get_spendable_utxos(self.min_confirmations);
        if spendable.len() <= threshold {
            return Ok(None);
        }

        let own_address_str = self.keystore.get_address()?;
        let own_address = Address::from_string_for_network(&own_address_str, self.network)
            .map_err(|e| WalletError::Validation(e.to_string()))?;

        // smallest outputs first: consolidation exists to sweep fragments
        let mut inputs: Vec<Utxo> = spendable;
        inputs.sort_by_key(|u| u.amount);
        inputs.truncate(max_inputs);

        let total: u64 = inputs.iter().map(|u| u.amount).sum();
        let fee_rate = self.fee_rate().await;
        let fee = fee_rate * crate::tx::estimate_tx_size(inputs.len(), 1) as u64;
        if total <= fee {
            return Err(WalletError::InsufficientFunds {
                needed: fee,
                available: total,
            });
        }

        let intent = Uuid::new_v4().to_string();
        let outpoints: Vec<crate::types::OutPoint> = inputs.iter().map(|u| u.outpoint()).collect();
        self.utxo_store.lock_outpoints(&outpoints, &intent)?;
        let selection = Selection {
            selected: inputs,
            fee,
            change: 0,
            algorithm: crate::utxo_store::SelectionAlgorithm::LargestFirst,
        };
        let result = self
            .consolidate_inner(&own_address, &own_address_str, total - fee, &selection, &intent)
            .await;
        if result.is_err() {
            self.utxo_store.unlock_all_for(&intent);
        }
        result
    }

    async fn consolidate_inner(
        &self,
        own_address: &Address,
        own_address_str: &str,
        output_amount: u64,
        selection: &Selection,
        intent: &str,
    ) -> Result<Option<SendResult>, WalletError> {
        let (txid, _) = self
            .build_sign_broadcast(own_address, own_address, output_amount, selection)
            .await?;
        self.utxo_store.mark_spent_by(intent, &txid);
        self.utxo_store.add_utxo(Utxo {
            txid: txid.clone(),
            vout: 0,
            address: own_address_str.to_string(),
            amount: output_amount,
            script_pubkey: hex::encode(p2pkh_script(own_address)),
            confirmations: 0,
            block_height: None,
            locked: false,
            locked_for: None,
            locked_at: None,
        });
        self.tracker.track(
            &txid,
            TxMetadata {
                to: own_address_str.to_string(),
                amount: output_amount,
                fee: selection.fee,
            },
        );
        tracing::info!(%txid, inputs = selection.selected.len(), "🧹 Consolidated UTXO set");
        Ok(Some(SendResult {
            txid,
            amount: output_amount,
            fee: selection.fee,
            change: 0,
        }))
    }
}
