//! Component wiring and the high-level wallet operations.
//!
//! `WalletContext` owns every core component and is the only place that
//! knows how they connect. The send path lives here: sanitize → keystore
//! gate → policy → auto-execute or queue. Components never call back into
//! the context; cross-component effects flow through injected references
//! and the event bus.

use std::path::PathBuf;
use std::sync::Arc;
use subtle::ConstantTimeEq;

use crate::alert::AlertStore;
use crate::approvals::{ApprovalQueue, ApprovalRequest, PendingApproval, SYSTEM_AUTO};
use crate::audit::{AuditAction, AuditLog};
use crate::chain::blockchair::BlockchairPush;
use crate::chain::blockcypher::BlockCypher;
use crate::chain::sochain::SoChain;
use crate::chain::{ChainProvider, FailoverChain};
use crate::clock::SharedClock;
use crate::config::Config;
use crate::error::WalletError;
use crate::events::{EventBus, WalletEvent};
use crate::invoice::{CreateInvoiceOptions, Invoice, InvoiceEngine, VerificationResult};
use crate::keystore::{InitResult, Keystore};
use crate::network_type::NetworkType;
use crate::pipeline::{SendResult, TxPipeline};
use crate::policy::{FreezeFlag, PolicyAction, PolicyEngine, SpendTracker};
use crate::price::PriceFetcher;
use crate::receive::ReceiveMonitor;
use crate::secure_fs;
use crate::security::{self, RateLimiter};
use crate::tracker::TxTracker;
use crate::types::Initiator;
use crate::units;
use crate::utxo_store::{Balance, UtxoStore};

/// What became of a send request.
#[derive(Debug)]
pub enum SendOutcome {
    /// Policy allowed it; broadcast happened.
    Sent(SendResult),
    /// Queued for owner decision or delay.
    Queued(PendingApproval),
}

pub struct WalletContext {
    pub config: Config,
    pub network: NetworkType,
    pub data_dir: PathBuf,
    pub clock: SharedClock,
    pub events: EventBus,
    pub keystore: Arc<Keystore>,
    pub chain: Arc<FailoverChain>,
    pub utxo_store: Arc<UtxoStore>,
    pub audit: Arc<AuditLog>,
    pub tracker: Arc<TxTracker>,
    pub policy: Arc<PolicyEngine>,
    pub freeze: Arc<FreezeFlag>,
    pub spend_tracker: Arc<SpendTracker>,
    pub approvals: Arc<ApprovalQueue>,
    pub rate_limiter: Arc<RateLimiter>,
    pub receive_monitor: Arc<ReceiveMonitor>,
    pub invoices: Arc<InvoiceEngine>,
    pub pipeline: Arc<TxPipeline>,
    pub price: Arc<PriceFetcher>,
    pub alerts: Arc<AlertStore>,
    owner_ids: Vec<String>,
}

impl WalletContext {
    /// Build with providers selected from configuration.
    pub fn build(config: Config, clock: SharedClock) -> Result<Arc<Self>, WalletError> {
        let network = config.network_type()?;
        let mut providers: Vec<Arc<dyn ChainProvider>> =
            vec![Self::make_provider(&config, &config.api.primary, network)?];
        if config.api.fallback.to_lowercase() != "none" {
            providers.push(Self::make_provider(&config, &config.api.fallback, network)?);
        }
        let chain = FailoverChain::new(providers, clock.clone())
            .with_last_resort(Arc::new(BlockchairPush::new()));
        Self::build_with_chain(config, clock, Arc::new(chain))
    }

    fn make_provider(
        config: &Config,
        name: &str,
        network: NetworkType,
    ) -> Result<Arc<dyn ChainProvider>, WalletError> {
        match name.to_lowercase().as_str() {
            "blockcypher" => Ok(Arc::new(BlockCypher::new(
                network,
                Some(config.api.blockcypher.api_token.clone()),
            ))),
            "sochain" => Ok(Arc::new(SoChain::new(
                network,
                Some(config.api.sochain.api_key.clone()),
            ))),
            other => Err(WalletError::Config(format!("unknown provider `{other}`"))),
        }
    }

    /// Build over an existing failover chain (tests inject mocks here).
    pub fn build_with_chain(
        config: Config,
        clock: SharedClock,
        chain: Arc<FailoverChain>,
    ) -> Result<Arc<Self>, WalletError> {
        config.validate()?;
        let network = config.network_type()?;
        let data_dir = config.resolved_data_dir()?;

        // owned directory tree, 0700 throughout
        secure_fs::ensure_dir(&data_dir)?;
        let keys_dir = data_dir.join("keys");
        let utxo_dir = data_dir.join("utxo");
        let audit_dir = data_dir.join("audit");
        for dir in [&keys_dir, &utxo_dir, &audit_dir] {
            secure_fs::ensure_dir(dir)?;
        }

        let events = EventBus::new();
        let keystore = Arc::new(Keystore::new(&keys_dir, network, clock.clone()));
        keystore.set_auto_lock_ms(config.keystore.auto_lock_ms);

        let utxo_store = Arc::new(UtxoStore::new(
            chain.clone(),
            &utxo_dir,
            config.utxo.dust_threshold,
            clock.clone(),
        ));
        let audit = Arc::new(AuditLog::new(&audit_dir, clock.clone()));
        let tracker = Arc::new(TxTracker::new(
            chain.clone(),
            utxo_store.clone(),
            events.clone(),
            &data_dir,
            clock.clone(),
        ));
        let spend_tracker = Arc::new(SpendTracker::new(&data_dir, clock.clone()));
        let freeze = Arc::new(FreezeFlag::new(&data_dir, clock.clone()));
        let policy = Arc::new(PolicyEngine::new(
            config.policy_rules()?,
            spend_tracker.clone(),
            freeze.clone(),
            clock.clone(),
        ));
        let owner_ids = config.notifications.owner_identities();
        let approvals = Arc::new(ApprovalQueue::new(
            &data_dir,
            owner_ids.clone(),
            clock.clone(),
        ));
        let rate_limiter = Arc::new(RateLimiter::new(&data_dir, clock.clone()));
        let receive_monitor = Arc::new(ReceiveMonitor::new(
            chain.clone(),
            audit.clone(),
            events.clone(),
            &data_dir,
            clock.clone(),
        ));
        let invoices = Arc::new(InvoiceEngine::new(
            chain.clone(),
            audit.clone(),
            events.clone(),
            &data_dir,
            clock.clone(),
            network,
            config.a2a.payee_name.clone(),
            String::new(),
            if config.a2a.operator.is_empty() {
                None
            } else {
                Some(config.a2a.operator.clone())
            },
        ));
        let pipeline = Arc::new(TxPipeline::new(
            keystore.clone(),
            utxo_store.clone(),
            chain.clone(),
            tracker.clone(),
            policy.clone(),
            audit.clone(),
            events.clone(),
            network,
            config.fee_policy()?,
            config.utxo.min_confirmations,
            clock.clone(),
        ));
        let price = Arc::new(PriceFetcher::new(
            config.api.price_api.base_url.clone(),
            config.api.price_api.cache_ttl_seconds,
            clock.clone(),
        ));
        let alerts = Arc::new(AlertStore::new(&data_dir, clock.clone()));

        Ok(Arc::new(Self {
            network,
            data_dir,
            clock,
            events,
            keystore,
            chain,
            utxo_store,
            audit,
            tracker,
            policy,
            freeze,
            spend_tracker,
            approvals,
            rate_limiter,
            receive_monitor,
            invoices,
            pipeline,
            price,
            alerts,
            owner_ids,
            config,
        }))
    }

    /// Load every component's persisted state. Called once at startup,
    /// before any timer runs.
    pub fn load_persistence(&self) -> Result<(), WalletError> {
        self.utxo_store.load()?;
        self.audit.load()?;
        self.tracker.load()?;
        self.spend_tracker.load()?;
        self.freeze.load(self.config.policy.freeze)?;
        self.approvals.load()?;
        self.rate_limiter.load()?;
        self.receive_monitor.load()?;
        self.invoices.load()?;
        self.alerts.load()?;
        if self.keystore.is_initialized() {
            let address = self.keystore.get_address()?;
            self.invoices.set_payee_address(&address);
        }
        Ok(())
    }

    // ── Key lifecycle ────────────────────────────────────────────────────

    pub fn init_wallet(&self, passphrase: &str) -> Result<InitResult, WalletError> {
        let result = self.keystore.init(passphrase)?;
        self.invoices.set_payee_address(&result.address);
        let mut entry = self.audit.entry(
            AuditAction::AddressGenerated,
            "wallet initialized",
            Initiator::Owner,
        );
        entry.address = Some(result.address.clone());
        self.audit.record(entry)?;
        Ok(result)
    }

    pub fn recover_wallet(&self, mnemonic: &str, passphrase: &str) -> Result<String, WalletError> {
        let address = self.keystore.recover(mnemonic, passphrase)?;
        self.invoices.set_payee_address(&address);
        let mut entry = self.audit.entry(
            AuditAction::AddressGenerated,
            "wallet recovered from mnemonic",
            Initiator::Owner,
        );
        entry.address = Some(address.clone());
        self.audit.record(entry)?;
        Ok(address)
    }

    pub fn unlock(&self, passphrase: &str) -> Result<(), WalletError> {
        let decision = self.rate_limiter.consume("unlock", None);
        if !decision.allowed {
            return Err(WalletError::RateLimited {
                reset_in_ms: decision.reset_in_ms,
            });
        }
        self.keystore.unlock(passphrase)
    }

    pub fn lock(&self) {
        self.keystore.lock();
    }

    // ── Send path ────────────────────────────────────────────────────────

    /// The full request flow for an outbound payment.
    pub async fn request_send(
        &self,
        to: &str,
        amount_doge: f64,
        reason: &str,
        initiated_by: Initiator,
    ) -> Result<SendOutcome, WalletError> {
        let decision = self.rate_limiter.consume("send", None);
        if !decision.allowed {
            return Err(WalletError::RateLimited {
                reset_in_ms: decision.reset_in_ms,
            });
        }

        let to = security::sanitize_address(to, self.network)
            .map_err(|e| WalletError::Validation(e.to_string()))?;
        let reason = security::sanitize_description(reason)
            .map_err(|e| WalletError::Validation(e.to_string()))?;
        let amount = security::sanitize_amount(amount_doge, units::MAX_DOGE)
            .map_err(|e| WalletError::Validation(e.to_string()))?;

        if !self.keystore.is_unlocked() {
            return Err(WalletError::WalletLocked);
        }

        let decision = self.policy.evaluate(amount.koinu, &to, &reason);
        let mut entry = self
            .audit
            .entry(AuditAction::PolicyCheck, &decision.reason, initiated_by);
        entry.amount = Some(amount.koinu);
        entry.address = Some(to.clone());
        entry.tier = decision.tier.map(|t| t.to_string());
        if let Some(quote) = self.price.cached() {
            entry.metadata = Some(serde_json::json!({
                "usdPerDoge": quote.usd_per_doge,
                "amountUsd": amount.doge * quote.usd_per_doge,
            }));
        }
        self.audit.record(entry)?;

        if decision.allowed {
            let result = self
                .pipeline
                .execute_send(&to, amount.koinu, &reason, decision.tier, initiated_by)
                .await?;
            // the wallet's own transaction must not look like an inbound
            // payment when the receive monitor sees its change output
            self.receive_monitor.suppress(&result.txid);
            return Ok(SendOutcome::Sent(result));
        }

        if decision.action == PolicyAction::Deny {
            return Err(WalletError::PolicyDenied(decision.reason));
        }

        let pending = self.approvals.queue_for_approval(ApprovalRequest {
            to: to.clone(),
            amount: amount.koinu,
            amount_doge: amount.doge,
            tier: decision.tier,
            action: decision.action,
            reason: reason.clone(),
            delay_minutes: decision.delay_minutes,
        })?;
        self.events.publish(WalletEvent::ApprovalPending {
            approval_id: pending.id.clone(),
            to,
            amount: amount.koinu,
            action: format!("{:?}", decision.action).to_lowercase(),
        });
        Ok(SendOutcome::Queued(pending))
    }

    /// Owner decision on a queued send. Approval executes it immediately.
    pub async fn resolve_approval(
        &self,
        id: &str,
        caller: &str,
        approve: bool,
    ) -> Result<Option<SendResult>, WalletError> {
        let decision = self.rate_limiter.consume("approve", Some(caller));
        if !decision.allowed {
            return Err(WalletError::RateLimited {
                reset_in_ms: decision.reset_in_ms,
            });
        }

        let resolved = if approve {
            self.approvals.approve(id, caller)
        } else {
            self.approvals.deny(id, caller)
        };
        let entry = match &resolved {
            Ok(entry) => entry.clone(),
            Err(WalletError::Unauthorized(_)) => {
                // rejected decisions leave a trace
                let mut audit_entry = self.audit.entry(
                    AuditAction::Error,
                    &format!("unauthorized approval decision on {id}"),
                    Initiator::External,
                );
                audit_entry.metadata = Some(serde_json::json!({ "caller": caller }));
                self.audit.record(audit_entry)?;
                return Err(resolved.unwrap_err());
            }
            Err(_) => return Err(resolved.unwrap_err()),
        };

        let mut audit_entry = self.audit.entry(
            if approve {
                AuditAction::Approve
            } else {
                AuditAction::Deny
            },
            &entry.reason,
            Initiator::Owner,
        );
        audit_entry.amount = Some(entry.amount);
        audit_entry.address = Some(entry.to.clone());
        audit_entry.tier = entry.tier.map(|t| t.to_string());
        self.audit.record(audit_entry)?;

        if !approve {
            return Ok(None);
        }
        let result = self
            .pipeline
            .execute_send(&entry.to, entry.amount, &entry.reason, entry.tier, Initiator::Owner)
            .await?;
        self.receive_monitor.suppress(&result.txid);
        self.approvals.mark_executed(id)?;
        Ok(Some(result))
    }

    /// Execute entries the expiry sweep auto-approved. Called by the
    /// sweeper timer after `approvals.expire()`.
    pub async fn execute_auto_approved(&self, entries: Vec<PendingApproval>) {
        for entry in entries {
            match self
                .pipeline
                .execute_send(
                    &entry.to,
                    entry.amount,
                    &entry.reason,
                    entry.tier,
                    Initiator::System,
                )
                .await
            {
                Ok(result) => {
                    self.receive_monitor.suppress(&result.txid);
                    if let Err(e) = self.approvals.mark_executed(&entry.id) {
                        tracing::warn!(id = %entry.id, error = %e, "Failed to mark approval executed");
                    }
                }
                Err(e) => {
                    tracing::error!(id = %entry.id, error = %e, "Auto-approved send failed");
                    let mut audit_entry = self.audit.entry(
                        AuditAction::Error,
                        &security::redact_error(&e.to_string()),
                        Initiator::System,
                    );
                    audit_entry.address = Some(entry.to.clone());
                    audit_entry.amount = Some(entry.amount);
                    let _ = self.audit.record(audit_entry);
                }
            }
        }
    }

    // ── Freeze ───────────────────────────────────────────────────────────

    fn require_owner(&self, caller: &str) -> Result<(), WalletError> {
        let authorized = caller.as_bytes().ct_eq(SYSTEM_AUTO.as_bytes()).unwrap_u8() == 1
            || self
                .owner_ids
                .iter()
                .any(|owner| caller.as_bytes().ct_eq(owner.as_bytes()).unwrap_u8() == 1);
        if authorized {
            Ok(())
        } else {
            Err(WalletError::Unauthorized(format!(
                "operation requires owner identity, got `{caller}`"
            )))
        }
    }

    pub fn freeze_wallet(&self, caller: &str, reason: Option<String>) -> Result<(), WalletError> {
        self.require_owner(caller)?;
        self.freeze.set_frozen(true, reason.clone());
        let entry = self.audit.entry(
            AuditAction::Freeze,
            reason.as_deref().unwrap_or("owner freeze"),
            Initiator::Owner,
        );
        self.audit.record(entry)?;
        Ok(())
    }

    pub fn unfreeze_wallet(&self, caller: &str) -> Result<(), WalletError> {
        self.require_owner(caller)?;
        self.freeze.set_frozen(false, None);
        let entry = self
            .audit
            .entry(AuditAction::Unfreeze, "owner unfreeze", Initiator::Owner);
        self.audit.record(entry)?;
        Ok(())
    }

    // ── A2A invoices ─────────────────────────────────────────────────────

    pub fn create_invoice(
        &self,
        amount_doge: f64,
        description: &str,
        options: CreateInvoiceOptions,
        subject: Option<&str>,
    ) -> Result<Invoice, WalletError> {
        let decision = self.rate_limiter.consume("invoice_create", subject);
        if !decision.allowed {
            return Err(WalletError::RateLimited {
                reset_in_ms: decision.reset_in_ms,
            });
        }
        self.invoices.create_invoice(amount_doge, description, options)
    }

    pub async fn verify_invoice_payment(
        &self,
        invoice_id: &str,
        txid: &str,
        claimed_amount_doge: f64,
        subject: Option<&str>,
    ) -> Result<VerificationResult, WalletError> {
        let decision = self.rate_limiter.consume("verify_payment", subject);
        if !decision.allowed {
            return Err(WalletError::RateLimited {
                reset_in_ms: decision.reset_in_ms,
            });
        }
        self.invoices
            .verify_payment(invoice_id, txid, claimed_amount_doge)
            .await
    }

    // ── Queries ──────────────────────────────────────────────────────────

    pub fn balance(&self) -> Balance {
        self.utxo_store.get_balance()
    }

    pub async fn refresh_utxos(&self) -> Result<Balance, WalletError> {
        let address = self.keystore.get_address()?;
        self.utxo_store.refresh(&address).await
    }

    // ── Startup ──────────────────────────────────────────────────────────

    /// Startup validation. Permission problems are fatal; provider
    /// reachability is reported but tolerated.
    pub async fn preflight(&self) -> Result<(), WalletError> {
        let mut notes: Vec<String> = Vec::new();

        if !secure_fs::check_dir_permissions(&self.data_dir)? {
            return Err(WalletError::Config(format!(
                "data directory {} is not owner-only",
                self.data_dir.display()
            )));
        }

        if self.keystore.is_initialized() {
            match self.keystore.get_address() {
                Ok(address) => notes.push(format!("keystore ok ({address})")),
                Err(e) => {
                    return Err(WalletError::Config(format!(
                        "keystore unreadable: {}",
                        security::redact_error(&e.to_string())
                    )))
                }
            }
        } else {
            notes.push("keystore not initialized".to_string());
        }

        match self.chain.get_network_info().await {
            Ok(info) => notes.push(format!("chain reachable, height {}", info.height)),
            Err(e) => notes.push(format!(
                "chain unreachable: {}",
                security::redact_error(&e.to_string())
            )),
        }

        let entry = self.audit.entry(
            AuditAction::PreflightCheck,
            &notes.join("; "),
            Initiator::System,
        );
        self.audit.record(entry)?;
        tracing::info!(checks = %notes.join("; "), "Preflight complete");
        Ok(())
    }
}
