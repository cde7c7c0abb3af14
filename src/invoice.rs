//! Agent-to-agent invoice engine.
//!
//! Issues invoices, verifies their settlement on-chain, and guarantees a
//! single `pending → paid` transition per invoice. Verification holds a
//! per-invoice mutex across the chain lookup on purpose: concurrent
//! `verify_payment` calls for the same invoice serialize, so double
//! settlement is impossible by construction.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use uuid::Uuid;

use crate::audit::{AuditAction, AuditLog};
use crate::chain::ChainProvider;
use crate::clock::SharedClock;
use crate::error::WalletError;
use crate::events::{EventBus, WalletEvent};
use crate::network_type::NetworkType;
use crate::script::parse_op_return;
use crate::secure_fs;
use crate::security;
use crate::types::Initiator;
use crate::units;

pub const INVOICES_FILE: &str = "invoices.json";

/// OP_RETURN marker prefix: `"OC:" || invoiceId` (3 + 36 bytes).
pub const OP_RETURN_PREFIX: &str = "OC:";

const DEFAULT_EXPIRY_MS: i64 = 3_600_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Pending,
    Paid,
    Expired,
    Cancelled,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoicePayee {
    pub name: String,
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoicePayment {
    pub amount_doge: f64,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reference: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceCallback {
    pub url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Invoice {
    pub invoice_id: String,
    pub created_at: String,
    pub expires_at: String,
    pub status: InvoiceStatus,
    pub payee: InvoicePayee,
    pub payment: InvoicePayment,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback: Option<InvoiceCallback>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub txid: Option<String>,
}

#[derive(Default)]
pub struct CreateInvoiceOptions {
    pub reference: Option<String>,
    pub expiry_ms: Option<i64>,
    pub callback_url: Option<String>,
    pub callback_token: Option<String>,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationResult {
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub confirmations: u32,
    pub amount_received: u64,
    pub amount_expected: u64,
    pub op_return_match: bool,
}

impl VerificationResult {
    fn invalid(reason: &str) -> Self {
        Self {
            valid: false,
            reason: Some(reason.to_string()),
            confirmations: 0,
            amount_received: 0,
            amount_expected: 0,
            op_return_match: false,
        }
    }
}

#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct InvoicesFile {
    version: u32,
    invoices: HashMap<String, Invoice>,
    last_updated: Option<String>,
}

pub struct InvoiceEngine {
    provider: Arc<dyn ChainProvider>,
    audit: Arc<AuditLog>,
    events: EventBus,
    path: PathBuf,
    clock: SharedClock,
    network: NetworkType,
    payee_name: String,
    /// Set once the keystore knows its address; empty until then.
    payee_address: Mutex<String>,
    payee_operator: Option<String>,
    /// Underpayment tolerance in koinu; 0 disables (the default).
    underpay_tolerance: u64,
    invoices: Mutex<HashMap<String, Invoice>>,
    /// Per-invoice settlement locks.
    settle_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
    http: reqwest::Client,
}

impl InvoiceEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        provider: Arc<dyn ChainProvider>,
        audit: Arc<AuditLog>,
        events: EventBus,
        data_dir: &std::path::Path,
        clock: SharedClock,
        network: NetworkType,
        payee_name: String,
        payee_address: String,
        payee_operator: Option<String>,
    ) -> Self {
        Self {
            provider,
            audit,
            events,
            path: data_dir.join(INVOICES_FILE),
            clock,
            network,
            payee_name,
            payee_address: Mutex::new(payee_address),
            payee_operator,
            underpay_tolerance: 0,
            invoices: Mutex::new(HashMap::new()),
            settle_locks: DashMap::new(),
            http: reqwest::Client::builder()
                .timeout(std::time::Duration::from_secs(15))
                .build()
                .expect("reqwest client"),
        }
    }

    pub fn load(&self) -> Result<(), WalletError> {
        if let Some(file) = secure_fs::read_json::<InvoicesFile>(&self.path)? {
            *self.invoices.lock() = file.invoices;
        }
        Ok(())
    }

    /// Bind the receiving address once the keystore knows it.
    pub fn set_payee_address(&self, address: &str) {
        *self.payee_address.lock() = address.to_string();
    }

    pub fn create_invoice(
        &self,
        amount_doge: f64,
        description: &str,
        options: CreateInvoiceOptions,
    ) -> Result<Invoice, WalletError> {
        let amount = security::sanitize_amount(amount_doge, units::MAX_DOGE)
            .map_err(|e| WalletError::Validation(e.to_string()))?;
        let description = security::sanitize_description(description)
            .map_err(|e| WalletError::Validation(e.to_string()))?;
        let reference = options
            .reference
            .as_deref()
            .map(security::sanitize_reference)
            .transpose()
            .map_err(|e| WalletError::Validation(e.to_string()))?;
        let callback = options
            .callback_url
            .as_deref()
            .map(|url| {
                security::check_callback_url(url).map(|url| InvoiceCallback {
                    url,
                    token: options.callback_token.clone(),
                })
            })
            .transpose()
            .map_err(|e| WalletError::Validation(e.to_string()))?;

        let payee_address = self.payee_address.lock().clone();
        if payee_address.is_empty() {
            return Err(WalletError::NotInitialized);
        }

        let now = self.clock.now();
        let expiry_ms = options.expiry_ms.unwrap_or(DEFAULT_EXPIRY_MS).max(1);
        let invoice = Invoice {
            invoice_id: Uuid::new_v4().to_string(),
            created_at: now.to_rfc3339(),
            expires_at: (now + chrono::Duration::milliseconds(expiry_ms)).to_rfc3339(),
            status: InvoiceStatus::Pending,
            payee: InvoicePayee {
                name: self.payee_name.clone(),
                address: payee_address.clone(),
                operator: self.payee_operator.clone(),
            },
            payment: InvoicePayment {
                amount_doge: amount.doge,
                description,
                reference,
            },
            callback,
            metadata: options.metadata,
            paid_at: None,
            txid: None,
        };

        self.invoices
            .lock()
            .insert(invoice.invoice_id.clone(), invoice.clone());
        self.persist()?;

        let mut entry = self.audit.entry(
            AuditAction::InvoiceCreated,
            &invoice.payment.description,
            Initiator::Agent,
        );
        entry.amount = Some(amount.koinu);
        entry.address = Some(payee_address);
        entry.metadata = Some(serde_json::json!({ "invoiceId": invoice.invoice_id }));
        self.audit.record(entry)?;

        tracing::info!(
            invoice_id = %invoice.invoice_id,
            amount_doge = amount.doge,
            "🧾 Invoice created"
        );
        Ok(invoice)
    }

    /// Verify that `txid` settles `invoice_id` on-chain: pays the invoice
    /// address at least the expected amount, carries the OP_RETURN marker
    /// `"OC:" || invoiceId`, and has enough confirmations for the network.
    pub async fn verify_payment(
        &self,
        invoice_id: &str,
        txid: &str,
        _claimed_amount_doge: f64,
    ) -> Result<VerificationResult, WalletError> {
        // per-invoice mutex held across the chain lookup: single settlement
        let lock = self
            .settle_locks
            .entry(invoice_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        enum Gate {
            NotFound,
            NotPending,
            Expired,
            Open { expected: u64, address: String },
        }

        let gate = {
            let invoices = self.invoices.lock();
            match invoices.get(invoice_id) {
                None => Gate::NotFound,
                // replay guard: anything but pending refuses re-verification
                Some(invoice) if invoice.status != InvoiceStatus::Pending => Gate::NotPending,
                Some(invoice) => {
                    let expired = chrono::DateTime::parse_from_rfc3339(&invoice.expires_at)
                        .map(|t| self.clock.now() >= t)
                        .unwrap_or(false);
                    if expired {
                        Gate::Expired
                    } else {
                        Gate::Open {
                            expected: units::doge_to_koinu(invoice.payment.amount_doge)
                                .unwrap_or(u64::MAX),
                            address: invoice.payee.address.clone(),
                        }
                    }
                }
            }
        };

        let (expected, address) = match gate {
            Gate::NotFound => return Ok(VerificationResult::invalid("INVOICE_NOT_FOUND")),
            Gate::NotPending => return Ok(VerificationResult::invalid("INVOICE_NOT_PENDING")),
            Gate::Expired => {
                self.transition(invoice_id, InvoiceStatus::Expired, None)?;
                return Ok(VerificationResult::invalid("INVOICE_EXPIRED"));
            }
            Gate::Open { expected, address } => (expected, address),
        };

        let chain_tx = match self.provider.get_transaction(txid).await {
            Ok(tx) => tx,
            Err(err) => {
                tracing::debug!(%err, txid, "Verification lookup failed");
                let mut result = VerificationResult::invalid("TX_NOT_FOUND");
                result.amount_expected = expected;
                return Ok(result);
            }
        };

        let amount_received: u64 = chain_tx
            .outputs
            .iter()
            .filter(|o| o.address.as_deref() == Some(address.as_str()))
            .map(|o| o.value)
            .sum();

        let marker = format!("{OP_RETURN_PREFIX}{invoice_id}");
        let op_return_match = chain_tx.outputs.iter().any(|o| {
            hex::decode(&o.script_pubkey)
                .ok()
                .and_then(|script| parse_op_return(&script).map(|data| data == marker.as_bytes()))
                .unwrap_or(false)
        });

        let min_confirmations = self.network.min_confirmations();
        let mut result = VerificationResult {
            valid: false,
            reason: None,
            confirmations: chain_tx.confirmations,
            amount_received,
            amount_expected: expected,
            op_return_match,
        };

        if amount_received + self.underpay_tolerance < expected {
            result.reason = Some("AMOUNT_MISMATCH".to_string());
            return Ok(result);
        }
        if !op_return_match {
            result.reason = Some("OP_RETURN_MISMATCH".to_string());
            return Ok(result);
        }
        if chain_tx.confirmations < min_confirmations {
            result.reason = Some("INSUFFICIENT_CONFIRMATIONS".to_string());
            return Ok(result);
        }

        result.valid = true;
        self.mark_invoice_paid(invoice_id, txid)?;
        Ok(result)
    }

    fn mark_invoice_paid(&self, invoice_id: &str, txid: &str) -> Result<(), WalletError> {
        self.transition(invoice_id, InvoiceStatus::Paid, Some(txid))?;

        let invoice = self.get_invoice(invoice_id);
        let mut entry = self
            .audit
            .entry(AuditAction::InvoicePaid, "invoice settled", Initiator::External);
        entry.txid = Some(txid.to_string());
        entry.amount = invoice
            .as_ref()
            .and_then(|i| units::doge_to_koinu(i.payment.amount_doge));
        entry.metadata = Some(serde_json::json!({ "invoiceId": invoice_id }));
        self.audit.record(entry)?;

        // paid state is observable (and audited) before the callback fires
        self.events.publish(WalletEvent::InvoicePaid {
            invoice_id: invoice_id.to_string(),
            txid: txid.to_string(),
        });
        if let Some(invoice) = invoice {
            if let Some(callback) = invoice.callback.clone() {
                self.dispatch_callback(invoice, callback);
            }
        }
        tracing::info!(invoice_id, txid, "💰 Invoice paid");
        Ok(())
    }

    /// Best-effort, fire-once callback. The paid transition already
    /// happened; delivery failure only logs.
    fn dispatch_callback(&self, invoice: Invoice, callback: InvoiceCallback) {
        // re-validate at dispatch time in case the stored URL predates a
        // blocklist change
        if security::check_callback_url(&callback.url).is_err() {
            tracing::warn!(invoice_id = %invoice.invoice_id, "Stored callback URL no longer passes checks");
            return;
        }
        let http = self.http.clone();
        let body = serde_json::json!({
            "invoiceId": invoice.invoice_id,
            "txid": invoice.txid,
            "status": "paid",
            "amountDoge": invoice.payment.amount_doge,
            "reference": invoice.payment.reference,
        });
        tokio::spawn(async move {
            let mut request = http.post(&callback.url).json(&body);
            if let Some(token) = &callback.token {
                request = request.bearer_auth(token);
            }
            match request.send().await {
                Ok(resp) if resp.status().is_success() => {
                    tracing::debug!(invoice_id = %invoice.invoice_id, "Callback delivered");
                }
                Ok(resp) => {
                    tracing::warn!(invoice_id = %invoice.invoice_id, status = %resp.status(), "Callback rejected");
                }
                Err(err) => {
                    tracing::warn!(invoice_id = %invoice.invoice_id, %err, "Callback failed");
                }
            }
        });
    }

    pub fn cancel_invoice(&self, invoice_id: &str) -> Result<(), WalletError> {
        self.transition(invoice_id, InvoiceStatus::Cancelled, None)
    }

    /// Periodic sweep: pending invoices past expiry transition to expired.
    pub fn cleanup_expired(&self) -> usize {
        let now = self.clock.now();
        let expired: Vec<String> = {
            let invoices = self.invoices.lock();
            invoices
                .values()
                .filter(|i| i.status == InvoiceStatus::Pending)
                .filter(|i| {
                    chrono::DateTime::parse_from_rfc3339(&i.expires_at)
                        .map(|t| now >= t)
                        .unwrap_or(false)
                })
                .map(|i| i.invoice_id.clone())
                .collect()
        };
        for id in &expired {
            if let Err(e) = self.transition(id, InvoiceStatus::Expired, None) {
                tracing::warn!(invoice_id = %id, error = %e, "Failed to expire invoice");
            }
        }
        if !expired.is_empty() {
            tracing::info!(count = expired.len(), "Expired pending invoices");
        }
        expired.len()
    }

    /// Single point for state transitions; only `pending` may leave.
    fn transition(
        &self,
        invoice_id: &str,
        to: InvoiceStatus,
        txid: Option<&str>,
    ) -> Result<(), WalletError> {
        {
            let mut invoices = self.invoices.lock();
            let invoice = invoices
                .get_mut(invoice_id)
                .ok_or_else(|| WalletError::Validation(format!("no invoice {invoice_id}")))?;
            if invoice.status != InvoiceStatus::Pending {
                return Err(WalletError::Validation(format!(
                    "invoice {invoice_id} is not pending"
                )));
            }
            invoice.status = to;
            if to == InvoiceStatus::Paid {
                invoice.paid_at = Some(self.clock.now().to_rfc3339());
                invoice.txid = txid.map(str::to_string);
            }
        }
        self.persist()
    }

    pub fn get_invoice(&self, invoice_id: &str) -> Option<Invoice> {
        self.invoices.lock().get(invoice_id).cloned()
    }

    pub fn list_invoices(&self) -> Vec<Invoice> {
        self.invoices.lock().values().cloned().collect()
    }

    fn persist(&self) -> Result<(), WalletError> {
        let file = InvoicesFile {
            version: 1,
            invoices: self.invoices.lock().clone(),
            last_updated: Some(self.clock.now().to_rfc3339()),
        };
        secure_fs::write_json(&self.path, &file)?;
        Ok(())
    }
}
