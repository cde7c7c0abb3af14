//! Chain access: provider contract, HTTP adapters, failover composite.
//!
//! The wallet core sees only the [`ChainProvider`] trait and the tagged
//! [`ProviderErrorKind`] taxonomy. Wire shapes, auth tokens and error-string
//! sniffing are confined to the adapters; responses are validated field by
//! field before anything crosses into the core.

pub mod blockchair;
pub mod blockcypher;
pub mod failover;
pub mod mock;
pub mod sochain;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::types::Utxo;

pub use failover::FailoverChain;

/// Default timeout for every outbound provider call.
pub const HTTP_TIMEOUT_SECS: u64 = 20;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProviderErrorKind {
    /// 429 or an explicit quota message.
    RateLimited,
    /// 5xx, connect failure, timeout. Worth retrying elsewhere.
    Transient,
    /// The resource genuinely does not exist upstream.
    NotFound,
    /// Inputs already spent or conflicting mempool transaction.
    DoubleSpend,
    /// Below relay minimum.
    FeeTooLow,
    /// Node already has this transaction; equivalent to success.
    AlreadyKnown,
    /// Upstream answered with a shape or values we refuse to propagate.
    InvalidResponse,
    /// This adapter does not implement the operation.
    Unsupported,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("[{provider}] {kind:?}: {message}")]
pub struct ProviderError {
    pub provider: String,
    pub kind: ProviderErrorKind,
    pub message: String,
    /// Providers consulted before giving up; non-empty only for the
    /// failover composite's all-providers-failed error.
    pub tried: Vec<String>,
}

impl ProviderError {
    pub fn new(provider: &str, kind: ProviderErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: provider.to_string(),
            kind,
            message: message.into(),
            tried: Vec::new(),
        }
    }

    pub fn with_tried(mut self, tried: Vec<String>) -> Self {
        self.tried = tried;
        self
    }

    /// Should the failover try the next provider after this error?
    pub fn is_retriable_elsewhere(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::Transient
                | ProviderErrorKind::InvalidResponse
                | ProviderErrorKind::Unsupported
        )
    }

    /// Should this error mark the provider unhealthy?
    pub fn counts_against_health(&self) -> bool {
        matches!(
            self.kind,
            ProviderErrorKind::RateLimited
                | ProviderErrorKind::Transient
                | ProviderErrorKind::InvalidResponse
        )
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AddressBalance {
    /// Koinu with at least one confirmation.
    pub confirmed: u64,
    /// Koinu still in the mempool.
    pub unconfirmed: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainTxOutput {
    pub vout: u32,
    pub value: u64,
    /// Hex scriptPubKey.
    pub script_pubkey: String,
    pub address: Option<String>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChainTransaction {
    pub txid: String,
    pub confirmations: u32,
    pub block_height: Option<u64>,
    pub outputs: Vec<ChainTxOutput>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NetworkInfo {
    pub height: u64,
    /// Estimated fee in koinu per kilobyte, when the provider offers one.
    pub fee_per_kb: Option<u64>,
}

/// The six chain operations the wallet needs.
#[async_trait]
pub trait ChainProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn get_balance(&self, address: &str) -> Result<AddressBalance, ProviderError>;
    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError>;
    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction, ProviderError>;
    async fn get_transactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<ChainTransaction>, ProviderError>;
    /// Returns the accepted txid.
    async fn broadcast_tx(&self, raw_hex: &str) -> Result<String, ProviderError>;
    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError>;
}

// ── Field-by-field JSON validation helpers used by every adapter ──────────

pub(crate) fn json_u64(
    provider: &str,
    value: &serde_json::Value,
    field: &str,
) -> Result<u64, ProviderError> {
    let v = value.get(field).ok_or_else(|| {
        ProviderError::new(
            provider,
            ProviderErrorKind::InvalidResponse,
            format!("missing field `{field}`"),
        )
    })?;
    // some APIs quote their numbers
    if let Some(n) = v.as_u64() {
        return Ok(n);
    }
    if let Some(s) = v.as_str() {
        if let Ok(n) = s.parse::<u64>() {
            return Ok(n);
        }
    }
    Err(ProviderError::new(
        provider,
        ProviderErrorKind::InvalidResponse,
        format!("field `{field}` is not a non-negative integer"),
    ))
}

pub(crate) fn json_str<'a>(
    provider: &str,
    value: &'a serde_json::Value,
    field: &str,
) -> Result<&'a str, ProviderError> {
    value.get(field).and_then(|v| v.as_str()).ok_or_else(|| {
        ProviderError::new(
            provider,
            ProviderErrorKind::InvalidResponse,
            format!("missing string field `{field}`"),
        )
    })
}

pub(crate) fn json_array<'a>(
    provider: &str,
    value: &'a serde_json::Value,
    field: &str,
) -> Result<&'a [serde_json::Value], ProviderError> {
    value
        .get(field)
        .and_then(|v| v.as_array())
        .map(|v| v.as_slice())
        .ok_or_else(|| {
            ProviderError::new(
                provider,
                ProviderErrorKind::InvalidResponse,
                format!("missing array field `{field}`"),
            )
        })
}

/// Amounts reported in DOGE decimal strings ("12.5") → koinu.
pub(crate) fn doge_str_to_koinu(provider: &str, s: &str) -> Result<u64, ProviderError> {
    let parsed: f64 = s.parse().map_err(|_| {
        ProviderError::new(
            provider,
            ProviderErrorKind::InvalidResponse,
            format!("unparsable amount `{s}`"),
        )
    })?;
    crate::units::doge_to_koinu(parsed).ok_or_else(|| {
        ProviderError::new(
            provider,
            ProviderErrorKind::InvalidResponse,
            format!("amount out of range `{s}`"),
        )
    })
}

/// Map an HTTP transport error into the taxonomy.
pub(crate) fn transport_error(provider: &str, err: &reqwest::Error) -> ProviderError {
    let kind = if err.is_timeout() || err.is_connect() || err.is_request() {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::InvalidResponse
    };
    ProviderError::new(provider, kind, err.to_string())
}

/// Map a non-2xx status plus response body into the taxonomy. Broadcast
/// endpoints additionally classify the body text (the only place wire
/// strings are inspected).
pub(crate) fn status_error(
    provider: &str,
    status: reqwest::StatusCode,
    body: &str,
    broadcast: bool,
) -> ProviderError {
    if broadcast {
        if let Some(kind) = classify_broadcast_failure(body) {
            return ProviderError::new(provider, kind, truncate(body, 300));
        }
    }
    let kind = if status.as_u16() == 429 {
        ProviderErrorKind::RateLimited
    } else if status.as_u16() == 404 {
        ProviderErrorKind::NotFound
    } else if status.is_server_error() {
        ProviderErrorKind::Transient
    } else {
        ProviderErrorKind::InvalidResponse
    };
    ProviderError::new(provider, kind, format!("HTTP {status}: {}", truncate(body, 300)))
}

/// Broadcast rejection strings as emitted by dogecoind and the hosted APIs.
pub(crate) fn classify_broadcast_failure(body: &str) -> Option<ProviderErrorKind> {
    let lower = body.to_lowercase();
    if lower.contains("inputs-missingorspent")
        || lower.contains("txn-mempool-conflict")
        || lower.contains("missing inputs")
        || lower.contains("bad-txns-inputs-spent")
    {
        return Some(ProviderErrorKind::DoubleSpend);
    }
    if lower.contains("min relay fee not met")
        || lower.contains("insufficient fee")
        || lower.contains("fee too low")
        || lower.contains("min-fee-not-met")
    {
        return Some(ProviderErrorKind::FeeTooLow);
    }
    if lower.contains("already known")
        || lower.contains("txn-already-known")
        || lower.contains("txn-already-in-mempool")
        || lower.contains("already in block chain")
        || lower.contains("transaction already exists")
    {
        return Some(ProviderErrorKind::AlreadyKnown);
    }
    None
}

pub(crate) fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &s[..end])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn json_u64_accepts_quoted_numbers() {
        let v = serde_json::json!({"a": 5, "b": "17", "c": "x", "d": -3});
        assert_eq!(json_u64("p", &v, "a").unwrap(), 5);
        assert_eq!(json_u64("p", &v, "b").unwrap(), 17);
        assert!(json_u64("p", &v, "c").is_err());
        assert!(json_u64("p", &v, "d").is_err());
        assert!(json_u64("p", &v, "missing").is_err());
    }

    #[test]
    fn doge_strings_convert() {
        assert_eq!(doge_str_to_koinu("p", "2.5").unwrap(), 250_000_000);
        assert!(doge_str_to_koinu("p", "-1").is_err());
        assert!(doge_str_to_koinu("p", "abc").is_err());
    }

    #[test]
    fn broadcast_classification() {
        assert_eq!(
            classify_broadcast_failure("error: txn-mempool-conflict"),
            Some(ProviderErrorKind::DoubleSpend)
        );
        assert_eq!(
            classify_broadcast_failure("66: min relay fee not met"),
            Some(ProviderErrorKind::FeeTooLow)
        );
        assert_eq!(
            classify_broadcast_failure("Transaction already exists in the mempool"),
            Some(ProviderErrorKind::AlreadyKnown)
        );
        assert_eq!(classify_broadcast_failure("weird failure"), None);
    }

    #[test]
    fn status_mapping() {
        let e = status_error("p", reqwest::StatusCode::TOO_MANY_REQUESTS, "slow down", false);
        assert_eq!(e.kind, ProviderErrorKind::RateLimited);
        let e = status_error("p", reqwest::StatusCode::BAD_GATEWAY, "", false);
        assert_eq!(e.kind, ProviderErrorKind::Transient);
        let e = status_error("p", reqwest::StatusCode::NOT_FOUND, "", false);
        assert_eq!(e.kind, ProviderErrorKind::NotFound);
    }
}
