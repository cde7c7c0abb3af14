//! Crate-wide error taxonomy.
//!
//! Subsystems keep their own `thiserror` enums where the failure is local
//! (keystore, chain adapters, sanitizers); everything that crosses a
//! component boundary is folded into [`WalletError`] so callers branch on
//! variants, never on message strings.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum WalletError {
    #[error("Wallet is not initialized")]
    NotInitialized,

    #[error("Wallet is already initialized")]
    AlreadyInitialized,

    #[error("Invalid mnemonic phrase")]
    InvalidMnemonic,

    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Wallet is locked")]
    WalletLocked,

    #[error("Insufficient funds: need {needed} koinu, have {available} koinu spendable")]
    InsufficientFunds { needed: u64, available: u64 },

    #[error("Double spend: {0}")]
    DoubleSpend(String),

    #[error("Fee below network minimum: {0}")]
    FeeTooLow(String),

    #[error("Broadcast failed on all providers: {0}")]
    BroadcastFailed(String),

    #[error("Provider error: {0}")]
    Provider(crate::chain::ProviderError),

    #[error("No chain provider available (tried: {tried:?})")]
    ProviderUnavailable { tried: Vec<String> },

    #[error("Policy denied: {0}")]
    PolicyDenied(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Rate limited: retry in {reset_in_ms} ms")]
    RateLimited { reset_in_ms: u64 },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<crate::chain::ProviderError> for WalletError {
    fn from(err: crate::chain::ProviderError) -> Self {
        // the failover composite tags its all-providers-failed error with
        // the list it tried
        if err.tried.is_empty() {
            WalletError::Provider(err)
        } else {
            WalletError::ProviderUnavailable {
                tried: err.tried,
            }
        }
    }
}

impl WalletError {
    /// True for failures the caller may retry without operator intervention.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            WalletError::BroadcastFailed(_)
                | WalletError::Provider(_)
                | WalletError::ProviderUnavailable { .. }
                | WalletError::RateLimited { .. }
        )
    }
}
