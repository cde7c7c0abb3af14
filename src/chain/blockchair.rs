//! Blockchair last-resort broadcaster.
//!
//! Only `broadcast_tx` is implemented; the failover composite consults this
//! adapter after both standard providers fail a broadcast. Every other
//! operation reports `Unsupported`.

use async_trait::async_trait;
use std::time::Duration;

use super::{
    json_str, status_error, transport_error, AddressBalance, ChainProvider, ChainTransaction,
    NetworkInfo, ProviderError, ProviderErrorKind, HTTP_TIMEOUT_SECS,
};
use crate::types::Utxo;

const NAME: &str = "blockchair";

pub struct BlockchairPush {
    base_url: String,
    client: reqwest::Client,
}

impl BlockchairPush {
    pub fn new() -> Self {
        Self {
            base_url: "https://api.blockchair.com".to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
                .build()
                .expect("reqwest client"),
        }
    }

    fn unsupported(&self, op: &str) -> ProviderError {
        ProviderError::new(
            NAME,
            ProviderErrorKind::Unsupported,
            format!("{op} not supported by last-resort broadcaster"),
        )
    }
}

impl Default for BlockchairPush {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ChainProvider for BlockchairPush {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_balance(&self, _address: &str) -> Result<AddressBalance, ProviderError> {
        Err(self.unsupported("get_balance"))
    }

    async fn get_utxos(&self, _address: &str) -> Result<Vec<Utxo>, ProviderError> {
        Err(self.unsupported("get_utxos"))
    }

    async fn get_transaction(&self, _txid: &str) -> Result<ChainTransaction, ProviderError> {
        Err(self.unsupported("get_transaction"))
    }

    async fn get_transactions(
        &self,
        _address: &str,
        _limit: usize,
    ) -> Result<Vec<ChainTransaction>, ProviderError> {
        Err(self.unsupported("get_transactions"))
    }

    async fn broadcast_tx(&self, raw_hex: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(format!("{}/dogecoin/push/transaction", self.base_url))
            .json(&serde_json::json!({ "data": raw_hex }))
            .send()
            .await
            .map_err(|e| transport_error(NAME, &e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_error(NAME, &e))?;
        if !status.is_success() {
            return Err(status_error(NAME, status, &body, true));
        }
        let json: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(NAME, ProviderErrorKind::InvalidResponse, e.to_string())
        })?;
        let data = json.get("data").unwrap_or(&json);
        Ok(json_str(NAME, data, "transaction_hash")?.to_string())
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError> {
        Err(self.unsupported("get_network_info"))
    }
}
