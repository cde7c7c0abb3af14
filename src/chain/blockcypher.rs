//! BlockCypher adapter (`/v1/doge/main`).

use async_trait::async_trait;
use std::time::Duration;

use super::{
    json_array, json_str, json_u64, status_error, transport_error, AddressBalance,
    ChainProvider, ChainTransaction, ChainTxOutput, NetworkInfo, ProviderError,
    ProviderErrorKind, HTTP_TIMEOUT_SECS,
};
use crate::network_type::NetworkType;
use crate::types::Utxo;

const NAME: &str = "blockcypher";

pub struct BlockCypher {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl BlockCypher {
    pub fn new(network: NetworkType, token: Option<String>) -> Self {
        let chain = match network {
            NetworkType::Mainnet => "main",
            // BlockCypher has no Dogecoin testnet; callers should prefer
            // SoChain there. The URL still resolves for integration setups.
            NetworkType::Testnet => "test",
        };
        Self {
            base_url: format!("https://api.blockcypher.com/v1/doge/{chain}"),
            token,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
                .build()
                .expect("reqwest client"),
        }
    }

    fn url(&self, path: &str) -> String {
        match &self.token {
            Some(token) if !token.is_empty() => {
                let sep = if path.contains('?') { '&' } else { '?' };
                format!("{}{}{}token={}", self.base_url, path, sep, token)
            }
            _ => format!("{}{}", self.base_url, path),
        }
    }

    async fn get_json(&self, path: &str) -> Result<serde_json::Value, ProviderError> {
        let resp = self
            .client
            .get(self.url(path))
            .send()
            .await
            .map_err(|e| transport_error(NAME, &e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(NAME, &e))?;
        if !status.is_success() {
            return Err(status_error(NAME, status, &body, false));
        }
        serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(NAME, ProviderErrorKind::InvalidResponse, e.to_string())
        })
    }

    fn parse_output(value: &serde_json::Value, vout: u32) -> Result<ChainTxOutput, ProviderError> {
        Ok(ChainTxOutput {
            vout,
            value: json_u64(NAME, value, "value")?,
            script_pubkey: json_str(NAME, value, "script")?.to_string(),
            address: value
                .get("addresses")
                .and_then(|a| a.as_array())
                .and_then(|a| a.first())
                .and_then(|a| a.as_str())
                .map(str::to_string),
        })
    }

    fn parse_tx(value: &serde_json::Value) -> Result<ChainTransaction, ProviderError> {
        let outputs = json_array(NAME, value, "outputs")?
            .iter()
            .enumerate()
            .map(|(i, o)| Self::parse_output(o, i as u32))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(ChainTransaction {
            txid: json_str(NAME, value, "hash")?.to_string(),
            confirmations: value
                .get("confirmations")
                .and_then(|c| c.as_u64())
                .unwrap_or(0) as u32,
            block_height: value
                .get("block_height")
                .and_then(|h| h.as_i64())
                .filter(|h| *h >= 0)
                .map(|h| h as u64),
            outputs,
        })
    }
}

#[async_trait]
impl ChainProvider for BlockCypher {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_balance(&self, address: &str) -> Result<AddressBalance, ProviderError> {
        let json = self.get_json(&format!("/addrs/{address}/balance")).await?;
        Ok(AddressBalance {
            confirmed: json_u64(NAME, &json, "balance")?,
            unconfirmed: json_u64(NAME, &json, "unconfirmed_balance").unwrap_or(0),
        })
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError> {
        let json = self
            .get_json(&format!(
                "/addrs/{address}?unspentOnly=true&includeScript=true&limit=2000"
            ))
            .await?;

        let mut utxos = Vec::new();
        for field in ["txrefs", "unconfirmed_txrefs"] {
            let Some(refs) = json.get(field).and_then(|v| v.as_array()) else {
                continue;
            };
            for r in refs {
                let confirmations = r
                    .get("confirmations")
                    .and_then(|c| c.as_u64())
                    .unwrap_or(0) as u32;
                utxos.push(Utxo {
                    txid: json_str(NAME, r, "tx_hash")?.to_string(),
                    vout: json_u64(NAME, r, "tx_output_n")? as u32,
                    address: address.to_string(),
                    amount: json_u64(NAME, r, "value")?,
                    script_pubkey: r
                        .get("script")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    confirmations,
                    block_height: r
                        .get("block_height")
                        .and_then(|h| h.as_i64())
                        .filter(|h| *h >= 0)
                        .map(|h| h as u64),
                    locked: false,
                    locked_for: None,
                    locked_at: None,
                });
            }
        }
        Ok(utxos)
    }

    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction, ProviderError> {
        let json = self.get_json(&format!("/txs/{txid}")).await?;
        Self::parse_tx(&json)
    }

    async fn get_transactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<ChainTransaction>, ProviderError> {
        let json = self
            .get_json(&format!("/addrs/{address}/full?limit={limit}"))
            .await?;
        json_array(NAME, &json, "txs")?
            .iter()
            .take(limit)
            .map(Self::parse_tx)
            .collect()
    }

    async fn broadcast_tx(&self, raw_hex: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .post(self.url("/txs/push"))
            .json(&serde_json::json!({ "tx": raw_hex }))
            .send()
            .await
            .map_err(|e| transport_error(NAME, &e))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| transport_error(NAME, &e))?;
        if !status.is_success() {
            return Err(status_error(NAME, status, &body, true));
        }
        let json: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(NAME, ProviderErrorKind::InvalidResponse, e.to_string())
        })?;
        let tx = json.get("tx").unwrap_or(&json);
        Ok(json_str(NAME, tx, "hash")?.to_string())
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError> {
        let json = self.get_json("").await?;
        Ok(NetworkInfo {
            height: json_u64(NAME, &json, "height")?,
            fee_per_kb: json.get("medium_fee_per_kb").and_then(|f| f.as_u64()),
        })
    }
}
