//! SoChain v3 adapter (`/api/v3`).
//!
//! SoChain reports amounts as DOGE decimal strings; everything is converted
//! to koinu at this boundary.

use async_trait::async_trait;
use std::time::Duration;

use super::{
    doge_str_to_koinu, json_array, json_str, json_u64, status_error, transport_error,
    AddressBalance, ChainProvider, ChainTransaction, ChainTxOutput, NetworkInfo, ProviderError,
    ProviderErrorKind, HTTP_TIMEOUT_SECS,
};
use crate::network_type::NetworkType;
use crate::types::Utxo;

const NAME: &str = "sochain";

pub struct SoChain {
    base_url: String,
    network_code: &'static str,
    api_key: Option<String>,
    client: reqwest::Client,
}

impl SoChain {
    pub fn new(network: NetworkType, api_key: Option<String>) -> Self {
        Self {
            base_url: "https://chain.so/api/v3".to_string(),
            network_code: match network {
                NetworkType::Mainnet => "DOGE",
                NetworkType::Testnet => "DOGETEST",
            },
            api_key,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
                .build()
                .expect("reqwest client"),
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let mut req = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        if let Some(key) = &self.api_key {
            if !key.is_empty() {
                req = req.header("API-KEY", key);
            }
        }
        req
    }

    /// All v3 endpoints wrap their payload in `{status, data}`.
    async fn get_data(&self, path: &str) -> Result<serde_json::Value, ProviderError> {
        let resp = self
            .request(reqwest::Method::GET, path)
            .send()
            .await
            .map_err(|e| transport_error(NAME, &e))?;
        let status = resp.status();
        let body = resp.text().await.map_err(|e| transport_error(NAME, &e))?;
        if !status.is_success() {
            return Err(status_error(NAME, status, &body, false));
        }
        let json: serde_json::Value = serde_json::from_str(&body).map_err(|e| {
            ProviderError::new(NAME, ProviderErrorKind::InvalidResponse, e.to_string())
        })?;
        if json_str(NAME, &json, "status")? != "success" {
            return Err(ProviderError::new(
                NAME,
                ProviderErrorKind::InvalidResponse,
                format!("non-success status: {}", super::truncate(&body, 200)),
            ));
        }
        json.get("data").cloned().ok_or_else(|| {
            ProviderError::new(NAME, ProviderErrorKind::InvalidResponse, "missing data")
        })
    }

    fn parse_tx(&self, data: &serde_json::Value) -> Result<ChainTransaction, ProviderError> {
        let outputs = json_array(NAME, data, "outputs")?
            .iter()
            .map(|o| {
                Ok(ChainTxOutput {
                    vout: json_u64(NAME, o, "output_no")? as u32,
                    value: doge_str_to_koinu(NAME, json_str(NAME, o, "value")?)?,
                    script_pubkey: o
                        .get("script_hex")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    address: o
                        .get("address")
                        .and_then(|a| a.as_str())
                        .map(str::to_string),
                })
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;
        Ok(ChainTransaction {
            txid: json_str(NAME, data, "txid")?.to_string(),
            confirmations: json_u64(NAME, data, "confirmations").unwrap_or(0) as u32,
            block_height: data.get("block_no").and_then(|h| h.as_u64()),
            outputs,
        })
    }
}

#[async_trait]
impl ChainProvider for SoChain {
    fn name(&self) -> &str {
        NAME
    }

    async fn get_balance(&self, address: &str) -> Result<AddressBalance, ProviderError> {
        let data = self
            .get_data(&format!("/balance/{}/{address}", self.network_code))
            .await?;
        Ok(AddressBalance {
            confirmed: doge_str_to_koinu(NAME, json_str(NAME, &data, "confirmed")?)?,
            unconfirmed: data
                .get("unconfirmed")
                .and_then(|v| v.as_str())
                .map(|s| doge_str_to_koinu(NAME, s))
                .transpose()?
                .unwrap_or(0),
        })
    }

    async fn get_utxos(&self, address: &str) -> Result<Vec<Utxo>, ProviderError> {
        let data = self
            .get_data(&format!("/unspent_outputs/{}/{address}", self.network_code))
            .await?;
        json_array(NAME, &data, "outputs")?
            .iter()
            .map(|o| {
                Ok(Utxo {
                    txid: json_str(NAME, o, "hash")?.to_string(),
                    vout: json_u64(NAME, o, "index")? as u32,
                    address: address.to_string(),
                    amount: doge_str_to_koinu(NAME, json_str(NAME, o, "value")?)?,
                    script_pubkey: o
                        .get("script")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default()
                        .to_string(),
                    confirmations: o
                        .get("confirmations")
                        .and_then(|c| c.as_u64())
                        .unwrap_or(0) as u32,
                    block_height: o.get("block_no").and_then(|h| h.as_u64()),
                    locked: false,
                    locked_for: None,
                    locked_at: None,
                })
            })
            .collect()
    }

    async fn get_transaction(&self, txid: &str) -> Result<ChainTransaction, ProviderError> {
        let data = self
            .get_data(&format!("/transaction/{}/{txid}", self.network_code))
            .await?;
        self.parse_tx(&data)
    }

    async fn get_transactions(
        &self,
        address: &str,
        limit: usize,
    ) -> Result<Vec<ChainTransaction>, ProviderError> {
        let data = self
            .get_data(&format!("/transactions/{}/{address}", self.network_code))
            .await?;
        json_array(NAME, &data, "transactions")?
            .iter()
            .take(limit)
            .map(|t| self.parse_tx(t))
            .collect()
    }

    async fn broadcast_tx(&self, raw_hex: &str) -> Result<String, ProviderError> {
        let resp = self
            .request(
                reqwest::Method::POST,
                &format!("/broadcast_transaction/{}", self.network_code),
            )
            .json(&serde_json::json!({ "tx_hex": raw_hex }))
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
        Ok(json_str(NAME, data, "hash")
            .or_else(|_| json_str(NAME, data, "txid"))?
            .to_string())
    }

    async fn get_network_info(&self) -> Result<NetworkInfo, ProviderError> {
        let data = self
            .get_data(&format!("/network_info/{}", self.network_code))
            .await?;
        Ok(NetworkInfo {
            height: json_u64(NAME, &data, "blocks")?,
            fee_per_kb: data
                .get("fee_per_kb")
                .and_then(|v| v.as_str())
                .map(|s| doge_str_to_koinu(NAME, s))
                .transpose()?,
        })
    }
}
