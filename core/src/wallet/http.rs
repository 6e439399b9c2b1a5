//! Wallet gateway client.
//!
//! The gateway is a small service that owns the escrow keys and speaks
//! JSON:
//!
//! ```text
//! POST /v1/transfers  {"to", "amount_cents", "memo", "network"}
//!                  -> {"tx_hash", "explorer_url"?}
//! POST /v1/returns    {"amount_cents", "memo", "network"}
//!                  -> {"tx_hash", "explorer_url"?}
//! GET  /v1/balance -> {"usdc_cents", "gas_gwei"}
//! ```
//!
//! Every request carries the configured timeout, and a bearer key when one
//! is configured.

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::{
    explorer_link, TransferReceipt, WalletBalance, WalletClient, WalletError, PAYER_RECIPIENT,
};
use crate::config::WalletConfig;
use crate::model::Usd;

#[derive(Debug, Serialize)]
struct TransferBody<'a> {
    to: &'a str,
    amount_cents: u64,
    memo: &'a str,
    network: &'a str,
}

/// Escrow back to the paying wallet. The gateway knows that address.
#[derive(Debug, Serialize)]
struct ReturnBody<'a> {
    amount_cents: u64,
    memo: &'a str,
    network: &'a str,
}

#[derive(Debug, Deserialize)]
struct TransferReply {
    tx_hash: String,
    #[serde(default)]
    explorer_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BalanceReply {
    usdc_cents: u64,
    gas_gwei: u64,
}

/// [`WalletClient`] backed by an HTTP wallet gateway.
#[derive(Debug, Clone)]
pub struct HttpWalletClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    escrow_address: String,
    explorer_base_url: String,
    network: String,
    timeout: std::time::Duration,
}

impl HttpWalletClient {
    /// Build from the `[wallet]` config section. Reads the API key from the
    /// env var named by `api_key_env`, if set.
    pub fn from_config(config: &WalletConfig) -> Result<Self, WalletError> {
        let base_url = config
            .gateway_url
            .clone()
            .ok_or_else(|| WalletError::Config("gateway_url is required in http mode".into()))?;

        let api_key = match &config.api_key_env {
            Some(var) => Some(std::env::var(var).map_err(|_| {
                WalletError::Config(format!("wallet API key env var {var} is not set"))
            })?),
            None => None,
        };

        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()
            .map_err(|e| WalletError::Config(e.to_string()))?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            escrow_address: config.escrow_address.clone(),
            explorer_base_url: config.explorer_base_url.clone(),
            network: config.network.clone(),
            timeout: config.timeout(),
        })
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }

    fn map_transport(&self, err: reqwest::Error) -> WalletError {
        if err.is_timeout() {
            WalletError::Timeout(self.timeout)
        } else if err.is_decode() {
            WalletError::Protocol(err.to_string())
        } else {
            WalletError::Unavailable(err.to_string())
        }
    }

    async fn checked(&self, response: reqwest::Response) -> Result<reqwest::Response, WalletError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(WalletError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn submit(&self, to: &str, amount: Usd, memo: &str) -> Result<TransferReceipt, WalletError> {
        if amount.is_zero() {
            return Err(WalletError::InvalidAmount);
        }

        let body = TransferBody {
            to,
            amount_cents: amount.cents(),
            memo,
            network: &self.network,
        };
        self.post_transfer("/v1/transfers", &body, to, amount, memo)
            .await
    }

    async fn post_transfer<B: Serialize + Sync>(
        &self,
        route: &str,
        body: &B,
        recipient: &str,
        amount: Usd,
        memo: &str,
    ) -> Result<TransferReceipt, WalletError> {
        let response = self
            .authorized(self.client.post(format!("{}{route}", self.base_url)))
            .json(body)
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let reply: TransferReply = self
            .checked(response)
            .await?
            .json()
            .await
            .map_err(|e| self.map_transport(e))?;

        if reply.tx_hash.is_empty() {
            return Err(WalletError::Protocol("gateway returned an empty tx_hash".into()));
        }

        Ok(TransferReceipt {
            explorer_url: reply
                .explorer_url
                .unwrap_or_else(|| explorer_link(&self.explorer_base_url, &reply.tx_hash)),
            tx_reference: reply.tx_hash,
            escrow_address: self.escrow_address.clone(),
            recipient: recipient.to_string(),
            amount,
            memo: memo.to_string(),
            network: self.network.clone(),
            submitted_at: Utc::now(),
        })
    }
}

#[async_trait]
impl WalletClient for HttpWalletClient {
    async fn transfer_to_escrow(
        &self,
        amount: Usd,
        memo: &str,
    ) -> Result<TransferReceipt, WalletError> {
        let receipt = self.submit(&self.escrow_address, amount, memo).await?;
        tracing::info!(amount = %amount, tx = %receipt.tx_reference, "transferred to escrow");
        Ok(receipt)
    }

    async fn release_from_escrow(
        &self,
        amount: Usd,
        recipient: &str,
        memo: &str,
    ) -> Result<TransferReceipt, WalletError> {
        let receipt = self.submit(recipient, amount, memo).await?;
        tracing::info!(amount = %amount, recipient, tx = %receipt.tx_reference, "paid out of escrow");
        Ok(receipt)
    }

    async fn return_to_payer(
        &self,
        amount: Usd,
        memo: &str,
    ) -> Result<TransferReceipt, WalletError> {
        if amount.is_zero() {
            return Err(WalletError::InvalidAmount);
        }
        let body = ReturnBody {
            amount_cents: amount.cents(),
            memo,
            network: &self.network,
        };
        let receipt = self
            .post_transfer("/v1/returns", &body, PAYER_RECIPIENT, amount, memo)
            .await?;
        tracing::info!(amount = %amount, tx = %receipt.tx_reference, "returned escrow to payer");
        Ok(receipt)
    }

    async fn get_balance(&self) -> Result<WalletBalance, WalletError> {
        let response = self
            .authorized(self.client.get(format!("{}/v1/balance", self.base_url)))
            .send()
            .await
            .map_err(|e| self.map_transport(e))?;
        let reply: BalanceReply = self
            .checked(response)
            .await?
            .json()
            .await
            .map_err(|e| self.map_transport(e))?;
        Ok(WalletBalance {
            primary_asset_balance: Usd::from_cents(reply.usdc_cents),
            native_gas_balance: reply.gas_gwei,
        })
    }

    fn escrow_address(&self) -> &str {
        &self.escrow_address
    }

    fn mode(&self) -> &'static str {
        "http"
    }
}
