//! # Wallet Interface
//!
//! The authorizer never moves money itself. It asks a [`WalletClient`] to
//! push funds into the escrow address and gets back a receipt or a typed
//! failure. Two implementations ship with the crate:
//!
//! - [`MockWallet`]: an in-process simulator with a balance, for demos and
//!   tests. No network, no chain.
//! - [`HttpWalletClient`]: talks JSON to a wallet gateway service that owns
//!   the actual keys.
//!
//! Which one runs is a configuration decision made once at startup
//! ([`wallet_from_config`]), not something sniffed from the environment
//! halfway through a request.

mod http;
mod mock;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::{WalletConfig, WalletMode};
use crate::model::Usd;

pub use http::HttpWalletClient;
pub use mock::MockWallet;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Proof that a transfer was submitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Chain transaction hash or gateway transfer id.
    pub tx_reference: String,
    pub explorer_url: String,
    /// Escrow wallet the funds moved into (or out of, for payouts).
    pub escrow_address: String,
    /// Where the funds went.
    pub recipient: String,
    pub amount: Usd,
    pub memo: String,
    pub network: String,
    pub submitted_at: DateTime<Utc>,
}

/// Balances of the paying wallet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletBalance {
    /// Stablecoin balance, in USD cents.
    pub primary_asset_balance: Usd,
    /// Native gas token balance, in gwei.
    pub native_gas_balance: u64,
}

/// Why a wallet call failed. All of these are upstream failures: the caller
/// may retry, and no escrow or token exists for the attempt.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WalletError {
    #[error("Insufficient balance: {balance} < {requested}")]
    InsufficientFunds { balance: Usd, requested: Usd },

    #[error("transfer amount must be greater than zero")]
    InvalidAmount,

    #[error("wallet unavailable: {0}")]
    Unavailable(String),

    #[error("wallet gateway rejected the request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("wallet call timed out after {0:?}")]
    Timeout(Duration),

    #[error("unexpected wallet response: {0}")]
    Protocol(String),

    #[error("wallet misconfigured: {0}")]
    Config(String),
}

impl WalletError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, WalletError::Timeout(_))
    }
}

// ---------------------------------------------------------------------------
// Trait
// ---------------------------------------------------------------------------

/// Moves value into and out of the escrow wallet.
#[async_trait]
pub trait WalletClient: Send + Sync {
    /// Commit `amount` from the paying wallet into escrow.
    async fn transfer_to_escrow(
        &self,
        amount: Usd,
        memo: &str,
    ) -> Result<TransferReceipt, WalletError>;

    /// Pay escrowed funds out to `recipient`. Only used when the payee
    /// takes crypto directly; fiat payouts happen outside the wallet.
    async fn release_from_escrow(
        &self,
        amount: Usd,
        recipient: &str,
        memo: &str,
    ) -> Result<TransferReceipt, WalletError>;

    /// Send escrowed funds back to the paying wallet. Used to unwind a
    /// transfer whose authorization could not be recorded.
    async fn return_to_payer(&self, amount: Usd, memo: &str)
        -> Result<TransferReceipt, WalletError>;

    async fn get_balance(&self) -> Result<WalletBalance, WalletError>;

    fn escrow_address(&self) -> &str;

    /// Short label for logs and metrics ("mock", "http").
    fn mode(&self) -> &'static str;
}

/// Build the wallet the configuration asks for.
pub fn wallet_from_config(config: &WalletConfig) -> Result<Arc<dyn WalletClient>, WalletError> {
    match config.mode {
        WalletMode::Mock => Ok(Arc::new(MockWallet::from_config(config))),
        WalletMode::Http => Ok(Arc::new(HttpWalletClient::from_config(config)?)),
    }
}

/// `recipient` on receipts for funds returned to the paying wallet.
pub const PAYER_RECIPIENT: &str = "payer";

pub(crate) fn explorer_link(base: &str, tx_reference: &str) -> String {
    format!("{}/tx/{}", base.trim_end_matches('/'), tx_reference)
}
