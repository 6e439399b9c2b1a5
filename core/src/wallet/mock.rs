//! In-process wallet simulator.
//!
//! Keeps a paying balance and an escrow balance behind a mutex, hands out
//! deterministic-looking transaction hashes, and can be told to go slow or
//! go dark so timeout and failure paths get exercised without a network.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sha2::{Digest, Sha256};

use super::{
    explorer_link, TransferReceipt, WalletBalance, WalletClient, WalletError, PAYER_RECIPIENT,
};
use crate::config::{WalletConfig, MOCK_INITIAL_GAS_GWEI, MOCK_INITIAL_USDC_CENTS};
use crate::model::Usd;

#[derive(Debug)]
struct MockLedger {
    balance: Usd,
    escrow_held: Usd,
    gas_gwei: u64,
    sequence: u64,
    transfers: Vec<TransferReceipt>,
}

/// Simulated wallet. Cheap to share behind an `Arc`.
#[derive(Debug)]
pub struct MockWallet {
    ledger: Mutex<MockLedger>,
    escrow_address: String,
    explorer_base_url: String,
    network: String,
    latency: Option<Duration>,
    offline: AtomicBool,
}

impl Default for MockWallet {
    fn default() -> Self {
        Self::from_config(&WalletConfig::default())
    }
}

impl MockWallet {
    pub fn from_config(config: &WalletConfig) -> Self {
        Self {
            ledger: Mutex::new(MockLedger {
                balance: Usd::from_cents(MOCK_INITIAL_USDC_CENTS),
                escrow_held: Usd::ZERO,
                gas_gwei: MOCK_INITIAL_GAS_GWEI,
                sequence: 0,
                transfers: Vec::new(),
            }),
            escrow_address: config.escrow_address.clone(),
            explorer_base_url: config.explorer_base_url.clone(),
            network: config.network.clone(),
            latency: None,
            offline: AtomicBool::new(false),
        }
    }

    /// Start from a specific paying balance.
    pub fn with_balance(self, balance: Usd) -> Self {
        self.ledger.lock().balance = balance;
        self
    }

    /// Sleep this long inside every transfer.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// While offline, every call fails with `Unavailable`.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Every receipt issued so far, oldest first.
    pub fn transfers(&self) -> Vec<TransferReceipt> {
        self.ledger.lock().transfers.clone()
    }

    /// Funds currently sitting in escrow.
    pub fn escrow_held(&self) -> Usd {
        self.ledger.lock().escrow_held
    }

    async fn simulate_network(&self) -> Result<(), WalletError> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(WalletError::Unavailable("mock wallet is offline".into()));
        }
        Ok(())
    }

    fn receipt(
        &self,
        ledger: &mut MockLedger,
        recipient: &str,
        amount: Usd,
        memo: &str,
    ) -> TransferReceipt {
        ledger.sequence += 1;
        let now = Utc::now();

        let mut hasher = Sha256::new();
        hasher.update(memo.as_bytes());
        hasher.update(now.to_rfc3339().as_bytes());
        hasher.update(ledger.sequence.to_be_bytes());
        let tx_reference = format!("0x{}", hex::encode(hasher.finalize()));

        let receipt = TransferReceipt {
            explorer_url: explorer_link(&self.explorer_base_url, &tx_reference),
            tx_reference,
            escrow_address: self.escrow_address.clone(),
            recipient: recipient.to_string(),
            amount,
            memo: memo.to_string(),
            network: self.network.clone(),
            submitted_at: now,
        };
        ledger.transfers.push(receipt.clone());
        receipt
    }
}

#[async_trait]
impl WalletClient for MockWallet {
    async fn transfer_to_escrow(
        &self,
        amount: Usd,
        memo: &str,
    ) -> Result<TransferReceipt, WalletError> {
        self.simulate_network().await?;
        if amount.is_zero() {
            return Err(WalletError::InvalidAmount);
        }

        let mut ledger = self.ledger.lock();
        let remaining = ledger
            .balance
            .checked_sub(amount)
            .ok_or(WalletError::InsufficientFunds {
                balance: ledger.balance,
                requested: amount,
            })?;
        ledger.balance = remaining;
        ledger.escrow_held = ledger.escrow_held.saturating_add(amount);

        let escrow = self.escrow_address.clone();
        let receipt = self.receipt(&mut ledger, &escrow, amount, memo);
        tracing::info!(
            amount = %amount,
            tx = %receipt.tx_reference,
            "[mock] transferred to escrow"
        );
        Ok(receipt)
    }

    async fn release_from_escrow(
        &self,
        amount: Usd,
        recipient: &str,
        memo: &str,
    ) -> Result<TransferReceipt, WalletError> {
        self.simulate_network().await?;
        if amount.is_zero() {
            return Err(WalletError::InvalidAmount);
        }

        let mut ledger = self.ledger.lock();
        let remaining = ledger
            .escrow_held
            .checked_sub(amount)
            .ok_or(WalletError::InsufficientFunds {
                balance: ledger.escrow_held,
                requested: amount,
            })?;
        ledger.escrow_held = remaining;

        let receipt = self.receipt(&mut ledger, recipient, amount, memo);
        tracing::info!(
            amount = %amount,
            recipient,
            tx = %receipt.tx_reference,
            "[mock] paid out of escrow"
        );
        Ok(receipt)
    }

    async fn return_to_payer(
        &self,
        amount: Usd,
        memo: &str,
    ) -> Result<TransferReceipt, WalletError> {
        self.simulate_network().await?;
        if amount.is_zero() {
            return Err(WalletError::InvalidAmount);
        }

        let mut ledger = self.ledger.lock();
        let remaining = ledger
            .escrow_held
            .checked_sub(amount)
            .ok_or(WalletError::InsufficientFunds {
                balance: ledger.escrow_held,
                requested: amount,
            })?;
        ledger.escrow_held = remaining;
        ledger.balance = ledger.balance.saturating_add(amount);

        let receipt = self.receipt(&mut ledger, PAYER_RECIPIENT, amount, memo);
        tracing::info!(
            amount = %amount,
            tx = %receipt.tx_reference,
            "[mock] returned escrow to payer"
        );
        Ok(receipt)
    }

    async fn get_balance(&self) -> Result<WalletBalance, WalletError> {
        self.simulate_network().await?;
        let ledger = self.ledger.lock();
        Ok(WalletBalance {
            primary_asset_balance: ledger.balance,
            native_gas_balance: ledger.gas_gwei,
        })
    }

    fn escrow_address(&self) -> &str {
        &self.escrow_address
    }

    fn mode(&self) -> &'static str {
        "mock"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DEFAULT_EXPLORER_BASE_URL, MOCK_ESCROW_ADDRESS};

    #[tokio::test]
    async fn starting_balances() {
        let wallet = MockWallet::default();
        let balance = wallet.get_balance().await.unwrap();
        assert_eq!(balance.primary_asset_balance, Usd::from_dollars(10_000));
        assert_eq!(balance.native_gas_balance, MOCK_INITIAL_GAS_GWEI);
        assert_eq!(wallet.escrow_address(), MOCK_ESCROW_ADDRESS);
    }

    #[tokio::test]
    async fn transfer_moves_funds_into_escrow() {
        let wallet = MockWallet::default();
        let receipt = wallet
            .transfer_to_escrow(Usd::from_dollars(150), "AUTH:INV-1")
            .await
            .unwrap();

        assert!(receipt.tx_reference.starts_with("0x"));
        assert_eq!(receipt.tx_reference.len(), 66);
        assert_eq!(
            receipt.explorer_url,
            format!("{DEFAULT_EXPLORER_BASE_URL}/tx/{}", receipt.tx_reference)
        );
        assert_eq!(receipt.memo, "AUTH:INV-1");
        assert_eq!(wallet.escrow_held(), Usd::from_dollars(150));

        let balance = wallet.get_balance().await.unwrap();
        assert_eq!(balance.primary_asset_balance, Usd::from_dollars(9_850));
    }

    #[tokio::test]
    async fn insufficient_balance_leaves_state_untouched() {
        let wallet = MockWallet::default().with_balance(Usd::from_dollars(10));
        let err = wallet
            .transfer_to_escrow(Usd::from_dollars(11), "AUTH:INV-2")
            .await
            .unwrap_err();
        assert_eq!(
            err,
            WalletError::InsufficientFunds {
                balance: Usd::from_dollars(10),
                requested: Usd::from_dollars(11),
            }
        );
        assert!(wallet.transfers().is_empty());
        assert_eq!(wallet.escrow_held(), Usd::ZERO);
    }

    #[tokio::test]
    async fn zero_transfers_are_refused() {
        let wallet = MockWallet::default();
        assert_eq!(
            wallet.transfer_to_escrow(Usd::ZERO, "m").await,
            Err(WalletError::InvalidAmount)
        );
    }

    #[tokio::test]
    async fn offline_wallet_fails_every_call() {
        let wallet = MockWallet::default();
        wallet.set_offline(true);
        assert!(matches!(
            wallet.transfer_to_escrow(Usd::from_dollars(1), "m").await,
            Err(WalletError::Unavailable(_))
        ));
        wallet.set_offline(false);
        assert!(wallet.transfer_to_escrow(Usd::from_dollars(1), "m").await.is_ok());
    }

    #[tokio::test]
    async fn payouts_come_out_of_escrow_only() {
        let wallet = MockWallet::default();
        wallet
            .transfer_to_escrow(Usd::from_dollars(100), "AUTH:INV-3")
            .await
            .unwrap();

        let payout = wallet
            .release_from_escrow(Usd::from_dollars(100), "0xvendor", "RELEASE:INV-3")
            .await
            .unwrap();
        assert_eq!(payout.recipient, "0xvendor");
        assert_eq!(wallet.escrow_held(), Usd::ZERO);

        assert!(matches!(
            wallet
                .release_from_escrow(Usd::from_cents(1), "0xvendor", "again")
                .await,
            Err(WalletError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn returned_funds_land_back_in_the_paying_balance() {
        let wallet = MockWallet::default();
        wallet
            .transfer_to_escrow(Usd::from_dollars(40), "AUTH:INV-4")
            .await
            .unwrap();

        let back = wallet
            .return_to_payer(Usd::from_dollars(40), "REVERSAL:INV-4")
            .await
            .unwrap();
        assert_eq!(back.recipient, PAYER_RECIPIENT);
        assert_eq!(wallet.escrow_held(), Usd::ZERO);
        let balance = wallet.get_balance().await.unwrap();
        assert_eq!(balance.primary_asset_balance, Usd::from_dollars(10_000));

        assert!(matches!(
            wallet.return_to_payer(Usd::from_cents(1), "again").await,
            Err(WalletError::InsufficientFunds { .. })
        ));
    }

    #[tokio::test]
    async fn receipts_are_unique_per_transfer() {
        let wallet = MockWallet::default();
        let a = wallet.transfer_to_escrow(Usd::from_dollars(1), "same").await.unwrap();
        let b = wallet.transfer_to_escrow(Usd::from_dollars(1), "same").await.unwrap();
        assert_ne!(a.tx_reference, b.tx_reference);
        assert_eq!(wallet.transfers().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn latency_is_simulated() {
        let wallet = MockWallet::default().with_latency(Duration::from_secs(5));
        let start = tokio::time::Instant::now();
        wallet.transfer_to_escrow(Usd::from_dollars(1), "slow").await.unwrap();
        assert!(start.elapsed() >= Duration::from_secs(5));
    }
}
