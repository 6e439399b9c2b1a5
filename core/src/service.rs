//! # Service Container
//!
//! Builds every service once from an [`X402Config`] and hands out shared
//! handles. One `X402Core` per process; clone the `Arc`s into request
//! handlers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::authorizer::Authorizer;
use crate::config::{ConfigError, VaultConfig, X402Config};
use crate::crypto::{KdfParams, VaultKey};
use crate::escrow::{EscrowError, EscrowManager};
use crate::storage::{StoreError, X402Db};
use crate::vault::{CredentialVault, VaultError};
use crate::wallet::{wallet_from_config, WalletClient, WalletError};

#[derive(Debug, Error)]
pub enum CoreError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error(transparent)]
    Vault(#[from] VaultError),
}

pub struct X402Core {
    config: X402Config,
    db: X402Db,
    wallet: Arc<dyn WalletClient>,
    escrow: Arc<EscrowManager>,
    authorizer: Arc<Authorizer>,
    vault: Arc<CredentialVault>,
}

impl X402Core {
    /// Validate the config, open the store, pick the wallet and derive the
    /// vault key.
    pub fn open(config: &X402Config) -> Result<Self, CoreError> {
        config.validate()?;
        let db = X402Db::open(&config.data_dir)?;
        let wallet = wallet_from_config(&config.wallet)?;
        let key = load_vault_key(&config.vault)?;
        info!(
            data_dir = %config.data_dir.display(),
            wallet = wallet.mode(),
            escrow_address = wallet.escrow_address(),
            vault_key = %key.fingerprint(),
            "x402 core opened"
        );
        Ok(Self::from_parts(config.clone(), db, wallet, key))
    }

    /// Assemble from already-built parts. Tests use this with a temporary
    /// database and a mock wallet.
    pub fn from_parts(
        config: X402Config,
        db: X402Db,
        wallet: Arc<dyn WalletClient>,
        key: VaultKey,
    ) -> Self {
        let escrow = Arc::new(EscrowManager::new(db.clone(), config.escrow.ttl()));
        let authorizer = Arc::new(
            Authorizer::new(db.clone(), config.policy, escrow.clone(), wallet.clone())
                .with_payer_id(config.payer_id.clone())
                .with_wallet_timeout(config.wallet.timeout()),
        );
        let vault = Arc::new(CredentialVault::new(db.clone(), key, authorizer.clone()));
        Self {
            config,
            db,
            wallet,
            escrow,
            authorizer,
            vault,
        }
    }

    pub fn config(&self) -> &X402Config {
        &self.config
    }

    pub fn db(&self) -> &X402Db {
        &self.db
    }

    pub fn wallet(&self) -> &Arc<dyn WalletClient> {
        &self.wallet
    }

    pub fn escrow(&self) -> &Arc<EscrowManager> {
        &self.escrow
    }

    pub fn authorizer(&self) -> &Arc<Authorizer> {
        &self.authorizer
    }

    pub fn vault(&self) -> &Arc<CredentialVault> {
        &self.vault
    }

    /// One pass of the escrow expiry sweep.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize, EscrowError> {
        self.escrow.expire_old_locks(now)
    }
}

/// Resolve the vault key: env var, then key file, then (only if allowed)
/// a throwaway random key.
pub fn load_vault_key(config: &VaultConfig) -> Result<VaultKey, VaultError> {
    let params = KdfParams::from(config);

    if let Ok(secret) = std::env::var(&config.master_key_env) {
        let secret = Zeroizing::new(secret);
        if !secret.trim().is_empty() {
            return Ok(VaultKey::derive(secret.trim(), params)?);
        }
    }

    if let Some(path) = &config.master_key_file {
        let secret = Zeroizing::new(std::fs::read_to_string(path).map_err(|source| {
            VaultError::MasterKeyFile {
                path: path.clone(),
                source,
            }
        })?);
        return Ok(VaultKey::derive(secret.trim(), params)?);
    }

    if config.ephemeral_key {
        warn!("using an ephemeral vault key; stored credentials will not survive a restart");
        return Ok(VaultKey::ephemeral());
    }

    Err(VaultError::MissingMasterKey {
        env: config.master_key_env.clone(),
    })
}
