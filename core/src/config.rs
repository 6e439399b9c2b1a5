//! # Configuration & Constants
//!
//! Every magic number in the authorization core lives here, next to the
//! runtime configuration that overrides the tunable ones. If you're
//! hardcoding a limit or a timeout somewhere else, move it here.
//!
//! Runtime settings come from a TOML file (see [`X402Config::load`]). Every
//! section has defaults, so an empty file is a valid mock-mode config.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::{SpendingPolicy, Usd};

// ---------------------------------------------------------------------------
// Currency & Policy Defaults
// ---------------------------------------------------------------------------

/// The only invoice currency the authorizer accepts.
pub const SUPPORTED_CURRENCY: &str = "USD";

/// Default per-transaction ceiling: $500.00.
pub const DEFAULT_PER_TRANSACTION_MAX_CENTS: u64 = 50_000;

/// Default daily ceiling: $2,000.00.
pub const DEFAULT_DAILY_LIMIT_CENTS: u64 = 200_000;

/// Default weekly ceiling: $5,000.00.
pub const DEFAULT_WEEKLY_LIMIT_CENTS: u64 = 500_000;

// ---------------------------------------------------------------------------
// Authorization Tokens
// ---------------------------------------------------------------------------

/// Prefix on every minted token. Makes leaked tokens greppable in logs
/// and secret scanners.
pub const TOKEN_PREFIX: &str = "x402_";

/// Random bytes behind each token. 256 bits; guessing is not a strategy.
pub const TOKEN_ENTROPY_BYTES: usize = 32;

/// Memo attached to the escrow transfer: `AUTH:<invoice_id>`.
pub const AUTH_MEMO_PREFIX: &str = "AUTH:";

/// Memo attached to an on-chain payout out of escrow: `RELEASE:<invoice_id>`.
pub const RELEASE_MEMO_PREFIX: &str = "RELEASE:";

/// Memo attached when escrow funding goes back to the payer because the
/// authorization never committed: `REVERSAL:<invoice_id>`.
pub const REVERSAL_MEMO_PREFIX: &str = "REVERSAL:";

// ---------------------------------------------------------------------------
// Escrow
// ---------------------------------------------------------------------------

/// Locks not settled within this window are swept to `EXPIRED`.
pub const DEFAULT_ESCROW_TTL_HOURS: u64 = 72;

/// Longest escrow window a config may ask for: one year.
pub const MAX_ESCROW_TTL_HOURS: u64 = 24 * 365;

/// How often the node runs the expiry sweep.
pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Random bytes in escrow, release and credential ids (`escrow_<hex8>`).
pub const SHORT_ID_BYTES: usize = 4;

// ---------------------------------------------------------------------------
// Wallet
// ---------------------------------------------------------------------------

/// Upper bound on any single wallet call. A transfer that hasn't answered
/// by then is treated as failed.
pub const DEFAULT_WALLET_TIMEOUT_SECS: u64 = 30;

/// Chain the escrow wallet lives on.
pub const DEFAULT_NETWORK: &str = "base-sepolia";

/// Block explorer used to build receipt links.
pub const DEFAULT_EXPLORER_BASE_URL: &str = "https://sepolia.basescan.org";

/// Escrow address reported by the mock wallet.
pub const MOCK_ESCROW_ADDRESS: &str = "0x000000000000000000000000000000000000e5c0";

/// Mock wallet opening balance: 10,000.00 USDC.
pub const MOCK_INITIAL_USDC_CENTS: u64 = 1_000_000;

/// Mock wallet opening gas balance: 1 ETH, in gwei.
pub const MOCK_INITIAL_GAS_GWEI: u64 = 1_000_000_000;

// ---------------------------------------------------------------------------
// Credential Vault
// ---------------------------------------------------------------------------

/// AES-256 key length in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-GCM nonce length in bytes. 96 bits, the only size worth using.
pub const AES_NONCE_LENGTH: usize = 12;

/// AES-GCM authentication tag length in bytes.
pub const AES_TAG_LENGTH: usize = 16;

/// Fixed, versioned KDF salt. Bump the suffix if the derivation ever
/// changes; old records then fail loudly instead of decrypting to garbage.
pub const VAULT_KDF_SALT: &[u8] = b"x402-credential-vault-salt-v1";

/// Argon2id memory cost in KiB (64 MiB).
pub const VAULT_KDF_MEMORY_KIB: u32 = 65_536;

/// Argon2id passes over memory.
pub const VAULT_KDF_ITERATIONS: u32 = 3;

/// Argon2id lanes.
pub const VAULT_KDF_PARALLELISM: u32 = 1;

/// Shortest master secret the vault will derive a key from.
pub const VAULT_MIN_SECRET_LENGTH: usize = 16;

/// Environment variable holding the vault master secret.
pub const DEFAULT_MASTER_KEY_ENV: &str = "X402_VAULT_MASTER_KEY";

// ---------------------------------------------------------------------------
// Runtime Configuration
// ---------------------------------------------------------------------------

/// Errors loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Which [`WalletClient`](crate::wallet::WalletClient) to build at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletMode {
    /// In-process simulator. No money moves.
    #[default]
    Mock,
    /// JSON gateway over HTTP.
    Http,
}

/// `[escrow]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EscrowConfig {
    pub ttl_hours: u64,
    pub sweep_interval_secs: u64,
}

impl Default for EscrowConfig {
    fn default() -> Self {
        Self {
            ttl_hours: DEFAULT_ESCROW_TTL_HOURS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
        }
    }
}

impl EscrowConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours.min(MAX_ESCROW_TTL_HOURS) as i64)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

/// `[wallet]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WalletConfig {
    pub mode: WalletMode,
    pub network: String,
    pub escrow_address: String,
    pub explorer_base_url: String,
    /// Base URL of the wallet gateway. Required in `http` mode.
    pub gateway_url: Option<String>,
    /// Name of the env var holding the gateway bearer key, if any.
    pub api_key_env: Option<String>,
    pub timeout_secs: u64,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            mode: WalletMode::Mock,
            network: DEFAULT_NETWORK.to_string(),
            escrow_address: MOCK_ESCROW_ADDRESS.to_string(),
            explorer_base_url: DEFAULT_EXPLORER_BASE_URL.to_string(),
            gateway_url: None,
            api_key_env: None,
            timeout_secs: DEFAULT_WALLET_TIMEOUT_SECS,
        }
    }
}

impl WalletConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `[vault]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Env var holding the master secret. Checked first.
    pub master_key_env: String,
    /// File holding the master secret, as written by `x402-node init`.
    pub master_key_file: Option<PathBuf>,
    /// Use a random per-process key instead of a master secret. Stored
    /// credentials become unreadable after restart. Development only.
    pub ephemeral_key: bool,
    pub kdf_memory_kib: u32,
    pub kdf_iterations: u32,
    pub kdf_parallelism: u32,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            master_key_env: DEFAULT_MASTER_KEY_ENV.to_string(),
            master_key_file: None,
            ephemeral_key: false,
            kdf_memory_kib: VAULT_KDF_MEMORY_KIB,
            kdf_iterations: VAULT_KDF_ITERATIONS,
            kdf_parallelism: VAULT_KDF_PARALLELISM,
        }
    }
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct X402Config {
    /// Directory holding the sled database.
    pub data_dir: PathBuf,
    /// Business whose funds this instance commits.
    pub payer_id: String,
    pub policy: SpendingPolicy,
    pub escrow: EscrowConfig,
    pub wallet: WalletConfig,
    pub vault: VaultConfig,
}

impl Default for X402Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./x402-data"),
            payer_id: "default".to_string(),
            policy: SpendingPolicy::default(),
            escrow: EscrowConfig::default(),
            wallet: WalletConfig::default(),
            vault: VaultConfig::default(),
        }
    }
}

impl X402Config {
    /// Parse and validate a TOML document.
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: X402Config = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Render as TOML, e.g. for `x402-node init`.
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// Reject configurations that can never authorize anything sensible.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let p = &self.policy;
        if p.per_transaction_max == Usd::ZERO || p.daily_limit == Usd::ZERO {
            return Err(ConfigError::Invalid(
                "policy limits must be greater than zero".into(),
            ));
        }
        if p.per_transaction_max > p.daily_limit {
            return Err(ConfigError::Invalid(format!(
                "per_transaction_max {} exceeds daily_limit {}",
                p.per_transaction_max, p.daily_limit
            )));
        }
        if p.daily_limit > p.weekly_limit {
            return Err(ConfigError::Invalid(format!(
                "daily_limit {} exceeds weekly_limit {}",
                p.daily_limit, p.weekly_limit
            )));
        }
        if self.payer_id.trim().is_empty() {
            return Err(ConfigError::Invalid("payer_id must not be empty".into()));
        }
        if self.escrow.ttl_hours == 0 || self.escrow.ttl_hours > MAX_ESCROW_TTL_HOURS {
            return Err(ConfigError::Invalid(format!(
                "escrow.ttl_hours must be between 1 and {MAX_ESCROW_TTL_HOURS}"
            )));
        }
        if self.escrow.sweep_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "escrow.sweep_interval_secs must be > 0".into(),
            ));
        }
        if self.wallet.timeout_secs == 0 {
            return Err(ConfigError::Invalid("wallet.timeout_secs must be > 0".into()));
        }
        if self.wallet.mode == WalletMode::Http && self.wallet.gateway_url.is_none() {
            return Err(ConfigError::Invalid(
                "wallet.gateway_url is required in http mode".into(),
            ));
        }
        if self.vault.kdf_iterations == 0
            || self.vault.kdf_parallelism == 0
            || self.vault.kdf_memory_kib < 8 * self.vault.kdf_parallelism
        {
            return Err(ConfigError::Invalid(
                "vault KDF parameters are below Argon2 minimums".into(),
            ));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Sanity Checks
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_is_ordered() {
        assert!(DEFAULT_PER_TRANSACTION_MAX_CENTS <= DEFAULT_DAILY_LIMIT_CENTS);
        assert!(DEFAULT_DAILY_LIMIT_CENTS <= DEFAULT_WEEKLY_LIMIT_CENTS);
    }

    #[test]
    fn crypto_constants_match_aes_256_gcm() {
        assert_eq!(AES_KEY_LENGTH, 32);
        assert_eq!(AES_NONCE_LENGTH, 12);
        assert_eq!(AES_TAG_LENGTH, 16);
        assert!(VAULT_KDF_SALT.len() >= 16, "Argon2 wants at least 16 salt bytes");
    }

    #[test]
    fn empty_toml_yields_valid_defaults() {
        let config = X402Config::from_toml_str("").unwrap();
        assert_eq!(config, X402Config::default());
        assert_eq!(config.wallet.mode, WalletMode::Mock);
        assert_eq!(config.escrow.ttl(), chrono::Duration::hours(72));
    }

    #[test]
    fn parses_full_document() {
        let raw = r#"
            data_dir = "/var/lib/x402"
            payer_id = "biz_42"

            [policy]
            per_transaction_max = "500.00"
            daily_limit = "1000"
            weekly_limit = "4000.50"

            [escrow]
            ttl_hours = 24
            sweep_interval_secs = 60

            [wallet]
            mode = "http"
            gateway_url = "http://127.0.0.1:8545"
            api_key_env = "WALLET_API_KEY"
            timeout_secs = 5

            [vault]
            master_key_env = "MY_VAULT_KEY"
        "#;
        let config = X402Config::from_toml_str(raw).unwrap();
        assert_eq!(config.payer_id, "biz_42");
        assert_eq!(config.policy.daily_limit, Usd::from_dollars(1000));
        assert_eq!(config.policy.weekly_limit, Usd::from_cents(400_050));
        assert_eq!(config.wallet.mode, WalletMode::Http);
        assert_eq!(config.wallet.timeout(), Duration::from_secs(5));
        assert_eq!(config.vault.master_key_env, "MY_VAULT_KEY");
        assert_eq!(config.vault.kdf_iterations, VAULT_KDF_ITERATIONS);
    }

    #[test]
    fn rejects_inverted_limits() {
        let raw = r#"
            [policy]
            per_transaction_max = "2500"
            daily_limit = "2000"
        "#;
        assert!(matches!(
            X402Config::from_toml_str(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn http_mode_requires_gateway() {
        let raw = "[wallet]\nmode = \"http\"\n";
        assert!(matches!(
            X402Config::from_toml_str(raw),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn rejects_unparseable_amounts() {
        let raw = "[policy]\ndaily_limit = \"lots\"\n";
        assert!(matches!(
            X402Config::from_toml_str(raw),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn toml_output_round_trips() {
        let config = X402Config::default();
        let rendered = config.to_toml_string().unwrap();
        assert_eq!(X402Config::from_toml_str(&rendered).unwrap(), config);
    }
}
