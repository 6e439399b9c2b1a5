// Copyright (c) 2026 ALAS Technology. MIT License.
// See LICENSE for details.

//! # x402 Core
//!
//! Authorization, escrow and credential custody for payments started by
//! autonomous agents. An agent asks to pay an invoice; this crate checks
//! the business's spending policy, moves the money into escrow through a
//! wallet, and hands back a single-use token. Whoever actually pays the
//! vendor (card rails, ACH, a browser filling in a form) redeems that
//! token, may ask the vault for bank details, and finally reports back so
//! the escrow is released or refunded.
//!
//! ## Architecture
//!
//! - **config**: constants and the TOML runtime configuration.
//! - **model**: invoices, requests, responses, money.
//! - **crypto**: AES-GCM field sealing, Argon2id key derivation, token minting.
//! - **storage**: the sled database every service shares.
//! - **wallet**: the `WalletClient` trait, a mock and an HTTP gateway adapter.
//! - **escrow**: lock lifecycle `LOCKED → RELEASED | REFUNDED | EXPIRED`.
//! - **authorizer**: the policy engine and token issuer.
//! - **vault**: encrypted bank credentials behind token verification.
//! - **service**: `X402Core`, which wires the above together once.
//!
//! ## Ground Rules
//!
//! 1. Money is integer cents. There is no float anywhere near a balance.
//! 2. A policy rejection is a response, not an error.
//! 3. Tokens and credentials never reach a log line or the disk in clear.
//! 4. Every state change that spans records is one sled transaction.

pub mod authorizer;
pub mod config;
pub mod crypto;
pub mod escrow;
pub mod model;
pub mod service;
pub mod storage;
pub mod vault;
pub mod wallet;

pub use authorizer::{
    Authorizer, AuthorizerError, RedemptionError, StrandedFunds, TokenRecord, TokenState,
};
pub use config::{ConfigError, WalletMode, X402Config};
pub use escrow::{EscrowError, EscrowLock, EscrowManager, EscrowRelease, EscrowStats, EscrowStatus};
pub use model::{
    AuthorizationRequest, AuthorizationResponse, AuthorizationStatus, Invoice, PaymentMethod,
    PaymentRequest, RejectionReason, SpendingPolicy, SpendingSummary, Usd,
};
pub use service::{CoreError, X402Core};
pub use storage::X402Db;
pub use vault::{BankCredentials, CredentialInfo, CredentialVault, TokenVerifier, VaultError};
pub use wallet::{HttpWalletClient, MockWallet, TransferReceipt, WalletClient, WalletError};
