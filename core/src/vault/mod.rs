//! # Credential Vault
//!
//! Bank-transfer credentials for businesses, sealed field by field with
//! AES-256-GCM under a key derived from the operator's master secret.
//!
//! The only way to get plaintext back out is
//! [`CredentialVault::get_credentials_for_injection`], and it only answers
//! callers holding a live authorization token for the invoice being paid,
//! funded by the business whose credentials are asked for.
//! Every attempt that reaches a decision, granted or denied, lands in the
//! audit log.
//!
//! ```text
//! store ──> validate ──> seal(routing) ─┐
//!                        seal(account) ─┼─> credentials[owner_id]
//!                        seal(name)    ─┘    + last-4 in clear
//!
//! inject ─> verify_token_for? ──no──> audit(denied) ─> None
//!                 │err ──> Err(Store), no audit record
//!                 │yes
//!                 └──> open(...) ──ok──> audit(success) ─> Zeroizing plaintext
//!                           └──err──> audit(failed) ─> Err(Decryption)
//! ```

mod audit;
mod credential;

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{error, info, warn};
use zeroize::Zeroizing;

use crate::crypto::{field_context, open, seal, short_id, EncryptionError, KeyDerivationError, VaultKey};
use crate::storage::db::encode;
use crate::storage::{StoreError, X402Db};

pub use audit::{AuditAction, AuditOutcome, AuditRecord};
pub use credential::{BankCredentials, CredentialInfo, InjectionCredentials};

use credential::{last4, StoredCredential};

const FIELD_ROUTING: &str = "routing_number";
const FIELD_ACCOUNT: &str = "account_number";
const FIELD_NAME: &str = "account_name";

/// Answers "may this token unlock `owner_id`'s credentials to pay this
/// invoice right now?" without consuming it. Implemented by the authorizer.
///
/// A storage failure is an `Err`, never a `false`: the vault must not
/// record a denial it did not decide.
pub trait TokenVerifier: Send + Sync {
    fn verify_token_for(
        &self,
        token: &str,
        invoice_id: &str,
        owner_id: &str,
    ) -> Result<bool, StoreError>;
}

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("credential encryption failed: {0}")]
    Encryption(#[from] EncryptionError),

    /// Stored ciphertext could not be opened with the current key.
    #[error("credential decryption failed")]
    Decryption,

    #[error(transparent)]
    KeyDerivation(#[from] KeyDerivationError),

    #[error("vault master secret not set: export {env}, set vault.master_key_file, or enable vault.ephemeral_key")]
    MissingMasterKey { env: String },

    #[error("failed to read vault master secret from {path}: {source}")]
    MasterKeyFile {
        path: std::path::PathBuf,
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

pub struct CredentialVault {
    db: X402Db,
    key: VaultKey,
    verifier: Arc<dyn TokenVerifier>,
}

impl CredentialVault {
    pub fn new(db: X402Db, key: VaultKey, verifier: Arc<dyn TokenVerifier>) -> Self {
        Self { db, key, verifier }
    }

    /// Short fingerprint of the active key, safe to log.
    pub fn key_fingerprint(&self) -> String {
        self.key.fingerprint()
    }

    /// Encrypt and upsert an owner's credentials. Re-storing keeps the
    /// original credential id and creation time.
    pub fn store_credentials(
        &self,
        owner_id: &str,
        credentials: &BankCredentials,
    ) -> Result<String, VaultError> {
        if owner_id.trim().is_empty() {
            return Err(VaultError::InvalidCredentials("owner id must not be empty".into()));
        }
        credentials.validate().map_err(VaultError::InvalidCredentials)?;

        let key = self.key.as_bytes();
        let routing = credentials.routing_number.trim();
        let account = credentials.account_number.trim();
        let name = credentials.account_name.trim();

        let existing: Option<StoredCredential> =
            self.db.get(&self.db.credentials, owner_id.as_bytes())?;
        let now = Utc::now();
        let (credential_id, created_at) = match &existing {
            Some(prev) => (prev.credential_id.clone(), prev.created_at),
            None => (short_id("cred"), now),
        };

        let stored = StoredCredential {
            credential_id: credential_id.clone(),
            owner_id: owner_id.to_string(),
            routing_number: seal(key, routing.as_bytes(), &field_context(owner_id, FIELD_ROUTING))?,
            account_number: seal(key, account.as_bytes(), &field_context(owner_id, FIELD_ACCOUNT))?,
            account_name: seal(key, name.as_bytes(), &field_context(owner_id, FIELD_NAME))?,
            routing_last4: last4(routing),
            account_last4: last4(account),
            bank_name: credentials.bank_name.clone(),
            created_at,
            updated_at: now,
        };
        self.db
            .credentials
            .insert(owner_id.as_bytes(), encode(&stored)?)
            .map_err(StoreError::from)?;

        let detail = if existing.is_some() { "updated" } else { "created" };
        audit::append(&self.db, owner_id, AuditAction::Store, AuditOutcome::Success, None, detail)?;
        info!(
            owner_id,
            credential_id = %credential_id,
            routing_last4 = %stored.routing_last4,
            account_last4 = %stored.account_last4,
            "bank credentials stored"
        );
        Ok(credential_id)
    }

    /// Non-sensitive view for display.
    pub fn get_credential_info(&self, owner_id: &str) -> Result<Option<CredentialInfo>, VaultError> {
        let stored: Option<StoredCredential> =
            self.db.get(&self.db.credentials, owner_id.as_bytes())?;
        Ok(stored.as_ref().map(CredentialInfo::from))
    }

    /// Decrypt credentials for the payment executor. Requires a token that
    /// is currently valid for `invoice_id` and was issued against
    /// `owner_id`'s funds; otherwise returns `None` without touching the
    /// stored record. Exactly one audit record per call, none if the token
    /// lookup itself fails.
    pub fn get_credentials_for_injection(
        &self,
        owner_id: &str,
        auth_token: &str,
        invoice_id: &str,
    ) -> Result<Option<InjectionCredentials>, VaultError> {
        if !self.verifier.verify_token_for(auth_token, invoice_id, owner_id)? {
            warn!(owner_id, invoice_id, "credential access denied: token not valid for owner and invoice");
            audit::append(
                &self.db,
                owner_id,
                AuditAction::Inject,
                AuditOutcome::Denied,
                Some(invoice_id),
                "authorization token not valid for this owner and invoice",
            )?;
            return Ok(None);
        }

        let stored: Option<StoredCredential> =
            self.db.get(&self.db.credentials, owner_id.as_bytes())?;
        let Some(stored) = stored else {
            audit::append(
                &self.db,
                owner_id,
                AuditAction::Inject,
                AuditOutcome::NotFound,
                Some(invoice_id),
                "no credentials on file",
            )?;
            return Ok(None);
        };

        match self.decrypt(&stored) {
            Ok(credentials) => {
                audit::append(
                    &self.db,
                    owner_id,
                    AuditAction::Inject,
                    AuditOutcome::Success,
                    Some(invoice_id),
                    format!("credential {} decrypted", stored.credential_id),
                )?;
                info!(owner_id, invoice_id, "credentials released for injection");
                Ok(Some(credentials))
            }
            Err(e) => {
                error!(owner_id, invoice_id, error = %e, "credential decryption failed");
                audit::append(
                    &self.db,
                    owner_id,
                    AuditAction::Inject,
                    AuditOutcome::Failed,
                    Some(invoice_id),
                    e.to_string(),
                )?;
                Err(VaultError::Decryption)
            }
        }
    }

    fn decrypt(&self, stored: &StoredCredential) -> Result<InjectionCredentials, EncryptionError> {
        let owner = stored.owner_id.as_str();
        Ok(InjectionCredentials {
            routing_number: self.open_field(owner, FIELD_ROUTING, &stored.routing_number)?,
            account_number: self.open_field(owner, FIELD_ACCOUNT, &stored.account_number)?,
            account_name: self.open_field(owner, FIELD_NAME, &stored.account_name)?,
            bank_name: stored.bank_name.clone(),
        })
    }

    fn open_field(
        &self,
        owner_id: &str,
        field: &str,
        sealed: &[u8],
    ) -> Result<Zeroizing<String>, EncryptionError> {
        let bytes = Zeroizing::new(open(
            self.key.as_bytes(),
            sealed,
            &field_context(owner_id, field),
        )?);
        let text = std::str::from_utf8(&bytes).map_err(|_| EncryptionError::DecryptFailed)?;
        Ok(Zeroizing::new(text.to_owned()))
    }

    pub fn delete_credentials(&self, owner_id: &str) -> Result<bool, VaultError> {
        let removed = self
            .db
            .credentials
            .remove(owner_id.as_bytes())
            .map_err(StoreError::from)?
            .is_some();
        let outcome = if removed {
            AuditOutcome::Success
        } else {
            AuditOutcome::NotFound
        };
        audit::append(&self.db, owner_id, AuditAction::Delete, outcome, None, "")?;
        if removed {
            info!(owner_id, "bank credentials deleted");
        }
        Ok(removed)
    }

    /// Audit trail in append order, for one owner or everyone.
    pub fn audit_log(&self, owner_id: Option<&str>) -> Result<Vec<AuditRecord>, VaultError> {
        Ok(audit::list(&self.db, owner_id)?)
    }
}
