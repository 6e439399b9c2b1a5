//! Bank credential shapes: what comes in, what is stored, what goes out.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use zeroize::Zeroizing;

/// Plaintext onboarding input. Buffers are wiped on drop.
pub struct BankCredentials {
    pub routing_number: Zeroizing<String>,
    pub account_number: Zeroizing<String>,
    pub account_name: Zeroizing<String>,
    pub bank_name: Option<String>,
}

impl BankCredentials {
    pub fn new(
        routing_number: impl Into<String>,
        account_number: impl Into<String>,
        account_name: impl Into<String>,
    ) -> Self {
        Self {
            routing_number: Zeroizing::new(routing_number.into()),
            account_number: Zeroizing::new(account_number.into()),
            account_name: Zeroizing::new(account_name.into()),
            bank_name: None,
        }
    }

    pub fn with_bank_name(mut self, bank_name: impl Into<String>) -> Self {
        self.bank_name = Some(bank_name.into());
        self
    }

    /// Shape checks. Returns a message naming the offending field.
    pub(crate) fn validate(&self) -> Result<(), String> {
        let routing = self.routing_number.trim();
        if routing.len() != 9 || !routing.bytes().all(|b| b.is_ascii_digit()) {
            return Err("routing number must be exactly 9 digits".into());
        }
        let account = self.account_number.trim();
        if !(4..=17).contains(&account.len()) || !account.bytes().all(|b| b.is_ascii_digit()) {
            return Err("account number must be 4 to 17 digits".into());
        }
        if self.account_name.trim().is_empty() {
            return Err("account name must not be empty".into());
        }
        Ok(())
    }
}

impl fmt::Debug for BankCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BankCredentials")
            .field("routing_number", &"[REDACTED]")
            .field("account_number", &"[REDACTED]")
            .field("account_name", &"[REDACTED]")
            .field("bank_name", &self.bank_name)
            .finish()
    }
}

/// Persisted form. Every sensitive field is an AES-GCM blob bound to
/// `(owner_id, field name)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct StoredCredential {
    pub credential_id: String,
    pub owner_id: String,
    pub routing_number: Vec<u8>,
    pub account_number: Vec<u8>,
    pub account_name: Vec<u8>,
    pub routing_last4: String,
    pub account_last4: String,
    pub bank_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Display-safe view. Nothing here can move money.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialInfo {
    pub credential_id: String,
    pub owner_id: String,
    pub routing_last4: String,
    pub account_last4: String,
    pub bank_name: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&StoredCredential> for CredentialInfo {
    fn from(stored: &StoredCredential) -> Self {
        Self {
            credential_id: stored.credential_id.clone(),
            owner_id: stored.owner_id.clone(),
            routing_last4: stored.routing_last4.clone(),
            account_last4: stored.account_last4.clone(),
            bank_name: stored.bank_name.clone(),
            created_at: stored.created_at,
            updated_at: stored.updated_at,
        }
    }
}

/// Decrypted credentials handed to the payment executor for form filling.
/// Lives only as long as the injection; wiped on drop, never printed.
pub struct InjectionCredentials {
    pub routing_number: Zeroizing<String>,
    pub account_number: Zeroizing<String>,
    pub account_name: Zeroizing<String>,
    pub bank_name: Option<String>,
}

impl fmt::Debug for InjectionCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InjectionCredentials")
            .field("routing_number", &"[REDACTED]")
            .field("account_number", &"[REDACTED]")
            .field("account_name", &"[REDACTED]")
            .field("bank_name", &self.bank_name)
            .finish()
    }
}

pub(crate) fn last4(digits: &str) -> String {
    let digits = digits.trim();
    digits[digits.len().saturating_sub(4)..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_rules() {
        assert!(BankCredentials::new("021000021", "123456789012", "Acme LLC")
            .validate()
            .is_ok());
        assert!(BankCredentials::new("02100002", "123456789012", "Acme LLC")
            .validate()
            .unwrap_err()
            .contains("routing"));
        assert!(BankCredentials::new("02100002x", "123456789012", "Acme LLC")
            .validate()
            .is_err());
        assert!(BankCredentials::new("021000021", "123", "Acme LLC")
            .validate()
            .unwrap_err()
            .contains("account number"));
        assert!(BankCredentials::new("021000021", "123456789012345678", "Acme LLC")
            .validate()
            .is_err());
        assert!(BankCredentials::new("021000021", "1234", " ")
            .validate()
            .unwrap_err()
            .contains("name"));
    }

    #[test]
    fn last_four_digits() {
        assert_eq!(last4("021000021"), "0021");
        assert_eq!(last4("123456789012"), "9012");
        assert_eq!(last4("1234"), "1234");
    }

    #[test]
    fn debug_output_is_redacted() {
        let creds = BankCredentials::new("021000021", "123456789012", "Acme LLC")
            .with_bank_name("Chase");
        let printed = format!("{creds:?}");
        assert!(!printed.contains("021000021"));
        assert!(!printed.contains("123456789012"));
        assert!(!printed.contains("Acme"));
        assert!(printed.contains("Chase"));

        let injected = InjectionCredentials {
            routing_number: Zeroizing::new("021000021".into()),
            account_number: Zeroizing::new("123456789012".into()),
            account_name: Zeroizing::new("Acme LLC".into()),
            bank_name: None,
        };
        let printed = format!("{injected:?}");
        assert!(!printed.contains("021000021"));
        assert!(printed.contains("[REDACTED]"));
    }
}
