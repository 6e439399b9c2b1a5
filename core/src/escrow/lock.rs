//! Escrow lock records and their state machine.
//!
//! ```text
//!            ┌──> RELEASED   (payee paid, release record appended)
//! LOCKED ────┼──> REFUNDED   (execution failed, funds back to payer)
//!            └──> EXPIRED    (nobody settled it before expires_at)
//! ```
//!
//! Exactly one arrow is ever taken. Every mutator checks the current status
//! first and returns [`EscrowError::InvalidState`] instead of touching a
//! terminal lock.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::crypto::short_id;
use crate::model::Usd;
use crate::storage::StoreError;
use crate::wallet::TransferReceipt;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum EscrowError {
    /// The lock is not in a state that allows this operation.
    #[error("invalid state transition: escrow {escrow_id} is {current}, expected {expected}")]
    InvalidState {
        escrow_id: String,
        current: EscrowStatus,
        expected: EscrowStatus,
    },

    #[error("escrow not found: {0}")]
    NotFound(String),

    /// Another caller holds the settlement claim on this lock.
    #[error("settlement already in progress for escrow {0}")]
    SettlementInProgress(String),

    /// Release requested for a payee other than the one the lock names.
    #[error("payee mismatch on escrow {escrow_id}: lock names {expected}, release names {provided}")]
    PayeeMismatch {
        escrow_id: String,
        expected: String,
        provided: String,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<sled::transaction::TransactionError<EscrowError>> for EscrowError {
    fn from(err: sled::transaction::TransactionError<EscrowError>) -> Self {
        match err {
            sled::transaction::TransactionError::Abort(inner) => inner,
            sled::transaction::TransactionError::Storage(e) => EscrowError::Store(e.into()),
        }
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EscrowStatus {
    /// Funds held, waiting for release or refund.
    Locked,
    /// Paid out to the payee.
    Released,
    /// Returned to the payer.
    Refunded,
    /// Swept after `expires_at` passed with no settlement.
    Expired,
}

impl EscrowStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, EscrowStatus::Locked)
    }
}

impl fmt::Display for EscrowStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EscrowStatus::Locked => "LOCKED",
            EscrowStatus::Released => "RELEASED",
            EscrowStatus::Refunded => "REFUNDED",
            EscrowStatus::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// Funds held against one authorized invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowLock {
    pub escrow_id: String,
    pub invoice_id: String,
    /// Business whose money is held.
    pub payer_id: String,
    /// Vendor the funds are earmarked for, when known up front.
    pub payee_id: Option<String>,
    pub amount: Usd,
    pub status: EscrowStatus,
    /// SHA-256 of the authorization token bound to this lock.
    pub token_digest: String,
    /// Receipt of the transfer that funded the lock.
    pub funding: TransferReceipt,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub settlement_reference: Option<String>,
    /// Wallet address, `ACH:<reference>`, or payee id the funds went to.
    pub release_recipient: Option<String>,
    pub refund_reason: Option<String>,
}

/// Immutable record of a payout. One per released lock, never more.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowRelease {
    pub release_id: String,
    pub escrow_id: String,
    pub invoice_id: String,
    pub payee_id: String,
    pub amount: Usd,
    /// External confirmation, e.g. a bank transfer id.
    pub settlement_reference: Option<String>,
    /// True when the payee's side confirmed receipt (a reference exists).
    pub payee_confirmed: bool,
    /// On-chain payout, for crypto-native settlement.
    pub payout: Option<TransferReceipt>,
    pub funding_tx_reference: String,
    pub released_at: DateTime<Utc>,
}

impl EscrowRelease {
    /// The transaction a caller should show for this release: the payout
    /// if funds moved on-chain, otherwise the original escrow funding.
    pub fn tx_reference(&self) -> &str {
        self.payout
            .as_ref()
            .map(|p| p.tx_reference.as_str())
            .unwrap_or(&self.funding_tx_reference)
    }
}

impl EscrowLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.status == EscrowStatus::Locked && self.expires_at < now
    }

    fn ensure_locked(&self) -> Result<(), EscrowError> {
        if self.status != EscrowStatus::Locked {
            return Err(EscrowError::InvalidState {
                escrow_id: self.escrow_id.clone(),
                current: self.status,
                expected: EscrowStatus::Locked,
            });
        }
        Ok(())
    }

    /// `LOCKED → RELEASED`. Returns the release record to append.
    pub fn release(
        &mut self,
        payee_id: &str,
        settlement_reference: Option<&str>,
        payout: Option<&TransferReceipt>,
        now: DateTime<Utc>,
    ) -> Result<EscrowRelease, EscrowError> {
        self.ensure_locked()?;
        if let Some(expected) = &self.payee_id {
            if expected != payee_id {
                return Err(EscrowError::PayeeMismatch {
                    escrow_id: self.escrow_id.clone(),
                    expected: expected.clone(),
                    provided: payee_id.to_string(),
                });
            }
        }

        let recipient = match (payout, settlement_reference) {
            (Some(p), _) => p.recipient.clone(),
            (None, Some(reference)) => format!("ACH:{reference}"),
            (None, None) => payee_id.to_string(),
        };

        self.status = EscrowStatus::Released;
        self.settled_at = Some(now);
        self.settlement_reference = settlement_reference.map(str::to_string);
        self.release_recipient = Some(recipient);

        Ok(EscrowRelease {
            release_id: short_id("release"),
            escrow_id: self.escrow_id.clone(),
            invoice_id: self.invoice_id.clone(),
            payee_id: payee_id.to_string(),
            amount: self.amount,
            settlement_reference: settlement_reference.map(str::to_string),
            payee_confirmed: settlement_reference.is_some(),
            payout: payout.cloned(),
            funding_tx_reference: self.funding.tx_reference.clone(),
            released_at: now,
        })
    }

    /// `LOCKED → REFUNDED`.
    pub fn refund(&mut self, reason: &str, now: DateTime<Utc>) -> Result<(), EscrowError> {
        self.ensure_locked()?;
        self.status = EscrowStatus::Refunded;
        self.settled_at = Some(now);
        self.refund_reason = Some(reason.to_string());
        Ok(())
    }

    /// `LOCKED → EXPIRED`. The caller decides *when*; see
    /// [`is_expired_at`](Self::is_expired_at).
    pub fn expire(&mut self, now: DateTime<Utc>) -> Result<(), EscrowError> {
        self.ensure_locked()?;
        self.status = EscrowStatus::Expired;
        self.settled_at = Some(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn receipt() -> TransferReceipt {
        TransferReceipt {
            tx_reference: "0xfund".into(),
            explorer_url: "https://sepolia.basescan.org/tx/0xfund".into(),
            escrow_address: "0xescrow".into(),
            recipient: "0xescrow".into(),
            amount: Usd::from_dollars(150),
            memo: "AUTH:INV-1".into(),
            network: "base-sepolia".into(),
            submitted_at: Utc::now(),
        }
    }

    fn lock() -> EscrowLock {
        let now = Utc::now();
        EscrowLock {
            escrow_id: "escrow_0001".into(),
            invoice_id: "INV-1".into(),
            payer_id: "biz_1".into(),
            payee_id: None,
            amount: Usd::from_dollars(150),
            status: EscrowStatus::Locked,
            token_digest: "ab".repeat(32),
            funding: receipt(),
            locked_at: now,
            expires_at: now + Duration::hours(72),
            settled_at: None,
            settlement_reference: None,
            release_recipient: None,
            refund_reason: None,
        }
    }

    #[test]
    fn release_records_ach_recipient() {
        let mut l = lock();
        let release = l.release("vendor_9", Some("ACH-778"), None, Utc::now()).unwrap();
        assert_eq!(l.status, EscrowStatus::Released);
        assert_eq!(l.release_recipient.as_deref(), Some("ACH:ACH-778"));
        assert!(release.payee_confirmed);
        assert_eq!(release.amount, Usd::from_dollars(150));
        assert_eq!(release.tx_reference(), "0xfund");
        assert!(release.release_id.starts_with("release_"));
    }

    #[test]
    fn release_without_reference_is_unconfirmed() {
        let mut l = lock();
        let release = l.release("vendor_9", None, None, Utc::now()).unwrap();
        assert!(!release.payee_confirmed);
        assert_eq!(l.release_recipient.as_deref(), Some("vendor_9"));
    }

    #[test]
    fn crypto_payout_overrides_recipient_and_tx() {
        let mut l = lock();
        let mut payout = receipt();
        payout.tx_reference = "0xpayout".into();
        payout.recipient = "0xvendorwallet".into();
        let release = l.release("vendor_9", None, Some(&payout), Utc::now()).unwrap();
        assert_eq!(release.tx_reference(), "0xpayout");
        assert_eq!(l.release_recipient.as_deref(), Some("0xvendorwallet"));
    }

    #[test]
    fn terminal_states_refuse_everything() {
        let now = Utc::now();
        let mut released = lock();
        released.release("v", None, None, now).unwrap();

        let mut refunded = lock();
        refunded.refund("payment failed", now).unwrap();
        assert_eq!(refunded.refund_reason.as_deref(), Some("payment failed"));

        let mut expired = lock();
        expired.expire(now).unwrap();

        for l in [&mut released, &mut refunded, &mut expired] {
            let before = l.clone();
            assert!(matches!(
                l.release("v", None, None, now),
                Err(EscrowError::InvalidState { .. })
            ));
            assert!(matches!(l.refund("x", now), Err(EscrowError::InvalidState { .. })));
            assert!(matches!(l.expire(now), Err(EscrowError::InvalidState { .. })));
            assert_eq!(*l, before, "failed transition must not mutate");
        }
    }

    #[test]
    fn payee_must_match_when_named() {
        let mut l = lock();
        l.payee_id = Some("vendor_9".into());
        assert!(matches!(
            l.release("vendor_10", None, None, Utc::now()),
            Err(EscrowError::PayeeMismatch { .. })
        ));
        assert_eq!(l.status, EscrowStatus::Locked);
        assert!(l.release("vendor_9", None, None, Utc::now()).is_ok());
    }

    #[test]
    fn expiry_is_strictly_after_deadline() {
        let l = lock();
        assert!(!l.is_expired_at(l.expires_at));
        assert!(l.is_expired_at(l.expires_at + Duration::seconds(1)));
    }

    #[test]
    fn status_display_and_terminality() {
        assert_eq!(EscrowStatus::Locked.to_string(), "LOCKED");
        assert!(!EscrowStatus::Locked.is_terminal());
        assert!(EscrowStatus::Released.is_terminal());
        assert!(EscrowStatus::Refunded.is_terminal());
        assert!(EscrowStatus::Expired.is_terminal());
    }
}
