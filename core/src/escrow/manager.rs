//! Lifecycle of escrowed funds, persisted in sled.
//!
//! Two layers keep each lock's transition exactly-once:
//!
//! 1. A settlement claim ([`SettlementClaim`]) held in-process while a
//!    payout call is outstanding, so a refund or the expiry sweep cannot
//!    slip in between "wallet paid the vendor" and "lock marked released".
//! 2. Every transition re-reads the lock inside a serializable sled
//!    transaction and refuses if it is no longer `LOCKED`. This holds even
//!    across separate handles on the same database.
//!
//! Leaving `LOCKED` also removes the bound token record, in the same
//! transaction. A settled escrow has no live token.

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, Transactional};
use tracing::{debug, info};

use super::lock::{EscrowError, EscrowLock, EscrowRelease, EscrowStatus};
use crate::crypto::short_id;
use crate::model::Usd;
use crate::storage::db::{decode, decode_str, encode};
use crate::storage::X402Db;
use crate::wallet::TransferReceipt;

/// Everything needed to open a lock after funds reached escrow.
#[derive(Debug, Clone)]
pub struct NewLock {
    pub invoice_id: String,
    pub payer_id: String,
    pub payee_id: Option<String>,
    pub amount: Usd,
    pub funding: TransferReceipt,
    pub token_digest: String,
    /// Overrides the manager's default time-to-live.
    pub ttl: Option<Duration>,
}

/// Counts and totals per status.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscrowStats {
    pub total_locks: usize,
    pub locked: usize,
    pub released: usize,
    pub refunded: usize,
    pub expired: usize,
    pub total_locked: Usd,
    pub total_released: Usd,
    pub total_refunded: Usd,
    pub total_expired: Usd,
}

impl EscrowStats {
    fn record(&mut self, lock: &EscrowLock) {
        self.total_locks += 1;
        let (count, total) = match lock.status {
            EscrowStatus::Locked => (&mut self.locked, &mut self.total_locked),
            EscrowStatus::Released => (&mut self.released, &mut self.total_released),
            EscrowStatus::Refunded => (&mut self.refunded, &mut self.total_refunded),
            EscrowStatus::Expired => (&mut self.expired, &mut self.total_expired),
        };
        *count += 1;
        *total = total.saturating_add(lock.amount);
    }
}

/// Exclusive right to settle one lock. Dropping it lets others try.
#[derive(Debug)]
pub struct SettlementClaim<'a> {
    claims: &'a DashMap<String, ()>,
    lock: EscrowLock,
}

impl SettlementClaim<'_> {
    /// Snapshot of the lock taken when the claim was granted.
    pub fn lock(&self) -> &EscrowLock {
        &self.lock
    }
}

impl Drop for SettlementClaim<'_> {
    fn drop(&mut self) {
        self.claims.remove(&self.lock.escrow_id);
    }
}

/// Creates, settles and sweeps escrow locks.
pub struct EscrowManager {
    db: X402Db,
    default_ttl: Duration,
    claims: DashMap<String, ()>,
}

impl EscrowManager {
    pub fn new(db: X402Db, default_ttl: Duration) -> Self {
        Self {
            db,
            default_ttl,
            claims: DashMap::new(),
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    // -----------------------------------------------------------------------
    // Creation
    // -----------------------------------------------------------------------

    /// Record a new `LOCKED` escrow and its invoice/token indexes.
    pub fn create_lock(&self, new: NewLock) -> Result<EscrowLock, EscrowError> {
        let now = Utc::now();
        let lock = EscrowLock {
            escrow_id: short_id("escrow"),
            invoice_id: new.invoice_id,
            payer_id: new.payer_id,
            payee_id: new.payee_id,
            amount: new.amount,
            status: EscrowStatus::Locked,
            token_digest: new.token_digest,
            funding: new.funding,
            locked_at: now,
            expires_at: now + new.ttl.unwrap_or(self.default_ttl),
            settled_at: None,
            settlement_reference: None,
            release_recipient: None,
            refund_reason: None,
        };
        let bytes = encode(&lock)?;

        (
            &self.db.escrow_locks,
            &self.db.escrow_by_invoice,
            &self.db.escrow_by_token,
        )
            .transaction(
                |(locks, by_invoice, by_token)| -> ConflictableTransactionResult<(), EscrowError> {
                    locks.insert(lock.escrow_id.as_bytes(), bytes.clone())?;
                    by_invoice.insert(lock.invoice_id.as_bytes(), lock.escrow_id.as_bytes())?;
                    by_token.insert(lock.token_digest.as_bytes(), lock.escrow_id.as_bytes())?;
                    Ok(())
                },
            )?;

        info!(
            escrow_id = %lock.escrow_id,
            invoice_id = %lock.invoice_id,
            amount = %lock.amount,
            expires_at = %lock.expires_at,
            "escrow locked"
        );
        Ok(lock)
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    /// Take the settlement claim on a `LOCKED` escrow.
    pub fn claim(&self, escrow_id: &str) -> Result<SettlementClaim<'_>, EscrowError> {
        let lock = self
            .get_lock(escrow_id)?
            .ok_or_else(|| EscrowError::NotFound(escrow_id.to_string()))?;
        if lock.status != EscrowStatus::Locked {
            return Err(EscrowError::InvalidState {
                escrow_id: lock.escrow_id,
                current: lock.status,
                expected: EscrowStatus::Locked,
            });
        }
        match self.claims.entry(lock.escrow_id.clone()) {
            Entry::Occupied(_) => return Err(EscrowError::SettlementInProgress(lock.escrow_id)),
            Entry::Vacant(slot) => {
                slot.insert(());
            }
        }
        Ok(SettlementClaim {
            claims: &self.claims,
            lock,
        })
    }

    /// `LOCKED → RELEASED` with no on-chain payout (ACH or card settled
    /// elsewhere).
    pub fn release_to_vendor(
        &self,
        escrow_id: &str,
        payee_id: &str,
        settlement_reference: Option<&str>,
    ) -> Result<EscrowRelease, EscrowError> {
        let claim = self.claim(escrow_id)?;
        self.release_claimed(&claim, payee_id, settlement_reference, None)
    }

    /// Release a lock the caller already holds the claim on, optionally
    /// recording the receipt of a payout made while claimed.
    pub fn release_claimed(
        &self,
        claim: &SettlementClaim<'_>,
        payee_id: &str,
        settlement_reference: Option<&str>,
        payout: Option<TransferReceipt>,
    ) -> Result<EscrowRelease, EscrowError> {
        let now = Utc::now();
        let (lock, release) = self.transition(&claim.lock.escrow_id, |lock| {
            lock.release(payee_id, settlement_reference, payout.as_ref(), now)
                .map(Some)
        })?;
        let release = release.ok_or_else(|| EscrowError::NotFound(lock.escrow_id.clone()))?;

        info!(
            escrow_id = %lock.escrow_id,
            release_id = %release.release_id,
            payee_id = %release.payee_id,
            amount = %release.amount,
            confirmed = release.payee_confirmed,
            "escrow released"
        );
        Ok(release)
    }

    /// `LOCKED → REFUNDED`.
    pub fn refund_to_business(&self, escrow_id: &str, reason: &str) -> Result<bool, EscrowError> {
        let claim = self.claim(escrow_id)?;
        let now = Utc::now();
        let (lock, _) = self.transition(&claim.lock.escrow_id, |lock| {
            lock.refund(reason, now).map(|()| None)
        })?;
        info!(
            escrow_id = %lock.escrow_id,
            amount = %lock.amount,
            reason,
            "escrow refunded"
        );
        Ok(true)
    }

    /// Move every `LOCKED` escrow whose deadline passed before `now` to
    /// `EXPIRED`. Claimed and already-settled locks are skipped, so
    /// concurrent or repeated sweeps never double-count.
    pub fn expire_old_locks(&self, now: DateTime<Utc>) -> Result<usize, EscrowError> {
        let candidates: Vec<EscrowLock> = self
            .db
            .scan::<EscrowLock>(&self.db.escrow_locks)?
            .into_iter()
            .filter(|lock| lock.is_expired_at(now))
            .collect();

        let mut expired = 0;
        for candidate in candidates {
            let claim = match self.claim(&candidate.escrow_id) {
                Ok(claim) => claim,
                Err(EscrowError::SettlementInProgress(_) | EscrowError::InvalidState { .. }) => {
                    debug!(escrow_id = %candidate.escrow_id, "skipping lock during sweep");
                    continue;
                }
                Err(e) => return Err(e),
            };
            let outcome = self.transition(&claim.lock.escrow_id, |lock| {
                if !lock.is_expired_at(now) {
                    return Err(EscrowError::InvalidState {
                        escrow_id: lock.escrow_id.clone(),
                        current: lock.status,
                        expected: EscrowStatus::Locked,
                    });
                }
                lock.expire(now).map(|()| None)
            });
            match outcome {
                Ok((lock, _)) => {
                    info!(escrow_id = %lock.escrow_id, amount = %lock.amount, "escrow expired");
                    expired += 1;
                }
                Err(EscrowError::InvalidState { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(expired)
    }

    /// Apply `apply` to the stored lock inside one sled transaction that also
    /// appends the release record (if any) and revokes the bound token.
    fn transition<F>(
        &self,
        escrow_id: &str,
        apply: F,
    ) -> Result<(EscrowLock, Option<EscrowRelease>), EscrowError>
    where
        F: Fn(&mut EscrowLock) -> Result<Option<EscrowRelease>, EscrowError>,
    {
        let outcome = (
            &self.db.escrow_locks,
            &self.db.escrow_releases,
            &self.db.tokens,
        )
            .transaction(
                |(locks, releases, tokens)| -> ConflictableTransactionResult<
                    (EscrowLock, Option<EscrowRelease>),
                    EscrowError,
                > {
                    let raw = locks.get(escrow_id.as_bytes())?.ok_or_else(|| {
                        ConflictableTransactionError::Abort(EscrowError::NotFound(
                            escrow_id.to_string(),
                        ))
                    })?;
                    let mut lock: EscrowLock = decode(&raw).map_err(abort)?;
                    let release = apply(&mut lock).map_err(ConflictableTransactionError::Abort)?;

                    locks.insert(escrow_id.as_bytes(), encode(&lock).map_err(abort)?)?;
                    if let Some(release) = &release {
                        releases.insert(escrow_id.as_bytes(), encode(release).map_err(abort)?)?;
                    }
                    tokens.remove(lock.token_digest.as_bytes())?;
                    Ok((lock, release))
                },
            )?;
        Ok(outcome)
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_lock(&self, escrow_id: &str) -> Result<Option<EscrowLock>, EscrowError> {
        Ok(self.db.get(&self.db.escrow_locks, escrow_id.as_bytes())?)
    }

    /// Newest lock opened for an invoice.
    pub fn get_lock_by_invoice(&self, invoice_id: &str) -> Result<Option<EscrowLock>, EscrowError> {
        self.follow_index(&self.db.escrow_by_invoice, "escrow_by_invoice", invoice_id)
    }

    pub fn get_lock_by_token_digest(&self, digest: &str) -> Result<Option<EscrowLock>, EscrowError> {
        self.follow_index(&self.db.escrow_by_token, "escrow_by_token", digest)
    }

    fn follow_index(
        &self,
        index: &sled::Tree,
        name: &'static str,
        key: &str,
    ) -> Result<Option<EscrowLock>, EscrowError> {
        match index.get(key.as_bytes()).map_err(crate::storage::StoreError::from)? {
            Some(raw) => {
                let escrow_id = decode_str(name, &raw)?;
                self.get_lock(&escrow_id)
            }
            None => Ok(None),
        }
    }

    /// All locks a payer has opened, newest first.
    pub fn get_business_escrows(&self, payer_id: &str) -> Result<Vec<EscrowLock>, EscrowError> {
        let mut locks: Vec<EscrowLock> = self
            .db
            .scan::<EscrowLock>(&self.db.escrow_locks)?
            .into_iter()
            .filter(|lock| lock.payer_id == payer_id)
            .collect();
        locks.sort_by(|a, b| b.locked_at.cmp(&a.locked_at));
        Ok(locks)
    }

    pub fn get_release(&self, escrow_id: &str) -> Result<Option<EscrowRelease>, EscrowError> {
        Ok(self.db.get(&self.db.escrow_releases, escrow_id.as_bytes())?)
    }

    pub fn get_stats(&self) -> Result<EscrowStats, EscrowError> {
        let mut stats = EscrowStats::default();
        for lock in self.db.scan::<EscrowLock>(&self.db.escrow_locks)? {
            stats.record(&lock);
        }
        Ok(stats)
    }
}

fn abort(err: crate::storage::StoreError) -> ConflictableTransactionError<EscrowError> {
    ConflictableTransactionError::Abort(EscrowError::Store(err))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn receipt(amount: Usd) -> TransferReceipt {
        TransferReceipt {
            tx_reference: "0xfund".into(),
            explorer_url: "https://sepolia.basescan.org/tx/0xfund".into(),
            escrow_address: "0xescrow".into(),
            recipient: "0xescrow".into(),
            amount,
            memo: "AUTH:INV-1".into(),
            network: "base-sepolia".into(),
            submitted_at: Utc::now(),
        }
    }

    fn new_lock(invoice: &str, dollars: u64) -> NewLock {
        NewLock {
            invoice_id: invoice.into(),
            payer_id: "biz_1".into(),
            payee_id: None,
            amount: Usd::from_dollars(dollars),
            funding: receipt(Usd::from_dollars(dollars)),
            token_digest: crate::crypto::token_digest(&format!("tok-{invoice}")),
            ttl: None,
        }
    }

    fn manager() -> EscrowManager {
        EscrowManager::new(X402Db::open_temporary().unwrap(), Duration::hours(72))
    }

    #[test]
    fn create_lock_indexes_by_invoice_and_token() {
        let m = manager();
        let lock = m.create_lock(new_lock("INV-1", 150)).unwrap();
        assert_eq!(lock.status, EscrowStatus::Locked);
        assert!(lock.escrow_id.starts_with("escrow_"));
        assert_eq!(lock.expires_at - lock.locked_at, Duration::hours(72));

        assert_eq!(m.get_lock_by_invoice("INV-1").unwrap().unwrap(), lock);
        assert_eq!(
            m.get_lock_by_token_digest(&lock.token_digest).unwrap().unwrap(),
            lock
        );
        assert!(m.get_lock_by_invoice("INV-2").unwrap().is_none());
    }

    #[test]
    fn double_release_is_invalid_state() {
        let m = manager();
        let lock = m.create_lock(new_lock("INV-1", 150)).unwrap();

        let release = m
            .release_to_vendor(&lock.escrow_id, "vendor_9", Some("ACH-1"))
            .unwrap();
        assert_eq!(release.amount, Usd::from_dollars(150));

        let err = m
            .release_to_vendor(&lock.escrow_id, "vendor_9", Some("ACH-1"))
            .unwrap_err();
        assert!(matches!(
            err,
            EscrowError::InvalidState {
                current: EscrowStatus::Released,
                ..
            }
        ));
        // The original release record is untouched.
        assert_eq!(m.get_release(&lock.escrow_id).unwrap().unwrap(), release);
    }

    #[test]
    fn refund_after_release_fails() {
        let m = manager();
        let lock = m.create_lock(new_lock("INV-1", 40)).unwrap();
        m.release_to_vendor(&lock.escrow_id, "vendor_9", None).unwrap();
        assert!(matches!(
            m.refund_to_business(&lock.escrow_id, "late failure"),
            Err(EscrowError::InvalidState { .. })
        ));
        let stored = m.get_lock(&lock.escrow_id).unwrap().unwrap();
        assert_eq!(stored.status, EscrowStatus::Released);
    }

    #[test]
    fn refund_records_reason() {
        let m = manager();
        let lock = m.create_lock(new_lock("INV-1", 40)).unwrap();
        assert!(m.refund_to_business(&lock.escrow_id, "card declined").unwrap());
        let stored = m.get_lock(&lock.escrow_id).unwrap().unwrap();
        assert_eq!(stored.status, EscrowStatus::Refunded);
        assert_eq!(stored.refund_reason.as_deref(), Some("card declined"));
        assert!(m.get_release(&lock.escrow_id).unwrap().is_none());
    }

    #[test]
    fn unknown_escrow_is_not_found() {
        let m = manager();
        assert!(matches!(
            m.release_to_vendor("escrow_missing", "v", None),
            Err(EscrowError::NotFound(_))
        ));
    }

    #[test]
    fn claim_excludes_other_settlements() {
        let m = manager();
        let lock = m.create_lock(new_lock("INV-1", 40)).unwrap();
        let claim = m.claim(&lock.escrow_id).unwrap();
        assert!(matches!(
            m.refund_to_business(&lock.escrow_id, "race"),
            Err(EscrowError::SettlementInProgress(_))
        ));
        m.release_claimed(&claim, "vendor_9", None, None).unwrap();
        drop(claim);
        assert!(matches!(
            m.claim(&lock.escrow_id),
            Err(EscrowError::InvalidState { .. })
        ));
    }

    #[test]
    fn settlement_revokes_token_record() {
        let m = manager();
        let lock = m.create_lock(new_lock("INV-1", 40)).unwrap();
        m.db
            .tokens
            .insert(lock.token_digest.as_bytes(), b"live".to_vec())
            .unwrap();
        m.refund_to_business(&lock.escrow_id, "cancelled").unwrap();
        assert!(m.db.tokens.get(lock.token_digest.as_bytes()).unwrap().is_none());
    }

    #[test]
    fn expiry_sweep_is_idempotent() {
        let m = manager();
        let old = m
            .create_lock(NewLock {
                ttl: Some(Duration::hours(1)),
                ..new_lock("INV-OLD", 10)
            })
            .unwrap();
        let fresh = m.create_lock(new_lock("INV-NEW", 10)).unwrap();

        let later = Utc::now() + Duration::hours(2);
        assert_eq!(m.expire_old_locks(later).unwrap(), 1);
        assert_eq!(m.expire_old_locks(later).unwrap(), 0);

        assert_eq!(
            m.get_lock(&old.escrow_id).unwrap().unwrap().status,
            EscrowStatus::Expired
        );
        assert_eq!(
            m.get_lock(&fresh.escrow_id).unwrap().unwrap().status,
            EscrowStatus::Locked
        );
        assert!(matches!(
            m.release_to_vendor(&old.escrow_id, "v", None),
            Err(EscrowError::InvalidState {
                current: EscrowStatus::Expired,
                ..
            })
        ));
    }

    #[test]
    fn sweep_skips_claimed_locks() {
        let m = manager();
        let lock = m
            .create_lock(NewLock {
                ttl: Some(Duration::seconds(1)),
                ..new_lock("INV-1", 10)
            })
            .unwrap();
        let claim = m.claim(&lock.escrow_id).unwrap();
        let later = Utc::now() + Duration::minutes(1);
        assert_eq!(m.expire_old_locks(later).unwrap(), 0);
        drop(claim);
        assert_eq!(m.expire_old_locks(later).unwrap(), 1);
    }

    #[test]
    fn stats_and_business_listing() {
        let m = manager();
        let a = m.create_lock(new_lock("INV-A", 100)).unwrap();
        let b = m.create_lock(new_lock("INV-B", 50)).unwrap();
        m.create_lock(new_lock("INV-C", 25)).unwrap();
        m.release_to_vendor(&a.escrow_id, "v", None).unwrap();
        m.refund_to_business(&b.escrow_id, "nope").unwrap();

        let stats = m.get_stats().unwrap();
        assert_eq!(stats.total_locks, 3);
        assert_eq!((stats.locked, stats.released, stats.refunded), (1, 1, 1));
        assert_eq!(stats.total_locked, Usd::from_dollars(25));
        assert_eq!(stats.total_released, Usd::from_dollars(100));
        assert_eq!(stats.total_refunded, Usd::from_dollars(50));

        assert_eq!(m.get_business_escrows("biz_1").unwrap().len(), 3);
        assert!(m.get_business_escrows("biz_2").unwrap().is_empty());
    }

    #[test]
    fn concurrent_release_and_refund_settle_once() {
        let m = Arc::new(manager());
        let lock = m.create_lock(new_lock("INV-1", 150)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let m = Arc::clone(&m);
                let id = lock.escrow_id.clone();
                std::thread::spawn(move || {
                    if i % 2 == 0 {
                        m.release_to_vendor(&id, "vendor_9", None).is_ok()
                    } else {
                        m.refund_to_business(&id, "race").is_ok()
                    }
                })
            })
            .collect();
        let wins = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(wins, 1);
        assert!(m.get_lock(&lock.escrow_id).unwrap().unwrap().status.is_terminal());
    }
}
