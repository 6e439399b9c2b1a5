//! # Authorizer
//!
//! Decides whether an agent may pay an invoice and, if so, commits the
//! money before anyone touches a card or a bank form.
//!
//! ## Flow
//!
//! ```text
//! authorize(request)
//!   ├─ validate shape                          → REJECTED invalid_request
//!   ├─ ┌ ledger mutex ─────────────────────────┐
//!   │  │ committed spend (sled) + reservations │
//!   │  │ per-tx → daily → weekly → budget → dup│ → REJECTED <first failure>
//!   │  │ reserve amount, mark invoice in flight│
//!   │  └───────────────────────────────────────┘
//!   ├─ wallet.transfer_to_escrow (timeout)     → REJECTED wallet_error|wallet_timeout
//!   ├─ escrow.create_lock ─────────────────────→ err: return funds to payer
//!   ├─ mint token
//!   └─ ┌ ledger mutex ─────────────────────────┐
//!      │ one sled transaction: spend counters, │ err: refund lock,
//!      │ token digest, response, invoice index │      return funds to payer
//!      │ drop reservation                      │
//!      └───────────────────────────────────────┘
//! ```
//!
//! Funds that reached escrow for an authorization that failed to record
//! are sent back with a `REVERSAL:` memo. If that transfer fails too, a
//! [`StrandedFunds`] entry is written so an operator can reconcile it.
//!
//! The wallet call is the only await. Everything that reads or writes the
//! spend accumulators happens under the ledger mutex, so two concurrent
//! requests can never both fit under the same remaining limit.

mod policy;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult, Transactional};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::config::{AUTH_MEMO_PREFIX, RELEASE_MEMO_PREFIX, REVERSAL_MEMO_PREFIX};
use crate::crypto::{mint_token, token_digest};
use crate::escrow::{EscrowError, EscrowLock, EscrowManager, EscrowRelease, EscrowStatus, NewLock};
use crate::model::{
    AuthorizationRequest, AuthorizationResponse, AuthorizationStatus, PaymentRequest,
    PolicyChecks, Redemption, RejectionReason, SpendingPolicy, SpendingSummary, Usd,
};
use crate::storage::db::{decode, decode_str, decode_u64, encode};
use crate::storage::{StoreError, StoreResult, X402Db};
use crate::vault::TokenVerifier;
use crate::wallet::{TransferReceipt, WalletClient, WalletError};

use self::policy::WindowSpend;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Hard failures. Policy and wallet rejections are *not* errors; they come
/// back as a `REJECTED` response.
#[derive(Debug, Error)]
pub enum AuthorizerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    /// Payout during a crypto-native release failed. The escrow is still
    /// `LOCKED` and the release may be retried.
    #[error(transparent)]
    Wallet(#[from] WalletError),

    #[error("no escrow is bound to this authorization token")]
    UnknownToken,
}

/// Why a payment request could not redeem its token.
#[derive(Debug, Error)]
pub enum RedemptionError {
    /// Unknown, already redeemed, or revoked by settlement.
    #[error("authorization token is invalid or already used")]
    InvalidToken,

    #[error("authorization token is not valid for invoice {invoice_id}")]
    InvoiceMismatch { invoice_id: String },

    #[error("payment of {requested} exceeds authorized amount {authorized}")]
    AmountExceedsAuthorization { requested: Usd, authorized: Usd },

    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// ---------------------------------------------------------------------------
// Token Records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TokenState {
    /// Minted, not yet presented.
    Live,
    /// Presented once. Still verifiable until its escrow settles.
    Redeemed,
}

/// What a token digest maps to in the `tokens` tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRecord {
    pub invoice_id: String,
    pub escrow_id: String,
    pub state: TokenState,
    pub redeemed_at: Option<DateTime<Utc>>,
}

/// Escrow funding that could not be returned after its authorization failed
/// to record. Keyed by the funding transaction in the `stranded_funds` tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StrandedFunds {
    pub invoice_id: String,
    pub request_id: String,
    /// Set when the lock was written before the failure.
    pub escrow_id: Option<String>,
    pub amount: Usd,
    pub funding_tx_reference: String,
    /// The store failure that aborted the authorization.
    pub cause: String,
    /// Why the return transfer failed.
    pub return_error: String,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// In-memory view of authorizations that passed policy but have not yet
/// committed. The store holds everything else.
#[derive(Debug, Default)]
struct Ledger {
    reserved: HashMap<String, Usd>,
    invoices: HashSet<String>,
    requests: HashSet<String>,
}

#[derive(Debug)]
struct Reservation {
    day_key: String,
    week_key: String,
    amount: Usd,
    invoice_id: String,
    request_id: String,
}

impl Ledger {
    fn reserved(&self, window: &str) -> Usd {
        self.reserved.get(window).copied().unwrap_or(Usd::ZERO)
    }

    fn reserve(&mut self, r: &Reservation) {
        for key in [&r.day_key, &r.week_key] {
            let slot = self.reserved.entry(key.clone()).or_insert(Usd::ZERO);
            *slot = slot.saturating_add(r.amount);
        }
        self.invoices.insert(r.invoice_id.clone());
        self.requests.insert(r.request_id.clone());
    }

    fn release(&mut self, r: &Reservation) {
        for key in [&r.day_key, &r.week_key] {
            if let Some(slot) = self.reserved.get_mut(key) {
                *slot = slot.saturating_sub(r.amount);
                if slot.is_zero() {
                    self.reserved.remove(key);
                }
            }
        }
        self.invoices.remove(&r.invoice_id);
        self.requests.remove(&r.request_id);
    }
}

/// Drops its reservation unless settled, including when the authorize
/// future is cancelled mid-transfer.
struct ReservationGuard<'a> {
    ledger: &'a Mutex<Ledger>,
    reservation: Option<Reservation>,
}

impl ReservationGuard<'_> {
    /// Release under a ledger lock the caller already holds.
    fn settle(mut self, ledger: &mut Ledger) {
        if let Some(r) = self.reservation.take() {
            ledger.release(&r);
        }
    }
}

impl Drop for ReservationGuard<'_> {
    fn drop(&mut self) {
        if let Some(r) = self.reservation.take() {
            self.ledger.lock().release(&r);
        }
    }
}

// ---------------------------------------------------------------------------
// Authorizer
// ---------------------------------------------------------------------------

pub struct Authorizer {
    db: X402Db,
    policy: SpendingPolicy,
    payer_id: String,
    escrow: Arc<EscrowManager>,
    wallet: Arc<dyn WalletClient>,
    wallet_timeout: Duration,
    ledger: Mutex<Ledger>,
}

impl Authorizer {
    pub fn new(
        db: X402Db,
        policy: SpendingPolicy,
        escrow: Arc<EscrowManager>,
        wallet: Arc<dyn WalletClient>,
    ) -> Self {
        Self {
            db,
            policy,
            payer_id: "default".to_string(),
            escrow,
            wallet,
            wallet_timeout: Duration::from_secs(crate::config::DEFAULT_WALLET_TIMEOUT_SECS),
            ledger: Mutex::new(Ledger::default()),
        }
    }

    /// Business whose funds this authorizer commits.
    pub fn with_payer_id(mut self, payer_id: impl Into<String>) -> Self {
        self.payer_id = payer_id.into();
        self
    }

    pub fn with_wallet_timeout(mut self, timeout: Duration) -> Self {
        self.wallet_timeout = timeout;
        self
    }

    pub fn policy(&self) -> &SpendingPolicy {
        &self.policy
    }

    pub fn escrow(&self) -> &Arc<EscrowManager> {
        &self.escrow
    }

    pub fn wallet(&self) -> &Arc<dyn WalletClient> {
        &self.wallet
    }

    // -----------------------------------------------------------------------
    // Authorize
    // -----------------------------------------------------------------------

    pub async fn authorize(
        &self,
        request: AuthorizationRequest,
    ) -> Result<AuthorizationResponse, AuthorizerError> {
        self.authorize_at(request, Utc::now()).await
    }

    /// [`authorize`](Self::authorize) with an explicit clock, which picks
    /// the daily and weekly windows.
    pub async fn authorize_at(
        &self,
        request: AuthorizationRequest,
        now: DateTime<Utc>,
    ) -> Result<AuthorizationResponse, AuthorizerError> {
        if let Err(message) = policy::validate_request(&request) {
            return self.reject(
                &request,
                RejectionReason::InvalidRequest,
                message,
                PolicyChecks::default(),
                now,
            );
        }

        let amount = request.invoice.amount;
        let day_key = policy::day_key(now);
        let week_key = policy::week_key(now);

        let (checks, guard) = {
            let mut ledger = self.ledger.lock();
            let spent = WindowSpend {
                today: self.committed(&day_key)?.saturating_add(ledger.reserved(&day_key)),
                this_week: self
                    .committed(&week_key)?
                    .saturating_add(ledger.reserved(&week_key)),
            };
            let outcome = policy::evaluate(&self.policy, &request, spent, || {
                self.is_duplicate(&ledger, &request)
            })?;
            match outcome {
                Err(rejection) => {
                    drop(ledger);
                    return self.reject(
                        &request,
                        rejection.reason,
                        rejection.message,
                        rejection.checks,
                        now,
                    );
                }
                Ok(checks) => {
                    let reservation = Reservation {
                        day_key: day_key.clone(),
                        week_key: week_key.clone(),
                        amount,
                        invoice_id: request.invoice.invoice_id.clone(),
                        request_id: request.request_id.clone(),
                    };
                    ledger.reserve(&reservation);
                    let guard = ReservationGuard {
                        ledger: &self.ledger,
                        reservation: Some(reservation),
                    };
                    (checks, guard)
                }
            }
        };

        let memo = format!("{AUTH_MEMO_PREFIX}{}", request.invoice.invoice_id);
        let transfer = tokio::time::timeout(
            self.wallet_timeout,
            self.wallet.transfer_to_escrow(amount, &memo),
        )
        .await;
        let receipt = match transfer {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(err)) => {
                drop(guard);
                let reason = if err.is_timeout() {
                    RejectionReason::WalletTimeout
                } else {
                    RejectionReason::WalletError
                };
                return self.reject(&request, reason, err.to_string(), checks, now);
            }
            Err(_) => {
                drop(guard);
                let err = WalletError::Timeout(self.wallet_timeout);
                return self.reject(
                    &request,
                    RejectionReason::WalletTimeout,
                    err.to_string(),
                    checks,
                    now,
                );
            }
        };

        let token = mint_token();
        let digest = token_digest(&token);
        let lock = self
            .escrow
            .create_lock(NewLock {
                invoice_id: request.invoice.invoice_id.clone(),
                payer_id: self.payer_id.clone(),
                payee_id: request.invoice.payee_id.clone(),
                amount,
                funding: receipt.clone(),
                token_digest: digest.clone(),
                ttl: None,
            });
        let lock = match lock {
            Ok(lock) => lock,
            Err(err) => {
                error!(
                    invoice_id = %request.invoice.invoice_id,
                    tx_reference = %receipt.tx_reference,
                    error = %err,
                    "funds reached escrow but the lock could not be recorded"
                );
                drop(guard);
                self.return_funding(&request, &receipt, None, &err.to_string())
                    .await;
                return Err(err.into());
            }
        };

        let response = AuthorizationResponse {
            request_id: request.request_id.clone(),
            invoice_id: request.invoice.invoice_id.clone(),
            status: AuthorizationStatus::Authorized,
            reason: None,
            auth_token: Some(token),
            escrow_id: Some(lock.escrow_id.clone()),
            tx_reference: Some(receipt.tx_reference.clone()),
            explorer_url: Some(receipt.explorer_url.clone()),
            amount_authorized: Some(amount),
            escrow_address: Some(receipt.escrow_address.clone()),
            error: None,
            policy_checks: checks,
            timestamp: now,
        };
        let record = TokenRecord {
            invoice_id: request.invoice.invoice_id.clone(),
            escrow_id: lock.escrow_id.clone(),
            state: TokenState::Live,
            redeemed_at: None,
        };

        let committed = {
            let mut ledger = self.ledger.lock();
            let result = self.commit(&response, &record, &digest, &day_key, &week_key, amount);
            guard.settle(&mut ledger);
            result
        };
        if let Err(err) = committed {
            error!(
                escrow_id = %lock.escrow_id,
                error = %err,
                "authorization commit failed, refunding escrow"
            );
            if let Err(refund_err) = self
                .escrow
                .refund_to_business(&lock.escrow_id, "authorization commit failed")
            {
                error!(escrow_id = %lock.escrow_id, error = %refund_err, "compensating refund failed");
            }
            self.return_funding(&request, &receipt, Some(&lock.escrow_id), &err.to_string())
                .await;
            return Err(err.into());
        }

        info!(
            request_id = %response.request_id,
            invoice_id = %response.invoice_id,
            escrow_id = %lock.escrow_id,
            amount = %amount,
            tx_reference = %receipt.tx_reference,
            "payment authorized"
        );
        Ok(response)
    }

    /// Send a funding transfer back to the payer after its authorization
    /// failed to record. A failed return leaves a [`StrandedFunds`] entry.
    async fn return_funding(
        &self,
        request: &AuthorizationRequest,
        funding: &TransferReceipt,
        escrow_id: Option<&str>,
        cause: &str,
    ) {
        let memo = format!("{REVERSAL_MEMO_PREFIX}{}", request.invoice.invoice_id);
        let outcome = tokio::time::timeout(
            self.wallet_timeout,
            self.wallet.return_to_payer(funding.amount, &memo),
        )
        .await
        .unwrap_or(Err(WalletError::Timeout(self.wallet_timeout)));

        let return_error = match outcome {
            Ok(returned) => {
                warn!(
                    invoice_id = %request.invoice.invoice_id,
                    funding_tx = %funding.tx_reference,
                    return_tx = %returned.tx_reference,
                    amount = %funding.amount,
                    "escrow funding returned to payer"
                );
                return;
            }
            Err(err) => err,
        };

        let stranded = StrandedFunds {
            invoice_id: request.invoice.invoice_id.clone(),
            request_id: request.request_id.clone(),
            escrow_id: escrow_id.map(str::to_string),
            amount: funding.amount,
            funding_tx_reference: funding.tx_reference.clone(),
            cause: cause.to_string(),
            return_error: return_error.to_string(),
            recorded_at: Utc::now(),
        };
        error!(
            invoice_id = %stranded.invoice_id,
            funding_tx = %stranded.funding_tx_reference,
            amount = %stranded.amount,
            error = %return_error,
            "escrow funding could not be returned; recorded as stranded"
        );
        let written = encode(&stranded).and_then(|bytes| {
            self.db
                .stranded_funds
                .insert(stranded.funding_tx_reference.as_bytes(), bytes)?;
            self.db.flush()
        });
        if let Err(e) = written {
            error!(
                funding_tx = %stranded.funding_tx_reference,
                error = %e,
                "failed to record stranded funds"
            );
        }
    }

    /// Funding transfers that reached escrow, failed to authorize, and could
    /// not be returned. Each needs manual reconciliation.
    pub fn stranded_funds(&self) -> Result<Vec<StrandedFunds>, AuthorizerError> {
        Ok(self.db.scan(&self.db.stranded_funds)?)
    }

    fn committed(&self, window_key: &str) -> StoreResult<Usd> {
        let raw = self.db.spending.get(window_key.as_bytes())?;
        Ok(Usd::from_cents(decode_u64("spending", raw.as_deref())?))
    }

    fn is_duplicate(
        &self,
        ledger: &Ledger,
        request: &AuthorizationRequest,
    ) -> Result<bool, AuthorizerError> {
        let invoice_id = &request.invoice.invoice_id;
        if ledger.invoices.contains(invoice_id) || ledger.requests.contains(&request.request_id) {
            return Ok(true);
        }
        if let Some(previous) = self.load_response(&request.request_id)? {
            if previous.is_authorized() {
                return Ok(true);
            }
        }

        let Some(raw) = self
            .db
            .authorized_invoices
            .get(invoice_id.as_bytes())
            .map_err(StoreError::from)?
        else {
            return Ok(false);
        };
        let prior_request = decode_str("authorized_invoices", &raw)?;
        let Some(prior) = self.load_response(&prior_request)? else {
            return Ok(false);
        };
        let Some(escrow_id) = prior.escrow_id.as_deref() else {
            return Ok(true);
        };
        // A refunded or expired escrow frees the invoice for another attempt.
        Ok(match self.escrow.get_lock(escrow_id)? {
            Some(lock) => !matches!(lock.status, EscrowStatus::Refunded | EscrowStatus::Expired),
            None => true,
        })
    }

    fn commit(
        &self,
        response: &AuthorizationResponse,
        record: &TokenRecord,
        digest: &str,
        day_key: &str,
        week_key: &str,
        amount: Usd,
    ) -> StoreResult<()> {
        let stored = encode(&response.redacted())?;
        let token_bytes = encode(record)?;

        (
            &self.db.spending,
            &self.db.tokens,
            &self.db.authorizations,
            &self.db.authorized_invoices,
        )
            .transaction(
                |(spending, tokens, authorizations, invoices)| -> ConflictableTransactionResult<
                    (),
                    StoreError,
                > {
                    for key in [day_key, week_key] {
                        let current = decode_u64("spending", spending.get(key.as_bytes())?.as_deref())
                            .map_err(ConflictableTransactionError::Abort)?;
                        let next = current.saturating_add(amount.cents());
                        spending.insert(key.as_bytes(), next.to_be_bytes().to_vec())?;
                    }
                    tokens.insert(digest.as_bytes(), token_bytes.clone())?;
                    authorizations.insert(response.request_id.as_bytes(), stored.clone())?;
                    invoices.insert(response.invoice_id.as_bytes(), response.request_id.as_bytes())?;
                    Ok(())
                },
            )?;
        Ok(())
    }

    fn reject(
        &self,
        request: &AuthorizationRequest,
        reason: RejectionReason,
        message: String,
        checks: PolicyChecks,
        now: DateTime<Utc>,
    ) -> Result<AuthorizationResponse, AuthorizerError> {
        warn!(
            request_id = %request.request_id,
            invoice_id = %request.invoice.invoice_id,
            amount = %request.invoice.amount,
            reason = %reason,
            "authorization rejected: {message}"
        );
        let response = AuthorizationResponse::rejected(request, reason, message, checks, now);
        if !request.request_id.trim().is_empty() {
            self.store_rejection(&response)?;
        }
        Ok(response)
    }

    /// Persist a rejection unless the request id already holds an
    /// authorized response.
    fn store_rejection(&self, response: &AuthorizationResponse) -> StoreResult<()> {
        let key = response.request_id.as_bytes();
        let bytes = encode(response)?;
        self.db
            .authorizations
            .transaction(|tx| -> ConflictableTransactionResult<(), StoreError> {
                if let Some(raw) = tx.get(key)? {
                    let previous: AuthorizationResponse =
                        decode(&raw).map_err(ConflictableTransactionError::Abort)?;
                    if previous.is_authorized() {
                        return Ok(());
                    }
                }
                tx.insert(key, bytes.clone())?;
                Ok(())
            })?;
        Ok(())
    }

    fn load_response(&self, request_id: &str) -> StoreResult<Option<AuthorizationResponse>> {
        self.db.get(&self.db.authorizations, request_id.as_bytes())
    }

    /// Stored response for a request id. Never contains the token.
    pub fn get_authorization(
        &self,
        request_id: &str,
    ) -> Result<Option<AuthorizationResponse>, AuthorizerError> {
        Ok(self.load_response(request_id)?)
    }

    // -----------------------------------------------------------------------
    // Tokens
    // -----------------------------------------------------------------------

    /// Move a token from live to redeemed and return its invoice id.
    /// `None` for unknown, used or revoked tokens. Exactly one of any number
    /// of concurrent callers gets `Some`.
    pub fn consume_token(&self, token: &str) -> Result<Option<String>, AuthorizerError> {
        match self.take_token(&token_digest(token), |_| Ok(())) {
            Ok(record) => Ok(Some(record.invoice_id)),
            Err(RedemptionError::Store(e)) => Err(e.into()),
            Err(RedemptionError::Escrow(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    /// Redeem a token for a concrete payment. A request for the wrong
    /// invoice or too large an amount leaves the token live.
    pub fn redeem(&self, request: &PaymentRequest) -> Result<Redemption, RedemptionError> {
        let record = self.take_token(&token_digest(&request.auth_token), |record| {
            if record.invoice_id != request.invoice_id {
                return Err(RedemptionError::InvoiceMismatch {
                    invoice_id: request.invoice_id.clone(),
                });
            }
            let lock = self
                .escrow
                .get_lock(&record.escrow_id)?
                .ok_or(RedemptionError::InvalidToken)?;
            if request.amount > lock.amount {
                return Err(RedemptionError::AmountExceedsAuthorization {
                    requested: request.amount,
                    authorized: lock.amount,
                });
            }
            Ok(())
        });

        let record = match record {
            Ok(record) => record,
            Err(err) => {
                warn!(invoice_id = %request.invoice_id, error = %err, "redemption refused");
                return Err(err);
            }
        };
        let redeemed_at = record.redeemed_at.unwrap_or_else(Utc::now);
        info!(
            invoice_id = %record.invoice_id,
            escrow_id = %record.escrow_id,
            amount = %request.amount,
            method = %request.method,
            "authorization token redeemed"
        );
        Ok(Redemption {
            invoice_id: record.invoice_id,
            escrow_id: Some(record.escrow_id),
            amount: request.amount,
            method: request.method,
            redeemed_at,
        })
    }

    fn take_token(
        &self,
        digest: &str,
        check: impl Fn(&TokenRecord) -> Result<(), RedemptionError>,
    ) -> Result<TokenRecord, RedemptionError> {
        loop {
            let Some(raw) = self
                .db
                .tokens
                .get(digest.as_bytes())
                .map_err(StoreError::from)?
            else {
                return Err(RedemptionError::InvalidToken);
            };
            let mut record: TokenRecord = decode(&raw)?;
            if record.state != TokenState::Live {
                return Err(RedemptionError::InvalidToken);
            }
            check(&record)?;

            record.state = TokenState::Redeemed;
            record.redeemed_at = Some(Utc::now());
            let swapped = self
                .db
                .tokens
                .compare_and_swap(digest.as_bytes(), Some(&raw), Some(encode(&record)?))
                .map_err(StoreError::from)?;
            if swapped.is_ok() {
                return Ok(record);
            }
            // Lost a race; re-read and decide again.
        }
    }

    /// The token's record, if it is bound to `invoice_id` and its escrow has
    /// not settled (settlement removes the record).
    fn live_binding(&self, token: &str, invoice_id: &str) -> StoreResult<Option<TokenRecord>> {
        let record: Option<TokenRecord> =
            self.db.get(&self.db.tokens, token_digest(token).as_bytes())?;
        Ok(record.filter(|r| r.invoice_id == invoice_id))
    }

    /// True while the token is bound to `invoice_id` and its escrow has not
    /// settled. Does not consume anything. A store failure reads as `false`;
    /// callers that must tell the two apart go through [`TokenVerifier`].
    pub fn verify_token(&self, token: &str, invoice_id: &str) -> bool {
        match self.live_binding(token, invoice_id) {
            Ok(record) => record.is_some(),
            Err(e) => {
                warn!(error = %e, "token lookup failed during verification");
                false
            }
        }
    }

    // -----------------------------------------------------------------------
    // Settlement
    // -----------------------------------------------------------------------

    fn lock_for_token(&self, token: &str) -> Result<EscrowLock, AuthorizerError> {
        self.escrow
            .get_lock_by_token_digest(&token_digest(token))?
            .ok_or(AuthorizerError::UnknownToken)
    }

    /// Pay out the escrow bound to `token`. With `payee_wallet`, funds are
    /// sent on-chain first while the lock is claimed; without it the payout
    /// already happened elsewhere (ACH, card) and is only recorded.
    pub async fn release_escrow(
        &self,
        token: &str,
        payee_id: &str,
        settlement_reference: Option<&str>,
        payee_wallet: Option<&str>,
    ) -> Result<EscrowRelease, AuthorizerError> {
        let lock = self.lock_for_token(token)?;
        let Some(wallet_address) = payee_wallet else {
            return Ok(self
                .escrow
                .release_to_vendor(&lock.escrow_id, payee_id, settlement_reference)?);
        };

        let claim = self.escrow.claim(&lock.escrow_id)?;
        if let Some(expected) = &claim.lock().payee_id {
            if expected != payee_id {
                return Err(EscrowError::PayeeMismatch {
                    escrow_id: lock.escrow_id.clone(),
                    expected: expected.clone(),
                    provided: payee_id.to_string(),
                }
                .into());
            }
        }

        let memo = format!("{RELEASE_MEMO_PREFIX}{}", lock.invoice_id);
        let payout = match tokio::time::timeout(
            self.wallet_timeout,
            self.wallet
                .release_from_escrow(claim.lock().amount, wallet_address, &memo),
        )
        .await
        {
            Ok(Ok(receipt)) => receipt,
            Ok(Err(err)) => {
                warn!(escrow_id = %lock.escrow_id, error = %err, "escrow payout failed");
                return Err(err.into());
            }
            Err(_) => {
                warn!(escrow_id = %lock.escrow_id, "escrow payout timed out");
                return Err(WalletError::Timeout(self.wallet_timeout).into());
            }
        };

        Ok(self
            .escrow
            .release_claimed(&claim, payee_id, settlement_reference, Some(payout))?)
    }

    /// Return the escrow bound to `token` to the payer.
    pub fn refund_escrow(&self, token: &str, reason: &str) -> Result<bool, AuthorizerError> {
        let lock = self.lock_for_token(token)?;
        Ok(self.escrow.refund_to_business(&lock.escrow_id, reason)?)
    }

    // -----------------------------------------------------------------------
    // Reporting
    // -----------------------------------------------------------------------

    pub fn spending_summary(&self) -> Result<SpendingSummary, AuthorizerError> {
        self.spending_summary_at(Utc::now())
    }

    /// Committed spend in the windows containing `now`.
    pub fn spending_summary_at(&self, now: DateTime<Utc>) -> Result<SpendingSummary, AuthorizerError> {
        let today_spent = self.committed(&policy::day_key(now))?;
        let weekly_spent = self.committed(&policy::week_key(now))?;
        Ok(SpendingSummary {
            day: policy::day_label(now),
            week: policy::week_label(now),
            today_spent,
            daily_limit: self.policy.daily_limit,
            daily_remaining: self.policy.daily_limit.saturating_sub(today_spent),
            weekly_spent,
            weekly_limit: self.policy.weekly_limit,
            weekly_remaining: self.policy.weekly_limit.saturating_sub(weekly_spent),
        })
    }
}

/// A token unlocks credentials only for the business whose funds back it.
impl TokenVerifier for Authorizer {
    fn verify_token_for(
        &self,
        token: &str,
        invoice_id: &str,
        owner_id: &str,
    ) -> Result<bool, StoreError> {
        let Some(record) = self.live_binding(token, invoice_id)? else {
            return Ok(false);
        };
        let lock: Option<EscrowLock> =
            self.db.get(&self.db.escrow_locks, record.escrow_id.as_bytes())?;
        Ok(lock.is_some_and(|lock| lock.payer_id == owner_id))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
