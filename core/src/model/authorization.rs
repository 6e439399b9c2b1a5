//! Request, response and policy types for the authorization flow.
//!
//! These are the shapes an outer HTTP layer puts on the wire, so every type
//! here is `serde`-serializable. Responses are also persisted (bincode) in
//! the authorization tree, which is why nothing below uses
//! `skip_serializing_if` or internally-tagged enums: bincode needs every
//! field present and every enum externally tagged.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::money::{self, Usd};
use crate::config::{
    DEFAULT_DAILY_LIMIT_CENTS, DEFAULT_PER_TRANSACTION_MAX_CENTS, DEFAULT_WEEKLY_LIMIT_CENTS,
    SUPPORTED_CURRENCY,
};

// ---------------------------------------------------------------------------
// Invoice
// ---------------------------------------------------------------------------

/// One line of an invoice. Informational; policy only looks at the total.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineItem {
    pub description: String,
    pub quantity: u32,
    pub amount: Usd,
}

/// A bill to pay. Immutable once handed to the authorizer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invoice {
    pub invoice_id: String,
    pub payee_name: String,
    #[serde(default)]
    pub payee_id: Option<String>,
    pub amount: Usd,
    #[serde(default = "default_currency")]
    pub currency: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Due date as `YYYY-MM-DD`, when the payee supplied one.
    #[serde(default)]
    pub due_date: Option<String>,
    #[serde(default)]
    pub payment_url: Option<String>,
    #[serde(default)]
    pub line_items: Vec<LineItem>,
}

fn default_currency() -> String {
    SUPPORTED_CURRENCY.to_string()
}

impl Invoice {
    /// A USD invoice with only the required fields set.
    pub fn new(invoice_id: impl Into<String>, payee_name: impl Into<String>, amount: Usd) -> Self {
        Self {
            invoice_id: invoice_id.into(),
            payee_name: payee_name.into(),
            payee_id: None,
            amount,
            currency: default_currency(),
            description: None,
            due_date: None,
            payment_url: None,
            line_items: Vec::new(),
        }
    }

    pub fn with_payee_id(mut self, payee_id: impl Into<String>) -> Self {
        self.payee_id = Some(payee_id.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_line_item(mut self, item: LineItem) -> Self {
        self.line_items.push(item);
        self
    }
}

// ---------------------------------------------------------------------------
// Spending Policy
// ---------------------------------------------------------------------------

/// Budget guardrails applied to every authorization.
///
/// Amounts are written as decimal strings in config files
/// (`daily_limit = "2000.00"`), hence the `decimal` adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpendingPolicy {
    #[serde(with = "money::decimal")]
    pub per_transaction_max: Usd,
    #[serde(with = "money::decimal")]
    pub daily_limit: Usd,
    #[serde(with = "money::decimal")]
    pub weekly_limit: Usd,
}

impl Default for SpendingPolicy {
    fn default() -> Self {
        Self {
            per_transaction_max: Usd::from_cents(DEFAULT_PER_TRANSACTION_MAX_CENTS),
            daily_limit: Usd::from_cents(DEFAULT_DAILY_LIMIT_CENTS),
            weekly_limit: Usd::from_cents(DEFAULT_WEEKLY_LIMIT_CENTS),
        }
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

fn new_request_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// A request for permission to pay one invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationRequest {
    /// Idempotency key. Generated when the caller doesn't supply one.
    #[serde(default = "new_request_id")]
    pub request_id: String,
    pub invoice: Invoice,
    pub budget_total: Usd,
    pub budget_remaining: Usd,
}

impl AuthorizationRequest {
    pub fn new(invoice: Invoice, budget_total: Usd, budget_remaining: Usd) -> Self {
        Self {
            request_id: new_request_id(),
            invoice,
            budget_total,
            budget_remaining,
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}

// ---------------------------------------------------------------------------
// Status & Reasons
// ---------------------------------------------------------------------------

/// Lifecycle of an authorization as reported to the outside world.
///
/// `authorize` itself only ever produces `Authorized` or `Rejected`; the
/// rest are for the execution layer's own status reporting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuthorizationStatus {
    Pending,
    Authorized,
    Rejected,
    Expired,
    Executed,
}

impl fmt::Display for AuthorizationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AuthorizationStatus::Pending => "PENDING",
            AuthorizationStatus::Authorized => "AUTHORIZED",
            AuthorizationStatus::Rejected => "REJECTED",
            AuthorizationStatus::Expired => "EXPIRED",
            AuthorizationStatus::Executed => "EXECUTED",
        };
        f.write_str(s)
    }
}

/// Machine-readable cause of a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    InvalidRequest,
    PerTransactionLimit,
    DailyLimit,
    WeeklyLimit,
    BudgetExceeded,
    Duplicate,
    WalletError,
    WalletTimeout,
}

impl RejectionReason {
    /// Policy violations are final; upstream failures are worth a retry.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            RejectionReason::WalletError | RejectionReason::WalletTimeout
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RejectionReason::InvalidRequest => "invalid_request",
            RejectionReason::PerTransactionLimit => "per_transaction_limit",
            RejectionReason::DailyLimit => "daily_limit",
            RejectionReason::WeeklyLimit => "weekly_limit",
            RejectionReason::BudgetExceeded => "budget_exceeded",
            RejectionReason::Duplicate => "duplicate",
            RejectionReason::WalletError => "wallet_error",
            RejectionReason::WalletTimeout => "wallet_timeout",
        }
    }
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Policy Check Details
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerTransactionCheck {
    pub limit: Usd,
    pub amount: Usd,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyLimitCheck {
    pub limit: Usd,
    pub spent_today: Usd,
    pub new_total: Usd,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeeklyLimitCheck {
    pub limit: Usd,
    pub spent_this_week: Usd,
    pub new_total: Usd,
    pub passed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BudgetCheck {
    pub total_budget: Usd,
    pub remaining: Usd,
    pub amount: Usd,
    pub passed: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DuplicateCheck {
    pub invoice_id: String,
    pub passed: bool,
}

/// Per-check breakdown, in evaluation order. A check that never ran
/// because an earlier one failed is `None`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyChecks {
    pub per_transaction: Option<PerTransactionCheck>,
    pub daily_limit: Option<DailyLimitCheck>,
    pub weekly_limit: Option<WeeklyLimitCheck>,
    pub budget: Option<BudgetCheck>,
    pub duplicate: Option<DuplicateCheck>,
}

impl PolicyChecks {
    /// True only when every check ran and passed.
    pub fn all_passed(&self) -> bool {
        self.per_transaction.is_some_and(|c| c.passed)
            && self.daily_limit.is_some_and(|c| c.passed)
            && self.weekly_limit.is_some_and(|c| c.passed)
            && self.budget.is_some_and(|c| c.passed)
            && self.duplicate.as_ref().is_some_and(|c| c.passed)
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// Outcome of one `authorize` call.
///
/// Created once and never mutated. The copy kept in the store has
/// `auth_token` cleared; only the caller of `authorize` ever sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationResponse {
    pub request_id: String,
    pub invoice_id: String,
    pub status: AuthorizationStatus,
    pub reason: Option<RejectionReason>,
    pub auth_token: Option<String>,
    pub escrow_id: Option<String>,
    pub tx_reference: Option<String>,
    pub explorer_url: Option<String>,
    pub amount_authorized: Option<Usd>,
    pub escrow_address: Option<String>,
    pub error: Option<String>,
    pub policy_checks: PolicyChecks,
    pub timestamp: DateTime<Utc>,
}

impl AuthorizationResponse {
    /// A rejection carrying whatever checks ran before it.
    pub fn rejected(
        request: &AuthorizationRequest,
        reason: RejectionReason,
        error: impl Into<String>,
        policy_checks: PolicyChecks,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            request_id: request.request_id.clone(),
            invoice_id: request.invoice.invoice_id.clone(),
            status: AuthorizationStatus::Rejected,
            reason: Some(reason),
            auth_token: None,
            escrow_id: None,
            tx_reference: None,
            explorer_url: None,
            amount_authorized: None,
            escrow_address: None,
            error: Some(error.into()),
            policy_checks,
            timestamp: now,
        }
    }

    pub fn is_authorized(&self) -> bool {
        self.status == AuthorizationStatus::Authorized
    }

    /// Copy with the bearer token stripped, for persistence and display.
    pub fn redacted(&self) -> Self {
        Self {
            auth_token: None,
            ..self.clone()
        }
    }
}

// ---------------------------------------------------------------------------
// Spending Summary
// ---------------------------------------------------------------------------

/// Spend against the current accounting periods.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpendingSummary {
    /// UTC date of the daily window, `YYYY-MM-DD`.
    pub day: String,
    /// ISO week of the weekly window, `YYYY-Www`.
    pub week: String,
    pub today_spent: Usd,
    pub daily_limit: Usd,
    pub daily_remaining: Usd,
    pub weekly_spent: Usd,
    pub weekly_limit: Usd,
    pub weekly_remaining: Usd,
}

// ---------------------------------------------------------------------------
// Redemption
// ---------------------------------------------------------------------------

/// How the execution layer intends to move the money.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    StripeCard,
    StripeAch,
    MockAch,
    MockCard,
    BrowserbaseAch,
}

impl fmt::Display for PaymentMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PaymentMethod::StripeCard => "stripe_card",
            PaymentMethod::StripeAch => "stripe_ach",
            PaymentMethod::MockAch => "mock_ach",
            PaymentMethod::MockCard => "mock_card",
            PaymentMethod::BrowserbaseAch => "browserbase_ach",
        };
        f.write_str(s)
    }
}

/// A payment executor presenting its token to redeem an authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRequest {
    pub auth_token: String,
    pub invoice_id: String,
    pub amount: Usd,
    pub payee_name: String,
    pub method: PaymentMethod,
}

/// Proof that a token was redeemed exactly once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Redemption {
    pub invoice_id: String,
    pub escrow_id: Option<String>,
    pub amount: Usd,
    pub method: PaymentMethod,
    pub redeemed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> AuthorizationRequest {
        AuthorizationRequest::new(
            Invoice::new("INV-1", "Sysco", Usd::from_dollars(100)),
            Usd::from_dollars(1000),
            Usd::from_dollars(1000),
        )
    }

    #[test]
    fn request_ids_are_generated_and_unique() {
        let a = request();
        let b = request();
        assert!(!a.request_id.is_empty());
        assert_ne!(a.request_id, b.request_id);
        assert_eq!(a.clone().with_request_id("fixed").request_id, "fixed");
    }

    #[test]
    fn request_id_defaults_when_missing_from_json() {
        let json = r#"{
            "invoice": {"invoice_id": "INV-9", "payee_name": "Acme", "amount": 2500},
            "budget_total": 100000,
            "budget_remaining": 50000
        }"#;
        let req: AuthorizationRequest = serde_json::from_str(json).unwrap();
        assert!(!req.request_id.is_empty());
        assert_eq!(req.invoice.currency, "USD");
        assert_eq!(req.invoice.amount, Usd::from_dollars(25));
        assert!(req.invoice.line_items.is_empty());
    }

    #[test]
    fn rejected_response_shape() {
        let req = request();
        let resp = AuthorizationResponse::rejected(
            &req,
            RejectionReason::DailyLimit,
            "Would exceed daily limit: $1100.00 > $1000.00",
            PolicyChecks::default(),
            Utc::now(),
        );
        assert_eq!(resp.status, AuthorizationStatus::Rejected);
        assert!(!resp.is_authorized());
        assert!(resp.auth_token.is_none());
        assert_eq!(resp.invoice_id, "INV-1");
        assert!(!resp.policy_checks.all_passed());
    }

    #[test]
    fn redaction_strips_only_the_token() {
        let req = request();
        let mut resp = AuthorizationResponse::rejected(
            &req,
            RejectionReason::Duplicate,
            "x",
            PolicyChecks::default(),
            Utc::now(),
        );
        resp.auth_token = Some("x402_secret".into());
        let redacted = resp.redacted();
        assert!(redacted.auth_token.is_none());
        assert_eq!(redacted.request_id, resp.request_id);
        assert_eq!(redacted.error, resp.error);
    }

    #[test]
    fn response_survives_bincode() {
        let req = request();
        let mut checks = PolicyChecks::default();
        checks.per_transaction = Some(PerTransactionCheck {
            limit: Usd::from_dollars(500),
            amount: Usd::from_dollars(100),
            passed: true,
        });
        let resp = AuthorizationResponse::rejected(
            &req,
            RejectionReason::WalletTimeout,
            "timed out",
            checks,
            Utc::now(),
        );
        let bytes = bincode::serialize(&resp).unwrap();
        let back: AuthorizationResponse = bincode::deserialize(&bytes).unwrap();
        assert_eq!(back, resp);
    }

    #[test]
    fn status_and_reason_wire_names() {
        assert_eq!(
            serde_json::to_string(&AuthorizationStatus::Authorized).unwrap(),
            "\"AUTHORIZED\""
        );
        assert_eq!(
            serde_json::to_string(&RejectionReason::PerTransactionLimit).unwrap(),
            "\"per_transaction_limit\""
        );
        assert_eq!(RejectionReason::BudgetExceeded.to_string(), "budget_exceeded");
        assert!(RejectionReason::WalletTimeout.is_retryable());
        assert!(!RejectionReason::Duplicate.is_retryable());
    }

    #[test]
    fn policy_defaults() {
        let p = SpendingPolicy::default();
        assert_eq!(p.per_transaction_max, Usd::from_dollars(500));
        assert_eq!(p.daily_limit, Usd::from_dollars(2000));
        assert_eq!(p.weekly_limit, Usd::from_dollars(5000));
    }
}
