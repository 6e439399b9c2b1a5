//! # Shared Data Model
//!
//! Plain data types passed between the authorizer, the escrow manager and
//! whatever HTTP layer sits in front of them.

pub mod authorization;
pub mod money;

pub use authorization::{
    AuthorizationRequest, AuthorizationResponse, AuthorizationStatus, BudgetCheck,
    DailyLimitCheck, DuplicateCheck, Invoice, LineItem, PaymentMethod, PaymentRequest,
    PerTransactionCheck, PolicyChecks, Redemption, RejectionReason, SpendingPolicy,
    SpendingSummary, WeeklyLimitCheck,
};
pub use money::{ParseUsdError, Usd};
