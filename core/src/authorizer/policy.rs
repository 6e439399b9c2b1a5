//! Spending policy evaluation.
//!
//! Pure functions over numbers the authorizer has already gathered. The
//! checks run in a fixed order and stop at the first failure, so a
//! rejection always names the *first* rule that was broken and carries
//! the details of every check that ran up to that point.

use chrono::{DateTime, Datelike, Utc};

use crate::config::SUPPORTED_CURRENCY;
use crate::model::{
    AuthorizationRequest, BudgetCheck, DailyLimitCheck, DuplicateCheck, PerTransactionCheck,
    PolicyChecks, RejectionReason, SpendingPolicy, Usd, WeeklyLimitCheck,
};

/// A failed evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Rejection {
    pub reason: RejectionReason,
    pub message: String,
    pub checks: PolicyChecks,
}

/// Spend already counted against the current windows, committed plus
/// reserved by in-flight authorizations.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct WindowSpend {
    pub today: Usd,
    pub this_week: Usd,
}

/// Storage key of the daily accumulator: `daily:YYYY-MM-DD` (UTC).
pub(crate) fn day_key(now: DateTime<Utc>) -> String {
    format!("daily:{}", day_label(now))
}

/// Storage key of the weekly accumulator: `weekly:YYYY-Www` (UTC ISO week).
pub(crate) fn week_key(now: DateTime<Utc>) -> String {
    format!("weekly:{}", week_label(now))
}

pub(crate) fn day_label(now: DateTime<Utc>) -> String {
    now.format("%Y-%m-%d").to_string()
}

pub(crate) fn week_label(now: DateTime<Utc>) -> String {
    let week = now.iso_week();
    format!("{}-W{:02}", week.year(), week.week())
}

/// Shape checks that run before any policy rule.
pub(crate) fn validate_request(request: &AuthorizationRequest) -> Result<(), String> {
    let invoice = &request.invoice;
    if request.request_id.trim().is_empty() {
        return Err("request_id must not be empty".into());
    }
    if invoice.invoice_id.trim().is_empty() {
        return Err("invoice_id must not be empty".into());
    }
    if invoice.amount.is_zero() {
        return Err("invoice amount must be greater than zero".into());
    }
    if invoice.currency != SUPPORTED_CURRENCY {
        return Err(format!(
            "unsupported currency {}, only {SUPPORTED_CURRENCY} is accepted",
            invoice.currency
        ));
    }
    Ok(())
}

/// Run the policy checks in order. `is_duplicate` is only consulted when
/// every earlier check passed; its error (a storage failure) propagates.
pub(crate) fn evaluate<E>(
    policy: &SpendingPolicy,
    request: &AuthorizationRequest,
    spent: WindowSpend,
    is_duplicate: impl FnOnce() -> Result<bool, E>,
) -> Result<Result<PolicyChecks, Rejection>, E> {
    let amount = request.invoice.amount;
    let mut checks = PolicyChecks::default();

    // 1. Per-transaction maximum.
    let passed = amount <= policy.per_transaction_max;
    checks.per_transaction = Some(PerTransactionCheck {
        limit: policy.per_transaction_max,
        amount,
        passed,
    });
    if !passed {
        let message = format!(
            "Amount {amount} exceeds per-transaction limit {}",
            policy.per_transaction_max
        );
        return Ok(Err(reject(RejectionReason::PerTransactionLimit, message, checks)));
    }

    // 2. Daily limit, inclusive.
    let new_total = spent.today.saturating_add(amount);
    let passed = new_total <= policy.daily_limit;
    checks.daily_limit = Some(DailyLimitCheck {
        limit: policy.daily_limit,
        spent_today: spent.today,
        new_total,
        passed,
    });
    if !passed {
        let message = format!("Would exceed daily limit: {new_total} > {}", policy.daily_limit);
        return Ok(Err(reject(RejectionReason::DailyLimit, message, checks)));
    }

    // 3. Weekly limit, inclusive.
    let new_total = spent.this_week.saturating_add(amount);
    let passed = new_total <= policy.weekly_limit;
    checks.weekly_limit = Some(WeeklyLimitCheck {
        limit: policy.weekly_limit,
        spent_this_week: spent.this_week,
        new_total,
        passed,
    });
    if !passed {
        let message = format!("Would exceed weekly limit: {new_total} > {}", policy.weekly_limit);
        return Ok(Err(reject(RejectionReason::WeeklyLimit, message, checks)));
    }

    // 4. Caller's remaining budget.
    let passed = amount <= request.budget_remaining;
    checks.budget = Some(BudgetCheck {
        total_budget: request.budget_total,
        remaining: request.budget_remaining,
        amount,
        passed,
    });
    if !passed {
        let message = format!(
            "Amount {amount} exceeds remaining budget {}",
            request.budget_remaining
        );
        return Ok(Err(reject(RejectionReason::BudgetExceeded, message, checks)));
    }

    // 5. Duplicate detection.
    let invoice_id = request.invoice.invoice_id.clone();
    let passed = !is_duplicate()?;
    checks.duplicate = Some(DuplicateCheck {
        invoice_id: invoice_id.clone(),
        passed,
    });
    if !passed {
        let message = format!("Duplicate authorization for invoice {invoice_id}");
        return Ok(Err(reject(RejectionReason::Duplicate, message, checks)));
    }

    Ok(Ok(checks))
}

fn reject(reason: RejectionReason, message: String, checks: PolicyChecks) -> Rejection {
    Rejection {
        reason,
        message,
        checks,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Invoice;
    use chrono::TimeZone;
    use std::convert::Infallible;

    fn policy() -> SpendingPolicy {
        SpendingPolicy {
            per_transaction_max: Usd::from_dollars(500),
            daily_limit: Usd::from_dollars(1000),
            weekly_limit: Usd::from_dollars(3000),
        }
    }

    fn request(cents: u64, remaining_dollars: u64) -> AuthorizationRequest {
        AuthorizationRequest::new(
            Invoice::new("INV-1", "Acme Supplies", Usd::from_cents(cents)),
            Usd::from_dollars(5000),
            Usd::from_dollars(remaining_dollars),
        )
    }

    fn run(req: &AuthorizationRequest, spent: WindowSpend, dup: bool) -> Result<PolicyChecks, Rejection> {
        evaluate::<Infallible>(&policy(), req, spent, || Ok(dup)).unwrap()
    }

    #[test]
    fn all_checks_pass() {
        let checks = run(&request(30_000, 5000), WindowSpend::default(), false).unwrap();
        assert!(checks.all_passed());
        assert!(checks.duplicate.is_some());
    }

    #[test]
    fn per_transaction_short_circuits() {
        let rejection = run(&request(60_000, 5000), WindowSpend::default(), false).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::PerTransactionLimit);
        assert_eq!(
            rejection.message,
            "Amount $600.00 exceeds per-transaction limit $500.00"
        );
        assert!(rejection.checks.daily_limit.is_none());
        assert!(rejection.checks.duplicate.is_none());
    }

    #[test]
    fn daily_limit_is_inclusive() {
        let spent = WindowSpend {
            today: Usd::from_dollars(700),
            this_week: Usd::from_dollars(700),
        };
        assert!(run(&request(30_000, 5000), spent, false).is_ok());

        let rejection = run(&request(30_001, 5000), spent, false).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::DailyLimit);
        assert_eq!(rejection.message, "Would exceed daily limit: $1000.01 > $1000.00");
        let daily = rejection.checks.daily_limit.unwrap();
        assert_eq!(daily.spent_today, Usd::from_dollars(700));
        assert!(!daily.passed);
        assert!(rejection.checks.per_transaction.unwrap().passed);
    }

    #[test]
    fn weekly_limit_checked_after_daily() {
        let spent = WindowSpend {
            today: Usd::ZERO,
            this_week: Usd::from_dollars(2900),
        };
        let rejection = run(&request(20_000, 5000), spent, false).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::WeeklyLimit);
        assert!(rejection.checks.daily_limit.unwrap().passed);
        assert!(rejection.checks.budget.is_none());
    }

    #[test]
    fn budget_remaining_enforced() {
        let rejection = run(&request(20_000, 150), WindowSpend::default(), false).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::BudgetExceeded);
        assert_eq!(rejection.message, "Amount $200.00 exceeds remaining budget $150.00");
    }

    #[test]
    fn duplicate_runs_last_and_only_when_needed() {
        let rejection = run(&request(10_000, 5000), WindowSpend::default(), true).unwrap_err();
        assert_eq!(rejection.reason, RejectionReason::Duplicate);
        assert_eq!(rejection.message, "Duplicate authorization for invoice INV-1");

        let mut consulted = false;
        let _ = evaluate::<Infallible>(&policy(), &request(60_000, 5000), WindowSpend::default(), || {
            consulted = true;
            Ok(false)
        });
        assert!(!consulted);
    }

    #[test]
    fn duplicate_lookup_errors_propagate() {
        let out = evaluate(&policy(), &request(100, 5000), WindowSpend::default(), || {
            Err("disk gone")
        });
        assert_eq!(out.unwrap_err(), "disk gone");
    }

    #[test]
    fn window_keys() {
        let now = Utc.with_ymd_and_hms(2026, 1, 1, 12, 0, 0).unwrap();
        assert_eq!(day_key(now), "daily:2026-01-01");
        // 2026-01-01 is a Thursday, so it belongs to ISO week 1 of 2026.
        assert_eq!(week_key(now), "weekly:2026-W01");
        let sunday = Utc.with_ymd_and_hms(2027, 1, 3, 23, 59, 59).unwrap();
        assert_eq!(week_key(sunday), "weekly:2026-W53");
    }

    #[test]
    fn request_validation() {
        assert!(validate_request(&request(100, 10)).is_ok());
        assert!(validate_request(&request(0, 10)).is_err());

        let mut bad = request(100, 10);
        bad.invoice.invoice_id = "  ".into();
        assert!(validate_request(&bad).is_err());

        let mut eur = request(100, 10);
        eur.invoice.currency = "EUR".into();
        assert!(validate_request(&eur).unwrap_err().contains("EUR"));
    }
}
