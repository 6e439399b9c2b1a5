//! # USD Amounts
//!
//! Every dollar figure in the authorization path is a [`Usd`]: an integer
//! count of cents. Floats never touch money here. The policy boundary
//! (`$1000.00` passes, `$1000.01` does not) only works if comparisons are
//! exact, and binary floating point can't promise that.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Cents per dollar. USD has two minor-unit digits and that is not changing.
pub const CENTS_PER_DOLLAR: u64 = 100;

/// Errors from parsing a decimal dollar string.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseUsdError {
    #[error("empty amount")]
    Empty,

    #[error("invalid amount: {0:?}")]
    Invalid(String),

    #[error("too many fractional digits in {0:?}: USD has 2")]
    TooPrecise(String),

    #[error("amount out of range: {0:?}")]
    Overflow(String),
}

/// An amount of US dollars, stored as whole cents.
///
/// Serializes as the raw cent count so that bincode records and JSON
/// payloads agree byte-for-byte on the value. Use [`Usd::from_str`] for
/// human input like `"1000.01"` or `"$42"`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Usd(u64);

impl Usd {
    /// Zero dollars.
    pub const ZERO: Usd = Usd(0);

    /// Construct from a cent count.
    pub const fn from_cents(cents: u64) -> Self {
        Usd(cents)
    }

    /// Construct from whole dollars. Saturates instead of wrapping.
    pub const fn from_dollars(dollars: u64) -> Self {
        Usd(dollars.saturating_mul(CENTS_PER_DOLLAR))
    }

    /// Raw cent count.
    pub const fn cents(self) -> u64 {
        self.0
    }

    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }

    pub fn checked_add(self, other: Usd) -> Option<Usd> {
        self.0.checked_add(other.0).map(Usd)
    }

    pub fn checked_sub(self, other: Usd) -> Option<Usd> {
        self.0.checked_sub(other.0).map(Usd)
    }

    pub fn saturating_add(self, other: Usd) -> Usd {
        Usd(self.0.saturating_add(other.0))
    }

    /// `self - other`, floored at zero. Used for "remaining" figures, which
    /// are never negative even if a limit was lowered below what was
    /// already spent.
    pub fn saturating_sub(self, other: Usd) -> Usd {
        Usd(self.0.saturating_sub(other.0))
    }

    /// Decimal rendering without the currency sign, e.g. `1000.01`.
    pub fn to_decimal_string(self) -> String {
        format!(
            "{}.{:02}",
            self.0 / CENTS_PER_DOLLAR,
            self.0 % CENTS_PER_DOLLAR
        )
    }
}

impl fmt::Display for Usd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${}", self.to_decimal_string())
    }
}

impl FromStr for Usd {
    type Err = ParseUsdError;

    /// Accepts `"12"`, `"12.3"`, `"12.34"`, optionally prefixed with `$`.
    /// Rejects signs, exponents, separators and a third fractional digit.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let body = trimmed.strip_prefix('$').unwrap_or(trimmed);
        if body.is_empty() {
            return Err(ParseUsdError::Empty);
        }

        let (whole, frac) = match body.split_once('.') {
            Some((w, f)) => (w, f),
            None => (body, ""),
        };

        let all_digits = |part: &str| part.bytes().all(|b| b.is_ascii_digit());
        if whole.is_empty() || !all_digits(whole) || !all_digits(frac) {
            return Err(ParseUsdError::Invalid(s.to_string()));
        }
        if frac.len() > 2 {
            return Err(ParseUsdError::TooPrecise(s.to_string()));
        }

        let dollars: u64 = whole
            .parse()
            .map_err(|_| ParseUsdError::Overflow(s.to_string()))?;
        let cents: u64 = match frac.len() {
            0 => 0,
            1 => frac.parse::<u64>().unwrap_or(0) * 10,
            _ => frac.parse::<u64>().unwrap_or(0),
        };

        dollars
            .checked_mul(CENTS_PER_DOLLAR)
            .and_then(|c| c.checked_add(cents))
            .map(Usd)
            .ok_or_else(|| ParseUsdError::Overflow(s.to_string()))
    }
}

/// Serde adapter for human-edited files: amounts as decimal strings
/// (`"500.00"`) rather than cent counts.
///
/// ```toml
/// [policy]
/// per_transaction_max = "500.00"
/// ```
pub mod decimal {
    use super::Usd;
    use serde::{de, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Usd, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_decimal_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Usd, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_fractional_amounts() {
        assert_eq!("1000".parse::<Usd>().unwrap(), Usd::from_cents(100_000));
        assert_eq!("1000.01".parse::<Usd>().unwrap(), Usd::from_cents(100_001));
        assert_eq!("0.5".parse::<Usd>().unwrap(), Usd::from_cents(50));
        assert_eq!("$150.00".parse::<Usd>().unwrap(), Usd::from_dollars(150));
        assert_eq!(" 7.25 ".parse::<Usd>().unwrap(), Usd::from_cents(725));
    }

    #[test]
    fn rejects_malformed_amounts() {
        assert_eq!("".parse::<Usd>(), Err(ParseUsdError::Empty));
        assert!(matches!("-5".parse::<Usd>(), Err(ParseUsdError::Invalid(_))));
        assert!(matches!("1e3".parse::<Usd>(), Err(ParseUsdError::Invalid(_))));
        assert!(matches!(".50".parse::<Usd>(), Err(ParseUsdError::Invalid(_))));
        assert!(matches!("1,000".parse::<Usd>(), Err(ParseUsdError::Invalid(_))));
        assert!(matches!(
            "10.001".parse::<Usd>(),
            Err(ParseUsdError::TooPrecise(_))
        ));
        assert!(matches!(
            "999999999999999999999".parse::<Usd>(),
            Err(ParseUsdError::Overflow(_))
        ));
    }

    #[test]
    fn display_always_has_two_decimals() {
        assert_eq!(Usd::from_cents(100_001).to_string(), "$1000.01");
        assert_eq!(Usd::from_dollars(500).to_string(), "$500.00");
        assert_eq!(Usd::from_cents(5).to_string(), "$0.05");
        assert_eq!(Usd::ZERO.to_string(), "$0.00");
    }

    #[test]
    fn arithmetic_is_checked() {
        let a = Usd::from_dollars(300);
        let b = Usd::from_dollars(400);
        assert_eq!(a.checked_add(b), Some(Usd::from_dollars(700)));
        assert_eq!(a.checked_sub(b), None);
        assert_eq!(a.saturating_sub(b), Usd::ZERO);
        assert_eq!(Usd::from_cents(u64::MAX).checked_add(Usd::from_cents(1)), None);
    }

    #[test]
    fn json_representation_is_cents() {
        let json = serde_json::to_string(&Usd::from_cents(15_000)).unwrap();
        assert_eq!(json, "15000");
        let back: Usd = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Usd::from_dollars(150));
    }
}
