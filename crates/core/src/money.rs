use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Add, Sub};
use std::str::FromStr;

/// Signed currency amount, always held at two decimal places.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Money(Decimal);

impl Money {
    pub fn from_cents(cents: i64) -> Self {
        Money(Decimal::new(cents, 2))
    }

    pub fn to_cents(self) -> i64 {
        (self.0 * Decimal::ONE_HUNDRED)
            .round()
            .to_i64()
            .unwrap_or_default()
    }

    pub fn from_decimal(decimal: Decimal) -> Self {
        Money(decimal.round_dp(2))
    }

    pub fn as_decimal(self) -> Decimal {
        self.0
    }

    pub fn zero() -> Self {
        Money(Decimal::ZERO)
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    pub fn abs(self) -> Self {
        Money(self.0.abs())
    }

    /// `|self - other| / max(|self|, |other|)`; `0.0` when both are zero.
    pub fn relative_difference(self, other: Money) -> f64 {
        let larger = self.0.abs().max(other.0.abs());
        if larger.is_zero() {
            return 0.0;
        }
        ((self.0 - other.0).abs() / larger)
            .to_f64()
            .unwrap_or(f64::MAX)
    }

    /// Folds `next` into a mean that currently covers `count` observations.
    pub fn running_mean(self, count: u32, next: Money) -> Money {
        let n = Decimal::from(count);
        Money::from_decimal((self.0 * n + next.0) / (n + Decimal::ONE))
    }

    pub fn mean(values: &[Money]) -> Option<Money> {
        if values.is_empty() {
            return None;
        }
        let total: Decimal = values.iter().map(|m| m.0).sum();
        Some(Money::from_decimal(total / Decimal::from(values.len())))
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "${:.2}", self.0)
    }
}

impl FromStr for Money {
    type Err = rust_decimal::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Decimal::from_str(s.trim()).map(Money::from_decimal)
    }
}

impl Add for Money {
    type Output = Self;
    fn add(self, rhs: Self) -> Self {
        Money(self.0 + rhs.0)
    }
}

impl Sub for Money {
    type Output = Self;
    fn sub(self, rhs: Self) -> Self {
        Money(self.0 - rhs.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn m(s: &str) -> Money {
        s.parse().unwrap()
    }

    #[test]
    fn cents_roundtrip_keeps_sign() {
        assert_eq!(Money::from_cents(-5050).to_cents(), -5050);
        assert_eq!(m("-50.50"), Money::from_cents(-5050));
    }

    #[test]
    fn relative_difference_uses_larger_magnitude() {
        let diff = m("100.00").relative_difference(m("99.00"));
        assert!((diff - 0.01).abs() < 1e-9, "diff was {diff}");
        assert_eq!(Money::zero().relative_difference(Money::zero()), 0.0);
    }

    #[test]
    fn opposite_signs_are_far_apart() {
        assert!(m("10.00").relative_difference(m("-10.00")) > 1.0);
    }

    #[test]
    fn running_mean_matches_batch_mean() {
        let first = m("10.00");
        let avg = first.running_mean(1, m("20.00")).running_mean(2, m("30.00"));
        assert_eq!(avg, m("20.00"));
        assert_eq!(Money::mean(&[m("10.00"), m("20.00"), m("30.00")]), Some(avg));
    }

    #[test]
    fn mean_of_nothing_is_none() {
        assert_eq!(Money::mean(&[]), None);
    }

    #[test]
    fn display_two_places() {
        assert_eq!(Money::from_cents(5000).to_string(), "$50.00");
    }
}
