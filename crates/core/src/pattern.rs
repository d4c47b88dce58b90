use chrono::{Days, Months, NaiveDate};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::merchant::merchant_key;
use super::money::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Frequency {
    Weekly,
    Monthly,
    Quarterly,
    Annually,
}

impl Frequency {
    /// The date one canonical period after `from`.
    pub fn advance(self, from: NaiveDate) -> NaiveDate {
        let next = match self {
            Frequency::Weekly => from.checked_add_days(Days::new(7)),
            Frequency::Monthly => from.checked_add_months(Months::new(1)),
            Frequency::Quarterly => from.checked_add_months(Months::new(3)),
            Frequency::Annually => from.checked_add_months(Months::new(12)),
        };
        next.unwrap_or(NaiveDate::MAX)
    }
}

impl fmt::Display for Frequency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Frequency::Weekly => write!(f, "WEEKLY"),
            Frequency::Monthly => write!(f, "MONTHLY"),
            Frequency::Quarterly => write!(f, "QUARTERLY"),
            Frequency::Annually => write!(f, "ANNUALLY"),
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_uppercase().as_str() {
            "WEEKLY" => Ok(Frequency::Weekly),
            "MONTHLY" => Ok(Frequency::Monthly),
            "QUARTERLY" => Ok(Frequency::Quarterly),
            "ANNUALLY" => Ok(Frequency::Annually),
            other => Err(format!("Unknown frequency: '{other}'")),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecurringPattern {
    pub id: i64,
    pub user_id: i64,
    pub merchant_name: String,
    pub category: Option<String>,
    pub profile_type: Option<String>,
    pub average_amount: Money,
    pub frequency: Frequency,
    /// Number of observations folded into this pattern. Doubles as the
    /// optimistic-concurrency version for updates.
    pub detected_from: u32,
    pub last_occurrence: NaiveDate,
    pub next_expected: NaiveDate,
    pub confidence: f32,
}

impl RecurringPattern {
    pub fn from_new(id: i64, pattern: NewRecurringPattern) -> Self {
        RecurringPattern {
            id,
            user_id: pattern.user_id,
            merchant_name: pattern.merchant_name,
            category: pattern.category,
            profile_type: pattern.profile_type,
            average_amount: pattern.average_amount,
            frequency: pattern.frequency,
            detected_from: pattern.detected_from,
            last_occurrence: pattern.last_occurrence,
            next_expected: pattern.next_expected,
            confidence: pattern.confidence,
        }
    }

    pub fn merchant_key(&self) -> Option<String> {
        merchant_key(&self.merchant_name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewRecurringPattern {
    pub user_id: i64,
    pub merchant_name: String,
    pub category: Option<String>,
    pub profile_type: Option<String>,
    pub average_amount: Money,
    pub frequency: Frequency,
    pub detected_from: u32,
    pub last_occurrence: NaiveDate,
    pub next_expected: NaiveDate,
    pub confidence: f32,
}

impl NewRecurringPattern {
    pub fn merchant_key(&self) -> Option<String> {
        merchant_key(&self.merchant_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn advance_by_canonical_period() {
        let d = date(2024, 1, 31);
        assert_eq!(Frequency::Weekly.advance(d), date(2024, 2, 7));
        assert_eq!(Frequency::Monthly.advance(d), date(2024, 2, 29)); // clamps to month end
        assert_eq!(Frequency::Quarterly.advance(d), date(2024, 4, 30));
        assert_eq!(Frequency::Annually.advance(d), date(2025, 1, 31));
    }

    #[test]
    fn frequency_roundtrip() {
        for f in [
            Frequency::Weekly,
            Frequency::Monthly,
            Frequency::Quarterly,
            Frequency::Annually,
        ] {
            assert_eq!(Frequency::from_str(&f.to_string()).unwrap(), f);
        }
        assert!(Frequency::from_str("hourly").is_err());
    }
}
