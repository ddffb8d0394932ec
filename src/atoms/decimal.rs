// ── Atoms: Fixed-point monetary decimals (§4.1) ─────────────────────────
// All monetary quantities are `rust_decimal::Decimal` quantized to
// AMOUNT_SCALE fractional digits with round-half-up. Equality of amounts
// is defined only after quantization — never compare raw floats, and
// never leave an un-quantized Decimal in a persisted field.

use super::constants::AMOUNT_SCALE;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::ops::{Add, Sub};

/// A monetary amount already quantized to 4 decimal places, round-half-up.
/// Constructing one always re-quantizes, so arithmetic chains never drift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Amount(Decimal);

impl Amount {
    pub const ZERO: Amount = Amount(Decimal::ZERO);

    pub fn quantize(value: Decimal) -> Self {
        Amount(value.round_dp_with_strategy(AMOUNT_SCALE, RoundingStrategy::MidpointAwayFromZero))
    }

    pub fn from_str(s: &str) -> Result<Self, rust_decimal::Error> {
        Ok(Self::quantize(s.parse()?))
    }

    pub fn inner(self) -> Decimal {
        self.0
    }

    pub fn is_negative(self) -> bool {
        self.0.is_sign_negative() && !self.0.is_zero()
    }

    pub fn is_zero(self) -> bool {
        self.0.is_zero()
    }

    /// Proportional split of `self` in the ratio `numerator : denominator`,
    /// quantized. Used by the fee-decomposition algorithm (§4.3 step 2).
    /// Returns zero if `denominator` is zero (nothing to split against).
    pub fn proportional_share(self, numerator: Amount, denominator: Amount) -> Amount {
        if denominator.is_zero() {
            return Amount::ZERO;
        }
        Amount::quantize(self.0 * numerator.0 / denominator.0)
    }

    /// Multiply by a plain fraction (e.g. a fee percentage), quantized.
    pub fn scale_by(self, fraction: Decimal) -> Amount {
        Amount::quantize(self.0 * fraction)
    }
}

impl Default for Amount {
    fn default() -> Self {
        Amount::ZERO
    }
}

impl std::str::FromStr for Amount {
    type Err = rust_decimal::Error;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Amount::from_str(s)
    }
}

impl Add for Amount {
    type Output = Amount;
    fn add(self, rhs: Amount) -> Amount {
        Amount::quantize(self.0 + rhs.0)
    }
}

impl Sub for Amount {
    type Output = Amount;
    fn sub(self, rhs: Amount) -> Amount {
        Amount::quantize(self.0 - rhs.0)
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, Add::add)
    }
}

impl std::fmt::Display for Amount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for Amount {
    fn from(v: i64) -> Self {
        Amount::quantize(Decimal::from(v))
    }
}

/// Split of a gross amount across the three credit classes, free→reward→permanent
/// priority order (§9 Open Question, pinned normative).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClassSplit {
    pub free: Amount,
    pub reward: Amount,
    pub permanent: Amount,
}

impl ClassSplit {
    pub fn total(self) -> Amount {
        self.free + self.reward + self.permanent
    }

    /// Draw `gross` from `(free, reward, permanent)` balances in priority
    /// order free → reward → permanent, never exceeding any balance.
    /// Returns `None` if the three balances together are insufficient.
    pub fn draw_by_priority(gross: Amount, free: Amount, reward: Amount, permanent: Amount) -> Option<ClassSplit> {
        if free + reward + permanent < gross {
            return None;
        }
        let mut remaining = gross;

        let take_free = remaining.min(free);
        remaining = remaining - take_free;

        let take_reward = remaining.min(reward);
        remaining = remaining - take_reward;

        let take_permanent = remaining.min(permanent);
        remaining = remaining - take_permanent;

        debug_assert!(remaining.is_zero());

        Some(ClassSplit { free: take_free, reward: take_reward, permanent: take_permanent })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn amt(s: &str) -> Amount {
        Amount::from_str(s).unwrap()
    }

    #[test]
    fn quantizes_and_rounds_half_up() {
        let a = Amount::quantize(Decimal::from_str("1.00005").unwrap());
        assert_eq!(a, amt("1.0001"));
    }

    #[test]
    fn draw_by_priority_free_then_reward_then_permanent() {
        let split = ClassSplit::draw_by_priority(amt("4.0000"), amt("1.0000"), amt("2.0000"), amt("10.0000")).unwrap();
        assert_eq!(split.free, amt("1.0000"));
        assert_eq!(split.reward, amt("2.0000"));
        assert_eq!(split.permanent, amt("1.0000"));
    }

    #[test]
    fn draw_by_priority_insufficient_returns_none() {
        assert!(ClassSplit::draw_by_priority(amt("100.0000"), amt("1.0000"), amt("1.0000"), amt("1.0000")).is_none());
    }

    #[test]
    fn proportional_share_with_remainder_absorption_pattern() {
        // fee_platform_free = round(Gf * Fplat / G) per the decomposition algorithm.
        let share = amt("0.4000").proportional_share(amt("1.0000"), amt("4.0000"));
        assert_eq!(share, amt("0.1000"));
    }
}
