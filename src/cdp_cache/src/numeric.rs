use crate::CdpError;
use num_traits::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use std::fmt;

/// Collateral ratio: staked value over owed value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Ratio(pub Decimal);

impl Ratio {
    /// Ratio of anything that owes nothing. Sorts after every finite ratio.
    pub const INFINITE: Ratio = Ratio(Decimal::MAX);

    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    /// `staked / owed` in base units, [`Ratio::INFINITE`] when `owed == 0`.
    pub fn of(staked: u64, owed: u64) -> Self {
        if owed == 0 {
            return Self::INFINITE;
        }
        Decimal::from(staked)
            .checked_div(Decimal::from(owed))
            .map(Self)
            .unwrap_or(Self::INFINITE)
    }

    /// `staked * price / owed` over chain-wide totals, saturating to
    /// [`Ratio::INFINITE`]. Totals are `u128` since a sum of `u64` positions
    /// can exceed `u64::MAX`.
    pub fn of_priced(staked: u128, owed: u128, price: Price) -> Result<Self, CdpError> {
        price.check()?;
        if owed == 0 {
            return Ok(Self::INFINITE);
        }
        let Some(staked) = Decimal::from_u128(staked) else {
            return Ok(Self::INFINITE);
        };
        let Some(owed) = Decimal::from_u128(owed) else {
            return Ok(Self(Decimal::ZERO));
        };
        Ok(staked
            .checked_mul(price.0)
            .and_then(|value| value.checked_div(owed))
            .map(Self)
            .unwrap_or(Self::INFINITE))
    }

    /// Converts a price-relative threshold into the equivalent base ratio:
    /// `base * price <= self` holds exactly when `base <= self.at_price(price)`.
    pub fn at_price(self, price: Price) -> Result<Self, CdpError> {
        price.check()?;
        if self.is_infinite() {
            return Ok(Self::INFINITE);
        }
        Ok(self
            .0
            .checked_div(price.0)
            .map(Self)
            .unwrap_or(Self::INFINITE))
    }

    pub fn is_infinite(&self) -> bool {
        *self == Self::INFINITE
    }

    pub fn to_f64(&self) -> f64 {
        self.0.to_f64().unwrap_or(f64::MAX)
    }
}

impl From<Decimal> for Ratio {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_infinite() {
            write!(f, "inf")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

/// Median price of one base-coin unit in stable-coin units.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Price(pub Decimal);

impl Price {
    pub const ONE: Price = Price(Decimal::ONE);

    pub const fn new(value: Decimal) -> Self {
        Self(value)
    }

    fn check(&self) -> Result<(), CdpError> {
        if self.0 <= Decimal::ZERO {
            return Err(CdpError::InvalidPrice(self.0.to_string()));
        }
        Ok(())
    }
}

impl From<Decimal> for Price {
    fn from(value: Decimal) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn zero_debt_is_infinite_and_sorts_last() {
        let safe = Ratio::of(1, 0);
        assert!(safe.is_infinite());
        assert!(Ratio::of(u64::MAX, 1) < safe);
        assert_eq!(safe.to_string(), "inf");
    }

    #[test]
    fn price_adjusted_bound() {
        let bound = Ratio::new(dec!(1.5)).at_price(Price::new(dec!(0.5))).unwrap();
        assert_eq!(bound, Ratio::new(dec!(3)));
        assert_eq!(
            Ratio::of_priced(300, 100, Price::new(dec!(0.5))).unwrap(),
            Ratio::new(dec!(1.5))
        );
    }

    #[test]
    fn rejects_non_positive_price() {
        assert!(matches!(
            Ratio::new(dec!(1)).at_price(Price::new(Decimal::ZERO)),
            Err(CdpError::InvalidPrice(_))
        ));
        assert!(Ratio::of_priced(1, 1, Price::new(dec!(-1))).is_err());
    }

    #[test]
    fn priced_ratio_accepts_totals_past_u64() {
        let total = u128::from(u64::MAX) + 1;
        assert_eq!(
            Ratio::of_priced(total * 2, total, Price::ONE).unwrap(),
            Ratio::new(dec!(2))
        );
        assert!(Ratio::of_priced(u128::MAX, 1, Price::ONE).unwrap().is_infinite());
    }
}
