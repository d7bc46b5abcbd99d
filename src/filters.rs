//! Per-symbol trade constraints enforced by venues
//!
//! Modeled after the exchange filter sets most venues publish: price band
//! and tick, size band and step, and minimum notional value.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::math::{round_half_up, round_up};

/// Quantizes `value` down to a multiple of `step` (no-op for zero step).
fn quantize_down(value: Decimal, step: Decimal) -> Decimal {
    if step == Decimal::ZERO {
        return value;
    }
    value - value % step
}

fn quantize_up(value: Decimal, step: Decimal) -> Decimal {
    if step == Decimal::ZERO {
        return value;
    }
    let remainder = value % step;
    if remainder == Decimal::ZERO {
        value
    } else {
        value - remainder + step
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Price {
    pub min: Decimal,
    pub max: Decimal,
    pub step: Decimal,
}

impl Price {
    /// Rounds a price down to the tick; zero when below the allowed minimum.
    pub fn round_down(&self, price: Decimal) -> Decimal {
        if price < self.min {
            return Decimal::ZERO;
        }
        let price = if self.max > Decimal::ZERO { price.min(self.max) } else { price };
        quantize_down(price, self.step)
    }

    pub fn valid(&self, price: Decimal) -> bool {
        price >= self.min
            && (self.max == Decimal::ZERO || price <= self.max)
            && (self.step == Decimal::ZERO || price % self.step == Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Size {
    pub min: Decimal,
    pub max: Decimal,
    pub step: Decimal,
}

impl Size {
    pub fn round_down(&self, size: Decimal) -> Decimal {
        if size < self.min {
            return Decimal::ZERO;
        }
        let size = if self.max > Decimal::ZERO { size.min(self.max) } else { size };
        quantize_down(size, self.step)
    }

    pub fn round_up(&self, size: Decimal) -> Decimal {
        if self.max > Decimal::ZERO && size > self.max {
            return quantize_down(self.max, self.step);
        }
        quantize_up(size, self.step)
    }

    pub fn valid(&self, size: Decimal) -> bool {
        size >= self.min
            && (self.max == Decimal::ZERO || size <= self.max)
            && (self.step == Decimal::ZERO || size % self.step == Decimal::ZERO)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct MinNotional {
    pub min_notional: Decimal,
}

impl MinNotional {
    pub fn valid(&self, price: Decimal, size: Decimal) -> bool {
        price * size >= self.min_notional
    }

    /// Smallest size passing the notional check at the given price.
    pub fn min_size_for_price(&self, price: Decimal, size: &Size) -> Decimal {
        if price == Decimal::ZERO {
            return Decimal::ZERO;
        }
        size.round_up(self.min_notional / price)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Filters {
    pub price: Price,
    pub size: Size,
    pub min_notional: MinNotional,
    pub base_precision: u32,
    pub quote_precision: u32,
    pub spot: bool,
    pub cross_margin: bool,
    pub isolated_margin: bool,
}

impl Default for Filters {
    fn default() -> Self {
        Filters {
            price: Price::default(),
            size: Size::default(),
            min_notional: MinNotional::default(),
            base_precision: 8,
            quote_precision: 8,
            spot: true,
            cross_margin: false,
            isolated_margin: false,
        }
    }
}

impl Filters {
    /// Grows `size` so the amount left after deducting the taker fee still
    /// covers the original request.
    pub fn with_fee(&self, size: Decimal, fee_rate: Decimal) -> Decimal {
        let fee = round_half_up(size * fee_rate, self.base_precision);
        self.size.round_up(size + round_up(fee / (Decimal::ONE - fee_rate), self.base_precision))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn size_filter() -> Size {
        Size { min: dec!(0.2), max: dec!(10.0), step: dec!(0.1) }
    }

    #[test]
    fn test_size_round_down() {
        let size = size_filter();
        assert_eq!(size.round_down(dec!(0.05)), Decimal::ZERO);
        assert_eq!(size.round_down(dec!(0.25)), dec!(0.2));
        assert_eq!(size.round_down(dec!(11.0)), dec!(10.0));
    }

    #[test]
    fn test_size_round_up() {
        let size = size_filter();
        assert_eq!(size.round_up(dec!(0.26)), dec!(0.3));
        assert_eq!(size.round_up(dec!(0.3)), dec!(0.3));
    }

    #[test]
    fn test_price_round_down() {
        let price = Price { min: dec!(0.2), max: dec!(10.0), step: dec!(0.1) };
        assert_eq!(price.round_down(dec!(0.1)), Decimal::ZERO);
        assert_eq!(price.round_down(dec!(1.25)), dec!(1.2));
    }

    #[test]
    fn test_min_notional() {
        let min_notional = MinNotional { min_notional: dec!(10.0) };
        assert!(min_notional.valid(dec!(2.0), dec!(5.0)));
        assert!(!min_notional.valid(dec!(2.0), dec!(4.9)));
        assert_eq!(
            min_notional.min_size_for_price(dec!(3.0), &size_filter()),
            dec!(3.4),
        );
    }

    #[test]
    fn test_with_fee_covers_deduction() {
        let filters = Filters {
            size: Size { min: dec!(0.0001), max: dec!(1000.0), step: dec!(0.0001) },
            ..Default::default()
        };
        let fee_rate = dec!(0.001);
        let grown = filters.with_fee(dec!(1.0), fee_rate);
        let received = grown - round_half_up(grown * fee_rate, filters.base_precision);
        assert!(received >= dec!(1.0));
    }
}
