//! Decimal and integer math helpers shared across the engine
//!
//! All monetary rounding goes through these so the rounding mode is uniform:
//! sizes and quotes round down, fees round half-up.

use rust_decimal::{Decimal, MathematicalOps, RoundingStrategy};

/// Rounds down (toward zero) to `precision` fractional digits.
pub fn round_down(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::ToZero)
}

/// Rounds up (away from zero) to `precision` fractional digits.
pub fn round_up(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::AwayFromZero)
}

/// Rounds half-up to `precision` fractional digits.
pub fn round_half_up(value: Decimal, precision: u32) -> Decimal {
    value.round_dp_with_strategy(precision, RoundingStrategy::MidpointAwayFromZero)
}

pub fn ceil_multiple(value: u64, multiple: u64) -> u64 {
    value.div_ceil(multiple) * multiple
}

pub fn floor_multiple(value: u64, multiple: u64) -> u64 {
    value - value % multiple
}

pub fn ceil_multiple_offset(value: u64, multiple: u64, offset: u64) -> u64 {
    ceil_multiple(value + offset, multiple) - offset
}

pub fn floor_multiple_offset(value: u64, multiple: u64, offset: u64) -> u64 {
    floor_multiple(value + offset, multiple) - offset
}

/// Splits `total` into `parts` chunks rounded to `precision`; the remainder
/// left over from rounding is folded into the first chunk.
pub fn split(total: Decimal, parts: usize, precision: u32) -> Vec<Decimal> {
    assert!(parts > 0);
    let part = round_down(total / Decimal::from(parts as u64), precision);
    let mut result = vec![part; parts];
    result[0] += total - part * Decimal::from(parts as u64);
    result
}

/// Relative population standard deviation (stdev / mean) of the values.
pub fn rpstdev(values: &[Decimal]) -> Decimal {
    if values.is_empty() {
        return Decimal::ZERO;
    }
    let count = Decimal::from(values.len() as u64);
    let mean = values.iter().sum::<Decimal>() / count;
    if mean == Decimal::ZERO {
        return Decimal::ZERO;
    }
    let variance = values
        .iter()
        .map(|v| (*v - mean) * (*v - mean))
        .sum::<Decimal>()
        / count;
    variance.sqrt().unwrap_or(Decimal::ZERO) / mean
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_rounding() {
        assert_eq!(round_down(dec!(0.004943799), 8), dec!(0.00494379));
        assert_eq!(round_half_up(dec!(0.044), 2), dec!(0.04));
        assert_eq!(round_half_up(dec!(0.045), 2), dec!(0.05));
        assert_eq!(round_up(dec!(0.0041), 2), dec!(0.01));
    }

    #[test]
    fn test_multiples() {
        assert_eq!(ceil_multiple(5, 2), 6);
        assert_eq!(ceil_multiple(4, 2), 4);
        assert_eq!(floor_multiple(5, 2), 4);
        assert_eq!(floor_multiple_offset(10, 7, 4), 10);
        assert_eq!(ceil_multiple_offset(11, 7, 4), 17);
    }

    #[test]
    fn test_split_preserves_total() {
        let parts = split(dec!(1.01), 3, 2);
        assert_eq!(parts.len(), 3);
        assert_eq!(parts.iter().sum::<Decimal>(), dec!(1.01));
        assert_eq!(parts[1], parts[2]);
    }

    #[test]
    fn test_rpstdev() {
        assert_eq!(rpstdev(&[dec!(1), dec!(1), dec!(1)]), Decimal::ZERO);
        let value = rpstdev(&[dec!(1), dec!(2)]);
        // stdev 0.5, mean 1.5.
        assert!((value - dec!(0.3333333333)).abs() < dec!(0.0001));
    }
}
