//! Positions and trading summaries
//!
//! A position is inert data: the positioner creates it, the trader holds
//! it, and the only transition is the terminal `close`. Shorts carry the
//! collateral and borrow bookkeeping needed to unwind the margin loan.

use std::collections::HashMap;

use rust_decimal::{Decimal, MathematicalOps};
use serde::{Deserialize, Serialize};

use crate::order::Fill;
use crate::time::{Interval, Timestamp, YEAR_MS};
use crate::types::{Asset, Symbol};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CloseReason {
    Strategy,
    StopLoss,
    TakeProfit,
    TrailingStop,
    Cancelled,
}

/// Policy for candle gaps of two intervals or more.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissedCandlePolicy {
    /// Assume the stream fills gaps; do nothing.
    #[default]
    Ignore,
    /// Reconstruct the strategy and continue from the new candle.
    Restart,
    /// Replay the last candle once per missed slot.
    Last,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenLong {
    pub exchange: String,
    pub symbol: Symbol,
    pub time: Timestamp,
    pub fills: Vec<Fill>,
}

impl OpenLong {
    /// Quote spent to open.
    pub fn cost(&self) -> Decimal {
        Fill::total_quote(&self.fills)
    }

    /// Base held after opening fees.
    pub fn base_gain(&self) -> Decimal {
        Fill::total_size(&self.fills)
            - Fill::total_fee_for(&self.fills, self.symbol.base_asset())
    }

    pub fn close(self, time: Timestamp, fills: Vec<Fill>, reason: CloseReason) -> Long {
        debug_assert!(Fill::total_size(&fills) <= self.base_gain());
        Long { open: self, close_time: time, close_fills: fills, close_reason: reason }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Long {
    pub open: OpenLong,
    pub close_time: Timestamp,
    pub close_fills: Vec<Fill>,
    pub close_reason: CloseReason,
}

impl Long {
    pub fn cost(&self) -> Decimal {
        self.open.cost()
    }

    /// Quote received after closing fees.
    pub fn gain(&self) -> Decimal {
        Fill::total_quote(&self.close_fills)
            - Fill::total_fee_for(&self.close_fills, self.open.symbol.quote_asset())
    }

    pub fn profit(&self) -> Decimal {
        self.gain() - self.cost()
    }

    /// Base bought but never sold back (fees, rounding).
    pub fn dust(&self) -> Decimal {
        self.open.base_gain() - Fill::total_size(&self.close_fills)
    }

    pub fn duration(&self) -> Interval {
        self.close_time - self.open.time
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpenShort {
    pub exchange: String,
    pub symbol: Symbol,
    /// Quote posted to the margin account.
    pub collateral: Decimal,
    /// Base borrowed and sold.
    pub borrowed: Decimal,
    pub time: Timestamp,
    pub fills: Vec<Fill>,
}

impl OpenShort {
    pub fn cost(&self) -> Decimal {
        self.collateral
    }

    /// Quote gained from selling the borrowed base, after fees.
    pub fn quote_gain(&self) -> Decimal {
        Fill::total_quote(&self.fills)
            - Fill::total_fee_for(&self.fills, self.symbol.quote_asset())
    }

    pub fn close(
        self,
        interest: Decimal,
        time: Timestamp,
        fills: Vec<Fill>,
        reason: CloseReason,
    ) -> Short {
        Short {
            open: self,
            interest,
            close_time: time,
            close_fills: fills,
            close_reason: reason,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Short {
    pub open: OpenShort,
    /// Base interest accrued on the loan; bought back as part of the
    /// closing fills.
    pub interest: Decimal,
    pub close_time: Timestamp,
    pub close_fills: Vec<Fill>,
    pub close_reason: CloseReason,
}

impl Short {
    pub fn cost(&self) -> Decimal {
        self.open.collateral
    }

    /// Collateral plus the quote kept after buying back the loan (and its
    /// interest, which is part of the closing fills).
    pub fn gain(&self) -> Decimal {
        self.open.collateral + self.open.quote_gain()
            - Fill::total_quote(&self.close_fills)
    }

    pub fn profit(&self) -> Decimal {
        self.gain() - self.cost()
    }

    pub fn duration(&self) -> Interval {
        self.close_time - self.open.time
    }
}

/// A position that has been opened but not yet closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "side", rename_all = "lowercase")]
pub enum OpenPosition {
    Long(OpenLong),
    Short(OpenShort),
}

impl OpenPosition {
    pub fn symbol(&self) -> &Symbol {
        match self {
            OpenPosition::Long(p) => &p.symbol,
            OpenPosition::Short(p) => &p.symbol,
        }
    }

    pub fn exchange(&self) -> &str {
        match self {
            OpenPosition::Long(p) => &p.exchange,
            OpenPosition::Short(p) => &p.exchange,
        }
    }

    pub fn time(&self) -> Timestamp {
        match self {
            OpenPosition::Long(p) => p.time,
            OpenPosition::Short(p) => p.time,
        }
    }

    /// Quote committed to the position.
    pub fn cost(&self) -> Decimal {
        match self {
            OpenPosition::Long(p) => p.cost(),
            OpenPosition::Short(p) => p.cost(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "side", rename_all = "lowercase")]
pub enum ClosedPosition {
    Long(Long),
    Short(Short),
}

impl ClosedPosition {
    pub fn symbol(&self) -> &Symbol {
        match self {
            ClosedPosition::Long(p) => &p.open.symbol,
            ClosedPosition::Short(p) => &p.open.symbol,
        }
    }

    pub fn cost(&self) -> Decimal {
        match self {
            ClosedPosition::Long(p) => p.cost(),
            ClosedPosition::Short(p) => p.cost(),
        }
    }

    /// Quote recovered when the position closed.
    pub fn gain(&self) -> Decimal {
        match self {
            ClosedPosition::Long(p) => p.gain(),
            ClosedPosition::Short(p) => p.gain(),
        }
    }

    pub fn profit(&self) -> Decimal {
        match self {
            ClosedPosition::Long(p) => p.profit(),
            ClosedPosition::Short(p) => p.profit(),
        }
    }

    pub fn close_reason(&self) -> CloseReason {
        match self {
            ClosedPosition::Long(p) => p.close_reason,
            ClosedPosition::Short(p) => p.close_reason,
        }
    }

    pub fn open_time(&self) -> Timestamp {
        match self {
            ClosedPosition::Long(p) => p.open.time,
            ClosedPosition::Short(p) => p.open.time,
        }
    }

    pub fn close_time(&self) -> Timestamp {
        match self {
            ClosedPosition::Long(p) => p.close_time,
            ClosedPosition::Short(p) => p.close_time,
        }
    }

    pub fn duration(&self) -> Interval {
        self.close_time() - self.open_time()
    }

    pub fn roi(&self) -> Decimal {
        let cost = self.cost();
        if cost == Decimal::ZERO {
            return Decimal::ZERO;
        }
        self.profit() / cost
    }

    /// Annualized return; effectively infinite for zero-duration trades.
    pub fn annualized_roi(&self) -> Decimal {
        let duration = self.duration();
        if duration == 0 {
            return Decimal::MAX;
        }
        let per_year = Decimal::from(YEAR_MS) / Decimal::from(duration);
        match (Decimal::ONE + self.roi()).checked_powd(per_year) {
            Some(value) => value - Decimal::ONE,
            None => Decimal::MAX,
        }
    }
}

/// Result of a trader run.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TradingSummary {
    pub start: Timestamp,
    pub end: Timestamp,
    pub starting_assets: HashMap<Asset, Decimal>,
    pub positions: Vec<ClosedPosition>,
}

impl TradingSummary {
    pub fn profit(&self) -> Decimal {
        self.positions.iter().map(|p| p.profit()).sum()
    }

    pub fn num_positions(&self) -> usize {
        self.positions.len()
    }

    pub fn num_long(&self) -> usize {
        self.positions.iter().filter(|p| matches!(p, ClosedPosition::Long(_))).count()
    }

    pub fn num_short(&self) -> usize {
        self.positions.iter().filter(|p| matches!(p, ClosedPosition::Short(_))).count()
    }

    pub fn num_with_reason(&self, reason: CloseReason) -> usize {
        self.positions.iter().filter(|p| p.close_reason() == reason).count()
    }

    pub fn num_in_profit(&self) -> usize {
        self.positions.iter().filter(|p| p.profit() >= Decimal::ZERO).count()
    }

    pub fn num_in_loss(&self) -> usize {
        self.positions.iter().filter(|p| p.profit() < Decimal::ZERO).count()
    }

    /// Largest peak-to-trough equity loss, running-peak method.
    pub fn max_drawdown(&self) -> Decimal {
        let mut quote: Decimal = self.starting_assets.values().copied().sum();
        let mut peak = quote;
        let mut max_drawdown = Decimal::ZERO;
        for position in &self.positions {
            quote += position.profit();
            peak = peak.max(quote);
            if peak > Decimal::ZERO {
                max_drawdown = max_drawdown.max(Decimal::ONE - quote / peak);
            }
        }
        max_drawdown
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn fill(price: Decimal, size: Decimal, fee: Decimal, fee_asset: &str) -> Fill {
        Fill { price, size, quote: price * size, fee, fee_asset: fee_asset.into() }
    }

    fn long(open_quote: Decimal, close_quote: Decimal) -> ClosedPosition {
        let open = OpenLong {
            exchange: "fake".into(),
            symbol: Symbol::new("eth-btc"),
            time: 0,
            fills: vec![fill(open_quote, dec!(1.0), Decimal::ZERO, "eth")],
        };
        ClosedPosition::Long(open.close(
            crate::time::HOUR_MS,
            vec![fill(close_quote, dec!(1.0), Decimal::ZERO, "btc")],
            CloseReason::Strategy,
        ))
    }

    #[test]
    fn test_long_profit() {
        let open = OpenLong {
            exchange: "fake".into(),
            symbol: Symbol::new("eth-btc"),
            time: 0,
            fills: vec![fill(dec!(2.0), dec!(1.0), dec!(0.01), "eth")],
        };
        assert_eq!(open.cost(), dec!(2.0));
        assert_eq!(open.base_gain(), dec!(0.99));

        let closed = open.close(
            3_600_000,
            vec![fill(dec!(4.0), dec!(0.99), dec!(0.0396), "btc")],
            CloseReason::Strategy,
        );
        // gain = 3.96 - 0.0396, cost = 2.0
        assert_eq!(closed.gain(), dec!(3.9204));
        assert_eq!(closed.profit(), dec!(1.9204));
        assert_eq!(closed.dust(), Decimal::ZERO);
    }

    #[test]
    fn test_short_profit() {
        let open = OpenShort {
            exchange: "fake".into(),
            symbol: Symbol::new("eth-btc"),
            collateral: dec!(10.0),
            borrowed: dec!(1.0),
            time: 0,
            fills: vec![fill(dec!(10.0), dec!(1.0), dec!(0.01), "btc")],
        };
        assert_eq!(open.quote_gain(), dec!(9.99));

        // Buy back 1.03 base at 8.0 (covers borrow + interest + fee).
        let closed = open.close(
            dec!(0.02),
            7_200_000,
            vec![fill(dec!(8.0), dec!(1.03), dec!(0.01), "eth")],
            CloseReason::Strategy,
        );
        // gain = 10 + 9.99 - 8.24 = 11.75; profit = 1.75
        assert_eq!(closed.gain(), dec!(11.75));
        assert_eq!(closed.profit(), dec!(1.75));
    }

    #[test]
    fn test_max_drawdown_running_peak() {
        let summary = TradingSummary {
            start: 0,
            end: 10,
            starting_assets: HashMap::from([("btc".to_owned(), dec!(10.0))]),
            positions: vec![
                long(dec!(1.0), dec!(3.0)),  // equity 12
                long(dec!(1.0), dec!(0.4)),  // equity 11.4
                long(dec!(1.0), dec!(0.4)),  // equity 10.8 -> drawdown 1.2/12
                long(dec!(1.0), dec!(5.0)),  // equity 14.8
            ],
        };
        assert_eq!(summary.max_drawdown(), dec!(0.1));
        assert_eq!(summary.num_positions(), 4);
        assert_eq!(summary.num_in_loss(), 2);
    }

    #[test]
    fn test_annualized_roi_zero_duration() {
        let open = OpenLong {
            exchange: "fake".into(),
            symbol: Symbol::new("eth-btc"),
            time: 5,
            fills: vec![fill(dec!(1.0), dec!(1.0), Decimal::ZERO, "eth")],
        };
        let closed = ClosedPosition::Long(open.close(5, vec![], CloseReason::Cancelled));
        assert_eq!(closed.annualized_roi(), Decimal::MAX);
    }
}
